use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 設定エラー（デプロイ/ビルドの不整合）
///
/// このカテゴリは fail-fast：リトライしても直らないので、呼び出し側は
/// 即座に失敗させる。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no host found for particle '{0}' and no default host is registered")]
    NoHostForParticle(String),

    #[error(
        "storage key '{key}' is already being used for a {existing} proxy, \
         it cannot be reused for a {requested} proxy"
    )]
    StorageKeyShapeConflict {
        key: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("reference-mode storage keys are not supported for reference-typed handles: {0}")]
    ReferenceModeReference(String),

    #[error("unresolved create-fate storage key '{0}' reached a host; allocator must resolve it")]
    UnresolvedStorageKey(String),

    #[error("no particle implementation registered for location '{0}'")]
    UnknownParticle(String),

    #[error("handle connection references handle '{0}' which is not declared in the plan")]
    UnknownHandle(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Handle 操作のエラー
#[derive(Debug, Error)]
pub enum HandleError {
    /// mode が許可しない操作（write-only handle への read など）
    #[error("operation not permitted on a {mode} handle '{handle}'")]
    NotPermitted { handle: String, mode: &'static str },

    #[error("read operations are not valid before onReady (storage proxy state is {0})")]
    NotReady(&'static str),

    #[error("unexpected operation on closed storage proxy")]
    ProxyClosed,

    #[error("crdt operation could not be applied locally")]
    OpRejected,
}

/// ストレージ層のエラー
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store for key '{0}' has shut down")]
    StoreClosed(String),

    #[error("storage key parse error: {0}")]
    BadKey(String),
}

/// Particle のライフサイクルフックが失敗したときの記録。
///
/// ホストには伝播しない（状態機械が Failed/FailedNeverStarted に変換して
/// 失敗カウンタに積む）。診断用に hook 名とメッセージだけ持つ。
#[derive(Debug, Clone, Error)]
#[error("failure in particle hook {hook}(): {message}")]
pub struct ParticleFailure {
    pub hook: &'static str,
    pub message: String,
}

impl ParticleFailure {
    pub fn new(hook: &'static str, message: impl Into<String>) -> Self {
        Self {
            hook,
            message: message.into(),
        }
    }
}

/// ArcHost 境界を越えるエラー。
///
/// ホストは別プロセスかもしれないので、元の例外型は持ち出せない。
/// message + flatten した stack trace 文字列だけをシリアライズ可能な形で運ぶ。
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ArcHostError {
    pub message: String,
    pub stack_trace: String,
}

impl ArcHostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: String::new(),
        }
    }

    pub fn with_trace(message: impl Into<String>, stack_trace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: stack_trace.into(),
        }
    }
}

impl From<ConfigError> for ArcHostError {
    fn from(e: ConfigError) -> Self {
        ArcHostError::new(e.to_string())
    }
}

/// ArcHostContext の永続化・復元のエラー
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("unable to deserialize arc '{arc_id}' for host '{host_id}': {detail}")]
    Corrupt {
        arc_id: String,
        host_id: String,
        detail: String,
    },

    #[error(
        "handle connection '{connection}' references particle '{particle}' \
         which is absent from the particles collection (arc '{arc_id}')"
    )]
    DanglingConnection {
        arc_id: String,
        particle: String,
        connection: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}
