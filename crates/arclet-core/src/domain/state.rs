//! State - Arc と Particle の状態
//!
//! # cause を無視する等価性
//! `Error` / `Failed` 系の状態は診断用の cause を持てるが、状態の
//! アイデンティティには含めない。`PartialEq` / `Hash` は kind のみを見る。
//! （事前確保したシングルトンインスタンスの参照同一性には頼らない。）
//!
//! # 永続化境界
//! 永続化の際は `format()` で文字列化し、読み戻しは `parse()` で行う。
//! cause は `|` 区切りのサフィックスとして残るが、ラウンドトリップで
//! 保証されるのは kind のみ。

use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown {kind_of} state '{text}'")]
pub struct StateParseError {
    kind_of: &'static str,
    text: String,
}

/// ホストローカルな Arc の状態。
///
/// 論理的な Arc の状態は全ホストの状態の合成で決まる：
/// どこかのホストが Running なら Running、全ホストが Stopped なら Stopped。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArcStateKind {
    NeverStarted,
    Indeterminate,
    Running,
    Stopped,
    Error,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ArcState {
    kind: ArcStateKind,
    cause: Option<String>,
}

impl ArcState {
    pub const NEVER_STARTED: ArcState = ArcState {
        kind: ArcStateKind::NeverStarted,
        cause: None,
    };
    pub const INDETERMINATE: ArcState = ArcState {
        kind: ArcStateKind::Indeterminate,
        cause: None,
    };
    pub const RUNNING: ArcState = ArcState {
        kind: ArcStateKind::Running,
        cause: None,
    };
    pub const STOPPED: ArcState = ArcState {
        kind: ArcStateKind::Stopped,
        cause: None,
    };
    pub const DELETED: ArcState = ArcState {
        kind: ArcStateKind::Deleted,
        cause: None,
    };

    pub fn error(cause: impl Into<String>) -> Self {
        Self {
            kind: ArcStateKind::Error,
            cause: Some(cause.into()),
        }
    }

    pub fn kind(&self) -> ArcStateKind {
        self.kind
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    fn kind_str(&self) -> &'static str {
        match self.kind {
            ArcStateKind::NeverStarted => "NeverStarted",
            ArcStateKind::Indeterminate => "Indeterminate",
            ArcStateKind::Running => "Running",
            ArcStateKind::Stopped => "Stopped",
            ArcStateKind::Error => "Error",
            ArcStateKind::Deleted => "Deleted",
        }
    }

    pub fn parse(text: &str) -> Result<Self, StateParseError> {
        let (kind, cause) = split_cause(text);
        let kind = match kind {
            "NeverStarted" => ArcStateKind::NeverStarted,
            "Indeterminate" => ArcStateKind::Indeterminate,
            "Running" => ArcStateKind::Running,
            "Stopped" => ArcStateKind::Stopped,
            "Error" => ArcStateKind::Error,
            "Deleted" => ArcStateKind::Deleted,
            _ => {
                return Err(StateParseError {
                    kind_of: "arc",
                    text: text.to_string(),
                });
            }
        };
        Ok(Self { kind, cause })
    }
}

impl PartialEq for ArcState {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for ArcState {}

impl Hash for ArcState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl fmt::Display for ArcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}|{}", self.kind_str(), cause),
            None => f.write_str(self.kind_str()),
        }
    }
}

/// Particle のライフサイクル状態（coarse-state 表現）。
///
/// # 遷移の概要
/// - Instantiated → (onFirstStart/onStart) → Waiting
/// - Waiting → (全 readable handle の READY) → Running
/// - Running ⇄ Desynced（handle の desync/resync）
/// - 任意のフック失敗 → Failed / FailedNeverStarted
/// - 連続失敗が閾値超過 → MaxFailed（終端、以降自動再起動なし）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticleStateKind {
    Instantiated,
    FirstStart,
    Waiting,
    Running,
    Desynced,
    Stopped,
    Failed,
    FailedNeverStarted,
    MaxFailed,
}

#[derive(Debug, Clone)]
pub struct ParticleState {
    kind: ParticleStateKind,
    cause: Option<String>,
}

impl ParticleState {
    pub const INSTANTIATED: ParticleState = ParticleState {
        kind: ParticleStateKind::Instantiated,
        cause: None,
    };
    pub const FIRST_START: ParticleState = ParticleState {
        kind: ParticleStateKind::FirstStart,
        cause: None,
    };
    pub const WAITING: ParticleState = ParticleState {
        kind: ParticleStateKind::Waiting,
        cause: None,
    };
    pub const RUNNING: ParticleState = ParticleState {
        kind: ParticleStateKind::Running,
        cause: None,
    };
    pub const DESYNCED: ParticleState = ParticleState {
        kind: ParticleStateKind::Desynced,
        cause: None,
    };
    pub const STOPPED: ParticleState = ParticleState {
        kind: ParticleStateKind::Stopped,
        cause: None,
    };

    pub fn failed_with(cause: impl Into<String>) -> Self {
        Self {
            kind: ParticleStateKind::Failed,
            cause: Some(cause.into()),
        }
    }

    pub fn failed_never_started_with(cause: impl Into<String>) -> Self {
        Self {
            kind: ParticleStateKind::FailedNeverStarted,
            cause: Some(cause.into()),
        }
    }

    pub fn max_failed_with(cause: impl Into<String>) -> Self {
        Self {
            kind: ParticleStateKind::MaxFailed,
            cause: Some(cause.into()),
        }
    }

    pub fn kind(&self) -> ParticleStateKind {
        self.kind
    }

    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// FirstStart を一度でも成功で通過した状態なら true。
    ///
    /// onFirstStart をパーティクルの生涯で一度しか呼ばないための判定に使う。
    pub fn has_been_started(&self) -> bool {
        matches!(
            self.kind,
            ParticleStateKind::FirstStart
                | ParticleStateKind::Waiting
                | ParticleStateKind::Running
                | ParticleStateKind::Desynced
                | ParticleStateKind::Stopped
                | ParticleStateKind::Failed
        )
    }

    /// 失敗系の状態（Failed / FailedNeverStarted / MaxFailed）なら true。
    pub fn failed(&self) -> bool {
        matches!(
            self.kind,
            ParticleStateKind::Failed
                | ParticleStateKind::FailedNeverStarted
                | ParticleStateKind::MaxFailed
        )
    }

    fn kind_str(&self) -> &'static str {
        match self.kind {
            ParticleStateKind::Instantiated => "Instantiated",
            ParticleStateKind::FirstStart => "FirstStart",
            ParticleStateKind::Waiting => "Waiting",
            ParticleStateKind::Running => "Running",
            ParticleStateKind::Desynced => "Desynced",
            ParticleStateKind::Stopped => "Stopped",
            ParticleStateKind::Failed => "Failed",
            ParticleStateKind::FailedNeverStarted => "Failed_NeverStarted",
            ParticleStateKind::MaxFailed => "MaxFailed",
        }
    }

    pub fn parse(text: &str) -> Result<Self, StateParseError> {
        let (kind, cause) = split_cause(text);
        let kind = match kind {
            "Instantiated" => ParticleStateKind::Instantiated,
            "FirstStart" => ParticleStateKind::FirstStart,
            "Waiting" => ParticleStateKind::Waiting,
            "Running" => ParticleStateKind::Running,
            "Desynced" => ParticleStateKind::Desynced,
            "Stopped" => ParticleStateKind::Stopped,
            "Failed" => ParticleStateKind::Failed,
            "Failed_NeverStarted" => ParticleStateKind::FailedNeverStarted,
            "MaxFailed" => ParticleStateKind::MaxFailed,
            _ => {
                return Err(StateParseError {
                    kind_of: "particle",
                    text: text.to_string(),
                });
            }
        };
        Ok(Self { kind, cause })
    }
}

impl PartialEq for ParticleState {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for ParticleState {}

impl Hash for ParticleState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

impl fmt::Display for ParticleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}|{}", self.kind_str(), cause),
            None => f.write_str(self.kind_str()),
        }
    }
}

fn split_cause(text: &str) -> (&str, Option<String>) {
    match text.split_once('|') {
        Some((kind, cause)) => (kind, Some(cause.to_string())),
        None => (text, None),
    }
}
