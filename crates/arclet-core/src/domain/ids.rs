//! Arc identifiers (session-scoped, hierarchical).
//!
//! # ID の生成方式
//! ArcId は `!<session>:<name>` の形で、session 部分は ULID ベース。
//! - **セッション単位で一意**: プロセスをまたいでも衝突しない
//!   （調整なしで複数ノードで生成できる、という ULID の性質に乗る）
//! - **階層的**: 子 ID は `parent:<n>` で導出する。handle 名や
//!   create-fate の storage key の unique 部分に使う。
//!
//! ArcId は作成後 immutable。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::Clock;

/// Globally unique identifier of a running arc.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArcId(String);

impl ArcId {
    /// 永続化レイヤから読み戻すとき用。生成は [`IdGenerator`] 経由で。
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// セッションスコープの ID 生成器。
///
/// [`IdGenerator::new_session`] ごとに独立した session タグを持つので、
/// 別プロセス・別スレッドで同じ name から ArcId を作っても衝突しない。
pub struct IdGenerator {
    session: String,
    next_child: AtomicU64,
}

impl IdGenerator {
    /// 新しいセッションを開始する。
    pub fn new_session(clock: &dyn Clock) -> Self {
        let timestamp_ms = clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        Self {
            session: ulid.to_string(),
            next_child: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Arc の root ID を生成する。
    pub fn new_arc_id(&self, name: &str) -> ArcId {
        ArcId(format!("!{}:{}", self.session, name))
    }

    /// 階層的な子 ID を導出する（handle 名、storage key の unique 部分など）。
    pub fn new_child_id(&self, parent: &ArcId, subcomponent: &str) -> String {
        let n = self.next_child.fetch_add(1, Ordering::Relaxed);
        if subcomponent.is_empty() {
            format!("{}:{}", parent.0, n)
        } else {
            format!("{}:{}{}", parent.0, subcomponent, n)
        }
    }
}
