//! CRDT - 合流可能なレプリカ状態
//!
//! proxy / store が持ち回るレプリカの最小実装。actor ごとの単調増加
//! シーケンスを [`VersionMap`] で数え、操作は「次の番号だけ適用できる」
//! 規則で取り込む：
//!
//! - `seq == 現在値 + 1` : 適用してバージョンを進める
//! - `seq <= 現在値`      : 適用済み。何もせず成功（冪等）
//! - それ以外（飛び）     : 失敗。呼び出し側は desync → 全モデル再同期へ
//!
//! singleton は「支配する側が勝つ」、set は add-wins の近似。タイブレークは
//! actor 名の辞書順で決定的にする。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::plan::{ContainerType, RawEntity};

/// actor 名 → その actor が発行した操作数。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMap(BTreeMap<String, u64>);

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq_for(&self, actor: &str) -> u64 {
        self.0.get(actor).copied().unwrap_or(0)
    }

    pub fn bump(&mut self, actor: &str) -> u64 {
        let next = self.seq_for(actor) + 1;
        self.0.insert(actor.to_string(), next);
        next
    }

    /// self が other を支配する（全 actor で self >= other）なら true。
    pub fn dominates(&self, other: &VersionMap) -> bool {
        other
            .0
            .iter()
            .all(|(actor, &seq)| self.seq_for(actor) >= seq)
    }

    /// actor ごとの max を取る。
    pub fn merge(&mut self, other: &VersionMap) {
        for (actor, &seq) in &other.0 {
            let entry = self.0.entry(actor.clone()).or_insert(0);
            if *entry < seq {
                *entry = seq;
            }
        }
    }
}

/// レプリカへの操作。actor と seq で一意に識別される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CrdtOperation {
    SetSingleton {
        actor: String,
        seq: u64,
        value: RawEntity,
    },
    ClearSingleton {
        actor: String,
        seq: u64,
    },
    AddElement {
        actor: String,
        seq: u64,
        value: RawEntity,
    },
    RemoveElement {
        actor: String,
        seq: u64,
        id: String,
    },
}

impl CrdtOperation {
    pub fn actor(&self) -> &str {
        match self {
            CrdtOperation::SetSingleton { actor, .. }
            | CrdtOperation::ClearSingleton { actor, .. }
            | CrdtOperation::AddElement { actor, .. }
            | CrdtOperation::RemoveElement { actor, .. } => actor,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            CrdtOperation::SetSingleton { seq, .. }
            | CrdtOperation::ClearSingleton { seq, .. }
            | CrdtOperation::AddElement { seq, .. }
            | CrdtOperation::RemoveElement { seq, .. } => *seq,
        }
    }

    /// この操作が versions に既に織り込まれているか。
    pub fn already_applied_in(&self, versions: &VersionMap) -> bool {
        self.seq() <= versions.seq_for(self.actor())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdtSingleton {
    versions: VersionMap,
    value: Option<RawEntity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdtSet {
    versions: VersionMap,
    elements: BTreeMap<String, RawEntity>,
}

/// proxy / store が持つレプリカ本体。container shape ごとに一種類。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum CrdtModel {
    Singleton(CrdtSingleton),
    Set(CrdtSet),
}

impl CrdtModel {
    pub fn new(container: ContainerType) -> Self {
        match container {
            ContainerType::Singleton => CrdtModel::Singleton(CrdtSingleton::default()),
            ContainerType::Collection => CrdtModel::Set(CrdtSet::default()),
        }
    }

    pub fn container(&self) -> ContainerType {
        match self {
            CrdtModel::Singleton(_) => ContainerType::Singleton,
            CrdtModel::Set(_) => ContainerType::Collection,
        }
    }

    pub fn versions(&self) -> &VersionMap {
        match self {
            CrdtModel::Singleton(s) => &s.versions,
            CrdtModel::Set(s) => &s.versions,
        }
    }

    pub fn singleton_value(&self) -> Option<&RawEntity> {
        match self {
            CrdtModel::Singleton(s) => s.value.as_ref(),
            CrdtModel::Set(_) => None,
        }
    }

    pub fn elements(&self) -> Vec<&RawEntity> {
        match self {
            CrdtModel::Singleton(s) => s.value.iter().collect(),
            CrdtModel::Set(s) => s.elements.values().collect(),
        }
    }

    /// 操作をひとつ取り込む。false は「飛びがあって適用できない」で、
    /// 呼び出し側は desync からの再同期に回ること。
    pub fn apply(&mut self, op: &CrdtOperation) -> bool {
        let current = self.versions().seq_for(op.actor());
        if op.seq() <= current {
            return true;
        }
        if op.seq() != current + 1 {
            return false;
        }

        match (self, op) {
            (CrdtModel::Singleton(s), CrdtOperation::SetSingleton { actor, value, .. }) => {
                s.value = Some(value.clone());
                s.versions.bump(actor);
                true
            }
            (CrdtModel::Singleton(s), CrdtOperation::ClearSingleton { actor, .. }) => {
                s.value = None;
                s.versions.bump(actor);
                true
            }
            (CrdtModel::Set(s), CrdtOperation::AddElement { actor, value, .. }) => {
                s.elements.insert(value.id.clone(), value.clone());
                s.versions.bump(actor);
                true
            }
            (CrdtModel::Set(s), CrdtOperation::RemoveElement { actor, id, .. }) => {
                s.elements.remove(id);
                s.versions.bump(actor);
                true
            }
            // shape と操作の不一致は飛びと同じ扱い（再同期で解消する）
            _ => false,
        }
    }

    /// 別レプリカの全モデルを取り込む。true なら自分の内容が変わった。
    pub fn merge(&mut self, other: &CrdtModel) -> bool {
        if self.versions().dominates(other.versions()) {
            return false;
        }
        let other_dominates = other.versions().dominates(self.versions());

        match (self, other) {
            (CrdtModel::Singleton(mine), CrdtModel::Singleton(theirs)) => {
                if other_dominates {
                    mine.value = theirs.value.clone();
                } else {
                    // 並行更新: actor 名の辞書順で大きい方の値が勝つ（決定的）
                    let winner_is_theirs = max_actor(&theirs.versions) > max_actor(&mine.versions);
                    if winner_is_theirs {
                        mine.value = theirs.value.clone();
                    }
                }
                mine.versions.merge(&theirs.versions);
                true
            }
            (CrdtModel::Set(mine), CrdtModel::Set(theirs)) => {
                if other_dominates {
                    mine.elements = theirs.elements.clone();
                } else {
                    // 並行更新は add-wins 近似: 和集合
                    for (id, value) in &theirs.elements {
                        mine.elements.entry(id.clone()).or_insert_with(|| value.clone());
                    }
                }
                mine.versions.merge(&theirs.versions);
                true
            }
            _ => false,
        }
    }
}

fn max_actor(versions: &VersionMap) -> Option<&String> {
    versions.0.keys().next_back()
}
