//! StorageKey - ストアを指す、パース可能な識別子
//!
//! # 形式
//! - `volatile://<arc-id>/<unique>` : arc と同寿命のインメモリストア
//! - `ramdisk://<unique>`           : プロセス寿命のインメモリストア
//! - `reference-mode://{<backing>}{<storage>}` : 実体を backing 側に置き、
//!   storage 側には参照だけを置く二段構え
//! - `create://<name>`              : 未解決（allocator が具体キーに差し替える）
//!
//! `create://` キーがホストまで届いたら設定エラー（allocator のバグか、
//! allocator を通さず Plan を直接渡した）。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::ids::ArcId;
use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKey {
    Volatile { arc_id: String, unique: String },
    RamDisk { unique: String },
    ReferenceMode { backing: Box<StorageKey>, storage: Box<StorageKey> },
    Create { name: String },
}

impl StorageKey {
    pub fn volatile(arc_id: &ArcId, unique: impl Into<String>) -> Self {
        StorageKey::Volatile {
            arc_id: arc_id.as_str().to_string(),
            unique: unique.into(),
        }
    }

    pub fn ramdisk(unique: impl Into<String>) -> Self {
        StorageKey::RamDisk { unique: unique.into() }
    }

    pub fn create(name: impl Into<String>) -> Self {
        StorageKey::Create { name: name.into() }
    }

    /// allocator による解決が必要なキーか。
    pub fn is_unresolved(&self) -> bool {
        matches!(self, StorageKey::Create { .. })
    }

    pub fn is_volatile(&self) -> bool {
        match self {
            StorageKey::Volatile { .. } => true,
            StorageKey::ReferenceMode { backing, storage } => {
                backing.is_volatile() || storage.is_volatile()
            }
            _ => false,
        }
    }

    pub fn is_reference_mode(&self) -> bool {
        matches!(self, StorageKey::ReferenceMode { .. })
    }

    pub fn parse(text: &str) -> Result<Self, StorageError> {
        if let Some(rest) = text.strip_prefix("volatile://") {
            let (arc_id, unique) = rest
                .split_once('/')
                .ok_or_else(|| StorageError::BadKey(text.to_string()))?;
            if arc_id.is_empty() {
                return Err(StorageError::BadKey(text.to_string()));
            }
            return Ok(StorageKey::Volatile {
                arc_id: arc_id.to_string(),
                unique: unique.to_string(),
            });
        }
        if let Some(unique) = text.strip_prefix("ramdisk://") {
            return Ok(StorageKey::RamDisk { unique: unique.to_string() });
        }
        if let Some(name) = text.strip_prefix("create://") {
            return Ok(StorageKey::Create { name: name.to_string() });
        }
        if let Some(rest) = text.strip_prefix("reference-mode://") {
            // {backing}{storage} — 入れ子の reference-mode は許可しないので
            // 内側のキーに '{' '}' は現れない
            let inner = rest
                .strip_prefix('{')
                .and_then(|r| r.strip_suffix('}'))
                .ok_or_else(|| StorageError::BadKey(text.to_string()))?;
            let (backing, storage) = inner
                .split_once("}{")
                .ok_or_else(|| StorageError::BadKey(text.to_string()))?;
            let backing = StorageKey::parse(backing)?;
            let storage = StorageKey::parse(storage)?;
            if backing.is_reference_mode() || storage.is_reference_mode() {
                return Err(StorageError::BadKey(text.to_string()));
            }
            return Ok(StorageKey::ReferenceMode {
                backing: Box::new(backing),
                storage: Box::new(storage),
            });
        }
        Err(StorageError::BadKey(text.to_string()))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Volatile { arc_id, unique } => {
                write!(f, "volatile://{arc_id}/{unique}")
            }
            StorageKey::RamDisk { unique } => write!(f, "ramdisk://{unique}"),
            StorageKey::ReferenceMode { backing, storage } => {
                write!(f, "reference-mode://{{{backing}}}{{{storage}}}")
            }
            StorageKey::Create { name } => write!(f, "create://{name}"),
        }
    }
}

impl Serialize for StorageKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StorageKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        StorageKey::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("volatile://!1:myArc/h0")]
    #[case("ramdisk://things")]
    #[case("create://pending")]
    #[case("reference-mode://{ramdisk://backing}{volatile://!1:a/fwd}")]
    fn parse_display_roundtrip(#[case] text: &str) {
        let key = StorageKey::parse(text).unwrap();
        assert_eq!(key.to_string(), text);
    }

    #[rstest]
    #[case("http://nope")]
    #[case("volatile://missing-slash")]
    #[case("reference-mode://ramdisk://a")]
    #[case("reference-mode://{ramdisk://a}")]
    fn parse_rejects_malformed_keys(#[case] text: &str) {
        assert!(StorageKey::parse(text).is_err());
    }

    #[test]
    fn nested_reference_mode_is_rejected() {
        let text = "reference-mode://{reference-mode://{ramdisk://a}{ramdisk://b}}{ramdisk://c}";
        assert!(StorageKey::parse(text).is_err());
    }

    #[test]
    fn volatility_sees_through_reference_mode() {
        let key = StorageKey::ReferenceMode {
            backing: Box::new(StorageKey::ramdisk("b")),
            storage: Box::new(StorageKey::Volatile {
                arc_id: "!1:a".into(),
                unique: "s".into(),
            }),
        };
        assert!(key.is_volatile());
        assert!(!StorageKey::ramdisk("x").is_volatile());
    }

    #[test]
    fn serde_uses_the_string_form() {
        let key = StorageKey::ramdisk("u");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"ramdisk://u\"");
        let back: StorageKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
