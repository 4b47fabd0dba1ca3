//! Storage - CRDT レプリカ、store、proxy
//!
//! 下から順に: [`crdt`]（レプリカ本体）→ [`ramdisk`]（key ごとの store
//! actor）→ [`endpoint`]（proxy ⇄ store の境界）→ [`proxy`]（同期状態
//! 機械とイベント配送）。

pub mod crdt;
pub mod endpoint;
pub mod key;
pub mod proxy;
pub mod ramdisk;

pub use crdt::{CrdtModel, CrdtOperation, VersionMap};
pub use endpoint::{
    ProxyCallback, ProxyMessage, StorageEndpoint, StorageEndpointManager, StoreOptions,
};
pub use key::StorageKey;
pub use proxy::{ProxyState, StorageEvent, StorageEventCallback, StorageProxy};
pub use ramdisk::RamDiskStorageManager;
