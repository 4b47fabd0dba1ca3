//! arclet-core
//!
//! Core building blocks for the arclet runtime: particles organized into
//! arcs, partitioned across hosts, with CRDT-backed handle synchronization.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, plan, state）
//! - **scheduler**: arc ごとの単一論理実行ストリーム
//! - **storage**: storage key / CRDT レプリカ / store actor / proxy
//! - **handle**: particle から見た型付きの読み書き口
//! - **host**: particle 実行側（lifecycle 状態機械, handle manager,
//!   永続化, ArcHost, ホスト台帳）
//! - **allocator**: Plan をホストへ切り分ける
//! - **resurrector**: 休眠ホストの呼び起こし
//! - **error** / **time**: 横断的なエラー型と時計

pub mod allocator;
pub mod domain;
pub mod error;
pub mod handle;
pub mod host;
pub mod resurrector;
pub mod scheduler;
pub mod storage;
pub mod time;

pub use allocator::Allocator;
pub use domain::ids::{ArcId, IdGenerator};
pub use domain::plan::{Plan, PlanPartition};
pub use domain::state::{ArcState, ParticleState};
pub use error::{ArcHostError, ConfigError, HandleError, ParticleFailure, StorageError};
pub use handle::Handle;
pub use host::{
    ArcHost, ExplicitHostRegistry, HostRegistry, Particle, ParticleArcHost, ParticleRegistry,
    ResurrectableHost,
};
pub use resurrector::Resurrector;
pub use scheduler::Scheduler;
pub use storage::key::StorageKey;
pub use storage::ramdisk::RamDiskStorageManager;
pub use time::{Clock, SystemClock};
