//! Domain - 計画・識別子・状態のコア型

pub mod ids;
pub mod plan;
pub mod state;

pub use ids::{ArcId, IdGenerator};
pub use plan::{
    ContainerType, DataType, HandleConnectionSpec, HandleMode, HandleSpec, ParticleSpec, Plan,
    PlanPartition, RawEntity, Ttl, TypeTag,
};
pub use state::{ArcState, ArcStateKind, ParticleState, ParticleStateKind};
