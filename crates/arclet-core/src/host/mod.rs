//! host - particle を実際に動かす側
//!
//! 下から順に: particle（コード片）→ particle_context（状態機械）→
//! handle_manager（handle/proxy の台帳）→ context + serializer（永続化）→
//! arc_host（配備単位）→ registry（ホストの台帳）。

pub mod arc_host;
pub mod context;
pub mod handle_manager;
pub mod particle;
pub mod particle_context;
pub mod registry;
pub mod serializer;

pub use arc_host::{ArcHost, ParticleArcHost, ResurrectableHost};
pub use context::{ArcHostContext, ContextSnapshot, ParticleSnapshot};
pub use handle_manager::HandleManager;
pub use particle::{Particle, ParticleFactory, ParticleRegistry};
pub use particle_context::{MAX_CONSECUTIVE_FAILURES, ParticleContext};
pub use registry::{DiscoveryHostRegistry, ExplicitHostRegistry, HostRegistry};
pub use serializer::ArcHostContextSerializer;
