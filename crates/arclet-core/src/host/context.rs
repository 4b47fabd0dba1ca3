//! ArcHostContext - ひとつの (arc, host) 対の実行時状態
//!
//! 稼働中の実体（[`ParticleContext`] の集合 + ホストローカルな
//! [`ArcState`]）と、その永続化用スナップショットを分けて持つ。
//! スナップショットは構造体が正で、文字列化は storage 境界でだけ行う。

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::domain::ids::ArcId;
use crate::domain::plan::ParticleSpec;
use crate::domain::state::{ArcState, ParticleState};
use crate::error::SerializationError;
use crate::host::particle_context::ParticleContext;

pub struct ArcHostContext {
    arc_id: ArcId,
    arc_state: Mutex<ArcState>,
    particles: Mutex<Vec<Arc<ParticleContext>>>,
}

impl ArcHostContext {
    pub fn new(arc_id: ArcId, arc_state: ArcState) -> Self {
        Self {
            arc_id,
            arc_state: Mutex::new(arc_state),
            particles: Mutex::new(Vec::new()),
        }
    }

    pub fn arc_id(&self) -> &ArcId {
        &self.arc_id
    }

    pub fn arc_state(&self) -> ArcState {
        self.arc_state.lock().expect("context lock poisoned").clone()
    }

    pub fn set_arc_state(&self, state: ArcState) {
        *self.arc_state.lock().expect("context lock poisoned") = state;
    }

    pub fn add_particle(&self, particle: Arc<ParticleContext>) {
        self.particles
            .lock()
            .expect("context lock poisoned")
            .push(particle);
    }

    pub fn particles(&self) -> Vec<Arc<ParticleContext>> {
        self.particles.lock().expect("context lock poisoned").clone()
    }

    pub fn particle_named(&self, name: &str) -> Option<Arc<ParticleContext>> {
        self.particles
            .lock()
            .expect("context lock poisoned")
            .iter()
            .find(|p| p.particle_name() == name)
            .cloned()
    }

    /// 永続化・比較用の不変スナップショットを切り出す。
    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            arc_id: self.arc_id.clone(),
            arc_state: self.arc_state().to_string(),
            particles: self
                .particles()
                .iter()
                .map(|p| ParticleSnapshot {
                    spec: p.spec().clone(),
                    state: p.state().to_string(),
                    consecutive_failures: p.consecutive_failures(),
                })
                .collect(),
        }
    }
}

/// ArcHostContext の永続形。serializer がこの単位で書き、読み戻す。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub arc_id: ArcId,
    /// `ArcState` の文字列形（`Error|cause` など）。
    pub arc_state: String,
    pub particles: Vec<ParticleSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticleSnapshot {
    pub spec: ParticleSpec,
    /// `ParticleState` の文字列形。
    pub state: String,
    pub consecutive_failures: u32,
}

impl ContextSnapshot {
    pub fn empty(arc_id: ArcId) -> Self {
        Self {
            arc_id,
            arc_state: ArcState::NEVER_STARTED.to_string(),
            particles: Vec::new(),
        }
    }

    pub fn parsed_arc_state(&self, host_id: &str) -> Result<ArcState, SerializationError> {
        ArcState::parse(&self.arc_state).map_err(|e| SerializationError::Corrupt {
            arc_id: self.arc_id.to_string(),
            host_id: host_id.to_string(),
            detail: e.to_string(),
        })
    }

    pub fn parsed_particle_state(
        &self,
        particle: &ParticleSnapshot,
        host_id: &str,
    ) -> Result<ParticleState, SerializationError> {
        ParticleState::parse(&particle.state).map_err(|e| SerializationError::Corrupt {
            arc_id: self.arc_id.to_string(),
            host_id: host_id.to_string(),
            detail: e.to_string(),
        })
    }
}
