//! Allocator - Plan をホストへ切り分ける
//!
//! `start_arc_for_plan` の手順:
//! 1. arc_id を決める（plan が持っていればそれ、なければ start ごとに
//!    新しいセッションを切って採番する。同名 plan の再 start でも
//!    衝突しない）
//! 2. `create://` のままの handle にだけ storage key を合成する。
//!    key を発明するのはここだけで、他はすべて plan からの引き写し
//! 3. particle ごとに実行ホストを決める。登録順で最初に合致したホストが
//!    勝つ（決定的・再現可能）。合致なしは default ホスト、それも無ければ
//!    設定エラーで即死
//! 4. ホストごとに partition を一つ作る
//! 5. partition を台帳に記録してから各ホストへ start を配る。配布の途中で
//!    落ちても台帳は完全な形で残る

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::ids::{ArcId, IdGenerator};
use crate::domain::plan::{Plan, PlanPartition};
use crate::domain::state::{ArcState, ArcStateKind};
use crate::error::{ArcHostError, ConfigError};
use crate::host::arc_host::ArcHost;
use crate::host::registry::HostRegistry;
use crate::storage::key::StorageKey;
use crate::time::Clock;

pub struct Allocator {
    registry: Arc<dyn HostRegistry>,
    default_host: Option<Arc<dyn ArcHost>>,
    clock: Arc<dyn Clock>,
    partitions: Mutex<HashMap<ArcId, Vec<PlanPartition>>>,
}

impl Allocator {
    pub fn new(registry: Arc<dyn HostRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            default_host: None,
            clock,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    /// どのホストにも合致しない particle の受け皿。
    pub fn with_default_host(mut self, host: Arc<dyn ArcHost>) -> Self {
        self.default_host = Some(host);
        self
    }

    /// plan から arc を起動する。戻り値はこの arc の ArcId。
    pub async fn start_arc_for_plan(
        &self,
        name: &str,
        plan: &Plan,
    ) -> Result<ArcId, ArcHostError> {
        // start ごとに新しいセッション。子キーの合成も同じ generator で行う
        let id_generator = IdGenerator::new_session(self.clock.as_ref());
        let arc_id = plan
            .arc_id
            .clone()
            .unwrap_or_else(|| id_generator.new_arc_id(name));

        let partitions = self.partition_plan(&id_generator, &arc_id, plan)?;

        // 先に台帳へ。配布の途中で失敗しても partition の全体像は引ける
        self.partitions
            .lock()
            .expect("allocator lock poisoned")
            .insert(arc_id.clone(), partitions.clone());

        for partition in partitions {
            let host = self.host_named(&partition.target_host).ok_or_else(|| {
                ArcHostError::new(format!(
                    "partition targets host '{}' which is no longer registered",
                    partition.target_host
                ))
            })?;
            host.start_arc(partition).await?;
        }
        Ok(arc_id)
    }

    /// arc を全ホストで停止する。
    pub async fn stop_arc(&self, arc_id: &ArcId) -> Result<(), ArcHostError> {
        let partitions = self.partitions_for(arc_id);
        for partition in partitions {
            if let Some(host) = self.host_named(&partition.target_host) {
                host.stop_arc(partition).await?;
            }
        }
        Ok(())
    }

    /// 論理 arc の状態。どこかのホストが Running なら Running、全ホストが
    /// Stopped のときだけ Stopped。それ以外の混在は Indeterminate。
    pub async fn arc_status(&self, arc_id: &ArcId) -> ArcState {
        let partitions = self.partitions_for(arc_id);
        if partitions.is_empty() {
            return ArcState::NEVER_STARTED;
        }
        let mut states = Vec::new();
        for partition in &partitions {
            if let Some(host) = self.host_named(&partition.target_host) {
                states.push(host.lookup_arc_state(arc_id).await);
            }
        }
        if states.iter().any(|s| s.kind() == ArcStateKind::Running) {
            return ArcState::RUNNING;
        }
        if !states.is_empty() && states.iter().all(|s| s.kind() == ArcStateKind::Stopped) {
            return ArcState::STOPPED;
        }
        if states.iter().all(|s| s.kind() == ArcStateKind::NeverStarted) {
            return ArcState::NEVER_STARTED;
        }
        ArcState::INDETERMINATE
    }

    /// 台帳に記録された partition（検査・リトライ用のコピー）。
    pub fn partitions_for(&self, arc_id: &ArcId) -> Vec<PlanPartition> {
        self.partitions
            .lock()
            .expect("allocator lock poisoned")
            .get(arc_id)
            .cloned()
            .unwrap_or_default()
    }

    fn host_named(&self, host_id: &str) -> Option<Arc<dyn ArcHost>> {
        if let Some(host) = self
            .registry
            .available_arc_hosts()
            .into_iter()
            .find(|h| h.host_id() == host_id)
        {
            return Some(host);
        }
        self.default_host
            .as_ref()
            .filter(|h| h.host_id() == host_id)
            .cloned()
    }

    fn partition_plan(
        &self,
        id_generator: &IdGenerator,
        arc_id: &ArcId,
        plan: &Plan,
    ) -> Result<Vec<PlanPartition>, ArcHostError> {
        // handle 名 → 確定 storage key。create-fate だけここで合成する
        let mut resolved: HashMap<String, StorageKey> = HashMap::new();
        for handle in &plan.handles {
            let key = if handle.storage_key.is_unresolved() {
                let unique = id_generator.new_child_id(arc_id, "handle");
                if handle.is_tagged("volatile") {
                    StorageKey::volatile(arc_id, unique)
                } else {
                    StorageKey::ramdisk(unique)
                }
            } else {
                handle.storage_key.clone()
            };
            resolved.insert(handle.name.clone(), key);
        }

        let hosts = self.registry.available_arc_hosts();
        // ホスト選択は登録順で最初の合致（first-registered-wins）
        let mut order: Vec<String> = Vec::new();
        let mut by_host: HashMap<String, Vec<crate::domain::plan::ParticleSpec>> = HashMap::new();
        for particle in &plan.particles {
            let host = hosts
                .iter()
                .find(|h| h.is_host_for_particle(particle))
                .or(self.default_host.as_ref())
                .ok_or_else(|| {
                    ConfigError::NoHostForParticle(particle.location.clone())
                })?;

            let mut spec = particle.clone();
            for connection in spec.connections.values_mut() {
                if connection.storage_key.is_unresolved() {
                    connection.storage_key = resolved
                        .get(&connection.handle_name)
                        .cloned()
                        .ok_or_else(|| {
                            ConfigError::UnknownHandle(connection.handle_name.clone())
                        })?;
                }
            }

            let host_id = host.host_id().to_string();
            if !by_host.contains_key(&host_id) {
                order.push(host_id.clone());
            }
            by_host.entry(host_id).or_default().push(spec);
        }

        Ok(order
            .into_iter()
            .map(|host_id| PlanPartition {
                arc_id: arc_id.clone(),
                target_host: host_id.clone(),
                particles: by_host.remove(&host_id).unwrap_or_default(),
            })
            .collect())
    }
}
