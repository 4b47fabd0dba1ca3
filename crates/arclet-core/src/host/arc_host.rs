//! ArcHost - arc 実行の配備単位
//!
//! partition を受け取り、particle を組み立てて動かす。ホストは別プロセス
//! かもしれないので、境界を越えるエラーはすべてシリアライズ可能な
//! [`ArcHostError`] に包む。
//!
//! # start_arc の冪等性
//! (arc_id, host_id) に対する永続化済みコンテキストがあれば、それを読んで
//! particle を「前回の状態の続き」から復元する。Running まで行っていた
//! particle は Stopped 相当として復元されるので、`on_first_start` が
//! 二度走ることはない。MaxFailed は終端で、復元後も起動対象から外れる。
//! Deleted な arc はどの経路からも再起動できない。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::ids::ArcId;
use crate::domain::plan::{ParticleSpec, PlanPartition};
use crate::domain::state::{ArcState, ArcStateKind, ParticleState, ParticleStateKind};
use crate::error::ArcHostError;
use crate::host::context::{ArcHostContext, ContextSnapshot};
use crate::host::handle_manager::HandleManager;
use crate::host::particle::ParticleRegistry;
use crate::host::particle_context::ParticleContext;
use crate::host::serializer::ArcHostContextSerializer;
use crate::scheduler::SchedulerProvider;
use crate::storage::endpoint::StorageEndpointManager;
use crate::storage::key::StorageKey;
use crate::time::Clock;

/// ホストの公開面。allocator と resurrector はこの trait 越しにしか
/// ホストに触らない。
#[async_trait]
pub trait ArcHost: Send + Sync {
    fn host_id(&self) -> &str;

    /// このホストが実行できる particle 実装識別子（ソート済み）。
    fn registered_particles(&self) -> Vec<String>;

    fn is_host_for_particle(&self, spec: &ParticleSpec) -> bool {
        self.registered_particles()
            .iter()
            .any(|location| location == &spec.location)
    }

    async fn start_arc(&self, partition: PlanPartition) -> Result<(), ArcHostError>;

    async fn stop_arc(&self, partition: PlanPartition) -> Result<(), ArcHostError>;

    /// ホストローカルに見えている arc の状態。未知の arc は NeverStarted。
    async fn lookup_arc_state(&self, arc_id: &ArcId) -> ArcState;
}

/// storage の変化をきっかけに、休眠から arc を再開できるホスト。
#[async_trait]
pub trait ResurrectableHost: ArcHost {
    async fn on_resurrected(
        &self,
        arc_id: &ArcId,
        affected_keys: &[StorageKey],
    ) -> Result<(), ArcHostError>;
}

struct RunningArc {
    partition: PlanPartition,
    context: Arc<ArcHostContext>,
    handle_manager: Arc<HandleManager>,
}

/// プロセス内リファレンス実装。arc ごとに scheduler と handle manager を
/// 持ち、状態遷移のたびにコンテキストを非同期で書き出す。
pub struct ParticleArcHost {
    host_id: String,
    registry: ParticleRegistry,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn StorageEndpointManager>,
    schedulers: SchedulerProvider,
    serializer: Arc<ArcHostContextSerializer>,
    arcs: Mutex<HashMap<ArcId, RunningArc>>,
    /// pause 中は `Some`。溜まった partition は unpause で順に起動する。
    deferred: StdMutex<Option<Vec<PlanPartition>>>,
}

impl ParticleArcHost {
    pub fn new(
        host_id: impl Into<String>,
        registry: ParticleRegistry,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn StorageEndpointManager>,
    ) -> Self {
        let host_id = host_id.into();
        let serializer = Arc::new(ArcHostContextSerializer::new(
            host_id.clone(),
            Arc::clone(&storage),
        ));
        Self {
            host_id,
            registry,
            clock,
            storage,
            schedulers: SchedulerProvider::new(),
            serializer,
            arcs: Mutex::new(HashMap::new()),
            deferred: StdMutex::new(None),
        }
    }

    /// 稼働中の arc をすべて止め、以降の start 要求を unpause まで遅延する。
    pub async fn pause(&self) {
        {
            let mut deferred = self.deferred.lock().expect("host lock poisoned");
            if deferred.is_none() {
                *deferred = Some(Vec::new());
            }
        }
        let partitions: Vec<PlanPartition> = {
            let arcs = self.arcs.lock().await;
            arcs.values().map(|arc| arc.partition.clone()).collect()
        };
        for partition in partitions {
            if let Err(e) = self.stop_arc_now(&partition.arc_id).await {
                eprintln!(
                    "[arclet] host '{}': failed to stop arc '{}' during pause: {e}",
                    self.host_id, partition.arc_id
                );
            }
        }
    }

    /// pause を解除し、溜まっていた start 要求を受け付けた順に処理する。
    pub async fn unpause(&self) {
        let queued = self
            .deferred
            .lock()
            .expect("host lock poisoned")
            .take()
            .unwrap_or_default();
        for partition in queued {
            let arc_id = partition.arc_id.clone();
            if let Err(e) = self.start_arc_now(partition).await {
                eprintln!(
                    "[arclet] host '{}': deferred start of arc '{arc_id}' failed: {e}",
                    self.host_id
                );
            }
        }
    }

    /// 保留中のコンテキスト書き込みをすべて storage へ流し切る。
    pub async fn drain(&self) {
        self.serializer.drain_serializations().await;
    }

    /// arc の scheduler と store を追いつかせる（テスト・終了処理用）。
    pub async fn wait_for_arc_idle(&self, arc_id: &ArcId) {
        let handle_manager = {
            let arcs = self.arcs.lock().await;
            arcs.get(arc_id).map(|arc| Arc::clone(&arc.handle_manager))
        };
        if let Some(hm) = handle_manager {
            for _ in 0..3 {
                self.storage.idle().await;
                hm.scheduler().wait_for_idle().await;
            }
        }
        self.serializer.drain_serializations().await;
    }

    /// ホスト全体の終了。稼働中の arc を止め、serializer を畳む。
    pub async fn shutdown(&self) {
        let partitions: Vec<PlanPartition> = {
            let arcs = self.arcs.lock().await;
            arcs.values().map(|arc| arc.partition.clone()).collect()
        };
        for partition in partitions {
            let _ = self.stop_arc_now(&partition.arc_id).await;
        }
        self.serializer.drain_serializations().await;
        self.serializer.cancel().await;
        self.schedulers.cancel_all().await;
    }

    async fn start_arc_now(&self, partition: PlanPartition) -> Result<(), ArcHostError> {
        let arc_id = partition.arc_id.clone();
        let mut arcs = self.arcs.lock().await;

        // 既に動いていれば何もしない
        if let Some(existing) = arcs.get(&arc_id) {
            if existing.context.arc_state().kind() == ArcStateKind::Running {
                return Ok(());
            }
        }

        let persisted = self
            .serializer
            .read_context_from_storage(ContextSnapshot::empty(arc_id.clone()))
            .await
            .map_err(|e| ArcHostError::new(e.to_string()))?;
        let persisted_state = persisted.parsed_arc_state(&self.host_id).map_err(|e| {
            ArcHostError::new(e.to_string())
        })?;
        if persisted_state.kind() == ArcStateKind::Deleted {
            return Err(ArcHostError::new(format!(
                "arc '{arc_id}' has been deleted and can not be restarted"
            )));
        }

        let scheduler = self.schedulers.scheduler_for_arc();
        let handle_manager = Arc::new(HandleManager::new(
            scheduler.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.storage),
        ));
        let context = Arc::new(ArcHostContext::new(arc_id.clone(), ArcState::INDETERMINATE));

        for spec in &partition.particles {
            let particle = self.registry.instantiate(&spec.location)?;
            let (state, failures) = match persisted
                .particles
                .iter()
                .find(|p| p.spec.particle_name == spec.particle_name)
            {
                Some(snapshot) => {
                    let parsed = persisted
                        .parsed_particle_state(snapshot, &self.host_id)
                        .map_err(|e| ArcHostError::new(e.to_string()))?;
                    (resume_state(parsed), snapshot.consecutive_failures)
                }
                None => (ParticleState::INSTANTIATED, 0),
            };
            let particle_context = Arc::new(ParticleContext::with_state(
                particle,
                spec.clone(),
                scheduler.clone(),
                state,
                failures,
            ));
            for (name, connection) in &spec.connections {
                let handle = handle_manager
                    .create_handle(connection, &spec.particle_name, false)
                    .await?;
                particle_context
                    .register_handle(name, handle)
                    .map_err(|e| ArcHostError::new(e.to_string()))?;
            }
            context.add_particle(particle_context);
        }

        // 全員を先に Waiting へ上げる。storage key を共有する particle が
        // いると、最初の run の同期で READY が全購読者へ一斉に届くため
        for particle_context in context.particles() {
            if particle_context.state().kind() == ParticleStateKind::MaxFailed {
                continue;
            }
            particle_context.init_particle().await;
        }
        for particle_context in context.particles() {
            if particle_context.state().kind() == ParticleStateKind::Waiting {
                particle_context.run_particle().await;
            }
        }

        context.set_arc_state(ArcState::RUNNING);
        // 稼働中の遷移（失敗・desync など）はその都度スナップショットを
        // 書き出す。起動時の遷移は直後の一括書き込みで拾う
        for particle_context in context.particles() {
            let serializer = Arc::clone(&self.serializer);
            let weak = Arc::downgrade(&context);
            particle_context.on_transition(Arc::new(move || {
                let Some(ctx) = weak.upgrade() else { return };
                let serializer = Arc::clone(&serializer);
                let snapshot = ctx.snapshot();
                tokio::spawn(async move {
                    serializer.write_context_to_storage(snapshot).await;
                });
            }));
        }
        self.serializer
            .write_context_to_storage(context.snapshot())
            .await;
        arcs.insert(
            arc_id,
            RunningArc {
                partition,
                context,
                handle_manager,
            },
        );
        Ok(())
    }

    async fn stop_arc_now(&self, arc_id: &ArcId) -> Result<(), ArcHostError> {
        let removed = self.arcs.lock().await.remove(arc_id);
        let Some(arc) = removed else {
            // 動いていない arc の stop は no-op
            return Ok(());
        };

        // particle 単位の失敗は state machine 側で記録済み。teardown は続ける。
        // teardown 中の遷移は末尾の一括書き込みで拾うので、フックは外す
        for particle_context in arc.context.particles() {
            particle_context.clear_transition_hook();
            particle_context.stop_particle().await;
        }
        arc.context.set_arc_state(ArcState::STOPPED);
        arc.handle_manager.close().await;
        self.storage.drop_volatile(arc_id.as_str()).await;
        self.serializer
            .write_context_to_storage(arc.context.snapshot())
            .await;
        Ok(())
    }
}

/// 永続化された状態から、再起動後の初期状態を決める。
///
/// 途中状態（Waiting / Running / Desynced）はプロセスと一緒に消えている
/// ので Stopped 相当から再入する。`has_been_started` は状態から導かれる
/// ため、Stopped 復元なら `on_first_start` は走らない。
fn resume_state(persisted: ParticleState) -> ParticleState {
    match persisted.kind() {
        ParticleStateKind::Instantiated | ParticleStateKind::FirstStart => {
            ParticleState::INSTANTIATED
        }
        ParticleStateKind::Waiting
        | ParticleStateKind::Running
        | ParticleStateKind::Desynced
        | ParticleStateKind::Stopped => ParticleState::STOPPED,
        // 失敗系はそのまま持ち越す（Failed からの init は許される）
        ParticleStateKind::Failed
        | ParticleStateKind::FailedNeverStarted
        | ParticleStateKind::MaxFailed => persisted,
    }
}

#[async_trait]
impl ArcHost for ParticleArcHost {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    fn registered_particles(&self) -> Vec<String> {
        self.registry.locations()
    }

    async fn start_arc(&self, partition: PlanPartition) -> Result<(), ArcHostError> {
        {
            let mut deferred = self.deferred.lock().expect("host lock poisoned");
            if let Some(queue) = deferred.as_mut() {
                queue.push(partition);
                return Ok(());
            }
        }
        self.start_arc_now(partition).await
    }

    async fn stop_arc(&self, partition: PlanPartition) -> Result<(), ArcHostError> {
        self.stop_arc_now(&partition.arc_id).await
    }

    async fn lookup_arc_state(&self, arc_id: &ArcId) -> ArcState {
        if let Some(arc) = self.arcs.lock().await.get(arc_id) {
            return arc.context.arc_state();
        }
        match self
            .serializer
            .read_context_from_storage(ContextSnapshot::empty(arc_id.clone()))
            .await
        {
            Ok(snapshot) => snapshot
                .parsed_arc_state(&self.host_id)
                .unwrap_or(ArcState::INDETERMINATE),
            Err(_) => ArcState::INDETERMINATE,
        }
    }
}

#[async_trait]
impl ResurrectableHost for ParticleArcHost {
    /// 永続化されたコンテキストから partition を組み直して再起動する。
    /// 何も永続化されていなければ no-op（復活させるものがない）。
    async fn on_resurrected(
        &self,
        arc_id: &ArcId,
        affected_keys: &[StorageKey],
    ) -> Result<(), ArcHostError> {
        eprintln!(
            "[arclet] host '{}': resurrection requested for arc '{arc_id}' ({} changed keys)",
            self.host_id,
            affected_keys.len()
        );
        let persisted = self
            .serializer
            .read_context_from_storage(ContextSnapshot::empty(arc_id.clone()))
            .await
            .map_err(|e| ArcHostError::new(e.to_string()))?;
        if persisted.particles.is_empty() {
            return Ok(());
        }
        let partition = PlanPartition {
            arc_id: arc_id.clone(),
            target_host: self.host_id.clone(),
            particles: persisted
                .particles
                .iter()
                .map(|p| p.spec.clone())
                .collect(),
        };
        self.start_arc(partition).await
    }
}
