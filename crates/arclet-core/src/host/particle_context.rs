//! ParticleContext - particle 一個分のライフサイクル状態機械
//!
//! ひとつの particle インスタンスと、その状態・連続失敗カウンタ・
//! 「初回同期待ちの handle」「desync 中の handle」の集合を束ねる。
//! 状態の変更はすべて arc の scheduler 上のタスクとして走るので、
//! particle 自身のコールバックとホスト起因の遷移が競合することはない。
//!
//! # 保証していること
//! - `on_first_start` は particle の生涯で一度だけ（再起動をまたいでも）。
//!   復元時は `has_been_started` が状態から引き継がれる
//! - 読める handle 全部が初回同期を終えるまで Running にならない。
//!   待ちの間に届いた UPDATE は握りつぶす（particle はまだ最初の
//!   全体像を見ていないため）
//! - DESYNC は最初の 1 個目だけ、RESYNC は最後の 1 個が戻ったときだけ
//!   フックを呼ぶ
//! - フック失敗で連続失敗カウンタが増え、閾値を超えたら終端の MaxFailed。
//!   以降、自動では二度と起動されない（クラッシュループ遮断）
//!
//! 不正な状態での `init_particle` / `run_particle` 呼び出しはホスト側の
//! プログラミングエラーなので panic で落とす。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::domain::plan::ParticleSpec;
use crate::domain::state::{ParticleState, ParticleStateKind};
use crate::error::{HandleError, ParticleFailure};
use crate::handle::Handle;
use crate::host::particle::Particle;
use crate::scheduler::{Scheduler, Task};
use crate::storage::proxy::StorageEvent;

/// 連続失敗がこれを超えたら MaxFailed。
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// 状態遷移のたびに呼ばれるフック。ホストが永続化の引き金に使う。
pub type TransitionHook = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    state: ParticleState,
    has_been_started: bool,
    consecutive_failures: u32,
    awaiting_ready: HashSet<String>,
    desynced: HashSet<String>,
    handles: HashMap<String, Arc<Handle>>,
    /// run_particle の待ち手。Running 到達か失敗確定で起こす。
    ready_waiters: Vec<oneshot::Sender<()>>,
}

pub struct ParticleContext {
    particle: Arc<dyn Particle>,
    spec: ParticleSpec,
    scheduler: Scheduler,
    inner: Mutex<Inner>,
    transition_hook: Mutex<Option<TransitionHook>>,
}

impl ParticleContext {
    pub fn new(particle: Arc<dyn Particle>, spec: ParticleSpec, scheduler: Scheduler) -> Self {
        Self::with_state(particle, spec, scheduler, ParticleState::INSTANTIATED, 0)
    }

    /// 永続化された状態から復元する。`has_been_started` は状態から導く
    /// （Stopped / Failed は起動済み、FailedNeverStarted は未起動）。
    /// 失敗カウンタも永続値から引き継ぐ（クラッシュループ遮断が
    /// 再起動でリセットされないように）。
    pub fn with_state(
        particle: Arc<dyn Particle>,
        spec: ParticleSpec,
        scheduler: Scheduler,
        state: ParticleState,
        consecutive_failures: u32,
    ) -> Self {
        let has_been_started = state.has_been_started();
        Self {
            particle,
            spec,
            scheduler,
            inner: Mutex::new(Inner {
                state,
                has_been_started,
                consecutive_failures,
                awaiting_ready: HashSet::new(),
                desynced: HashSet::new(),
                handles: HashMap::new(),
                ready_waiters: Vec::new(),
            }),
            transition_hook: Mutex::new(None),
        }
    }

    /// 状態遷移フックを設定する。ロックの外で呼ばれる。
    pub fn on_transition(&self, hook: TransitionHook) {
        *self
            .transition_hook
            .lock()
            .expect("particle context lock poisoned") = Some(hook);
    }

    pub fn clear_transition_hook(&self) {
        self.transition_hook
            .lock()
            .expect("particle context lock poisoned")
            .take();
    }

    fn fire_transition(&self) {
        let hook = self
            .transition_hook
            .lock()
            .expect("particle context lock poisoned")
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn particle_name(&self) -> &str {
        &self.spec.particle_name
    }

    pub fn spec(&self) -> &ParticleSpec {
        &self.spec
    }

    pub fn state(&self) -> ParticleState {
        self.lock().state.clone()
    }

    pub fn has_been_started(&self) -> bool {
        self.lock().has_been_started
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("particle context lock poisoned")
    }

    /// handle を繋ぐ。読める handle はストレージイベントの中継を登録し、
    /// 初回同期待ち集合に入る。
    pub fn register_handle(
        self: &Arc<Self>,
        name: &str,
        handle: Arc<Handle>,
    ) -> Result<(), HandleError> {
        {
            let mut inner = self.lock();
            inner.handles.insert(name.to_string(), Arc::clone(&handle));
            if handle.can_read() {
                inner.awaiting_ready.insert(name.to_string());
            }
        }
        if handle.can_read() {
            // proxy → (Listener タスク) → ここ → Processor タスクで notify。
            // 中継は Weak で持ち、停止後の循環参照を残さない
            let weak = Arc::downgrade(self);
            let scheduler = self.scheduler.clone();
            let handle_name = name.to_string();
            handle.register_for_storage_events(Arc::new(move |event| {
                let Some(this) = weak.upgrade() else { return };
                let handle_name = handle_name.clone();
                scheduler.schedule(Task::processor(async move {
                    this.notify(event, &handle_name).await;
                }));
            }))?;
        }
        self.particle.on_handle_attached(name, handle);
        Ok(())
    }

    /// particle を起動する。`on_first_start`（未起動なら）→ `on_start` を
    /// 呼び、Waiting へ。Instantiated / Stopped / Failed /
    /// FailedNeverStarted 以外からの呼び出しは panic。
    pub async fn init_particle(self: &Arc<Self>) {
        {
            let inner = self.lock();
            let kind = inner.state.kind();
            assert!(
                matches!(
                    kind,
                    ParticleStateKind::Instantiated
                        | ParticleStateKind::Stopped
                        | ParticleStateKind::Failed
                        | ParticleStateKind::FailedNeverStarted
                ),
                "initParticle called on particle '{}' in state {}",
                self.spec.particle_name,
                inner.state,
            );
        }
        let this = Arc::clone(self);
        self.scheduler.run_async(async move { this.do_init().await }).await;
    }

    async fn do_init(self: &Arc<Self>) {
        let run_first_start = {
            let mut inner = self.lock();
            if !inner.has_been_started {
                inner.state = ParticleState::FIRST_START;
                true
            } else {
                false
            }
        };
        if run_first_start {
            if let Err(failure) = self.particle.on_first_start().await {
                self.record_failure(failure);
                return;
            }
            self.lock().has_been_started = true;
        }

        {
            let mut inner = self.lock();
            inner.state = ParticleState::WAITING;
            inner.desynced.clear();
            let readable: HashSet<String> = inner
                .handles
                .iter()
                .filter(|(_, h)| h.can_read())
                .map(|(name, _)| name.clone())
                .collect();
            inner.awaiting_ready = readable;
        }
        if let Err(failure) = self.particle.on_start().await {
            self.record_failure(failure);
            return;
        }
        self.fire_transition();
    }

    /// 初回同期を仕掛け、particle が Running（または失敗確定）になるまで
    /// 待つ。Waiting / Running 以外からの呼び出しは panic。
    pub async fn run_particle(self: &Arc<Self>) {
        {
            let inner = self.lock();
            let kind = inner.state.kind();
            assert!(
                matches!(kind, ParticleStateKind::Waiting | ParticleStateKind::Running),
                "runParticle called on particle '{}' in state {}",
                self.spec.particle_name,
                inner.state,
            );
        }

        let this = Arc::clone(self);
        self.scheduler
            .run_async(async move {
                let (handles, ready_now) = {
                    let inner = this.lock();
                    let handles: Vec<Arc<Handle>> = inner.handles.values().cloned().collect();
                    let ready_now = inner.awaiting_ready.is_empty()
                        && inner.state.kind() == ParticleStateKind::Waiting;
                    (handles, ready_now)
                };
                for handle in &handles {
                    if handle.can_read() {
                        handle.maybe_initiate_sync();
                    }
                }
                // 読める handle が無い particle は同期を待たずに Running
                if ready_now {
                    this.move_to_running().await;
                }
            })
            .await;

        let waiter = {
            let mut inner = self.lock();
            if inner.state.kind() == ParticleStateKind::Running || inner.state.failed() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.ready_waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = waiter {
            let _ = rx.await;
        }
    }

    /// particle を停止する。handle の購読を外してから `on_shutdown` を
    /// 呼ぶ。shutdown の失敗は記録するだけで、停止は止めない。
    ///
    /// Stopped になるのは起動済みの状態からだけ。Failed 系はそのまま残す
    /// （FailedNeverStarted を Stopped に上書きすると「起動済み」として
    /// 復元され、`on_first_start` が永久に走らなくなる）。
    pub async fn stop_particle(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.scheduler
            .run_async(async move {
                let (handles, was_started) = {
                    let inner = this.lock();
                    let handles: Vec<Arc<Handle>> = inner.handles.values().cloned().collect();
                    let was_started = matches!(
                        inner.state.kind(),
                        ParticleStateKind::Waiting
                            | ParticleStateKind::Running
                            | ParticleStateKind::Desynced
                    );
                    (handles, was_started)
                };
                // 先に購読を外す。以降この particle にイベントは届かない
                for handle in &handles {
                    handle.detach();
                }
                if was_started {
                    if let Err(failure) = this.particle.on_shutdown().await {
                        eprintln!(
                            "[arclet] particle '{}' failed during shutdown: {failure}",
                            this.spec.particle_name
                        );
                    }
                }
                {
                    let mut inner = this.lock();
                    if was_started || inner.state.kind() == ParticleStateKind::Stopped {
                        inner.state = ParticleState::STOPPED;
                    }
                    inner.awaiting_ready.clear();
                    inner.desynced.clear();
                    for waiter in inner.ready_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
                this.fire_transition();
            })
            .await;
    }

    /// ストレージイベントの着地点。scheduler 上で呼ばれる。
    async fn notify(self: &Arc<Self>, event: StorageEvent, handle_name: &str) {
        {
            let inner = self.lock();
            match inner.state.kind() {
                ParticleStateKind::Waiting
                | ParticleStateKind::Running
                | ParticleStateKind::Desynced => {}
                // 停止・失敗後にキューに残っていたイベントは捨てる
                ParticleStateKind::Stopped
                | ParticleStateKind::Failed
                | ParticleStateKind::FailedNeverStarted
                | ParticleStateKind::MaxFailed => return,
                ParticleStateKind::Instantiated | ParticleStateKind::FirstStart => panic!(
                    "storage event {event:?} delivered to particle '{}' in state {}",
                    self.spec.particle_name, inner.state,
                ),
            }
        }

        match event {
            StorageEvent::Ready => {
                let fire = {
                    let mut inner = self.lock();
                    inner.awaiting_ready.remove(handle_name);
                    inner.awaiting_ready.is_empty()
                        && inner.state.kind() == ParticleStateKind::Waiting
                };
                if fire {
                    self.move_to_running().await;
                }
            }
            StorageEvent::Update => {
                let deliver = self.lock().awaiting_ready.is_empty();
                if deliver {
                    if let Err(failure) = self.particle.on_update(handle_name).await {
                        self.record_failure(failure);
                    }
                }
            }
            StorageEvent::Desync => {
                // Waiting 中の desync でもエピソードは始まる。Running
                // 限定にすると最初の 1 個が握りつぶされ、以降も二度と
                // 発火しない
                let first = {
                    let mut inner = self.lock();
                    let was_clean = inner.desynced.is_empty();
                    inner.desynced.insert(handle_name.to_string());
                    was_clean
                };
                if first {
                    self.lock().state = ParticleState::DESYNCED;
                    self.fire_transition();
                    if let Err(failure) = self.particle.on_desync().await {
                        self.record_failure(failure);
                    }
                }
            }
            StorageEvent::Resync => {
                let last = {
                    let mut inner = self.lock();
                    inner.desynced.remove(handle_name);
                    inner.desynced.is_empty()
                        && inner.state.kind() == ParticleStateKind::Desynced
                };
                if last {
                    match self.particle.on_resync().await {
                        Ok(()) => {
                            self.lock().state = ParticleState::RUNNING;
                            self.fire_transition();
                        }
                        Err(failure) => self.record_failure(failure),
                    }
                }
            }
        }
    }

    async fn move_to_running(self: &Arc<Self>) {
        match self.particle.on_ready().await {
            Ok(()) => {
                {
                    let mut inner = self.lock();
                    inner.state = ParticleState::RUNNING;
                    inner.consecutive_failures = 0;
                    for waiter in inner.ready_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
                self.fire_transition();
            }
            Err(failure) => self.record_failure(failure),
        }
    }

    fn record_failure(&self, failure: ParticleFailure) {
        eprintln!(
            "[arclet] particle '{}' failed: {failure}",
            self.spec.particle_name
        );
        {
            let mut inner = self.lock();
            inner.consecutive_failures += 1;
            inner.state = if inner.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                ParticleState::max_failed_with(failure.to_string())
            } else if inner.has_been_started {
                ParticleState::failed_with(failure.to_string())
            } else {
                ParticleState::failed_never_started_with(failure.to_string())
            };
            for waiter in inner.ready_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
        self.fire_transition();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::{ContainerType, HandleMode};
    use crate::storage::key::StorageKey;
    use crate::storage::proxy::StorageProxy;
    use crate::storage::ramdisk::RamDiskStorageManager;
    use crate::time::SystemClock;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    struct TestParticle {
        log: Arc<StdMutex<Vec<String>>>,
        fail_hooks: StdMutex<HashSet<&'static str>>,
    }

    impl TestParticle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Arc::new(StdMutex::new(Vec::new())),
                fail_hooks: StdMutex::new(HashSet::new()),
            })
        }

        fn fail_on(self: &Arc<Self>, hook: &'static str) {
            self.fail_hooks.lock().unwrap().insert(hook);
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, hook: &'static str) -> Result<(), ParticleFailure> {
            self.log.lock().unwrap().push(hook.to_string());
            if self.fail_hooks.lock().unwrap().contains(hook) {
                Err(ParticleFailure::new(hook, "injected"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Particle for TestParticle {
        async fn on_first_start(&self) -> Result<(), ParticleFailure> {
            self.record("on_first_start")
        }
        async fn on_start(&self) -> Result<(), ParticleFailure> {
            self.record("on_start")
        }
        async fn on_ready(&self) -> Result<(), ParticleFailure> {
            self.record("on_ready")
        }
        async fn on_update(&self, _handle_name: &str) -> Result<(), ParticleFailure> {
            self.record("on_update")
        }
        async fn on_desync(&self) -> Result<(), ParticleFailure> {
            self.record("on_desync")
        }
        async fn on_resync(&self) -> Result<(), ParticleFailure> {
            self.record("on_resync")
        }
        async fn on_shutdown(&self) -> Result<(), ParticleFailure> {
            self.record("on_shutdown")
        }
    }

    fn spec(name: &str) -> ParticleSpec {
        ParticleSpec {
            particle_name: name.into(),
            location: format!("test.{name}"),
            connections: BTreeMap::new(),
        }
    }

    fn context(particle: Arc<TestParticle>, scheduler: &Scheduler) -> Arc<ParticleContext> {
        Arc::new(ParticleContext::new(particle, spec("P"), scheduler.clone()))
    }

    async fn readable_handle(
        manager: &RamDiskStorageManager,
        scheduler: &Scheduler,
        unique: &str,
        mode: HandleMode,
    ) -> Arc<Handle> {
        let proxy = StorageProxy::connect(
            StorageKey::ramdisk(unique),
            ContainerType::Singleton,
            scheduler.clone(),
            manager,
        )
        .await
        .unwrap();
        Arc::new(Handle::new(
            unique.into(),
            "P".into(),
            mode,
            None,
            Arc::new(SystemClock),
            proxy,
        ))
    }

    async fn settle(scheduler: &Scheduler) {
        for _ in 0..4 {
            scheduler.wait_for_idle().await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn write_only_particle_runs_without_waiting_for_sync() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(Arc::clone(&particle), &scheduler);

        ctx.init_particle().await;
        ctx.run_particle().await;

        assert_eq!(ctx.state(), ParticleState::RUNNING);
        assert_eq!(particle.calls(), vec!["on_first_start", "on_start", "on_ready"]);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn readable_particle_waits_for_initial_sync() {
        let manager = RamDiskStorageManager::new();
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(Arc::clone(&particle), &scheduler);
        let handle = readable_handle(&manager, &scheduler, "h", HandleMode::ReadWrite).await;
        ctx.register_handle("h", Arc::clone(&handle)).unwrap();

        ctx.init_particle().await;
        assert_eq!(ctx.state(), ParticleState::WAITING);
        assert!(!particle.calls().contains(&"on_ready".to_string()));

        ctx.run_particle().await;
        settle(&scheduler).await;
        assert_eq!(ctx.state(), ParticleState::RUNNING);
        assert_eq!(particle.calls(), vec!["on_first_start", "on_start", "on_ready"]);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn first_start_fires_exactly_once_across_restarts() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(Arc::clone(&particle), &scheduler);

        ctx.init_particle().await;
        ctx.run_particle().await;
        ctx.stop_particle().await;
        assert_eq!(ctx.state(), ParticleState::STOPPED);

        ctx.init_particle().await;
        ctx.run_particle().await;

        let first_starts = particle
            .calls()
            .iter()
            .filter(|c| *c == "on_first_start")
            .count();
        assert_eq!(first_starts, 1);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn restored_started_state_skips_on_first_start() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = Arc::new(ParticleContext::with_state(
            Arc::clone(&particle) as Arc<dyn Particle>,
            spec("P"),
            scheduler.clone(),
            ParticleState::STOPPED,
            0,
        ));

        ctx.init_particle().await;
        ctx.run_particle().await;

        assert_eq!(ctx.state(), ParticleState::RUNNING);
        assert_eq!(particle.calls(), vec!["on_start", "on_ready"]);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn failure_before_first_start_is_failed_never_started() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        particle.fail_on("on_first_start");
        let ctx = context(Arc::clone(&particle), &scheduler);

        ctx.init_particle().await;
        let state = ctx.state();
        assert_eq!(state.kind(), ParticleStateKind::FailedNeverStarted);
        assert!(!ctx.has_been_started());
        scheduler.close().await;
    }

    #[tokio::test]
    async fn stop_preserves_failed_never_started() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        particle.fail_on("on_first_start");
        let ctx = context(Arc::clone(&particle), &scheduler);

        ctx.init_particle().await;
        assert_eq!(ctx.state().kind(), ParticleStateKind::FailedNeverStarted);

        // stop が Stopped に上書きすると「起動済み」として復元されてしまう
        ctx.stop_particle().await;
        assert_eq!(ctx.state().kind(), ParticleStateKind::FailedNeverStarted);
        assert!(!ctx.has_been_started());

        // 次の起動では on_first_start がもう一度試される
        particle.fail_hooks.lock().unwrap().clear();
        ctx.init_particle().await;
        let first_starts = particle
            .calls()
            .iter()
            .filter(|c| *c == "on_first_start")
            .count();
        assert_eq!(first_starts, 2);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn desync_while_waiting_still_opens_an_episode() {
        let manager = RamDiskStorageManager::new();
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(Arc::clone(&particle), &scheduler);
        let handle = readable_handle(&manager, &scheduler, "h", HandleMode::ReadWrite).await;
        ctx.register_handle("h", handle).unwrap();

        ctx.init_particle().await;
        assert_eq!(ctx.state(), ParticleState::WAITING);

        ctx.notify(StorageEvent::Desync, "h").await;
        assert_eq!(ctx.state().kind(), ParticleStateKind::Desynced);
        assert_eq!(
            particle.calls().iter().filter(|c| *c == "on_desync").count(),
            1
        );

        ctx.notify(StorageEvent::Resync, "h").await;
        assert_eq!(
            particle.calls().iter().filter(|c| *c == "on_resync").count(),
            1
        );
        scheduler.close().await;
    }

    #[tokio::test]
    async fn transition_hook_fires_on_failures_and_state_changes() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        particle.fail_on("on_start");
        let ctx = context(Arc::clone(&particle), &scheduler);

        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        ctx.on_transition(Arc::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        // on_start の失敗（Failed への遷移）でフックが引かれる
        ctx.init_particle().await;
        let after_failure = fired.load(std::sync::atomic::Ordering::SeqCst);
        assert!(after_failure > 0);

        particle.fail_hooks.lock().unwrap().clear();
        ctx.init_particle().await;
        ctx.run_particle().await;
        assert_eq!(ctx.state(), ParticleState::RUNNING);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst) > after_failure);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn crash_loop_breaker_reaches_terminal_max_failed() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        particle.fail_on("on_start");
        let ctx = context(Arc::clone(&particle), &scheduler);

        // 失敗しても Failed 系からは再 init できる。閾値を超えたら終端
        for _ in 0..(MAX_CONSECUTIVE_FAILURES + 1) {
            ctx.init_particle().await;
        }
        assert_eq!(ctx.state().kind(), ParticleStateKind::MaxFailed);
        assert_eq!(ctx.consecutive_failures(), MAX_CONSECUTIVE_FAILURES + 1);

        // 停止しても MaxFailed のまま
        ctx.stop_particle().await;
        assert_eq!(ctx.state().kind(), ParticleStateKind::MaxFailed);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        particle.fail_on("on_start");
        let ctx = context(Arc::clone(&particle), &scheduler);

        ctx.init_particle().await;
        assert_eq!(ctx.consecutive_failures(), 1);

        particle.fail_hooks.lock().unwrap().clear();
        ctx.init_particle().await;
        ctx.run_particle().await;
        assert_eq!(ctx.state(), ParticleState::RUNNING);
        assert_eq!(ctx.consecutive_failures(), 0);
        scheduler.close().await;
    }

    #[tokio::test]
    #[should_panic(expected = "initParticle")]
    async fn init_from_running_is_a_precondition_violation() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(particle, &scheduler);
        ctx.init_particle().await;
        ctx.run_particle().await;
        // Running からの init は許されない
        ctx.init_particle().await;
    }

    #[tokio::test]
    #[should_panic(expected = "runParticle")]
    async fn run_before_init_is_a_precondition_violation() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(particle, &scheduler);
        ctx.run_particle().await;
    }

    #[tokio::test]
    async fn desync_and_resync_hooks_fire_once_per_episode() {
        let manager = RamDiskStorageManager::new();
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(Arc::clone(&particle), &scheduler);
        let h1 = readable_handle(&manager, &scheduler, "h1", HandleMode::ReadWrite).await;
        let h2 = readable_handle(&manager, &scheduler, "h2", HandleMode::ReadWrite).await;
        ctx.register_handle("h1", h1).unwrap();
        ctx.register_handle("h2", h2).unwrap();
        ctx.init_particle().await;
        ctx.run_particle().await;
        settle(&scheduler).await;
        assert_eq!(ctx.state(), ParticleState::RUNNING);

        // 2 本目の desync は追加のフックを出さない
        ctx.notify(StorageEvent::Desync, "h1").await;
        ctx.notify(StorageEvent::Desync, "h2").await;
        assert_eq!(ctx.state(), ParticleState::DESYNCED);

        // 片方だけ戻っても resync はまだ
        ctx.notify(StorageEvent::Resync, "h1").await;
        assert_eq!(ctx.state(), ParticleState::DESYNCED);
        ctx.notify(StorageEvent::Resync, "h2").await;
        assert_eq!(ctx.state(), ParticleState::RUNNING);

        let calls = particle.calls();
        assert_eq!(calls.iter().filter(|c| *c == "on_desync").count(), 1);
        assert_eq!(calls.iter().filter(|c| *c == "on_resync").count(), 1);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn updates_are_suppressed_until_all_handles_are_ready() {
        let manager = RamDiskStorageManager::new();
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(Arc::clone(&particle), &scheduler);
        let h1 = readable_handle(&manager, &scheduler, "h1", HandleMode::ReadWrite).await;
        let h2 = readable_handle(&manager, &scheduler, "h2", HandleMode::ReadWrite).await;
        ctx.register_handle("h1", h1).unwrap();
        ctx.register_handle("h2", h2).unwrap();
        ctx.init_particle().await;

        // h2 がまだ同期していない間の UPDATE は届かない
        ctx.notify(StorageEvent::Ready, "h1").await;
        ctx.notify(StorageEvent::Update, "h1").await;
        assert!(!particle.calls().contains(&"on_update".to_string()));

        ctx.notify(StorageEvent::Ready, "h2").await;
        ctx.notify(StorageEvent::Update, "h1").await;
        assert!(particle.calls().contains(&"on_update".to_string()));
        scheduler.close().await;
    }

    #[tokio::test]
    async fn events_after_stop_are_dropped() {
        let scheduler = Scheduler::new();
        let particle = TestParticle::new();
        let ctx = context(Arc::clone(&particle), &scheduler);
        ctx.init_particle().await;
        ctx.run_particle().await;
        ctx.stop_particle().await;

        ctx.notify(StorageEvent::Update, "h").await;
        assert!(!particle.calls().contains(&"on_update".to_string()));
        scheduler.close().await;
    }
}
