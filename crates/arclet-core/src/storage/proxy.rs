//! StorageProxy - store とコンシューマの橋渡し
//!
//! handle の読み書きの背後でローカルレプリカを持ち、store との同期状態を
//! 追跡する。通知はすべて arc の [`Scheduler`] を経由して届くので、
//! コンシューマ側（ParticleContext）から見ると single-thread に見える。
//!
//! # 状態遷移
//! ```text
//! NoSync --prepare_for_sync--> ReadyToSync --maybe_initiate_sync--> AwaitingSync
//! AwaitingSync --ModelUpdate--> Synced          （READY 通知）
//! Synced --適用できない op--> Desynced           （DESYNC 通知 + SyncRequest）
//! Desynced --ModelUpdate--> Synced               （RESYNC 通知）
//! 任意 --close--> Closed
//! ```
//!
//! 同期前に届いた Operations は stash に積み、初回 ModelUpdate の後に
//! 「まだモデルに織り込まれていないものだけ」適用する。同期前の UPDATE
//! 通知は出さない（particle はまだ最初の全体像を見ていない）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ulid::Ulid;

use crate::domain::plan::{ContainerType, RawEntity};
use crate::error::{HandleError, StorageError};
use crate::scheduler::{Scheduler, Task};
use crate::storage::crdt::{CrdtModel, CrdtOperation};
use crate::storage::endpoint::{
    ProxyMessage, StorageEndpoint, StorageEndpointManager, StoreOptions,
};
use crate::storage::key::StorageKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    NoSync,
    ReadyToSync,
    AwaitingSync,
    Synced,
    Desynced,
    Closed,
}

impl ProxyState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyState::NoSync => "NO_SYNC",
            ProxyState::ReadyToSync => "READY_TO_SYNC",
            ProxyState::AwaitingSync => "AWAITING_SYNC",
            ProxyState::Synced => "SYNCED",
            ProxyState::Desynced => "DESYNCED",
            ProxyState::Closed => "CLOSED",
        }
    }
}

/// proxy からコンシューマへ上がる粗粒度イベント。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEvent {
    Ready,
    Update,
    Desync,
    Resync,
}

/// (namespace, name) 付きで登録されるイベント受け口。
/// scheduler の Listener タスクとして呼ばれる。
pub type StorageEventCallback = Arc<dyn Fn(StorageEvent) + Send + Sync>;

struct ProxyInner {
    state: ProxyState,
    model: CrdtModel,
    stash: Vec<CrdtOperation>,
    listeners: HashMap<(String, String), StorageEventCallback>,
    endpoint: Option<Arc<dyn StorageEndpoint>>,
}

/// ひとつの (storage key, container shape) に対するローカルレプリカ。
/// HandleManager が key ごとに一個だけ作り、handle 間で共有される。
pub struct StorageProxy {
    key: StorageKey,
    container: ContainerType,
    /// このレプリカの CRDT actor 名。
    actor: String,
    scheduler: Scheduler,
    inner: Arc<Mutex<ProxyInner>>,
}

impl StorageProxy {
    /// store へ接続した proxy を作る。
    pub async fn connect(
        key: StorageKey,
        container: ContainerType,
        scheduler: Scheduler,
        manager: &dyn StorageEndpointManager,
    ) -> Result<Arc<StorageProxy>, StorageError> {
        let inner = Arc::new(Mutex::new(ProxyInner {
            state: ProxyState::NoSync,
            model: CrdtModel::new(container),
            stash: Vec::new(),
            listeners: HashMap::new(),
            endpoint: None,
        }));

        // store からの折り返しは任意のスレッドで届くので、必ず scheduler の
        // Processor として載せ直してから状態に触る
        let callback_inner = Arc::clone(&inner);
        let callback_scheduler = scheduler.clone();
        let callback: crate::storage::endpoint::ProxyCallback = Arc::new(move |message| {
            let inner = Arc::clone(&callback_inner);
            let scheduler = callback_scheduler.clone();
            let task_scheduler = scheduler.clone();
            scheduler.schedule(Task::processor(async move {
                process_store_message(&inner, &task_scheduler, message);
            }));
        });

        let endpoint = manager
            .get(
                StoreOptions {
                    storage_key: key.clone(),
                    container,
                },
                callback,
            )
            .await?;
        let endpoint: Arc<dyn StorageEndpoint> = Arc::from(endpoint);
        inner
            .lock()
            .expect("proxy lock poisoned")
            .endpoint
            .replace(Arc::clone(&endpoint));

        Ok(Arc::new(StorageProxy {
            key,
            container,
            actor: Ulid::new().to_string(),
            scheduler,
            inner,
        }))
    }

    pub fn storage_key(&self) -> &StorageKey {
        &self.key
    }

    pub fn container(&self) -> ContainerType {
        self.container
    }

    pub fn state(&self) -> ProxyState {
        self.inner.lock().expect("proxy lock poisoned").state
    }

    /// 同期する意思を宣言する（NoSync → ReadyToSync）。readable handle の
    /// 作成時に呼ばれる。sync 自体は [`Self::maybe_initiate_sync`] で。
    pub fn prepare_for_sync(&self) {
        let mut inner = self.inner.lock().expect("proxy lock poisoned");
        if inner.state == ProxyState::NoSync {
            inner.state = ProxyState::ReadyToSync;
        }
    }

    /// イベント購読を登録する。proxy が既に SYNCED なら、この購読者に
    /// だけ READY を即座に届ける（同じ key の proxy を複数 particle が
    /// 共有するとき、後から来た方も READY を取りこぼさない）。
    pub fn register_for_storage_events(
        &self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        callback: StorageEventCallback,
    ) {
        let namespace = namespace.into();
        let name = name.into();
        let mut inner = self.inner.lock().expect("proxy lock poisoned");
        let already_synced = inner.state == ProxyState::Synced;
        inner
            .listeners
            .insert((namespace.clone(), name.clone()), Arc::clone(&callback));
        if inner.state == ProxyState::NoSync {
            inner.state = ProxyState::ReadyToSync;
        }
        drop(inner);
        if already_synced {
            self.scheduler.schedule(Task::listener(namespace, name, async move {
                callback(StorageEvent::Ready);
            }));
        }
    }

    pub fn remove_callbacks_for(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().expect("proxy lock poisoned");
        let key = (namespace.to_string(), name.to_string());
        inner.listeners.remove(&key);
    }

    /// 初回同期を仕掛ける。ReadyToSync のときだけ SyncRequest を送る
    /// （それ以外では no-op なので何度呼んでもよい）。
    pub fn maybe_initiate_sync(&self) {
        let mut inner = self.inner.lock().expect("proxy lock poisoned");
        if inner.state != ProxyState::ReadyToSync {
            return;
        }
        inner.state = ProxyState::AwaitingSync;
        if let Some(endpoint) = inner.endpoint.clone() {
            drop(inner);
            if endpoint.on_proxy_message(ProxyMessage::SyncRequest).is_err() {
                self.inner.lock().expect("proxy lock poisoned").state = ProxyState::Closed;
            }
        }
    }

    /// singleton の現在値。SYNCED 前の読み出しはエラー。
    ///
    /// 読み書きは inner の mutex の下で直接行う。particle フックは
    /// scheduler 上で走っているので、ここで scheduler に積み直すと
    /// 自分自身を待つことになる。
    pub fn singleton_value(&self) -> Result<Option<RawEntity>, HandleError> {
        let inner = self.inner.lock().expect("proxy lock poisoned");
        match inner.state {
            ProxyState::Synced => Ok(inner.model.singleton_value().cloned()),
            ProxyState::Closed => Err(HandleError::ProxyClosed),
            other => Err(HandleError::NotReady(other.as_str())),
        }
    }

    /// collection の全要素。SYNCED 前の読み出しはエラー。
    pub fn elements(&self) -> Result<Vec<RawEntity>, HandleError> {
        let inner = self.inner.lock().expect("proxy lock poisoned");
        match inner.state {
            ProxyState::Synced => Ok(inner.model.elements().into_iter().cloned().collect()),
            ProxyState::Closed => Err(HandleError::ProxyClosed),
            other => Err(HandleError::NotReady(other.as_str())),
        }
    }

    pub fn set_singleton(&self, value: RawEntity) -> Result<(), HandleError> {
        self.apply_local(|actor, seq| CrdtOperation::SetSingleton { actor, seq, value })
    }

    pub fn clear_singleton(&self) -> Result<(), HandleError> {
        self.apply_local(|actor, seq| CrdtOperation::ClearSingleton { actor, seq })
    }

    pub fn add_element(&self, value: RawEntity) -> Result<(), HandleError> {
        self.apply_local(|actor, seq| CrdtOperation::AddElement { actor, seq, value })
    }

    pub fn remove_element(&self, id: String) -> Result<(), HandleError> {
        self.apply_local(|actor, seq| CrdtOperation::RemoveElement { actor, seq, id })
    }

    /// ローカル適用 + store への転送。seq の採番は mutex の下で行うので
    /// 並行する書き込みが同じ番号を取ることはない。
    fn apply_local<F>(&self, build: F) -> Result<(), HandleError>
    where
        F: FnOnce(String, u64) -> CrdtOperation,
    {
        let mut inner = self.inner.lock().expect("proxy lock poisoned");
        if inner.state == ProxyState::Closed {
            return Err(HandleError::ProxyClosed);
        }
        let seq = inner.model.versions().seq_for(&self.actor) + 1;
        let op = build(self.actor.clone(), seq);
        if !inner.model.apply(&op) {
            return Err(HandleError::OpRejected);
        }
        let endpoint = inner.endpoint.clone();
        drop(inner);
        if let Some(endpoint) = endpoint {
            endpoint
                .on_proxy_message(ProxyMessage::Operations { ops: vec![op] })
                .map_err(|_| HandleError::ProxyClosed)?;
        }
        Ok(())
    }

    /// store 側の処理がこの proxy の送信分に追いつくまで待つ。
    pub async fn idle(&self) {
        let endpoint = {
            let inner = self.inner.lock().expect("proxy lock poisoned");
            inner.endpoint.clone()
        };
        if let Some(endpoint) = endpoint {
            endpoint.idle().await;
        }
    }

    /// proxy を閉じる。以降の読み書きは `ProxyClosed`、store からの通知は
    /// 捨てられる。
    pub async fn close(&self) {
        let endpoint = {
            let mut inner = self.inner.lock().expect("proxy lock poisoned");
            inner.state = ProxyState::Closed;
            inner.listeners.clear();
            inner.endpoint.take()
        };
        if let Some(endpoint) = endpoint {
            endpoint.close().await;
        }
    }
}

/// store からのメッセージ処理本体。scheduler の Processor 上で走る。
fn process_store_message(
    inner: &Arc<Mutex<ProxyInner>>,
    scheduler: &Scheduler,
    message: ProxyMessage,
) {
    let mut guard = inner.lock().expect("proxy lock poisoned");
    if guard.state == ProxyState::Closed {
        return;
    }

    let mut events = Vec::new();
    match message {
        ProxyMessage::ModelUpdate { model } => {
            let changed = guard.model.merge(&model);
            match guard.state {
                ProxyState::AwaitingSync => {
                    guard.state = ProxyState::Synced;
                    let stash = std::mem::take(&mut guard.stash);
                    for op in stash {
                        if !op.already_applied_in(guard.model.versions()) {
                            // FIFO な store 相手なら届かない経路だが、適用
                            // できなければ再同期に回す
                            if !guard.model.apply(&op) {
                                guard.state = ProxyState::Desynced;
                            }
                        }
                    }
                    if guard.state == ProxyState::Synced {
                        events.push(StorageEvent::Ready);
                    } else {
                        events.push(StorageEvent::Desync);
                        request_resync(&mut guard);
                    }
                }
                ProxyState::Desynced => {
                    guard.state = ProxyState::Synced;
                    events.push(StorageEvent::Resync);
                }
                ProxyState::Synced => {
                    if changed {
                        events.push(StorageEvent::Update);
                    }
                }
                // 同期前の一斉配信は黙って取り込むだけ
                ProxyState::NoSync | ProxyState::ReadyToSync | ProxyState::Closed => {}
            }
        }
        ProxyMessage::Operations { ops } => match guard.state {
            ProxyState::Synced => {
                let mut changed = false;
                let mut desynced = false;
                for op in &ops {
                    if op.already_applied_in(guard.model.versions()) {
                        continue;
                    }
                    if guard.model.apply(op) {
                        changed = true;
                    } else {
                        desynced = true;
                        break;
                    }
                }
                if desynced {
                    guard.state = ProxyState::Desynced;
                    events.push(StorageEvent::Desync);
                    request_resync(&mut guard);
                } else if changed {
                    events.push(StorageEvent::Update);
                }
            }
            ProxyState::Desynced => {
                // 再同期待ち。ModelUpdate がすべてを運んでくる
            }
            ProxyState::NoSync | ProxyState::ReadyToSync | ProxyState::AwaitingSync => {
                guard.stash.extend(ops);
            }
            ProxyState::Closed => {}
        },
        // SyncRequest は proxy → store 方向にしか流れない
        ProxyMessage::SyncRequest => {}
    }

    let listeners: Vec<_> = guard
        .listeners
        .iter()
        .map(|((ns, name), cb)| (ns.clone(), name.clone(), Arc::clone(cb)))
        .collect();
    drop(guard);

    for event in events {
        for (ns, name, cb) in &listeners {
            let cb = Arc::clone(cb);
            scheduler.schedule(Task::listener(ns.clone(), name.clone(), async move {
                cb(event);
            }));
        }
    }
}

fn request_resync(guard: &mut ProxyInner) {
    if let Some(endpoint) = &guard.endpoint {
        // 返答の ModelUpdate は Desynced 状態で受けて RESYNC を出す
        if endpoint.on_proxy_message(ProxyMessage::SyncRequest).is_err() {
            guard.state = ProxyState::Closed;
        }
    }
}
