//! Scheduler - arc ごとの単一実行ストリーム
//!
//! どの物理スレッドから投入されても、ひとつの arc のタスクは必ず一本の
//! consumer タスク上で逐次実行される。ParticleContext や StorageProxy の
//! 変更が single-writer になるのはこの仕組みによる。
//!
//! # タスクの種類
//! - **Processor**: CRDT モデルのマージなど、状態を前に進める処理
//! - **Listener**: particle / handle への通知コールバック
//!
//! バッチ内では Processor が Listener より先に走る。通知が発火する時点で
//! 対応するマージが必ず適用済みになるようにするため。
//!
//! # 学習ポイント
//! - `mpsc::unbounded_channel` + 単一 consumer で「論理スレッド」を作る
//! - `watch` で idle / pause / shutdown の各状態を配る。受信者がいない
//!   瞬間でも値が残るよう、更新は `send` ではなく `send_replace` で行う
//! - `oneshot` で「scheduler 上で実行して結果を返してもらう」

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub enum Task {
    Processor(Work),
    Listener {
        /// 通常は storage key。close 時の診断に使う。
        namespace: String,
        /// 通常は handle 名。
        name: String,
        work: Work,
    },
}

impl Task {
    pub fn processor<F>(fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Task::Processor(Box::pin(fut))
    }

    pub fn listener<F>(namespace: impl Into<String>, name: impl Into<String>, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Task::Listener {
            namespace: namespace.into(),
            name: name.into(),
            work: Box::pin(fut),
        }
    }
}

struct Shared {
    pending: AtomicUsize,
    closed: AtomicBool,
    idle_tx: watch::Sender<bool>,
    pause_tx: watch::Sender<bool>,
}

/// ひとつの arc のタスクストリーム。clone して各 proxy / context に配る。
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Task>,
    shared: Arc<Shared>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Task>();
        let (idle_tx, _) = watch::channel(true);
        let (pause_tx, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            idle_tx,
            pause_tx,
        });

        let join = tokio::spawn(consumer_loop(rx, Arc::clone(&shared), shutdown_rx));

        Self {
            tx,
            shared,
            shutdown_tx: Arc::new(shutdown_tx),
            join: Arc::new(Mutex::new(Some(join))),
        }
    }

    /// タスクを投入する。close 済みなら捨てて false を返す。
    pub fn schedule(&self, task: Task) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.idle_tx.send_replace(false);
        if self.tx.send(task).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// クロージャを scheduler 上で実行し、結果を受け取る。
    ///
    /// proxy / context の状態に触る読み書きはすべてこれ経由にすることで
    /// single-writer が守られる。close 済みなら `None`。
    pub async fn run<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let scheduled = self.schedule(Task::processor(async move {
            // 受け手が run の await を諦めていても実行自体は完了させる
            let _ = tx.send(f());
        }));
        if !scheduled {
            return None;
        }
        rx.await.ok()
    }

    /// 非同期処理を scheduler 上で実行し、結果を受け取る。
    /// particle のライフサイクルフックなど await を含む処理はこちら。
    pub async fn run_async<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let scheduled = self.schedule(Task::processor(async move {
            let _ = tx.send(fut.await);
        }));
        if !scheduled {
            return None;
        }
        rx.await.ok()
    }

    /// 投入済みタスクがすべて実行し終わるまで待つ。
    pub async fn wait_for_idle(&self) {
        let mut rx = self.shared.idle_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// 実行を一時停止する。投入は引き続き受け付ける。
    pub fn pause(&self) {
        self.shared.pause_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.shared.pause_tx.send_replace(false);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// scheduler を閉じる。キューに残ったタスクは実行されずに破棄される。
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        // pause 中でも consumer が select で目を覚ませるよう resume しておく
        self.shared.pause_tx.send_replace(false);
        let join = self.join.lock().expect("scheduler join lock poisoned").take();
        if let Some(join) = join {
            let _ = join.await;
        }
        self.shared.idle_tx.send_replace(true);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn consumer_loop(
    mut rx: mpsc::UnboundedReceiver<Task>,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let first = tokio::select! {
            _ = shutdown_rx.changed() => continue,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        // pause 中は実行を止める（キューは溜まる）
        {
            let mut pause_rx = shared.pause_tx.subscribe();
            while *pause_rx.borrow_and_update() {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    changed = pause_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }

        // 今キューにある分をバッチとして吸い上げ、Processor を先に流す
        let mut batch = vec![first];
        while let Ok(task) = rx.try_recv() {
            batch.push(task);
        }

        let mut listeners = Vec::new();
        for task in batch {
            match task {
                Task::Processor(work) => {
                    work.await;
                    finish_one(&shared, &rx);
                }
                listener @ Task::Listener { .. } => listeners.push(listener),
            }
        }
        for task in listeners {
            if let Task::Listener { work, .. } = task {
                work.await;
                finish_one(&shared, &rx);
            }
        }
    }

    // shutdown: 残タスクはコールバックを届けずに破棄
    rx.close();
    while rx.try_recv().is_ok() {
        shared.pending.fetch_sub(1, Ordering::AcqRel);
    }
    if shared.pending.load(Ordering::Acquire) == 0 {
        shared.idle_tx.send_replace(true);
    }
}

fn finish_one(shared: &Shared, rx: &mpsc::UnboundedReceiver<Task>) {
    let remaining = shared.pending.fetch_sub(1, Ordering::AcqRel) - 1;
    if remaining == 0 && rx.is_empty() {
        shared.idle_tx.send_replace(true);
    }
}

/// arc ごとの scheduler を払い出し、ホスト終了時に一括で閉じる。
#[derive(Default)]
pub struct SchedulerProvider {
    live: Mutex<Vec<Scheduler>>,
}

impl SchedulerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduler_for_arc(&self) -> Scheduler {
        let scheduler = Scheduler::new();
        self.live
            .lock()
            .expect("scheduler provider lock poisoned")
            .push(scheduler.clone());
        scheduler
    }

    pub async fn cancel_all(&self) {
        let live = std::mem::take(
            &mut *self.live.lock().expect("scheduler provider lock poisoned"),
        );
        for scheduler in live {
            scheduler.close().await;
        }
    }
}
