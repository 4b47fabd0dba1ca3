//! Resurrector - 休眠ホストの呼び起こし
//!
//! arc は停止中でも「この storage key が変わったら起こしてくれ」という
//! 登録を残せる。storage 側の変更通知が `on_resurrected_internal` に
//! 届くと、監視キー集合が交差するすべての arc について、登録済みの
//! コールバック全員を呼ぶ。
//!
//! コールバックは同期で受け、ホスト側の再起動（async）は受け手が
//! spawn する。[`watch_host`] がその定型を用意する。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::domain::ids::ArcId;
use crate::host::arc_host::ResurrectableHost;
use crate::storage::key::StorageKey;

/// (arc_id, 変更があった監視キー) を受けるコールバック。
pub type ResurrectionCallback = Arc<dyn Fn(&ArcId, &[StorageKey]) + Send + Sync>;

#[derive(Default)]
struct Inner {
    /// arc_id → 監視キー集合。
    watches: HashMap<ArcId, HashSet<StorageKey>>,
    /// host_id → コールバック。登録順に呼ぶ。
    callbacks: Vec<(String, ResurrectionCallback)>,
}

#[derive(Default)]
pub struct Resurrector {
    inner: Mutex<Inner>,
}

impl Resurrector {
    pub fn new() -> Self {
        Self::default()
    }

    /// arc の監視キーを登録する。再登録は集合を置き換える。
    pub fn request_resurrection(&self, arc_id: ArcId, keys: Vec<StorageKey>) {
        let mut inner = self.lock();
        inner.watches.insert(arc_id, keys.into_iter().collect());
    }

    pub fn cancel_resurrection(&self, arc_id: &ArcId) {
        self.lock().watches.remove(arc_id);
    }

    /// ホスト（の代理コールバック）を登録する。同じ host_id は一件だけ。
    pub fn on_resurrection(&self, host_id: impl Into<String>, callback: ResurrectionCallback) {
        let host_id = host_id.into();
        let mut inner = self.lock();
        if inner.callbacks.iter().any(|(id, _)| *id == host_id) {
            return;
        }
        inner.callbacks.push((host_id, callback));
    }

    pub fn remove_host(&self, host_id: &str) {
        self.lock().callbacks.retain(|(id, _)| id != host_id);
    }

    /// [`ResurrectableHost`] をそのまま繋ぐ定型。通知のたびに
    /// `on_resurrected` を別タスクで起動する。
    pub fn watch_host(&self, host: Arc<dyn ResurrectableHost>) {
        let host_id = host.host_id().to_string();
        self.on_resurrection(
            host_id.clone(),
            Arc::new(move |arc_id, keys| {
                let host = Arc::clone(&host);
                let arc_id = arc_id.clone();
                let keys = keys.to_vec();
                tokio::spawn(async move {
                    if let Err(e) = host.on_resurrected(&arc_id, &keys).await {
                        eprintln!(
                            "[arclet] resurrection of arc '{arc_id}' on host '{}' failed: {e}",
                            host.host_id()
                        );
                    }
                });
            }),
        );
    }

    /// storage 変更の着地点。監視集合と交差するすべての arc について、
    /// 登録済みコールバック全員に (arc_id, 交差したキー) を届ける。
    pub fn on_resurrected_internal(&self, changed_keys: &[StorageKey]) {
        let matches: Vec<(ArcId, Vec<StorageKey>)> = {
            let inner = self.lock();
            inner
                .watches
                .iter()
                .filter_map(|(arc_id, watched)| {
                    let hit: Vec<StorageKey> = changed_keys
                        .iter()
                        .filter(|k| watched.contains(k))
                        .cloned()
                        .collect();
                    if hit.is_empty() {
                        None
                    } else {
                        Some((arc_id.clone(), hit))
                    }
                })
                .collect()
        };
        let callbacks: Vec<ResurrectionCallback> = {
            let inner = self.lock();
            inner.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for (arc_id, keys) in &matches {
            for callback in &callbacks {
                callback(arc_id, keys);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("resurrector lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn key(unique: &str) -> StorageKey {
        StorageKey::ramdisk(unique)
    }

    fn recording(
        resurrector: &Resurrector,
        host_id: &str,
    ) -> Arc<StdMutex<Vec<(ArcId, Vec<StorageKey>)>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        resurrector.on_resurrection(
            host_id,
            Arc::new(move |arc_id, keys| {
                sink.lock().unwrap().push((arc_id.clone(), keys.to_vec()));
            }),
        );
        log
    }

    #[test]
    fn only_arcs_with_intersecting_watch_sets_are_woken() {
        let resurrector = Resurrector::new();
        let log = recording(&resurrector, "host0");
        let a = ArcId::from_string("!1:a");
        let b = ArcId::from_string("!1:b");
        resurrector.request_resurrection(a.clone(), vec![key("x"), key("y")]);
        resurrector.request_resurrection(b, vec![key("z")]);

        resurrector.on_resurrected_internal(&[key("y"), key("unrelated")]);

        let calls = log.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, a);
        assert_eq!(calls[0].1, vec![key("y")]);
    }

    #[test]
    fn every_registered_callback_fires_per_match() {
        let resurrector = Resurrector::new();
        let log1 = recording(&resurrector, "host1");
        let log2 = recording(&resurrector, "host2");
        let a = ArcId::from_string("!1:a");
        resurrector.request_resurrection(a, vec![key("x")]);

        resurrector.on_resurrected_internal(&[key("x")]);
        assert_eq!(log1.lock().unwrap().len(), 1);
        assert_eq!(log2.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancelled_watches_stay_silent() {
        let resurrector = Resurrector::new();
        let log = recording(&resurrector, "host0");
        let a = ArcId::from_string("!1:a");
        resurrector.request_resurrection(a.clone(), vec![key("x")]);
        resurrector.cancel_resurrection(&a);

        resurrector.on_resurrected_internal(&[key("x")]);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn re_registration_replaces_the_watch_set() {
        let resurrector = Resurrector::new();
        let log = recording(&resurrector, "host0");
        let a = ArcId::from_string("!1:a");
        resurrector.request_resurrection(a.clone(), vec![key("old")]);
        resurrector.request_resurrection(a, vec![key("new")]);

        resurrector.on_resurrected_internal(&[key("old")]);
        assert!(log.lock().unwrap().is_empty());
        resurrector.on_resurrected_internal(&[key("new")]);
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
