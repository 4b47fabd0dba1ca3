//! HostRegistry - 利用可能な ArcHost の台帳
//!
//! allocator はここから見えるホストにしか particle を割り当てない。
//! 登録順は partition の決定性に効くので、必ず保存する
//! （先に登録されたホストが優先される）。
//!
//! グローバルシングルトンにはしない。プロセス起動時に作り、allocator へ
//! 値として渡す。

use std::sync::{Arc, Mutex};

use crate::host::arc_host::ArcHost;

pub trait HostRegistry: Send + Sync {
    /// 登録順のホスト一覧。
    fn available_arc_hosts(&self) -> Vec<Arc<dyn ArcHost>>;

    fn register_host(&self, host: Arc<dyn ArcHost>);

    fn unregister_host(&self, host_id: &str);
}

/// 呼び出し側が明示的にホストを並べる台帳。
#[derive(Default)]
pub struct ExplicitHostRegistry {
    hosts: Mutex<Vec<Arc<dyn ArcHost>>>,
}

impl ExplicitHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostRegistry for ExplicitHostRegistry {
    fn available_arc_hosts(&self) -> Vec<Arc<dyn ArcHost>> {
        self.hosts.lock().expect("registry lock poisoned").clone()
    }

    fn register_host(&self, host: Arc<dyn ArcHost>) {
        let mut hosts = self.hosts.lock().expect("registry lock poisoned");
        // 同じ host_id の二重登録は最初の一件が勝つ
        if hosts.iter().any(|h| h.host_id() == host.host_id()) {
            return;
        }
        hosts.push(host);
    }

    fn unregister_host(&self, host_id: &str) {
        self.hosts
            .lock()
            .expect("registry lock poisoned")
            .retain(|h| h.host_id() != host_id);
    }
}

/// 起動時にカタログから組み立てる台帳。タグでホストを引ける。
/// リフレクションやアノテーション走査の代わりに、(tags → host) の
/// 明示テーブルをデータとして渡す。
pub struct DiscoveryHostRegistry {
    entries: Mutex<Vec<CatalogEntry>>,
}

struct CatalogEntry {
    tags: Vec<String>,
    host: Arc<dyn ArcHost>,
}

impl DiscoveryHostRegistry {
    pub fn from_catalog(catalog: Vec<(Vec<String>, Arc<dyn ArcHost>)>) -> Self {
        Self {
            entries: Mutex::new(
                catalog
                    .into_iter()
                    .map(|(tags, host)| CatalogEntry { tags, host })
                    .collect(),
            ),
        }
    }

    /// 指定タグを持つホストだけを、登録順で返す。
    pub fn hosts_tagged(&self, tag: &str) -> Vec<Arc<dyn ArcHost>> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .filter(|e| e.tags.iter().any(|t| t == tag))
            .map(|e| Arc::clone(&e.host))
            .collect()
    }
}

impl HostRegistry for DiscoveryHostRegistry {
    fn available_arc_hosts(&self) -> Vec<Arc<dyn ArcHost>> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .map(|e| Arc::clone(&e.host))
            .collect()
    }

    fn register_host(&self, host: Arc<dyn ArcHost>) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.iter().any(|e| e.host.host_id() == host.host_id()) {
            return;
        }
        entries.push(CatalogEntry {
            tags: Vec::new(),
            host,
        });
    }

    fn unregister_host(&self, host_id: &str) {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .retain(|e| e.host.host_id() != host_id);
    }
}
