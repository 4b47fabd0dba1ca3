//! HandleManager - handle の工場と proxy の台帳
//!
//! storage key ごとに [`StorageProxy`] を一個だけ作り、handle 間で共有
//! させる。同じ key を singleton と collection の両方で使おうとしたら
//! 設定エラーとして即死させる（実行時に黙って壊れるより良い）。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::domain::plan::{DataType, HandleConnectionSpec};
use crate::error::ConfigError;
use crate::handle::Handle;
use crate::scheduler::Scheduler;
use crate::storage::endpoint::StorageEndpointManager;
use crate::storage::key::StorageKey;
use crate::storage::proxy::StorageProxy;
use crate::time::Clock;

pub struct HandleManager {
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn StorageEndpointManager>,
    proxies: Mutex<HashMap<StorageKey, Arc<StorageProxy>>>,
}

impl HandleManager {
    pub fn new(
        scheduler: Scheduler,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn StorageEndpointManager>,
    ) -> Self {
        Self {
            scheduler,
            clock,
            storage,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// connection spec から handle を作る。
    ///
    /// - `create://` キーが残っていたら allocator のバグ（設定エラー）
    /// - reference 型の handle を reference-mode キーに繋ぐのは禁止
    ///   （参照の参照ができてしまう）
    /// - 既存 proxy と container shape が食い違えば
    ///   [`ConfigError::StorageKeyShapeConflict`]
    /// - `immediate_sync` なら作成直後に初回同期を仕掛ける。そうでなければ
    ///   particle の起動時まで遅延される
    pub async fn create_handle(
        &self,
        spec: &HandleConnectionSpec,
        particle_id: &str,
        immediate_sync: bool,
    ) -> Result<Arc<Handle>, ConfigError> {
        let key = &spec.storage_key;
        if key.is_unresolved() {
            return Err(ConfigError::UnresolvedStorageKey(key.to_string()));
        }
        if spec.type_tag.data == DataType::Reference && key.is_reference_mode() {
            return Err(ConfigError::ReferenceModeReference(key.to_string()));
        }

        let proxy = {
            let mut proxies = self.proxies.lock().await;
            match proxies.get(key) {
                Some(existing) => {
                    if existing.container() != spec.type_tag.container {
                        return Err(ConfigError::StorageKeyShapeConflict {
                            key: key.to_string(),
                            existing: existing.container().as_str(),
                            requested: spec.type_tag.container.as_str(),
                        });
                    }
                    Arc::clone(existing)
                }
                None => {
                    let proxy = StorageProxy::connect(
                        key.clone(),
                        spec.type_tag.container,
                        self.scheduler.clone(),
                        self.storage.as_ref(),
                    )
                    .await?;
                    proxies.insert(key.clone(), Arc::clone(&proxy));
                    proxy
                }
            }
        };

        let handle = Arc::new(Handle::new(
            spec.handle_name.clone(),
            particle_id.to_string(),
            spec.mode,
            spec.ttl,
            Arc::clone(&self.clock),
            Arc::clone(&proxy),
        ));

        if handle.can_read() {
            proxy.prepare_for_sync();
            if immediate_sync {
                proxy.maybe_initiate_sync();
            }
        }
        Ok(handle)
    }

    /// 作った proxy の数（テスト・診断用）。
    pub async fn proxy_count(&self) -> usize {
        self.proxies.lock().await.len()
    }

    /// 終了処理。順序が重要:
    /// 1. scheduler が暇になるのを待つ（配送中のコールバックを流し切る）
    /// 2. proxy を store に追いつかせてから閉じる
    /// 3. 最後に scheduler 自体を閉じる
    ///
    /// 逆順にすると、閉じた proxy へ model-update が届いてしまう。
    pub async fn close(&self) {
        self.scheduler.wait_for_idle().await;
        let proxies = {
            let mut table = self.proxies.lock().await;
            std::mem::take(&mut *table)
        };
        for proxy in proxies.values() {
            proxy.idle().await;
            proxy.close().await;
        }
        self.scheduler.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::{ContainerType, HandleMode, TypeTag};
    use crate::storage::ramdisk::RamDiskStorageManager;
    use crate::time::SystemClock;

    fn connection(
        key: StorageKey,
        container: ContainerType,
        data: DataType,
        mode: HandleMode,
    ) -> HandleConnectionSpec {
        HandleConnectionSpec {
            handle_name: "h".into(),
            mode,
            type_tag: TypeTag { container, data },
            storage_key: key,
            ttl: None,
        }
    }

    fn manager() -> HandleManager {
        HandleManager::new(
            Scheduler::new(),
            Arc::new(SystemClock),
            Arc::new(RamDiskStorageManager::new()),
        )
    }

    #[tokio::test]
    async fn handles_on_the_same_key_share_one_proxy() {
        let hm = manager();
        let spec = connection(
            StorageKey::ramdisk("k"),
            ContainerType::Singleton,
            DataType::Entity,
            HandleMode::ReadWrite,
        );
        let _a = hm.create_handle(&spec, "p1", false).await.unwrap();
        let _b = hm.create_handle(&spec, "p2", false).await.unwrap();
        assert_eq!(hm.proxy_count().await, 1);
        hm.close().await;
    }

    #[tokio::test]
    async fn shape_conflict_on_a_shared_key_is_a_config_error() {
        let hm = manager();
        let singleton = connection(
            StorageKey::ramdisk("k"),
            ContainerType::Singleton,
            DataType::Entity,
            HandleMode::ReadWrite,
        );
        let collection = connection(
            StorageKey::ramdisk("k"),
            ContainerType::Collection,
            DataType::Entity,
            HandleMode::ReadWrite,
        );
        let _ = hm.create_handle(&singleton, "p", false).await.unwrap();
        // Handle は Debug を持たないので unwrap_err は使えない
        let err = match hm.create_handle(&collection, "p", false).await {
            Err(err) => err,
            Ok(_) => panic!("shape conflict must be rejected"),
        };
        assert!(matches!(
            err,
            ConfigError::StorageKeyShapeConflict {
                existing: "singleton",
                requested: "collection",
                ..
            }
        ));
        hm.close().await;
    }

    #[tokio::test]
    async fn reference_handles_reject_reference_mode_keys() {
        let hm = manager();
        let key = StorageKey::ReferenceMode {
            backing: Box::new(StorageKey::ramdisk("backing")),
            storage: Box::new(StorageKey::ramdisk("fwd")),
        };
        let spec = connection(
            key,
            ContainerType::Singleton,
            DataType::Reference,
            HandleMode::ReadWrite,
        );
        assert!(matches!(
            hm.create_handle(&spec, "p", false).await,
            Err(ConfigError::ReferenceModeReference(_))
        ));
        hm.close().await;
    }

    #[tokio::test]
    async fn unresolved_keys_never_reach_a_store() {
        let hm = manager();
        let spec = connection(
            StorageKey::create("pending"),
            ContainerType::Singleton,
            DataType::Entity,
            HandleMode::ReadWrite,
        );
        assert!(matches!(
            hm.create_handle(&spec, "p", false).await,
            Err(ConfigError::UnresolvedStorageKey(_))
        ));
        hm.close().await;
    }

    #[tokio::test]
    async fn immediate_sync_brings_the_proxy_up_before_any_subscriber() {
        let hm = manager();
        let spec = connection(
            StorageKey::ramdisk("k"),
            ContainerType::Singleton,
            DataType::Entity,
            HandleMode::ReadWrite,
        );
        let handle = hm.create_handle(&spec, "p", true).await.unwrap();
        for _ in 0..3 {
            handle.proxy().idle().await;
            hm.scheduler().wait_for_idle().await;
        }
        // 同期済みなので読み出しがすぐ通る
        assert_eq!(handle.fetch().unwrap(), None);
        hm.close().await;
    }
}
