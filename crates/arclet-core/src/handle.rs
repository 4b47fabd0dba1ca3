//! Handle - particle が store を読み書きする窓口
//!
//! Read / Write / ReadWrite の別を型階層ではなくひとつの具象型で表し、
//! mode が許さない操作は `HandleError::NotPermitted` を返す。proxy は
//! HandleManager が storage key ごとに一個だけ作ったものを共有する。
//!
//! 書き込み時、TTL 付きの handle は entity に絶対時刻の expiry を刻む。

use std::sync::Arc;

use crate::domain::plan::{HandleMode, RawEntity, Ttl};
use crate::error::HandleError;
use crate::storage::proxy::{StorageEventCallback, StorageProxy};
use crate::time::Clock;

pub struct Handle {
    /// 接続名。イベント購読の name として使う。
    name: String,
    /// 購読の namespace。particle ごとに分かれる。
    particle_namespace: String,
    mode: HandleMode,
    ttl: Option<Ttl>,
    clock: Arc<dyn Clock>,
    proxy: Arc<StorageProxy>,
}

impl Handle {
    pub(crate) fn new(
        name: String,
        particle_namespace: String,
        mode: HandleMode,
        ttl: Option<Ttl>,
        clock: Arc<dyn Clock>,
        proxy: Arc<StorageProxy>,
    ) -> Self {
        Self {
            name,
            particle_namespace,
            mode,
            ttl,
            clock,
            proxy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn can_read(&self) -> bool {
        self.mode.can_read()
    }

    pub(crate) fn proxy(&self) -> &Arc<StorageProxy> {
        &self.proxy
    }

    /// 読める handle だけがイベントを購読できる（write-only handle の
    /// 購読登録は proxy を ReadyToSync に進めてしまうため弾く）。
    pub fn register_for_storage_events(
        &self,
        callback: StorageEventCallback,
    ) -> Result<(), HandleError> {
        self.guard_read()?;
        self.proxy.register_for_storage_events(
            self.particle_namespace.clone(),
            self.name.clone(),
            callback,
        );
        Ok(())
    }

    /// 初回同期を仕掛ける（冪等）。
    pub fn maybe_initiate_sync(&self) {
        self.proxy.maybe_initiate_sync();
    }

    /// 購読を外す。particle の停止時に呼ばれる。
    pub fn detach(&self) {
        self.proxy
            .remove_callbacks_for(&self.particle_namespace, &self.name);
    }

    pub fn fetch(&self) -> Result<Option<RawEntity>, HandleError> {
        self.guard_read()?;
        self.proxy.singleton_value()
    }

    pub fn fetch_all(&self) -> Result<Vec<RawEntity>, HandleError> {
        self.guard_read()?;
        self.proxy.elements()
    }

    pub fn set(&self, entity: RawEntity) -> Result<(), HandleError> {
        self.guard_write()?;
        self.proxy.set_singleton(self.stamp(entity))
    }

    pub fn clear(&self) -> Result<(), HandleError> {
        self.guard_write()?;
        self.proxy.clear_singleton()
    }

    pub fn add(&self, entity: RawEntity) -> Result<(), HandleError> {
        self.guard_write()?;
        self.proxy.add_element(self.stamp(entity))
    }

    pub fn remove(&self, id: &str) -> Result<(), HandleError> {
        self.guard_write()?;
        self.proxy.remove_element(id.to_string())
    }

    fn guard_read(&self) -> Result<(), HandleError> {
        if self.mode.can_read() {
            Ok(())
        } else {
            Err(self.not_permitted())
        }
    }

    fn guard_write(&self) -> Result<(), HandleError> {
        if self.mode.can_write() {
            Ok(())
        } else {
            Err(self.not_permitted())
        }
    }

    fn not_permitted(&self) -> HandleError {
        HandleError::NotPermitted {
            handle: self.name.clone(),
            mode: self.mode.as_str(),
        }
    }

    fn stamp(&self, mut entity: RawEntity) -> RawEntity {
        if let Some(ttl) = self.ttl {
            entity.expiration_ms = Some(ttl.expiry_from(self.clock.now()).timestamp_millis());
        }
        entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::plan::ContainerType;
    use crate::scheduler::Scheduler;
    use crate::storage::key::StorageKey;
    use crate::storage::ramdisk::RamDiskStorageManager;
    use crate::time::FixedClock;
    use chrono::{TimeZone, Utc};

    async fn handle_with_mode(
        mode: HandleMode,
        ttl: Option<Ttl>,
        container: ContainerType,
    ) -> (Handle, Scheduler) {
        let manager = RamDiskStorageManager::new();
        let scheduler = Scheduler::new();
        let proxy = StorageProxy::connect(
            StorageKey::ramdisk("k"),
            container,
            scheduler.clone(),
            &manager,
        )
        .await
        .unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        ));
        let handle = Handle::new(
            "conn".into(),
            "particle".into(),
            mode,
            ttl,
            clock,
            proxy,
        );
        (handle, scheduler)
    }

    async fn sync(handle: &Handle, scheduler: &Scheduler) {
        if handle.can_read() {
            handle
                .register_for_storage_events(Arc::new(|_| {}))
                .unwrap();
        } else {
            // write-only でもテストでは読みたいので proxy を直接進める
            handle
                .proxy()
                .register_for_storage_events("test", "peek", Arc::new(|_| {}));
        }
        handle.maybe_initiate_sync();
        for _ in 0..3 {
            handle.proxy().idle().await;
            scheduler.wait_for_idle().await;
        }
    }

    #[tokio::test]
    async fn read_only_handle_rejects_writes() {
        let (handle, scheduler) =
            handle_with_mode(HandleMode::Read, None, ContainerType::Singleton).await;
        let err = handle.set(RawEntity::new("x")).unwrap_err();
        assert!(matches!(err, HandleError::NotPermitted { mode, .. } if mode == "read-only"));
        scheduler.close().await;
    }

    #[tokio::test]
    async fn write_only_handle_rejects_reads_and_subscriptions() {
        let (handle, scheduler) =
            handle_with_mode(HandleMode::Write, None, ContainerType::Singleton).await;
        assert!(matches!(
            handle.fetch(),
            Err(HandleError::NotPermitted { .. })
        ));
        assert!(handle.register_for_storage_events(Arc::new(|_| {})).is_err());
        scheduler.close().await;
    }

    #[tokio::test]
    async fn read_write_handle_roundtrips_a_singleton() {
        let (handle, scheduler) =
            handle_with_mode(HandleMode::ReadWrite, None, ContainerType::Singleton).await;
        sync(&handle, &scheduler).await;

        handle.set(RawEntity::new("v")).unwrap();
        assert_eq!(handle.fetch().unwrap().unwrap().id, "v");
        handle.clear().unwrap();
        assert_eq!(handle.fetch().unwrap(), None);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn collection_add_and_remove() {
        let (handle, scheduler) =
            handle_with_mode(HandleMode::ReadWrite, None, ContainerType::Collection).await;
        sync(&handle, &scheduler).await;

        handle.add(RawEntity::new("a")).unwrap();
        handle.add(RawEntity::new("b")).unwrap();
        handle.remove("a").unwrap();
        let ids: Vec<_> = handle
            .fetch_all()
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["b"]);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn ttl_stamps_an_absolute_expiry() {
        let (handle, scheduler) = handle_with_mode(
            HandleMode::ReadWrite,
            Some(Ttl::minutes(10)),
            ContainerType::Singleton,
        )
        .await;
        sync(&handle, &scheduler).await;

        handle.set(RawEntity::new("v")).unwrap();
        let stored = handle.fetch().unwrap().unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 0, 10, 0).unwrap();
        assert_eq!(stored.expiration_ms, Some(expected.timestamp_millis()));
        scheduler.close().await;
    }
}
