//! Particle - arc 内で動くコード片とその登録表
//!
//! particle は store へのリアクションとして動く軽量なイベントハンドラ。
//! ライフサイクルフックはどれも `Result` を返し、失敗は
//! [`ParticleFailure`] として状態機械（particle_context）が拾う。
//! フックから先へ例外を投げる経路はない。
//!
//! ホストへの登録は「実装識別子 → ファクトリ」の明示的なテーブルで行う。
//! 実行時のリフレクションや型情報には頼らない。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ConfigError, ParticleFailure};
use crate::handle::Handle;

/// ライフサイクルフック。すべてデフォルト no-op なので、particle は
/// 関心のあるものだけ実装すればよい。
///
/// 呼び出し順の保証:
/// 1. `on_first_start` — 生涯で一度だけ（プロセス再起動をまたいでも）
/// 2. `on_start` — 起動のたび
/// 3. `on_ready` — 読める handle 全部の初回同期が終わったら
/// 4. `on_update` / `on_desync` / `on_resync` — 稼働中
/// 5. `on_shutdown` — 停止時
#[async_trait]
pub trait Particle: Send + Sync {
    /// handle が繋がれたときに呼ばれる。particle 側で保持したければ
    /// ここで clone しておく。
    fn on_handle_attached(&self, _name: &str, _handle: Arc<Handle>) {}

    async fn on_first_start(&self) -> Result<(), ParticleFailure> {
        Ok(())
    }

    async fn on_start(&self) -> Result<(), ParticleFailure> {
        Ok(())
    }

    async fn on_ready(&self) -> Result<(), ParticleFailure> {
        Ok(())
    }

    async fn on_update(&self, _handle_name: &str) -> Result<(), ParticleFailure> {
        Ok(())
    }

    async fn on_desync(&self) -> Result<(), ParticleFailure> {
        Ok(())
    }

    async fn on_resync(&self) -> Result<(), ParticleFailure> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), ParticleFailure> {
        Ok(())
    }
}

pub type ParticleFactory = Arc<dyn Fn() -> Arc<dyn Particle> + Send + Sync>;

/// 実装識別子（Plan の `location`）→ ファクトリの明示テーブル。
/// ホスト起動時に組み立てて以降は読むだけ。
#[derive(Default, Clone)]
pub struct ParticleRegistry {
    factories: HashMap<String, ParticleFactory>,
}

impl ParticleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, location: impl Into<String>, factory: ParticleFactory) {
        self.factories.insert(location.into(), factory);
    }

    pub fn contains(&self, location: &str) -> bool {
        self.factories.contains_key(location)
    }

    /// 登録済みの実装識別子。ホストの capability 広告に使う。
    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<_> = self.factories.keys().cloned().collect();
        locations.sort();
        locations
    }

    pub fn instantiate(&self, location: &str) -> Result<Arc<dyn Particle>, ConfigError> {
        self.factories
            .get(location)
            .map(|factory| factory())
            .ok_or_else(|| ConfigError::UnknownParticle(location.to_string()))
    }
}
