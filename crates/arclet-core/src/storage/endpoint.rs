//! StorageEndpoint - proxy と store の境界
//!
//! proxy から見た store は「メッセージを投げると、いつか callback が
//! 返ってくる」相手でしかない。具体的な置き場所（ramdisk / volatile /
//! 将来のリモート）はこの trait の向こうに隠れる。
//!
//! `on_proxy_message` は同期（enqueue のみ）。store 側の処理を待ちたい
//! 場合は `idle()` を使う。

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::plan::ContainerType;
use crate::error::StorageError;
use crate::storage::crdt::{CrdtModel, CrdtOperation};
use crate::storage::key::StorageKey;

/// proxy ⇄ store 間を流れるメッセージ。
#[derive(Debug, Clone)]
pub enum ProxyMessage {
    /// 「全モデルをくれ」。返答は要求元にだけ届く ModelUpdate。
    SyncRequest,
    /// レプリカ全体。sync 要求への返答、または他レプリカの合流通知。
    ModelUpdate { model: CrdtModel },
    /// 差分操作の列。
    Operations { ops: Vec<CrdtOperation> },
}

/// store からの折り返しを受ける callback。どの物理スレッドから呼ばれるかは
/// 不定なので、受け手（proxy）側で scheduler に載せ直すこと。
pub type ProxyCallback = Arc<dyn Fn(ProxyMessage) + Send + Sync>;

/// ひとつの storage key に繋がったチャネル。
#[async_trait]
pub trait StorageEndpoint: Send + Sync {
    /// メッセージを store に送る。enqueue のみで、処理完了は待たない。
    fn on_proxy_message(&self, message: ProxyMessage) -> Result<(), StorageError>;

    /// この endpoint が送った分を store が処理し終えるまで待つ。
    async fn idle(&self);

    /// 接続を外す。以降の `on_proxy_message` は `StoreClosed`。
    async fn close(&self);
}

/// endpoint の作成時パラメータ。
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub storage_key: StorageKey,
    pub container: ContainerType,
}

/// store の払い出し元。ホストごとにひとつ。
#[async_trait]
pub trait StorageEndpointManager: Send + Sync {
    /// key に対応する store へ接続する。store がまだ無ければ作る。
    async fn get(
        &self,
        options: StoreOptions,
        callback: ProxyCallback,
    ) -> Result<Box<dyn StorageEndpoint>, StorageError>;

    /// 現在のモデルを覗く（serializer の読み出し用）。
    /// store が存在しなければ `None`。
    async fn snapshot(&self, key: &StorageKey) -> Result<Option<CrdtModel>, StorageError>;

    /// モデルを丸ごと置き換え、接続中の endpoint に ModelUpdate を配る
    /// （serializer の書き込み用）。
    async fn overwrite(
        &self,
        options: StoreOptions,
        model: CrdtModel,
    ) -> Result<(), StorageError>;

    /// 全 store の処理が追いつくまで待つ。
    async fn idle(&self);

    /// 指定 arc の volatile store を破棄する。
    async fn drop_volatile(&self, arc_id: &str);

    /// 全 store を破棄する（テスト・シャットダウン用）。
    async fn reset(&self);
}
