//! ArcHostContextSerializer - arc 状態の永続化と復元
//!
//! ホストごとにひとつの書き込みキュー（unbounded FIFO）と、それを
//! 消費する単一タスクを持つ。呼び出し側は並行に enqueue してよいが、
//! storage への適用は必ず観測順になる。
//!
//! # ストア配置（非正規化の 3 ストア）
//! - `arc-state/<host>/<arc>` : singleton。arc の状態ひとつ
//! - `particles/<host>/<arc>` : set。particle ごとに 1 entity
//! - `connections/<host>/<arc>` : set。handle connection ごとに 1 entity、
//!   `particle_name` フィールドで particles 側と join する
//!
//! 読み戻しは arc-state entity の有無で「永続化済みか」を判定する。
//! 無ければ呼び出し側の default をそのまま返す（「一度も書かれて
//! いない」と「壊れている」を区別する）。particle が 0 個の arc も
//! arc-state さえあれば正しく復元される。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::domain::ids::ArcId;
use crate::domain::plan::{
    ContainerType, HandleConnectionSpec, ParticleSpec, RawEntity,
};
use crate::error::SerializationError;
use crate::host::context::{ContextSnapshot, ParticleSnapshot};
use crate::storage::crdt::{CrdtModel, CrdtOperation};
use crate::storage::endpoint::{StorageEndpointManager, StoreOptions};
use crate::storage::key::StorageKey;

enum WriteJob {
    Write(ContextSnapshot),
    Drain(oneshot::Sender<()>),
}

pub struct ArcHostContextSerializer {
    host_id: String,
    storage: Arc<dyn StorageEndpointManager>,
    tx: StdMutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ArcHostContextSerializer {
    pub fn new(host_id: impl Into<String>, storage: Arc<dyn StorageEndpointManager>) -> Self {
        let host_id = host_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(consumer_loop(rx, host_id.clone(), Arc::clone(&storage)));
        Self {
            host_id,
            storage,
            tx: StdMutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// スナップショットの書き込みを予約する。enqueue できなければ
    /// （キューが既に閉じられていれば）その場で同期的に書く。
    /// 黙って落とすことだけはしない。
    pub async fn write_context_to_storage(&self, snapshot: ContextSnapshot) {
        let enqueued = {
            let tx = self.tx.lock().expect("serializer lock poisoned");
            match tx.as_ref() {
                Some(tx) => tx.send(WriteJob::Write(snapshot.clone())).is_ok(),
                None => false,
            }
        };
        if !enqueued {
            write_snapshot(&self.host_id, self.storage.as_ref(), &snapshot).await;
        }
    }

    /// この呼び出しより前に enqueue された書き込みがすべて storage へ
    /// 適用されるまで待つ。番兵タスクをキューに入れて待つだけで、
    /// ポーリングはしない。
    pub async fn drain_serializations(&self) {
        let rx = {
            let tx = self.tx.lock().expect("serializer lock poisoned");
            match tx.as_ref() {
                Some(tx) => {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(WriteJob::Drain(done_tx)).is_ok() {
                        Some(done_rx)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }

    /// 書き込みタスクを止める。以降の write は同期フォールバックになる。
    pub async fn cancel(&self) {
        self.tx.lock().expect("serializer lock poisoned").take();
        let join = self.join.lock().await.take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }

    /// 永続化されたコンテキストを読み戻す。見つからなければ `default` を
    /// そのまま返す。
    pub async fn read_context_from_storage(
        &self,
        default: ContextSnapshot,
    ) -> Result<ContextSnapshot, SerializationError> {
        let arc_id = default.arc_id.clone();

        let arc_state_model = self
            .storage
            .snapshot(&arc_state_key(&self.host_id, &arc_id))
            .await?;
        let Some(arc_state_entity) =
            arc_state_model.as_ref().and_then(|m| m.singleton_value()).cloned()
        else {
            return Ok(default);
        };
        let particles_model = self
            .storage
            .snapshot(&particles_key(&self.host_id, &arc_id))
            .await?;
        let particle_entities: Vec<RawEntity> = particles_model
            .as_ref()
            .map(|m| m.elements().into_iter().cloned().collect())
            .unwrap_or_default();
        let connections_model = self
            .storage
            .snapshot(&connections_key(&self.host_id, &arc_id))
            .await?;
        let connection_entities: Vec<RawEntity> = connections_model
            .as_ref()
            .map(|m| m.elements().into_iter().cloned().collect())
            .unwrap_or_default();

        let arc_state = field_str(&arc_state_entity, "arc_state").ok_or_else(|| {
            self.corrupt(&arc_id, "arc-state entity is missing its arc_state field")
        })?;

        let mut particles: BTreeMap<String, ParticleSnapshot> = BTreeMap::new();
        for entity in &particle_entities {
            let location = field_str(entity, "location")
                .ok_or_else(|| self.corrupt(&arc_id, "particle entity without location"))?;
            let state = field_str(entity, "state")
                .ok_or_else(|| self.corrupt(&arc_id, "particle entity without state"))?;
            let consecutive_failures = entity
                .fields
                .get("consecutive_failures")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            particles.insert(
                entity.id.clone(),
                ParticleSnapshot {
                    spec: ParticleSpec {
                        particle_name: entity.id.clone(),
                        location,
                        connections: BTreeMap::new(),
                    },
                    state,
                    consecutive_failures,
                },
            );
        }

        // connections は particle_name で join する。親のいない接続は
        // 壊れたデータなので読めないものとして扱う
        for entity in &connection_entities {
            let particle_name = field_str(entity, "particle_name")
                .ok_or_else(|| self.corrupt(&arc_id, "connection entity without particle_name"))?;
            let connection_name = field_str(entity, "connection_name")
                .ok_or_else(|| self.corrupt(&arc_id, "connection entity without connection_name"))?;
            let Some(snapshot) = particles.get_mut(&particle_name) else {
                return Err(SerializationError::DanglingConnection {
                    arc_id: arc_id.to_string(),
                    particle: particle_name,
                    connection: connection_name,
                });
            };
            let spec_value = entity
                .fields
                .get("spec")
                .cloned()
                .ok_or_else(|| self.corrupt(&arc_id, "connection entity without spec"))?;
            let spec: HandleConnectionSpec = serde_json::from_value(spec_value)
                .map_err(|e| self.corrupt(&arc_id, &e.to_string()))?;
            snapshot.spec.connections.insert(connection_name, spec);
        }

        Ok(ContextSnapshot {
            arc_id,
            arc_state,
            particles: particles.into_values().collect(),
        })
    }

    fn corrupt(&self, arc_id: &ArcId, detail: &str) -> SerializationError {
        SerializationError::Corrupt {
            arc_id: arc_id.to_string(),
            host_id: self.host_id.clone(),
            detail: detail.to_string(),
        }
    }
}

fn arc_state_key(host_id: &str, arc_id: &ArcId) -> StorageKey {
    StorageKey::ramdisk(format!("arc-state/{host_id}/{arc_id}"))
}

fn particles_key(host_id: &str, arc_id: &ArcId) -> StorageKey {
    StorageKey::ramdisk(format!("particles/{host_id}/{arc_id}"))
}

fn connections_key(host_id: &str, arc_id: &ArcId) -> StorageKey {
    StorageKey::ramdisk(format!("connections/{host_id}/{arc_id}"))
}

fn field_str(entity: &RawEntity, name: &str) -> Option<String> {
    entity
        .fields
        .get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

async fn consumer_loop(
    mut rx: mpsc::UnboundedReceiver<WriteJob>,
    host_id: String,
    storage: Arc<dyn StorageEndpointManager>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            WriteJob::Write(snapshot) => {
                write_snapshot(&host_id, storage.as_ref(), &snapshot).await;
            }
            WriteJob::Drain(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// スナップショットひとつ分を 3 ストアへ反映する。失敗はログに残して
/// 飲み込む（永続化の失敗で arc 本体を止めない）。
async fn write_snapshot(
    host_id: &str,
    storage: &dyn StorageEndpointManager,
    snapshot: &ContextSnapshot,
) {
    let arc_id = &snapshot.arc_id;

    let mut arc_state_entity = RawEntity::new(arc_id.as_str());
    arc_state_entity.fields.insert(
        "arc_state".into(),
        serde_json::Value::String(snapshot.arc_state.clone()),
    );
    sync_store(
        host_id,
        storage,
        arc_state_key(host_id, arc_id),
        ContainerType::Singleton,
        vec![arc_state_entity],
    )
    .await;

    let particle_entities: Vec<RawEntity> = snapshot
        .particles
        .iter()
        .map(|p| {
            let mut entity = RawEntity::new(&p.spec.particle_name);
            entity.fields.insert(
                "location".into(),
                serde_json::Value::String(p.spec.location.clone()),
            );
            entity
                .fields
                .insert("state".into(), serde_json::Value::String(p.state.clone()));
            entity.fields.insert(
                "consecutive_failures".into(),
                serde_json::Value::from(p.consecutive_failures),
            );
            entity
        })
        .collect();
    sync_store(
        host_id,
        storage,
        particles_key(host_id, arc_id),
        ContainerType::Collection,
        particle_entities,
    )
    .await;

    let mut connection_entities = Vec::new();
    for particle in &snapshot.particles {
        for (connection_name, spec) in &particle.spec.connections {
            let mut entity = RawEntity::new(format!(
                "{}:{}",
                particle.spec.particle_name, connection_name
            ));
            entity.fields.insert(
                "particle_name".into(),
                serde_json::Value::String(particle.spec.particle_name.clone()),
            );
            entity.fields.insert(
                "connection_name".into(),
                serde_json::Value::String(connection_name.clone()),
            );
            match serde_json::to_value(spec) {
                Ok(value) => {
                    entity.fields.insert("spec".into(), value);
                }
                Err(e) => {
                    eprintln!(
                        "[arclet] host '{host_id}': failed to serialize connection spec: {e}"
                    );
                    continue;
                }
            }
            connection_entities.push(entity);
        }
    }
    sync_store(
        host_id,
        storage,
        connections_key(host_id, arc_id),
        ContainerType::Collection,
        connection_entities,
    )
    .await;
}

/// store の現在モデルを読み、望む内容との差分を op として適用してから
/// 書き戻す。モデルのバージョンは単調に進むので、店先の購読者も
/// 正しく追従できる。
async fn sync_store(
    host_id: &str,
    storage: &dyn StorageEndpointManager,
    key: StorageKey,
    container: ContainerType,
    desired: Vec<RawEntity>,
) {
    let mut model = match storage.snapshot(&key).await {
        Ok(Some(model)) => model,
        Ok(None) => CrdtModel::new(container),
        Err(e) => {
            eprintln!("[arclet] host '{host_id}': context write failed reading '{key}': {e}");
            return;
        }
    };

    let actor = format!("serializer:{host_id}");
    let mut next_seq = model.versions().seq_for(&actor);
    let mut apply = |model: &mut CrdtModel, op: CrdtOperation| {
        if !model.apply(&op) {
            eprintln!("[arclet] host '{host_id}': context op rejected for '{key}'");
        }
    };

    match container {
        ContainerType::Singleton => {
            let value = desired.into_iter().next();
            next_seq += 1;
            let op = match value {
                Some(value) => CrdtOperation::SetSingleton {
                    actor: actor.clone(),
                    seq: next_seq,
                    value,
                },
                None => CrdtOperation::ClearSingleton {
                    actor: actor.clone(),
                    seq: next_seq,
                },
            };
            apply(&mut model, op);
        }
        ContainerType::Collection => {
            let desired_ids: std::collections::BTreeSet<String> =
                desired.iter().map(|e| e.id.clone()).collect();
            let stale: Vec<String> = model
                .elements()
                .iter()
                .map(|e| e.id.clone())
                .filter(|id| !desired_ids.contains(id))
                .collect();
            for id in stale {
                next_seq += 1;
                apply(
                    &mut model,
                    CrdtOperation::RemoveElement {
                        actor: actor.clone(),
                        seq: next_seq,
                        id,
                    },
                );
            }
            for value in desired {
                next_seq += 1;
                apply(
                    &mut model,
                    CrdtOperation::AddElement {
                        actor: actor.clone(),
                        seq: next_seq,
                        value,
                    },
                );
            }
        }
    }

    if let Err(e) = storage
        .overwrite(
            StoreOptions {
                storage_key: key.clone(),
                container,
            },
            model,
        )
        .await
    {
        eprintln!("[arclet] host '{host_id}': context write failed for '{key}': {e}");
    }
}
