use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::{Duration, sleep};

use arclet_core::domain::{
    ContainerType, DataType, HandleConnectionSpec, HandleMode, HandleSpec, ParticleSpec, Plan,
    RawEntity, TypeTag,
};
use arclet_core::host::{ExplicitHostRegistry, HostRegistry, ParticleRegistry};
use arclet_core::scheduler::Scheduler;
use arclet_core::storage::proxy::StorageProxy;
use arclet_core::{
    Allocator, ArcState, Particle, ParticleArcHost, ParticleFailure, RamDiskStorageManager,
    Resurrector, SystemClock,
};
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct Greeting {
    value: String,
}

/// greeting ストアを購読して、届いた値を挨拶として表示する particle。
struct Greeter {
    handle: Mutex<Option<Arc<arclet_core::Handle>>>,
}

impl Greeter {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
        }
    }

    fn current_greeting(&self) -> Option<Greeting> {
        let handle = self.handle.lock().unwrap();
        let entity = handle.as_ref().and_then(|h| h.fetch().ok()).flatten()?;
        serde_json::from_value(serde_json::Value::Object(
            entity.fields.into_iter().collect(),
        ))
        .ok()
    }
}

#[async_trait]
impl Particle for Greeter {
    fn on_handle_attached(&self, _name: &str, handle: Arc<arclet_core::Handle>) {
        self.handle.lock().unwrap().replace(handle);
    }

    async fn on_ready(&self) -> Result<(), ParticleFailure> {
        match self.current_greeting() {
            Some(g) => println!("[greeter] ready, greeting is already '{}'", g.value),
            None => println!("[greeter] ready, no greeting yet"),
        }
        Ok(())
    }

    async fn on_update(&self, handle_name: &str) -> Result<(), ParticleFailure> {
        if let Some(g) = self.current_greeting() {
            println!("[greeter] {handle_name} updated: hello, {}!", g.value);
        }
        Ok(())
    }
}

fn greeter_plan() -> Plan {
    let handle = HandleSpec {
        name: "greeting".into(),
        // create-fate: storage key は allocator が合成する
        storage_key: arclet_core::StorageKey::create("greeting"),
        type_tag: TypeTag::singleton_of(DataType::Entity),
        tags: vec![],
        ttl: None,
    };
    let mut connections = BTreeMap::new();
    connections.insert(
        "greeting".to_string(),
        HandleConnectionSpec {
            handle_name: "greeting".into(),
            mode: HandleMode::ReadWrite,
            type_tag: TypeTag::singleton_of(DataType::Entity),
            storage_key: arclet_core::StorageKey::create("greeting"),
            ttl: None,
        },
    );
    let particle = ParticleSpec {
        particle_name: "greeter".into(),
        location: "demo.Greeter".into(),
        connections,
    };
    Plan::new(vec![handle], vec![particle])
}

#[tokio::main]
async fn main() {
    // (A) storage とホストを用意。particle の登録は明示テーブルで
    let storage = Arc::new(RamDiskStorageManager::new());
    let mut particles = ParticleRegistry::new();
    particles.register("demo.Greeter", Arc::new(|| Arc::new(Greeter::new())));
    let host = Arc::new(ParticleArcHost::new(
        "demo-host",
        particles,
        Arc::new(SystemClock),
        storage.clone() as Arc<dyn arclet_core::storage::StorageEndpointManager>,
    ));

    // (B) registry + allocator を組む（グローバルは作らない）
    let registry = Arc::new(ExplicitHostRegistry::new());
    registry.register_host(host.clone());
    let allocator = Allocator::new(registry, Arc::new(SystemClock));

    // resurrector も繋いでおく（このデモでは監視登録だけ）
    let resurrector = Resurrector::new();
    resurrector.watch_host(host.clone());

    // (C) plan から arc を起動
    let plan = greeter_plan();
    let arc_id = allocator
        .start_arc_for_plan("greeterArc", &plan)
        .await
        .expect("arc starts");
    println!("started arc: {arc_id}");
    host.wait_for_arc_idle(&arc_id).await;
    println!("arc status: {}", allocator.arc_status(&arc_id).await);

    // (D) 合成された storage key を台帳から引き、外から greeting を書く
    let partitions = allocator.partitions_for(&arc_id);
    let key = partitions[0].particles[0].connections["greeting"]
        .storage_key
        .clone();
    println!("synthesized key: {key}");

    let writer_scheduler = Scheduler::new();
    let writer = StorageProxy::connect(
        key,
        ContainerType::Singleton,
        writer_scheduler.clone(),
        storage.as_ref(),
    )
    .await
    .expect("writer connects");
    writer.prepare_for_sync();
    writer.maybe_initiate_sync();
    writer.idle().await;
    writer_scheduler.wait_for_idle().await;
    writer
        .set_singleton(RawEntity::new("g1").with_field("value", serde_json::json!("arclet")))
        .expect("write goes through");

    // 通知が particle まで流れるのを待つ
    writer.idle().await;
    host.wait_for_arc_idle(&arc_id).await;
    sleep(Duration::from_millis(50)).await;

    // (E) 停止。状態は全ホスト Stopped に収束する
    allocator.stop_arc(&arc_id).await.expect("arc stops");
    host.drain().await;
    assert_eq!(allocator.arc_status(&arc_id).await, ArcState::STOPPED);
    println!("final status: {}", allocator.arc_status(&arc_id).await);

    writer_scheduler.close().await;
    host.shutdown().await;
}
