//! End-to-end persistence scenarios against the in-memory storage.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::Host;
use persist_core::{
    Codec, DEFAULT_META_KEY, GraphCodec, MemoryStorage, MetaStore, Observable, ObservablePlugin,
    PersistConfig, PersistOptions, PersistPlugin, ReadableObservable, SetOrigin, SharedValue,
    TransformError, Value,
};
use tokio::task::JoinSet;

type Plugin = PersistPlugin<Arc<MemoryStorage>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "persist_core=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

fn keyed(key: &str) -> PersistOptions {
    PersistOptions::new().with_persist_key(key)
}

async fn restored_host(storage: &Arc<MemoryStorage>) -> (Arc<Plugin>, Host) {
    let plugin = Arc::new(
        PersistPlugin::restored(storage.clone(), PersistConfig::default())
            .await
            .unwrap(),
    );
    let host = Host::new(plugin.clone());
    (plugin, host)
}

fn object(entries: Vec<(&str, Value)>) -> Value {
    Value::Object(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

#[tokio::test]
async fn first_change_records_value_and_meta() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    let (_plugin, host) = restored_host(&storage).await;

    let count = host.cell(keyed("count"), 0);
    host.update(&count, 5).await.unwrap();

    assert_eq!(storage.peek("count"), Some("5".to_string()));
    assert_eq!(
        storage.peek("micro-observables-persist:meta"),
        Some(r#"{"keys":{"$set":["count"]}}"#.to_string())
    );
}

#[tokio::test]
async fn observable_created_before_restore_receives_value() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::with_items([
        (DEFAULT_META_KEY, r#"{"keys":{"$set":["x"]}}"#),
        ("x", "42"),
    ]));
    let plugin = Arc::new(PersistPlugin::new(storage.clone()));
    let host = Host::new(plugin.clone());

    let early = host.cell(keyed("x"), 0);
    assert_eq!(early.get(), Value::Int(0));

    plugin.restore().await.unwrap();

    assert_eq!(early.get(), Value::Int(42));
}

#[tokio::test]
async fn restored_value_is_not_written_back() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::with_items([
        (DEFAULT_META_KEY, r#"{"keys":{"$set":["x"]}}"#),
        ("x", "42"),
    ]));
    let (_plugin, host) = restored_host(&storage).await;

    let cell = host.cell(keyed("x"), 0);
    assert_eq!(host.queued_events(), vec![SetOrigin::Restore]);
    host.flush().await.unwrap();

    assert_eq!(cell.get(), Value::Int(42));
    assert_eq!(storage.total_writes(), 0);
}

#[tokio::test]
async fn unkeyed_observables_never_touch_storage() {
    let storage = Arc::new(MemoryStorage::new());
    let (plugin, host) = restored_host(&storage).await;
    let reads = storage.read_count();

    let plain = host.cell(PersistOptions::new(), 1);
    let unflagged = host.cell(PersistOptions::new().with_key("named"), 1);
    host.update(&plain, 2).await.unwrap();
    host.update(&unflagged, 2).await.unwrap();

    let source = host.cell(PersistOptions::new(), 1);
    let derived = host.derived(keyed("derived"), &source);
    plugin
        .on_change(&Observable::ReadOnly(derived.clone()), &Value::Int(3), SetOrigin::User)
        .await
        .unwrap();

    assert_eq!(storage.read_count(), reads);
    assert_eq!(storage.total_writes(), 0);
}

#[tokio::test]
async fn persist_key_takes_precedence() {
    let storage = Arc::new(MemoryStorage::new());
    let (_plugin, host) = restored_host(&storage).await;

    let options = PersistOptions::new()
        .with_key("generic")
        .persisted(true)
        .with_persist_key("specific");
    let cell = host.cell(options, 0);
    host.update(&cell, 1).await.unwrap();

    assert_eq!(storage.peek("specific"), Some("1".to_string()));
    assert_eq!(storage.peek("generic"), None);

    let generic = host.cell(PersistOptions::new().with_key("generic").persisted(true), 0);
    host.update(&generic, 2).await.unwrap();
    assert_eq!(storage.peek("generic"), Some("2".to_string()));
}

#[tokio::test]
async fn staged_value_goes_to_first_observable_only() {
    let storage = Arc::new(MemoryStorage::with_items([
        (DEFAULT_META_KEY, r#"{"keys":{"$set":["k"]}}"#),
        ("k", "\"stored\""),
    ]));
    let (_plugin, host) = restored_host(&storage).await;

    let first = host.cell(keyed("k"), "fresh");
    let second = host.cell(keyed("k"), "fresh");

    assert_eq!(first.get(), Value::from("stored"));
    assert_eq!(second.get(), Value::from("fresh"));
}

#[tokio::test]
async fn meta_grows_once_per_distinct_key() {
    let storage = Arc::new(MemoryStorage::new());
    let (plugin, host) = restored_host(&storage).await;

    let keys = ["alpha", "beta", "gamma", "delta"];
    for key in keys {
        let cell = host.cell(keyed(key), 0);
        host.update(&cell, 1).await.unwrap();
        host.update(&cell, 2).await.unwrap();
    }

    let stored = MetaStore::load(storage.peek(DEFAULT_META_KEY).as_deref(), &GraphCodec).unwrap();
    assert_eq!(stored.len(), keys.len());
    assert!(keys.iter().all(|k| stored.has(k)));
    assert_eq!(storage.write_count(DEFAULT_META_KEY), keys.len());
    assert_eq!(plugin.meta_keys().len(), keys.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_writes_all_reach_meta() {
    let storage = Arc::new(MemoryStorage::new());
    let (plugin, host) = restored_host(&storage).await;

    let mut tasks = JoinSet::new();
    for i in 0..16 {
        let cell = host.cell(keyed(&format!("key-{i}")), 0);
        let plugin = plugin.clone();
        tasks.spawn(async move {
            let observable = Observable::Writable(cell);
            plugin
                .on_change(&observable, &Value::Int(i), SetOrigin::User)
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    let stored = MetaStore::load(storage.peek(DEFAULT_META_KEY).as_deref(), &GraphCodec).unwrap();
    assert_eq!(stored.len(), 16);
    assert_eq!(storage.write_count(DEFAULT_META_KEY), 16);
}

#[tokio::test]
async fn values_survive_restart() {
    init_tracing();
    let storage = Arc::new(MemoryStorage::new());
    {
        let (_plugin, host) = restored_host(&storage).await;
        let name = host.cell(keyed("name"), "");
        let flags = host.cell(PersistOptions::new().with_key("flags").persisted(true), Value::Null);
        host.update(&name, "ada").await.unwrap();
        host.update(&flags, Value::Set(vec![Value::from("beta")])).await.unwrap();
    }

    let (plugin, host) = restored_host(&storage).await;
    assert_eq!(plugin.staged_keys(), vec!["flags", "name"]);

    let name = host.cell(keyed("name"), "");
    let flags = host.cell(PersistOptions::new().with_key("flags").persisted(true), Value::Null);

    assert_eq!(name.get(), Value::from("ada"));
    assert_eq!(flags.get(), Value::Set(vec![Value::from("beta")]));
    assert!(plugin.staged_keys().is_empty());
}

#[tokio::test]
async fn graph_values_round_trip_through_transforms() {
    let storage = Arc::new(MemoryStorage::new());

    // Domain values wrap the stored form in {"v": ...}; the transforms strip
    // and restore that wrapper.
    let options = || {
        keyed("graph")
            .with_to_json(|value| match value {
                Value::Object(mut fields) => fields
                    .remove("v")
                    .ok_or_else(|| TransformError("missing v".to_string())),
                _ => Err(TransformError("expected object".to_string())),
            })
            .with_from_json(|json| Ok(object(vec![("v", json)])))
    };

    let shared = Value::shared(object(vec![("id", Value::Int(7))]));
    let inner = object(vec![
        ("first", shared.clone()),
        ("second", shared),
        ("tags", Value::Set(vec![Value::from("a"), Value::from("b")])),
        (
            "index",
            Value::Map(vec![(Value::Int(1), Value::from("one"))]),
        ),
        ("created", Value::date_millis(1_700_000_000_000).unwrap()),
        ("pattern", Value::regex("^x+$", "i")),
    ]);
    let domain = object(vec![("v", inner)]);

    {
        let (_plugin, host) = restored_host(&storage).await;
        let cell = host.cell(options(), Value::Null);
        host.update(&cell, domain.clone()).await.unwrap();
    }

    let (_plugin, host) = restored_host(&storage).await;
    let restored = host.cell(options(), Value::Null).get();
    assert_eq!(restored, domain);

    let Value::Object(outer) = restored else {
        panic!("expected object");
    };
    let Value::Object(fields) = &outer["v"] else {
        panic!("expected inner object");
    };
    let (Value::Shared(a), Value::Shared(b)) = (&fields["first"], &fields["second"]) else {
        panic!("expected shared nodes");
    };
    assert!(a.ptr_eq(b));
}

#[tokio::test]
async fn cyclic_values_round_trip() {
    let storage = Arc::new(MemoryStorage::new());
    let node = SharedValue::new(Value::Null);
    node.set(object(vec![
        ("label", Value::from("loop")),
        ("next", Value::Shared(node.clone())),
    ]));

    {
        let (_plugin, host) = restored_host(&storage).await;
        let cell = host.cell(keyed("cycle"), Value::Null);
        host.update(&cell, Value::Shared(node.clone())).await.unwrap();
    }
    assert!(GraphCodec.decode(&storage.peek("cycle").unwrap()).is_ok());

    let (_plugin, host) = restored_host(&storage).await;
    let Value::Shared(restored) = host.cell(keyed("cycle"), Value::Null).get() else {
        panic!("expected shared root");
    };
    let Value::Object(fields) = restored.get() else {
        panic!("expected object");
    };
    let Value::Shared(next) = &fields["next"] else {
        panic!("expected back-reference");
    };
    assert!(next.ptr_eq(&restored));
    assert_eq!(fields["label"], Value::from("loop"));
}

#[tokio::test]
async fn deeply_linked_values_survive_restart() {
    let storage = Arc::new(MemoryStorage::new());
    let mut head = Value::Null;
    for i in 0..60 {
        head = Value::shared(object(vec![("id", Value::Int(i)), ("next", head)]));
    }

    {
        let (_plugin, host) = restored_host(&storage).await;
        let cell = host.cell(keyed("chain"), Value::Null);
        host.update(&cell, head.clone()).await.unwrap();
    }

    let (_plugin, host) = restored_host(&storage).await;
    let restored = host.cell(keyed("chain"), Value::Null).get();
    assert_eq!(restored, head);
}
