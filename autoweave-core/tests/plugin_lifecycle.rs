//! Plugin manager lifecycle tests against a real worker pool with small
//! wasm bundles: discovery to active, idempotent re-adds, hot reload with
//! state handoff, dispatch selection, and removal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use autoweave_core::events::ControlBus;
use autoweave_core::perf::metrics::{MetricsRegistry, counters};
use autoweave_core::plugins::manager::{
    ManagerConfig, PluginManager, PluginManagerHandle,
};
use autoweave_core::plugins::validator::ManifestValidator;
use autoweave_core::workers::pool::{PoolConfig, WorkerPool, WorkerPoolHandle};
use autoweave_model::{
    DeviceAction, EventSource, PluginId, PluginState, StreamEvent,
    UsbDeviceInfo,
};
use tempfile::TempDir;

// Echoes its onLoad payload, snapshots "SNAP" on unload, and reports a
// metric when poked by a USB event.
const PLUGIN_WAT: &str = r#"
(module
  (import "autoweave" "input_len" (func $input_len (result i32)))
  (import "autoweave" "input_read" (func $input_read (param i32) (result i32)))
  (import "autoweave" "output_write" (func $output_write (param i32 i32) (result i32)))
  (import "autoweave" "host_call" (func $host_call (param i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 0) "{\"op\":\"metric\",\"name\":\"poked\",\"value\":1}")
  (data (i32.const 1024) "SNAP")
  (func (export "init")
    (drop (call $input_read (i32.const 2048)))
    (drop (call $output_write (i32.const 2048) (call $input_len))))
  (func (export "save")
    (drop (call $output_write (i32.const 1024) (i32.const 4))))
  (func (export "poke")
    (drop (call $host_call (i32.const 0) (i32.const 40)))))
"#;

fn manifest_json(name: &str, version: &str) -> String {
    format!(
        r#"{{"name":"{name}","version":"{version}","entry":"entry.wat",
  "permissions":{{"usb":{{"vendor_ids":["0x1234"]}}}},
  "hooks":{{"onLoad":"init","onUnload":"save","onUSBAttach":"poke","onUSBDetach":"poke"}}}}"#
    )
}

struct Harness {
    manager: PluginManagerHandle,
    pool: WorkerPoolHandle,
    metrics: Arc<MetricsRegistry>,
    _bus: Arc<ControlBus>,
    root: TempDir,
}

fn harness() -> Harness {
    let metrics = MetricsRegistry::new();
    let bus = Arc::new(ControlBus::new(256));
    let (pool, pool_handle, worker_events) = WorkerPool::new(
        PoolConfig {
            max_workers: 4,
            ..PoolConfig::default()
        },
        &metrics,
        Arc::clone(&bus),
    )
    .unwrap();
    pool.spawn();

    let validator = ManifestValidator::new(1024, &metrics);
    let (manager, handle) = PluginManager::new(
        ManagerConfig {
            hook_timeout: Duration::from_secs(5),
            unload_timeout: Duration::from_secs(2),
            load_timeout: Duration::from_secs(20),
            ..ManagerConfig::default()
        },
        pool_handle.clone(),
        worker_events,
        validator,
        Arc::clone(&metrics),
        Arc::clone(&bus),
    );
    manager.spawn();

    Harness {
        manager: handle,
        pool: pool_handle,
        metrics,
        _bus: bus,
        root: tempfile::tempdir().unwrap(),
    }
}

fn write_bundle(root: &Path, dir_name: &str, manifest: &str) -> (PathBuf, PathBuf) {
    let bundle = root.join(dir_name);
    std::fs::create_dir_all(&bundle).unwrap();
    std::fs::write(bundle.join("entry.wat"), PLUGIN_WAT).unwrap();
    let manifest_path = bundle.join("autoweave.plugin.json");
    std::fs::write(&manifest_path, manifest).unwrap();
    (manifest_path, bundle)
}

async fn add_bundle(
    harness: &Harness,
    dir_name: &str,
    manifest: &str,
) -> (PathBuf, PathBuf) {
    let (manifest_path, bundle) =
        write_bundle(harness.root.path(), dir_name, manifest);
    harness
        .manager
        .on_manifest_added(
            manifest_path.clone(),
            bundle.clone(),
            manifest.as_bytes().to_vec(),
        )
        .await;
    (manifest_path, bundle)
}

async fn wait_for_state(
    manager: &PluginManagerHandle,
    id: PluginId,
    expected: PluginState,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if let Some(descriptor) = manager.get(id).await {
            if descriptor.state == expected {
                return;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "plugin {id} never reached {expected}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn attach_event(vendor_id: u16) -> StreamEvent {
    let info = UsbDeviceInfo::bare(vendor_id, 0x5678, 1, 4, "1-4".into(), 0);
    StreamEvent::from_device(
        EventSource::Observer,
        DeviceAction::Attach,
        &info,
        1_700_000_000_000,
    )
}

#[tokio::test]
async fn plugin_reaches_active_and_receives_matching_events() {
    let harness = harness();
    add_bundle(&harness, "gadget", &manifest_json("gadget", "1.0.0")).await;
    let id = PluginId::from_name("gadget");
    wait_for_state(&harness.manager, id, PluginState::Active).await;

    // Matching vendor id reaches the hook.
    harness
        .manager
        .dispatch_stream_event(attach_event(0x1234))
        .await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if harness.metrics.snapshot().get("plugin.gadget.poked")
            == Some(&1)
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "hook never observed the event"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Non-matching vendor id is filtered out at dispatch.
    harness
        .manager
        .dispatch_stream_event(attach_event(0x9999))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let descriptor = harness.manager.get(id).await.unwrap();
    assert_eq!(descriptor.metrics.access_count, 1);

    harness.manager.shutdown().await;
    harness.pool.shutdown().await;
}

#[tokio::test]
async fn re_adding_identical_manifest_is_a_no_op() {
    let harness = harness();
    let manifest = manifest_json("idem", "1.0.0");
    let (manifest_path, bundle) =
        add_bundle(&harness, "idem", &manifest).await;
    let id = PluginId::from_name("idem");
    wait_for_state(&harness.manager, id, PluginState::Active).await;

    for _ in 0..3 {
        harness
            .manager
            .on_manifest_added(
                manifest_path.clone(),
                bundle.clone(),
                manifest.as_bytes().to_vec(),
            )
            .await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(harness.manager.list().await.len(), 1);
    assert_eq!(
        harness.metrics.counter(counters::PLUGIN_LOADS).get(),
        1,
        "identical re-adds must not reload"
    );
    assert_eq!(harness.pool.stats().await.workers, 1);

    harness.manager.shutdown().await;
    harness.pool.shutdown().await;
}

#[tokio::test]
async fn hot_reload_swaps_worker_and_preserves_state() {
    let harness = harness();
    let (manifest_path, bundle) =
        add_bundle(&harness, "reload", &manifest_json("reload", "1.0.0"))
            .await;
    let id = PluginId::from_name("reload");
    wait_for_state(&harness.manager, id, PluginState::Active).await;
    let first_worker = harness.manager.get(id).await.unwrap().worker_id;

    // Content change triggers the reload.
    let v2 = manifest_json("reload", "2.0.0");
    std::fs::write(&manifest_path, &v2).unwrap();
    harness
        .manager
        .on_manifest_changed(
            manifest_path.clone(),
            bundle.clone(),
            v2.as_bytes().to_vec(),
        )
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let descriptor = harness.manager.get(id).await.unwrap();
        if descriptor.version == "2.0.0"
            && descriptor.state == PluginState::Active
        {
            // The outgoing incarnation's onUnload snapshot survived the
            // swap and fed the new onLoad.
            assert_eq!(descriptor.state_snapshot_len, Some(4));
            assert_ne!(descriptor.worker_id, first_worker);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "hot reload never completed"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Exactly one worker serves the plugin after the switchover.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if harness.pool.stats().await.workers == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "old worker never drained"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    harness.manager.shutdown().await;
    harness.pool.shutdown().await;
}

#[tokio::test]
async fn manifest_removal_drains_and_forgets_the_plugin() {
    let harness = harness();
    let (manifest_path, _bundle) =
        add_bundle(&harness, "gone", &manifest_json("gone", "1.0.0")).await;
    let id = PluginId::from_name("gone");
    wait_for_state(&harness.manager, id, PluginState::Active).await;

    harness.manager.on_manifest_removed(manifest_path).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if harness.manager.get(id).await.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "plugin was never removed"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(harness.pool.stats().await.workers, 0);

    harness.manager.shutdown().await;
    harness.pool.shutdown().await;
}

#[tokio::test]
async fn invalid_manifest_is_parked_in_failed() {
    let harness = harness();
    let bad = r#"{"name":"crooked","version":"1.0.0","entry":"../../escape.wat"}"#;
    add_bundle(&harness, "crooked", bad).await;

    let id = PluginId::from_name("crooked");
    wait_for_state(&harness.manager, id, PluginState::Failed).await;
    assert_eq!(
        harness.pool.stats().await.workers,
        0,
        "failed plugins must not get workers"
    );
    assert!(
        harness
            .metrics
            .counter(counters::VALIDATION_FAILURES)
            .get()
            >= 1
    );

    harness.manager.shutdown().await;
    harness.pool.shutdown().await;
}

#[tokio::test]
async fn startup_events_replay_to_late_activating_plugins() {
    let harness = harness();

    // The device event arrives before any plugin is active.
    harness
        .manager
        .dispatch_stream_event(attach_event(0x1234))
        .await;

    add_bundle(&harness, "late", &manifest_json("late", "1.0.0")).await;
    let id = PluginId::from_name("late");
    wait_for_state(&harness.manager, id, PluginState::Active).await;

    // The buffered startup event is replayed once to the late arrival.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if harness.metrics.snapshot().get("plugin.late.poked") == Some(&1)
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "startup event never replayed"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let descriptor = harness.manager.get(id).await.unwrap();
    assert_eq!(descriptor.metrics.access_count, 1);

    harness.manager.shutdown().await;
    harness.pool.shutdown().await;
}
