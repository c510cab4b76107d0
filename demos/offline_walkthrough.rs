// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offline round trip against an in-memory remote.
//!
//! Demonstrates:
//! 1. Opening a store on a throwaway data directory (SQLite + file tiers)
//! 2. Creating and editing records while disconnected
//! 3. Reading them back from the local cache
//! 4. Reconnecting and letting the background loop drain the queue
//! 5. Dumping the captured metrics
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=offline_sync=debug cargo run --example offline_walkthrough
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use offline_sync::{InMemoryRemoteStore, NetworkMonitor, OfflineConfig, OfflineStore};

#[derive(Debug, Serialize, Deserialize)]
struct Sample {
    patient: String,
    test: String,
    #[serde(default)]
    status: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offline_sync=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║              offline-sync: Offline Walkthrough                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Open the store, starting disconnected
    // ─────────────────────────────────────────────────────────────────────────
    let data_dir = tempfile::tempdir()?;
    let config = OfflineConfig {
        project: "labops".into(),
        tenant_id: "clinic-42".into(),
        data_dir: Some(data_dir.path().to_path_buf()),
        watched_collections: vec!["samples".into()],
        ..Default::default()
    };

    let remote = Arc::new(InMemoryRemoteStore::new());
    let network = Arc::new(NetworkMonitor::new(false));
    let store = OfflineStore::initialize(config, remote.clone(), network.clone()).await?;
    println!("📦 Store open on tiers {:?}", store.storage().tier_names());

    let _progress = store.on_sync_progress(|p| {
        println!("   └─ sync {}/{} {}", p.completed, p.total, p.last_error.as_deref().unwrap_or(""));
    });

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📴 Offline writes...");
    let samples = store.gateway::<Sample>("samples");
    let mut ids = Vec::new();
    for (patient, test) in [("Ada", "cbc"), ("Bo", "lipid"), ("Cy", "hba1c")] {
        let record = samples
            .create(&Sample {
                patient: patient.into(),
                test: test.into(),
                status: "collected".into(),
            })
            .await?;
        println!("   └─ created {} (offline: {})", record.id, record.is_offline);
        ids.push(record.id);
    }
    samples.update(&ids[0], &json!({"status": "in_lab"})).await?;
    samples.delete(&ids[2]).await?;
    println!("   Status: {:?}", store.sync_status().await);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read from the cache
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Cached view while offline:");
    for record in samples.read(|_| true).await? {
        println!("   └─ {} → {:?}", record.id, record.data);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconnect; the background loop drains the queue
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Reconnecting...");
    network.set_connected(true);
    for _ in 0..100 {
        if store.sync_status().await.pending_changes == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let status = store.sync_status().await;
    println!("   Status: {status:?}");
    println!("   Remote now holds {} samples", remote.len("samples"));

    println!("\n📖 Cached view after sync:");
    for record in samples.read(|_| true).await? {
        println!("   └─ {} → {:?} (offline: {})", record.id, record.data, record.is_offline);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Metrics and shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Metrics:");
    dump_metrics(&snapshotter);

    store.shutdown().await;
    println!("\n✅ Done\n");
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
            };
            format!("{}{{{}}} = {}", key.name(), labels.join(","), value)
        })
        .collect();
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {line}");
    }
}
