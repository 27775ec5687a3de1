// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic doc-cache usage example.
//!
//! Demonstrates:
//! 1. Starting the cache with a SQLite L3 (and Redis L2 if `REDIS_URL` is set)
//! 2. Caching answers under fingerprinted keys
//! 3. Read-through computation with a pooled downstream client
//! 4. Pattern invalidation
//! 5. Health, snapshot and raw metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//!
//! # With a shared tier
//! docker run -d -p 6379:6379 redis:7-alpine
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use doc_cache::{
    fingerprint, CacheConfig, CacheCoordinator, ComputeRequest, Connector, OperationType,
    SampleParams, TierHints,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Stand-in for an LLM client: "connects" instantly, answers slowly.
struct FakeLlm;

#[async_trait::async_trait]
impl Connector for FakeLlm {
    type Connection = u32;
    type Error = String;

    async fn connect(&self) -> Result<u32, String> {
        Ok(42)
    }

    async fn is_healthy(&self, _conn: &mut u32) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "doc_cache=info".into()))
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             doc-cache: Basic Usage Example                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start
    // ─────────────────────────────────────────────────────────────────────────
    let dir = std::env::temp_dir().join("doc_cache_demo");
    std::fs::create_dir_all(&dir)?;
    let db_path = dir.join("l3.db");

    let config = CacheConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        redis_prefix: "demo:".into(),
        sql_url: Some(format!("sqlite://{}?mode=rwc", db_path.display())),
        l1_max_entries: 1_000,
        sweep_interval_ms: 500,
        ..Default::default()
    };

    println!("📦 Starting doc-cache...");
    println!("   └─ L2: {}", config.redis_url.as_deref().unwrap_or("(not configured)"));
    println!("   └─ L3: {}", db_path.display());

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let mut cache = CacheCoordinator::new(config, config_rx);
    cache.start().await?;
    let cache = Arc::new(cache);
    cache.spawn_maintenance();
    println!("   ✅ State: {:?}", cache.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Cache a few answers
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Caching answers...");
    let questions = [
        ("doc42", "what is the refund policy?", "30 days, no questions asked"),
        ("doc42", "who pays return shipping?", "the customer"),
        ("doc7", "when was the contract signed?", "March 3rd"),
    ];
    for (doc, question, answer) in &questions {
        let key = fingerprint(&format!("q:{}", doc), [*question]);
        let report = cache.put(&key, answer.as_bytes().to_vec(), None, TierHints::all()).await;
        println!("   └─ {} → {:?}", &key[..16], report.written);
    }

    println!("\n📖 Reading back...");
    for (doc, question, _) in &questions {
        let key = fingerprint(&format!("q:{}", doc), [*question]);
        let start = std::time::Instant::now();
        let lookup = cache.get(&key).await;
        let elapsed = start.elapsed();
        let tier = lookup.tier();
        match lookup.into_entry() {
            Some(entry) => println!(
                "   └─ {:?}: {} ({:?})",
                tier,
                String::from_utf8_lossy(&entry.value),
                elapsed
            ),
            None => println!("   └─ {} → MISS ({:?})", &key[..16], elapsed),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read-through with a pooled client
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🤖 Read-through compute...");
    let llm = cache.pools().register("llm", FakeLlm);
    let key = fingerprint("q:doc9", ["summarize section 4"]);
    let request = ComputeRequest::new(OperationType::LlmCall)
        .with_params(SampleParams { chunk_size: 512, retrieval_count: 5 })
        .with_ttl(Duration::from_secs(120));

    for attempt in 1..=2 {
        let computed = cache
            .get_or_compute(&key, &llm, request, |_conn| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, std::io::Error>(b"Section 4 covers warranty terms.".to_vec())
            })
            .await?;
        println!(
            "   └─ attempt {}: cached={} from={:?}",
            attempt,
            computed.was_cached(),
            computed.served_from
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Invalidate everything derived from doc42
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🧹 Invalidating q:doc42:* ...");
    let report = cache.invalidate_glob("q:doc42:*").await?;
    println!("   └─ removed {} entries, clean={}", report.removed_total(), report.is_clean());

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = cache.health_check().await;
    println!("\n🩺 Health: healthy={}", health.healthy);
    for tier in &health.tiers {
        println!(
            "   └─ {:?}: configured={} reachable={:?} dirty={}",
            tier.tier, tier.configured, tier.reachable, tier.dirty
        );
    }

    let snapshot = cache.metrics_snapshot();
    println!("\n📊 Snapshot:");
    println!("   └─ lookups={} hits={} hit_rate={:.2}", snapshot.lookups, snapshot.hits, snapshot.hit_rate);
    println!("   └─ computes={} L1 entries={}", snapshot.computes, snapshot.l1_entries);
    for rec in &snapshot.recommendations {
        println!("   └─ 💡 {}: {:?} {} → {}", rec.scope, rec.parameter, rec.current_value, rec.suggested_value);
    }
    println!("\n{}", serde_json::to_string_pretty(&snapshot)?);

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    for drain in cache.shutdown().await {
        println!("   └─ pool {}: {:?}", drain.pool, drain);
    }
    println!("   ✅ State: {:?}", cache.state());

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}

/// Dump captured metrics grouped by kind.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let rendered = match value {
            DebugValue::Counter(v) => format!("counter {}{} = {}", key.name(), label_str, v),
            DebugValue::Gauge(v) => format!("gauge   {}{} = {:.2}", key.name(), label_str, v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                format!("hist    {}{} count={} avg={:.4}", key.name(), label_str, count, avg)
            }
        };
        lines.push(rendered);
    }
    lines.sort();

    if lines.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
    for line in lines {
        println!("   └─ {}", line);
    }
}
