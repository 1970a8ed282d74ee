//! End-to-end pool run against the scripted driver.
//!
//! Demonstrates:
//! - Building a pool configuration with proxies
//! - Starting the worker pool
//! - Submitting jobs and polling their records to completion
//! - Observing proxy rotation and failure cooldown
//!
//! Usage:
//!   cargo run --example scripted_capture --features test-util
//!   RUST_LOG=capture_pool=debug cargo run --example scripted_capture --features test-util

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use capture_pool::driver::fake::{FakeBrowser, ScriptedFetch, ScriptedNavigate, SessionScript};
use capture_pool::driver::{Browser, ResponseEvent};
use capture_pool::{Config, JobInput, WorkerPool};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Scripted Capture Demo ===\n");

    // ========================================================================
    // Script the driver
    // ========================================================================

    println!("[1] Scripting the driver...");

    let browser = FakeBrowser::new();

    // Worker 0: captures normally and serves the direct benefits fetch.
    browser.push_script(SessionScript {
        emit_on_navigate: vec![ResponseEvent {
            url: "https://smartstore.naver.com/i/v2/channels/chan/products/1001".into(),
            status: 200,
            body: Some(json!({
                "channel": {"channelUid": "chan"},
                "productNo": 1001,
                "category": {"categoryId": "50000"},
            })),
        }],
        direct: VecDeque::from([ScriptedFetch::Respond {
            status: 200,
            body: Some(json!({"benefits": ["coupon", "points"]})),
        }]),
        ..Default::default()
    });

    // Worker 1: its first navigation dies, forcing a proxy rotation and a
    // context rebuild.
    browser.push_script(SessionScript {
        navigations: VecDeque::from([ScriptedNavigate::Fail("connection reset".into())]),
        ..Default::default()
    });

    println!("    ✓ Two session scripts queued\n");

    // ========================================================================
    // Start the pool
    // ========================================================================

    println!("[2] Starting the pool...");

    let config = Config::builder()
        .pool_size(2)
        .proxy_list("http://10.0.0.1:8080,http://10.0.0.2:8080,http://10.0.0.3:8080")?
        .capture_timeout(Duration::from_secs(5))
        .fallback_timeout(Duration::from_secs(3))
        .failure_cooldown(Duration::from_secs(30))
        .build()?;

    let browser: Arc<dyn Browser> = browser;
    let pool = WorkerPool::start(config, Arc::clone(&browser)).await?;

    println!("    ✓ {} workers up\n", pool.pool_size());

    // ========================================================================
    // Submit jobs
    // ========================================================================

    println!("[3] Submitting jobs...");

    let handles: Vec<_> = [1001u32, 1002]
        .iter()
        .map(|id| {
            pool.submit(JobInput {
                product_url: format!("https://smartstore.naver.com/demo-shop/products/{id}"),
            })
        })
        .collect::<capture_pool::Result<_>>()?;

    println!(
        "    ✓ {} submitted ({} busy, {} queued)\n",
        handles.len(),
        pool.busy_workers(),
        pool.queue_depth()
    );

    // ========================================================================
    // Poll to completion
    // ========================================================================

    println!("[4] Waiting for terminal records...");

    for handle in &handles {
        match handle.wait(Duration::from_millis(100)).await {
            Some(record) => {
                println!("    job {}: {:?} - {}", handle.id(), record.status, record.message);
                if let Some(result) = record.result {
                    println!(
                        "        channel={:?} benefits={:?} via {:?}",
                        result.channel_uid, result.benefits.body, result.benefits.kind
                    );
                }
                if let Some(error) = record.error {
                    println!("        error: {error}");
                }
            }
            None => println!("    job {}: record swept", handle.id()),
        }
    }

    // ========================================================================
    // Inspect the proxy pool
    // ========================================================================

    println!("\n[5] Proxy pool after the run:");
    for status in pool.proxy_status() {
        println!(
            "    {} fails={} cooling={}",
            status.server_url,
            status.fails,
            status.cooldown_remaining.is_some()
        );
    }

    println!("\n✓ Done");
    Ok(())
}
