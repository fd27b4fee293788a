//! driftwatch: a multi-sensor anomaly observability core.
//!
//! Readings from heterogeneous sensors are scored against per-parameter
//! rolling baselines, correlated anomalies are grouped into temporal
//! clusters, and clusters are tracked as conditions whose statistical
//! relationship to later external events (price swings, earthquakes,
//! solar storms) is measured and self-calibrated. The system observes
//! and reports frequencies; it never claims to predict.

pub mod bus;
pub mod clock;
pub mod config;
pub mod detect;
pub mod patterns;
pub mod pipeline;
pub mod sched;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::FutureExt;
use rand::Rng;
use tracing::{info, warn};

use bus::{Event, EventBus, EventFilter, EventType, Severity};
use config::WatchConfig;
use patterns::TrackerSnapshot;
use pipeline::{SensorReading, Watcher};
use sched::{Priority, Scheduler};

/// How often tracker state is persisted, in seconds.
const SAVE_INTERVAL_SECS: f64 = 300.0;
/// How often the health report is published, in seconds.
const HEALTH_INTERVAL_SECS: f64 = 60.0;

/// Run the watcher until interrupted.
///
/// Tracker state is restored from `patterns_path` when present, saved
/// there periodically, and saved again on shutdown. With `demo` set, a
/// synthetic sensor feed keeps the pipeline busy without any real
/// upstream sources.
pub async fn run(config: WatchConfig, patterns_path: PathBuf, demo: bool) -> Result<()> {
    let bus = Arc::new(EventBus::new(config.bus.max_buffer_size));
    let watcher = Arc::new(Watcher::new(&config, Arc::clone(&bus)));

    restore_tracker(&watcher, &patterns_path).await;

    // Anything at warning severity or above lands in the log.
    bus.subscribe(
        Arc::new(|event: &Event| {
            warn!(
                source = %event.source,
                event_type = ?event.event_type,
                severity = ?event.severity,
                payload = %event.payload,
                "bus alert"
            );
            Ok(())
        }),
        EventFilter {
            min_severity: Some(Severity::Warning),
            ..EventFilter::default()
        },
    );

    let scheduler = Scheduler::with_tick(
        config.scheduler.max_concurrent,
        std::time::Duration::from_millis(config.scheduler.tick_ms),
    );

    if demo {
        let feed = Arc::clone(&watcher);
        scheduler.register_task(
            "demo-feed",
            Arc::new(move || {
                let watcher = Arc::clone(&feed);
                async move { feed_demo_readings(&watcher) }.boxed()
            }),
            1.0,
            Priority::High,
        );
    }

    {
        let save = Arc::clone(&watcher);
        let path = patterns_path.clone();
        scheduler.register_task(
            "patterns-save",
            Arc::new(move || {
                let watcher = Arc::clone(&save);
                let path = path.clone();
                async move { save_tracker(&watcher, &path).await }.boxed()
            }),
            SAVE_INTERVAL_SECS,
            Priority::Low,
        );
    }

    {
        let flush = Arc::clone(&watcher);
        scheduler.register_task(
            "cluster-flush",
            Arc::new(move || {
                let watcher = Arc::clone(&flush);
                async move {
                    watcher.flush_stale_clusters(clock::epoch_now())?;
                    Ok(())
                }
                .boxed()
            }),
            config.cluster.time_window_secs,
            Priority::Low,
        );
    }

    {
        let health = Arc::clone(&watcher);
        let sched = scheduler.clone();
        scheduler.register_task(
            "health-report",
            Arc::new(move || {
                let watcher = Arc::clone(&health);
                let sched = sched.clone();
                async move { publish_health(&watcher, &sched) }.boxed()
            }),
            HEALTH_INTERVAL_SECS,
            Priority::Medium,
        );
    }

    scheduler.start();
    bus.publish(&Event::new(
        "watcher",
        EventType::System,
        serde_json::json!({ "state": "started", "demo": demo }),
    ));
    info!(demo, patterns = %patterns_path.display(), "watcher running");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");

    scheduler.stop();
    watcher.flush_clusters()?;
    save_tracker(&watcher, &patterns_path).await?;
    bus.publish(&Event::new(
        "watcher",
        EventType::System,
        serde_json::json!({ "state": "stopped" }),
    ));
    Ok(())
}

async fn restore_tracker(watcher: &Watcher, path: &Path) {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(_) => {
            info!(path = %path.display(), "no saved patterns, starting fresh");
            return;
        }
    };
    match TrackerSnapshot::from_json(&json) {
        Ok(snapshot) => {
            watcher.tracker().restore(snapshot, clock::epoch_now());
        }
        Err(err) => {
            // A corrupt snapshot costs history, not availability.
            warn!(path = %path.display(), %err, "ignoring unreadable pattern snapshot");
        }
    }
}

async fn save_tracker(watcher: &Watcher, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let json = watcher.tracker().snapshot().to_json()?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "pattern snapshot saved");
    Ok(())
}

fn publish_health(watcher: &Watcher, scheduler: &Scheduler) -> Result<()> {
    let payload = serde_json::json!({
        "bus": watcher.bus().stats(),
        "tasks": scheduler.all_stats(),
        "detector_windows": watcher.detector().window_count(),
        "pattern_groups": watcher.tracker().pattern_group_count(),
        "recent_conditions": watcher.tracker().recent_condition_count(),
    });
    watcher
        .bus()
        .publish(&Event::new("watcher", EventType::Health, payload));
    Ok(())
}

/// One synthetic reading per known sensor, with rare injected extremes so
/// anomalies, clusters and rule events all fire during a demo run.
fn feed_demo_readings(watcher: &Watcher) -> Result<()> {
    let now = clock::epoch_now();
    let mut rng = rand::thread_rng();

    let quake_magnitude = if rng.gen_bool(0.02) {
        rng.gen_range(5.0..7.5)
    } else {
        rng.gen_range(1.0..4.0)
    };
    let kp_index = if rng.gen_bool(0.02) {
        rng.gen_range(5.0..9.0)
    } else {
        rng.gen_range(0.0..4.0)
    };
    let randomness = if rng.gen_bool(0.02) {
        rng.gen_range(0.80..0.90)
    } else {
        rng.gen_range(0.93..1.0)
    };
    let btc = 100_000.0 * (1.0 + rng.gen_range(-0.002..0.002));
    let eth = 4_000.0 * (1.0 + rng.gen_range(-0.003..0.003));

    let readings = [
        SensorReading {
            timestamp: now,
            source: "seismic".to_string(),
            data: serde_json::json!({
                "max_magnitude": quake_magnitude,
                "quake_count": rng.gen_range(0..20),
                "latitude": 36.0,
                "longitude": 140.0,
            }),
        },
        SensorReading {
            timestamp: now,
            source: "space_weather".to_string(),
            data: serde_json::json!({
                "kp_index": kp_index,
                "solar_wind_speed": rng.gen_range(300.0..500.0),
            }),
        },
        SensorReading {
            timestamp: now,
            source: "quantum_rng".to_string(),
            data: serde_json::json!({ "randomness_score": randomness }),
        },
        SensorReading {
            timestamp: now,
            source: "crypto".to_string(),
            data: serde_json::json!({
                "pairs": [
                    { "symbol": "BTCUSDT", "price": btc },
                    { "symbol": "ETHUSDT", "price": eth },
                ],
                "btcusdt.price_change_24h_percent": rng.gen_range(-1.0..1.0),
            }),
        },
    ];

    for reading in &readings {
        watcher.ingest(reading)?;
    }
    Ok(())
}
