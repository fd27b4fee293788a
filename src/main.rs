use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use driftwatch::config::WatchConfig;
use driftwatch::patterns::{Condition, EventCategory, PatternTracker, TrackerSnapshot};

#[derive(Parser)]
#[command(
    name = "driftwatch",
    about = "Multi-sensor anomaly watcher: baselines, clusters, measured event probabilities",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the watcher pipeline until interrupted
    Run {
        /// Where tracker state is loaded from and saved to
        #[arg(long, default_value = "data/patterns.json")]
        patterns_file: PathBuf,

        /// Feed synthetic sensor readings instead of waiting for real ones
        #[arg(long)]
        demo: bool,

        /// Optional JSON config file; defaults apply for missing fields
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Inspect saved pattern state
    Patterns {
        #[command(subcommand)]
        action: PatternsAction,
    },
}

#[derive(Subcommand)]
enum PatternsAction {
    /// Show calibration quality across all learned patterns
    Calibration {
        /// Pattern snapshot file
        #[arg(long, default_value = "data/patterns.json")]
        file: PathBuf,
    },

    /// Show probability estimates for a hypothetical condition
    Show {
        /// Pattern snapshot file
        #[arg(long, default_value = "data/patterns.json")]
        file: PathBuf,

        /// Cluster level of the condition (1-5)
        #[arg(long, default_value = "3")]
        level: u8,

        /// Sources involved, comma separated
        #[arg(long, default_value = "crypto,seismic")]
        sources: String,

        /// Restrict to one category (crypto, earthquake, space_weather, blockchain)
        #[arg(long)]
        category: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            patterns_file,
            demo,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            tracing::info!(demo, "Starting driftwatch");
            driftwatch::run(config, patterns_file, demo).await?;
        }
        Commands::Patterns { action } => match action {
            PatternsAction::Calibration { file } => {
                let tracker = load_tracker(&file)?;
                let stats = tracker.calibration_stats();
                println!("\n=== Pattern Calibration ===");
                println!("Patterns with enough data : {}", stats.total_patterns);
                println!("Average Brier score       : {:.4}", stats.avg_brier_score);
                println!(
                    "Well calibrated (<0.1)    : {:.1}%",
                    stats.well_calibrated_percent
                );
                println!("===========================\n");
            }
            PatternsAction::Show {
                file,
                level,
                sources,
                category,
            } => {
                let tracker = load_tracker(&file)?;
                let sources: Vec<String> =
                    sources.split(',').map(|s| s.trim().to_string()).collect();
                let category = category.as_deref().map(parse_category).transpose()?;
                let condition =
                    Condition::new(driftwatch::clock::epoch_now(), level, sources, 50.0, 1.0);
                let estimates = tracker.get_probabilities(&condition, category);

                if estimates.is_empty() {
                    println!("No estimates for condition '{}'.", condition.key());
                } else {
                    println!("Estimates for condition '{}':", condition.key());
                    println!(
                        "{:<25} | {:<6} | {:<10} | {:<6} | Window",
                        "Event", "Prob", "Avg lead", "Obs"
                    );
                    println!("{:-<25}-|-{:-<6}-|-{:-<10}-|-{:-<6}-|-{:-<16}", "", "", "", "", "");
                    for est in estimates {
                        let window = match (est.min_time_hours, est.max_time_hours) {
                            (Some(min), Some(max)) => format!("{:.1}h - {:.1}h", min, max),
                            _ => "-".to_string(),
                        };
                        println!(
                            "{:<25} | {:>5.1}% | {:>8.1}h | {:<6} | {}",
                            est.event_type,
                            est.probability * 100.0,
                            est.avg_time_hours,
                            est.observations,
                            window
                        );
                        if let Some(region) = &est.region {
                            println!("{:<25} |   -> likely region: {}", "", region);
                        }
                    }
                }
            }
        },
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<WatchConfig> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&json)?)
        }
        None => Ok(WatchConfig::default()),
    }
}

fn load_tracker(path: &std::path::Path) -> Result<PatternTracker> {
    let json = std::fs::read_to_string(path)?;
    let snapshot = TrackerSnapshot::from_json(&json)?;
    let tracker = PatternTracker::new(&WatchConfig::default().patterns);
    tracker.restore(snapshot, driftwatch::clock::epoch_now());
    Ok(tracker)
}

fn parse_category(name: &str) -> Result<EventCategory> {
    match name {
        "crypto" => Ok(EventCategory::Crypto),
        "earthquake" => Ok(EventCategory::Earthquake),
        "space_weather" => Ok(EventCategory::SpaceWeather),
        "blockchain" => Ok(EventCategory::Blockchain),
        other => anyhow::bail!("unknown category '{other}'"),
    }
}
