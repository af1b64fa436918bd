//! tscell - runs a synthetic workload through the engine on an in-memory store
//!
//! ```text
//! tscell [--config engine.json] [--series 50] [--points 2000]
//! ```

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tscell_core::config::EngineConfig;
use tscell_core::storage::MemoryStore;
use tscell_core::{Engine, Value};

/// Synthetic write and compaction workload against an in-memory store
#[derive(Parser, Debug)]
#[command(name = "tscell", version, about)]
struct Args {
    /// Engine configuration (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of series to write
    #[arg(long, default_value_t = 50)]
    series: u64,

    /// Points written per series
    #[arg(long, default_value_t = 2000)]
    points: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    info!("Starting tscell {}", tscell_core::VERSION);
    info!(
        "Writing {} points per series for {} series",
        args.points, args.series
    );

    let store = Arc::new(MemoryStore::new());
    let engine = Engine::open(config, store.clone())?;

    // Three hours back, so every row is old enough to compact.
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let start = now - 10_800;
    let mut rng = rand::thread_rng();

    for metric in 0..args.series {
        let series = engine.series(metric, &[(1, metric % 4)])?;
        for i in 0..args.points {
            let secs = start + (i * 3) % 3_600;
            let value = if rng.gen_bool(0.3) {
                Value::Float(rng.gen_range(0.0..100.0))
            } else {
                Value::Integer(rng.gen_range(-1_000..1_000))
            };
            if rng.gen_bool(0.2) {
                let millis = secs * 1_000 + rng.gen_range(0..1_000);
                engine.add_point(&series, millis, value).await?;
            } else {
                engine.add_point(&series, secs, value).await?;
            }
        }
    }

    info!(
        "Wrote {} cells across {} rows, {} rows pending",
        store.cell_count(),
        store.row_count(),
        engine.pending_rows()
    );

    let report = engine.flush().await;
    info!("Forced flush compacted {} rows", report.compacted);

    let sample = engine.series(0, &[(1, 0)])?;
    let row = engine.read_row(&sample, start).await?;
    info!(
        "Row at base time {} holds {} points",
        row.base_time,
        row.points.len()
    );

    engine.shutdown().await?;
    info!(
        "Store holds {} cells after compaction ({:?})",
        store.cell_count(),
        store.ops()
    );

    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    Ok(())
}
