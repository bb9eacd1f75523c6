mod telemetry;

use clap::Parser;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use telemetry::Trekker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Writes simulated trekker telemetry to a newline-delimited JSON feed file.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Feed file the monitor polls
    #[arg(long, env = "FEED_PATH", default_value = "data.txt")]
    output: PathBuf,

    /// Milliseconds between readings
    #[arg(long, env = "INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Comma-separated device ids
    #[arg(long, env = "DEVICES", default_value = "p1,p2", value_delimiter = ',')]
    devices: Vec<String>,

    #[arg(long, default_value_t = 12.961, allow_hyphen_values = true)]
    center_lat: f64,

    #[arg(long, default_value_t = 77.598, allow_hyphen_values = true)]
    center_lon: f64,

    /// Chance per reading that an emergency episode starts
    #[arg(long, default_value_t = 0.02)]
    alert_probability: f64,

    /// Number of most recent lines kept in the feed file
    #[arg(long, default_value_t = 200)]
    keep: usize,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.alert_probability) {
        error!("--alert-probability must be within [0, 1]");
        std::process::exit(1);
    }

    info!("Starting Trekker Simulator");
    info!(
        "Output: {}, Interval: {}ms, Devices: {:?}",
        args.output.display(),
        args.interval_ms,
        args.devices
    );

    let mut trekkers: Vec<Trekker> = args
        .devices
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let offset = i as f64 * 0.0005;
            Trekker::new(id.trim().to_string(), args.center_lat + offset, args.center_lon + offset)
        })
        .collect();

    let mut rng = rand::thread_rng();
    let mut lines: VecDeque<String> = VecDeque::with_capacity(args.keep + trekkers.len());
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut counter = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }

        for trekker in trekkers.iter_mut() {
            let reading = trekker.step(&mut rng, args.alert_probability);
            if reading.alert == 1 {
                warn!("{} reporting emergency", reading.id);
            }
            match serde_json::to_string(&reading) {
                Ok(line) => lines.push_back(line),
                Err(e) => error!("Failed to serialize reading: {}", e),
            }
        }

        while lines.len() > args.keep {
            lines.pop_front();
        }

        if let Err(e) = write_feed(&args.output, &lines).await {
            warn!("Failed to write {}: {}", args.output.display(), e);
            continue;
        }

        counter += 1;
        if counter % 50 == 0 {
            info!("Wrote {} rounds of readings", counter);
        }
    }

    info!("Simulator stopped");
}

/// Replaces the feed file so readers never see a half-written line.
async fn write_feed(path: &Path, lines: &VecDeque<String>) -> std::io::Result<()> {
    let mut body = String::new();
    for line in lines {
        body.push_str(line);
        body.push('\n');
    }

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await
}
