use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flashcode_tracker::config::{MarkerConfig, TrackerConfig};
use flashcode_tracker::health::StatisticsSummary;
use flashcode_tracker::sim::{demo_trajectory, Scene, ScriptedModelTracker, SimulatedDetector, TrackStep};
use flashcode_tracker::tracking::{MarkerModel, Tracker, TrackingEvent, TrackingState};

#[derive(Parser)]
#[command(name = "flashcode-tracker")]
#[command(about = "Flashcode-assisted model tracking: detect, initialize, track, recover")]
#[command(version)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and summarize a configuration.
    CheckConfig(ConfigArgs),

    /// Run the tracking lifecycle on a synthetic marker sequence.
    Simulate(SimulateArgs),
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write tracker variances (gnuplot format) to this file.
    #[arg(long)]
    var_file: Option<PathBuf>,

    /// Reject tracking when a variance exceeds this limit.
    #[arg(long)]
    var_limit: Option<f64>,

    /// Hinkley change-point test parameters.
    #[arg(long, num_args = 2, value_names = ["ALPHA", "DELTA"])]
    hinkley: Option<Vec<f64>>,

    /// Verify tracking with checkpoints on the marker's dark band.
    #[arg(long)]
    ad_hoc_recovery: bool,

    /// Flashcode detector timeout in milliseconds.
    #[arg(long)]
    detector_timeout: Option<u64>,
}

#[derive(Debug, Clone, Args)]
struct SimulateArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Number of frames to generate.
    #[arg(long, default_value = "300")]
    frames: u64,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Probability that a single detection attempt fails.
    #[arg(long, default_value = "0.1", value_parser = parse_probability)]
    drop_rate: f64,

    /// Frame at which the tracker reports a variance spike.
    #[arg(long)]
    jump_at: Option<u64>,

    /// Relative noise on the reported variances.
    #[arg(long, default_value = "0.05", value_parser = parse_non_negative)]
    noise: f64,
}

fn parse_probability(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is not a probability in [0, 1]"))
    }
}

fn parse_non_negative(s: &str) -> Result<f64, String> {
    let value: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(format!("{value} must be finite and non-negative"))
    }
}

impl ConfigArgs {
    /// Configuration file (or the demo marker) with command-line overrides.
    fn load(&self) -> Result<TrackerConfig> {
        let mut config = match &self.config {
            Some(path) => TrackerConfig::from_file(path)?,
            None => TrackerConfig {
                marker: MarkerConfig::square(0.03, 0.04, 0.05),
                ..Default::default()
            },
        };

        if let Some(path) = &self.var_file {
            config.logging.var_file = Some(path.clone());
        }
        if let Some(limit) = self.var_limit {
            config.var_limit = Some(limit);
        }
        if let Some(values) = &self.hinkley {
            if let [alpha, delta] = values.as_slice() {
                config.hinkley = Some([*alpha, *delta]);
            }
        }
        if self.ad_hoc_recovery {
            config.recovery.enabled = true;
        }
        if let Some(timeout) = self.detector_timeout {
            config.detector_timeout_ms = timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Serialize)]
struct SimulationReport {
    frames: u64,
    frames_per_state: BTreeMap<String, u64>,
    state_changes: usize,
    tracking_losses: usize,
    mean_step_ms: f64,
    statistics: StatisticsSummary,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::CheckConfig(args) => {
            let config = args.load()?;
            config.log_summary();
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate(args) => simulate(&args)?,
    }
    Ok(())
}

fn simulate(args: &SimulateArgs) -> Result<()> {
    let config = args.config.load()?;
    let scene = Scene::vga(MarkerModel::from_config(&config)?);
    let detector = SimulatedDetector::from_config(&config).with_drop_rate(args.drop_rate, args.seed);
    let model_tracker = ScriptedModelTracker::new(1e-6).with_noise(args.noise, args.seed.wrapping_add(1));
    let mut tracker = Tracker::new(config, detector, model_tracker)?;

    let mut frames_per_state: BTreeMap<String, u64> = BTreeMap::new();
    let mut state_changes = 0;
    let mut tracking_losses = 0;
    let mut total_ms = 0.0;

    for k in 0..args.frames {
        let truth = demo_trajectory(k);
        tracker.detector_mut().set_truth(truth.clone(), scene.camera);
        tracker.model_tracker_mut().set_truth(truth.clone());
        if args.jump_at == Some(k) {
            info!(frame = k, "injecting variance spike");
            tracker.model_tracker_mut().push(TrackStep::Spike(1e-2));
        }

        let step = tracker.process(TrackingEvent::InputReady(scene.frame(k, &truth)))?;
        total_ms += step.timing.total_ms;
        *frames_per_state.entry(step.state.to_string()).or_default() += 1;
        state_changes += step.transitions.iter().filter(|t| t.from != t.to).count();
        tracking_losses += step
            .transitions
            .iter()
            .filter(|t| t.from == TrackingState::TrackModel && t.to == TrackingState::ReDetectFlashcode)
            .count();
    }
    tracker.shutdown()?;

    let report = SimulationReport {
        frames: args.frames,
        frames_per_state,
        state_changes,
        tracking_losses,
        mean_step_ms: if args.frames > 0 {
            total_ms / args.frames as f64
        } else {
            0.0
        },
        statistics: tracker.session().statistics().summary(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_rate_must_be_a_probability() {
        assert_eq!(parse_probability("0.25"), Ok(0.25));
        assert_eq!(parse_probability("1"), Ok(1.0));
        for bad in ["NaN", "inf", "1.5", "-0.1", "often"] {
            assert!(parse_probability(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn test_simulate_rejects_nan_drop_rate() {
        assert!(Cli::try_parse_from(["flashcode-tracker", "simulate", "--drop-rate", "NaN"]).is_err());
        assert!(Cli::try_parse_from(["flashcode-tracker", "simulate", "--noise", "-1"]).is_err());
        assert!(Cli::try_parse_from(["flashcode-tracker", "simulate", "--drop-rate", "0.3"]).is_ok());
    }
}
