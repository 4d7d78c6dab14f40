//! Replays a recorded session's raw log back through a fresh `Pipeline` and
//! prints a reconciliation against the stored `summary.json`.

use clap::Parser;
use rep_tracker_rs::config::Thresholds;
use rep_tracker_rs::pipeline::Pipeline;
use rep_tracker_rs::session;
use rep_tracker_rs::types::ImuSample;
use serde::Deserialize;
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(about = "Replay a recorded session's raw.jsonl through the pipeline offline")]
struct Args {
    /// Path to a session directory, e.g. sessions/session_2026-01-01T00-00-00Z
    #[arg(long)]
    session_dir: PathBuf,
}

#[derive(Deserialize)]
struct RawLine {
    sample: ImuSample,
}

fn load_raw_samples(path: &Path) -> anyhow::Result<Vec<ImuSample>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut samples = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: RawLine = serde_json::from_str(&line)?;
        samples.push(parsed.sample);
    }
    Ok(samples)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let raw_path = args.session_dir.join("raw.jsonl");
    let samples = load_raw_samples(&raw_path)?;

    let stored_summary = session::read_summary(&args.session_dir).ok();

    let mut pipeline = Pipeline::new(Thresholds::default(), None);
    let mut prev_t: Option<f64> = None;
    let mut replayed_reps: u32 = 0;

    for sample in &samples {
        let dt = prev_t.map(|p| (sample.timestamp - p).max(1e-6)).unwrap_or(1.0 / 50.0);
        let tick = pipeline.process_sample(*sample, dt);
        if tick.rep_result.is_some() {
            replayed_reps = tick.rep_count;
        }
        prev_t = Some(sample.timestamp);
    }

    let stored_reps = stored_summary.as_ref().map(|s| s.total_reps);
    let matches = stored_reps.map(|r| r == replayed_reps);

    println!(
        "{}",
        json!({
            "session_dir": args.session_dir.to_string_lossy(),
            "samples_replayed": samples.len(),
            "replayed_total_reps": replayed_reps,
            "stored_total_reps": stored_reps,
            "reps_match": matches,
            "avg_peak_velocity_ms": pipeline.avg_peak_velocity(),
            "velocity_loss_pct": pipeline.velocity_loss_pct(),
            "avg_rom_m": pipeline.avg_rom(),
            "rom_loss_pct": pipeline.rom_loss_pct(),
        })
    );

    Ok(())
}
