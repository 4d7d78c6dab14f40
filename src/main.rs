//! Orchestration entry point: wires the CLI, the pipeline loop, and the
//! dispatcher together behind a panic hook and two `tokio::spawn`'d
//! collaborator tasks.

use anyhow::Result;
use clap::Parser;
use rep_tracker_rs::classifier::{ClassifierAdapter, UnavailableEngine};
use rep_tracker_rs::config::{Args, DeviceInfo, Thresholds, SAMPLE_PERIOD_SECS, TICK_PERIOD_MS};
use rep_tracker_rs::dispatcher::{
    self, AppState, ControlCommand, OutboundMessage, RepEvent, RepUpdate, StatusMessage,
};
use rep_tracker_rs::pipeline::Pipeline;
use rep_tracker_rs::rep_detector::RepMode;
use rep_tracker_rs::sensors::{ImuSource, MockImuSource};
use rep_tracker_rs::session::{RecorderState, SessionRecorder};
use std::panic;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;

const READ_RETRY_DELAY_MS: u64 = 50;
const CONSECUTIVE_FAILURES_BEFORE_REINIT: u32 = 10;
const REINIT_RETRY_DELAY_MS: u64 = 250;
const FAULT_ERROR_THROTTLE_SECS: f64 = 1.0;

#[tokio::main]
async fn main() -> Result<()> {
    install_panic_hook();
    env_logger::init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.sessions_dir)?;
    std::fs::create_dir_all(&args.exports_dir)?;

    let device_info = DeviceInfo::from(&args);
    let thresholds = Thresholds::default();

    log::info!(
        "rep_tracker starting: host={} port={} classifier_enabled={} mock_imu={}",
        args.host, args.port, args.enable_classifier, args.mock_imu
    );

    let (broadcast_tx, last_snapshot) = dispatcher::new_broadcast();
    let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(16);

    let app_state = AppState {
        broadcast_tx,
        last_snapshot,
        control_tx,
        sessions_dir: args.sessions_dir.clone(),
        exports_dir: args.exports_dir.clone(),
        device_info: device_info.clone(),
        thresholds,
    };

    let server_state = app_state.clone();
    let host = args.host.clone();
    let port = args.port;
    let server_handle = tokio::spawn(async move {
        let router = dispatcher::router(server_state);
        let addr: std::net::SocketAddr = format!("{host}:{port}").parse().expect("invalid host/port");
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                log::info!("dispatcher listening on {addr}");
                if let Err(e) = axum::serve(listener, router).await {
                    log::error!("dispatcher server error: {e}");
                }
            }
            Err(e) => log::error!("failed to bind {addr}: {e}"),
        }
    });

    let pipeline_handle = tokio::spawn(run_pipeline_loop(args, device_info, thresholds, app_state, control_rx));

    tokio::select! {
        _ = server_handle => {}
        _ = pipeline_handle => {}
    }

    Ok(())
}

fn install_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let msg = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        log::error!("panic: {msg} at {location}");
        original_hook(panic_info);
    }));
}

fn build_classifier(args: &Args) -> Option<ClassifierAdapter> {
    if args.enable_classifier {
        Some(ClassifierAdapter::new(Box::new(UnavailableEngine::new()), args.inference_stride))
    } else {
        None
    }
}

fn build_source(args: &Args) -> Box<dyn ImuSource> {
    // The real sensor-bus driver is out of scope; the mock generator is the
    // only collaborator this crate ships (spec.md §6's boundary).
    let _ = args.mock_imu;
    Box::new(MockImuSource::new(SAMPLE_PERIOD_SECS))
}

async fn run_pipeline_loop(
    args: Args,
    device_info: DeviceInfo,
    thresholds: Thresholds,
    state: AppState,
    mut control_rx: mpsc::Receiver<ControlCommand>,
) {
    let mut pipeline = Pipeline::new(thresholds, build_classifier(&args));
    let mut recorder = SessionRecorder::new();
    let mut source = build_source(&args);

    let mut ticker = interval(Duration::from_secs_f64(SAMPLE_PERIOD_SECS));
    let mut t = 0.0_f64;
    let mut last_publish_t = f64::NEG_INFINITY;
    let mut consecutive_failures: u32 = 0;
    let mut last_fault_report_t = f64::NEG_INFINITY;

    loop {
        tokio::select! {
            biased;
            Some(cmd) = control_rx.recv() => {
                handle_control_command(cmd, &mut pipeline, &mut recorder, &args, &device_info, &state).await;
            }
            _ = ticker.tick() => {
                match source.read().await {
                    Ok(sample) => {
                        consecutive_failures = 0;
                        let dt = SAMPLE_PERIOD_SECS;
                        t += dt;
                        let tick = pipeline.process_sample(sample, dt);

                        if recorder.is_active() {
                            let moving = tick.mode == RepMode::Moving;
                            recorder.on_tick(moving, dt, tick.filtered_gyro);
                            let _ = recorder.append_raw(&serde_json::json!({
                                "t": tick.t,
                                "sample": sample,
                                "velocity": tick.velocity,
                                "displacement": tick.displacement,
                            }));
                        }

                        if let Some(rep_result) = &tick.rep_result {
                            let tempo = if recorder.is_active() {
                                recorder.on_rep_complete(tick.t, rep_result.recorder_inputs())
                            } else {
                                None
                            };
                            dispatcher::publish(&state, OutboundMessage::RepEvent(RepEvent {
                                rep: rep_result.rep_count,
                                t: tick.t,
                                tempo_sec: tempo,
                                peak_gyro: rep_result.peak_gyro,
                                peak_speed_proxy: rep_result.peak_speed_proxy,
                                peak_velocity_ms: rep_result.velocity.peak_velocity,
                                rom_m: rep_result.rom_m,
                            })).await;
                        }

                        if t - last_publish_t >= TICK_PERIOD_MS as f64 / 1000.0 {
                            last_publish_t = t;
                            publish_rep_update(&state, &pipeline, &recorder, &tick).await;
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        log::warn!("imu read failed ({consecutive_failures} consecutive): {e}");

                        if t - last_fault_report_t >= FAULT_ERROR_THROTTLE_SECS {
                            last_fault_report_t = t;
                            dispatcher::publish(&state, OutboundMessage::Error {
                                r#where: "sensor_read".to_string(),
                                error: format!("{consecutive_failures} consecutive read failures: {e}"),
                            }).await;
                        }

                        if consecutive_failures >= CONSECUTIVE_FAILURES_BEFORE_REINIT {
                            source.close();
                            source = build_source(&args);
                            tokio::time::sleep(Duration::from_millis(REINIT_RETRY_DELAY_MS)).await;
                        } else {
                            tokio::time::sleep(Duration::from_millis(READ_RETRY_DELAY_MS)).await;
                        }
                        // the clock does not advance on a faulted tick (spec.md §5)
                    }
                }
            }
        }
    }
}

async fn publish_rep_update(
    state: &AppState,
    pipeline: &Pipeline,
    recorder: &SessionRecorder,
    tick: &rep_tracker_rs::pipeline::PipelineTick,
) {
    let state_label = if pipeline.is_calibrating() {
        "CALIBRATING"
    } else {
        match tick.mode {
            RepMode::Waiting => "WAITING",
            RepMode::Moving => "MOVING",
        }
    };
    let (detected_lift, lift_confidence) = tick
        .classifier_update
        .clone()
        .map(|(label, conf)| (Some(label), Some(conf)))
        .unwrap_or((None, None));

    dispatcher::publish(state, OutboundMessage::RepUpdate(RepUpdate {
        t: tick.t,
        reps: tick.rep_count,
        state: state_label.to_string(),
        recording: recorder.is_active(),
        gyro_filt: tick.filtered_gyro,
        tut_sec: recorder.tut_sec(),
        avg_tempo_sec: recorder.avg_tempo_sec(),
        output_loss_pct: recorder.output_loss_pct(),
        avg_peak_speed_proxy: recorder.avg_peak_speed_proxy(),
        speed_loss_pct: recorder.speed_loss_pct(),
        velocity: tick.velocity,
        displacement: tick.displacement,
        roll: tick.euler.roll,
        pitch: tick.euler.pitch,
        yaw: tick.euler.yaw,
        avg_velocity_ms: pipeline.avg_peak_velocity(),
        velocity_loss_pct: pipeline.velocity_loss_pct(),
        avg_rom_m: pipeline.avg_rom(),
        rom_loss_pct: pipeline.rom_loss_pct(),
        detected_lift,
        lift_confidence,
    }))
    .await;
}

async fn handle_control_command(
    cmd: ControlCommand,
    pipeline: &mut Pipeline,
    recorder: &mut SessionRecorder,
    args: &Args,
    device_info: &DeviceInfo,
    state: &AppState,
) {
    match cmd {
        ControlCommand::Start { reply } => {
            let result = recorder.start(&args.sessions_dir);
            match &result {
                Ok(info) => {
                    log::info!("session started: {}", info.session_id);
                    // classifier votes clear at every START, never at STOP (spec.md §3 invariant)
                    pipeline.reset_classifier_votes();
                }
                Err(e) => log::warn!("session start rejected: {e}"),
            }
            publish_status(recorder, pipeline, device_info, state).await;
            let _ = reply.send(result);
        }
        ControlCommand::Stop { reply } => {
            let device_json = serde_json::to_value(device_info).unwrap_or(serde_json::Value::Null);
            let result = recorder.stop(device_json, pipeline.thresholds());
            match &result {
                Ok(summary) => log::info!("session stopped: {} ({} reps)", summary.session_id, summary.total_reps),
                Err(e) => log::warn!("session stop failed: {e}"),
            }
            publish_status(recorder, pipeline, device_info, state).await;
            let _ = reply.send(result);
        }
        ControlCommand::Reset { reply } => {
            log::info!("pipeline reset requested");
            pipeline.reset();
            pipeline.reset_classifier_votes();
            let _ = reply.send(());
        }
    }
}

async fn publish_status(recorder: &SessionRecorder, pipeline: &Pipeline, device_info: &DeviceInfo, state: &AppState) {
    let recording = matches!(recorder.state(), RecorderState::Active);
    dispatcher::publish(state, OutboundMessage::Status(StatusMessage {
        recording,
        session_id: None, // session id is surfaced via the `start` ack and session summaries, not status
        reps: 0,
        state: if pipeline.is_calibrating() { "CALIBRATING".to_string() } else { "WAITING".to_string() },
        device_info: device_info.clone(),
        thresholds: pipeline.thresholds(),
    }))
    .await;
}
