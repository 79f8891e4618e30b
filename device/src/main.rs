mod arbiter;
mod camera;
mod classify;
mod command;
mod indicator;
mod reporter;
mod scheduler;
mod server;
mod stream;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use wastecam_common::config::{Config, MainLoopConfig};

use crate::arbiter::CaptureArbiter;
use crate::camera::FrameSource;
use crate::classify::{ClassificationStage, ColorSignatureModel};
use crate::command::{Command, CommandController, Dispatch};
use crate::indicator::{Indicator, LogIndicator};
use crate::reporter::{BackendReporter, LinkStatus};
use crate::scheduler::{InferenceScheduler, SchedulerState};
use crate::server::{AppState, ViewerSlots};
use crate::stream::StreamProducer;

/// Exit status asking the supervisor to start the device again.
const RESTART_EXIT_CODE: i32 = 3;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        device = config.device.id,
        driver = config.camera.driver,
        backend = config.backend.report_url(),
        "starting wastecam device"
    );

    let largest_streamable = stream::max_payload(config.stream.chunk_bytes);
    if config.camera.buffer_bytes > largest_streamable {
        info!(
            chunk_bytes = config.stream.chunk_bytes,
            buffer_bytes = config.camera.buffer_bytes,
            largest_streamable,
            "frames larger than the stream chunk will be dropped from the stream"
        );
    }

    let source = match camera::build_driver(&config.camera)
        .and_then(|driver| FrameSource::open(driver, config.camera.buffer_bytes))
    {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "camera init failed");
            std::process::exit(1);
        }
    };
    let arbiter = Arc::new(CaptureArbiter::new(
        source,
        config.inference.wait(),
        config.stream.wait(),
    ));

    let model = ColorSignatureModel::new(
        config.inference.labels.clone(),
        config.inference.input_width,
        config.inference.input_height,
    );
    let stage = ClassificationStage::new(Box::new(model));
    info!(
        labels = stage.labels().join(","),
        threshold = config.inference.confidence_threshold,
        "classifier ready"
    );

    let link = LinkStatus::new(false);
    let reporter = match BackendReporter::from_config(&config.backend, &config.device.id, link.clone()) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let indicator: Arc<dyn Indicator> = Arc::new(LogIndicator::default());
    let state = Arc::new(Mutex::new(SchedulerState::new(config.inference.interval())));
    let scheduler = InferenceScheduler::new(
        Arc::clone(&state),
        Arc::clone(&arbiter),
        stage,
        reporter,
        Arc::clone(&indicator),
        config.inference.confidence_threshold,
    );

    let app_state = Arc::new(AppState {
        producer: Arc::new(StreamProducer::new(Arc::clone(&arbiter))),
        scheduler: Arc::clone(&state),
        link: link.clone(),
        viewers: ViewerSlots::new(config.stream.max_viewers),
        dashboard_url: config.backend.dashboard_url(),
        chunk_bytes: config.stream.chunk_bytes,
        retry: config.stream.retry(),
    });

    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr, error = %e, "failed to bind web server");
            std::process::exit(1);
        }
    };
    link.set_connected(true);
    info!(addr, "web server listening, stream at /stream");

    let app = server::router(app_state);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "web server stopped");
        }
    });

    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(read_commands(tx));
    info!("Commands: pause, resume, status, reset, help");

    let controller = CommandController::new(state, link, arbiter);
    run(scheduler, controller, rx, indicator, &config.main_loop).await;
}

/// Forward operator lines from stdin. Ends quietly at EOF.
async fn read_commands(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!("stdin closed, no further commands");
                break;
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed, no further commands");
                break;
            }
        }
    }
}

/// Cooperative main loop: commands first, then one scheduler tick, then the heartbeat.
async fn run(
    scheduler: InferenceScheduler,
    mut controller: CommandController,
    mut commands: mpsc::Receiver<String>,
    indicator: Arc<dyn Indicator>,
    config: &MainLoopConfig,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let heartbeat = Duration::from_millis(config.heartbeat_ms);
    let mut last_heartbeat = Instant::now();

    loop {
        ticker.tick().await;

        while let Ok(line) = commands.try_recv() {
            if line.trim().is_empty() {
                continue;
            }
            match controller.dispatch(Command::parse(&line)) {
                Dispatch::Reply(text) => println!("{text}"),
                Dispatch::Restart => {
                    warn!("restarting device");
                    std::process::exit(RESTART_EXIT_CODE);
                }
            }
        }

        let outcome = scheduler.tick().await;
        if outcome.ran() {
            debug!(?outcome, "inference cycle finished");
        }

        if last_heartbeat.elapsed() >= heartbeat {
            indicator.heartbeat();
            last_heartbeat = Instant::now();
        }
    }
}
