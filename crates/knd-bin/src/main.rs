//! knd entrypoint: wires the sensor pipeline, occupancy engine,
//! broadcast server, watchdog, and persistence together and runs until
//! a signal or an escalation stops it.

mod driver;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering::Relaxed};
use std::sync::{Arc, Mutex as StdMutex, Once};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use core_engine::{FpsCounter, OccupancyEngine};
use core_lut::{Luts, DEPTH_FRAME_BYTES, VIDEO_FRAME_BYTES};
use core_persist::{Saver, ZoneStore};
use core_sensor::{
    run_event_loop, FrameRing, LedClock, Pipeline, SensorCommands, SensorDriver,
};
use core_server::{Server, ServerContext, ServerHandle};
use core_watchdog::Watchdog;
use core_zones::ZoneCatalog;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use driver::SimSensor;

/// CLI arguments. The daemon is configured through `knd.toml` and
/// `KND_*` environment variables; the command line stays minimal.
#[derive(Parser, Debug)]
#[command(name = "knd", version, about = "Depth-camera zone occupancy daemon")]
struct Args {
    /// Configuration file path (overrides discovery of `knd.toml`).
    #[arg(long = "config")]
    config: Option<std::path::PathBuf>,
}

fn configure_logging() -> Option<WorkerGuard> {
    let filter = std::env::var("KND_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init()
    {
        Ok(()) => Some(guard),
        Err(_) => None,
    }
}

fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = std::backtrace::Backtrace::force_capture();
            tracing::error!(target: "runtime.panic", %backtrace, ?info, "panic");
            default_panic(info);
        }));
    });
}

/// Why the main loop decided to stop.
#[derive(Debug, Clone, Copy)]
enum StopCause {
    Term,
    Interrupt,
    Usr2,
    Watchdog,
    SensorFailed,
}

struct Daemon {
    catalog: Arc<ZoneCatalog>,
    commands: Arc<SensorCommands>,
    store: Arc<ZoneStore>,
    server_handle: ServerHandle,
    server_task: tokio::task::JoinHandle<()>,
    pipeline: Pipeline,
    saver: Saver,
    watchdog: Arc<StdMutex<Option<Watchdog>>>,
    sensor_stop: Arc<AtomicBool>,
    sensor_thread: std::thread::JoinHandle<()>,
    stop_rx: mpsc::UnboundedReceiver<StopCause>,
    run_timeout: Duration,
}

async fn bootstrap(args: Args) -> Result<Daemon> {
    // Table build happens before anything can race it.
    Luts::get();
    let config = core_config::load(args.config).context("load configuration")?;
    info!(
        target: "runtime",
        port = config.port,
        save_dir = %config.save_dir.display(),
        xskip = config.xskip,
        yskip = config.yskip,
        "startup"
    );

    let catalog = Arc::new(ZoneCatalog::new(config.xskip, config.yskip));
    let store = Arc::new(ZoneStore::new(&config.save_dir).context("validate save directory")?);
    let commands = Arc::new(SensorCommands::new());
    let led = Arc::new(LedClock::new());
    let fps = Arc::new(FpsCounter::new());
    let depth_frame = Arc::new(StdMutex::new(vec![0u8; DEPTH_FRAME_BYTES]));
    let video_frame = Arc::new(StdMutex::new(vec![0u8; VIDEO_FRAME_BYTES]));

    let server = Server::bind(
        config.port,
        ServerContext {
            catalog: catalog.clone(),
            commands: commands.clone(),
            led: led.clone(),
            fps: fps.clone(),
            depth_frame: depth_frame.clone(),
            video_frame: video_frame.clone(),
            app_version: env!("CARGO_PKG_VERSION"),
        },
    )
    .await
    .context("start server")?;
    let server_handle = server.handle();

    let (stop_tx, stop_rx) = mpsc::unbounded_channel::<StopCause>();

    // Watchdog with the generous init timeout; switched to the run
    // timeout once frames are expected. First overrun asks the main
    // loop to stop; a second one before the process exits terminates
    // it outright. The callback re-kicks so escalations stay a full
    // interval apart.
    let watchdog: Arc<StdMutex<Option<Watchdog>>> = Arc::new(StdMutex::new(None));
    let escalations = Arc::new(AtomicU32::new(0));
    let wd_interval = (config.run_timeout / 4).max(Duration::from_millis(50));
    let wd = {
        let watchdog = watchdog.clone();
        let stop_tx = stop_tx.clone();
        Watchdog::spawn(wd_interval, config.init_timeout, move || {
            let n = escalations.fetch_add(1, Relaxed);
            if n == 0 {
                warn!(target: "watchdog", "pipeline_stalled_requesting_stop");
                let _ = stop_tx.send(StopCause::Watchdog);
            } else {
                error!(target: "watchdog", "pipeline_still_stalled_terminating");
                std::process::exit(1);
            }
            if let Some(wd) = watchdog.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                wd.kick();
            }
        })
    };
    *watchdog.lock().unwrap_or_else(|e| e.into_inner()) = Some(wd);

    // Pipeline: frame rings, worker handlers, synthetic driver.
    let (depth_prod, depth_cons) =
        FrameRing::pair(DEPTH_FRAME_BYTES, Some(Duration::from_millis(1)));
    let (video_prod, video_cons) = FrameRing::pair(VIDEO_FRAME_BYTES, None);
    let engine = Arc::new(OccupancyEngine::new(catalog.clone()));

    let depth_handler: core_sensor::FrameHandler = {
        let engine = engine.clone();
        let snapshot = depth_frame.clone();
        let watchdog = watchdog.clone();
        let fps = fps.clone();
        let server_handle = server_handle.clone();
        Box::new(move |frame: &[u8], _ts: u32| {
            engine.update_depth(frame);
            snapshot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .copy_from_slice(frame);
            if let Some(wd) = watchdog.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                wd.kick();
            }
            fps.frame();
            server_handle.notify_depth();
            Ok(())
        })
    };
    let video_handler: core_sensor::FrameHandler = {
        let engine = engine.clone();
        let snapshot = video_frame.clone();
        let server_handle = server_handle.clone();
        Box::new(move |frame: &[u8], _ts: u32| {
            engine.update_video(frame);
            snapshot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .copy_from_slice(frame);
            server_handle.notify_video();
            Ok(())
        })
    };
    let pipeline = Pipeline::spawn(
        depth_cons,
        video_cons,
        depth_handler,
        video_handler,
        commands.clone(),
        led.clone(),
    );

    // Saved zones come back before clients can connect to mutate them.
    let summary = store.load(&catalog).context("load saved zones")?;
    if summary.tilt_degrees != 0 {
        commands.request_tilt(summary.tilt_degrees);
    }

    let saver = Saver::spawn(
        store.clone(),
        catalog.clone(),
        Box::new({
            let commands = commands.clone();
            move || commands.tilt()
        }),
        config.save_interval,
    );

    // Sensor event loop on its own thread; the driver owns the ring
    // producers and feeds them from inside process_events.
    let sensor_stop = Arc::new(AtomicBool::new(false));
    let sensor_thread = {
        let commands = commands.clone();
        let sensor_stop = sensor_stop.clone();
        let stop_tx = stop_tx.clone();
        std::thread::Builder::new()
            .name("sensor-events".into())
            .spawn(move || {
                let mut driver = SimSensor::new(depth_prod, video_prod);
                if let Err(e) = driver.start_depth() {
                    error!(target: "sensor", error = %e, "start_depth_failed");
                    let _ = stop_tx.send(StopCause::SensorFailed);
                    return;
                }
                if let Err(e) = run_event_loop(&mut driver, &commands, &sensor_stop) {
                    // Sensor loss is fatal by policy; the supervisor
                    // restarts a healthy process.
                    error!(target: "sensor", error = %e, "sensor_loop_failed");
                    let _ = stop_tx.send(StopCause::SensorFailed);
                }
            })
            .context("spawn sensor thread")?
    };

    let server_task = tokio::spawn(server.run());

    Ok(Daemon {
        catalog,
        commands,
        store,
        server_handle,
        server_task,
        pipeline,
        saver,
        watchdog,
        sensor_stop,
        sensor_thread,
        stop_rx,
        run_timeout: config.run_timeout,
    })
}

async fn run(mut daemon: Daemon) -> Result<()> {
    // Frames are flowing (or about to): tighten the watchdog.
    if let Some(wd) = daemon
        .watchdog
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
    {
        wd.set_timeout(daemon.run_timeout);
        wd.kick();
    }

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).context("install SIGUSR2 handler")?;

    let cause = tokio::select! {
        _ = sigterm.recv() => StopCause::Term,
        _ = sigint.recv() => StopCause::Interrupt,
        _ = sigusr2.recv() => StopCause::Usr2,
        stop = daemon.stop_rx.recv() => stop.unwrap_or(StopCause::Watchdog),
    };
    info!(target: "runtime", ?cause, "stopping");

    // Teardown in reverse of bringup: sensor loop, server, workers,
    // saver, watchdog; then one final save if anything is unsaved.
    daemon.sensor_stop.store(true, Relaxed);
    daemon.server_handle.shutdown();
    let _ = daemon.server_task.await;
    daemon.pipeline.stop();
    let last_saved = daemon.saver.last_saved_version();
    daemon.saver.stop();
    // Pull the watchdog out before stopping it so its lock is free for
    // a late escalation callback.
    let parked_watchdog = daemon
        .watchdog
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(mut wd) = parked_watchdog {
        wd.stop();
    }
    if daemon.sensor_thread.join().is_err() {
        warn!(target: "runtime", "sensor_thread_panicked");
    }
    let version = daemon.catalog.version();
    if version != last_saved && version != core_zones::VERSION_INVALID {
        if let Err(e) = daemon.store.save(&daemon.catalog, daemon.commands.tilt()) {
            warn!(target: "persist", error = %e, "final_save_failed");
        }
    }
    info!(target: "runtime", "shutdown_complete");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = configure_logging();
    install_panic_hook();

    let daemon = match bootstrap(args).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(target: "runtime", error = ?e, "startup_failed");
            eprintln!("knd: startup failed: {e:#}");
            // Startup failures are the supervisor's problem.
            std::process::exit(255);
        }
    };
    if let Err(e) = run(daemon).await {
        error!(target: "runtime", error = ?e, "runtime_failed");
        std::process::exit(1);
    }
}
