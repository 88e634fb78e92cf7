//! Pipeline worker threads: one per stream, each the single point of
//! entry into the occupancy engine for that stream.

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::ring::{FrameConsumer, RingStop};
use crate::{LedClock, LedState, SensorCommands};

/// Consecutive handler failures tolerated before a worker gives up.
pub const DEPTH_ERROR_LIMIT: u32 = 3;

/// Per-frame callback. Receives the frame bytes and the sensor
/// timestamp; an error counts toward the worker's failure limit.
pub type FrameHandler = Box<dyn FnMut(&[u8], u32) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
    Stopped,
    RingClosed,
    ErrorLimit,
}

impl ExitReason {
    fn as_str(self) -> &'static str {
        match self {
            ExitReason::Stopped => "stopped",
            ExitReason::RingClosed => "ring_closed",
            ExitReason::ErrorLimit => "error_limit",
        }
    }
}

/// The two stream workers plus their shutdown plumbing.
pub struct Pipeline {
    stop: Arc<AtomicBool>,
    ring_stops: Vec<RingStop>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawn the depth and video workers. Handlers run on the worker
    /// threads; the depth handler is expected to kick the watchdog and
    /// post the server wakeup, the video handler its own.
    pub fn spawn(
        depth: FrameConsumer,
        video: FrameConsumer,
        depth_handler: FrameHandler,
        video_handler: FrameHandler,
        commands: Arc<SensorCommands>,
        led: Arc<LedClock>,
    ) -> Pipeline {
        let stop = Arc::new(AtomicBool::new(false));
        let ring_stops = vec![depth.stop_handle(), video.stop_handle()];
        let handles = vec![
            spawn_worker(
                "depth-worker",
                depth,
                depth_handler,
                stop.clone(),
                Some((commands, led)),
            ),
            spawn_worker("video-worker", video, video_handler, stop.clone(), None),
        ];
        Pipeline {
            stop,
            ring_stops,
            handles,
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Cooperative shutdown: raise the flag, wake both consumers, join.
    pub fn stop(&mut self) {
        self.stop.store(true, Relaxed);
        for rs in &self.ring_stops {
            rs.post();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(
    name: &'static str,
    consumer: FrameConsumer,
    mut handler: FrameHandler,
    stop: Arc<AtomicBool>,
    led_duty: Option<(Arc<SensorCommands>, Arc<LedClock>)>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let mut consecutive_errors = 0u32;
            let mut last_led: Option<LedState> = None;
            let reason = loop {
                if stop.load(Relaxed) {
                    break ExitReason::Stopped;
                }
                let Some(lease) = consumer.recv() else {
                    if stop.load(Relaxed) {
                        break ExitReason::Stopped;
                    }
                    break ExitReason::RingClosed;
                };
                match handler(&lease, lease.timestamp()) {
                    Ok(()) => consecutive_errors = 0,
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!(
                            target: "sensor.worker",
                            worker = name,
                            consecutive_errors,
                            error = %e,
                            "frame_handler_failed"
                        );
                        if consecutive_errors >= DEPTH_ERROR_LIMIT {
                            error!(target: "sensor.worker", worker = name, "error_limit_reached");
                            break ExitReason::ErrorLimit;
                        }
                    }
                }
                // The depth worker also refreshes the LED intent from
                // the pull deadlines on every frame.
                if let Some((commands, led)) = &led_duty {
                    let wanted = led.current();
                    if last_led != Some(wanted) {
                        commands.request_led(wanted);
                        last_led = Some(wanted);
                    }
                }
            };
            info!(target: "sensor.worker", worker = name, reason = reason.as_str(), "worker_exited");
        })
        .expect("spawn pipeline worker")
}
