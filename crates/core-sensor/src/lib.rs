//! Sensor pipeline: double-buffered frame handoff, the worker threads
//! that feed the occupancy engine, the LED policy, and the driver seam.
//!
//! The hardware library delivers frames from its own event thread. Each
//! stream hands frames over through a [`FrameRing`]: two fixed-size
//! buffers recycled over a pair of bounded channels, the channel pair
//! playing the role of the classic empty/full semaphore pair. The
//! producer side never stalls sensor I/O: the depth producer waits at
//! most 1 ms for a free buffer and otherwise drops the frame and counts
//! it busy.

mod ring;
mod worker;

pub use ring::{FrameConsumer, FrameLease, FrameProducer, FrameRing, RingStop};
pub use worker::{FrameHandler, Pipeline, DEPTH_ERROR_LIMIT};

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering::Relaxed};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

/// Motor tilt limits in degrees.
pub const TILT_MIN_DEG: i32 = -15;
/// Upper motor tilt limit in degrees.
pub const TILT_MAX_DEG: i32 = 15;

/// How long the status LED stays yellow after a client pulls depth.
const LED_DEPTH_HOLD: Duration = Duration::from_secs(2);
/// How long the status LED stays red after a client pulls video.
const LED_VIDEO_HOLD: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    Green,
    Yellow,
    Red,
    Off,
}

/// Errors crossing the driver seam.
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("sensor device error: {0}")]
    Device(String),
    #[error("sensor stream ended")]
    Disconnected,
}

/// Abstract sensor. The hardware library's callbacks push frames into
/// the ring producers handed over at construction; everything else the
/// daemon needs from the device goes through this trait, polled from
/// the sensor event loop.
pub trait SensorDriver: Send {
    /// One iteration of camera event processing. Frame callbacks fire
    /// from inside this call.
    fn process_events(&mut self) -> Result<(), SensorError>;
    /// One non-blocking iteration of motor event processing.
    fn process_motor_events(&mut self) -> Result<(), SensorError>;
    fn has_motor(&self) -> bool;
    fn set_led(&mut self, led: LedState) -> Result<(), SensorError>;
    fn tilt_degrees(&mut self) -> Result<i32, SensorError>;
    fn set_tilt_degrees(&mut self, deg: i32) -> Result<(), SensorError>;
    fn start_depth(&mut self) -> Result<(), SensorError>;
    fn start_video(&mut self) -> Result<(), SensorError>;
    fn stop_video(&mut self) -> Result<(), SensorError>;
}

/// Deadline-based LED policy. Workers derive the desired color here;
/// the sensor event thread applies it to the device.
#[derive(Default)]
pub struct LedClock {
    state: Mutex<LedDeadlines>,
}

#[derive(Default)]
struct LedDeadlines {
    depth_until: Option<Instant>,
    video_until: Option<Instant>,
}

impl LedClock {
    pub fn new() -> LedClock {
        LedClock::default()
    }

    /// A client pulled depth data.
    pub fn note_depth_pull(&self) {
        self.lock().depth_until = Some(Instant::now() + LED_DEPTH_HOLD);
    }

    /// A client pulled video data.
    pub fn note_video_pull(&self) {
        self.lock().video_until = Some(Instant::now() + LED_VIDEO_HOLD);
    }

    /// Desired LED color right now. Red (video) dominates yellow.
    pub fn current(&self) -> LedState {
        let now = Instant::now();
        let g = self.lock();
        if g.video_until.is_some_and(|t| now < t) {
            LedState::Red
        } else if g.depth_until.is_some_and(|t| now < t) {
            LedState::Yellow
        } else {
            LedState::Green
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedDeadlines> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Control state shared between the server, the workers, and the
/// sensor event loop. The event loop is the only place that talks to
/// the device; everyone else parks intent here.
pub struct SensorCommands {
    led_pending: Mutex<Option<LedState>>,
    tilt_pending: Mutex<Option<i32>>,
    tilt_current: AtomicI32,
    video_requested: AtomicBool,
}

impl Default for SensorCommands {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorCommands {
    pub fn new() -> SensorCommands {
        SensorCommands {
            led_pending: Mutex::new(None),
            tilt_pending: Mutex::new(None),
            tilt_current: AtomicI32::new(0),
            video_requested: AtomicBool::new(false),
        }
    }

    pub fn request_led(&self, led: LedState) {
        *self.led_pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(led);
    }

    pub fn take_led(&self) -> Option<LedState> {
        self.led_pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Queue a tilt change, clamped to the motor range. Returns the
    /// clamped value.
    pub fn request_tilt(&self, deg: i32) -> i32 {
        let deg = deg.clamp(TILT_MIN_DEG, TILT_MAX_DEG);
        *self.tilt_pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(deg);
        deg
    }

    pub fn take_tilt(&self) -> Option<i32> {
        self.tilt_pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn tilt(&self) -> i32 {
        self.tilt_current.load(Relaxed)
    }

    pub fn record_tilt(&self, deg: i32) {
        self.tilt_current.store(deg, Relaxed);
    }

    /// Whether any client currently wants color frames.
    pub fn video_requested(&self) -> bool {
        self.video_requested.load(Relaxed)
    }

    pub fn set_video_requested(&self, wanted: bool) {
        self.video_requested.store(wanted, Relaxed);
    }
}

/// Drive the sensor until `stop` is raised: process camera and motor
/// events, apply parked LED/tilt intent, and start or stop the color
/// stream to match demand. A device error ends the loop; sensor loss
/// is fatal by policy and the supervisor restarts the process.
pub fn run_event_loop(
    driver: &mut dyn SensorDriver,
    commands: &SensorCommands,
    stop: &AtomicBool,
) -> Result<(), SensorError> {
    let motor = driver.has_motor();
    if motor {
        match driver.tilt_degrees() {
            Ok(deg) => commands.record_tilt(deg),
            Err(e) => debug!(target: "sensor", error = %e, "tilt_read_failed"),
        }
    }
    let mut video_running = false;
    info!(target: "sensor", motor, "event_loop_started");
    while !stop.load(Relaxed) {
        driver.process_events()?;
        if motor {
            driver.process_motor_events()?;
            if let Some(led) = commands.take_led() {
                driver.set_led(led)?;
            }
            if let Some(deg) = commands.take_tilt() {
                driver.set_tilt_degrees(deg)?;
                commands.record_tilt(deg);
            }
        }
        let wanted = commands.video_requested();
        if wanted != video_running {
            if wanted {
                driver.start_video()?;
            } else {
                driver.stop_video()?;
            }
            debug!(target: "sensor", wanted, "video_stream_toggled");
            video_running = wanted;
        }
    }
    info!(target: "sensor", "event_loop_stopped");
    Ok(())
}
