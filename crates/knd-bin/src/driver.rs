//! Synthetic sensor backend.
//!
//! The daemon's hardware seam is the `SensorDriver` trait; this is the
//! only backend compiled in-tree. It renders a deterministic scene (a
//! flat back wall with a nearer block that appears and disappears on a
//! fixed cadence) at roughly camera rate, which is enough to exercise
//! every downstream path (occupancy, brightness, subscriptions,
//! persistence, watchdog) without a device attached. A real camera
//! integration implements the same trait and replaces this type at the
//! orchestrator boundary only.

use std::time::{Duration, Instant};

use core_lut::{Luts, FRAME_H, FRAME_W, VIDEO_FRAME_BYTES};
use core_sensor::{FrameProducer, LedState, SensorDriver, SensorError};
use tracing::debug;

/// Frame pacing of the synthetic camera.
const FRAME_INTERVAL: Duration = Duration::from_millis(33);
/// The block toggles presence every this many depth frames.
const BLOCK_PERIOD: u32 = 90;

const WALL_MM: i32 = 2500;
const BLOCK_MM: i32 = 1000;

pub struct SimSensor {
    depth: FrameProducer,
    video: FrameProducer,
    depth_running: bool,
    video_running: bool,
    frame_no: u32,
    next_frame: Instant,
    interval: Duration,
    block_period: u32,
    tilt: i32,
    led: LedState,
    // Precomputed packed frames for the two scene states.
    depth_empty: Vec<u8>,
    depth_block: Vec<u8>,
    video_empty: Vec<u8>,
    video_block: Vec<u8>,
}

impl SimSensor {
    pub fn new(depth: FrameProducer, video: FrameProducer) -> SimSensor {
        SimSensor::with_timing(depth, video, FRAME_INTERVAL, BLOCK_PERIOD)
    }

    /// Custom pacing, used by tests to run the scene faster than the
    /// camera would.
    pub fn with_timing(
        depth: FrameProducer,
        video: FrameProducer,
        interval: Duration,
        block_period: u32,
    ) -> SimSensor {
        let luts = Luts::get();
        let wall = luts.reverse_lut(WALL_MM);
        let block = luts.reverse_lut(BLOCK_MM);
        SimSensor {
            depth,
            video,
            depth_running: false,
            video_running: false,
            frame_no: 0,
            next_frame: Instant::now(),
            interval,
            block_period: block_period.max(1),
            tilt: 0,
            led: LedState::Off,
            depth_empty: pack_depth_scene(wall, None),
            depth_block: pack_depth_scene(wall, Some(block)),
            video_empty: video_scene(96, None),
            video_block: video_scene(96, Some(210)),
        }
    }

    fn block_present(&self) -> bool {
        (self.frame_no / self.block_period) % 2 == 1
    }
}

impl SensorDriver for SimSensor {
    fn process_events(&mut self) -> Result<(), SensorError> {
        // Absolute pacing, same shape as a blocking driver poll.
        let now = Instant::now();
        if now < self.next_frame {
            std::thread::sleep(self.next_frame - now);
        }
        self.next_frame += self.interval;
        if self.next_frame < Instant::now() {
            self.next_frame = Instant::now() + self.interval;
        }
        if !self.depth_running {
            return Ok(());
        }
        self.frame_no = self.frame_no.wrapping_add(1);
        let present = self.block_present();
        let depth = if present { &self.depth_block } else { &self.depth_empty };
        self.depth.offer(depth, self.frame_no);
        if self.video_running {
            let video = if present { &self.video_block } else { &self.video_empty };
            self.video.offer(video, self.frame_no);
        }
        Ok(())
    }

    fn process_motor_events(&mut self) -> Result<(), SensorError> {
        Ok(())
    }

    fn has_motor(&self) -> bool {
        true
    }

    fn set_led(&mut self, led: LedState) -> Result<(), SensorError> {
        if self.led != led {
            debug!(target: "sensor.sim", ?led, "led");
            self.led = led;
        }
        Ok(())
    }

    fn tilt_degrees(&mut self) -> Result<i32, SensorError> {
        Ok(self.tilt)
    }

    fn set_tilt_degrees(&mut self, deg: i32) -> Result<(), SensorError> {
        debug!(target: "sensor.sim", deg, "tilt");
        self.tilt = deg;
        Ok(())
    }

    fn start_depth(&mut self) -> Result<(), SensorError> {
        self.depth_running = true;
        Ok(())
    }

    fn start_video(&mut self) -> Result<(), SensorError> {
        self.video_running = true;
        Ok(())
    }

    fn stop_video(&mut self) -> Result<(), SensorError> {
        self.video_running = false;
        Ok(())
    }
}

/// Pack a full 11-bit depth frame: wall everywhere, optionally a
/// centered block one quarter of the frame wide at `block` depth.
fn pack_depth_scene(wall: u16, block: Option<u16>) -> Vec<u8> {
    let mut samples = vec![wall; FRAME_W * FRAME_H];
    if let Some(near) = block {
        let (x0, x1) = (FRAME_W * 3 / 8, FRAME_W * 5 / 8);
        let (y0, y1) = (FRAME_H * 3 / 8, FRAME_H * 5 / 8);
        for y in y0..y1 {
            for x in x0..x1 {
                samples[y * FRAME_W + x] = near;
            }
        }
    }
    pack11(&samples)
}

fn video_scene(base: u8, block: Option<u8>) -> Vec<u8> {
    let mut frame = vec![base; VIDEO_FRAME_BYTES];
    if let Some(bright) = block {
        let (x0, x1) = (FRAME_W * 3 / 8, FRAME_W * 5 / 8);
        let (y0, y1) = (FRAME_H * 3 / 8, FRAME_H * 5 / 8);
        for y in y0..y1 {
            for x in x0..x1 {
                frame[y * FRAME_W + x] = bright;
            }
        }
    }
    frame
}

fn pack11(samples: &[u16]) -> Vec<u8> {
    let mut out = vec![0u8; (samples.len() * 11).div_ceil(8)];
    let mut bit = 0usize;
    for &s in samples {
        for b in 0..11 {
            if s & (1 << (10 - b)) != 0 {
                out[bit >> 3] |= 0x80 >> (bit & 7);
            }
            bit += 1;
        }
    }
    out
}
