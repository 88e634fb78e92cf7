//! Occupancy engine: evaluates every live zone against every sampled
//! pixel of each frame.
//!
//! Both entry points hold the catalog lock for the whole pass so the
//! per-zone accumulators are never observable half-updated. The sweep is
//! integer-only: raw depth indexes through the LUT, world projection via
//! the fixed-point kernel, and stride-weighted accumulation so results
//! do not depend on the sweep stride.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use core_lut::{
    pxval11, xworld, yworld, DEPTH_FRAME_BYTES, DEPTH_OUT_OF_RANGE, FRAME_H, FRAME_W,
    VIDEO_FRAME_BYTES,
};
use core_zones::ZoneCatalog;
use tracing::trace;

/// Stride of the video brightness sweep, both axes.
const BRIGHT_SKIP: usize = 8;
/// First sampled column of the video sweep (green-ish Bayer cells).
const BRIGHT_X0: usize = 1;

pub struct OccupancyEngine {
    catalog: Arc<ZoneCatalog>,
}

impl OccupancyEngine {
    pub fn new(catalog: Arc<ZoneCatalog>) -> OccupancyEngine {
        OccupancyEngine { catalog }
    }

    /// One depth frame: rebuild coverage if stale, sweep, derive, debounce.
    pub fn update_depth(&self, frame: &[u8]) {
        debug_assert_eq!(frame.len(), DEPTH_FRAME_BYTES);
        let luts = self.catalog.luts();
        let mut g = self.catalog.lock();
        if g.range_dirty() {
            g.rebuild_range_map();
        }
        for z in g.zones_mut() {
            z.reset_depth_counters();
        }

        let weight = g.weight();
        let (xskip, yskip) = (g.xskip() as usize, g.yskip() as usize);
        let mut oor: i64 = 0;
        for y in (0..FRAME_H).step_by(yskip) {
            let row = y * FRAME_W;
            for x in (0..FRAME_W).step_by(xskip) {
                let raw = pxval11(frame, row + x);
                if raw == DEPTH_OUT_OF_RANGE {
                    oor += weight;
                    continue;
                }
                let (lo, hi) = g.range_at(x as u16, y as u16);
                if raw < lo || raw > hi {
                    continue;
                }
                let zw = luts.depth_mm(raw);
                let xw = xworld(x as i32, zw);
                let yw = yworld(y as i32, zw);
                for z in g.zones_mut() {
                    if z.contains_world(xw, yw, zw) {
                        z.accumulate(weight, xw, yw, zw);
                    }
                }
            }
        }
        g.oor_total = oor;

        let mut occupied = 0u32;
        let mut max_idx: i32 = -1;
        let mut max_sa: i64 = -1;
        for (i, z) in g.zones_mut().iter_mut().enumerate() {
            z.finish_depth_pass(luts);
            let (value, allow) = z.param_value();
            let threshold = if z.occupied { z.off_level } else { z.on_level };
            let candidate = allow && value >= i64::from(threshold);
            z.apply_debounce(candidate);
            if z.effective_occupied() {
                occupied += 1;
                if z.sa > max_sa {
                    max_sa = z.sa;
                    max_idx = i as i32;
                }
            }
        }
        g.occupied = occupied;
        g.max_zone = max_idx;
        trace!(target: "engine.depth", occupied, oor, "depth_pass");
    }

    /// One video frame: coarse brightness accumulation in screen space.
    pub fn update_video(&self, frame: &[u8]) {
        debug_assert_eq!(frame.len(), VIDEO_FRAME_BYTES);
        let mut g = self.catalog.lock();
        for z in g.zones_mut() {
            z.bsum = 0;
        }
        for y in (0..FRAME_H).step_by(BRIGHT_SKIP) {
            let row = y * FRAME_W;
            for x in (BRIGHT_X0..FRAME_W).step_by(BRIGHT_SKIP) {
                let v = i64::from(frame[row + x]);
                for z in g.zones_mut() {
                    if z.covers_pixel(x as u16, y as u16) {
                        z.bsum += v;
                    }
                }
            }
        }
        trace!(target: "engine.video", "video_pass");
    }
}

/// Integer frames-per-second meter for the depth path.
///
/// Rates carry a x100 scale so a reading of 2975 means 29.75 fps. The
/// window re-evaluates every 200 ms against the elapsed interval.
pub struct FpsCounter {
    frames: AtomicU64,
    fps_x100: AtomicU64,
    window_start: Mutex<Instant>,
}

const FPS_WINDOW: Duration = Duration::from_millis(200);

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FpsCounter {
    pub fn new() -> FpsCounter {
        FpsCounter {
            frames: AtomicU64::new(0),
            fps_x100: AtomicU64::new(0),
            window_start: Mutex::new(Instant::now()),
        }
    }

    /// Record one processed depth frame.
    pub fn frame(&self) {
        self.frames.fetch_add(1, Relaxed);
        let mut start = self
            .window_start
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let elapsed = start.elapsed();
        if elapsed >= FPS_WINDOW {
            let frames = self.frames.swap(0, Relaxed);
            let ms = elapsed.as_millis().max(1) as u64;
            self.fps_x100.store(frames * 100_000 / ms, Relaxed);
            *start = Instant::now();
        }
    }

    /// Last computed rate, frames per second times 100.
    pub fn fps_x100(&self) -> u64 {
        self.fps_x100.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_lut::Luts;
    use pretty_assertions::assert_eq;

    /// Pack raw 11-bit samples the way the sensor delivers them.
    fn pack11(samples: &[u16]) -> Vec<u8> {
        let mut out = vec![0u8; (samples.len() * 11).div_ceil(8)];
        for (idx, &s) in samples.iter().enumerate() {
            let bit = idx * 11;
            for b in 0..11 {
                if s & (1 << (10 - b)) != 0 {
                    let at = bit + b;
                    out[at >> 3] |= 0x80 >> (at & 7);
                }
            }
        }
        out
    }

    fn flat_frame(raw: u16) -> Vec<u8> {
        pack11(&vec![raw; FRAME_W * FRAME_H])
    }

    fn engine_with(corners: [i32; 6]) -> (OccupancyEngine, Arc<ZoneCatalog>) {
        let catalog = Arc::new(ZoneCatalog::new(2, 2));
        catalog.add("zone", corners).unwrap();
        (OccupancyEngine::new(catalog.clone()), catalog)
    }

    /// Raw index whose depth lands closest to `mm`.
    fn raw_for_mm(mm: i32) -> u16 {
        Luts::get().reverse_lut(mm)
    }

    #[test]
    fn all_out_of_range_counts_everything_and_keeps_zones_empty() {
        let (engine, catalog) = engine_with([-400, -300, 800, 400, 300, 1200]);
        catalog.set_attr("zone", "on_level", "0").unwrap();
        let frame = flat_frame(DEPTH_OUT_OF_RANGE);
        engine.update_depth(&frame);
        let g = catalog.lock();
        let sampled = (FRAME_W / 2) * (FRAME_H / 2);
        assert_eq!(g.oor_total, (sampled * 4) as i64);
        let z = &g.zones()[0];
        assert_eq!(z.pop, 0);
        // Threshold 0 would qualify, but an empty zone may not occupy.
        assert!(!z.occupied);
        assert_eq!(g.occupied, 0);
        assert_eq!(g.max_zone, -1);
    }

    #[test]
    fn flat_wall_inside_zone_populates_and_occupies() {
        // Wall at ~1000 mm, zone straddling it.
        let raw = raw_for_mm(1000);
        let zw = Luts::get().depth_mm(raw);
        let (engine, catalog) = engine_with([-200, -150, zw - 100, 200, 150, zw + 100]);
        let frame = flat_frame(raw);
        engine.update_depth(&frame);
        let g = catalog.lock();
        let z = &g.zones()[0];
        assert!(z.pop > 0, "wall samples must land in the zone");
        assert!(z.occupied, "pop >= 1 crosses the default threshold");
        assert_eq!(g.occupied, 1);
        assert_eq!(g.max_zone, 0);
        assert!(z.sa > 0);
        // Sample accounting: nothing out of range, covered <= sampled.
        let sampled_weighted = ((FRAME_W / 2) * (FRAME_H / 2) * 4) as i64;
        assert_eq!(g.oor_total, 0);
        assert!(z.pop <= sampled_weighted);
    }

    #[test]
    fn center_of_gravity_is_centered_for_uniform_fill() {
        let raw = raw_for_mm(1200);
        let zw = Luts::get().depth_mm(raw);
        // Zone symmetric around the optical axis and around the wall
        // depth; the wall fills its full cross-section.
        let (engine, catalog) = engine_with([-250, -180, zw - 150, 250, 180, zw + 150]);
        engine.update_depth(&flat_frame(raw));
        let g = catalog.lock();
        let z = &g.zones()[0];
        assert!(z.pop > 0);
        for (label, c) in [("xc", z.xc), ("yc", z.yc), ("zc", z.zc)] {
            assert!(
                (c - 500).abs() <= 25,
                "{label} = {c}, expected near center"
            );
        }
    }

    #[test]
    fn empty_zone_reports_unknown_centers() {
        let (engine, catalog) = engine_with([-200, -150, 700, 200, 150, 900]);
        // Wall far behind the zone.
        engine.update_depth(&flat_frame(raw_for_mm(3000)));
        let g = catalog.lock();
        let z = &g.zones()[0];
        assert_eq!(z.pop, 0);
        assert_eq!((z.xc, z.yc, z.zc), (-1, -1, -1));
        assert_eq!(z.sa, 0);
    }

    #[test]
    fn debounce_delays_flip_across_frames() {
        let raw = raw_for_mm(1000);
        let zw = Luts::get().depth_mm(raw);
        let (engine, catalog) = engine_with([-200, -150, zw - 100, 200, 150, zw + 100]);
        catalog.set_attr("zone", "on_delay", "2").unwrap();
        let hit = flat_frame(raw);
        engine.update_depth(&hit);
        assert_eq!(catalog.occupied_count(), 0);
        engine.update_depth(&hit);
        assert_eq!(catalog.occupied_count(), 0);
        engine.update_depth(&hit);
        assert_eq!(catalog.occupied_count(), 1);
    }

    #[test]
    fn negate_inverts_reported_occupancy() {
        let (engine, catalog) = engine_with([-200, -150, 700, 200, 150, 900]);
        catalog.set_attr("zone", "negate", "1").unwrap();
        // Nothing in the zone: raw occupancy false, reported true.
        engine.update_depth(&flat_frame(raw_for_mm(3000)));
        assert_eq!(catalog.occupied_count(), 1);
    }

    #[test]
    fn video_pass_accumulates_brightness_in_screen_space() {
        let (engine, catalog) = engine_with([-300, -200, 900, 300, 200, 1500]);
        let frame = vec![200u8; VIDEO_FRAME_BYTES];
        engine.update_video(&frame);
        let g = catalog.lock();
        let z = &g.zones()[0];
        assert!(z.bsum > 0);
        let bright = z.bright();
        // Uniform 200/255 input lands near 784 permille; sampling grid
        // alignment wobbles it slightly.
        assert!((bright - 784).abs() <= 80, "bright = {bright}");
    }

    #[test]
    fn bright_param_occupies_without_depth_pop() {
        let (engine, catalog) = engine_with([-300, -200, 900, 300, 200, 1500]);
        catalog.set_attr("zone", "param", "bright").unwrap();
        catalog.set_attr("zone", "on_level", "500").unwrap();
        engine.update_video(&vec![220u8; VIDEO_FRAME_BYTES]);
        // Depth sees nothing in the zone; bright still allows occupancy.
        engine.update_depth(&flat_frame(raw_for_mm(5000)));
        assert_eq!(catalog.occupied_count(), 1);
    }

    #[test]
    fn fps_counter_scales_by_100() {
        let fps = FpsCounter::new();
        assert_eq!(fps.fps_x100(), 0);
        for _ in 0..10 {
            fps.frame();
        }
        std::thread::sleep(Duration::from_millis(220));
        fps.frame();
        let rate = fps.fps_x100();
        // 11 frames over ~220 ms is ~50 fps; allow generous scheduling slop.
        assert!(rate > 2_000 && rate < 10_000, "rate = {rate}");
    }
}
