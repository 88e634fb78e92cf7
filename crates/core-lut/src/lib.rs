//! Depth look-up tables and the integer projection kernel.
//!
//! Everything downstream of the sensor works in whole millimeters and whole
//! pixels; the only floating point in this crate runs once at table build
//! time. The fixed-point formulas in [`xworld`] / [`xscreen`] are a wire
//! contract: zone evaluation must produce bit-identical results on every
//! platform, so the constants below are not tunable.

use std::sync::OnceLock;

/// Sensor frame geometry (medium resolution).
pub const FRAME_W: usize = 640;
/// Sensor frame height in pixels.
pub const FRAME_H: usize = 480;
/// Bytes in one packed 11-bit depth frame (640*480*11/8).
pub const DEPTH_FRAME_BYTES: usize = 422_400;
/// Bytes in one single-channel Bayer video frame.
pub const VIDEO_FRAME_BYTES: usize = FRAME_W * FRAME_H;

/// Raw depth sample marking "no return" / out of range.
pub const DEPTH_OUT_OF_RANGE: u16 = 2047;
/// Number of entries in the depth table.
pub const DEPTH_LUT_LEN: usize = 2048;
/// Largest physically meaningful depth index.
pub const MAX_DEPTH_INDEX: u16 = 1092;

// tan(28 deg) * 2048, the half horizontal field of view in Q11.
const TAN_HALF_FOV_Q11: i64 = 1089;
// 1/10 in Q19 (0xCCCD / 2^19), folded into the projection scale.
const RECIP_TEN_Q19: i64 = 0xCCCD;

/// Project a screen column and world depth to a world X coordinate (mm).
///
/// `xw = ((zw * (320 - px) * 1089 * 0xCCCD) + 2^34) >> 35`
#[inline]
pub fn xworld(px: i32, zw: i32) -> i32 {
    let v = (zw as i64) * ((FRAME_W as i64 / 2) - px as i64) * TAN_HALF_FOV_Q11 * RECIP_TEN_Q19;
    ((v + (1i64 << 34)) >> 35) as i32
}

/// Project a screen row and world depth to a world Y coordinate (mm).
///
/// The sensor is wider than it is tall; rows are re-centered into the
/// square field before running the X formula.
#[inline]
pub fn yworld(py: i32, zw: i32) -> i32 {
    xworld(py + ((FRAME_W - FRAME_H) as i32 / 2), zw)
}

/// Inverse of [`xworld`]: world X and depth to a screen column.
///
/// Total for any `zw > 0`; callers clamp the result to the frame.
#[inline]
pub fn xscreen(xw: i32, zw: i32) -> i32 {
    debug_assert!(zw > 0);
    let denom = TAN_HALF_FOV_Q11 * RECIP_TEN_Q19 * zw as i64;
    ((FRAME_W as i64 / 2) - ((xw as i64) << 35) / denom) as i32
}

/// Inverse of [`yworld`]: world Y and depth to a screen row.
#[inline]
pub fn yscreen(yw: i32, zw: i32) -> i32 {
    xscreen(yw, zw) - ((FRAME_W - FRAME_H) as i32 / 2)
}

/// Unpack the 11-bit big-endian depth sample for pixel `idx`.
///
/// The packed stream carries samples MSB-first with no padding, so a
/// sample spans two or three bytes. The final sample of a full frame
/// never needs the third byte.
#[inline]
pub fn pxval11(frame: &[u8], idx: usize) -> u16 {
    let bit = idx * 11;
    let byte = bit >> 3;
    let shift = bit & 7;
    let word = (u32::from(frame[byte]) << 16)
        | (u32::from(frame[byte + 1]) << 8)
        | u32::from(frame.get(byte + 2).copied().unwrap_or(0));
    ((word >> (13 - shift)) & 0x7ff) as u16
}

/// Immutable depth and surface tables, built once per process.
pub struct Luts {
    depth: [i32; DEPTH_LUT_LEN],
    surface: [f64; DEPTH_LUT_LEN],
}

static LUTS: OnceLock<Luts> = OnceLock::new();

impl Luts {
    /// Process-wide tables; the first caller pays the build cost.
    pub fn get() -> &'static Luts {
        LUTS.get_or_init(Luts::build)
    }

    fn build() -> Luts {
        let mut depth = [0i32; DEPTH_LUT_LEN];
        let mut surface = [0f64; DEPTH_LUT_LEN];
        let px_scale = (28.0f64).to_radians().tan() / (FRAME_W as f64 / 2.0);
        for (i, (d, s)) in depth.iter_mut().zip(surface.iter_mut()).enumerate() {
            let mm = 1000.0 * 0.1236 * ((i as f64) / 2842.5 + 1.1863).tan();
            *d = mm.floor() as i32;
            *s = (*d as f64) * (*d as f64) * px_scale * px_scale;
        }
        Luts { depth, surface }
    }

    /// World depth in millimeters for a raw depth index.
    #[inline]
    pub fn depth_mm(&self, idx: u16) -> i32 {
        self.depth[idx as usize]
    }

    /// Approximate surface area (mm^2) covered by one pixel at `idx`.
    #[inline]
    pub fn surface_mm2(&self, idx: u16) -> f64 {
        self.surface[idx as usize]
    }

    /// Largest index `i` in `[0, 1092]` with `depth_mm(i) <= mm`.
    ///
    /// Halving search seeded at the table midpoint, then a short linear
    /// fixup that absorbs the truncation of the table entries. Total for
    /// every integer input: values below the table floor map to 0, values
    /// beyond the far end map to 1092.
    pub fn reverse_lut(&self, mm: i32) -> u16 {
        let max = MAX_DEPTH_INDEX as i32;
        let mut i: i32 = 546;
        let mut step: i32 = 273;
        while step > 0 {
            if self.depth[i as usize] > mm {
                i -= step;
            } else {
                i += step;
            }
            i = i.clamp(0, max);
            step /= 2;
        }
        while i > 0 && self.depth[i as usize] > mm {
            i -= 1;
        }
        while i < max && self.depth[(i + 1) as usize] <= mm {
            i += 1;
        }
        i as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn depth_table_monotonic_over_usable_range() {
        let luts = Luts::get();
        for i in 1..=MAX_DEPTH_INDEX {
            assert!(
                luts.depth_mm(i) >= luts.depth_mm(i - 1),
                "depth table regressed at index {i}"
            );
        }
        // Sanity anchors: the usable range spans roughly 0.3 m to 10 m.
        assert!(luts.depth_mm(0) > 200 && luts.depth_mm(0) < 400);
        assert!(luts.depth_mm(MAX_DEPTH_INDEX) > 5_000);
    }

    #[test]
    fn reverse_lut_inverts_table_entries() {
        let luts = Luts::get();
        for i in (0..=MAX_DEPTH_INDEX).step_by(7) {
            let mm = luts.depth_mm(i);
            let back = luts.reverse_lut(mm);
            // Exact inversion where entries are distinct; equal neighbors
            // legitimately resolve to the last of the run.
            assert!(luts.depth_mm(back) <= mm);
            if back < MAX_DEPTH_INDEX {
                assert!(luts.depth_mm(back + 1) > mm || luts.depth_mm(back + 1) == mm);
                assert!(back >= i || luts.depth_mm(back) == mm);
            }
        }
    }

    #[test]
    fn reverse_lut_total_at_extremes() {
        let luts = Luts::get();
        assert_eq!(luts.reverse_lut(i32::MIN), 0);
        assert_eq!(luts.reverse_lut(0), 0);
        assert_eq!(luts.reverse_lut(i32::MAX), MAX_DEPTH_INDEX);
        assert_eq!(
            luts.reverse_lut(luts.depth_mm(MAX_DEPTH_INDEX) + 1),
            MAX_DEPTH_INDEX
        );
    }

    #[test]
    fn projection_centerline_is_zero() {
        for zw in [500, 1000, 2000, 8000] {
            assert_eq!(xworld(320, zw), 0);
            assert_eq!(yworld(240, zw), 0);
        }
    }

    #[test]
    fn projection_round_trip_within_one_pixel() {
        for zw in [600, 1000, 2500, 5000] {
            for px in (0..640).step_by(13) {
                let xw = xworld(px, zw);
                let back = xscreen(xw, zw);
                assert!(
                    (back - px).abs() <= 1,
                    "px {px} zw {zw} -> xw {xw} -> {back}"
                );
            }
            for py in (0..480).step_by(13) {
                let yw = yworld(py, zw);
                let back = yscreen(yw, zw);
                assert!((back - py).abs() <= 1);
            }
        }
    }

    #[test]
    fn projection_sign_convention() {
        // Columns left of center land at positive world X.
        assert!(xworld(0, 1000) > 0);
        assert!(xworld(639, 1000) < 0);
        assert!(yworld(0, 1000) > 0);
        assert!(yworld(479, 1000) < 0);
    }

    /// Pack reference samples the way the sensor does and unpack them back.
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

    #[test]
    fn pxval11_unpacks_packed_stream() {
        let samples: Vec<u16> = (0..64).map(|i| (i * 37 + 5) % 2048).collect();
        let frame = pack11(&samples);
        for (idx, &s) in samples.iter().enumerate() {
            assert_eq!(pxval11(&frame, idx), s, "sample {idx}");
        }
    }

    #[test]
    fn pxval11_handles_final_frame_sample() {
        let total = FRAME_W * FRAME_H;
        let mut samples = vec![0u16; total];
        samples[total - 1] = 0x555;
        samples[total - 2] = 0x7ff;
        let frame = pack11(&samples);
        assert_eq!(frame.len(), DEPTH_FRAME_BYTES);
        assert_eq!(pxval11(&frame, total - 1), 0x555);
        assert_eq!(pxval11(&frame, total - 2), 0x7ff);
    }
}
