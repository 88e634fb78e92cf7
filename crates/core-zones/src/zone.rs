//! The zone record: a named world-space box, its screen-space shadow, the
//! sensing configuration, and the per-frame accumulators.
//!
//! World and screen boxes are never allowed to drift apart: every setter
//! that touches one side recomputes the other through the projection
//! kernel. All setters preserve the structural invariants (strictly
//! ordered endpoints, positive depth, `maxpop >= 1`) by clamping the
//! opposite endpoint outward rather than rejecting the write.

use std::fmt::Write as _;

use core_lut::{xscreen, xworld, yscreen, yworld, Luts, FRAME_H, FRAME_W, MAX_DEPTH_INDEX};

use crate::ZoneError;

/// Longest accepted zone name in bytes.
pub const MAX_NAME_LEN: usize = 127;

/// World coordinates are clamped to this many millimeters on each axis.
pub const WORLD_RANGE_MM: i32 = 16_384;

/// Which derived measure drives a zone's occupancy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneParam {
    /// Weighted voxel population.
    Pop,
    /// Approximate surface area in mm^2.
    Sa,
    /// Average brightness scaled to [0, 1000].
    Bright,
    /// Center of gravity along X, [0, 1000] within the box.
    Xc,
    /// Center of gravity along Y.
    Yc,
    /// Center of gravity along Z.
    Zc,
}

impl ZoneParam {
    pub const ALL: [ZoneParam; 6] = [
        ZoneParam::Pop,
        ZoneParam::Sa,
        ZoneParam::Bright,
        ZoneParam::Xc,
        ZoneParam::Yc,
        ZoneParam::Zc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ZoneParam::Pop => "pop",
            ZoneParam::Sa => "sa",
            ZoneParam::Bright => "bright",
            ZoneParam::Xc => "xc",
            ZoneParam::Yc => "yc",
            ZoneParam::Zc => "zc",
        }
    }

    pub fn from_name(name: &str) -> Option<ZoneParam> {
        ZoneParam::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Declared `[min, max]` range for thresholds on this parameter.
    pub fn range(self) -> (i32, i32) {
        match self {
            ZoneParam::Pop => (0, 1_000_000),
            ZoneParam::Sa => (0, 100_000_000),
            ZoneParam::Bright | ZoneParam::Xc | ZoneParam::Yc | ZoneParam::Zc => (0, 1000),
        }
    }

    /// Default rising threshold loaded on a param change.
    pub fn default_on(self) -> i32 {
        match self {
            ZoneParam::Pop => 1,
            ZoneParam::Sa => 1000,
            ZoneParam::Bright => 600,
            ZoneParam::Xc | ZoneParam::Yc | ZoneParam::Zc => 500,
        }
    }

    /// Default falling threshold loaded on a param change.
    pub fn default_off(self) -> i32 {
        match self {
            ZoneParam::Pop => 1,
            ZoneParam::Sa => 900,
            ZoneParam::Bright => 500,
            ZoneParam::Xc | ZoneParam::Yc | ZoneParam::Zc => 500,
        }
    }
}

/// A named rectangular volume plus its live sensing state.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: String,

    // World box, whole millimeters.
    pub xmin: i32,
    pub ymin: i32,
    pub zmin: i32,
    pub xmax: i32,
    pub ymax: i32,
    pub zmax: i32,

    // Screen box, pixels / raw depth indices. Kept in sync with the
    // world box by the setters.
    pub px_xmin: u16,
    pub px_ymin: u16,
    pub px_zmin: u16,
    pub px_xmax: u16,
    pub px_ymax: u16,
    pub px_zmax: u16,

    pub negate: bool,
    pub param: ZoneParam,
    pub on_level: i32,
    pub off_level: i32,
    pub on_delay: u32,
    pub off_delay: u32,

    // Per-frame accumulators, zeroed at the top of every depth pass.
    pub pop: i64,
    pub xsum: i64,
    pub ysum: i64,
    pub zsum: i64,
    pub bsum: i64,

    // Derived after each pass.
    pub xc: i32,
    pub yc: i32,
    pub zc: i32,
    pub sa: i64,
    /// Screen-box pixel area, cached; never below 1.
    pub maxpop: i64,

    // Debounce and broadcast bookkeeping.
    pub occupied: bool,
    pub lastoccupied: bool,
    pub count: u32,
    pub new_zone: bool,
    pub lastpop: i64,
}

/// atoi-style numeric parse used throughout the protocol: "true" and
/// "false" map to 1/0, otherwise the leading optionally-signed digit
/// run is taken and any tail is ignored.
pub fn parse_num(s: &str) -> i64 {
    let t = s.trim();
    if t.eq_ignore_ascii_case("true") {
        return 1;
    }
    if t.eq_ignore_ascii_case("false") {
        return 0;
    }
    let bytes = t.as_bytes();
    let mut i = 0;
    let mut neg = false;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        neg = bytes[i] == b'-';
        i += 1;
    }
    let mut v: i64 = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        v = v.saturating_mul(10).saturating_add(i64::from(bytes[i] - b'0'));
        i += 1;
    }
    if neg { -v } else { v }
}

pub(crate) fn validate_name(name: &str) -> Result<(), ZoneError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ZoneError::InvalidName(name.into()));
    }
    if name
        .chars()
        .any(|c| c == ',' || c == '\t' || c.is_control())
    {
        return Err(ZoneError::InvalidName(name.into()));
    }
    Ok(())
}

impl Zone {
    /// Build a zone from a world box given as two opposite corners.
    ///
    /// Endpoints are sorted, zero-width axes widened by 1 mm, and the
    /// screen box derived. A box touching zero or negative depth is a
    /// conflict, not something to repair.
    pub fn new(name: &str, corners: [i32; 6], luts: &Luts) -> Result<Zone, ZoneError> {
        validate_name(name)?;
        let [x1, y1, z1, x2, y2, z2] = corners;
        if z1 <= 0 || z2 <= 0 {
            return Err(ZoneError::BadBox);
        }
        let mut zone = Zone {
            name: name.to_owned(),
            xmin: 0,
            ymin: 0,
            zmin: 1,
            xmax: 1,
            ymax: 1,
            zmax: 2,
            px_xmin: 0,
            px_ymin: 0,
            px_zmin: 0,
            px_xmax: 1,
            px_ymax: 1,
            px_zmax: 0,
            negate: false,
            param: ZoneParam::Pop,
            on_level: ZoneParam::Pop.default_on(),
            off_level: ZoneParam::Pop.default_off(),
            on_delay: 0,
            off_delay: 0,
            pop: 0,
            xsum: 0,
            ysum: 0,
            zsum: 0,
            bsum: 0,
            xc: -1,
            yc: -1,
            zc: -1,
            sa: 0,
            maxpop: 1,
            occupied: false,
            lastoccupied: false,
            count: 0,
            new_zone: true,
            lastpop: 0,
        };
        zone.set_world_box([x1, y1, z1, x2, y2, z2], luts);
        Ok(zone)
    }

    /// Replace the whole world box (corner order free) and resync screen.
    pub fn set_world_box(&mut self, corners: [i32; 6], luts: &Luts) {
        let [x1, y1, z1, x2, y2, z2] = corners;
        let clamp = |v: i32| v.clamp(-WORLD_RANGE_MM, WORLD_RANGE_MM);
        self.xmin = clamp(x1.min(x2));
        self.xmax = clamp(x1.max(x2));
        self.ymin = clamp(y1.min(y2));
        self.ymax = clamp(y1.max(y2));
        self.zmin = z1.min(z2).clamp(1, WORLD_RANGE_MM);
        self.zmax = z1.max(z2).clamp(1, WORLD_RANGE_MM);
        if self.xmin == self.xmax {
            self.xmax += 1;
        }
        if self.ymin == self.ymax {
            self.ymax += 1;
        }
        if self.zmin >= self.zmax {
            self.zmax = self.zmin + 1;
        }
        self.world_to_screen(luts);
    }

    /// Recompute the screen box from the world box.
    ///
    /// Each world endpoint is projected at both depth endpoints and the
    /// enclosing pixel interval kept; on either side of the optical axis
    /// the extreme comes from the near depth, which the min/max fold
    /// picks up without casing on the sign.
    pub fn world_to_screen(&mut self, luts: &Luts) {
        let zn = self.zmin.max(1);
        let zf = self.zmax.max(zn + 1);

        // World X decreases with screen column, so the column interval
        // start comes from xmax.
        let x_lo = xscreen(self.xmax, zn).min(xscreen(self.xmax, zf));
        let x_hi = xscreen(self.xmin, zn).max(xscreen(self.xmin, zf));
        let y_lo = yscreen(self.ymax, zn).min(yscreen(self.ymax, zf));
        let y_hi = yscreen(self.ymin, zn).max(yscreen(self.ymin, zf));

        self.px_xmin = x_lo.clamp(0, FRAME_W as i32 - 2) as u16;
        self.px_xmax = x_hi.clamp(self.px_xmin as i32 + 1, FRAME_W as i32 - 1) as u16;
        self.px_ymin = y_lo.clamp(0, FRAME_H as i32 - 2) as u16;
        self.px_ymax = y_hi.clamp(self.px_ymin as i32 + 1, FRAME_H as i32 - 1) as u16;
        self.px_zmin = luts.reverse_lut(self.zmin);
        self.px_zmax = luts.reverse_lut(self.zmax).max(self.px_zmin);
        self.update_maxpop();
    }

    /// Recompute the world box from the screen box.
    ///
    /// Inverse of [`world_to_screen`](Self::world_to_screen): each
    /// screen edge maps back through the depth endpoint it was
    /// projected from. An edge past the frame center on its own side
    /// is the zone's farthest point from the optical axis and came
    /// from the near plane; an edge short of center came from the far
    /// plane.
    pub fn screen_to_world(&mut self, luts: &Luts) {
        let zn = luts.depth_mm(self.px_zmin).max(1);
        let zf = luts.depth_mm(self.px_zmax).max(zn);
        let half_w = FRAME_W as i32 / 2;
        let half_h = FRAME_H as i32 / 2;
        let clamp = |v: i32| v.clamp(-WORLD_RANGE_MM, WORLD_RANGE_MM);

        let xmin_z = if i32::from(self.px_xmax) >= half_w { zn } else { zf };
        let xmax_z = if i32::from(self.px_xmin) <= half_w { zn } else { zf };
        let ymin_z = if i32::from(self.px_ymax) >= half_h { zn } else { zf };
        let ymax_z = if i32::from(self.px_ymin) <= half_h { zn } else { zf };
        self.xmin = clamp(xworld(i32::from(self.px_xmax), xmin_z));
        self.xmax = clamp(xworld(i32::from(self.px_xmin), xmax_z));
        self.ymin = clamp(yworld(i32::from(self.px_ymax), ymin_z));
        self.ymax = clamp(yworld(i32::from(self.px_ymin), ymax_z));

        self.zmin = zn.clamp(1, WORLD_RANGE_MM - 1);
        self.zmax = zf.clamp(self.zmin + 1, WORLD_RANGE_MM);
        if self.xmin >= self.xmax {
            self.xmax = self.xmin + 1;
        }
        if self.ymin >= self.ymax {
            self.ymax = self.ymin + 1;
        }
        self.update_maxpop();
    }

    fn update_maxpop(&mut self) {
        let w = i64::from(self.px_xmax) - i64::from(self.px_xmin);
        let h = i64::from(self.px_ymax) - i64::from(self.px_ymin);
        self.maxpop = (w * h).max(1);
    }

    /// Set one attribute by protocol key. Returns `true` when the
    /// mutation changed zone geometry (callers must mark the coverage
    /// map dirty).
    pub fn set_attr(&mut self, key: &str, value: &str, luts: &Luts) -> Result<bool, ZoneError> {
        match key {
            "xmin" | "xmax" | "ymin" | "ymax" | "zmin" | "zmax" => {
                self.set_world_axis(key, parse_num(value));
                self.world_to_screen(luts);
                Ok(true)
            }
            "px_xmin" | "px_xmax" | "px_ymin" | "px_ymax" | "px_zmin" | "px_zmax" => {
                self.set_pixel_axis(key, parse_num(value));
                self.screen_to_world(luts);
                Ok(true)
            }
            "negate" => {
                self.negate = parse_num(value) != 0;
                Ok(false)
            }
            "param" => {
                let param = ZoneParam::from_name(value.trim())
                    .ok_or_else(|| ZoneError::InvalidValue(value.into()))?;
                self.param = param;
                self.on_level = param.default_on();
                self.off_level = param.default_off();
                self.occupied = false;
                self.count = 0;
                Ok(false)
            }
            "on_level" => {
                let (lo, hi) = self.param.range();
                self.on_level = parse_num(value).clamp(i64::from(lo), i64::from(hi)) as i32;
                if self.off_level > self.on_level {
                    self.off_level = self.on_level;
                }
                Ok(false)
            }
            "off_level" => {
                let (lo, hi) = self.param.range();
                self.off_level = parse_num(value).clamp(i64::from(lo), i64::from(hi)) as i32;
                if self.on_level < self.off_level {
                    self.on_level = self.off_level;
                }
                Ok(false)
            }
            "on_delay" => {
                self.on_delay = parse_num(value).clamp(0, i64::from(u32::MAX)) as u32;
                Ok(false)
            }
            "off_delay" => {
                self.off_delay = parse_num(value).clamp(0, i64::from(u32::MAX)) as u32;
                Ok(false)
            }
            "pop" | "maxpop" | "xc" | "yc" | "zc" | "sa" | "occupied" | "name" => {
                Err(ZoneError::ReadOnlyAttr(key.into()))
            }
            _ => Err(ZoneError::InvalidAttr(key.into())),
        }
    }

    fn set_world_axis(&mut self, key: &str, raw: i64) {
        let v = raw.clamp(-i64::from(WORLD_RANGE_MM), i64::from(WORLD_RANGE_MM)) as i32;
        match key {
            "xmin" => {
                self.xmin = v;
                if self.xmax <= self.xmin {
                    self.xmax = self.xmin + 1;
                }
            }
            "xmax" => {
                self.xmax = v;
                if self.xmin >= self.xmax {
                    self.xmin = self.xmax - 1;
                }
            }
            "ymin" => {
                self.ymin = v;
                if self.ymax <= self.ymin {
                    self.ymax = self.ymin + 1;
                }
            }
            "ymax" => {
                self.ymax = v;
                if self.ymin >= self.ymax {
                    self.ymin = self.ymax - 1;
                }
            }
            "zmin" => {
                self.zmin = v.max(1);
                if self.zmax <= self.zmin {
                    self.zmax = self.zmin + 1;
                }
            }
            "zmax" => {
                self.zmax = v.max(2);
                if self.zmin >= self.zmax {
                    self.zmin = self.zmax - 1;
                }
            }
            _ => unreachable!("checked by caller"),
        }
    }

    fn set_pixel_axis(&mut self, key: &str, raw: i64) {
        let w = FRAME_W as i64;
        let h = FRAME_H as i64;
        let zmax = i64::from(MAX_DEPTH_INDEX);
        match key {
            "px_xmin" => {
                self.px_xmin = raw.clamp(0, w - 2) as u16;
                if self.px_xmax <= self.px_xmin {
                    self.px_xmax = self.px_xmin + 1;
                }
            }
            "px_xmax" => {
                self.px_xmax = raw.clamp(1, w - 1) as u16;
                if self.px_xmin >= self.px_xmax {
                    self.px_xmin = self.px_xmax - 1;
                }
            }
            "px_ymin" => {
                self.px_ymin = raw.clamp(0, h - 2) as u16;
                if self.px_ymax <= self.px_ymin {
                    self.px_ymax = self.px_ymin + 1;
                }
            }
            "px_ymax" => {
                self.px_ymax = raw.clamp(1, h - 1) as u16;
                if self.px_ymin >= self.px_ymax {
                    self.px_ymin = self.px_ymax - 1;
                }
            }
            "px_zmin" => {
                self.px_zmin = raw.clamp(0, zmax) as u16;
                if self.px_zmax < self.px_zmin {
                    self.px_zmax = self.px_zmin;
                }
            }
            "px_zmax" => {
                self.px_zmax = raw.clamp(0, zmax) as u16;
                if self.px_zmin > self.px_zmax {
                    self.px_zmin = self.px_zmax;
                }
            }
            _ => unreachable!("checked by caller"),
        }
        self.update_maxpop();
    }

    /// Whether the screen box covers pixel (x, y). Half-open on x/y.
    #[inline]
    pub fn covers_pixel(&self, x: u16, y: u16) -> bool {
        x >= self.px_xmin && x < self.px_xmax && y >= self.px_ymin && y < self.px_ymax
    }

    /// Whether the world box contains point (xw, yw, zw), inclusive.
    #[inline]
    pub fn contains_world(&self, xw: i32, yw: i32, zw: i32) -> bool {
        xw >= self.xmin
            && xw <= self.xmax
            && yw >= self.ymin
            && yw <= self.ymax
            && zw >= self.zmin
            && zw <= self.zmax
    }

    /// Zero the per-frame depth accumulators.
    pub fn reset_depth_counters(&mut self) {
        self.pop = 0;
        self.xsum = 0;
        self.ysum = 0;
        self.zsum = 0;
    }

    /// Fold a weighted world-space sample into the accumulators.
    #[inline]
    pub fn accumulate(&mut self, weight: i64, xw: i32, yw: i32, zw: i32) {
        self.pop += weight;
        self.xsum += weight * i64::from(xw);
        self.ysum += weight * i64::from(yw);
        self.zsum += weight * i64::from(zw);
    }

    /// Derive sa and the centers of gravity after a depth sweep.
    pub fn finish_depth_pass(&mut self, luts: &Luts) {
        if self.pop > 0 {
            let zavg = (self.zsum / self.pop).clamp(0, i64::from(i32::MAX)) as i32;
            let sidx = luts.reverse_lut(zavg);
            self.sa = ((self.pop as f64) * luts.surface_mm2(sidx)) as i64;
            self.xc = center_ratio(self.xsum / self.pop, self.xmin, self.xmax);
            self.yc = center_ratio(self.ysum / self.pop, self.ymin, self.ymax);
            self.zc = center_ratio(self.zsum / self.pop, self.zmin, self.zmax);
        } else {
            self.sa = 0;
            self.xc = -1;
            self.yc = -1;
            self.zc = -1;
        }
    }

    /// Brightness measure: average sampled byte scaled to [0, 1000],
    /// normalized by the screen-box area (sampling runs at stride 8).
    pub fn bright(&self) -> i64 {
        if self.maxpop <= 0 {
            return 0;
        }
        ((self.bsum * 64 * 1000) / (255 * self.maxpop)).clamp(0, 1000)
    }

    /// Current value of the configured parameter plus whether occupancy
    /// is allowed at all this frame. Depth-derived measures cannot
    /// assert occupancy from an empty zone; brightness comes from the
    /// video path and always may.
    pub fn param_value(&self) -> (i64, bool) {
        let seen = self.pop > 0;
        match self.param {
            ZoneParam::Pop => (self.pop, seen),
            ZoneParam::Sa => (self.sa, seen),
            ZoneParam::Bright => (self.bright(), true),
            ZoneParam::Xc => (i64::from(self.xc), seen),
            ZoneParam::Yc => (i64::from(self.yc), seen),
            ZoneParam::Zc => (i64::from(self.zc), seen),
        }
    }

    /// One debounce step. `candidate` is this frame's raw decision;
    /// the flip happens only after strictly more than the configured
    /// delay of consecutive disagreeing frames.
    pub fn apply_debounce(&mut self, candidate: bool) {
        if candidate != self.occupied {
            self.count += 1;
        } else {
            self.count = 0;
        }
        if !self.occupied && self.count > self.on_delay {
            self.occupied = true;
            self.count = 0;
        } else if self.occupied && self.count > self.off_delay {
            self.occupied = false;
            self.count = 0;
        }
    }

    /// Occupancy as reported to clients (`negate` applied).
    #[inline]
    pub fn effective_occupied(&self) -> bool {
        self.occupied ^ self.negate
    }

    /// Render the protocol record line body. The short form (periodic
    /// updates for a structurally unchanged zone) omits everything
    /// before `occupied=`.
    pub fn format_record(&self, full: bool) -> String {
        let mut s = String::with_capacity(if full { 256 } else { 96 });
        if full {
            let _ = write!(
                s,
                "xmin={} ymin={} zmin={} xmax={} ymax={} zmax={} \
                 px_xmin={} px_ymin={} px_zmin={} px_xmax={} px_ymax={} px_zmax={} \
                 negate={} param={} on_level={} off_level={} on_delay={} off_delay={} ",
                self.xmin,
                self.ymin,
                self.zmin,
                self.xmax,
                self.ymax,
                self.zmax,
                self.px_xmin,
                self.px_ymin,
                self.px_zmin,
                self.px_xmax,
                self.px_ymax,
                self.px_zmax,
                u8::from(self.negate),
                self.param.name(),
                self.on_level,
                self.off_level,
                self.on_delay,
                self.off_delay,
            );
        }
        let _ = write!(
            s,
            "occupied={} pop={} maxpop={} xc={} yc={} zc={} sa={} name=\"{}\"",
            u8::from(self.effective_occupied()),
            self.pop,
            self.maxpop,
            self.xc,
            self.yc,
            self.zc,
            self.sa,
            self.name,
        );
        s
    }
}

fn center_ratio(v: i64, lo: i32, hi: i32) -> i32 {
    let span = i64::from(hi) - i64::from(lo);
    if span <= 0 {
        return 0;
    }
    (((v - i64::from(lo)) * 1000) / span).clamp(0, 1000) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn zone(corners: [i32; 6]) -> Zone {
        Zone::new("test", corners, Luts::get()).expect("valid zone")
    }

    #[test]
    fn new_normalizes_corner_order() {
        let z = zone([500, 200, 2000, -500, -200, 1000]);
        assert_eq!((z.xmin, z.xmax), (-500, 500));
        assert_eq!((z.ymin, z.ymax), (-200, 200));
        assert_eq!((z.zmin, z.zmax), (1000, 2000));
    }

    #[test]
    fn new_rejects_nonpositive_depth() {
        let luts = Luts::get();
        assert!(matches!(
            Zone::new("z", [0, 0, 0, 1, 1, 1], luts),
            Err(ZoneError::BadBox)
        ));
        assert!(matches!(
            Zone::new("z", [0, 0, -5, 1, 1, 1000], luts),
            Err(ZoneError::BadBox)
        ));
    }

    #[test]
    fn zero_width_axes_widen() {
        let z = zone([100, 100, 1000, 100, 100, 1000]);
        assert!(z.xmin < z.xmax);
        assert!(z.ymin < z.ymax);
        assert!(z.zmin < z.zmax);
        assert!(z.maxpop >= 1);
    }

    #[test]
    fn name_rules() {
        let luts = Luts::get();
        assert!(Zone::new("Living Room", [0, 0, 1000, 1, 1, 2000], luts).is_ok());
        assert!(Zone::new("", [0, 0, 1000, 1, 1, 2000], luts).is_err());
        assert!(Zone::new("a,b", [0, 0, 1000, 1, 1, 2000], luts).is_err());
        assert!(Zone::new("a\tb", [0, 0, 1000, 1, 1, 2000], luts).is_err());
        assert!(Zone::new("a\nb", [0, 0, 1000, 1, 1, 2000], luts).is_err());
        assert!(Zone::new(&"x".repeat(128), [0, 0, 1000, 1, 1, 2000], luts).is_err());
        assert!(Zone::new(&"x".repeat(127), [0, 0, 1000, 1, 1, 2000], luts).is_ok());
    }

    #[test]
    fn world_axis_clamps_opposite_endpoint_outward() {
        let luts = Luts::get();
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        z.set_attr("xmin", "600", luts).unwrap();
        assert_eq!(z.xmin, 600);
        assert_eq!(z.xmax, 601);
        z.set_attr("zmax", "900", luts).unwrap();
        assert_eq!(z.zmax, 900);
        assert_eq!(z.zmin, 899);
        z.set_attr("zmax", "-5", luts).unwrap();
        assert_eq!(z.zmax, 2);
        assert_eq!(z.zmin, 1);
    }

    #[test]
    fn pixel_axis_keeps_order_and_bounds() {
        let luts = Luts::get();
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        z.set_attr("px_xmin", "700", luts).unwrap();
        assert_eq!(z.px_xmin, 638);
        assert_eq!(z.px_xmax, 639);
        z.set_attr("px_zmin", "1092", luts).unwrap();
        // Equality is legal for the depth window.
        assert_eq!(z.px_zmin, 1092);
        assert_eq!(z.px_zmax, 1092);
    }

    #[test]
    fn world_screen_round_trip_is_bounded() {
        let luts = Luts::get();
        // Pixel pitch in mm at depth zw for the X axis.
        let pitch = |zw: i64| ((zw * 1089 * 0xCCCD) >> 35).max(1) as i32;
        // Boxes chosen inside the view frustum; the projection cannot
        // represent volume outside it.
        for &(x1, y1, z1, x2, y2, z2) in &[
            (-400, -300, 800, 400, 300, 1200),
            (-700, -150, 1500, -200, 150, 2500),
            (100, 100, 700, 300, 250, 900),
        ] {
            let mut z = zone([x1, y1, z1, x2, y2, z2]);
            let before = (z.xmin, z.ymin, z.zmin, z.xmax, z.ymax, z.zmax);
            z.screen_to_world(luts);
            // Pixel quantization plus the depth-table step dominate the
            // reconstruction error.
            let tol = 2 * pitch(i64::from(before.5)) + before.5 / 40 + 2;
            assert!((z.xmin - before.0).abs() <= tol, "xmin {} -> {}", before.0, z.xmin);
            assert!((z.xmax - before.3).abs() <= tol);
            assert!((z.ymin - before.1).abs() <= tol);
            assert!((z.ymax - before.4).abs() <= tol);
            // Depth round trips through the table; the table step near
            // these depths stays under a couple of percent.
            assert!((z.zmin - before.2).abs() <= before.2 / 20 + 2);
            assert!((z.zmax - before.5).abs() <= before.5 / 20 + 2);
        }
    }

    #[test]
    fn param_change_resets_state_and_thresholds() {
        let luts = Luts::get();
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        z.occupied = true;
        z.count = 3;
        z.set_attr("param", "bright", luts).unwrap();
        assert_eq!(z.param, ZoneParam::Bright);
        assert!(!z.occupied);
        assert_eq!(z.count, 0);
        assert_eq!(z.on_level, 600);
        assert_eq!(z.off_level, 500);
    }

    #[test]
    fn threshold_monotonicity_enforced() {
        let luts = Luts::get();
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        z.set_attr("param", "bright", luts).unwrap();
        z.set_attr("on_level", "400", luts).unwrap();
        assert_eq!(z.on_level, 400);
        assert_eq!(z.off_level, 400);
        z.set_attr("off_level", "500", luts).unwrap();
        assert_eq!(z.off_level, 500);
        assert_eq!(z.on_level, 500);
        // Clamped into the bright range.
        z.set_attr("on_level", "5000", luts).unwrap();
        assert_eq!(z.on_level, 1000);
    }

    #[test]
    fn read_only_and_unknown_attrs_rejected() {
        let luts = Luts::get();
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        assert!(matches!(
            z.set_attr("pop", "5", luts),
            Err(ZoneError::ReadOnlyAttr(_))
        ));
        assert!(matches!(
            z.set_attr("name", "other", luts),
            Err(ZoneError::ReadOnlyAttr(_))
        ));
        assert!(matches!(
            z.set_attr("bogus", "1", luts),
            Err(ZoneError::InvalidAttr(_))
        ));
    }

    #[test]
    fn numeric_parse_truncates_tails() {
        assert_eq!(parse_num("42abc"), 42);
        assert_eq!(parse_num("-17.9"), -17);
        assert_eq!(parse_num("true"), 1);
        assert_eq!(parse_num("false"), 0);
        assert_eq!(parse_num("junk"), 0);
        assert_eq!(parse_num("  8 "), 8);
    }

    #[test]
    fn debounce_requires_strictly_more_than_delay() {
        let luts = Luts::get();
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        z.on_delay = 2;
        z.off_delay = 1;
        // Three qualifying frames needed before the flip (count > 2).
        z.apply_debounce(true);
        assert!(!z.occupied);
        z.apply_debounce(true);
        assert!(!z.occupied);
        z.apply_debounce(true);
        assert!(z.occupied);
        // One disqualifying frame is not enough (count > 1).
        z.apply_debounce(false);
        assert!(z.occupied);
        z.apply_debounce(false);
        assert!(!z.occupied);
        let _ = luts;
    }

    #[test]
    fn debounce_interruption_resets_count() {
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        z.on_delay = 2;
        z.apply_debounce(true);
        z.apply_debounce(true);
        z.apply_debounce(false); // streak broken
        z.apply_debounce(true);
        z.apply_debounce(true);
        assert!(!z.occupied);
        z.apply_debounce(true);
        assert!(z.occupied);
    }

    #[test]
    fn record_format_full_and_short() {
        let mut z = zone([1, 1, 1000, 2, 2, 2000]);
        z.pop = 12;
        z.negate = true;
        let full = z.format_record(true);
        assert!(full.starts_with("xmin=1 ymin=1 zmin=1000 "));
        assert!(full.contains("param=pop"));
        assert!(full.contains("occupied=1")); // negate flips the idle zone on
        assert!(full.ends_with("name=\"test\""));
        let short = z.format_record(false);
        assert!(short.starts_with("occupied=1 pop=12 maxpop="));
        assert!(!short.contains("xmin="));
    }

    #[test]
    fn bright_scales_to_permille() {
        let mut z = zone([-500, -500, 1000, 500, 500, 2000]);
        // Saturate: every 8x8 cell sampled at 255.
        z.bsum = (z.maxpop / 64) * 255;
        assert!(z.bright() > 950);
        z.bsum = 0;
        assert_eq!(z.bright(), 0);
    }
}
