//! Zone catalog: the shared, versioned collection of zones.
//!
//! One mutex guards the whole catalog. The occupancy engine holds it for
//! an entire frame pass; command handlers hold it per operation. Catalog
//! mutations are human-timescale, so a single exclusive lock beats a
//! reader/writer split here.
//!
//! The version counter is the change token for persistence and for
//! subscriber fast paths. It only moves on structural mutation (never on
//! per-frame counter updates) and wraps around the reserved all-ones
//! sentinel, which readers return when the catalog cannot be inspected.

use std::sync::{Mutex, MutexGuard};

use core_lut::{Luts, FRAME_H, FRAME_W};
use tracing::{debug, info};

mod zone;

pub use zone::{parse_num, Zone, ZoneParam, MAX_NAME_LEN, WORLD_RANGE_MM};

/// Reserved version value: "catalog could not be inspected".
pub const VERSION_INVALID: u32 = u32::MAX;

/// Errors surfaced by catalog and zone operations.
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    #[error("invalid zone name {0:?}")]
    InvalidName(String),
    #[error("zone {0:?} already exists")]
    Duplicate(String),
    #[error("no zone named {0:?}")]
    NotFound(String),
    #[error("unknown attribute {0:?}")]
    InvalidAttr(String),
    #[error("attribute {0:?} is read-only")]
    ReadOnlyAttr(String),
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("malformed zone box")]
    BadBox,
}

fn next_version(v: u32) -> u32 {
    let n = v.wrapping_add(1);
    if n == VERSION_INVALID { 0 } else { n }
}

/// Everything behind the catalog lock.
pub struct CatalogState {
    zones: Vec<Zone>,
    version: u32,
    xskip: u16,
    yskip: u16,
    // Per sampled pixel: tightest [min, max] raw-depth window of any
    // covering zone; (u16::MAX, 0) where nothing covers the pixel.
    range_map: Vec<(u16, u16)>,
    range_dirty: bool,
    /// Index of the occupied zone with the largest surface area this
    /// frame; -1 when none.
    pub max_zone: i32,
    /// Zones reporting occupied (negate applied) after the last pass.
    pub occupied: u32,
    /// Out-of-range samples seen during the last depth pass, weighted.
    pub oor_total: i64,
}

impl CatalogState {
    fn new(xskip: u16, yskip: u16) -> CatalogState {
        let mut state = CatalogState {
            zones: Vec::new(),
            version: 0,
            xskip: xskip.max(1),
            yskip: yskip.max(1),
            range_map: Vec::new(),
            range_dirty: true,
            max_zone: -1,
            occupied: 0,
            oor_total: 0,
        };
        state.range_map = vec![(u16::MAX, 0); state.cols() * state.rows()];
        state
    }

    #[inline]
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    #[inline]
    pub fn zones_mut(&mut self) -> &mut [Zone] {
        &mut self.zones
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Advance the change token, skipping the reserved sentinel.
    pub fn bump_version(&mut self) {
        self.version = next_version(self.version);
    }

    #[inline]
    pub fn xskip(&self) -> u16 {
        self.xskip
    }

    #[inline]
    pub fn yskip(&self) -> u16 {
        self.yskip
    }

    /// Weight applied to every sampled pixel so results are independent
    /// of the sweep stride.
    #[inline]
    pub fn weight(&self) -> i64 {
        i64::from(self.xskip) * i64::from(self.yskip)
    }

    #[inline]
    fn cols(&self) -> usize {
        FRAME_W.div_ceil(self.xskip as usize)
    }

    #[inline]
    fn rows(&self) -> usize {
        FRAME_H.div_ceil(self.yskip as usize)
    }

    /// Depth window for sampled pixel (x, y).
    #[inline]
    pub fn range_at(&self, x: u16, y: u16) -> (u16, u16) {
        let cx = x as usize / self.xskip as usize;
        let cy = y as usize / self.yskip as usize;
        self.range_map[cy * self.cols() + cx]
    }

    pub fn mark_range_dirty(&mut self) {
        self.range_dirty = true;
    }

    #[inline]
    pub fn range_dirty(&self) -> bool {
        self.range_dirty
    }

    /// Rebuild the dense depth-window map from zone screen boxes.
    pub fn rebuild_range_map(&mut self) {
        let cols = self.cols();
        let (xskip, yskip) = (self.xskip as usize, self.yskip as usize);
        for (cy, y) in (0..FRAME_H).step_by(yskip).enumerate() {
            for (cx, x) in (0..FRAME_W).step_by(xskip).enumerate() {
                let mut lo = u16::MAX;
                let mut hi = 0u16;
                for z in &self.zones {
                    if z.covers_pixel(x as u16, y as u16) {
                        lo = lo.min(z.px_zmin);
                        hi = hi.max(z.px_zmax);
                    }
                }
                self.range_map[cy * cols + cx] = (lo, hi);
            }
        }
        self.range_dirty = false;
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.zones
            .iter()
            .position(|z| z.name.eq_ignore_ascii_case(name))
    }

    /// Live count of zones reporting occupied (negate applied).
    pub fn occupied_live(&self) -> u32 {
        self.zones.iter().filter(|z| z.effective_occupied()).count() as u32
    }
}

/// Thread-safe zone catalog. All public operations lock internally;
/// [`ZoneCatalog::lock`] exposes the guard for whole-pass holders.
pub struct ZoneCatalog {
    inner: Mutex<CatalogState>,
    luts: &'static Luts,
}

impl ZoneCatalog {
    pub fn new(xskip: u16, yskip: u16) -> ZoneCatalog {
        ZoneCatalog {
            inner: Mutex::new(CatalogState::new(xskip, yskip)),
            luts: Luts::get(),
        }
    }

    #[inline]
    pub fn luts(&self) -> &'static Luts {
        self.luts
    }

    /// Acquire the catalog lock. A poisoned lock is taken over rather
    /// than propagated; recovery policy is local.
    pub fn lock(&self) -> MutexGuard<'_, CatalogState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Change token. Returns [`VERSION_INVALID`] when the catalog state
    /// cannot be inspected.
    pub fn version(&self) -> u32 {
        match self.inner.lock() {
            Ok(g) => g.version,
            Err(_) => VERSION_INVALID,
        }
    }

    pub fn bump_version(&self) {
        self.lock().bump_version();
    }

    pub fn count(&self) -> usize {
        self.lock().zones.len()
    }

    pub fn occupied_count(&self) -> u32 {
        self.lock().occupied_live()
    }

    /// Peak zone: `(index, name)` of the occupied zone with the largest
    /// surface area, or `(-1, None)`.
    pub fn peak(&self) -> (i32, Option<String>) {
        let g = self.lock();
        let idx = g.max_zone;
        if idx >= 0 {
            if let Some(z) = g.zones.get(idx as usize) {
                return (idx, Some(z.name.clone()));
            }
        }
        (-1, None)
    }

    /// Add a zone from two world-space corners.
    pub fn add(&self, name: &str, corners: [i32; 6]) -> Result<(), ZoneError> {
        let mut g = self.lock();
        if g.position(name).is_some() {
            return Err(ZoneError::Duplicate(name.into()));
        }
        let zone = Zone::new(name, corners, self.luts)?;
        info!(
            target: "catalog",
            name,
            xmin = zone.xmin,
            ymin = zone.ymin,
            zmin = zone.zmin,
            xmax = zone.xmax,
            ymax = zone.ymax,
            zmax = zone.zmax,
            "zone_added"
        );
        g.zones.push(zone);
        g.mark_range_dirty();
        g.bump_version();
        Ok(())
    }

    /// Remove a zone by name.
    pub fn remove(&self, name: &str) -> Result<(), ZoneError> {
        let mut g = self.lock();
        let idx = g.position(name).ok_or_else(|| ZoneError::NotFound(name.into()))?;
        let zone = g.zones.remove(idx);
        info!(target: "catalog", name = zone.name.as_str(), "zone_removed");
        g.max_zone = -1;
        g.mark_range_dirty();
        g.bump_version();
        Ok(())
    }

    /// Remove every zone, returning the removed names in order.
    pub fn clear(&self) -> Vec<String> {
        let mut g = self.lock();
        let names: Vec<String> = g.zones.iter().map(|z| z.name.clone()).collect();
        if !names.is_empty() {
            info!(target: "catalog", removed = names.len(), "catalog_cleared");
            g.zones.clear();
            g.max_zone = -1;
            g.mark_range_dirty();
            g.bump_version();
        }
        names
    }

    pub fn find_by_name(&self, name: &str) -> bool {
        self.lock().position(name).is_some()
    }

    /// Replace a zone's world box.
    pub fn set_box(&self, name: &str, corners: [i32; 6]) -> Result<(), ZoneError> {
        let mut g = self.lock();
        let idx = g.position(name).ok_or_else(|| ZoneError::NotFound(name.into()))?;
        let [_, _, z1, _, _, z2] = corners;
        if z1 <= 0 || z2 <= 0 {
            return Err(ZoneError::BadBox);
        }
        let luts = self.luts;
        let zone = &mut g.zones[idx];
        zone.set_world_box(corners, luts);
        zone.new_zone = true;
        debug!(target: "catalog", name, "zone_box_set");
        g.mark_range_dirty();
        g.bump_version();
        Ok(())
    }

    /// Set one attribute on a zone by protocol key.
    pub fn set_attr(&self, name: &str, key: &str, value: &str) -> Result<(), ZoneError> {
        let mut g = self.lock();
        let idx = g.position(name).ok_or_else(|| ZoneError::NotFound(name.into()))?;
        let luts = self.luts;
        let zone = &mut g.zones[idx];
        let geometry = zone.set_attr(key, value, luts)?;
        zone.new_zone = true;
        debug!(target: "catalog", name, key, value, "zone_attr_set");
        if geometry {
            g.mark_range_dirty();
        }
        g.bump_version();
        Ok(())
    }

    /// Run `f` over every zone under the lock.
    pub fn for_each<F: FnMut(usize, &Zone)>(&self, mut f: F) {
        let g = self.lock();
        for (i, z) in g.zones.iter().enumerate() {
            f(i, z);
        }
    }

    /// End-of-broadcast bookkeeping: clear `new_zone` flags and snapshot
    /// the values the next differential update compares against.
    pub fn touch(&self) {
        let mut g = self.lock();
        for z in &mut g.zones {
            z.new_zone = false;
            z.lastpop = z.pop;
            z.lastoccupied = z.occupied;
        }
    }
}
