//! Zone catalog persistence.
//!
//! The catalog lives in a small text file, `zones.knd`, inside the save
//! directory handed over at startup. Saves write a sibling temp file,
//! flush, fsync, and rename, so the destination is either the old
//! complete file or the new complete file. Loading understands every
//! historical file version; anything that fails to parse is skipped
//! line by line rather than failing the whole load.
//!
//! Format, current version 5 (integer millimeters):
//!
//! ```text
//! 5
//! <motor_tilt_degrees>
//! <zone_count>
//! <name>,<xmin>,<ymin>,<zmin>,<xmax>,<ymax>,<zmax>,<param>,<on_level>,<off_level>,<on_delay>,<off_delay>
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use core_zones::{ZoneCatalog, VERSION_INVALID};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use rand::Rng;
use tracing::{debug, error, info, warn};

/// Catalog file name inside the save directory.
pub const ZONE_FILE: &str = "zones.knd";
/// Temp file written before the atomic rename.
pub const ZONE_FILE_TMP: &str = "zones.knd.tmp";
/// Format version written by [`ZoneStore::save`].
pub const FILE_VERSION: u32 = 5;

// Files older than v3 assumed a different viewing angle; their x/y
// coordinates convert by this factor.
const PRE_V3_XY_FACTOR: f64 = 0.7594;

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("save directory {0:?} is not usable: {1}")]
    BadDir(PathBuf, String),
    #[error("unsupported zone file version {0}")]
    UnsupportedVersion(u32),
    #[error("malformed zone file: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a load pass found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub file_version: u32,
    pub tilt_degrees: i32,
    /// Count advertised by the file's count line.
    pub declared: usize,
    /// Zones actually parsed and added.
    pub loaded: usize,
}

/// Save/load endpoint bound to one validated directory.
pub struct ZoneStore {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl ZoneStore {
    /// Bind to `dir`, failing loudly when it is missing, not a
    /// directory, or not writable by the effective user.
    pub fn new(dir: &Path) -> Result<ZoneStore, PersistError> {
        let meta = fs::metadata(dir)
            .map_err(|e| PersistError::BadDir(dir.into(), e.to_string()))?;
        if !meta.is_dir() {
            return Err(PersistError::BadDir(dir.into(), "not a directory".into()));
        }
        // Probe writability (and traversal) the portable way: create
        // and remove a scratch file.
        let probe = dir.join(".knd-write-probe");
        File::create(&probe)
            .and_then(|_| fs::remove_file(&probe))
            .map_err(|e| PersistError::BadDir(dir.into(), format!("not writable: {e}")))?;
        Ok(ZoneStore {
            path: dir.join(ZONE_FILE),
            tmp_path: dir.join(ZONE_FILE_TMP),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the catalog. The destination is replaced atomically; any
    /// failure along the way leaves it untouched.
    pub fn save(&self, catalog: &ZoneCatalog, tilt_degrees: i32) -> Result<u32, PersistError> {
        // Snapshot under the catalog lock, write with no lock held.
        let (version, lines) = {
            let g = catalog.lock();
            let lines: Vec<String> = g
                .zones()
                .iter()
                .map(|z| {
                    format!(
                        "{},{},{},{},{},{},{},{},{},{},{},{}",
                        z.name,
                        z.xmin,
                        z.ymin,
                        z.zmin,
                        z.xmax,
                        z.ymax,
                        z.zmax,
                        z.param.name(),
                        z.on_level,
                        z.off_level,
                        z.on_delay,
                        z.off_delay,
                    )
                })
                .collect();
            (g.version(), lines)
        };

        let mut f = File::create(&self.tmp_path)?;
        writeln!(f, "{FILE_VERSION}")?;
        writeln!(f, "{tilt_degrees}")?;
        writeln!(f, "{}", lines.len())?;
        for line in &lines {
            writeln!(f, "{line}")?;
        }
        f.flush()?;
        f.sync_all()?;
        drop(f);
        fs::rename(&self.tmp_path, &self.path)?;
        info!(
            target: "persist",
            path = %self.path.display(),
            zones = lines.len(),
            version,
            "catalog_saved"
        );
        Ok(version)
    }

    /// Load zones into `catalog`. A missing file is an empty catalog,
    /// not an error. Unparseable zone lines are skipped with an error
    /// log; the count line is advisory and only warned about.
    pub fn load(&self, catalog: &ZoneCatalog) -> Result<LoadSummary, PersistError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(target: "persist", path = %self.path.display(), "no_saved_zones");
                return Ok(LoadSummary {
                    file_version: FILE_VERSION,
                    tilt_degrees: 0,
                    declared: 0,
                    loaded: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let mut lines = content.lines();
        let version: u32 = lines
            .next()
            .ok_or_else(|| PersistError::Malformed("empty file".into()))?
            .trim()
            .parse()
            .map_err(|_| PersistError::Malformed("bad version line".into()))?;
        if version == 0 || version > FILE_VERSION {
            return Err(PersistError::UnsupportedVersion(version));
        }

        let tilt_degrees = if version >= 2 {
            lines
                .next()
                .and_then(|l| l.trim().parse::<f64>().ok())
                .map(|t| t.round() as i32)
                .unwrap_or(0)
        } else {
            0
        };

        let declared: usize = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0);

        let mut loaded = 0usize;
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            match parse_zone_line(line, version) {
                Ok(parsed) => match install_zone(catalog, &parsed) {
                    Ok(()) => loaded += 1,
                    Err(e) => {
                        error!(target: "persist", name = parsed.name.as_str(), error = %e, "zone_rejected");
                    }
                },
                Err(e) => {
                    error!(target: "persist", error = %e, "zone_line_skipped");
                }
            }
        }
        if loaded != declared {
            warn!(
                target: "persist",
                declared,
                loaded,
                "zone_count_mismatch"
            );
        }
        info!(
            target: "persist",
            file_version = version,
            loaded,
            tilt_degrees,
            "catalog_loaded"
        );
        Ok(LoadSummary {
            file_version: version,
            tilt_degrees,
            declared,
            loaded,
        })
    }
}

struct ParsedZone {
    name: String,
    corners: [i32; 6],
    attrs: Vec<(&'static str, String)>,
}

fn parse_zone_line(line: &str, version: u32) -> Result<ParsedZone, PersistError> {
    let bad = |what: &str| PersistError::Malformed(format!("{what} in {line:?}"));
    let mut fields = line.split(',');
    let name = fields.next().ok_or_else(|| bad("missing name"))?;
    if name.is_empty() || name.len() > core_zones::MAX_NAME_LEN {
        return Err(bad("bad name"));
    }

    let mut coord = |axis: usize| -> Result<i32, PersistError> {
        let raw = fields.next().ok_or_else(|| bad("missing coordinate"))?.trim();
        if version >= 5 {
            raw.parse::<i32>().map_err(|_| bad("bad coordinate"))
        } else {
            // Meters as floats through v4; pre-v3 x/y additionally
            // re-scale for the older viewing angle.
            let mut v = raw.parse::<f64>().map_err(|_| bad("bad coordinate"))?;
            if version < 3 && axis != 2 {
                v *= PRE_V3_XY_FACTOR;
            }
            Ok((v * 1000.0).round() as i32)
        }
    };
    // Corner order in the file is x1,y1,z1,x2,y2,z2.
    let corners = [
        coord(0)?,
        coord(1)?,
        coord(2)?,
        coord(0)?,
        coord(1)?,
        coord(2)?,
    ];

    let mut attrs = Vec::new();
    if version >= 4 {
        let mut tail = |key: &'static str| -> Result<(), PersistError> {
            let raw = fields.next().ok_or_else(|| bad("missing attribute"))?.trim();
            attrs.push((key, raw.to_owned()));
            Ok(())
        };
        tail("param")?;
        tail("on_level")?;
        tail("off_level")?;
        tail("on_delay")?;
        tail("off_delay")?;
    }

    Ok(ParsedZone {
        name: name.to_owned(),
        corners,
        attrs,
    })
}

fn install_zone(catalog: &ZoneCatalog, parsed: &ParsedZone) -> Result<(), core_zones::ZoneError> {
    catalog.add(&parsed.name, parsed.corners)?;
    for (key, value) in &parsed.attrs {
        // A stale attribute value must not cost the whole zone.
        if let Err(e) = catalog.set_attr(&parsed.name, key, value) {
            debug!(target: "persist", name = parsed.name.as_str(), key, error = %e, "attr_skipped");
        }
    }
    Ok(())
}

/// Background saver: wakes a little over twice a second and saves when
/// the catalog version moved and the save interval elapsed.
pub struct Saver {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    last_saved: Arc<AtomicU32>,
}

/// Source for the tilt line written into the file; the saver must not
/// depend on the sensor crate.
pub type TiltSource = Box<dyn Fn() -> i32 + Send>;

impl Saver {
    pub fn spawn(
        store: Arc<ZoneStore>,
        catalog: Arc<ZoneCatalog>,
        tilt: TiltSource,
        save_interval: Duration,
    ) -> Saver {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let last_saved = Arc::new(AtomicU32::new(catalog.version()));
        let thread_last = last_saved.clone();
        let handle = std::thread::Builder::new()
            .name("zone-saver".into())
            .spawn(move || {
                let mut last_save_at = Instant::now();
                loop {
                    // 500 ms base period with up to 100 ms of jitter so
                    // several daemons on one host spread their I/O.
                    let jitter = rand::thread_rng().gen_range(0..100);
                    let tick = Duration::from_millis(500 + jitter);
                    match stop_rx.recv_timeout(tick) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if last_save_at.elapsed() < save_interval {
                        continue;
                    }
                    let version = catalog.version();
                    if version == VERSION_INVALID || version == thread_last.load(Relaxed) {
                        continue;
                    }
                    match store.save(&catalog, tilt()) {
                        Ok(saved_version) => {
                            thread_last.store(saved_version, Relaxed);
                            last_save_at = Instant::now();
                        }
                        Err(e) => {
                            // Leave the destination alone; retry on the
                            // next interval.
                            error!(target: "persist", error = %e, "save_failed");
                            last_save_at = Instant::now();
                        }
                    }
                }
                debug!(target: "persist", "saver_stopped");
            })
            .expect("spawn zone saver");
        Saver {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            last_saved,
        }
    }

    /// Version most recently written to disk.
    pub fn last_saved_version(&self) -> u32 {
        self.last_saved.load(Relaxed)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Saver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_in(dir: &tempfile::TempDir) -> ZoneStore {
        ZoneStore::new(dir.path()).expect("usable dir")
    }

    #[test]
    fn rejects_unusable_directories() {
        let missing = Path::new("/nonexistent/knd-save-dir");
        assert!(matches!(
            ZoneStore::new(missing),
            Err(PersistError::BadDir(..))
        ));
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("plainfile");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            ZoneStore::new(&file),
            Err(PersistError::BadDir(..))
        ));
    }

    #[test]
    fn save_load_round_trip_preserves_attributes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(&dir);
        let catalog = ZoneCatalog::new(2, 2);
        catalog.add("Living Room", [-500, -400, 800, 500, 400, 2000]).unwrap();
        catalog.add("door", [100, -200, 1500, 400, 200, 1800]).unwrap();
        catalog.set_attr("door", "param", "bright").unwrap();
        catalog.set_attr("door", "on_level", "700").unwrap();
        catalog.set_attr("door", "off_level", "650").unwrap();
        catalog.set_attr("door", "on_delay", "3").unwrap();
        catalog.set_attr("door", "off_delay", "5").unwrap();
        store.save(&catalog, -7).unwrap();

        let restored = ZoneCatalog::new(2, 2);
        let summary = store.load(&restored).unwrap();
        assert_eq!(summary.file_version, FILE_VERSION);
        assert_eq!(summary.tilt_degrees, -7);
        assert_eq!(summary.declared, 2);
        assert_eq!(summary.loaded, 2);

        let a = catalog.lock();
        let b = restored.lock();
        for (orig, back) in a.zones().iter().zip(b.zones().iter()) {
            assert_eq!(orig.name, back.name);
            assert_eq!(
                (orig.xmin, orig.ymin, orig.zmin, orig.xmax, orig.ymax, orig.zmax),
                (back.xmin, back.ymin, back.zmin, back.xmax, back.ymax, back.zmax)
            );
            assert_eq!(orig.param, back.param);
            assert_eq!(orig.on_level, back.on_level);
            assert_eq!(orig.off_level, back.off_level);
            assert_eq!(orig.on_delay, back.on_delay);
            assert_eq!(orig.off_delay, back.off_delay);
        }
    }

    #[test]
    fn load_v5_applies_attr_tail_after_param_defaults() {
        // off_level below the bright default must survive the param
        // change that loads defaults first.
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            "5\n0\n1\nz,-100,-100,500,100,100,900,bright,450,300,0,0\n",
        )
        .unwrap();
        let catalog = ZoneCatalog::new(2, 2);
        store.load(&catalog).unwrap();
        let g = catalog.lock();
        let z = &g.zones()[0];
        assert_eq!(z.param.name(), "bright");
        assert_eq!(z.on_level, 450);
        assert_eq!(z.off_level, 300);
    }

    #[test]
    fn load_v1_scales_meters_and_viewing_angle() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(&dir);
        // v1: no tilt line; floats in meters; x/y pre-v3 rescale.
        fs::write(store.path(), "1\n1\nold,-1.0,-0.5,0.8,1.0,0.5,2.0\n").unwrap();
        let catalog = ZoneCatalog::new(2, 2);
        let summary = store.load(&catalog).unwrap();
        assert_eq!(summary.tilt_degrees, 0);
        assert_eq!(summary.loaded, 1);
        let g = catalog.lock();
        let z = &g.zones()[0];
        assert_eq!(z.xmin, -759);
        assert_eq!(z.xmax, 759);
        assert_eq!(z.ymin, -380);
        assert_eq!(z.ymax, 380);
        // Depth never rescales.
        assert_eq!(z.zmin, 800);
        assert_eq!(z.zmax, 2000);
    }

    #[test]
    fn load_v3_keeps_xy_unscaled() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "3\n5\n1\nmid,-1.0,-0.5,0.8,1.0,0.5,2.0\n").unwrap();
        let catalog = ZoneCatalog::new(2, 2);
        let summary = store.load(&catalog).unwrap();
        assert_eq!(summary.tilt_degrees, 5);
        let g = catalog.lock();
        let z = &g.zones()[0];
        assert_eq!((z.xmin, z.xmax), (-1000, 1000));
        assert_eq!((z.ymin, z.ymax), (-500, 500));
    }

    #[test]
    fn bad_lines_skip_and_count_is_advisory() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(
            store.path(),
            "5\n0\n3\nok,-100,-100,500,100,100,900,pop,1,1,0,0\nbroken,nope\n",
        )
        .unwrap();
        let catalog = ZoneCatalog::new(2, 2);
        let summary = store.load(&catalog).unwrap();
        assert_eq!(summary.declared, 3);
        assert_eq!(summary.loaded, 1);
        assert_eq!(catalog.count(), 1);
    }

    #[test]
    fn unsupported_version_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(&dir);
        fs::write(store.path(), "9\n0\n0\n").unwrap();
        let catalog = ZoneCatalog::new(2, 2);
        assert!(matches!(
            store.load(&catalog),
            Err(PersistError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn missing_file_is_empty_catalog() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_in(&dir);
        let catalog = ZoneCatalog::new(2, 2);
        let summary = store.load(&catalog).unwrap();
        assert_eq!(summary.loaded, 0);
        assert_eq!(catalog.count(), 0);
    }

    #[test]
    fn saver_writes_when_version_moves() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        let catalog = Arc::new(ZoneCatalog::new(2, 2));
        let mut saver = Saver::spawn(
            store.clone(),
            catalog.clone(),
            Box::new(|| 0),
            Duration::from_millis(1),
        );
        catalog.add("s", [-100, -100, 500, 100, 100, 900]).unwrap();
        let t0 = Instant::now();
        while !store.path().exists() && t0.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(50));
        }
        saver.stop();
        assert!(store.path().exists(), "saver never wrote the file");
        let restored = ZoneCatalog::new(2, 2);
        store.load(&restored).unwrap();
        assert_eq!(restored.count(), 1);
    }
}
