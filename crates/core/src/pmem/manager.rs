//! Region Manager - create, open, close and remove named regions
//!
//! All table mutation and open/close transitions happen under one coarse
//! lock; they are rare. Open regions are tracked by weak reference, so a
//! region whose last handle is dropped without `close_region` is left
//! exactly as a crash would leave it: not clean, recovered on next open.

use super::allocator::Heap;
use super::barrier::persist;
use super::failpoint::FailPoint;
use super::layout::{
    CLEAN_OFFSET, Geometry, HEADER_SIZE, RegionHeader, SESSION_OFFSET,
};
use super::mapping::Mapping;
use super::recovery::{self, log_has_entries};
use super::region::{Region, RegionId};
use super::table::{RegionEntry, RegionTable};
use crate::config::RuntimeConfig;
use crate::error::{RegionError, Result};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{info, warn};
use uuid::Uuid;

/// Table metadata of one region, as listed by [`RegionManager::list_regions`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub id: RegionId,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub uuid: Uuid,
    pub open: bool,
}

/// Header contents of a region file, read without opening the region
#[derive(Debug, Clone)]
pub struct HeaderSummary {
    pub info: RegionInfo,
    pub geometry: Geometry,
    pub clean: bool,
    pub session: u64,
    pub root: u64,
}

struct ManagerState {
    table: RegionTable,
    open: HashMap<RegionId, Weak<Region>>,
}

impl ManagerState {
    /// The live handle of a region, if it is open and usable
    fn live(&self, id: RegionId) -> Option<Arc<Region>> {
        self.open
            .get(&id)
            .and_then(Weak::upgrade)
            .filter(|r| !r.is_closed() && !r.is_crashed())
    }
}

pub struct RegionManager {
    config: RuntimeConfig,
    state: Mutex<ManagerState>,
}

impl RegionManager {
    /// Open the region directory named by `config`, creating it if needed
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;
        let table = RegionTable::load_or_init(&config.dir)?;
        info!(
            "Region manager at {} with {} region(s), flush mode {}",
            config.dir.display(),
            table.len(),
            config.flush_mode
        );
        Ok(Self {
            config,
            state: Mutex::new(ManagerState {
                table,
                open: HashMap::new(),
            }),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a region of `size` bytes and return it open
    pub fn create_region(&self, name: &str, size: u64) -> Result<Arc<Region>> {
        let mut state = self.state.lock();
        self.create_locked(&mut state, name, size)
    }

    /// Open a region, running recovery if it was not closed cleanly
    pub fn open_region(&self, name: &str) -> Result<Arc<Region>> {
        let mut state = self.state.lock();
        self.open_locked(&mut state, name, None)
    }

    /// Open a region with a failpoint armed before recovery runs, to
    /// simulate a crash in the middle of recovery
    pub fn open_region_with_failpoint(&self, name: &str, point: FailPoint) -> Result<Arc<Region>> {
        let mut state = self.state.lock();
        self.open_locked(&mut state, name, Some(point))
    }

    /// Open `name` if it exists, otherwise create it. The flag is true when
    /// the region was created.
    pub fn find_or_create_region(&self, name: &str, size: u64) -> Result<(Arc<Region>, bool)> {
        let mut state = self.state.lock();
        if state.table.get(name).is_some() {
            Ok((self.open_locked(&mut state, name, None)?, false))
        } else {
            Ok((self.create_locked(&mut state, name, size)?, true))
        }
    }

    fn create_locked(&self, state: &mut ManagerState, name: &str, size: u64) -> Result<Arc<Region>> {
        if name.is_empty() {
            return Err(RegionError::Table("region name must not be empty".into()).into());
        }
        if state.table.get(name).is_some() {
            return Err(RegionError::AlreadyExists(name.to_string()).into());
        }
        let geometry = Geometry::compute(size, self.config.log_lanes, self.config.lane_size)?;

        let entry = state.table.allocate_entry(name, size);
        let path = entry.path(&self.config.dir);
        if path.exists() {
            warn!(
                "Removing orphaned region file {} not listed in the table",
                path.display()
            );
            fs::remove_file(&path)?;
        }

        let mapping = Mapping::create(&path, size)?;
        let header = RegionHeader::new(&geometry, *entry.uuid.as_bytes());
        mapping.write(0, header.as_bytes());
        Heap::format(&mapping, &geometry, self.config.flush_mode)?;
        mapping.header().session.store(1, Ordering::Release);
        persist(&mapping, self.config.flush_mode, 0, HEADER_SIZE)?;

        state.table.insert(entry.clone());
        if let Err(e) = state.table.save(&self.config.dir) {
            state.table.remove(name);
            drop(mapping);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        let region = Arc::new(Region::new(
            entry.id,
            entry.name.clone(),
            path,
            mapping,
            geometry,
            self.config.flush_mode,
            1,
        ));
        state.open.insert(entry.id, Arc::downgrade(&region));
        info!(
            "Created region {} (id {}): {} bytes, heap {} bytes at {:#x}, {} lanes of {} bytes",
            name,
            entry.id,
            size,
            geometry.heap_size,
            geometry.heap_offset,
            geometry.lane_count,
            geometry.lane_size
        );
        Ok(region)
    }

    fn open_locked(
        &self,
        state: &mut ManagerState,
        name: &str,
        failpoint: Option<FailPoint>,
    ) -> Result<Arc<Region>> {
        let entry = state
            .table
            .get(name)
            .cloned()
            .ok_or_else(|| RegionError::NotFound(name.to_string()))?;
        if state.live(entry.id).is_some() {
            return Err(RegionError::AlreadyOpen(name.to_string()).into());
        }

        let path = entry.path(&self.config.dir);
        let mapping = match Mapping::open(&path) {
            Ok(mapping) => mapping,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RegionError::NotFound(name.to_string()).into());
            }
            Err(e) => return Err(e.into()),
        };
        let geometry = validate_header(&mapping, &entry)?;

        let header = mapping.header();
        let was_clean = header.clean.load(Ordering::Acquire) == 1;
        let session = header.session.load(Ordering::Acquire) + 1;
        header.session.store(session, Ordering::Release);
        persist(&mapping, self.config.flush_mode, SESSION_OFFSET, 8)?;

        // the region keeps the flush mode it is opened with, not its creator's
        let region = Region::new(
            entry.id,
            entry.name.clone(),
            path,
            mapping,
            geometry,
            self.config.flush_mode,
            session,
        );
        if let Some(point) = failpoint {
            region.arm_failpoint(point);
        }

        let needs_recovery = if !was_clean {
            true
        } else if log_has_entries(&region) {
            warn!(
                "Region {} was closed cleanly but its log is not empty, recovering",
                name
            );
            true
        } else {
            !region.heap.meta_is_valid(&region.mapping)
        };

        if needs_recovery {
            let report = recovery::recover(&region)?;
            region.set_last_recovery(report);
        }

        region.mapping.header().clean.store(0, Ordering::Release);
        persist(&region.mapping, region.mode, CLEAN_OFFSET, 8)?;

        let region = Arc::new(region);
        state.open.insert(entry.id, Arc::downgrade(&region));
        info!(
            "Opened region {} (id {}), session {}, {}",
            name,
            entry.id,
            session,
            if was_clean { "clean" } else { "recovered" }
        );
        Ok(region)
    }

    /// Close a region cleanly so the next open skips recovery
    pub fn close_region(&self, id: RegionId) -> Result<()> {
        let mut state = self.state.lock();
        let region = state
            .open
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(RegionError::NotOpen(id))?;

        if region.is_crashed() {
            state.open.remove(&id);
            warn!(
                "Region {} crashed; closing without marking it clean",
                region.name()
            );
            return Ok(());
        }

        region.begin_close()?;
        region.mapping.flush_all()?;
        region.mapping.header().clean.store(1, Ordering::Release);
        persist(&region.mapping, region.mode, CLEAN_OFFSET, 8)?;
        state.open.remove(&id);

        let stats = region.stats();
        info!(
            "Closed region {} (id {}): {} committed, {} aborted",
            region.name(),
            id,
            stats.transactions_committed,
            stats.transactions_aborted
        );
        Ok(())
    }

    /// Delete a closed region and its backing file
    pub fn remove_region(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .table
            .get(name)
            .cloned()
            .ok_or_else(|| RegionError::NotFound(name.to_string()))?;
        if state.live(entry.id).is_some() {
            return Err(RegionError::AlreadyOpen(name.to_string()).into());
        }

        // the table forgets the region before its file goes away
        state.table.remove(name);
        if let Err(e) = state.table.save(&self.config.dir) {
            state.table.insert(entry);
            return Err(e);
        }
        state.open.remove(&entry.id);

        let path = entry.path(&self.config.dir);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Region file of {} was already gone", name);
            }
            Err(e) => {
                warn!(
                    "Region {} removed from the table, {} left behind: {}",
                    name,
                    path.display(),
                    e
                );
                return Err(e.into());
            }
        }
        info!("Removed region {} (id {})", name, entry.id);
        Ok(())
    }

    pub fn list_regions(&self) -> Vec<RegionInfo> {
        let state = self.state.lock();
        state
            .table
            .entries()
            .map(|entry| self.info(&state, entry))
            .collect()
    }

    pub fn is_open(&self, name: &str) -> bool {
        let state = self.state.lock();
        state
            .table
            .get(name)
            .is_some_and(|entry| state.live(entry.id).is_some())
    }

    /// The open handle of region `id`, if any
    pub fn region(&self, id: RegionId) -> Option<Arc<Region>> {
        self.state.lock().live(id)
    }

    /// Read a region's header without opening it
    pub fn inspect_region(&self, name: &str) -> Result<HeaderSummary> {
        let state = self.state.lock();
        let entry = state
            .table
            .get(name)
            .ok_or_else(|| RegionError::NotFound(name.to_string()))?;
        let mapping = Mapping::open(&entry.path(&self.config.dir))?;
        let geometry = validate_header(&mapping, entry)?;
        let header = mapping.header();
        Ok(HeaderSummary {
            info: self.info(&state, entry),
            geometry,
            clean: header.clean.load(Ordering::Acquire) == 1,
            session: header.session.load(Ordering::Acquire),
            root: header.root.load(Ordering::Acquire),
        })
    }

    fn info(&self, state: &ManagerState, entry: &RegionEntry) -> RegionInfo {
        RegionInfo {
            id: entry.id,
            name: entry.name.clone(),
            path: entry.path(&self.config.dir),
            size: entry.size,
            uuid: entry.uuid,
            open: state.live(entry.id).is_some(),
        }
    }
}

fn validate_header(mapping: &Mapping, entry: &RegionEntry) -> Result<Geometry> {
    let corrupt = |reason: String| RegionError::CorruptHeader {
        name: entry.name.clone(),
        reason,
    };
    if mapping.len() < HEADER_SIZE {
        return Err(corrupt(format!("file is only {} bytes", mapping.len())).into());
    }
    let header = mapping.header();
    let geometry = header.validate(mapping.len() as u64).map_err(corrupt)?;
    if header.uuid != *entry.uuid.as_bytes() {
        return Err(corrupt("uuid does not match the region table".into()).into());
    }
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::{TempDir, tempdir};

    fn setup() -> Result<(TempDir, RegionManager)> {
        let dir = tempdir()?;
        let manager = RegionManager::new(RuntimeConfig {
            log_lanes: 4,
            lane_size: 4096,
            ..RuntimeConfig::with_dir(dir.path())
        })?;
        Ok((dir, manager))
    }

    #[test]
    fn test_create_open_close() -> Result<()> {
        let (_dir, manager) = setup()?;
        let region = manager.create_region("R", 1 << 20)?;
        let id = region.id();
        assert!(manager.is_open("R"));
        assert!(matches!(
            manager.open_region("R"),
            Err(Error::Region(RegionError::AlreadyOpen(_)))
        ));

        manager.close_region(id)?;
        assert!(region.is_closed());
        assert!(region.begin().is_err());
        assert!(!manager.is_open("R"));
        drop(region);

        let region = manager.open_region("R")?;
        assert_eq!(region.session(), 2);
        assert!(region.stats().last_recovery.is_none());
        Ok(())
    }

    #[test]
    fn test_create_errors() -> Result<()> {
        let (_dir, manager) = setup()?;
        manager.create_region("R", 1 << 20)?;
        assert!(matches!(
            manager.create_region("R", 1 << 20),
            Err(Error::Region(RegionError::AlreadyExists(_)))
        ));
        assert!(matches!(
            manager.create_region("S", 0),
            Err(Error::Region(RegionError::InvalidSize(0)))
        ));
        assert!(matches!(
            manager.create_region("S", (1 << 20) + 1),
            Err(Error::Region(RegionError::InvalidSize(_)))
        ));
        assert!(matches!(
            manager.open_region("missing"),
            Err(Error::Region(RegionError::NotFound(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_close_busy() -> Result<()> {
        let (_dir, manager) = setup()?;
        let region = manager.create_region("R", 1 << 20)?;
        let txn = region.begin()?;
        assert!(matches!(
            manager.close_region(region.id()),
            Err(Error::Region(RegionError::Busy { active: 1, .. }))
        ));
        drop(txn);
        manager.close_region(region.id())?;
        assert!(matches!(
            manager.close_region(region.id()),
            Err(Error::Region(RegionError::NotOpen(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_remove() -> Result<()> {
        let (_dir, manager) = setup()?;
        let region = manager.create_region("R", 1 << 20)?;
        let path = region.path().to_path_buf();
        assert!(matches!(
            manager.remove_region("R"),
            Err(Error::Region(RegionError::AlreadyOpen(_)))
        ));
        manager.close_region(region.id())?;
        manager.remove_region("R")?;
        assert!(!path.exists());
        assert!(manager.list_regions().is_empty());
        assert!(matches!(
            manager.remove_region("R"),
            Err(Error::Region(RegionError::NotFound(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_remove_keeps_region_when_table_save_fails() -> Result<()> {
        let (dir, manager) = setup()?;
        let region = manager.create_region("R", 1 << 20)?;
        let path = region.path().to_path_buf();
        manager.close_region(region.id())?;
        drop(region);

        // the table cannot be replaced while its temp path is a directory
        let tmp = dir.path().join(format!("{}.tmp", crate::pmem::table::TABLE_FILE));
        fs::create_dir(&tmp)?;
        assert!(manager.remove_region("R").is_err());
        assert!(path.exists());
        assert_eq!(manager.list_regions().len(), 1);

        fs::remove_dir(&tmp)?;
        manager.remove_region("R")?;
        assert!(!path.exists());
        assert!(manager.list_regions().is_empty());
        Ok(())
    }

    #[test]
    fn test_table_survives_manager_restart() -> Result<()> {
        let dir = tempdir()?;
        let config = RuntimeConfig::with_dir(dir.path());
        {
            let manager = RegionManager::new(config.clone())?;
            let region = manager.create_region("persisted", 1 << 20)?;
            manager.close_region(region.id())?;
        }
        let manager = RegionManager::new(config)?;
        let list = manager.list_regions();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "persisted");
        assert!(!list[0].open);
        let region = manager.open_region("persisted")?;
        assert_eq!(region.size(), 1 << 20);
        Ok(())
    }

    #[test]
    fn test_find_or_create() -> Result<()> {
        let (_dir, manager) = setup()?;
        let (region, created) = manager.find_or_create_region("F", 1 << 20)?;
        assert!(created);
        manager.close_region(region.id())?;
        drop(region);
        let (_region, created) = manager.find_or_create_region("F", 1 << 20)?;
        assert!(!created);
        Ok(())
    }

    #[test]
    fn test_corrupt_header() -> Result<()> {
        let (_dir, manager) = setup()?;
        let region = manager.create_region("C", 1 << 20)?;
        manager.close_region(region.id())?;
        let path = region.path().to_path_buf();
        drop(region);

        let mut bytes = fs::read(&path)?;
        bytes[0] ^= 0xFF;
        fs::write(&path, &bytes)?;
        assert!(matches!(
            manager.open_region("C"),
            Err(Error::Region(RegionError::CorruptHeader { .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_inspect() -> Result<()> {
        let (_dir, manager) = setup()?;
        let region = manager.create_region("I", 1 << 20)?;
        manager.close_region(region.id())?;
        let summary = manager.inspect_region("I")?;
        assert!(summary.clean);
        assert_eq!(summary.session, 1);
        assert_eq!(summary.geometry, region.geometry());
        Ok(())
    }
}
