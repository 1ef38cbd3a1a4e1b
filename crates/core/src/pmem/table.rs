//! Region table - name → region metadata, persisted as `regions.json`
//!
//! The table is rewritten whole on every change: serialised to a temporary
//! file, synced, renamed over the old table, and the directory synced.

use super::region::RegionId;
use crate::error::{RegionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

pub const TABLE_FILE: &str = "regions.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEntry {
    pub id: RegionId,
    pub name: String,
    /// File name of the region, relative to the table's directory
    pub file: String,
    pub size: u64,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionTable {
    next_id: RegionId,
    regions: BTreeMap<String, RegionEntry>,
}

impl Default for RegionTable {
    fn default() -> Self {
        Self {
            next_id: 1,
            regions: BTreeMap::new(),
        }
    }
}

impl RegionTable {
    /// Load the table from `dir`, or start an empty one if there is none
    pub fn load_or_init(dir: &Path) -> Result<Self> {
        let path = dir.join(TABLE_FILE);
        if !path.exists() {
            debug!("No region table at {}, starting empty", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(|e| {
            RegionError::Table(format!("cannot parse {}: {}", path.display(), e)).into()
        })
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| RegionError::Table(format!("cannot serialise table: {}", e)))?;
        let tmp = dir.join(format!("{}.tmp", TABLE_FILE));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(TABLE_FILE))?;
        File::open(dir)?.sync_all()?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RegionEntry> {
        self.regions.get(name)
    }

    pub fn by_id(&self, id: RegionId) -> Option<&RegionEntry> {
        self.regions.values().find(|e| e.id == id)
    }

    /// Reserve an id and build the entry for a new region
    pub fn allocate_entry(&mut self, name: &str, size: u64) -> RegionEntry {
        let id = self.next_id;
        self.next_id += 1;
        RegionEntry {
            id,
            name: name.to_string(),
            file: format!("region-{}.pm", id),
            size,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn insert(&mut self, entry: RegionEntry) {
        self.regions.insert(entry.name.clone(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<RegionEntry> {
        self.regions.remove(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegionEntry> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl RegionEntry {
    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.file)
    }
}
