use crate::battery::ModeResult;
use anyhow::{bail, Context};
use chrono::Utc;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Bumped whenever the persisted layout changes; older files fail fast at
/// load instead of propagating partial records into aggregation.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeEntry {
    pub mode: String,
    pub run_id: String,
    /// Unix timestamp in millis, UTC.
    pub recorded_at: i64,
    pub result: ModeResult,
}

/// The on-disk comparison document: one entry per tested mode, in test
/// order. Independent invocations (possibly on different machines feeding
/// the same file) accumulate into it via load-merge-save.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ComparisonStore {
    version: u32,
    entries: Vec<ModeEntry>,
}

impl Default for ComparisonStore {
    fn default() -> Self {
        ComparisonStore {
            version: STORE_VERSION,
            entries: Vec::new(),
        }
    }
}

impl ComparisonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the store from disk. A missing file is an empty comparison;
    /// malformed content or a schema version mismatch is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let contents = fs::read_to_string(path)
            .context(format!("unable to read comparison store {}", path.display()))?;
        let store = Self::try_from_str(&contents)
            .context(format!("comparison store {} is unusable", path.display()))?;
        Ok(store)
    }

    pub fn try_from_str(contents: &str) -> anyhow::Result<Self> {
        let store: Self =
            serde_json::from_str(contents).context("comparison store is malformed")?;
        if store.version != STORE_VERSION {
            bail!(
                "comparison store has schema version {} but this build expects {}",
                store.version,
                STORE_VERSION
            );
        }
        Ok(store)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("unable to create {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)
            .context(format!("unable to write comparison store {}", path.display()))
    }

    /// Last-writer-wins per mode key; a re-tested mode keeps its original
    /// position in the comparison order.
    pub fn insert(&mut self, entry: ModeEntry) {
        match self.entries.iter_mut().find(|e| e.mode == entry.mode) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, mode: &str) -> Option<&ModeEntry> {
        self.entries.iter().find(|e| e.mode == mode)
    }

    pub fn entries(&self) -> &[ModeEntry] {
        &self.entries
    }

    /// True once every expected mode has at least one saved result. Gates
    /// chart rendering: comparisons are never drawn from a partial set.
    pub fn is_complete(&self, expected: &[String]) -> bool {
        expected.iter().all(|mode| self.get(mode).is_some())
    }

    pub fn missing<'a>(&self, expected: &'a [String]) -> Vec<&'a str> {
        expected
            .iter()
            .filter(|mode| self.get(mode).is_none())
            .map(|mode| mode.as_str())
            .collect()
    }
}

/// The read-merge-write cycle used after each benchmarked mode: prior state
/// is preserved, this mode's entry is replaced or appended, and the union is
/// written back.
pub fn save_result(
    path: &Path,
    mode: &str,
    result: ModeResult,
) -> anyhow::Result<ComparisonStore> {
    let mut store = ComparisonStore::load(path)?;
    store.insert(ModeEntry {
        mode: mode.to_string(),
        run_id: nanoid!(5, &nanoid::alphabet::SAFE),
        recorded_at: Utc::now().timestamp_millis(),
        result,
    });
    store.save(path)?;
    Ok(store)
}
