use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::records::TargetPage;

const PREFIX: &str = "checkpoint_";
const SUFFIX: &str = ".json";

/// A checkpoint snapshot loaded from disk.
pub struct Checkpoint {
    pub count: usize,
    pub path: PathBuf,
    pub records: Vec<TargetPage>,
}

/// Directory of `checkpoint_<count>.json` snapshots. Each file holds every
/// record consumed up to `count` and is never rewritten.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, count: usize) -> PathBuf {
        self.dir.join(format!("{}{}{}", PREFIX, count, SUFFIX))
    }

    /// Write the full accumulated sequence as a new snapshot.
    pub fn write(&self, records: &[TargetPage]) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(records.len());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(records)?;
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to move checkpoint into {}", path.display()))?;
        info!("Saved checkpoint {} ({} records)", path.display(), records.len());
        Ok(path)
    }

    /// Existing snapshots as `(count, path)`, ordered by count.
    pub fn list(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read {}", self.dir.display()))?
        {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(count) = parse_count(name) {
                found.push((count, path));
            }
        }
        found.sort_by_key(|(count, _)| *count);
        Ok(found)
    }

    pub fn load(path: &Path) -> Result<Vec<TargetPage>> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("malformed checkpoint {}", path.display()))
    }

    /// The snapshot with the highest count, if any.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        let Some((count, path)) = self.list()?.pop() else {
            return Ok(None);
        };
        let records = Self::load(&path)?;
        anyhow::ensure!(
            records.len() == count,
            "{} holds {} records but is named for {}",
            path.display(),
            records.len(),
            count
        );
        Ok(Some(Checkpoint { count, path, records }))
    }

    /// Every snapshot concatenated in count order, one entry per URL.
    /// An entry keeps the position of its first sighting and the content of
    /// its last.
    pub fn load_merged(&self) -> Result<Vec<TargetPage>> {
        let mut merged: Vec<TargetPage> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (count, path) in self.list()? {
            let records = Self::load(&path)?;
            debug!("Merging checkpoint {} ({} records)", count, records.len());
            for record in records {
                match index.get(&record.url) {
                    Some(&i) => merged[i] = record,
                    None => {
                        index.insert(record.url.clone(), merged.len());
                        merged.push(record);
                    }
                }
            }
        }
        Ok(merged)
    }
}

fn parse_count(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .parse()
        .ok()
}
