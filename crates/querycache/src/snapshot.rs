//! Persisting cached data across process restarts.
//!
//! The cache never schedules persistence itself. An external component periodically calls
//! [`Query::save_snapshot`](crate::Query::save_snapshot) and, on startup,
//! [`Query::load_snapshot`](crate::Query::load_snapshot) with a [`SnapshotStore`].

use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::time::Instant;

use crate::key::CacheKey;

/// The persisted form of one successful cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot<V, D> {
    pub key: CacheKey,
    pub variables: V,
    pub data: Arc<D>,
    /// When the data was fetched, in wall-clock time.
    pub data_updated_at: DateTime<Utc>,
}

/// Storage for entry snapshots.
pub trait SnapshotStore<V, D> {
    /// Replaces the stored snapshots with `entries`.
    fn save(&self, entries: &[EntrySnapshot<V, D>]) -> Result<()>;

    /// Loads all stored snapshots.
    fn load(&self) -> Result<Vec<EntrySnapshot<V, D>>>;
}

/// A [`SnapshotStore`] writing all entries into one JSON file.
///
/// Saving writes a temporary file next to the target first and moves it into place, so readers
/// never observe a partially written snapshot. Loading a file that does not exist yields no
/// entries.
#[derive(Debug)]
pub struct JsonFileStore<V, D> {
    path: PathBuf,
    _marker: PhantomData<fn() -> (V, D)>,
}

impl<V, D> JsonFileStore<V, D> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<V, D> SnapshotStore<V, D> for JsonFileStore<V, D>
where
    V: Serialize + DeserializeOwned,
    D: Serialize + DeserializeOwned,
{
    fn save(&self, entries: &[EntrySnapshot<V, D>]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).context("failed to create snapshot directory")?;

        let mut temp_file =
            NamedTempFile::new_in(dir).context("failed to create temporary snapshot file")?;
        {
            let mut writer = BufWriter::new(temp_file.as_file_mut());
            serde_json::to_writer(&mut writer, entries).context("failed to serialize snapshot")?;
            writer.flush().context("failed to write snapshot")?;
        }
        temp_file
            .persist(&self.path)
            .context("failed to persist snapshot")?;

        tracing::debug!(path = %self.path.display(), entries = entries.len(), "saved snapshot");
        Ok(())
    }

    fn load(&self) -> Result<Vec<EntrySnapshot<V, D>>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context("failed to open snapshot"),
        };
        serde_json::from_reader(BufReader::new(file)).context("failed to parse snapshot")
    }
}

/// Translates a monotonic timestamp into wall-clock time.
pub(crate) fn to_wall_clock(at: Instant) -> DateTime<Utc> {
    let age = Instant::now().saturating_duration_since(at);
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Translates wall-clock time into a monotonic timestamp.
///
/// Timestamps in the future are clamped to now. Returns `None` for timestamps that lie before
/// the earliest representable instant.
pub(crate) fn to_instant(at: DateTime<Utc>) -> Option<Instant> {
    let age = (Utc::now() - at).to_std().unwrap_or_default();
    Instant::now().checked_sub(age)
}
