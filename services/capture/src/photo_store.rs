//! Fixed-capacity ring buffer of frames on disk.
//!
//! Slot `i` lives at `<directory>/<i zero-padded>.png`. Writes go to a hidden
//! temporary file first and are renamed into place, so a reader polling the
//! directory never opens a half-written slot.

use crate::frame::Frame;
use image::ImageFormat;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

const SLOT_EXTENSION: &str = "png";
const MIN_NAME_WIDTH: usize = 3;

/// Errors that can occur in the photo store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store needs at least one slot")]
    NoSlots,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Ring buffer of persisted frames.
#[derive(Debug)]
pub struct PhotoStore {
    directory: PathBuf,
    max_photos: usize,
    name_width: usize,
    /// Write stamp of each slot holding a file, higher is newer
    written: Vec<Option<u64>>,
    /// Stamp the next write receives
    next_stamp: u64,
    /// Global index the next `push` writes to
    head: u64,
}

impl PhotoStore {
    /// Open a store, creating the directory and scanning existing slots.
    ///
    /// Numbering starts from 0 regardless of what is on disk.
    pub fn open(directory: impl Into<PathBuf>, max_photos: usize) -> Result<Self, StoreError> {
        if max_photos == 0 {
            return Err(StoreError::NoSlots);
        }
        let directory = directory.into();
        fs::create_dir_all(&directory).map_err(|e| StoreError::io(&directory, e))?;

        let mut store = Self {
            name_width: name_width(max_photos),
            written: vec![None; max_photos],
            next_stamp: 0,
            directory,
            max_photos,
            head: 0,
        };
        store.scan();

        info!(
            directory = %store.directory.display(),
            max_photos,
            existing = store.occupied_count(),
            "Photo store opened"
        );
        Ok(store)
    }

    /// Open a store and continue numbering after the most recently written slot.
    pub fn resume(directory: impl Into<PathBuf>, max_photos: usize) -> Result<Self, StoreError> {
        let mut store = Self::open(directory, max_photos)?;

        if let Some(slot) = store.newest_slot() {
            store.head = slot as u64 + 1;
            info!(slot, next = store.head, "Resuming photo numbering");
        }
        Ok(store)
    }

    /// Path of the slot that `index` maps to. The file may not exist.
    pub fn path_for(&self, index: u64) -> PathBuf {
        self.slot_path(self.slot_of(index))
    }

    /// Persist `frame` into slot `index mod max_photos`, overwriting it.
    pub fn save(&mut self, index: u64, frame: &Frame) -> Result<PathBuf, StoreError> {
        let slot = self.slot_of(index);
        let path = self.slot_path(slot);
        let staging = self
            .directory
            .join(format!(".{}.tmp", self.slot_name(slot)));

        frame
            .image()
            .save_with_format(&staging, ImageFormat::Png)
            .map_err(|source| {
                let _ = fs::remove_file(&staging);
                StoreError::Encode {
                    path: staging.clone(),
                    source,
                }
            })?;
        if let Err(e) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(StoreError::io(&path, e));
        }

        self.written[slot] = Some(self.next_stamp);
        self.next_stamp += 1;
        self.head = index.wrapping_add(1);

        debug!(index, slot, sequence = frame.sequence(), path = %path.display(), "Frame stored");
        Ok(path)
    }

    /// Persist `frame` at the next global index.
    pub fn push(&mut self, frame: &Frame) -> Result<PathBuf, StoreError> {
        self.save(self.head, frame)
    }

    /// Remove slot `index mod max_photos`; an empty slot is not an error.
    pub fn delete(&mut self, index: u64) -> Result<(), StoreError> {
        let slot = self.slot_of(index);
        let path = self.slot_path(slot);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
        self.written[slot] = None;
        Ok(())
    }

    /// Delete every slot.
    pub fn clear(&mut self) -> Result<(), StoreError> {
        for slot in 0..self.max_photos {
            self.delete(slot as u64)?;
        }
        Ok(())
    }

    /// Up to `n` most recently written paths, newest first.
    pub fn latest_paths(&self, n: usize) -> Vec<PathBuf> {
        let mut slots: Vec<(u64, usize)> = self
            .written
            .iter()
            .enumerate()
            .filter_map(|(slot, stamp)| stamp.map(|stamp| (stamp, slot)))
            .collect();
        slots.sort_unstable_by(|a, b| b.cmp(a));

        slots
            .into_iter()
            .take(n)
            .map(|(_, slot)| self.slot_path(slot))
            .collect()
    }

    pub fn latest_path(&self) -> Option<PathBuf> {
        self.latest_paths(1).into_iter().next()
    }

    /// Global index the next `push` writes to.
    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn max_photos(&self) -> usize {
        self.max_photos
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn occupied_count(&self) -> usize {
        self.written.iter().filter(|w| w.is_some()).count()
    }

    fn newest_slot(&self) -> Option<usize> {
        self.written
            .iter()
            .enumerate()
            .filter_map(|(slot, stamp)| stamp.map(|stamp| (stamp, slot)))
            .max()
            .map(|(_, slot)| slot)
    }

    /// Stamp slots already on disk in modification order, oldest first.
    fn scan(&mut self) {
        let mut existing: Vec<(Option<SystemTime>, usize)> = (0..self.max_photos)
            .filter(|&slot| self.slot_path(slot).is_file())
            .map(|slot| (modified(&self.slot_path(slot)), slot))
            .collect();
        existing.sort_unstable();

        for (stamp, (_, slot)) in existing.into_iter().enumerate() {
            self.written[slot] = Some(stamp as u64);
        }
        self.next_stamp = self.occupied_count() as u64;
    }

    fn slot_of(&self, index: u64) -> usize {
        (index % self.max_photos as u64) as usize
    }

    fn slot_name(&self, slot: usize) -> String {
        format!("{:0width$}.{}", slot, SLOT_EXTENSION, width = self.name_width)
    }

    fn slot_path(&self, slot: usize) -> PathBuf {
        self.directory.join(self.slot_name(slot))
    }
}

/// Read-only view of a store directory for consumers.
///
/// Shares nothing with the writer except the directory itself.
#[derive(Debug, Clone)]
pub struct SlotReader {
    directory: PathBuf,
}

impl SlotReader {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn newest_path(&self) -> Result<Option<PathBuf>, StoreError> {
        Self::newest(&self.directory)
    }

    /// Most recently modified slot file in `directory`, if any.
    pub fn newest(directory: &Path) -> Result<Option<PathBuf>, StoreError> {
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(directory, e)),
        };

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(directory, e))?;
            let path = entry.path();
            if !is_slot_name(&path) {
                continue;
            }
            // slots can be replaced between listing and stat
            let Some(mtime) = modified(&path) else {
                continue;
            };
            let newer = match &newest {
                None => true,
                Some((best, best_path)) => (mtime, &path) > (*best, best_path),
            };
            if newer {
                newest = Some((mtime, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }
}

fn name_width(max_photos: usize) -> usize {
    let digits = (max_photos - 1).max(1).to_string().len();
    digits.max(MIN_NAME_WIDTH)
}

fn is_slot_name(path: &Path) -> bool {
    let ext_ok = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(SLOT_EXTENSION));
    let stem_ok = path
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()));
    ext_ok && stem_ok
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
