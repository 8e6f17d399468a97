//! On-disk archive for accepted camera frames.
//!
//! Frames are written as `<root>/<YYYY-MM-DD>/<HH>-00-00/<n>.jpg`, where
//! `n` counts up per hour bucket. The last number of each bucket is kept
//! in `<root>/counters.json` so numbering survives restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

const COUNTERS_FILE: &str = "counters.json";

/// Errors produced by the image store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Image count of one hour bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourCounts {
    pub images: usize,
}

/// Image counts of one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateCounts {
    pub hour_dirs: usize,
    pub images: usize,
    pub hours: BTreeMap<String, HourCounts>,
}

/// Summary of everything saved under the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedCounts {
    pub total_dirs: usize,
    pub total_images: usize,
    pub by_date: BTreeMap<String, DateCounts>,
    /// Keyed by `"<date>/<hour>"`.
    pub by_hour: BTreeMap<String, HourCounts>,
}

/// The most recently numbered image in the newest bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSaved {
    pub path: String,
    pub filename: String,
    pub number: u64,
    pub date: String,
    pub hour: String,
    pub size: u64,
}

#[derive(Default)]
struct StoreState {
    /// Bucket key (`date/hour`) to last used number.
    counters: BTreeMap<String, u64>,
    current_bucket: Option<String>,
}

/// Hour-bucketed JPEG writer. Disabled stores ignore `save`.
pub struct ImageStore {
    root: PathBuf,
    enabled: bool,
    state: Mutex<StoreState>,
}

impl ImageStore {
    /// Opens (and creates) the archive rooted at `root`.
    ///
    /// A missing or malformed counters file starts with empty counters.
    pub fn open(root: impl Into<PathBuf>, enabled: bool) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(io_err(&root))?;

        let counters = load_counters(&root.join(COUNTERS_FILE));
        tracing::info!(
            root = %root.display(),
            buckets = counters.len(),
            enabled,
            "image store opened"
        );

        Ok(Self {
            root,
            enabled,
            state: Mutex::new(StoreState {
                counters,
                current_bucket: None,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Saves `data` in the bucket for the current local hour.
    ///
    /// Returns `Ok(None)` when the store is disabled or `data` is empty.
    pub fn save(&self, data: &[u8]) -> Result<Option<PathBuf>, StoreError> {
        self.save_at(data, Local::now().naive_local())
    }

    /// Saves `data` in the bucket for `at`.
    pub fn save_at(&self, data: &[u8], at: NaiveDateTime) -> Result<Option<PathBuf>, StoreError> {
        if !self.is_enabled() || data.is_empty() {
            return Ok(None);
        }

        let date = at.format("%Y-%m-%d").to_string();
        let hour = at.format("%H-00-00").to_string();
        let dir = self.root.join(&date).join(&hour);
        let key = format!("{date}/{hour}");

        let number = {
            let mut state = self.lock();
            if state.current_bucket.as_deref() != Some(key.as_str()) {
                std::fs::create_dir_all(&dir).map_err(io_err(&dir))?;
                tracing::info!(dir = %dir.display(), "saving images to new bucket");
                state.current_bucket = Some(key.clone());
            }

            let next = match state.counters.get(&key) {
                Some(n) => n + 1,
                None => highest_number(&dir) + 1,
            };
            state.counters.insert(key, next);
            self.write_counters(&state.counters)?;
            next
        };

        let path = dir.join(format!("{number}.jpg"));
        std::fs::write(&path, data).map_err(io_err(&path))?;
        tracing::debug!(path = %path.display(), size = data.len(), "image saved");
        Ok(Some(path))
    }

    /// Counts saved images per day and per hour bucket.
    ///
    /// Days without any images are left out.
    pub fn saved_counts(&self) -> SavedCounts {
        let mut counts = SavedCounts::default();

        for (date, date_dir) in subdirs(&self.root) {
            let mut day = DateCounts::default();
            for (hour, hour_dir) in subdirs(&date_dir) {
                let images = jpegs(&hour_dir).len();
                day.hours.insert(hour, HourCounts { images });
                day.hour_dirs += 1;
                day.images += images;
            }

            if day.images == 0 {
                continue;
            }
            counts.total_dirs += day.hour_dirs;
            counts.total_images += day.images;
            for (hour, hour_counts) in &day.hours {
                counts
                    .by_hour
                    .insert(format!("{date}/{hour}"), hour_counts.clone());
            }
            counts.by_date.insert(date, day);
        }
        counts
    }

    /// Finds the highest-numbered image in the newest non-empty bucket.
    pub fn last_saved(&self) -> Option<LastSaved> {
        for (date, date_dir) in subdirs(&self.root).into_iter().rev() {
            for (hour, hour_dir) in subdirs(&date_dir).into_iter().rev() {
                let newest = jpegs(&hour_dir)
                    .into_iter()
                    .max_by_key(|p| stem_number(p).map_or(-1, |n| n as i128));
                let Some(path) = newest else {
                    continue;
                };

                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                return Some(LastSaved {
                    filename: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    number: stem_number(&path).unwrap_or(0),
                    path: path.to_string_lossy().into_owned(),
                    date,
                    hour,
                    size,
                });
            }
        }
        None
    }

    /// Number of images saved under today's local date.
    pub fn today_count(&self) -> usize {
        let today = Local::now().format("%Y-%m-%d").to_string();
        self.count_for_date(&today)
    }

    fn count_for_date(&self, date: &str) -> usize {
        subdirs(&self.root.join(date))
            .iter()
            .map(|(_, dir)| jpegs(dir).len())
            .sum()
    }

    fn write_counters(&self, counters: &BTreeMap<String, u64>) -> Result<(), StoreError> {
        let path = self.root.join(COUNTERS_FILE);
        let json = serde_json::to_string_pretty(counters)?;
        std::fs::write(&path, json).map_err(io_err(&path))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_counters(path: &Path) -> BTreeMap<String, u64> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str(&content) {
        Ok(counters) => counters,
        Err(e) => {
            tracing::error!(path = %path.display(), "ignoring malformed counters file: {e}");
            BTreeMap::new()
        }
    }
}

/// Subdirectories of `dir` as `(name, path)`, sorted by name.
fn subdirs(dir: &Path) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect();
    dirs.sort();
    dirs
}

/// `*.jpg` files directly inside `dir`.
fn jpegs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jpg"))
        .collect()
}

fn stem_number(path: &Path) -> Option<u64> {
    path.file_stem()?.to_str()?.parse().ok()
}

/// Highest numeric `*.jpg` stem in `dir`, or 0.
fn highest_number(dir: &Path) -> u64 {
    jpegs(dir)
        .iter()
        .filter_map(|p| stem_number(p))
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, 17, 42)
            .unwrap()
    }

    #[test]
    fn saves_sequentially_per_hour_bucket() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::open(tmp.path(), true).unwrap();

        let first = store.save_at(b"one", at(5, 14)).unwrap().unwrap();
        let second = store.save_at(b"two", at(5, 14)).unwrap().unwrap();
        let other = store.save_at(b"three", at(5, 15)).unwrap().unwrap();

        assert_eq!(first, tmp.path().join("2024-03-05/14-00-00/1.jpg"));
        assert_eq!(second, tmp.path().join("2024-03-05/14-00-00/2.jpg"));
        assert_eq!(other, tmp.path().join("2024-03-05/15-00-00/1.jpg"));
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
    }

    #[test]
    fn disabled_or_empty_is_a_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::open(tmp.path(), false).unwrap();
        assert!(!store.is_enabled());
        assert!(store.save_at(b"data", at(5, 14)).unwrap().is_none());

        let store = ImageStore::open(tmp.path(), true).unwrap();
        assert!(store.save_at(b"", at(5, 14)).unwrap().is_none());
        assert!(!tmp.path().join("2024-03-05").exists());
    }

    #[test]
    fn numbering_seeds_from_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let bucket = tmp.path().join("2024-03-05/14-00-00");
        std::fs::create_dir_all(&bucket).unwrap();
        std::fs::write(bucket.join("7.jpg"), b"x").unwrap();
        std::fs::write(bucket.join("3.jpg"), b"x").unwrap();
        std::fs::write(bucket.join("cover.jpg"), b"x").unwrap();

        let store = ImageStore::open(tmp.path(), true).unwrap();
        let path = store.save_at(b"new", at(5, 14)).unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), "8.jpg");
    }

    #[test]
    fn counters_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = ImageStore::open(tmp.path(), true).unwrap();
            store.save_at(b"a", at(5, 14)).unwrap();
            store.save_at(b"b", at(5, 14)).unwrap();
        }
        // Files removed by hand do not reset numbering.
        std::fs::remove_dir_all(tmp.path().join("2024-03-05")).unwrap();

        let store = ImageStore::open(tmp.path(), true).unwrap();
        let path = store.save_at(b"c", at(5, 14)).unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), "3.jpg");

        let raw = std::fs::read_to_string(tmp.path().join(COUNTERS_FILE)).unwrap();
        let counters: BTreeMap<String, u64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(counters["2024-03-05/14-00-00"], 3);
    }

    #[test]
    fn malformed_counters_file_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(COUNTERS_FILE), "{not json").unwrap();

        let store = ImageStore::open(tmp.path(), true).unwrap();
        let path = store.save_at(b"a", at(5, 14)).unwrap().unwrap();
        assert_eq!(path.file_name().unwrap(), "1.jpg");
    }

    #[test]
    fn counts_and_last_saved() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::open(tmp.path(), true).unwrap();
        store.save_at(b"a", at(4, 9)).unwrap();
        store.save_at(b"b", at(5, 14)).unwrap();
        store.save_at(b"c", at(5, 14)).unwrap();
        store.save_at(b"dddd", at(5, 15)).unwrap();
        std::fs::create_dir_all(tmp.path().join("2024-03-06/00-00-00")).unwrap();

        let counts = store.saved_counts();
        assert_eq!(counts.total_images, 4);
        assert_eq!(counts.total_dirs, 3);
        assert_eq!(counts.by_date.len(), 2);
        assert!(!counts.by_date.contains_key("2024-03-06"));
        assert_eq!(counts.by_date["2024-03-05"].hour_dirs, 2);
        assert_eq!(counts.by_date["2024-03-05"].images, 3);
        assert_eq!(counts.by_hour["2024-03-05/14-00-00"].images, 2);

        let last = store.last_saved().unwrap();
        assert_eq!(last.date, "2024-03-05");
        assert_eq!(last.hour, "15-00-00");
        assert_eq!(last.filename, "1.jpg");
        assert_eq!(last.number, 1);
        assert_eq!(last.size, 4);
    }

    #[test]
    fn last_saved_prefers_highest_number() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::open(tmp.path(), true).unwrap();
        for _ in 0..11 {
            store.save_at(b"x", at(5, 14)).unwrap();
        }
        // "11" sorts before "2" as text; the numeric order must win.
        assert_eq!(store.last_saved().unwrap().number, 11);
    }

    #[test]
    fn empty_store_reports_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::open(tmp.path(), true).unwrap();
        assert!(store.last_saved().is_none());
        assert_eq!(store.saved_counts(), SavedCounts::default());
        assert_eq!(store.today_count(), 0);
    }

    #[test]
    fn today_count_sees_fresh_saves() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ImageStore::open(tmp.path(), true).unwrap();
        let path = store.save(b"now").unwrap().unwrap();
        let date = path
            .parent()
            .and_then(Path::parent)
            .and_then(Path::file_name)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert_eq!(store.count_for_date(&date), 1);
    }
}
