//! Download checkpoints for interrupted-run resume.
//
// A checkpoint records which segments of which tracks have been fully spooled to disk, so that a
// restarted download only fetches what is missing. It is persisted as a small JSON sidecar next
// to the final output path, written atomically (tempfile + rename). A segment is only ever
// recorded after its file has been renamed into its final spool location, so a crash at any
// point leaves the checkpoint consistent with the spool directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use chrono::{DateTime, Utc};
use sanitise_file_name::sanitise;
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::{Result, VodlError};

#[derive(Debug, Serialize, Deserialize, Clone)]
struct CheckpointState {
    url: String,
    temp_dir: PathBuf,
    /// Completed segment indices per track identifier.
    completed: HashMap<String, Vec<i64>>,
    created_at: DateTime<Utc>,
}

/// Shared, mutex-guarded resume state. All mutation goes through `mark_done`; persistence reads
/// the state under the same lock.
#[derive(Debug)]
pub struct Checkpoint {
    state: Mutex<CheckpointState>,
}

/// The sidecar path for a given output file.
pub fn checkpoint_path(output_path: &Path) -> PathBuf {
    let mut os = output_path.as_os_str().to_os_string();
    os.push(".vodl.json");
    PathBuf::from(os)
}

/// On-disk name of a spooled segment: `<track-id>_<5-digit-index>.seg`, with the track
/// identifier sanitised for use in a file name.
pub(crate) fn segment_file_name(track_id: &str, index: i64) -> String {
    format!("{}_{:05}.seg", sanitise(track_id), index)
}

impl Checkpoint {
    pub fn new(url: &str, temp_dir: &Path) -> Checkpoint {
        Checkpoint {
            state: Mutex::new(CheckpointState {
                url: url.to_string(),
                temp_dir: temp_dir.to_path_buf(),
                completed: HashMap::new(),
                created_at: Utc::now(),
            }),
        }
    }

    /// Load a checkpoint from disk. A missing file is not an error and yields `None`.
    pub fn load(path: &Path) -> Result<Option<Checkpoint>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VodlError::Io(e, String::from("reading checkpoint"))),
        };
        let state: CheckpointState = serde_json::from_slice(&data)
            .map_err(|e| VodlError::Parsing(format!("checkpoint JSON: {e}")))?;
        Ok(Some(Checkpoint { state: Mutex::new(state) }))
    }

    /// Persist atomically: serialize to `<path>.tmp`, then rename over the final path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = {
            let state = self.state.lock().expect("checkpoint lock");
            serde_json::to_vec_pretty(&*state)
                .map_err(|e| VodlError::Parsing(format!("serializing checkpoint: {e}")))?
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| VodlError::Io(e, String::from("writing checkpoint")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| VodlError::Io(e, String::from("renaming checkpoint")))?;
        debug!("checkpoint saved to {}", path.display());
        Ok(())
    }

    pub fn mark_done(&self, track_id: &str, index: i64) {
        let mut state = self.state.lock().expect("checkpoint lock");
        let indices = state.completed.entry(track_id.to_string()).or_default();
        if !indices.contains(&index) {
            indices.push(index);
            indices.sort_unstable();
        }
    }

    pub fn is_done(&self, track_id: &str, index: i64) -> bool {
        let state = self.state.lock().expect("checkpoint lock");
        state
            .completed
            .get(track_id)
            .is_some_and(|indices| indices.binary_search(&index).is_ok())
    }

    pub fn completed_count(&self) -> usize {
        let state = self.state.lock().expect("checkpoint lock");
        state.completed.values().map(Vec::len).sum()
    }

    /// Whether this checkpoint pertains to the given manifest URL.
    pub fn matches(&self, url: &str) -> bool {
        self.state.lock().expect("checkpoint lock").url == url
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.state.lock().expect("checkpoint lock").temp_dir.clone()
    }

    /// Expected spool path for a segment of this download.
    pub fn segment_path(&self, track_id: &str, index: i64) -> PathBuf {
        self.temp_dir().join(segment_file_name(track_id, index))
    }

    /// Remove the checkpoint sidecar (after a fully successful download).
    pub fn delete(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VodlError::Io(e, String::from("removing checkpoint"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4.vodl.json");
        let cp = Checkpoint::new("https://example.com/master.m3u8", &dir.path().join("spool"));
        cp.mark_done("v1", 0);
        cp.mark_done("v1", 2);
        cp.mark_done("a_en", 0);
        cp.mark_done("v1", 2); // duplicate is ignored
        cp.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap().expect("checkpoint exists");
        assert!(loaded.matches("https://example.com/master.m3u8"));
        assert!(!loaded.matches("https://example.com/other.m3u8"));
        assert!(loaded.is_done("v1", 0));
        assert!(loaded.is_done("v1", 2));
        assert!(!loaded.is_done("v1", 1));
        assert!(loaded.is_done("a_en", 0));
        assert_eq!(loaded.completed_count(), 3);
        assert_eq!(loaded.temp_dir(), dir.path().join("spool"));
        // No stray temp file is left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(&dir.path().join("absent.json")).unwrap().is_none());
    }

    #[test]
    fn test_segment_file_name_format() {
        assert_eq!(segment_file_name("v1", 0), "v1_00000.seg");
        assert_eq!(segment_file_name("v1", 12345), "v1_12345.seg");
        // Track identifiers from playlists may contain separators unfit for file names.
        let name = segment_file_name("aud/en:main", 7);
        assert!(!name.contains('/') && !name.contains(':'), "unsanitised name {name}");
        assert!(name.ends_with("_00007.seg"));
    }

    #[test]
    fn test_checkpoint_path_appends_sidecar_suffix() {
        assert_eq!(
            checkpoint_path(Path::new("/tmp/movie.mp4")),
            PathBuf::from("/tmp/movie.mp4.vodl.json")
        );
    }
}
