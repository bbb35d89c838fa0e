//! Durable JSON state files.
//!
//! Every save rotates a bounded chain of generational backups before replacing
//! the primary file atomically:
//!
//! ```text
//! ledger.json.bak4 -> ledger.json.bak5   (oldest dropped)
//! ...
//! ledger.json      -> ledger.json.bak1   (copy)
//! ledger.json.tmp  -> ledger.json        (fsync + rename)
//! ```
//!
//! Loading walks primary, `.bak1`, `.bak2`, ... and returns the first candidate
//! that parses, carries the required top-level keys and passes the caller's
//! validator.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::errors::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    Primary,
    Backup(usize),
}

#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    pub source: RecoverySource,
}

impl<T> Recovered<T> {
    pub fn from_backup(&self) -> bool {
        matches!(self.source, RecoverySource::Backup(_))
    }
}

/// One state file plus its backups. Saves through the same store are serialized.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    generations: usize,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, generations: usize) -> Self {
        Self {
            path: path.into(),
            generations,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        save_state(&self.path, value, self.generations)
    }

    /// Save on tokio's blocking pool and wait for the write to land.
    pub async fn save_off_thread<T>(self: &Arc<Self>, value: T) -> Result<(), StateError>
    where
        T: Serialize + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.save(&value)).await?
    }

    /// Save from synchronous code. On a multi-threaded runtime the worker hands
    /// its queued tasks to another thread for the duration of the write.
    pub fn save_blocking<T: Serialize>(&self, value: &T) -> Result<(), StateError> {
        match Handle::try_current().map(|h| h.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| self.save(value)),
            _ => self.save(value),
        }
    }

    pub fn load<T, F>(&self, required_keys: &[&str], validator: F) -> Result<Recovered<T>, StateError>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        load_state(&self.path, self.generations, required_keys, validator)
    }
}

pub fn backup_path(path: &Path, generation: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak{generation}"));
    PathBuf::from(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically replace `path` with `value`, keeping up to `generations` backups.
pub fn save_state<T: Serialize>(path: &Path, value: &T, generations: usize) -> Result<(), StateError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    }

    let json = serde_json::to_vec_pretty(value)?;

    if generations > 0 && path.exists() {
        rotate_backups(path, generations)?;
        let first = backup_path(path, 1);
        fs::copy(path, &first).map_err(|e| StateError::io(&first, e))?;
    }

    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| StateError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| StateError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StateError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StateError::io(path, e))?;

    debug!(path = %path.display(), bytes = json.len(), "State saved");
    Ok(())
}

/// Shift `.bak{i}` to `.bak{i+1}`, dropping the oldest generation.
fn rotate_backups(path: &Path, generations: usize) -> Result<(), StateError> {
    let oldest = backup_path(path, generations);
    if oldest.exists() {
        fs::remove_file(&oldest).map_err(|e| StateError::io(&oldest, e))?;
    }
    for i in (1..generations).rev() {
        let from = backup_path(path, i);
        if from.exists() {
            let to = backup_path(path, i + 1);
            fs::rename(&from, &to).map_err(|e| StateError::io(&to, e))?;
        }
    }
    Ok(())
}

/// Load the newest valid generation of `path`.
///
/// Returns `StateError::Missing` when neither the primary nor any backup exists,
/// and `StateError::NoValidState` when candidates exist but all of them fail.
pub fn load_state<T, F>(
    path: &Path,
    generations: usize,
    required_keys: &[&str],
    validator: F,
) -> Result<Recovered<T>, StateError>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let candidates = std::iter::once((RecoverySource::Primary, path.to_path_buf())).chain(
        (1..=generations).map(|i| (RecoverySource::Backup(i), backup_path(path, i))),
    );

    let mut tried = 0usize;
    for (source, candidate) in candidates {
        if !candidate.exists() {
            continue;
        }
        tried += 1;

        match read_candidate(&candidate, required_keys, &validator) {
            Ok(value) => {
                if let RecoverySource::Backup(generation) = source {
                    warn!(
                        path = %path.display(),
                        generation,
                        "Primary state unusable, recovered from backup"
                    );
                } else {
                    info!(path = %path.display(), "State loaded");
                }
                return Ok(Recovered { value, source });
            }
            Err(reason) => {
                warn!(candidate = %candidate.display(), %reason, "Rejected state candidate");
            }
        }
    }

    if tried == 0 {
        return Err(StateError::Missing(path.to_path_buf()));
    }

    error!(path = %path.display(), tried, "No valid state in primary or any backup");
    Err(StateError::NoValidState {
        path: path.to_path_buf(),
        tried,
    })
}

fn read_candidate<T, F>(path: &Path, required_keys: &[&str], validator: &F) -> Result<T, String>
where
    T: DeserializeOwned,
    F: Fn(&T) -> bool,
{
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let json: serde_json::Value = serde_json::from_str(&raw).map_err(|e| format!("parse: {e}"))?;

    let obj = json
        .as_object()
        .ok_or_else(|| "top level is not an object".to_string())?;
    if let Some(missing) = required_keys.iter().find(|k| !obj.contains_key(**k)) {
        return Err(format!("missing key {missing}"));
    }

    let value: T = serde_json::from_value(json).map_err(|e| format!("schema: {e}"))?;
    if !validator(&value) {
        return Err("validator rejected".into());
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn make_test_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "whalecopy_state_unit_{}_{}",
            std::process::id(),
            id
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        version: u32,
        cash: i64,
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = make_test_dir();
        let store = StateStore::new(dir.join("state.json"), 3);
        store.save(&Doc { version: 1, cash: 42 }).unwrap();

        let loaded: Recovered<Doc> = store.load(&["version"], |_| true).unwrap();
        assert_eq!(loaded.value, Doc { version: 1, cash: 42 });
        assert_eq!(loaded.source, RecoverySource::Primary);
        assert!(!tmp_path(store.path()).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_rotation_keeps_bounded_generations() {
        let dir = make_test_dir();
        let path = dir.join("state.json");
        for cash in 0..6 {
            save_state(&path, &Doc { version: 1, cash }, 2).unwrap();
        }
        let bak1: Doc = serde_json::from_str(&fs::read_to_string(backup_path(&path, 1)).unwrap()).unwrap();
        let bak2: Doc = serde_json::from_str(&fs::read_to_string(backup_path(&path, 2)).unwrap()).unwrap();
        assert_eq!(bak1.cash, 4);
        assert_eq!(bak2.cash, 3);
        assert!(!backup_path(&path, 3).exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saves_from_runtime_workers_land_in_order() {
        let dir = make_test_dir();
        let store = Arc::new(StateStore::new(dir.join("state.json"), 2));

        store.save_off_thread(Doc { version: 1, cash: 1 }).await.unwrap();
        store.save_blocking(&Doc { version: 1, cash: 2 }).unwrap();
        let handle = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.save_off_thread(Doc { version: 1, cash: 3 }).await })
        };
        handle.await.unwrap().unwrap();

        let loaded: Recovered<Doc> = store.load(&["version"], |_| true).unwrap();
        assert_eq!(loaded.value.cash, 3);
        let bak1: Doc = serde_json::from_str(&fs::read_to_string(backup_path(store.path(), 1)).unwrap()).unwrap();
        assert_eq!(bak1.cash, 2);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_save_blocking_on_current_thread_runtime() {
        let dir = make_test_dir();
        let store = StateStore::new(dir.join("state.json"), 1);
        store.save_blocking(&Doc { version: 1, cash: 9 }).unwrap();
        let loaded: Recovered<Doc> = store.load(&["version"], |_| true).unwrap();
        assert_eq!(loaded.value.cash, 9);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file() {
        let dir = make_test_dir();
        let err = load_state::<Doc, _>(&dir.join("nope.json"), 3, &[], |_| true).unwrap_err();
        assert!(matches!(err, StateError::Missing(_)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_required_key_and_validator() {
        let dir = make_test_dir();
        let path = dir.join("state.json");
        fs::write(&path, r#"{"cash": 1}"#).unwrap();
        fs::write(backup_path(&path, 1), r#"{"version": 1, "cash": -5}"#).unwrap();
        fs::write(backup_path(&path, 2), r#"{"version": 1, "cash": 7}"#).unwrap();

        let loaded: Recovered<Doc> = load_state(&path, 3, &["version"], |d: &Doc| d.cash >= 0).unwrap();
        assert_eq!(loaded.source, RecoverySource::Backup(2));
        assert_eq!(loaded.value.cash, 7);

        let _ = fs::remove_dir_all(&dir);
    }
}
