use crate::{
    blk,
    conflict::{self, Conflict, ConflictRow, FolderSelection},
    manifest::{self, Manifest, Violation},
    paths::ModPaths,
};
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::Serialize;
use std::{
    fs, io,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
    thread,
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;

const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(50);
const STALE_LOCK: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another operation holds the ledger lock {}", .path.display())]
    Busy { path: PathBuf },
    #[error("create ledger lock {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything an engine operation needs: resolved paths and the guard that
/// serializes ledger read-modify-write cycles.
#[derive(Debug)]
pub struct Session {
    paths: ModPaths,
    guard: Mutex<()>,
}

/// Held for the duration of a load -> mutate -> persist cycle.
///
/// Combines an in-process mutex with an exclusive lock file next to the
/// manifest, so other processes working on the same game are kept out too.
pub struct LedgerLock<'a> {
    _guard: MutexGuard<'a, ()>,
    path: PathBuf,
}

impl Drop for LedgerLock<'_> {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub game_root: PathBuf,
    pub target_dir: PathBuf,
    pub manifest: Manifest,
    pub flag_enabled: Option<bool>,
    pub violations: Vec<String>,
}

impl Session {
    pub fn new(paths: ModPaths) -> Self {
        Self {
            paths,
            guard: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &ModPaths {
        &self.paths
    }

    pub fn lock_ledger(&self) -> Result<LedgerLock<'_>, LockError> {
        let guard = self
            .guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = self.paths.lock_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => {
                    return Ok(LedgerLock {
                        _guard: guard,
                        path,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!("removing stale ledger lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed() >= LOCK_TIMEOUT {
                        return Err(LockError::Busy { path });
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }
        }
    }

    /// Loads the ledger, creating the target directory and an empty ledger
    /// on first access.
    pub fn load_manifest(&self) -> Result<Manifest> {
        self.paths.ensure_target_dir()?;
        manifest::load(&self.paths.manifest_path())
    }

    pub fn save_manifest(&self, manifest: &Manifest) -> Result<()> {
        manifest::save(&self.paths.manifest_path(), manifest).context("save manifest")
    }

    pub fn check_conflicts(
        &self,
        mod_id: &str,
        selection: &[FolderSelection],
    ) -> Result<Vec<Conflict>> {
        let mod_root = self.paths.library_entry(mod_id)?;
        let manifest = self.load_manifest().context("load manifest")?;
        let collected = conflict::collect_mod_files(&mod_root, selection);
        debug!(
            "{} candidate file(s) for {mod_id} from {}",
            collected.files.len(),
            mod_root.display()
        );
        Ok(conflict::detect(&collected.names(), &manifest, mod_id))
    }

    /// Same as [`Session::check_conflicts`], flattened into the row shape
    /// front ends consume.
    pub fn conflict_rows(&self, mod_id: &str, selection: &[FolderSelection]) -> Vec<ConflictRow> {
        match self.check_conflicts(mod_id, selection) {
            Ok(conflicts) => conflicts.into_iter().map(ConflictRow::from).collect(),
            Err(err) => vec![ConflictRow::failure(mod_id, format!("{err:#}"))],
        }
    }

    pub fn status(&self) -> Result<StatusReport> {
        let manifest = self.load_manifest()?;
        let violations = manifest
            .violations()
            .iter()
            .map(Violation::to_string)
            .collect();
        Ok(StatusReport {
            game_root: self.paths.game_root.clone(),
            target_dir: self.paths.target_dir(),
            flag_enabled: blk::read_flag(&self.paths.host_config_path()),
            manifest,
            violations,
        })
    }
}

fn lock_is_stale(path: &std::path::Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age >= STALE_LOCK)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ModPaths;

    fn session_in(dir: &std::path::Path) -> Session {
        Session::new(ModPaths::new(
            dir.join("game"),
            dir.join("pending"),
            dir.join("voice"),
        ))
    }

    #[test]
    fn lock_file_lives_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let lock_path = session.paths().lock_path();
        {
            let _lock = session.lock_ledger().unwrap();
            assert!(lock_path.exists());
        }
        assert!(!lock_path.exists());
        let _again = session.lock_ledger().unwrap();
    }

    #[test]
    fn foreign_lock_file_reports_busy() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let lock_path = session.paths().lock_path();
        fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        fs::write(&lock_path, b"").unwrap();

        let attempt = session.lock_ledger();
        match attempt {
            Err(LockError::Busy { path }) => assert_eq!(path, lock_path),
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("lock should be busy"),
        }
    }

    #[test]
    fn conflict_rows_carry_errors() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        // A file where the game directory should be makes the target unusable.
        fs::write(dir.path().join("game"), b"").unwrap();
        let rows = session.conflict_rows("voice_en", &[FolderSelection::Root]);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].error.is_some());
        assert_eq!(rows[0].new_mod, "voice_en");
    }

    #[test]
    fn status_creates_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());
        let status = session.status().unwrap();
        assert!(status.manifest.is_empty());
        assert!(status.violations.is_empty());
        assert_eq!(status.flag_enabled, None);
        assert!(session.paths().manifest_path().exists());
    }
}
