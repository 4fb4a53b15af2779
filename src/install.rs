use crate::{
    blk,
    conflict::{self, FolderSelection, WalkIssue},
    manifest::{self, Takeover},
    session::{LockError, Session},
};
use filetime::{set_file_mtime, FileTime};
use log::{info, warn};
use serde::Serialize;
use std::{
    collections::HashSet,
    fs, io,
    path::Path,
    time::UNIX_EPOCH,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{0:?} is not a library folder name")]
    InvalidModId(String),
    #[error("mod {0} is not in the library")]
    ModNotFound(String),
    #[error("no files were installed for {mod_id}")]
    NoFilesInstalled {
        mod_id: String,
        outcomes: Vec<FileOutcome>,
        issues: Vec<WalkIssue>,
    },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("prepare game voice directory: {0:#}")]
    Target(anyhow::Error),
    #[error("ledger update failed: {0:#}")]
    Ledger(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Copied { name: String },
    Failed { name: String, error: String },
}

impl FileOutcome {
    pub fn name(&self) -> &str {
        match self {
            FileOutcome::Copied { name } | FileOutcome::Failed { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub mod_id: String,
    pub installed: Vec<String>,
    pub outcomes: Vec<FileOutcome>,
    pub issues: Vec<WalkIssue>,
    pub takeovers: Vec<Takeover>,
    pub removed_stale: Vec<String>,
    pub flag_warning: Option<String>,
}

impl InstallReport {
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, FileOutcome::Failed { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UninstallReport {
    pub mod_id: String,
    pub was_installed: bool,
    pub removed: Vec<String>,
    pub failures: Vec<FileOutcome>,
}

impl Session {
    /// Copies the selected bank files of a library mod into the game voice
    /// directory and records their ownership.
    ///
    /// Conflicts are not checked here; files owned by another mod are taken
    /// over and pruned from that mod's record.
    pub fn install(
        &self,
        mod_id: &str,
        selection: &[FolderSelection],
    ) -> Result<InstallReport, InstallError> {
        let mod_root = self
            .paths()
            .library_entry(mod_id)
            .map_err(|_| InstallError::InvalidModId(mod_id.to_string()))?;
        if !mod_root.is_dir() {
            return Err(InstallError::ModNotFound(mod_id.to_string()));
        }

        let _lock = self.lock_ledger()?;
        let target = self
            .paths()
            .ensure_target_dir()
            .map_err(InstallError::Target)?;
        let mut manifest = self.load_manifest().map_err(InstallError::Ledger)?;
        let collected = conflict::collect_mod_files(&mod_root, selection);

        let previous: Vec<String> = manifest.files_of(mod_id).to_vec();
        let released = manifest.release_stale_ownership(mod_id);
        if released > 0 {
            info!("released {released} file(s) from the previous install of {mod_id}");
        }

        let mut installed = Vec::new();
        let mut outcomes = Vec::with_capacity(collected.files.len());
        for file in &collected.files {
            let dest = target.join(&file.name);
            match copy_into_target(&file.source, &dest) {
                Ok(()) => {
                    installed.push(file.name.clone());
                    outcomes.push(FileOutcome::Copied {
                        name: file.name.clone(),
                    });
                }
                Err(err) => {
                    warn!("copy {} failed: {err}", file.source.display());
                    outcomes.push(FileOutcome::Failed {
                        name: file.name.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        if installed.is_empty() {
            return Err(InstallError::NoFilesInstalled {
                mod_id: mod_id.to_string(),
                outcomes,
                issues: collected.issues,
            });
        }

        let takeovers =
            manifest.record_installation(mod_id, installed.clone(), manifest::now_rfc3339());
        for takeover in &takeovers {
            info!(
                "{} now belongs to {mod_id} (was {})",
                takeover.file, takeover.previous_owner
            );
        }

        self.save_manifest(&manifest)
            .map_err(InstallError::Ledger)?;

        // Leftovers of the previous install that nobody claims any more.
        // Only touched once the ledger no longer lists them.
        let current: HashSet<&String> = installed.iter().collect();
        let mut removed_stale = Vec::new();
        for name in previous {
            if current.contains(&name) || manifest.owner_of(&name).is_some() {
                continue;
            }
            match remove_target_file(&target.join(&name)) {
                Ok(()) => removed_stale.push(name),
                Err(err) => warn!("remove stale file {name} failed: {err}"),
            }
        }

        let flag_warning = match blk::set_flag(&self.paths().host_config_path(), true) {
            Ok(()) => None,
            Err(err) => {
                warn!("enable mod loading failed: {err:#}");
                Some(format!("{err:#}"))
            }
        };

        info!("installed {mod_id}: {} file(s)", installed.len());
        Ok(InstallReport {
            mod_id: mod_id.to_string(),
            installed,
            outcomes,
            issues: collected.issues,
            takeovers,
            removed_stale,
            flag_warning,
        })
    }

    /// Removes the files the ledger still attributes to `mod_id` and drops
    /// its record. Files taken over by other mods stay in place.
    pub fn uninstall(&self, mod_id: &str) -> anyhow::Result<UninstallReport> {
        let _lock = self.lock_ledger()?;
        let mut manifest = self.load_manifest()?;
        let mut report = UninstallReport {
            mod_id: mod_id.to_string(),
            ..UninstallReport::default()
        };

        let owned: Vec<String> = manifest
            .files_of(mod_id)
            .iter()
            .filter(|name| manifest.owner_of(name) == Some(mod_id))
            .cloned()
            .collect();
        let Some(_record) = manifest.remove_mod_record(mod_id) else {
            info!("{mod_id} is not installed");
            return Ok(report);
        };
        report.was_installed = true;
        self.save_manifest(&manifest)?;

        let target = self.paths().target_dir();
        for name in owned {
            match remove_target_file(&target.join(&name)) {
                Ok(()) => report.removed.push(name),
                Err(err) => {
                    warn!("remove {name} failed: {err}");
                    report.failures.push(FileOutcome::Failed {
                        name,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!("uninstalled {mod_id}: {} file(s) removed", report.removed.len());
        Ok(report)
    }
}

fn copy_into_target(source: &Path, dest: &Path) -> io::Result<()> {
    if dest.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is a directory", dest.display()),
        ));
    }
    fs::copy(source, dest)?;
    preserve_mtime(source, dest);
    Ok(())
}

fn remove_target_file(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let Ok(duration) = modified.duration_since(UNIX_EPOCH) else {
        return;
    };
    let mtime = FileTime::from_unix_time(duration.as_secs() as i64, 0);
    let _ = set_file_mtime(dest, mtime);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::ModPaths;
    use pretty_assertions::assert_eq;

    fn setup() -> (tempfile::TempDir, Session) {
        let dir = tempfile::tempdir().unwrap();
        let game = dir.path().join("game");
        fs::create_dir_all(&game).unwrap();
        fs::write(game.join("config.blk"), "sound{\n  enable_mod:b=no\n}\n").unwrap();
        let session = Session::new(ModPaths::new(
            game,
            dir.path().join("pending"),
            dir.path().join("voice"),
        ));
        (dir, session)
    }

    fn add_mod(session: &Session, mod_id: &str, files: &[&str]) {
        let root = session.paths().mod_dir(mod_id);
        fs::create_dir_all(&root).unwrap();
        for file in files {
            fs::write(root.join(file), mod_id.as_bytes()).unwrap();
        }
    }

    #[test]
    fn install_copies_and_enables_flag() {
        let (_dir, session) = setup();
        add_mod(&session, "voice_en", &["a.bank", "b.bank", "notes.txt"]);

        let report = session.install("voice_en", &[FolderSelection::Root]).unwrap();
        assert_eq!(report.installed, vec!["a.bank".to_string(), "b.bank".to_string()]);
        assert_eq!(report.failed_count(), 0);
        assert!(report.flag_warning.is_none());

        let target = session.paths().target_dir();
        assert_eq!(fs::read(target.join("a.bank")).unwrap(), b"voice_en");
        assert!(!target.join("notes.txt").exists());
        assert_eq!(
            blk::read_flag(&session.paths().host_config_path()),
            Some(true)
        );
        assert!(!session.paths().lock_path().exists());
    }

    #[test]
    fn unknown_mod_is_rejected() {
        let (_dir, session) = setup();
        assert!(matches!(
            session.install("missing", &[FolderSelection::Root]),
            Err(InstallError::ModNotFound(_))
        ));
    }

    #[test]
    fn empty_selection_leaves_ledger_alone() {
        let (_dir, session) = setup();
        add_mod(&session, "voice_en", &["readme.txt"]);
        match session.install("voice_en", &[FolderSelection::Root]) {
            Err(InstallError::NoFilesInstalled { outcomes, .. }) => assert!(outcomes.is_empty()),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(session.load_manifest().unwrap().is_empty());
    }

    #[test]
    fn reinstall_with_smaller_set_removes_leftovers() {
        let (_dir, session) = setup();
        add_mod(&session, "voice_en", &["a.bank", "b.bank"]);
        session.install("voice_en", &[FolderSelection::Root]).unwrap();

        fs::remove_file(session.paths().mod_dir("voice_en").join("b.bank")).unwrap();
        let report = session.install("voice_en", &[FolderSelection::Root]).unwrap();
        assert_eq!(report.removed_stale, vec!["b.bank".to_string()]);

        let manifest = session.load_manifest().unwrap();
        assert_eq!(manifest.files_of("voice_en"), ["a.bank".to_string()]);
        assert_eq!(manifest.owner_of("b.bank"), None);
        assert!(!session.paths().target_dir().join("b.bank").exists());
    }

    #[test]
    fn ids_outside_the_library_are_refused() {
        let (dir, session) = setup();
        let outside = dir.path().join("elsewhere");
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("a.bank"), b"outside").unwrap();

        assert!(matches!(
            session.install("../elsewhere", &[FolderSelection::Root]),
            Err(InstallError::InvalidModId(_))
        ));
        assert!(!session.paths().target_dir().join("a.bank").exists());
        assert!(session.check_conflicts("../elsewhere", &[FolderSelection::Root]).is_err());
    }

    #[test]
    fn failed_ledger_write_keeps_leftovers_on_disk() {
        let (_dir, session) = setup();
        add_mod(&session, "voice_en", &["a.bank", "b.bank"]);
        session.install("voice_en", &[FolderSelection::Root]).unwrap();

        fs::remove_file(session.paths().mod_dir("voice_en").join("b.bank")).unwrap();
        // A directory in the way of the temp file makes the ledger write fail.
        let target = session.paths().target_dir();
        fs::create_dir_all(target.join(".manifest.json.tmp")).unwrap();

        assert!(matches!(
            session.install("voice_en", &[FolderSelection::Root]),
            Err(InstallError::Ledger(_))
        ));
        assert!(target.join("b.bank").is_file());
        let manifest = session.load_manifest().unwrap();
        assert_eq!(manifest.owner_of("b.bank"), Some("voice_en"));

        assert!(session.uninstall("voice_en").is_err());
        assert!(target.join("a.bank").is_file());
        assert!(target.join("b.bank").is_file());
    }

    #[test]
    fn uninstall_keeps_files_taken_over() {
        let (_dir, session) = setup();
        add_mod(&session, "voice_en", &["a.bank", "b.bank"]);
        add_mod(&session, "voice_ru", &["a.bank"]);
        session.install("voice_en", &[FolderSelection::Root]).unwrap();
        session.install("voice_ru", &[FolderSelection::Root]).unwrap();

        let report = session.uninstall("voice_en").unwrap();
        assert!(report.was_installed);
        assert_eq!(report.removed, vec!["b.bank".to_string()]);

        let target = session.paths().target_dir();
        assert_eq!(fs::read(target.join("a.bank")).unwrap(), b"voice_ru");
        let manifest = session.load_manifest().unwrap();
        assert!(manifest.violations().is_empty());
        assert_eq!(manifest.owner_of("a.bank"), Some("voice_ru"));

        let again = session.uninstall("voice_en").unwrap();
        assert!(!again.was_installed);
    }
}
