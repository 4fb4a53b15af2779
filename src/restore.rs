use crate::{
    blk,
    manifest::Manifest,
    paths::{LOCK_FILE, MANIFEST_FILE},
    session::Session,
};
use anyhow::{Context, Result};
use log::{info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub removed: Vec<PathBuf>,
    pub failures: Vec<String>,
    pub flag_warning: Option<String>,
}

impl Session {
    /// Wipes the game voice directory, empties the ledger and turns mod
    /// loading off.
    ///
    /// Everything in the directory goes, tracked or not. Listing and delete
    /// failures are collected; only a failed ledger write is an error.
    pub fn restore(&self) -> Result<RestoreReport> {
        let _lock = self.lock_ledger()?;
        let target = self.paths().target_dir();
        let mut report = RestoreReport::default();

        if target.is_dir() {
            clear_target(&target, &mut report);
        }

        self.save_manifest(&Manifest::default())
            .context("reset manifest")?;

        let config_path = self.paths().host_config_path();
        if config_path.exists() {
            if let Err(err) = blk::set_flag(&config_path, false) {
                warn!("disable mod loading failed: {err:#}");
                report.flag_warning = Some(format!("{err:#}"));
            }
        }

        info!(
            "game restored: {} entr(ies) removed, {} failure(s)",
            report.removed.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

/// Removes every entry of `target` except the ledger and its lock file.
fn clear_target(target: &Path, report: &mut RestoreReport) {
    let entries = match fs::read_dir(target) {
        Ok(entries) => entries,
        Err(err) => {
            warn!("read {} failed: {err}", target.display());
            report.failures.push(format!("{}: {err}", target.display()));
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!("skip unreadable entry in {}: {err}", target.display());
                report.failures.push(err.to_string());
                continue;
            }
        };
        let name = entry.file_name();
        if name == MANIFEST_FILE || name == LOCK_FILE {
            continue;
        }
        let path = entry.path();
        let is_dir = entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false);
        let result = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => report.removed.push(path),
            Err(err) => {
                warn!("delete {} failed: {err}", path.display());
                report.failures.push(format!("{}: {err}", path.display()));
            }
        }
    }
}
