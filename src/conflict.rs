use crate::manifest::Manifest;
use anyhow::{bail, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    path::{Component, Path, PathBuf},
};
use walkdir::WalkDir;

pub const BANK_EXTENSION: &str = "bank";

/// Localized name some front ends send for the top-level folder.
const ROOT_LABEL_LEGACY: &str = "根目录";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FolderSelection {
    Root,
    Named(String),
}

impl FolderSelection {
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed {
            "" | "." | "root" | ROOT_LABEL_LEGACY => FolderSelection::Root,
            other => FolderSelection::Named(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            FolderSelection::Root => "root",
            FolderSelection::Named(name) => name,
        }
    }

    fn source_dir(&self, mod_root: &Path) -> Result<PathBuf> {
        match self {
            FolderSelection::Root => Ok(mod_root.to_path_buf()),
            FolderSelection::Named(name) => {
                let rel = Path::new(name);
                let escapes = rel
                    .components()
                    .any(|component| !matches!(component, Component::Normal(_)));
                if escapes {
                    bail!("folder {name:?} leaves the mod directory");
                }
                Ok(mod_root.join(rel))
            }
        }
    }
}

pub fn parse_selection<S: AsRef<str>>(values: &[S]) -> Vec<FolderSelection> {
    let mut seen = HashSet::new();
    let mut selection = Vec::new();
    for value in values {
        let parsed = FolderSelection::parse(value.as_ref());
        if seen.insert(parsed.clone()) {
            selection.push(parsed);
        }
    }
    if selection.is_empty() {
        selection.push(FolderSelection::Root);
    }
    selection
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub file: String,
    pub existing_mod: String,
    pub new_mod: String,
}

/// Conflict query row as handed to front ends. `error` is set instead of a
/// real conflict when the ledger or the mod folder could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRow {
    pub file: String,
    pub existing_mod: String,
    pub new_mod: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Conflict> for ConflictRow {
    fn from(conflict: Conflict) -> Self {
        Self {
            file: conflict.file,
            existing_mod: conflict.existing_mod,
            new_mod: conflict.new_mod,
            error: None,
        }
    }
}

impl ConflictRow {
    pub fn failure(new_mod: &str, error: impl Into<String>) -> Self {
        Self {
            file: String::new(),
            existing_mod: String::new(),
            new_mod: new_mod.to_string(),
            error: Some(error.into()),
        }
    }
}

pub fn detect<S: AsRef<str>>(candidate_files: &[S], manifest: &Manifest, mod_id: &str) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for file in candidate_files {
        let file = file.as_ref();
        match manifest.owner_of(file) {
            Some(owner) if owner != mod_id => conflicts.push(Conflict {
                file: file.to_string(),
                existing_mod: owner.to_string(),
                new_mod: mod_id.to_string(),
            }),
            _ => {}
        }
    }
    if !conflicts.is_empty() {
        info!("{} file conflict(s) for {mod_id}", conflicts.len());
    }
    conflicts
}

#[derive(Debug, Clone)]
pub struct ModFile {
    pub source: PathBuf,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkIssue {
    MissingFolder { folder: String },
    Unreadable { path: PathBuf, error: String },
    DuplicateName { name: String, path: PathBuf },
}

impl fmt::Display for WalkIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkIssue::MissingFolder { folder } => write!(f, "folder {folder} not found"),
            WalkIssue::Unreadable { path, error } => {
                write!(f, "cannot read {}: {error}", path.display())
            }
            WalkIssue::DuplicateName { name, path } => {
                write!(f, "{name} already selected, skipped {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectedFiles {
    pub files: Vec<ModFile>,
    pub issues: Vec<WalkIssue>,
}

impl CollectedFiles {
    pub fn names(&self) -> Vec<String> {
        self.files.iter().map(|file| file.name.clone()).collect()
    }
}

pub fn is_installable(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(BANK_EXTENSION))
        .unwrap_or(false)
}

/// Walks the selected folders of a library mod and gathers its bank files.
///
/// Installed files land flat in the target directory, so only the first
/// file seen for a given name is kept.
pub fn collect_mod_files(mod_root: &Path, selection: &[FolderSelection]) -> CollectedFiles {
    let mut collected = CollectedFiles::default();
    let mut seen = HashSet::new();

    for folder in selection {
        let source_dir = match folder.source_dir(mod_root) {
            Ok(dir) => dir,
            Err(err) => {
                warn!("{err}");
                collected.issues.push(WalkIssue::Unreadable {
                    path: mod_root.join(folder.label()),
                    error: err.to_string(),
                });
                continue;
            }
        };
        if !source_dir.is_dir() {
            collected.issues.push(WalkIssue::MissingFolder {
                folder: folder.label().to_string(),
            });
            continue;
        }

        let mut entries: Vec<_> = Vec::new();
        for entry in WalkDir::new(&source_dir).follow_links(false).sort_by_file_name() {
            match entry {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    warn!("skip unreadable entry {}: {err}", path.display());
                    collected.issues.push(WalkIssue::Unreadable {
                        path,
                        error: err.to_string(),
                    });
                }
            }
        }

        for entry in entries {
            if !entry.file_type().is_file() || !is_installable(entry.path()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !seen.insert(name.clone()) {
                collected.issues.push(WalkIssue::DuplicateName {
                    name,
                    path: entry.path().to_path_buf(),
                });
                continue;
            }
            collected.files.push(ModFile {
                source: entry.path().to_path_buf(),
                name,
            });
        }
    }

    collected
}
