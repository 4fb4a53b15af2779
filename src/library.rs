use crate::{
    conflict::{is_installable, FolderSelection},
    paths,
};
use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs,
    path::Path,
    time::SystemTime,
};
use time::{macros::format_description, OffsetDateTime};
use walkdir::WalkDir;

const METADATA_FILES: &[&str] = &["mod.json", "info.json", "metadata.json", "modinfo.json"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderKind {
    Ground,
    Aircraft,
    Radio,
    Folder,
}

impl FolderKind {
    pub fn detect(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("ground") || lower.contains("tank") {
            FolderKind::Ground
        } else if lower.contains("air") {
            FolderKind::Aircraft
        } else if lower.contains("radio") {
            FolderKind::Radio
        } else {
            FolderKind::Folder
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FolderKind::Ground => "ground",
            FolderKind::Aircraft => "aircraft",
            FolderKind::Radio => "radio",
            FolderKind::Folder => "folder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModFolder {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FolderKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub tank: bool,
    pub air: bool,
    pub naval: bool,
    pub radio: bool,
    pub status: bool,
}

impl Capabilities {
    fn absorb(&mut self, text: &str) {
        let lower = text.to_ascii_lowercase();
        self.tank |= lower.contains("tank") || lower.contains("ground");
        self.air |= lower.contains("air");
        self.naval |= lower.contains("naval") || lower.contains("ship");
        self.radio |= lower.contains("radio");
        self.status |= lower.contains("status") || lower.contains("situation");
    }

    pub fn labels(&self) -> Vec<&'static str> {
        [
            (self.tank, "tank"),
            (self.air, "air"),
            (self.naval, "naval"),
            (self.radio, "radio"),
            (self.status, "status"),
        ]
        .into_iter()
        .filter_map(|(set, label)| set.then_some(label))
        .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    language: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LibraryMod {
    pub id: String,
    pub title: String,
    pub author: Option<String>,
    pub version: Option<String>,
    pub note: Option<String>,
    pub language: Vec<String>,
    pub size: u64,
    pub size_label: String,
    pub folders: Vec<ModFolder>,
    pub capabilities: Capabilities,
    pub date: Option<String>,
}

impl LibraryMod {
    pub fn is_installable(&self) -> bool {
        !self.folders.is_empty()
    }
}

/// Lists every mod folder in the library, sorted by id.
pub fn scan_library(library_dir: &Path) -> Result<Vec<LibraryMod>> {
    if !library_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut mods = Vec::new();
    for entry in
        fs::read_dir(library_dir).with_context(|| format!("read {}", library_dir.display()))?
    {
        let entry = entry.context("read library entry")?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        if id.starts_with('.') {
            continue;
        }
        mods.push(describe_mod(&id, &path));
    }
    mods.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(mods)
}

pub fn describe_mod(id: &str, mod_root: &Path) -> LibraryMod {
    let meta = read_metadata(mod_root);
    let size = dir_size(mod_root);
    LibraryMod {
        id: id.to_string(),
        title: non_empty(meta.title).unwrap_or_else(|| id.to_string()),
        author: non_empty(meta.author),
        version: meta.version.and_then(value_to_string),
        note: non_empty(meta.note),
        language: languages(meta.language),
        size,
        size_label: format_size(size),
        folders: mod_folders(mod_root),
        capabilities: detect_capabilities(mod_root),
        date: modified_date(mod_root),
    }
}

fn read_metadata(mod_root: &Path) -> RawMetadata {
    for name in METADATA_FILES {
        let path = mod_root.join(name);
        if !path.is_file() {
            continue;
        }
        let parsed = fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<RawMetadata>(&raw).map_err(Into::into));
        match parsed {
            Ok(meta) => return meta,
            Err(err) => warn!("skip unreadable metadata {}: {err}", path.display()),
        }
    }
    RawMetadata::default()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn value_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(text) => non_empty(Some(text)),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn languages(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::String(text)) => non_empty(Some(text)).into_iter().collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => non_empty(Some(text)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn holds_bank_files(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.path().is_file() && is_installable(&entry.path()))
        })
        .unwrap_or(false)
}

/// Installable folders: the root first when it holds bank files, then every
/// direct subfolder that does.
pub fn mod_folders(mod_root: &Path) -> Vec<ModFolder> {
    let mut folders = Vec::new();
    if holds_bank_files(mod_root) {
        folders.push(ModFolder {
            path: FolderSelection::Root.label().to_string(),
            kind: FolderKind::Folder,
        });
    }

    let Ok(entries) = fs::read_dir(mod_root) else {
        return folders;
    };
    let mut subdirs: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    subdirs.sort();
    for name in subdirs {
        if holds_bank_files(&mod_root.join(&name)) {
            folders.push(ModFolder {
                kind: FolderKind::detect(&name),
                path: name,
            });
        }
    }
    folders
}

pub fn detect_capabilities(mod_root: &Path) -> Capabilities {
    let mut caps = Capabilities::default();
    for entry in WalkDir::new(mod_root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
    {
        if let Ok(rel) = entry.path().strip_prefix(mod_root) {
            caps.absorb(&rel.to_string_lossy());
        }
    }
    caps
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

fn modified_date(path: &Path) -> Option<String> {
    let modified: SystemTime = fs::metadata(path).ok()?.modified().ok()?;
    OffsetDateTime::from(modified)
        .format(format_description!("[year]-[month]-[day]"))
        .ok()
}

/// Binary-unit size label, e.g. `512 B` or `1.5 KB`.
pub fn format_size(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {prefix}B", bytes as f64 / div as f64)
}

/// Deletes a mod folder from the library.
pub fn delete_mod(library_dir: &Path, mod_id: &str) -> Result<()> {
    if !paths::is_mod_id(mod_id) {
        bail!("refusing to delete {mod_id:?}: not a library entry");
    }

    let target = library_dir.join(mod_id);
    if !target.is_dir() {
        bail!("mod {mod_id} is not in the library");
    }
    let root = library_dir
        .canonicalize()
        .with_context(|| format!("resolve {}", library_dir.display()))?;
    let resolved = target
        .canonicalize()
        .with_context(|| format!("resolve {}", target.display()))?;
    if resolved == root || !resolved.starts_with(&root) {
        bail!("refusing to delete {mod_id:?}: resolves outside the library");
    }

    fs::remove_dir_all(&resolved).with_context(|| format!("delete {}", resolved.display()))?;
    info!("deleted {mod_id} from the library");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn format_size_uses_binary_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn scan_reads_metadata_and_folders() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("voice_en");
        fs::create_dir_all(root.join("tank_crew")).unwrap();
        fs::create_dir_all(root.join("aircraft")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("a.bank"), b"aaaa").unwrap();
        fs::write(root.join("tank_crew").join("t.bank"), b"tt").unwrap();
        fs::write(root.join("aircraft").join("p.BANK"), b"p").unwrap();
        fs::write(root.join("docs").join("readme.txt"), b"r").unwrap();
        fs::write(
            root.join("info.json"),
            r#"{"title": "English Crew", "author": "sam", "version": 2, "language": ["en", "de"]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("stray.zip"), b"").unwrap();

        let mods = scan_library(dir.path()).unwrap();
        assert_eq!(mods.len(), 1);
        let entry = &mods[0];
        assert_eq!(entry.id, "voice_en");
        assert_eq!(entry.title, "English Crew");
        assert_eq!(entry.author.as_deref(), Some("sam"));
        assert_eq!(entry.version.as_deref(), Some("2"));
        assert_eq!(entry.language, vec!["en".to_string(), "de".to_string()]);
        assert_eq!(
            entry.folders,
            vec![
                ModFolder {
                    path: "root".to_string(),
                    kind: FolderKind::Folder
                },
                ModFolder {
                    path: "aircraft".to_string(),
                    kind: FolderKind::Aircraft
                },
                ModFolder {
                    path: "tank_crew".to_string(),
                    kind: FolderKind::Ground
                },
            ]
        );
        assert_eq!(entry.capabilities.labels(), vec!["tank", "air"]);
        assert!(entry.size > 0);
        assert!(entry.date.is_some());
    }

    #[test]
    fn broken_metadata_falls_back_to_next_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("voice_ru");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("mod.json"), b"{ not json").unwrap();
        fs::write(root.join("metadata.json"), r#"{"title": "  ", "note": "beta"}"#).unwrap();

        let entry = describe_mod("voice_ru", &root);
        assert_eq!(entry.title, "voice_ru");
        assert_eq!(entry.note.as_deref(), Some("beta"));
        assert!(entry.folders.is_empty());
        assert!(!entry.is_installable());
    }

    #[test]
    fn delete_refuses_paths_outside_library() {
        let dir = tempfile::tempdir().unwrap();
        let library = dir.path().join("voice");
        fs::create_dir_all(library.join("voice_en")).unwrap();
        fs::create_dir_all(dir.path().join("outside")).unwrap();

        assert!(delete_mod(&library, "../outside").is_err());
        assert!(delete_mod(&library, "").is_err());
        assert!(delete_mod(&library, ".").is_err());
        assert!(delete_mod(&library, "missing").is_err());
        assert!(dir.path().join("outside").exists());

        delete_mod(&library, "voice_en").unwrap();
        assert!(!library.join("voice_en").exists());
        assert!(library.exists());
    }
}
