use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    fmt, fs,
    path::Path,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Ownership ledger for the game voice directory.
///
/// `installed_mods` maps a library mod id to the files it placed; `file_map`
/// maps each installed file name back to the mod that currently owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub installed_mods: BTreeMap<String, ModInstallRecord>,
    #[serde(default)]
    pub file_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModInstallRecord {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub install_time: String,
}

/// A file that changed hands while recording an installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Takeover {
    pub file: String,
    pub previous_owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A mod lists a file that `file_map` attributes elsewhere (or nowhere).
    UnmappedFile {
        mod_id: String,
        file: String,
        owner: Option<String>,
    },
    SharedFile { file: String, mods: Vec<String> },
    DanglingOwner { file: String, owner: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::UnmappedFile {
                mod_id,
                file,
                owner: Some(owner),
            } => write!(f, "{mod_id} lists {file} but the file map says {owner}"),
            Violation::UnmappedFile {
                mod_id,
                file,
                owner: None,
            } => write!(f, "{mod_id} lists {file} but the file map has no owner"),
            Violation::SharedFile { file, mods } => {
                write!(f, "{file} is listed by several mods: {}", mods.join(", "))
            }
            Violation::DanglingOwner { file, owner } => {
                write!(f, "{file} is owned by {owner}, which is not installed")
            }
        }
    }
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.installed_mods.is_empty() && self.file_map.is_empty()
    }

    pub fn owner_of(&self, file: &str) -> Option<&str> {
        self.file_map.get(file).map(String::as_str)
    }

    pub fn files_of(&self, mod_id: &str) -> &[String] {
        self.installed_mods
            .get(mod_id)
            .map(|record| record.files.as_slice())
            .unwrap_or(&[])
    }

    /// Drops `file_map` entries left over from an earlier install of `mod_id`.
    /// Names that already moved to another mod are kept.
    pub fn release_stale_ownership(&mut self, mod_id: &str) -> usize {
        let Some(record) = self.installed_mods.get(mod_id) else {
            return 0;
        };
        let mut released = 0;
        for file in &record.files {
            if self.file_map.get(file).map(String::as_str) == Some(mod_id) {
                self.file_map.remove(file);
                released += 1;
            }
        }
        released
    }

    /// Stores the record for `mod_id` and claims every file in `files`.
    ///
    /// Files previously owned by another mod are pruned from that mod's
    /// record; a record left without files is removed.
    pub fn record_installation(
        &mut self,
        mod_id: &str,
        files: Vec<String>,
        install_time: String,
    ) -> Vec<Takeover> {
        let mut takeovers = Vec::new();
        for file in &files {
            let previous = self.file_map.insert(file.clone(), mod_id.to_string());
            if let Some(previous_owner) = previous.filter(|owner| owner != mod_id) {
                takeovers.push(Takeover {
                    file: file.clone(),
                    previous_owner,
                });
            }
        }

        let mut emptied = BTreeSet::new();
        for takeover in &takeovers {
            if let Some(record) = self.installed_mods.get_mut(&takeover.previous_owner) {
                record.files.retain(|name| name != &takeover.file);
                if record.files.is_empty() {
                    emptied.insert(takeover.previous_owner.clone());
                }
            }
        }
        for owner in emptied {
            info!("{owner} no longer owns any installed file; dropping its record");
            self.installed_mods.remove(&owner);
        }

        self.installed_mods.insert(
            mod_id.to_string(),
            ModInstallRecord {
                files,
                install_time,
            },
        );
        takeovers
    }

    /// Removes the record of `mod_id`, keeping `file_map` entries that point
    /// at another mod.
    pub fn remove_mod_record(&mut self, mod_id: &str) -> Option<ModInstallRecord> {
        let record = self.installed_mods.remove(mod_id)?;
        for file in &record.files {
            if self.file_map.get(file).map(String::as_str) == Some(mod_id) {
                self.file_map.remove(file);
            }
        }
        Some(record)
    }

    pub fn violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut listed_by: BTreeMap<&str, Vec<String>> = BTreeMap::new();

        for (mod_id, record) in &self.installed_mods {
            for file in &record.files {
                listed_by.entry(file.as_str()).or_default().push(mod_id.clone());
                let owner = self.file_map.get(file);
                if owner != Some(mod_id) {
                    violations.push(Violation::UnmappedFile {
                        mod_id: mod_id.clone(),
                        file: file.clone(),
                        owner: owner.cloned(),
                    });
                }
            }
        }

        for (file, mut mods) in listed_by {
            mods.dedup();
            if mods.len() > 1 {
                violations.push(Violation::SharedFile {
                    file: file.to_string(),
                    mods,
                });
            }
        }

        for (file, owner) in &self.file_map {
            if !self.installed_mods.contains_key(owner) {
                violations.push(Violation::DanglingOwner {
                    file: file.clone(),
                    owner: owner.clone(),
                });
            }
        }

        violations
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Loads the ledger at `path`, creating an empty one when the file is absent.
///
/// An unreadable or malformed ledger is replaced in memory by an empty one;
/// the broken file stays on disk until the next save.
pub fn load(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        debug!("manifest not found at {}, creating an empty one", path.display());
        let manifest = Manifest::default();
        save(path, &manifest)?;
        return Ok(manifest);
    }

    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!("read manifest {} failed: {err}; using an empty ledger", path.display());
            return Ok(Manifest::default());
        }
    };
    match serde_json::from_str::<Manifest>(&raw) {
        Ok(manifest) => {
            debug!(
                "manifest loaded: {} mods, {} files",
                manifest.installed_mods.len(),
                manifest.file_map.len()
            );
            Ok(manifest)
        }
        Err(err) => {
            warn!("parse manifest {} failed: {err}; using an empty ledger", path.display());
            Ok(Manifest::default())
        }
    }
}

pub fn save(path: &Path, manifest: &Manifest) -> Result<()> {
    let parent = path.parent().context("manifest parent")?;
    fs::create_dir_all(parent).context("create manifest dir")?;
    let raw = serde_json::to_string_pretty(manifest).context("serialize manifest")?;

    let file_name = path.file_name().context("manifest file name")?;
    let mut temp_name = OsString::from(file_name);
    temp_name.push(".tmp");
    let temp = parent.join(temp_name);
    fs::write(&temp, raw).context("write manifest temp")?;
    if fs::rename(&temp, path).is_err() {
        // Some platforms refuse to rename over an existing file.
        let _ = fs::remove_file(path);
        if let Err(err) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(err).context("finalize manifest");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn load_creates_empty_ledger_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sound").join("mod").join(".manifest.json");

        let manifest = load(&path).unwrap();
        assert!(manifest.is_empty());
        let raw = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"installed_mods": {}, "file_map": {}})
        );
    }

    #[test]
    fn round_trip_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".manifest.json");
        let mut manifest = Manifest::default();
        manifest.record_installation("voice_en", files(&["a.bank", "b.bank"]), now_rfc3339());
        manifest.record_installation("voice_de", files(&["c.bank"]), now_rfc3339());

        save(&path, &manifest).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(loaded, manifest);
        assert!(!dir.path().join(".manifest.json.tmp").exists());
    }

    #[test]
    fn malformed_ledger_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".manifest.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load(&path).unwrap().is_empty());

        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn missing_keys_default_to_empty_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".manifest.json");
        fs::write(&path, r#"{"file_map": {"a.bank": "voice_en"}}"#).unwrap();
        let manifest = load(&path).unwrap();
        assert!(manifest.installed_mods.is_empty());
        assert_eq!(manifest.owner_of("a.bank"), Some("voice_en"));
    }

    #[test]
    fn install_time_is_rfc3339() {
        let stamp = now_rfc3339();
        assert!(OffsetDateTime::parse(&stamp, &Rfc3339).is_ok());
    }

    #[test]
    fn takeover_prunes_losing_record() {
        let mut manifest = Manifest::default();
        manifest.record_installation("voice_en", files(&["a.bank", "b.bank"]), now_rfc3339());
        let takeovers =
            manifest.record_installation("voice_ru", files(&["a.bank"]), now_rfc3339());

        assert_eq!(
            takeovers,
            vec![Takeover {
                file: "a.bank".to_string(),
                previous_owner: "voice_en".to_string(),
            }]
        );
        assert_eq!(manifest.files_of("voice_en"), ["b.bank".to_string()]);
        assert_eq!(manifest.owner_of("a.bank"), Some("voice_ru"));
        assert!(manifest.violations().is_empty());
    }

    #[test]
    fn losing_record_without_files_is_dropped() {
        let mut manifest = Manifest::default();
        manifest.record_installation("voice_en", files(&["a.bank"]), now_rfc3339());
        manifest.record_installation("voice_ru", files(&["a.bank"]), now_rfc3339());
        assert!(!manifest.installed_mods.contains_key("voice_en"));
        assert!(manifest.violations().is_empty());
    }

    #[test]
    fn stale_release_skips_names_owned_elsewhere() {
        let mut manifest = Manifest::default();
        manifest
            .installed_mods
            .insert("voice_en".to_string(), ModInstallRecord {
                files: files(&["a.bank", "b.bank"]),
                install_time: String::new(),
            });
        manifest.file_map.insert("a.bank".to_string(), "voice_en".to_string());
        manifest.file_map.insert("b.bank".to_string(), "voice_ru".to_string());

        assert_eq!(manifest.release_stale_ownership("voice_en"), 1);
        assert_eq!(manifest.owner_of("a.bank"), None);
        assert_eq!(manifest.owner_of("b.bank"), Some("voice_ru"));
        assert_eq!(manifest.release_stale_ownership("missing"), 0);
    }

    #[test]
    fn remove_record_keeps_foreign_entries() {
        let mut manifest = Manifest::default();
        manifest.record_installation("voice_en", files(&["a.bank"]), now_rfc3339());
        manifest.record_installation("voice_ru", files(&["b.bank"]), now_rfc3339());
        manifest
            .installed_mods
            .get_mut("voice_en")
            .unwrap()
            .files
            .push("b.bank".to_string());

        let removed = manifest.remove_mod_record("voice_en").unwrap();
        assert_eq!(removed.files, files(&["a.bank", "b.bank"]));
        assert_eq!(manifest.owner_of("a.bank"), None);
        assert_eq!(manifest.owner_of("b.bank"), Some("voice_ru"));
        assert!(manifest.remove_mod_record("voice_en").is_none());
    }

    #[test]
    fn violations_report_each_broken_invariant() {
        let mut manifest = Manifest::default();
        manifest
            .installed_mods
            .insert("voice_en".to_string(), ModInstallRecord {
                files: files(&["a.bank"]),
                install_time: String::new(),
            });
        manifest
            .installed_mods
            .insert("voice_ru".to_string(), ModInstallRecord {
                files: files(&["a.bank"]),
                install_time: String::new(),
            });
        manifest.file_map.insert("a.bank".to_string(), "voice_ru".to_string());
        manifest.file_map.insert("z.bank".to_string(), "ghost".to_string());

        let violations = manifest.violations();
        assert_eq!(violations.len(), 3);
        assert!(violations.contains(&Violation::DanglingOwner {
            file: "z.bank".to_string(),
            owner: "ghost".to_string(),
        }));
        assert!(violations.contains(&Violation::SharedFile {
            file: "a.bank".to_string(),
            mods: vec!["voice_en".to_string(), "voice_ru".to_string()],
        }));
    }
}
