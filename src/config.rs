use crate::paths::ModPaths;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

const CONFIG_FILE: &str = "config.json";
const LOG_FILE: &str = "voicesmith.log";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub game_path: PathBuf,
    #[serde(default)]
    pub current_mod: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        Self::load_or_create_in(&data_dir()?)
    }

    pub fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join(CONFIG_FILE);
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save_in(base_dir)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_in(&data_dir()?)
    }

    pub fn save_in(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(base_dir.join(CONFIG_FILE), raw).context("write app config")?;
        Ok(())
    }

    /// Paths for the engine, with the pending and library folders defaulting
    /// to `<base>/data/pending` and `<base>/data/voice`.
    pub fn mod_paths(&self, base_dir: &Path) -> ModPaths {
        let data = base_dir.join("data");
        ModPaths::new(
            self.game_path.clone(),
            self.pending_dir
                .clone()
                .unwrap_or_else(|| data.join("pending")),
            self.library_dir.clone().unwrap_or_else(|| data.join("voice")),
        )
    }
}

pub fn data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("voicesmith"))
}

pub fn log_path(base_dir: &Path) -> PathBuf {
    base_dir.join(LOG_FILE)
}
