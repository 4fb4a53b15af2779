use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Component, Path, PathBuf},
};

pub const GAME_NAME: &str = "War Thunder";
pub const HOST_CONFIG_FILE: &str = "config.blk";
pub const MANIFEST_FILE: &str = ".manifest.json";
pub const LOCK_FILE: &str = ".manifest.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FolderRole {
    Game,
    GameVoice,
    Pending,
    Library,
}

impl FolderRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "game" => Some(FolderRole::Game),
            "game_voice" | "target" => Some(FolderRole::GameVoice),
            "pending" => Some(FolderRole::Pending),
            "library" | "voice" => Some(FolderRole::Library),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FolderRole::Game => "game",
            FolderRole::GameVoice => "game_voice",
            FolderRole::Pending => "pending",
            FolderRole::Library => "library",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModPaths {
    pub game_root: PathBuf,
    pub pending_dir: PathBuf,
    pub library_dir: PathBuf,
}

impl ModPaths {
    pub fn new(game_root: PathBuf, pending_dir: PathBuf, library_dir: PathBuf) -> Self {
        Self {
            game_root,
            pending_dir,
            library_dir,
        }
    }

    pub fn resolve(&self, role: FolderRole) -> PathBuf {
        match role {
            FolderRole::Game => self.game_root.clone(),
            FolderRole::GameVoice => self.game_root.join("sound").join("mod"),
            FolderRole::Pending => self.pending_dir.clone(),
            FolderRole::Library => self.library_dir.clone(),
        }
    }

    pub fn target_dir(&self) -> PathBuf {
        self.resolve(FolderRole::GameVoice)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.target_dir().join(MANIFEST_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.target_dir().join(LOCK_FILE)
    }

    pub fn host_config_path(&self) -> PathBuf {
        self.game_root.join(HOST_CONFIG_FILE)
    }

    pub fn mod_dir(&self, mod_id: &str) -> PathBuf {
        self.library_dir.join(mod_id)
    }

    /// Like [`ModPaths::mod_dir`], but refuses ids that are not a single
    /// folder name directly under the library.
    pub fn library_entry(&self, mod_id: &str) -> Result<PathBuf> {
        if !is_mod_id(mod_id) {
            bail!("{mod_id:?} is not a library folder name");
        }
        Ok(self.mod_dir(mod_id))
    }

    pub fn ensure_app_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.pending_dir).context("create pending dir")?;
        fs::create_dir_all(&self.library_dir).context("create library dir")?;
        Ok(())
    }

    pub fn ensure_target_dir(&self) -> Result<PathBuf> {
        let target = self.target_dir();
        fs::create_dir_all(&target)
            .with_context(|| format!("create game voice dir {}", target.display()))?;
        Ok(target)
    }
}

pub fn is_mod_id(mod_id: &str) -> bool {
    let mut components = Path::new(mod_id).components();
    !mod_id.trim().is_empty()
        && matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        )
}

pub fn looks_like_game_root(path: &Path) -> bool {
    path.is_dir() && path.join(HOST_CONFIG_FILE).is_file()
}

pub fn verify_game_root(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("game path not set");
    }
    if !path.exists() {
        bail!("game path does not exist: {}", path.display());
    }
    if !looks_like_game_root(path) {
        bail!(
            "invalid game root: expected {HOST_CONFIG_FILE} in {}",
            path.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_dir_lives_under_sound_mod() {
        let paths = ModPaths::new(
            PathBuf::from("/games/wt"),
            PathBuf::from("/data/pending"),
            PathBuf::from("/data/voice"),
        );
        assert_eq!(paths.target_dir(), PathBuf::from("/games/wt/sound/mod"));
        assert_eq!(
            paths.manifest_path(),
            PathBuf::from("/games/wt/sound/mod/.manifest.json")
        );
        assert_eq!(paths.host_config_path(), PathBuf::from("/games/wt/config.blk"));
        assert_eq!(paths.mod_dir("voice_en"), PathBuf::from("/data/voice/voice_en"));
        assert_eq!(paths.resolve(FolderRole::Pending), PathBuf::from("/data/pending"));
    }

    #[test]
    fn mod_ids_are_single_folder_names() {
        let paths = ModPaths::new(
            PathBuf::from("/games/wt"),
            PathBuf::from("/data/pending"),
            PathBuf::from("/data/voice"),
        );
        assert_eq!(
            paths.library_entry("voice_en").unwrap(),
            PathBuf::from("/data/voice/voice_en")
        );
        for bad in ["", "  ", "..", ".", "../elsewhere", "voice_en/ground", "/etc"] {
            assert!(!is_mod_id(bad), "{bad:?}");
            assert!(paths.library_entry(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn role_labels_parse_back() {
        for role in [
            FolderRole::Game,
            FolderRole::GameVoice,
            FolderRole::Pending,
            FolderRole::Library,
        ] {
            assert_eq!(FolderRole::parse(role.label()), Some(role));
        }
        assert_eq!(FolderRole::parse("voice"), Some(FolderRole::Library));
        assert_eq!(FolderRole::parse("skins"), None);
    }

    #[test]
    fn game_root_needs_config_blk() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!looks_like_game_root(dir.path()));
        assert!(verify_game_root(dir.path()).is_err());
        fs::write(dir.path().join(HOST_CONFIG_FILE), "sound{\n}\n").unwrap();
        assert!(looks_like_game_root(dir.path()));
        assert!(verify_game_root(dir.path()).is_ok());
        assert!(verify_game_root(Path::new("")).is_err());
    }
}
