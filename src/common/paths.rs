use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};
use crate::common::error::{BiometricError, Result};

pub enum RunMode {
    Development(PathBuf),  // Base directory for dev mode
    System,                // Use system paths
    User(PathBuf),         // Per-user data directory
}

pub struct Paths {
    mode: RunMode,
    data_override: Option<PathBuf>,
}

const SYSTEM_DATA_DIR: &str = "/var/lib/triguard";
const SYSTEM_CONFIG_FILE: &str = "/etc/triguard/triguard.toml";

impl Paths {
    pub fn new(dev: bool, system: bool) -> Result<Self> {
        let mode = match (dev, system) {
            (true, true) => {
                return Err(BiometricError::InvalidInput(
                    "Cannot use both --dev and --system".to_string(),
                ));
            }
            (true, false) => RunMode::Development(PathBuf::from("./dev_data")),
            (false, true) => RunMode::System,
            (false, false) => {
                let dirs = ProjectDirs::from("org", "triguard", "TriGuard")
                    .ok_or_else(|| BiometricError::Storage("Failed to get project dirs".into()))?;
                RunMode::User(dirs.data_dir().to_path_buf())
            }
        };

        Ok(Self { mode, data_override: None })
    }

    /// Paths rooted at an arbitrary directory; used by tests and `storage.data_dir`.
    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        Self {
            mode: RunMode::Development(base.into()),
            data_override: None,
        }
    }

    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        self.data_override = data_dir;
        self
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_override {
            return dir.clone();
        }
        match &self.mode {
            RunMode::Development(base) => base.clone(),
            RunMode::System => PathBuf::from(SYSTEM_DATA_DIR),
            RunMode::User(base) => base.clone(),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        match &self.mode {
            RunMode::Development(base) => base.join("triguard.toml"),
            RunMode::System => PathBuf::from(SYSTEM_CONFIG_FILE),
            RunMode::User(_) => ProjectDirs::from("org", "triguard", "TriGuard")
                .map(|dirs| dirs.config_dir().join("triguard.toml"))
                .filter(|path| path.exists())
                .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_FILE)),
        }
    }

    pub fn gallery_file(&self) -> PathBuf {
        self.data_dir().join("faces").join("gallery.bin")
    }

    pub fn face_crops_dir(&self) -> PathBuf {
        self.data_dir().join("faces").join("crops")
    }

    pub fn users_file(&self) -> PathBuf {
        self.data_dir().join("users.json")
    }

    pub fn fingerprint_dir(&self) -> PathBuf {
        self.data_dir().join("fingerprints")
    }

    /// Scratch directory for freshly captured fingerprint bitmaps.
    pub fn capture_dir(&self) -> PathBuf {
        self.data_dir().join("fptemp")
    }

    pub fn models_dir(&self) -> PathBuf {
        match &self.mode {
            RunMode::Development(_) => PathBuf::from("./models"),
            RunMode::System | RunMode::User(_) => PathBuf::from("/usr/share/triguard/models"),
        }
    }

    /// Resolve a model path from the config against the models directory.
    pub fn model_path(&self, configured: &Path) -> PathBuf {
        if configured.is_relative() {
            self.models_dir().join(configured)
        } else {
            configured.to_path_buf()
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir(),
            self.face_crops_dir(),
            self.fingerprint_dir(),
            self.capture_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        if self.is_development() {
            tracing::debug!("Using dev directories under {:?}", self.data_dir());
        }
        Ok(())
    }

    pub fn is_development(&self) -> bool {
        matches!(self.mode, RunMode::Development(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_and_system_are_exclusive() {
        assert!(Paths::new(true, true).is_err());
    }

    #[test]
    fn layout_hangs_off_the_data_dir() {
        let paths = Paths::rooted_at("/tmp/tg");
        assert_eq!(paths.gallery_file(), PathBuf::from("/tmp/tg/faces/gallery.bin"));
        assert_eq!(paths.fingerprint_dir(), PathBuf::from("/tmp/tg/fingerprints"));

        let paths = paths.with_data_dir(Some(PathBuf::from("/srv/tg")));
        assert_eq!(paths.users_file(), PathBuf::from("/srv/tg/users.json"));
    }

    #[test]
    fn relative_models_resolve_against_models_dir() {
        let paths = Paths::rooted_at("/tmp/tg");
        assert_eq!(paths.model_path(Path::new("a.onnx")), PathBuf::from("./models/a.onnx"));
        assert_eq!(paths.model_path(Path::new("/opt/a.onnx")), PathBuf::from("/opt/a.onnx"));
    }
}
