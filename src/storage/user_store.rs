use crate::common::{BiometricError, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub salt: Vec<u8>,
    pub password_hash: Vec<u8>,
    #[serde(default)]
    pub face_registered: bool,
    #[serde(default)]
    pub fingerprint_registered: bool,
    #[serde(default)]
    pub fingerprint_path: Option<PathBuf>,
}

/// Flat user record file: one JSON object keyed by username.
pub struct UserStore {
    path: PathBuf,
    users: BTreeMap<String, UserRecord>,
}

impl UserStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let users = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| BiometricError::Storage(format!("Failed to parse {}: {}", path.display(), e)))?
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, users })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_string_pretty(&self.users)
            .map_err(|e| BiometricError::Storage(format!("Failed to serialize users: {}", e)))?;
        fs::write(&self.path, encoded)?;
        Ok(())
    }

    pub fn add_user(&mut self, username: &str, password: &str) -> Result<()> {
        if username.trim().is_empty() {
            return Err(BiometricError::InvalidInput("username must not be empty".into()));
        }
        if password.is_empty() {
            return Err(BiometricError::InvalidInput("password must not be empty".into()));
        }
        if self.users.contains_key(username) {
            return Err(BiometricError::InvalidInput(format!("user {} already exists", username)));
        }

        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let password_hash = hash_password(&salt, password)?;

        self.users.insert(
            username.to_string(),
            UserRecord {
                salt,
                password_hash,
                face_registered: false,
                fingerprint_registered: false,
                fingerprint_path: None,
            },
        );
        self.save()?;
        tracing::info!("Added user {}", username);
        Ok(())
    }

    pub fn delete_user(&mut self, username: &str) -> Result<Option<UserRecord>> {
        let removed = self.users.remove(username);
        if removed.is_some() {
            self.save()?;
            tracing::info!("Deleted user {}", username);
        }
        Ok(removed)
    }

    pub fn user_exists(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn get(&self, username: &str) -> Option<&UserRecord> {
        self.users.get(username)
    }

    pub fn usernames(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    /// True iff the user exists and the password matches.
    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        let Some(record) = self.users.get(username) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&record.salt) else {
            return false;
        };
        mac.update(password.as_bytes());
        mac.verify_slice(&record.password_hash).is_ok()
    }

    pub fn set_face_registered(&mut self, username: &str, registered: bool) -> Result<()> {
        self.record_mut(username)?.face_registered = registered;
        self.save()
    }

    pub fn set_fingerprint(&mut self, username: &str, template: &Path) -> Result<()> {
        let record = self.record_mut(username)?;
        record.fingerprint_path = Some(template.to_path_buf());
        record.fingerprint_registered = true;
        self.save()
    }

    pub fn clear_fingerprint(&mut self, username: &str) -> Result<()> {
        let record = self.record_mut(username)?;
        record.fingerprint_path = None;
        record.fingerprint_registered = false;
        self.save()
    }

    fn record_mut(&mut self, username: &str) -> Result<&mut UserRecord> {
        self.users
            .get_mut(username)
            .ok_or_else(|| BiometricError::UserNotFound(username.to_string()))
    }
}

fn hash_password(salt: &[u8], password: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(salt)
        .map_err(|e| BiometricError::Storage(format!("Invalid salt: {}", e)))?;
    mac.update(password.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}
