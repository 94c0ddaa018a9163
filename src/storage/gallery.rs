use crate::common::{BiometricError, Result};
use crate::core::matcher::{find_best_match, Embedding, MatchResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

const STORAGE_VERSION: u32 = 1;

/// Name → unit embedding, ordered by name.
pub type GalleryMap = BTreeMap<String, Embedding>;

#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledIdentity {
    pub name: String,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed,
    Duplicate(MatchResult),
}

/// Persistence backend for the gallery; loaded once, saved on every change.
pub trait GalleryStore: Send + Sync {
    fn load(&self) -> Result<GalleryMap>;
    fn save(&self, gallery: &GalleryMap) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct GalleryFile {
    version: u32,
    identities: GalleryMap,
}

pub struct FileGalleryStore {
    path: PathBuf,
}

impl FileGalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl GalleryStore for FileGalleryStore {
    fn load(&self) -> Result<GalleryMap> {
        if !self.path.exists() {
            return Ok(GalleryMap::new());
        }

        let data = fs::read(&self.path)?;
        let file: GalleryFile = bincode::deserialize(&data)
            .map_err(|e| BiometricError::Storage(format!("Failed to deserialize gallery: {}", e)))?;

        if file.version > STORAGE_VERSION {
            return Err(BiometricError::Storage(format!(
                "Gallery version {} is newer than supported {}",
                file.version, STORAGE_VERSION
            )));
        }

        tracing::info!("Loaded {} enrolled face(s)", file.identities.len());
        Ok(file.identities)
    }

    fn save(&self, gallery: &GalleryMap) -> Result<()> {
        let file = GalleryFile {
            version: STORAGE_VERSION,
            identities: gallery.clone(),
        };
        let encoded = bincode::serialize(&file)
            .map_err(|e| BiometricError::Storage(format!("Failed to serialize gallery: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so a crash never leaves a truncated gallery.
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        tracing::debug!("Saved {} enrolled face(s)", gallery.len());
        Ok(())
    }
}

/// Shared handle to the enrolled faces.
///
/// Readers grab an immutable snapshot; writers build a new map, persist it and
/// swap it in while holding the write lock, so a half-written entry is never visible.
pub struct Gallery {
    current: RwLock<Arc<GalleryMap>>,
    store: Option<Box<dyn GalleryStore>>,
}

impl Gallery {
    pub fn in_memory(entries: GalleryMap) -> Self {
        Self {
            current: RwLock::new(Arc::new(entries)),
            store: None,
        }
    }

    pub fn open(store: Box<dyn GalleryStore>) -> Result<Self> {
        let entries = store.load()?;
        Ok(Self {
            current: RwLock::new(Arc::new(entries)),
            store: Some(store),
        })
    }

    pub fn snapshot(&self) -> Arc<GalleryMap> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Embedding> {
        self.snapshot().get(name).cloned()
    }

    /// Insert `identity` unless another enrolled face is above `duplicate_threshold`.
    ///
    /// The duplicate check is repeated under the write lock, so two concurrent
    /// enrollments of the same face cannot both land. An existing entry with the
    /// same name is ignored by the check and overwritten.
    pub fn commit_unique(&self, identity: EnrolledIdentity, duplicate_threshold: f32) -> Result<CommitOutcome> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| BiometricError::Storage("Gallery lock poisoned".into()))?;

        let others = guard.iter().filter(|(name, _)| **name != identity.name);
        let conflict = find_best_match(&identity.embedding, others, duplicate_threshold);
        if conflict.is_match() {
            return Ok(CommitOutcome::Duplicate(conflict));
        }

        let mut next = GalleryMap::clone(&guard);
        next.insert(identity.name.clone(), identity.embedding);
        if let Some(store) = &self.store {
            store.save(&next)?;
        }
        *guard = Arc::new(next);

        tracing::info!("Committed face identity {}", identity.name);
        Ok(CommitOutcome::Committed)
    }

    pub fn remove(&self, name: &str) -> Result<bool> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| BiometricError::Storage("Gallery lock poisoned".into()))?;

        if !guard.contains_key(name) {
            return Ok(false);
        }

        let mut next = GalleryMap::clone(&guard);
        next.remove(name);
        if let Some(store) = &self.store {
            store.save(&next)?;
        }
        *guard = Arc::new(next);

        tracing::info!("Removed face identity {}", name);
        Ok(true)
    }
}
