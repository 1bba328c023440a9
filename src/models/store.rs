use crate::config::PathsConfig;
use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Kind of artifact; each kind has its own cache root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactClass {
    Checkpoint,
    Refiner,
    Lora,
    Embedding,
    Auxiliary,
}

impl ArtifactClass {
    pub const ALL: [Self; 5] = [
        Self::Checkpoint,
        Self::Refiner,
        Self::Lora,
        Self::Embedding,
        Self::Auxiliary,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checkpoint => "checkpoint",
            Self::Refiner => "refiner",
            Self::Lora => "lora",
            Self::Embedding => "embedding",
            Self::Auxiliary => "auxiliary",
        }
    }
}

impl fmt::Display for ArtifactClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file the vault knows how to materialize
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    pub class: ArtifactClass,
    pub file_name: String,
    pub url: String,
}

impl Artifact {
    pub fn new(class: ArtifactClass, file_name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            class,
            file_name: file_name.into(),
            url: url.into(),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.class, self.file_name)
    }
}

/// Local cache, one flat directory per artifact class
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    checkpoints: PathBuf,
    refiners: PathBuf,
    loras: PathBuf,
    embeddings: PathBuf,
    auxiliary: PathBuf,
}

impl ArtifactStore {
    /// Create a store from configured roots; relative roots are made absolute
    pub fn new(paths: &PathsConfig) -> Result<Self> {
        Ok(Self {
            checkpoints: std::path::absolute(&paths.checkpoints)?,
            refiners: std::path::absolute(paths.refiners())?,
            loras: std::path::absolute(&paths.loras)?,
            embeddings: std::path::absolute(&paths.embeddings)?,
            auxiliary: std::path::absolute(&paths.auxiliary)?,
        })
    }

    #[must_use]
    pub fn root_dir(&self, class: ArtifactClass) -> &Path {
        match class {
            ArtifactClass::Checkpoint => &self.checkpoints,
            ArtifactClass::Refiner => &self.refiners,
            ArtifactClass::Lora => &self.loras,
            ArtifactClass::Embedding => &self.embeddings,
            ArtifactClass::Auxiliary => &self.auxiliary,
        }
    }

    /// Absolute path of `file_name` inside the class root
    ///
    /// Purely lexical; nothing is read from disk. Names that are absolute,
    /// empty, or climb above the root are rejected with
    /// [`VaultError::PathTraversal`].
    pub fn path_for(&self, class: ArtifactClass, file_name: &str) -> Result<PathBuf> {
        let relative = normalize_name(file_name).ok_or_else(|| VaultError::PathTraversal {
            class,
            name: file_name.to_string(),
        })?;

        let path = self.root_dir(class).join(relative);
        debug_assert!(path.starts_with(self.root_dir(class)));
        Ok(path)
    }

    /// Path of a declared artifact
    pub fn resolve(&self, artifact: &Artifact) -> Result<PathBuf> {
        self.path_for(artifact.class, &artifact.file_name)
    }

    /// Whether the artifact is present in the cache
    pub fn exists(&self, class: ArtifactClass, file_name: &str) -> Result<bool> {
        Ok(self.path_for(class, file_name)?.is_file())
    }
}

/// Collapse `.` and `..` without touching the filesystem
///
/// Returns `None` when the result would be empty or outside the root.
fn normalize_name(file_name: &str) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in Path::new(file_name).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if parts.is_empty() {
        return None;
    }

    Some(parts.iter().collect())
}
