use crate::models::adapter::AdapterMismatch;
use crate::models::store::ArtifactClass;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Main error type for modelvault
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Path traversal rejected: '{name}' escapes the {class} directory")]
    PathTraversal { class: ArtifactClass, name: String },

    #[error("Failed to fetch {artifact}: {cause}\n\nTroubleshooting:\n- Check internet connection and the preset's download URL\n- Disable offline mode in ~/.config/modelvault/config.toml\n- Re-run the command, failed downloads leave no partial files behind")]
    Fetch {
        artifact: String,
        #[source]
        cause: TransportError,
    },

    #[error("Artifact '{name}' is not listed in {map}\n\nTroubleshooting:\n- Add '{name}' with its source URL to the preset's {map}\n- Use \"None\" to leave a refiner or LoRA slot empty")]
    UnresolvedArtifact { name: String, map: &'static str },

    #[error("Unknown checkpoint architecture: {}\n\nTroubleshooting:\n- Supported families: SDXL, SDXL refiner, SD 2.x, SD 1.x, standalone VAE\n- Run with RUST_LOG=debug to see the detected tensor keys", .path.display())]
    UnknownArchitecture { path: PathBuf },

    #[error("{0}")]
    AdapterMismatch(#[from] AdapterMismatch),

    #[error("Invalid preset: {0}")]
    InvalidPreset(String),

    #[error("Failed to read tensors from {}: {source}", .path.display())]
    Tensor {
        path: PathBuf,
        #[source]
        source: candle_core::Error,
    },

    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/modelvault/config.toml\n- Run with RUST_LOG=debug for more details")]
    Config(String),

    #[error("{0}")]
    Task(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transfer failures reported by a [`Transport`](crate::models::download::Transport)
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded with status {status}")]
    Status { status: u16 },

    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("not enough disk space: {required_mb} MB required, {available_mb} MB available")]
    DiskSpace { required_mb: u64, available_mb: u64 },

    #[error("offline mode is enabled and the file is not cached")]
    Offline,

    /// A failure reported to every caller that waited on the same download
    #[error(transparent)]
    Shared(Arc<TransportError>),
}

pub type Result<T> = std::result::Result<T, VaultError>;
