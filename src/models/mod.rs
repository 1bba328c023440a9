pub mod adapter;
pub mod checkpoint;
pub mod download;
pub mod manager;
pub mod manifest;
pub mod preset;
pub mod registry;
pub mod store;

pub use adapter::{AdapterComposer, AdapterInput, AdapterMismatch};
pub use checkpoint::{ArchitectureFamily, CheckpointLoader, LoadedModel, ModelLoader};
pub use download::{Fetcher, HttpTransport, Transport};
pub use manager::ModelManager;
pub use manifest::{AdapterSlot, Manifest};
pub use preset::{PresetCatalog, PresetDefinition, PresetResolver};
pub use registry::{ActiveModels, ModelRegistry, Refresh, RefreshOutcome, RefreshReport, Role};
pub use store::{Artifact, ArtifactClass, ArtifactStore};
