use crate::config::Config;
use crate::error::Result;
use crate::models::adapter::AdapterComposer;
use crate::models::checkpoint::{CheckpointLoader, LoadedModel, ModelLoader};
use crate::models::download::{Fetcher, HttpTransport, Transport};
use crate::models::manifest::Manifest;
use crate::models::preset::{PresetCatalog, PresetResolver};
use crate::models::registry::{ModelRegistry, RefreshReport};
use crate::models::store::ArtifactStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Model manager wiring presets, the cache and the active registry together
pub struct ModelManager<T: Transport = HttpTransport> {
    store: Arc<ArtifactStore>,
    fetcher: Fetcher<T>,
    resolver: PresetResolver,
    catalog: PresetCatalog,
    registry: ModelRegistry,
    default_preset: String,
}

impl ModelManager {
    /// Create a manager that downloads over HTTP
    pub fn new(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.download)?;
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> ModelManager<T> {
    pub fn with_transport(config: &Config, transport: T) -> Result<Self> {
        let device = config.runtime.device()?;
        let store = Arc::new(ArtifactStore::new(&config.paths)?);

        let registry = ModelRegistry::new(
            Arc::clone(&store),
            CheckpointLoader::new(device.clone()),
            AdapterComposer::new(device),
        )
        .with_strict_adapters(config.runtime.fail_on_adapter_mismatch);

        Ok(Self {
            fetcher: Fetcher::new(Arc::clone(&store), transport, config.download.clone()),
            store,
            resolver: PresetResolver::new(),
            catalog: PresetCatalog::new(&config.paths.presets),
            registry,
            default_preset: config.runtime.default_preset.clone(),
        })
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Names of the presets in the preset directory
    pub fn preset_names(&self) -> Result<Vec<String>> {
        self.catalog.names()
    }

    /// Resolve a preset by name or path; `None` picks the configured default
    pub fn resolve(&self, preset: Option<&str>) -> Result<Manifest> {
        let name = preset.unwrap_or(&self.default_preset);
        let definition = self.catalog.load(name)?;
        let manifest = self.resolver.resolve(&definition)?;

        tracing::debug!(
            "Preset '{name}' resolved to {} downloads, {} active adapters",
            manifest.downloads().len(),
            manifest.active_adapter_count()
        );
        Ok(manifest)
    }

    /// Materialize every file a manifest needs
    pub async fn download(&self, manifest: &Manifest) -> Result<Vec<PathBuf>> {
        self.fetcher.ensure_all(manifest).await
    }

    /// Resolve, download and activate a preset
    pub async fn activate(&self, preset: Option<&str>) -> Result<RefreshReport> {
        let manifest = self.resolve(preset)?;
        self.download(&manifest).await?;

        self.registry.refresh_everything(&manifest).await
    }

    /// Load a checkpoint file without activating it
    pub fn inspect(&self, path: &Path) -> Result<LoadedModel> {
        self.registry.loader().load(path)
    }
}
