//! Active model registry
//!
//! Holds at most one model per [`Role`]. Readers take an [`ActiveModels`]
//! guard for the duration of a generation; refreshes take the write side of
//! the same lock, so a swap waits until no generation is using the models and
//! readers never see a half-applied swap.

use crate::error::{Result, VaultError};
use crate::models::adapter::{AdapterComposer, AdapterInput, AdapterMismatch};
use crate::models::checkpoint::{CheckpointLoader, LoadedModel, ModelLoader};
use crate::models::manifest::{is_none_sentinel, AdapterSlot, Manifest, NONE_SENTINEL};
use crate::models::store::{ArtifactClass, ArtifactStore};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Base,
    Refiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Base => "base",
            Self::Refiner => "refiner",
        })
    }
}

/// The active model per role
#[derive(Debug, Default)]
pub struct RegistryState {
    base: Option<LoadedModel>,
    refiner: Option<LoadedModel>,
}

impl RegistryState {
    #[must_use]
    pub fn get(&self, role: Role) -> Option<&LoadedModel> {
        match role {
            Role::Base => self.base.as_ref(),
            Role::Refiner => self.refiner.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<LoadedModel> {
        match role {
            Role::Base => &mut self.base,
            Role::Refiner => &mut self.refiner,
        }
    }
}

/// What a refresh did to a role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Requested model was already active
    Unchanged,
    /// A new model was loaded and installed
    Loaded,
    /// The role was emptied
    Unloaded,
}

/// Result of refreshing one role
#[derive(Debug)]
pub struct Refresh {
    pub outcome: RefreshOutcome,
    /// Adapters that matched nothing in the new model
    pub warnings: Vec<AdapterMismatch>,
}

/// Result of [`ModelRegistry::refresh_everything`]
#[derive(Debug)]
pub struct RefreshReport {
    pub base: Refresh,
    pub refiner: Refresh,
}

/// Change computed for a role before anything is committed
enum Plan {
    Keep,
    Install(LoadedModel, Vec<AdapterMismatch>),
    Clear,
}

/// Scoped use of the active models; dropping it ends the use
pub struct ActiveModels {
    guard: OwnedRwLockReadGuard<RegistryState>,
}

impl ActiveModels {
    #[must_use]
    pub fn base(&self) -> Option<&LoadedModel> {
        self.guard.base.as_ref()
    }

    #[must_use]
    pub fn refiner(&self) -> Option<&LoadedModel> {
        self.guard.refiner.as_ref()
    }
}

/// Owns the [`RegistryState`] and performs reload-avoiding swaps
pub struct ModelRegistry<L: ModelLoader = CheckpointLoader> {
    store: Arc<ArtifactStore>,
    loader: Arc<L>,
    composer: Arc<AdapterComposer>,
    state: Arc<RwLock<RegistryState>>,
    strict_adapters: bool,
}

impl<L: ModelLoader> Clone for ModelRegistry<L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            loader: Arc::clone(&self.loader),
            composer: Arc::clone(&self.composer),
            state: Arc::clone(&self.state),
            strict_adapters: self.strict_adapters,
        }
    }
}

impl<L: ModelLoader> ModelRegistry<L> {
    pub fn new(store: Arc<ArtifactStore>, loader: L, composer: AdapterComposer) -> Self {
        Self {
            store,
            loader: Arc::new(loader),
            composer: Arc::new(composer),
            state: Arc::new(RwLock::new(RegistryState::default())),
            strict_adapters: false,
        }
    }

    /// Treat any adapter mismatch as a failed refresh
    #[must_use]
    pub fn with_strict_adapters(mut self, strict: bool) -> Self {
        self.strict_adapters = strict;
        self
    }

    #[must_use]
    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Begin using the active models; swaps wait until the guard is dropped
    pub async fn begin_use(&self) -> ActiveModels {
        ActiveModels {
            guard: Arc::clone(&self.state).read_owned().await,
        }
    }

    /// Identity key of the active model for `role`
    pub async fn active_identity(&self, role: Role) -> Option<String> {
        self.state
            .read()
            .await
            .get(role)
            .map(|m| m.identity().to_string())
    }

    /// Make checkpoint `name` the active base model with `adapters` composed in
    ///
    /// A no-op when the same file with the same adapter list is already
    /// active. On failure the previous base model stays active.
    pub async fn refresh_base(&self, name: &str, adapters: &[AdapterSlot]) -> Result<Refresh> {
        let mut state = self.state.write().await;
        let plan = self.plan_base(&state, name, adapters).await?;
        Ok(commit(&mut state, Role::Base, plan))
    }

    /// Make `name` the active refiner; `"None"` empties the role
    pub async fn refresh_refiner(&self, name: &str) -> Result<Refresh> {
        let mut state = self.state.write().await;
        let plan = self.plan_refiner(&state, name).await?;
        Ok(commit(&mut state, Role::Refiner, plan))
    }

    /// Bring both roles in line with a manifest in one all-or-nothing step
    ///
    /// The refiner is disabled when it names the same file as the base.
    pub async fn refresh_everything(&self, manifest: &Manifest) -> Result<RefreshReport> {
        let base_name = manifest.default_model().file_name.as_str();
        let base_path = self.store.path_for(ArtifactClass::Checkpoint, base_name)?;

        let mut refiner_name = manifest
            .default_refiner()
            .map_or(NONE_SENTINEL, |r| r.file_name.as_str());
        if !is_none_sentinel(refiner_name)
            && self.store.path_for(ArtifactClass::Refiner, refiner_name)? == base_path
        {
            tracing::info!("Refiner disabled because base model and refiner are the same");
            refiner_name = NONE_SENTINEL;
        }

        let mut state = self.state.write().await;
        let base = self
            .plan_base(&state, base_name, manifest.default_adapters())
            .await?;
        let refiner = self.plan_refiner(&state, refiner_name).await?;

        Ok(RefreshReport {
            base: commit(&mut state, Role::Base, base),
            refiner: commit(&mut state, Role::Refiner, refiner),
        })
    }

    async fn plan_base(
        &self,
        state: &RegistryState,
        name: &str,
        adapters: &[AdapterSlot],
    ) -> Result<Plan> {
        let path = self.store.path_for(ArtifactClass::Checkpoint, name)?;
        let inputs = self.adapter_inputs(adapters)?;

        if let Some(active) = state.get(Role::Base) {
            if is_same_file(active, &path) && active.applied_adapters() == inputs.as_slice() {
                tracing::debug!("Base model {name} already active");
                return Ok(Plan::Keep);
            }
        }

        let (model, warnings) = self.load(path, inputs).await?;

        if self.strict_adapters {
            if let Some(mismatch) = warnings.into_iter().next() {
                return Err(VaultError::AdapterMismatch(mismatch));
            }
            return Ok(Plan::Install(model, Vec::new()));
        }

        Ok(Plan::Install(model, warnings))
    }

    async fn plan_refiner(&self, state: &RegistryState, name: &str) -> Result<Plan> {
        if is_none_sentinel(name) {
            return Ok(Plan::Clear);
        }

        let path = self.store.path_for(ArtifactClass::Refiner, name)?;
        if let Some(active) = state.get(Role::Refiner) {
            if is_same_file(active, &path) {
                tracing::debug!("Refiner model {name} already active");
                return Ok(Plan::Keep);
            }
        }

        let (model, _) = self.load(path, Vec::new()).await?;
        Ok(Plan::Install(model, Vec::new()))
    }

    /// File adapters in slot order; empty slots contribute nothing to the identity
    fn adapter_inputs(&self, adapters: &[AdapterSlot]) -> Result<Vec<AdapterInput>> {
        adapters
            .iter()
            .filter_map(|slot| match slot {
                AdapterSlot::None => None,
                AdapterSlot::Adapter { artifact, weight } => Some(
                    self.store
                        .path_for(ArtifactClass::Lora, &artifact.file_name)
                        .map(|path| AdapterInput::File {
                            path,
                            weight: *weight,
                        }),
                ),
            })
            .collect()
    }

    /// Load and compose on the blocking pool
    async fn load(
        &self,
        path: PathBuf,
        adapters: Vec<AdapterInput>,
    ) -> Result<(LoadedModel, Vec<AdapterMismatch>)> {
        let loader = Arc::clone(&self.loader);
        let composer = Arc::clone(&self.composer);

        tokio::task::spawn_blocking(move || -> Result<(LoadedModel, Vec<AdapterMismatch>)> {
            let mut model = loader.load(&path)?;
            let warnings = composer.apply(&mut model, &adapters)?;
            Ok((model, warnings))
        })
        .await
        .map_err(|e| VaultError::Task(format!("Model loading task failed: {e}")))?
    }
}

fn is_same_file(model: &LoadedModel, path: &Path) -> bool {
    model.identity() == path.to_string_lossy()
}

fn commit(state: &mut RegistryState, role: Role, plan: Plan) -> Refresh {
    let slot = state.slot_mut(role);
    match plan {
        Plan::Keep => Refresh {
            outcome: RefreshOutcome::Unchanged,
            warnings: Vec::new(),
        },
        Plan::Install(model, warnings) => {
            tracing::info!(
                "{role} model loaded: {} ({})",
                model.path().display(),
                model.family()
            );
            if let Some(previous) = slot.replace(model) {
                tracing::info!("Released previous {role} model {}", previous.path().display());
            }
            Refresh {
                outcome: RefreshOutcome::Loaded,
                warnings,
            }
        }
        Plan::Clear => {
            let outcome = match slot.take() {
                Some(previous) => {
                    tracing::info!("{role} model unloaded: {}", previous.path().display());
                    RefreshOutcome::Unloaded
                }
                None => RefreshOutcome::Unchanged,
            };
            Refresh {
                outcome,
                warnings: Vec::new(),
            }
        }
    }
}
