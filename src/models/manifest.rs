use crate::models::store::{Artifact, ArtifactClass};
use serde::Serialize;

/// Marker presets use for an empty refiner or LoRA slot
pub const NONE_SENTINEL: &str = "None";

/// Whether a preset name is the empty-slot marker
#[must_use]
pub fn is_none_sentinel(name: &str) -> bool {
    name.trim().eq_ignore_ascii_case(NONE_SENTINEL)
}

/// One position in the ordered adapter list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AdapterSlot {
    /// Empty slot; kept so slot positions stay stable
    None,
    Adapter { artifact: Artifact, weight: f32 },
}

/// A preset resolved into concrete artifacts
///
/// Built only by [`PresetResolver`](crate::models::preset::PresetResolver),
/// which guarantees that every referenced artifact is in `downloads`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub(crate) default_model: Artifact,
    pub(crate) default_refiner: Option<Artifact>,
    pub(crate) default_refiner_switch: f32,
    pub(crate) default_adapters: Vec<AdapterSlot>,
    pub(crate) downloads: Vec<Artifact>,
}

impl Manifest {
    #[must_use]
    pub fn default_model(&self) -> &Artifact {
        &self.default_model
    }

    #[must_use]
    pub fn default_refiner(&self) -> Option<&Artifact> {
        self.default_refiner.as_ref()
    }

    /// Fraction of sampling progress at which the refiner takes over
    #[must_use]
    pub fn default_refiner_switch(&self) -> f32 {
        self.default_refiner_switch
    }

    #[must_use]
    pub fn default_adapters(&self) -> &[AdapterSlot] {
        &self.default_adapters
    }

    /// Every artifact to materialize, in download order
    #[must_use]
    pub fn downloads(&self) -> &[Artifact] {
        &self.downloads
    }

    /// Source URL of a declared artifact
    #[must_use]
    pub fn url_for(&self, class: ArtifactClass, file_name: &str) -> Option<&str> {
        self.downloads
            .iter()
            .find(|a| a.class == class && a.file_name == file_name)
            .map(|a| a.url.as_str())
    }

    /// Number of non-empty adapter slots
    #[must_use]
    pub fn active_adapter_count(&self) -> usize {
        self.default_adapters
            .iter()
            .filter(|slot| matches!(slot, AdapterSlot::Adapter { .. }))
            .count()
    }
}
