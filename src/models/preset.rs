use crate::error::{Result, VaultError};
use crate::models::manifest::{is_none_sentinel, AdapterSlot, Manifest, NONE_SENTINEL};
use crate::models::store::{Artifact, ArtifactClass};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// A LoRA entry as written in preset files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoraEntry {
    /// `[enabled, name, weight]`
    Toggled(bool, String, f32),
    /// `[name, weight]`
    Weighted(String, f32),
}

impl LoraEntry {
    /// Name and weight, with disabled entries reported as the sentinel
    #[must_use]
    pub fn slot(&self) -> (&str, f32) {
        match self {
            Self::Toggled(false, _, weight) => (NONE_SENTINEL, *weight),
            Self::Toggled(true, name, weight) | Self::Weighted(name, weight) => (name, *weight),
        }
    }
}

/// Preset file contents; unknown keys are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetDefinition {
    pub default_model: String,
    #[serde(default = "default_refiner")]
    pub default_refiner: String,
    #[serde(default = "default_refiner_switch")]
    pub default_refiner_switch: f32,
    #[serde(default)]
    pub default_loras: Vec<LoraEntry>,
    #[serde(default)]
    pub checkpoint_downloads: BTreeMap<String, String>,
    #[serde(default)]
    pub lora_downloads: BTreeMap<String, String>,
    #[serde(default)]
    pub embeddings_downloads: BTreeMap<String, String>,
    #[serde(default)]
    pub auxiliary_downloads: BTreeMap<String, String>,
}

fn default_refiner() -> String {
    NONE_SENTINEL.to_string()
}
fn default_refiner_switch() -> f32 {
    0.8
}

impl PresetDefinition {
    /// Parse preset JSON
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| VaultError::InvalidPreset(format!("Failed to parse preset: {e}")))
    }

    /// Read a preset file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            VaultError::InvalidPreset(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            VaultError::InvalidPreset(format!("Failed to parse {}: {e}", path.display()))
        })
    }
}

/// Helpers every installation needs regardless of preset
const AUXILIARY_ARTIFACTS: &[(&str, &str)] = &[
    (
        "vae_approx/xlvae.pth",
        "https://huggingface.co/lllyasviel/misc/resolve/main/xlvae.pth",
    ),
    (
        "vae_approx/vaeapp_sd15.pth",
        "https://huggingface.co/lllyasviel/misc/resolve/main/vaeapp_sd15.pt",
    ),
    (
        "vae_approx/xl-to-v1_interposer-v3.1.safetensors",
        "https://huggingface.co/lllyasviel/misc/resolve/main/xl-to-v1_interposer-v3.1.safetensors",
    ),
    (
        "prompt_expansion/pytorch_model.bin",
        "https://huggingface.co/lllyasviel/misc/resolve/main/fooocus_expansion.bin",
    ),
];

/// Turns preset definitions into manifests
#[derive(Debug, Clone)]
pub struct PresetResolver {
    auxiliary: Vec<Artifact>,
}

impl Default for PresetResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PresetResolver {
    /// Resolver with the standard auxiliary helpers
    #[must_use]
    pub fn new() -> Self {
        Self::with_auxiliary(
            AUXILIARY_ARTIFACTS
                .iter()
                .map(|(name, url)| Artifact::new(ArtifactClass::Auxiliary, *name, *url))
                .collect(),
        )
    }

    /// Resolver with a custom always-required set
    #[must_use]
    pub fn with_auxiliary(auxiliary: Vec<Artifact>) -> Self {
        Self { auxiliary }
    }

    /// Resolve a preset into a manifest
    ///
    /// Fails with [`VaultError::UnresolvedArtifact`] when the default model,
    /// the refiner or any LoRA is missing from its download map.
    pub fn resolve(&self, preset: &PresetDefinition) -> Result<Manifest> {
        if !(0.0..=1.0).contains(&preset.default_refiner_switch) {
            return Err(VaultError::InvalidPreset(format!(
                "default_refiner_switch must be within [0, 1], got {}",
                preset.default_refiner_switch
            )));
        }

        if is_none_sentinel(&preset.default_model) {
            return Err(VaultError::InvalidPreset(
                "default_model cannot be \"None\"".to_string(),
            ));
        }

        let default_model = Artifact::new(
            ArtifactClass::Checkpoint,
            &preset.default_model,
            lookup(&preset.checkpoint_downloads, &preset.default_model, "checkpoint_downloads")?,
        );

        let default_refiner = if is_none_sentinel(&preset.default_refiner) {
            None
        } else {
            Some(Artifact::new(
                ArtifactClass::Refiner,
                &preset.default_refiner,
                lookup(
                    &preset.checkpoint_downloads,
                    &preset.default_refiner,
                    "checkpoint_downloads",
                )?,
            ))
        };

        let default_adapters = preset
            .default_loras
            .iter()
            .map(|entry| {
                let (name, weight) = entry.slot();
                if is_none_sentinel(name) {
                    return Ok(AdapterSlot::None);
                }
                let url = lookup(&preset.lora_downloads, name, "lora_downloads")?;
                Ok(AdapterSlot::Adapter {
                    artifact: Artifact::new(ArtifactClass::Lora, name, url),
                    weight,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let downloads = self.download_list(preset, default_refiner.as_ref());

        tracing::debug!(
            "Resolved preset: model={}, refiner={}, {} adapter slot(s), {} download(s)",
            default_model.file_name,
            default_refiner.as_ref().map_or(NONE_SENTINEL, |r| r.file_name.as_str()),
            default_adapters.len(),
            downloads.len()
        );

        Ok(Manifest {
            default_model,
            default_refiner,
            default_refiner_switch: preset.default_refiner_switch,
            default_adapters,
            downloads,
        })
    }

    /// Auxiliary, embeddings, checkpoints, refiner, LoRAs; first entry per slot wins
    fn download_list(
        &self,
        preset: &PresetDefinition,
        refiner: Option<&Artifact>,
    ) -> Vec<Artifact> {
        let mut seen = HashSet::new();
        let mut downloads = Vec::new();
        let mut push = |artifact: Artifact| {
            if seen.insert((artifact.class, artifact.file_name.clone())) {
                downloads.push(artifact);
            }
        };

        for artifact in &self.auxiliary {
            push(artifact.clone());
        }
        for (name, url) in &preset.auxiliary_downloads {
            push(Artifact::new(ArtifactClass::Auxiliary, name, url));
        }
        for (name, url) in &preset.embeddings_downloads {
            push(Artifact::new(ArtifactClass::Embedding, name, url));
        }

        let refiner_only = refiner
            .map(|r| r.file_name.as_str())
            .filter(|name| *name != preset.default_model);
        for (name, url) in &preset.checkpoint_downloads {
            if Some(name.as_str()) != refiner_only {
                push(Artifact::new(ArtifactClass::Checkpoint, name, url));
            }
        }
        if let Some(refiner) = refiner {
            push(refiner.clone());
        }

        for (name, url) in &preset.lora_downloads {
            push(Artifact::new(ArtifactClass::Lora, name, url));
        }

        downloads
    }
}

fn lookup(map: &BTreeMap<String, String>, name: &str, map_name: &'static str) -> Result<String> {
    map.get(name)
        .cloned()
        .ok_or_else(|| VaultError::UnresolvedArtifact {
            name: name.to_string(),
            map: map_name,
        })
}

/// Preset files (`<name>.json`) in one directory
#[derive(Debug, Clone)]
pub struct PresetCatalog {
    dir: PathBuf,
}

impl PresetCatalog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Sorted preset names
    pub fn names(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| path.file_stem()?.to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Load a preset by name, or directly from a `.json` path
    pub fn load(&self, name_or_path: &str) -> Result<PresetDefinition> {
        let direct = Path::new(name_or_path);
        if direct.extension().is_some_and(|ext| ext == "json") && direct.is_file() {
            return PresetDefinition::from_file(direct);
        }

        let names = self.names()?;
        if !names.iter().any(|n| n == name_or_path) {
            let hint = suggest(name_or_path, &names)
                .map(|s| format!(". Did you mean '{s}'?"))
                .unwrap_or_default();
            return Err(VaultError::NotFound(format!(
                "Preset '{name_or_path}' not found in {}{hint}",
                self.dir.display()
            )));
        }

        PresetDefinition::from_file(&self.dir.join(format!("{name_or_path}.json")))
    }
}

/// Find closest match using Levenshtein distance
fn suggest<'a>(name: &str, candidates: &'a [String]) -> Option<&'a str> {
    if name.is_empty() {
        return None;
    }

    candidates
        .iter()
        .map(|c| (c.as_str(), levenshtein_distance(name, c)))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
        .map(|(candidate, _)| candidate)
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let (len1, len2) = (s1_chars.len(), s2_chars.len());

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];
    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for (i, c1) in s1_chars.iter().enumerate() {
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}
