use crate::error::{Result, VaultError};
use crate::models::checkpoint::{read_tensors, Component, LoadedModel, SubModels};
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One entry of the ordered adapter list handed to the composer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AdapterInput {
    /// Empty slot, skipped without touching the model
    None,
    File { path: PathBuf, weight: f32 },
}

/// An adapter none of whose keys exist in the target model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Adapter {} matched no tensors in {}", .adapter.display(), .target.display())]
pub struct AdapterMismatch {
    pub adapter: PathBuf,
    pub target: PathBuf,
}

/// A single weight delta targeting one model tensor
#[derive(Debug)]
enum Patch {
    LowRank {
        down: Tensor,
        up: Tensor,
        alpha: Option<f32>,
    },
    Diff(Tensor),
}

#[derive(Default)]
struct PatchParts {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f32>,
    diff: Option<Tensor>,
}

impl PatchParts {
    fn into_patch(self) -> Option<Patch> {
        match self {
            Self {
                down: Some(down),
                up: Some(up),
                alpha,
                ..
            } => Some(Patch::LowRank { down, up, alpha }),
            Self { diff: Some(diff), .. } => Some(Patch::Diff(diff)),
            _ => None,
        }
    }
}

/// Adapter key stem -> (component index, tensor key)
type AliasTable = HashMap<String, (usize, String)>;

/// Adds weighted adapter deltas to a loaded model
///
/// Adapters are applied strictly in list order. Weight 0 adapters are still
/// loaded and applied so the result never depends on which entries were
/// dropped. Files are read but never written.
#[derive(Debug, Clone)]
pub struct AdapterComposer {
    device: Device,
}

impl AdapterComposer {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Apply `adapters` to `model` in place
    ///
    /// Returns one [`AdapterMismatch`] per adapter that matched nothing; the
    /// remaining adapters are still applied. Unreadable adapter files are
    /// errors.
    pub fn apply(
        &self,
        model: &mut LoadedModel,
        adapters: &[AdapterInput],
    ) -> Result<Vec<AdapterMismatch>> {
        let aliases = alias_table(model.sub_models());
        let mut warnings = Vec::new();

        for adapter in adapters {
            let AdapterInput::File { path, weight } = adapter else {
                continue;
            };

            let patches = self.load_patches(path)?;
            let total = patches.len();
            let applied = apply_patches(model.sub_models_mut(), &aliases, patches, *weight)
                .map_err(|source| VaultError::Tensor {
                    path: path.clone(),
                    source,
                })?;

            if applied == 0 {
                let mismatch = AdapterMismatch {
                    adapter: path.clone(),
                    target: model.path().to_path_buf(),
                };
                tracing::warn!("{mismatch}");
                warnings.push(mismatch);
            } else {
                if applied < total {
                    tracing::debug!(
                        "{} of {total} patch(es) in {} not applied",
                        total - applied,
                        path.display()
                    );
                }
                tracing::info!(
                    "Applied adapter {} (weight {weight}, {applied} tensor(s))",
                    path.display()
                );
            }
        }

        model.applied_adapters.extend(adapters.iter().cloned());
        Ok(warnings)
    }

    /// Read an adapter file and group its tensors per target, sorted by key
    fn load_patches(&self, path: &Path) -> Result<BTreeMap<String, Patch>> {
        let tensors = read_tensors(path, &self.device)?;
        let mut parts: BTreeMap<String, PatchParts> = BTreeMap::new();

        for (key, tensor) in tensors {
            if let Some(stem) = strip_any(&key, &[".lora_down.weight", ".lora_A.weight"]) {
                parts.entry(stem.to_string()).or_default().down = Some(tensor);
            } else if let Some(stem) = strip_any(&key, &[".lora_up.weight", ".lora_B.weight"]) {
                parts.entry(stem.to_string()).or_default().up = Some(tensor);
            } else if let Some(stem) = key.strip_suffix(".alpha") {
                let alpha = tensor
                    .to_dtype(DType::F32)
                    .and_then(|t| t.flatten_all())
                    .and_then(|t| t.get(0))
                    .and_then(|t| t.to_scalar::<f32>())
                    .map_err(|source| VaultError::Tensor {
                        path: path.to_path_buf(),
                        source,
                    })?;
                parts.entry(stem.to_string()).or_default().alpha = Some(alpha);
            } else if let Some(stem) = key.strip_suffix(".diff") {
                parts.entry(stem.to_string()).or_default().diff = Some(tensor);
            } else {
                tracing::debug!("Unsupported adapter tensor {key} in {}", path.display());
            }
        }

        Ok(parts
            .into_iter()
            .filter_map(|(stem, parts)| parts.into_patch().map(|patch| (stem, patch)))
            .collect())
    }
}

fn strip_any<'a>(key: &'a str, suffixes: &[&str]) -> Option<&'a str> {
    suffixes.iter().find_map(|suffix| key.strip_suffix(suffix))
}

/// Every name an adapter may use for each model tensor
///
/// Both the full checkpoint key (`model.diffusion_model.x.weight` minus
/// `.weight`) and the kohya form (`lora_unet_x`) are accepted.
fn alias_table(sub_models: &SubModels) -> AliasTable {
    let mut aliases = AliasTable::new();

    for (index, component) in sub_models.components().enumerate() {
        for key in component.tensors().keys() {
            let stem = key.strip_suffix(".weight").unwrap_or(key);
            aliases.insert(
                format!("{}{stem}", component.source_prefix()),
                (index, key.clone()),
            );
            if let Some(alias) = kohya_alias(component, stem) {
                aliases.insert(alias, (index, key.clone()));
            }
        }
    }

    aliases
}

fn kohya_alias(component: &Component, stem: &str) -> Option<String> {
    match component.lora_tag() {
        "vae" => None,
        tag => Some(format!("lora_{tag}_{}", stem.replace('.', "_"))),
    }
}

/// Add every matching patch into `sub_models`; returns the number applied
fn apply_patches(
    sub_models: &mut SubModels,
    aliases: &AliasTable,
    patches: BTreeMap<String, Patch>,
    weight: f32,
) -> candle_core::Result<usize> {
    let mut components: Vec<&mut Component> = sub_models.components_mut().collect();
    let mut applied = 0;

    for (stem, patch) in patches {
        let Some((index, key)) = aliases.get(&stem) else {
            continue;
        };
        let component = &mut components[*index];
        let Some(target) = component.get(key) else {
            continue;
        };

        let Some(delta) = patch_delta(&patch, target, weight)? else {
            tracing::warn!(
                "Shape mismatch for {stem} in {}, patch skipped",
                component.name()
            );
            continue;
        };

        let merged = target
            .to_dtype(DType::F32)?
            .add(&delta)?
            .to_dtype(target.dtype())?;
        component.replace(key, merged);
        applied += 1;
    }

    Ok(applied)
}

/// `weight * delta` shaped like `target`, or `None` when the sizes disagree
fn patch_delta(patch: &Patch, target: &Tensor, weight: f32) -> candle_core::Result<Option<Tensor>> {
    let (delta, scale) = match patch {
        Patch::LowRank { down, up, alpha } => {
            let rank = down.dim(0)?;
            let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
            let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
            if up.dim(1)? != rank {
                return Ok(None);
            }
            #[allow(clippy::cast_precision_loss)]
            let scale = alpha.map_or(1.0, |a| a / rank as f32) * weight;
            (up.matmul(&down)?, scale)
        }
        Patch::Diff(diff) => (diff.to_dtype(DType::F32)?, weight),
    };

    if delta.elem_count() != target.elem_count() {
        return Ok(None);
    }

    let delta = delta
        .reshape(target.shape().clone())?
        .to_device(target.device())?
        .affine(f64::from(scale), 0.0)?;
    Ok(Some(delta))
}
