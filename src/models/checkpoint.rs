//! Checkpoint parsing and architecture detection
//!
//! A checkpoint is a flat map of tensor names to tensors. Each known
//! [`ArchitectureFamily`] is recognized by a set of keys that must be present
//! and, for diffusion models, by the width of the backbone's cross-attention
//! context. The first family whose predicate holds decides how the flat map is
//! split into a diffusion backbone, text encoders and an image codec.

use crate::error::{Result, VaultError};
use crate::models::adapter::AdapterInput;
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

const BACKBONE_PREFIX: &str = "model.diffusion_model.";
const BACKBONE_INPUT: &str = "model.diffusion_model.input_blocks.0.0.weight";
const LABEL_EMBEDDING: &str = "model.diffusion_model.label_emb.0.0.weight";
const CODEC_PREFIX: &str = "first_stage_model.";
const STATE_DICT_KEY: &str = "state_dict";
const CROSS_ATTENTION_SUFFIX: &str = "attn2.to_k.weight";
const ADAPTER_SUFFIXES: &[&str] = &[".lora_down.weight", ".lora_A.weight", ".diff", ".alpha"];

/// Text encoder placement inside a checkpoint
struct EncoderLayout {
    name: &'static str,
    prefix: &'static str,
    lora_tag: &'static str,
}

/// How a family's tensors are recognized and split
struct FamilyLayout {
    required: &'static [&'static str],
    cross_attention_dim: Option<usize>,
    backbone_prefix: Option<&'static str>,
    text_encoders: &'static [EncoderLayout],
    codec_prefix: Option<&'static str>,
}

const SDXL: FamilyLayout = FamilyLayout {
    required: &[BACKBONE_INPUT, LABEL_EMBEDDING],
    cross_attention_dim: Some(2048),
    backbone_prefix: Some(BACKBONE_PREFIX),
    text_encoders: &[
        EncoderLayout {
            name: "clip_l",
            prefix: "conditioner.embedders.0.transformer.",
            lora_tag: "te1",
        },
        EncoderLayout {
            name: "clip_g",
            prefix: "conditioner.embedders.1.model.",
            lora_tag: "te2",
        },
    ],
    codec_prefix: Some(CODEC_PREFIX),
};

const SDXL_REFINER: FamilyLayout = FamilyLayout {
    required: &[BACKBONE_INPUT, LABEL_EMBEDDING],
    cross_attention_dim: Some(1280),
    backbone_prefix: Some(BACKBONE_PREFIX),
    text_encoders: &[EncoderLayout {
        name: "clip_g",
        prefix: "conditioner.embedders.0.model.",
        lora_tag: "te2",
    }],
    codec_prefix: Some(CODEC_PREFIX),
};

const SD2: FamilyLayout = FamilyLayout {
    required: &[BACKBONE_INPUT],
    cross_attention_dim: Some(1024),
    backbone_prefix: Some(BACKBONE_PREFIX),
    text_encoders: &[EncoderLayout {
        name: "open_clip",
        prefix: "cond_stage_model.model.",
        lora_tag: "te",
    }],
    codec_prefix: Some(CODEC_PREFIX),
};

const SD1: FamilyLayout = FamilyLayout {
    required: &[BACKBONE_INPUT],
    cross_attention_dim: Some(768),
    backbone_prefix: Some(BACKBONE_PREFIX),
    text_encoders: &[EncoderLayout {
        name: "clip_l",
        prefix: "cond_stage_model.transformer.",
        lora_tag: "te",
    }],
    codec_prefix: Some(CODEC_PREFIX),
};

const STANDALONE_VAE: FamilyLayout = FamilyLayout {
    required: &["decoder.conv_in.weight"],
    cross_attention_dim: None,
    backbone_prefix: None,
    text_encoders: &[],
    codec_prefix: Some(""),
};

/// Adapter files carry no sub-model of their own
const ADAPTER_ONLY: FamilyLayout = FamilyLayout {
    required: &[],
    cross_attention_dim: None,
    backbone_prefix: None,
    text_encoders: &[],
    codec_prefix: None,
};

/// Known checkpoint conventions, tried in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArchitectureFamily {
    Sdxl,
    SdxlRefiner,
    Sd2,
    Sd1,
    StandaloneVae,
    AdapterOnly,
}

impl ArchitectureFamily {
    pub const ALL: [Self; 6] = [
        Self::Sdxl,
        Self::SdxlRefiner,
        Self::Sd2,
        Self::Sd1,
        Self::StandaloneVae,
        Self::AdapterOnly,
    ];

    fn layout(self) -> &'static FamilyLayout {
        match self {
            Self::Sdxl => &SDXL,
            Self::SdxlRefiner => &SDXL_REFINER,
            Self::Sd2 => &SD2,
            Self::Sd1 => &SD1,
            Self::StandaloneVae => &STANDALONE_VAE,
            Self::AdapterOnly => &ADAPTER_ONLY,
        }
    }

    /// Whether the tensors follow this family's convention
    #[must_use]
    pub fn matches(self, tensors: &BTreeMap<String, Tensor>) -> bool {
        if self == Self::AdapterOnly {
            return tensors
                .keys()
                .any(|key| ADAPTER_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)));
        }

        let layout = self.layout();
        if !layout.required.iter().all(|key| tensors.contains_key(*key)) {
            return false;
        }
        match layout.cross_attention_dim {
            Some(expected) => cross_attention_dim(tensors) == Some(expected),
            None => true,
        }
    }

    /// First family whose predicate holds
    #[must_use]
    pub fn detect(tensors: &BTreeMap<String, Tensor>) -> Option<Self> {
        Self::ALL.into_iter().find(|family| family.matches(tensors))
    }

    /// Split a flat tensor map into sub-models; absent parts stay `None`
    fn split(self, tensors: BTreeMap<String, Tensor>) -> SubModels {
        let layout = self.layout();
        let mut backbone = BTreeMap::new();
        let mut encoders: Vec<BTreeMap<String, Tensor>> =
            layout.text_encoders.iter().map(|_| BTreeMap::new()).collect();
        let mut codec = BTreeMap::new();
        let mut ignored = 0usize;

        'keys: for (key, tensor) in tensors {
            if let Some(rest) = layout.backbone_prefix.and_then(|p| key.strip_prefix(p)) {
                backbone.insert(rest.to_string(), tensor);
                continue;
            }
            for (slot, encoder) in layout.text_encoders.iter().enumerate() {
                if let Some(rest) = key.strip_prefix(encoder.prefix) {
                    encoders[slot].insert(rest.to_string(), tensor);
                    continue 'keys;
                }
            }
            if let Some(rest) = layout.codec_prefix.and_then(|p| key.strip_prefix(p)) {
                codec.insert(rest.to_string(), tensor);
                continue;
            }
            ignored += 1;
        }

        if ignored > 0 {
            tracing::debug!("{self}: {ignored} tensor(s) outside known sub-models ignored");
        }

        let backbone = layout
            .backbone_prefix
            .filter(|_| !backbone.is_empty())
            .map(|prefix| Component::new("unet", prefix, "unet", backbone));

        let encoders: Vec<Component> = layout
            .text_encoders
            .iter()
            .zip(encoders)
            .filter(|(_, tensors)| !tensors.is_empty())
            .map(|(enc, tensors)| Component::new(enc.name, enc.prefix, enc.lora_tag, tensors))
            .collect();

        let codec = layout
            .codec_prefix
            .filter(|_| !codec.is_empty())
            .map(|prefix| Component::new("vae", prefix, "vae", codec));

        SubModels {
            backbone,
            text_encoders: (!encoders.is_empty()).then_some(TextEncoders { encoders }),
            codec,
        }
    }
}

impl fmt::Display for ArchitectureFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sdxl => "SDXL",
            Self::SdxlRefiner => "SDXL refiner",
            Self::Sd2 => "SD 2.x",
            Self::Sd1 => "SD 1.x",
            Self::StandaloneVae => "standalone VAE",
            Self::AdapterOnly => "adapter only",
        })
    }
}

/// Width of the backbone's cross-attention context
fn cross_attention_dim(tensors: &BTreeMap<String, Tensor>) -> Option<usize> {
    tensors
        .iter()
        .find(|(key, _)| key.starts_with(BACKBONE_PREFIX) && key.ends_with(CROSS_ATTENTION_SUFFIX))
        .and_then(|(_, tensor)| tensor.dims().get(1).copied())
}

/// One sub-model: tensors keyed relative to `source_prefix`
#[derive(Debug, Clone)]
pub struct Component {
    name: &'static str,
    source_prefix: &'static str,
    lora_tag: &'static str,
    tensors: BTreeMap<String, Tensor>,
}

impl Component {
    fn new(
        name: &'static str,
        source_prefix: &'static str,
        lora_tag: &'static str,
        tensors: BTreeMap<String, Tensor>,
    ) -> Self {
        Self {
            name,
            source_prefix,
            lora_tag,
            tensors,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Prefix the tensors carried in the checkpoint file
    #[must_use]
    pub fn source_prefix(&self) -> &'static str {
        self.source_prefix
    }

    /// Tag used by kohya-style adapter keys (`lora_<tag>_...`)
    #[must_use]
    pub fn lora_tag(&self) -> &'static str {
        self.lora_tag
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    #[must_use]
    pub fn tensors(&self) -> &BTreeMap<String, Tensor> {
        &self.tensors
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(Tensor::elem_count).sum()
    }

    pub(crate) fn replace(&mut self, key: &str, tensor: Tensor) {
        if let Some(slot) = self.tensors.get_mut(key) {
            *slot = tensor;
        }
    }

    /// Variable builder over this component, for constructing candle modules
    #[must_use]
    pub fn var_builder(&self, dtype: DType, device: &Device) -> candle_nn::VarBuilder<'static> {
        let tensors: HashMap<String, Tensor> = self
            .tensors
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        candle_nn::VarBuilder::from_tensors(tensors, dtype, device)
    }
}

/// One or more text encoders (SDXL carries two)
#[derive(Debug, Clone)]
pub struct TextEncoders {
    encoders: Vec<Component>,
}

impl TextEncoders {
    pub fn iter(&self) -> impl Iterator<Item = &Component> {
        self.encoders.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Component> {
        self.encoders.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.encoders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.encoders.is_empty()
    }
}

/// The parts a checkpoint was split into
#[derive(Debug, Clone)]
pub struct SubModels {
    pub backbone: Option<Component>,
    pub text_encoders: Option<TextEncoders>,
    pub codec: Option<Component>,
}

impl SubModels {
    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.backbone
            .iter()
            .chain(self.text_encoders.iter().flat_map(|t| t.encoders.iter()))
            .chain(self.codec.iter())
    }

    pub(crate) fn components_mut(&mut self) -> impl Iterator<Item = &mut Component> {
        self.backbone
            .iter_mut()
            .chain(
                self.text_encoders
                    .iter_mut()
                    .flat_map(|t| t.encoders.iter_mut()),
            )
            .chain(self.codec.iter_mut())
    }
}

/// A checkpoint materialized in memory
#[derive(Debug)]
pub struct LoadedModel {
    family: ArchitectureFamily,
    sub_models: SubModels,
    path: PathBuf,
    identity: String,
    pub(crate) applied_adapters: Vec<AdapterInput>,
}

impl LoadedModel {
    /// Assemble a model from already-split parts
    #[must_use]
    pub fn new(family: ArchitectureFamily, sub_models: SubModels, path: PathBuf) -> Self {
        let identity = path.to_string_lossy().into_owned();
        Self {
            family,
            sub_models,
            path,
            identity,
            applied_adapters: Vec::new(),
        }
    }

    #[must_use]
    pub fn family(&self) -> ArchitectureFamily {
        self.family
    }

    #[must_use]
    pub fn sub_models(&self) -> &SubModels {
        &self.sub_models
    }

    pub(crate) fn sub_models_mut(&mut self) -> &mut SubModels {
        &mut self.sub_models
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key used to decide whether a reload is needed
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Adapters composed into this model, in application order
    #[must_use]
    pub fn applied_adapters(&self) -> &[AdapterInput] {
        &self.applied_adapters
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.sub_models.components().map(Component::parameter_count).sum()
    }
}

/// Anything that can turn a checkpoint path into a [`LoadedModel`]
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, path: &Path) -> Result<LoadedModel>;
}

/// Reads checkpoint containers onto a candle device
#[derive(Debug, Clone)]
pub struct CheckpointLoader {
    device: Device,
}

impl CheckpointLoader {
    #[must_use]
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl ModelLoader for CheckpointLoader {
    fn load(&self, path: &Path) -> Result<LoadedModel> {
        let tensors = read_tensors(path, &self.device)?;

        let Some(family) = ArchitectureFamily::detect(&tensors) else {
            if tracing::enabled!(tracing::Level::DEBUG) {
                let sample: Vec<&str> = tensors.keys().take(8).map(String::as_str).collect();
                tracing::debug!("No family matched {}; first keys: {sample:?}", path.display());
            }
            return Err(VaultError::UnknownArchitecture {
                path: path.to_path_buf(),
            });
        };

        let sub_models = family.split(tensors);
        tracing::info!(
            "Loaded {family} checkpoint {} (backbone: {}, text encoders: {}, codec: {})",
            path.display(),
            presence(sub_models.backbone.as_ref().map(Component::len)),
            presence(sub_models.text_encoders.as_ref().map(TextEncoders::len)),
            presence(sub_models.codec.as_ref().map(Component::len)),
        );

        Ok(LoadedModel::new(family, sub_models, path.to_path_buf()))
    }
}

fn presence(count: Option<usize>) -> String {
    count.map_or_else(|| "absent".to_string(), |n| n.to_string())
}

/// Read every tensor of a `.safetensors` or pickled checkpoint onto `device`
pub(crate) fn read_tensors(path: &Path, device: &Device) -> Result<BTreeMap<String, Tensor>> {
    if !path.is_file() {
        return Err(VaultError::NotFound(format!(
            "Checkpoint file {}",
            path.display()
        )));
    }

    let tensor_error = |source: candle_core::Error| VaultError::Tensor {
        path: path.to_path_buf(),
        source,
    };

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("ckpt" | "pt" | "pth" | "bin") => {
            let mut entries = candle_core::pickle::read_all(path).map_err(tensor_error)?;
            // Training checkpoints nest the weights under a `state_dict` entry
            if entries.is_empty() {
                entries = candle_core::pickle::read_all_with_key(path, Some(STATE_DICT_KEY))
                    .map_err(tensor_error)?;
            }

            let mut tensors = BTreeMap::new();
            for (key, tensor) in entries {
                tensors.insert(key, tensor.to_device(device).map_err(tensor_error)?);
            }
            Ok(tensors)
        }
        _ => Ok(candle_core::safetensors::load(path, device)
            .map_err(tensor_error)?
            .into_iter()
            .collect()),
    }
}
