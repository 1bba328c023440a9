#![allow(dead_code)]

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use modelvault::config::PathsConfig;
use modelvault::error::TransportError;
use modelvault::models::checkpoint::{CheckpointLoader, LoadedModel, ModelLoader};
use modelvault::models::store::ArtifactStore;
use modelvault::models::Transport;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const PROJ_IN: &str = "model.diffusion_model.input_blocks.1.1.proj_in.weight";

pub fn store(temp_dir: &TempDir) -> Arc<ArtifactStore> {
    Arc::new(ArtifactStore::new(&PathsConfig::rooted_at(temp_dir.path())).unwrap())
}

fn zeros(shape: &[usize]) -> Tensor {
    Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
}

fn save(path: &Path, tensors: Vec<(&str, Tensor)>) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let map: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(k, t)| (k.to_string(), t))
        .collect();
    candle_core::safetensors::save(&map, path).unwrap();
}

fn sd1_tensors() -> Vec<(&'static str, Tensor)> {
    vec![
        ("model.diffusion_model.input_blocks.0.0.weight", zeros(&[4, 4])),
        (
            "model.diffusion_model.input_blocks.1.1.transformer_blocks.0.attn2.to_k.weight",
            zeros(&[2, 768]),
        ),
        (
            PROJ_IN,
            Tensor::from_vec(vec![1f32, 2., 3., 4.], (2, 2), &Device::Cpu).unwrap(),
        ),
        (
            "cond_stage_model.transformer.text_model.encoder.layers.0.self_attn.q_proj.weight",
            zeros(&[2, 2]),
        ),
        ("first_stage_model.decoder.conv_in.weight", zeros(&[2, 2])),
    ]
}

/// A minimal SD 1.x checkpoint
pub fn write_sd1(path: &Path) {
    save(path, sd1_tensors());
}

pub fn sd1_bytes(temp_dir: &TempDir) -> Vec<u8> {
    let path = temp_dir.path().join("fixtures/sd1.safetensors");
    write_sd1(&path);
    std::fs::read(path).unwrap()
}

/// A minimal SDXL refiner checkpoint
pub fn write_refiner(path: &Path) {
    save(
        path,
        vec![
            ("model.diffusion_model.input_blocks.0.0.weight", zeros(&[4, 4])),
            ("model.diffusion_model.label_emb.0.0.weight", zeros(&[4, 4])),
            (
                "model.diffusion_model.input_blocks.4.1.transformer_blocks.0.attn2.to_k.weight",
                zeros(&[2, 1280]),
            ),
            (
                "conditioner.embedders.0.model.transformer.resblocks.0.mlp.c_fc.weight",
                zeros(&[2, 2]),
            ),
        ],
    );
}

/// A rank-1 kohya LoRA adding `[[1, 1], [1, 1]]` to the SD 1.x `proj_in`
pub fn write_proj_in_lora(path: &Path) {
    save(
        path,
        vec![
            (
                "lora_unet_input_blocks_1_1_proj_in.lora_down.weight",
                Tensor::from_vec(vec![1f32, 1.], (1, 2), &Device::Cpu).unwrap(),
            ),
            (
                "lora_unet_input_blocks_1_1_proj_in.lora_up.weight",
                Tensor::from_vec(vec![1f32, 1.], (2, 1), &Device::Cpu).unwrap(),
            ),
        ],
    );
}

/// A LoRA whose only target does not exist in any fixture
pub fn write_foreign_lora(path: &Path) {
    save(
        path,
        vec![
            (
                "lora_unet_middle_block_9_proj_out.lora_down.weight",
                zeros(&[1, 2]),
            ),
            ("lora_unet_middle_block_9_proj_out.lora_up.weight", zeros(&[2, 1])),
        ],
    );
}

pub fn proj_in(model: &LoadedModel) -> Vec<f32> {
    model
        .sub_models()
        .backbone
        .as_ref()
        .unwrap()
        .get("input_blocks.1.1.proj_in.weight")
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

/// Checkpoint loader that counts how often it reads a file
pub struct CountingLoader {
    inner: CheckpointLoader,
    loads: Arc<AtomicUsize>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self {
            inner: CheckpointLoader::new(Device::Cpu),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for CountingLoader {
    fn load(&self, path: &Path) -> modelvault::Result<LoadedModel> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(path)
    }
}

/// Transport serving fixed bodies by URL; unknown URLs get a small stub body
#[derive(Clone, Default)]
pub struct MapTransport {
    bodies: Arc<HashMap<String, Vec<u8>>>,
    calls: Arc<AtomicUsize>,
}

impl MapTransport {
    pub fn new(bodies: HashMap<String, Vec<u8>>) -> Self {
        Self {
            bodies: Arc::new(bodies),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MapTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let body = self
            .bodies
            .get(url)
            .cloned()
            .unwrap_or_else(|| b"stub".to_vec());
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }
}
