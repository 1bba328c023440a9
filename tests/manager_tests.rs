mod common;

use common::{sd1_bytes, MapTransport};
use modelvault::config::{Config, PathsConfig};
use modelvault::models::registry::RefreshOutcome;
use modelvault::models::store::ArtifactClass;
use modelvault::models::ModelManager;
use modelvault::VaultError;
use std::collections::HashMap;
use tempfile::TempDir;

const MODEL_URL: &str = "https://example.com/shared.safetensors";

fn config(temp_dir: &TempDir) -> Config {
    let mut config = Config {
        paths: PathsConfig::rooted_at(temp_dir.path()),
        ..Config::default()
    };
    config.download.min_free_space_mb = 0;
    config.download.show_progress = false;
    config
}

fn write_preset(temp_dir: &TempDir, name: &str, json: &str) {
    let dir = temp_dir.path().join("presets");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{name}.json")), json).unwrap();
}

fn setup() -> (TempDir, MapTransport) {
    let temp_dir = TempDir::new().unwrap();
    let shared = format!(
        r#"{{
            "default_model": "shared.safetensors",
            "default_loras": [["None", 1.0]],
            "checkpoint_downloads": {{"shared.safetensors": "{MODEL_URL}"}}
        }}"#
    );
    write_preset(&temp_dir, "default", &shared);
    write_preset(&temp_dir, "realistic", &shared);

    let transport = MapTransport::new(HashMap::from([(
        MODEL_URL.to_string(),
        sd1_bytes(&temp_dir),
    )]));
    (temp_dir, transport)
}

#[tokio::test]
async fn test_presets_sharing_a_file_download_it_once() {
    let (temp_dir, transport) = setup();
    let manager = ModelManager::with_transport(&config(&temp_dir), transport.clone()).unwrap();

    let first = manager.resolve(Some("default")).unwrap();
    manager.download(&first).await.unwrap();
    let after_first = transport.calls();

    let second = manager.resolve(Some("realistic")).unwrap();
    manager.download(&second).await.unwrap();

    assert_eq!(after_first, first.downloads().len());
    assert_eq!(transport.calls(), after_first);
    assert!(manager
        .store()
        .exists(ArtifactClass::Checkpoint, "shared.safetensors")
        .unwrap());
}

#[tokio::test]
async fn test_activate_loads_then_reuses_model() {
    let (temp_dir, transport) = setup();
    let manager = ModelManager::with_transport(&config(&temp_dir), transport.clone()).unwrap();

    let first = manager.activate(None).await.unwrap();
    assert_eq!(first.base.outcome, RefreshOutcome::Loaded);
    let calls = transport.calls();

    let second = manager.activate(Some("realistic")).await.unwrap();
    assert_eq!(second.base.outcome, RefreshOutcome::Unchanged);
    assert_eq!(transport.calls(), calls);

    let active = manager.registry().begin_use().await;
    let base = active.base().unwrap();
    assert_eq!(base.family().to_string(), "SD 1.x");
    assert!(base.sub_models().backbone.is_some());
    assert!(active.refiner().is_none());
}

#[tokio::test]
async fn test_offline_mode_refuses_missing_files() {
    let (temp_dir, transport) = setup();
    let mut config = config(&temp_dir);
    config.download.offline = true;
    let manager = ModelManager::with_transport(&config, transport.clone()).unwrap();

    let result = manager.activate(None).await;

    assert!(matches!(result, Err(VaultError::Fetch { .. })));
    assert_eq!(transport.calls(), 0);
    assert!(manager.registry().active_identity(modelvault::models::Role::Base).await.is_none());
}

#[tokio::test]
async fn test_unknown_preset_suggests_closest_name() {
    let (temp_dir, transport) = setup();
    let manager = ModelManager::with_transport(&config(&temp_dir), transport).unwrap();

    assert_eq!(
        manager.preset_names().unwrap(),
        vec!["default".to_string(), "realistic".to_string()]
    );

    let err = manager.resolve(Some("realstic")).unwrap_err();
    assert!(err.to_string().contains("Did you mean 'realistic'?"));
}
