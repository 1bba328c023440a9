use crate::error::{Result, VaultError};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Cache roots, one per artifact class
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PathsConfig {
    #[serde(default = "default_checkpoints")]
    pub checkpoints: PathBuf,
    /// Refiners share the checkpoint directory unless set
    pub refiners: Option<PathBuf>,
    #[serde(default = "default_loras")]
    pub loras: PathBuf,
    #[serde(default = "default_embeddings")]
    pub embeddings: PathBuf,
    #[serde(default = "default_auxiliary")]
    pub auxiliary: PathBuf,
    #[serde(default = "default_presets")]
    pub presets: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    #[serde(default)]
    pub offline: bool,
    #[serde(default = "default_min_free_space_mb")]
    pub min_free_space_mb: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_true")]
    pub show_progress: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct RuntimeConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_preset")]
    pub default_preset: String,
    #[serde(default)]
    pub fail_on_adapter_mismatch: bool,
}

// Default value functions
fn data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("modelvault")
}
fn default_checkpoints() -> PathBuf {
    data_root().join("checkpoints")
}
fn default_loras() -> PathBuf {
    data_root().join("loras")
}
fn default_embeddings() -> PathBuf {
    data_root().join("embeddings")
}
fn default_auxiliary() -> PathBuf {
    data_root().join("auxiliary")
}
fn default_presets() -> PathBuf {
    data_root().join("presets")
}
fn default_min_free_space_mb() -> u64 {
    1024
}
fn default_user_agent() -> String {
    format!("modelvault/{}", env!("CARGO_PKG_VERSION"))
}
fn default_true() -> bool {
    true
}
fn default_device() -> String {
    "cpu".to_string()
}
fn default_preset() -> String {
    "default".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoints: default_checkpoints(),
            refiners: None,
            loras: default_loras(),
            embeddings: default_embeddings(),
            auxiliary: default_auxiliary(),
            presets: default_presets(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            offline: false,
            min_free_space_mb: default_min_free_space_mb(),
            user_agent: default_user_agent(),
            show_progress: default_true(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            default_preset: default_preset(),
            fail_on_adapter_mismatch: false,
        }
    }
}

impl PathsConfig {
    /// Directory holding every class under one root, handy for tests and portable installs
    #[must_use]
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            checkpoints: root.join("checkpoints"),
            refiners: None,
            loras: root.join("loras"),
            embeddings: root.join("embeddings"),
            auxiliary: root.join("auxiliary"),
            presets: root.join("presets"),
        }
    }

    #[must_use]
    pub fn refiners(&self) -> &Path {
        self.refiners.as_deref().unwrap_or(&self.checkpoints)
    }
}

impl RuntimeConfig {
    /// Parse the device string (`cpu`, `cuda`, `cuda:1`, `metal`)
    ///
    /// GPU devices fall back to the CPU when candle was built without support.
    pub fn device(&self) -> Result<Device> {
        let name = self.device.trim().to_ascii_lowercase();
        let (kind, ordinal) = match name.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    VaultError::Config(format!("Invalid device ordinal in '{}'", self.device))
                })?;
                (kind, ordinal)
            }
            None => (name.as_str(), 0),
        };

        let device = match kind {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Device::cuda_if_available(ordinal),
            "metal" if candle_core::utils::metal_is_available() => Device::new_metal(ordinal),
            "metal" => Ok(Device::Cpu),
            _ => {
                return Err(VaultError::Config(format!(
                    "Unknown device: {}. Must be 'cpu', 'cuda[:N]' or 'metal[:N]'",
                    self.device
                )))
            }
        }
        .map_err(|e| VaultError::Config(format!("Failed to open device {}: {e}", self.device)))?;

        Ok(device)
    }
}

impl Config {
    /// Load from the default location, falling back to embedded defaults
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load a specific TOML file; missing keys take their defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            VaultError::Config(format!("Failed to parse {}: {e}", path.display()))
        })
    }
}

/// `$XDG_CONFIG_HOME/modelvault/config.toml`, else the platform config dir
pub fn config_path() -> Result<PathBuf> {
    let config_dir = if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config)
    } else {
        dirs::config_dir()
            .ok_or_else(|| VaultError::Config("Cannot determine config directory".to_string()))?
    };

    Ok(config_dir.join("modelvault").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [download]
            offline = true
            "#,
        )
        .unwrap();

        assert!(config.download.offline);
        assert_eq!(config.download.min_free_space_mb, 1024);
        assert_eq!(config.runtime.device, "cpu");
        assert_eq!(config.runtime.default_preset, "default");
        assert!(!config.runtime.fail_on_adapter_mismatch);
    }

    #[test]
    fn test_refiners_default_to_checkpoints() {
        let paths = PathsConfig::rooted_at(Path::new("/srv/models"));
        assert_eq!(paths.refiners(), Path::new("/srv/models/checkpoints"));

        let paths = PathsConfig {
            refiners: Some(PathBuf::from("/srv/refiners")),
            ..paths
        };
        assert_eq!(paths.refiners(), Path::new("/srv/refiners"));
    }

    #[test]
    fn test_device_parsing() {
        let runtime = RuntimeConfig::default();
        assert!(runtime.device().unwrap().is_cpu());

        let runtime = RuntimeConfig {
            device: "tpu".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(runtime.device().is_err());

        let runtime = RuntimeConfig {
            device: "cuda:x".to_string(),
            ..RuntimeConfig::default()
        };
        assert!(runtime.device().is_err());

        if !candle_core::utils::metal_is_available() {
            let runtime = RuntimeConfig {
                device: "metal".to_string(),
                ..RuntimeConfig::default()
            };
            assert!(runtime.device().unwrap().is_cpu());
        }
    }

    #[test]
    #[serial]
    fn test_config_path_respects_xdg() {
        let temp_dir = TempDir::new().unwrap();
        let original = std::env::var("XDG_CONFIG_HOME").ok();
        std::env::set_var("XDG_CONFIG_HOME", temp_dir.path());

        let path = config_path().unwrap();
        assert_eq!(path, temp_dir.path().join("modelvault/config.toml"));

        // Missing file falls back to defaults
        let config = Config::load().unwrap();
        assert!(!config.download.offline);

        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[runtime]\ndefault_preset = \"lightning\"\n").unwrap();
        let config = Config::load().unwrap();
        assert_eq!(config.runtime.default_preset, "lightning");

        match original {
            Some(val) => std::env::set_var("XDG_CONFIG_HOME", val),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "[paths\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }
}
