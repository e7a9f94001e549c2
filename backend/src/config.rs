use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::Device;

pub const DEFAULT_CONFIG_PATH: &str = "config/server.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
    /// `auto`, `cpu`, `cuda` or `cuda:N`.
    pub device: String,
    pub max_upload_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            model_path: PathBuf::from("deepfake_vit_final.pth"),
            device: "auto".to_string(),
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl AppConfig {
    /// Reads the YAML file named by `APP_CONFIG` (or `config/server.yaml` when
    /// present), then applies environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("APP_CONFIG").ok().map(PathBuf::from);
        let path = explicit.or_else(|| {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            default.is_file().then_some(default)
        });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded configuration from {}", path.display());
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Applies `HOST`, `PORT`, `MODEL_PATH`, `DEVICE` and `MAX_UPLOAD_BYTES`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse_value("PORT", &port)?;
        }
        if let Some(model_path) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(model_path);
        }
        if let Some(device) = lookup("DEVICE") {
            self.device = device;
        }
        if let Some(limit) = lookup("MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = parse_value("MAX_UPLOAD_BYTES", &limit)?;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolves the configured device. CUDA falls back to the CPU when no
    /// GPU is visible.
    pub fn device(&self) -> Result<Device, ConfigError> {
        let setting = self.device.trim().to_ascii_lowercase();
        let requested = match setting.as_str() {
            "auto" => return Ok(Device::cuda_if_available()),
            "cpu" => return Ok(Device::Cpu),
            "cuda" => 0,
            other => other
                .strip_prefix("cuda:")
                .and_then(|index| index.parse::<usize>().ok())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "DEVICE".to_string(),
                    value: self.device.clone(),
                })?,
        };

        if tch::Cuda::is_available() {
            Ok(Device::Cuda(requested))
        } else {
            log::warn!(
                "CUDA device {} requested but CUDA is not available, using cpu",
                requested
            );
            Ok(Device::Cpu)
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_environment() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:5000");
        assert_eq!(config.model_path, PathBuf::from("deepfake_vit_final.pth"));
        assert_eq!(config.max_upload_bytes, 52_428_800);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AppConfig::from_yaml_str("port: 8081\nmodel_path: models/vit.safetensors\n")
            .unwrap();
        assert_eq!(config.port, 8081);
        assert_eq!(config.model_path, PathBuf::from("models/vit.safetensors"));
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.device, "auto");
    }

    #[test]
    fn empty_yaml_is_default() {
        assert_eq!(AppConfig::from_yaml_str("  \n").unwrap(), AppConfig::default());
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        assert!(matches!(
            AppConfig::from_yaml_str("port: [not, a, port]"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = AppConfig::from_yaml_str("port: 8081").unwrap();
        config
            .apply_overrides(lookup(&[
                ("PORT", "9000"),
                ("HOST", "127.0.0.1"),
                ("DEVICE", "cpu"),
                ("MAX_UPLOAD_BYTES", "1024"),
            ]))
            .unwrap();
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
        assert_eq!(config.max_upload_bytes, 1024);
        assert_eq!(config.device().unwrap(), Device::Cpu);
    }

    #[test]
    fn invalid_port_is_reported() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(lookup(&[("PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "PORT"));
    }

    #[test]
    fn device_settings_are_parsed() {
        let mut config = AppConfig {
            device: "CPU".to_string(),
            ..Default::default()
        };
        assert_eq!(config.device().unwrap(), Device::Cpu);

        config.device = "tpu".to_string();
        assert!(config.device().is_err());

        config.device = "cuda:x".to_string();
        assert!(config.device().is_err());

        config.device = "cuda:1".to_string();
        let resolved = config.device().unwrap();
        if tch::Cuda::is_available() {
            assert_eq!(resolved, Device::Cuda(1));
        } else {
            assert_eq!(resolved, Device::Cpu);
        }
    }
}
