//! Server configuration: an optional TOML file overridden by the command
//! line.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use sms_spam::{tch, ModelArtifacts, Truncation};

/// Unable to read the configuration.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file can't be read.
    #[snafu(display("Unable to read {path}"))]
    Read {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: std::io::Error,
    },
    /// The file is not a valid configuration.
    #[snafu(display("Unable to parse {path}"))]
    Parse {
        /// Path to the file.
        path: Utf8PathBuf,
        /// Source error.
        source: toml::de::Error,
    },
}

/// Where to listen and what to serve.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub listen: String,
    /// Listen port.
    pub port: u16,
    /// Directory with the trained model.
    pub artifacts: Utf8PathBuf,
    /// Which end of long messages is cut off.
    pub truncation: Truncation,
    /// CUDA device index. CPU is used when absent.
    pub cuda: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0".into(),
            port: 4100,
            artifacts: "data".into(),
            truncation: Truncation::Pre,
            cuda: None,
        }
    }
}

impl ServerConfig {
    /// Reads the configuration file.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).context(ReadSnafu { path })?;
        toml::from_str(&data).context(ParseSnafu { path })
    }

    /// `host:port` to bind to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.listen, self.port)
    }

    /// The model location.
    pub fn model_artifacts(&self) -> ModelArtifacts {
        ModelArtifacts::new(self.artifacts.clone())
    }

    /// The torch device.
    pub fn device(&self) -> tch::Device {
        self.cuda.map_or(tch::Device::Cpu, tch::Device::Cuda)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.address(), "0.0.0.0:4100");
        assert_eq!(config.device(), tch::Device::Cpu);
    }

    #[test]
    fn partial_file() {
        let config: ServerConfig = toml::from_str(
            r#"
port = 8080
artifacts = "/srv/model"
truncation = "post"
"#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.artifacts, Utf8PathBuf::from("/srv/model"));
        assert_eq!(config.truncation, Truncation::Post);
    }

    #[test]
    fn missing_file() {
        let error = ServerConfig::load(Utf8Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(error, ConfigError::Read { .. }));
    }
}
