use std::fs;
use std::path::PathBuf;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::UploaderError;

pub const DEFAULT_CONFIG_NAME: &str = "lims-ru.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    pub username: String,
    pub password: String,
    /// Minutes a freshly discovered run is held in DELAYED before its first
    /// real attempt. 0 disables the delay loop.
    #[serde(default, rename = "delayMinutes")]
    pub delay_minutes: u64,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Explicit path wins; otherwise the user config dir, then the current
    /// directory.
    pub fn resolve(path: Option<&str>) -> Result<Config, UploaderError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::locate()?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| UploaderError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| UploaderError::ConfigParse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn locate() -> Result<PathBuf, UploaderError> {
        let mut searched = Vec::new();
        if let Some(dirs) = BaseDirs::new() {
            let candidate = dirs
                .config_dir()
                .join("lims-run-uploader")
                .join(DEFAULT_CONFIG_NAME);
            if candidate.exists() {
                return Ok(candidate);
            }
            searched.push(candidate.display().to_string());
        }
        let cwd_candidate = PathBuf::from(DEFAULT_CONFIG_NAME);
        if cwd_candidate.exists() {
            return Ok(cwd_candidate);
        }
        searched.push(format!("./{DEFAULT_CONFIG_NAME}"));
        Err(UploaderError::MissingConfig(searched.join(", ")))
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), UploaderError> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(UploaderError::ConfigValue {
                field: "baseUrl".to_string(),
                message: format!("must start with http:// or https://, got {:?}", self.base_url),
            });
        }
        for (field, value) in [
            ("clientId", &self.client_id),
            ("clientSecret", &self.client_secret),
            ("username", &self.username),
            ("password", &self.password),
        ] {
            if value.trim().is_empty() {
                return Err(UploaderError::ConfigValue {
                    field: field.to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Base URL with any trailing slash removed, so joins stay predictable.
    pub fn api_root(&self) -> String {
        self.base_url.trim_end_matches('/').to_string()
    }
}
