use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::PrepError;
use crate::nerdm::DEFAULT_ARK_NAAN;
use crate::transform::DEFAULT_PDR_SERVER;

pub const DEFAULT_CONFIG_FILE: &str = "prepupd.json";
pub const DEFAULT_BAGGER_METADATA_FILE: &str = "metadata/__bagger-prepper.json";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// The config file as written.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub headbag_cache: Option<Utf8PathBuf>,
    #[serde(default)]
    pub store_dir: Option<Utf8PathBuf>,
    #[serde(default)]
    pub distrib_service: ServiceConfig,
    #[serde(default)]
    pub metadata_service: ServiceConfig,
    #[serde(default)]
    pub pdr_server: Option<String>,
    #[serde(default)]
    pub ark_naan: Option<String>,
    #[serde(default)]
    pub bagger_metadata_file: Option<Utf8PathBuf>,
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub service_endpoint: Option<String>,
}

/// Config with defaults applied and required settings checked.
#[derive(Debug, Clone)]
pub struct PrepConfig {
    pub headbag_cache: Utf8PathBuf,
    pub store_dir: Option<Utf8PathBuf>,
    pub distrib_endpoint: Option<String>,
    pub metadata_endpoint: Option<String>,
    pub pdr_server: String,
    pub ark_naan: String,
    /// relative to the root of a working bag
    pub bagger_metadata_file: Utf8PathBuf,
    pub http_timeout: Duration,
}

impl PrepConfig {
    /// A config with every optional setting at its default.
    pub fn with_cache(headbag_cache: &Utf8Path) -> Self {
        Self {
            headbag_cache: headbag_cache.to_path_buf(),
            store_dir: None,
            distrib_endpoint: None,
            metadata_endpoint: None,
            pdr_server: DEFAULT_PDR_SERVER.to_string(),
            ark_naan: DEFAULT_ARK_NAAN.to_string(),
            bagger_metadata_file: Utf8PathBuf::from(DEFAULT_BAGGER_METADATA_FILE),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<PrepConfig, PrepError> {
        let config_path = Utf8PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));

        if path.is_none() && !config_path.as_std_path().exists() {
            return Err(PrepError::Config(format!(
                "no config file given and {DEFAULT_CONFIG_FILE} not found"
            )));
        }

        let content = fs::read_to_string(config_path.as_std_path())
            .map_err(|_| PrepError::ConfigRead(config_path.clone()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|err| PrepError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<PrepConfig, PrepError> {
        let headbag_cache = config
            .headbag_cache
            .filter(|dir| !dir.as_str().is_empty())
            .ok_or_else(|| PrepError::Config("missing property: headbag_cache".to_string()))?;

        let bagger_metadata_file = config
            .bagger_metadata_file
            .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_BAGGER_METADATA_FILE));
        if bagger_metadata_file.is_absolute() {
            return Err(PrepError::Config(format!(
                "bagger_metadata_file must be relative to the bag: {bagger_metadata_file}"
            )));
        }

        Ok(PrepConfig {
            headbag_cache,
            store_dir: config.store_dir,
            distrib_endpoint: non_empty(config.distrib_service.service_endpoint),
            metadata_endpoint: non_empty(config.metadata_service.service_endpoint),
            pdr_server: non_empty(config.pdr_server)
                .unwrap_or_else(|| DEFAULT_PDR_SERVER.to_string()),
            ark_naan: non_empty(config.ark_naan).unwrap_or_else(|| DEFAULT_ARK_NAAN.to_string()),
            bagger_metadata_file,
            http_timeout: Duration::from_secs(
                config.http_timeout_secs.unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
            ),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
