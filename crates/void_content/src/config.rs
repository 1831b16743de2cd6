//! Configuration
//!
//! Plain serde structs; every field has a default so partial JSON works.

use serde::{Deserialize, Serialize};

use crate::error::{ContentError, ContentResult};

/// Placeholder replaced by the asset id in the `RepositoryConfig` templates
pub const ID_PLACEHOLDER: &str = "{id}";

/// Load coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Progress polling interval in milliseconds
    pub progress_interval_ms: u64,
    /// Log tag
    pub log_tag: String,
    /// Enable logging
    pub log_enabled: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 50,
            log_tag: "AssetProvider".to_string(),
            log_enabled: true,
        }
    }
}

/// Asset repository configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Repository name (service id and log tag)
    pub name: String,
    /// Address template, `{id}` is replaced by the asset id
    pub address_format: String,
    /// Template for the content key whose dependencies `Prefetcher` sizes
    /// and downloads before loading an id
    pub dependency_format: String,
    /// Ids loaded by `preload_configured` / service start
    pub preload_ids: Vec<String>,
    /// Enable logging
    pub log_enabled: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            name: "assets".to_string(),
            address_format: "{id}/bundle-data.asset".to_string(),
            dependency_format: ID_PLACEHOLDER.to_string(),
            preload_ids: Vec::new(),
            log_enabled: true,
        }
    }
}

impl RepositoryConfig {
    /// Create a config with the given address template
    pub fn with_format(address_format: impl Into<String>) -> Self {
        Self {
            address_format: address_format.into(),
            ..Default::default()
        }
    }

    /// Parse from JSON and validate
    pub fn from_json(json: &str) -> ContentResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject templates that cannot distinguish ids
    pub fn validate(&self) -> ContentResult<()> {
        for (field, template) in [
            ("address_format", &self.address_format),
            ("dependency_format", &self.dependency_format),
        ] {
            if !template.contains(ID_PLACEHOLDER) {
                return Err(ContentError::InvalidConfig(format!(
                    "{} '{}' does not contain {}",
                    field, template, ID_PLACEHOLDER
                )));
            }
        }
        if self.name.trim().is_empty() {
            return Err(ContentError::InvalidConfig("name is empty".to_string()));
        }
        Ok(())
    }

    /// Backend address for an asset id
    pub fn address_for(&self, id: &str) -> String {
        self.address_format.replace(ID_PLACEHOLDER, id)
    }

    /// Content key whose dependencies are fetched for an asset id
    pub fn dependency_key_for(&self, id: &str) -> String {
        self.dependency_format.replace(ID_PLACEHOLDER, id)
    }
}

/// Content downloader configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Progress polling interval in milliseconds
    pub progress_interval_ms: u64,
    /// Log tag
    pub log_tag: String,
    /// Enable logging
    pub log_enabled: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 50,
            log_tag: "ContentDownloader".to_string(),
            log_enabled: true,
        }
    }
}
