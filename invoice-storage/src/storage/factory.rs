//! Backend selection from configuration

use super::local::LocalBackend;
use super::remote::{SharePointBackend, CHUNK_ALIGNMENT};
use super::traits::SharedBackend;
use super::types::{StorageError, StorageResult};
use crate::config::StorageSettings;
use crate::validation::kind_for_extension;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Storage provider selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    /// Local filesystem
    Local,
    /// SharePoint document library
    SharePoint,
    /// Amazon S3 (recognised, not implemented)
    S3,
    /// Azure Blob Storage (recognised, not implemented)
    Azure,
}

impl StorageProvider {
    /// Get the provider as a string (lowercase)
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::SharePoint => "sharepoint",
            Self::S3 => "s3",
            Self::Azure => "azure",
        }
    }

    /// Whether a backend exists for this provider
    #[must_use]
    pub const fn is_implemented(&self) -> bool {
        matches!(self, Self::Local | Self::SharePoint)
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageProvider {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "filesystem" => Ok(Self::Local),
            "sharepoint" => Ok(Self::SharePoint),
            "s3" => Ok(Self::S3),
            "azure" => Ok(Self::Azure),
            _ => Err(StorageError::Configuration(format!(
                "unknown storage provider '{s}'"
            ))),
        }
    }
}

/// A setting that is missing or invalid
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    /// Dotted config key, e.g. `storage.sharepoint.site_id`
    pub key: String,
    /// What is wrong with it
    pub message: String,
}

impl ConfigIssue {
    fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Checks the settings the selected provider needs
///
/// Returns every problem found instead of stopping at the first, so startup
/// and health checks can report them together. An empty list means the
/// settings are usable.
#[must_use]
pub fn validate_settings(settings: &StorageSettings) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if settings.max_file_size == 0 {
        issues.push(ConfigIssue::new("storage.max_file_size", "must be greater than zero"));
    }
    if settings.max_files_per_invoice == 0 {
        issues.push(ConfigIssue::new(
            "storage.max_files_per_invoice",
            "must be greater than zero",
        ));
    }
    if let Some(list) = &settings.allowed_extensions {
        for ext in list {
            let ext = ext.trim().trim_start_matches('.').to_lowercase();
            if kind_for_extension(&ext).is_none() {
                issues.push(ConfigIssue::new(
                    "storage.allowed_extensions",
                    format!("'{ext}' is not a supported attachment type"),
                ));
            }
        }
    }

    match settings.provider.parse::<StorageProvider>() {
        Ok(provider) => issues.extend(provider_issues(settings, provider)),
        Err(e) => issues.push(ConfigIssue::new("storage.provider", e.to_string())),
    }

    issues
}

/// Problems with the settings of one provider only
fn provider_issues(settings: &StorageSettings, provider: StorageProvider) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    match provider {
        StorageProvider::Local => {
            let base = &settings.local.base_dir;
            if base.as_os_str().is_empty() {
                issues.push(ConfigIssue::new("storage.local.base_dir", "is required"));
            } else if base.exists() && !base.is_dir() {
                issues.push(ConfigIssue::new(
                    "storage.local.base_dir",
                    format!("{} is not a directory", base.display()),
                ));
            }
        }
        StorageProvider::SharePoint => {
            let sp = &settings.sharepoint;
            for (key, value) in [
                ("storage.sharepoint.tenant_id", &sp.tenant_id),
                ("storage.sharepoint.client_id", &sp.client_id),
                ("storage.sharepoint.client_secret", &sp.client_secret),
                ("storage.sharepoint.site_id", &sp.site_id),
            ] {
                if value.as_deref().is_none_or(|v| v.trim().is_empty()) {
                    issues.push(ConfigIssue::new(key, "is required"));
                }
            }
            if sp.chunk_size == 0 || sp.chunk_size % CHUNK_ALIGNMENT as u64 != 0 {
                issues.push(ConfigIssue::new(
                    "storage.sharepoint.chunk_size",
                    format!("must be a positive multiple of {CHUNK_ALIGNMENT}"),
                ));
            }
        }
        StorageProvider::S3 | StorageProvider::Azure => {
            issues.push(ConfigIssue::new(
                "storage.provider",
                format!("provider '{provider}' is not implemented yet"),
            ));
        }
    }

    issues
}

/// Builds the configured backend
///
/// # Errors
///
/// Returns `Configuration` if the provider is unknown or not implemented, or
/// a setting it requires is missing. General upload limits are not checked
/// here; see [`validate_settings`].
///
/// # Examples
///
/// ```rust,no_run
/// use invoice_storage::config::StorageConfig;
/// use invoice_storage::storage::create_backend;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = StorageConfig::load()?;
/// let backend = create_backend(&config.storage)?;
/// println!("using {} storage", backend.kind());
/// # Ok(())
/// # }
/// ```
pub fn create_backend(settings: &StorageSettings) -> StorageResult<SharedBackend> {
    let provider: StorageProvider = settings.provider.parse()?;

    let backend: SharedBackend = match provider {
        StorageProvider::Local => Arc::new(LocalBackend::new(&settings.local.base_dir)?),
        StorageProvider::SharePoint => {
            let issues = provider_issues(settings, provider);
            if !issues.is_empty() {
                let list = issues
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(StorageError::Configuration(list));
            }
            Arc::new(SharePointBackend::from_settings(&settings.sharepoint)?)
        }
        StorageProvider::S3 | StorageProvider::Azure => {
            return Err(StorageError::Configuration(format!(
                "storage provider '{provider}' is not implemented yet"
            )));
        }
    };

    info!(provider = %provider, "storage backend ready");
    Ok(backend)
}
