//! Configuration for attachment storage
//!
//! Configuration is loaded from multiple sources with clear precedence:
//!
//! 1. Environment variables (highest priority, `INVOICE_STORAGE_` prefix, `__` for nesting)
//! 2. Legacy flat environment variables (`STORAGE_PROVIDER`, `UPLOAD_DIR`, ...)
//! 3. `./config.toml` (development)
//! 4. `~/.config/invoice-storage/config.toml` (user config, XDG)
//! 5. Hardcoded defaults (fallback)
//!
//! Environment variable format: `INVOICE_STORAGE_SECTION__FIELD_NAME`
//! - Use `__` (double underscore) to separate nested sections
//! - Example: `INVOICE_STORAGE_STORAGE__SHAREPOINT__SITE_ID=contoso.sharepoint.com,...`
//!
//! The embedding application loads configuration once and hands the relevant
//! sections to constructors; nothing in this crate reads the environment on
//! its own.
//!
//! # Example Configuration
//!
//! ```toml
//! # config.toml
//! [storage]
//! provider = "sharepoint"
//! max_file_size = 10485760
//! max_files_per_invoice = 10
//! allowed_extensions = ["pdf", "png", "jpg"]
//!
//! [storage.local]
//! base_dir = "./uploads"
//!
//! [storage.sharepoint]
//! tenant_id = "contoso.onmicrosoft.com"
//! client_id = "00000000-0000-0000-0000-000000000000"
//! client_secret = "..."
//! site_id = "contoso.sharepoint.com,1111,2222"
//! base_folder = "Invoice Attachments"
//!
//! [cleanup]
//! retention_days = 30
//! batch_size = 50
//! ```
//!
//! # Usage
//!
//! ```rust
//! use invoice_storage::config::StorageConfig;
//!
//! let config = StorageConfig::default();
//! assert_eq!(config.storage.provider, "local");
//! assert_eq!(config.cleanup.retention_days, 30);
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::remote::{DEFAULT_CHUNK_SIZE, DEFAULT_SMALL_UPLOAD_THRESHOLD};
use crate::validation::DEFAULT_MAX_FILE_SIZE;

/// Name used for the XDG config directory
pub const APP_NAME: &str = "invoice-storage";

/// Prefix of structured environment overrides
pub const ENV_PREFIX: &str = "INVOICE_STORAGE_";

/// Flat environment keys understood for compatibility, with their config paths
pub const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("STORAGE_PROVIDER", "storage.provider"),
    ("UPLOAD_DIR", "storage.local.base_dir"),
    ("MAX_FILE_SIZE", "storage.max_file_size"),
    ("MAX_FILES_PER_INVOICE", "storage.max_files_per_invoice"),
    ("ALLOWED_FILE_TYPES", "storage.allowed_extensions"),
    ("SHAREPOINT_TENANT_ID", "storage.sharepoint.tenant_id"),
    ("SHAREPOINT_CLIENT_ID", "storage.sharepoint.client_id"),
    ("SHAREPOINT_CLIENT_SECRET", "storage.sharepoint.client_secret"),
    ("SHAREPOINT_SITE_ID", "storage.sharepoint.site_id"),
    ("SHAREPOINT_DRIVE_ID", "storage.sharepoint.drive_id"),
    ("SHAREPOINT_BASE_FOLDER", "storage.sharepoint.base_folder"),
    ("ATTACHMENT_RETENTION_DAYS", "cleanup.retention_days"),
    ("CLEANUP_BATCH_SIZE", "cleanup.batch_size"),
];

/// Local filesystem backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Directory uploads are stored under
    pub base_dir: PathBuf,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./uploads"),
        }
    }
}

/// SharePoint (Microsoft Graph) backend settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharePointSettings {
    /// Azure AD tenant
    pub tenant_id: Option<String>,

    /// Application (client) id
    pub client_id: Option<String>,

    /// Application secret
    pub client_secret: Option<String>,

    /// SharePoint site id
    pub site_id: Option<String>,

    /// Document library id; the site's default drive when unset
    pub drive_id: Option<String>,

    /// Top-level folder inside the drive
    pub base_folder: String,

    /// Graph API root
    pub graph_base_url: String,

    /// OAuth2 authority the tenant's token endpoint lives under
    pub authority_url: String,

    /// Payloads smaller than this use a single `PUT`
    pub small_upload_threshold: u64,

    /// Upload-session chunk size, a multiple of 320 KiB
    pub chunk_size: u64,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for SharePointSettings {
    fn default() -> Self {
        Self {
            tenant_id: None,
            client_id: None,
            client_secret: None,
            site_id: None,
            drive_id: None,
            base_folder: "Invoice Attachments".to_string(),
            graph_base_url: "https://graph.microsoft.com/v1.0".to_string(),
            authority_url: "https://login.microsoftonline.com".to_string(),
            small_upload_threshold: DEFAULT_SMALL_UPLOAD_THRESHOLD as u64,
            chunk_size: DEFAULT_CHUNK_SIZE as u64,
            request_timeout_secs: 120,
        }
    }
}

impl SharePointSettings {
    /// Per-request timeout as Duration
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl std::fmt::Debug for SharePointSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharePointSettings")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("site_id", &self.site_id)
            .field("drive_id", &self.drive_id)
            .field("base_folder", &self.base_folder)
            .field("graph_base_url", &self.graph_base_url)
            .field("authority_url", &self.authority_url)
            .field("small_upload_threshold", &self.small_upload_threshold)
            .field("chunk_size", &self.chunk_size)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Backend selector: `local` or `sharepoint`
    pub provider: String,

    /// Largest accepted attachment in bytes
    pub max_file_size: u64,

    /// Most active attachments one invoice may have
    pub max_files_per_invoice: u32,

    /// Narrows the built-in extension allow-list
    ///
    /// Accepts a list or a comma-separated string (`"pdf,png,.jpg"`).
    #[serde(deserialize_with = "list_or_csv", skip_serializing_if = "Option::is_none")]
    pub allowed_extensions: Option<Vec<String>>,

    /// Local backend settings
    pub local: LocalSettings,

    /// SharePoint backend settings
    pub sharepoint: SharePointSettings,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_files_per_invoice: 10,
            allowed_extensions: None,
            local: LocalSettings::default(),
            sharepoint: SharePointSettings::default(),
        }
    }
}

/// Lifecycle cleanup settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    /// Soft-deleted records younger than this are left alone
    pub retention_days: u32,

    /// Records fetched per page
    pub batch_size: u32,

    /// How long a cleanup run may hold the advisory lease
    pub lease_ttl_secs: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            retention_days: 30,
            batch_size: 50,
            lease_ttl_secs: 900,
        }
    }
}

impl CleanupSettings {
    /// Retention window as a chrono duration
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Lease TTL as Duration
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Storage backend and upload limits
    #[serde(default)]
    pub storage: StorageSettings,

    /// Lifecycle cleanup
    #[serde(default)]
    pub cleanup: CleanupSettings,
}

impl StorageConfig {
    /// Loads configuration from every standard source
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Default configuration cannot be serialized to TOML
    /// - A configuration file cannot be read or parsed
    /// - A value fails type conversion
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use invoice_storage::config::StorageConfig;
    ///
    /// # fn example() -> anyhow::Result<()> {
    /// let config = StorageConfig::load()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn load() -> anyhow::Result<Self> {
        let mut figment = Self::defaults()?;

        // 4. User config: ~/.config/invoice-storage/config.toml
        let user_config = Self::recommended_path();
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }

        // 3. Local config: ./config.toml
        let local_config = PathBuf::from("./config.toml");
        if local_config.exists() {
            figment = figment.merge(Toml::file(&local_config));
        }

        let config = Self::with_env(figment).extract()?;
        Ok(config)
    }

    /// Loads configuration from one file over the defaults, then the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the file contains invalid TOML or a value fails
    /// type conversion. A missing file is not an error.
    pub fn load_from(path: &str) -> anyhow::Result<Self> {
        let figment = Self::defaults()?.merge(Toml::file(path));
        let config = Self::with_env(figment).extract()?;
        Ok(config)
    }

    /// Recommended XDG config path
    #[must_use]
    pub fn recommended_path() -> PathBuf {
        dirs::config_dir().map_or_else(
            || PathBuf::from("./config.toml"),
            |config_dir| config_dir.join(APP_NAME).join("config.toml"),
        )
    }

    fn defaults() -> anyhow::Result<Figment> {
        Ok(Figment::new().merge(Toml::string(&toml::to_string(&Self::default())?)))
    }

    /// Layers legacy flat keys, then prefixed keys, over `figment`
    fn with_env(figment: Figment) -> Figment {
        figment
            .merge(Env::raw().filter_map(|key| {
                LEGACY_ENV_KEYS
                    .iter()
                    .find(|(legacy, _)| key == *legacy)
                    .map(|(_, path)| (*path).into())
            }))
            .merge(Env::prefixed(ENV_PREFIX).split("__").lowercase(true))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ListOrCsv {
    List(Vec<String>),
    Csv(String),
}

fn list_or_csv<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<ListOrCsv>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        ListOrCsv::List(list) => list,
        ListOrCsv::Csv(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }))
}
