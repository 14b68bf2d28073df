//! SharePoint document-library backend over Microsoft Graph
//!
//! Objects are stored in a drive of a SharePoint site under
//! `{base_folder}/Invoices/{year}/{month}/{invoice_id}/{unique filename}`.
//!
//! Payloads below the small-upload threshold are sent with one `PUT` to the
//! item's `content` endpoint. Larger payloads use an upload session: the
//! session URL is requested, then byte ranges are `PUT` to it one after the
//! other with a `Content-Range` header. A failed chunk cancels the session and
//! fails the whole upload; there is no resume.

pub mod auth;
pub mod transport;

use super::traits::AttachmentBackend;
use super::types::{
    BackendKind, Capabilities, Operation, StorageError, StorageResult, StoredObject, UploadMetadata,
};
use super::unique_filename;
use crate::config::SharePointSettings;
use crate::validation::{sanitize_path_segment, validate_storage_path};
use async_trait::async_trait;
use auth::{ClientCredentials, TokenSource};
use bytes::Bytes;
use chrono::{DateTime, Datelike, Utc};
use http::header::{AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE};
use http::{Method, Response, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use transport::{GraphTransport, ReqwestTransport};

/// Upload-session chunks must be a multiple of this many bytes
pub const CHUNK_ALIGNMENT: usize = 320 * 1024;

/// Default chunk size (10 × 320 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 10 * CHUNK_ALIGNMENT;

/// Payloads smaller than this use a single `PUT`
pub const DEFAULT_SMALL_UPLOAD_THRESHOLD: usize = 4 * 1024 * 1024;

/// Characters left unescaped in a drive path segment
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Where and how the backend talks to Graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphOptions {
    /// Graph API root, e.g. `https://graph.microsoft.com/v1.0`
    pub graph_base_url: String,
    /// SharePoint site identifier
    pub site_id: String,
    /// Document library; the site's default drive when `None`
    pub drive_id: Option<String>,
    /// Top-level folder inside the drive
    pub base_folder: String,
    /// Payloads below this size skip the upload session
    pub small_upload_threshold: usize,
    /// Bytes per upload-session chunk, a multiple of [`CHUNK_ALIGNMENT`]
    pub chunk_size: usize,
}

impl GraphOptions {
    /// Extracts Graph options from settings
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the site id is missing or the chunk size is
    /// not a positive multiple of [`CHUNK_ALIGNMENT`].
    pub fn from_settings(settings: &SharePointSettings) -> StorageResult<Self> {
        let site_id = required(settings.site_id.as_deref(), "sharepoint.site_id")?;

        let chunk_size = usize::try_from(settings.chunk_size)
            .map_err(|_| StorageError::Configuration("sharepoint.chunk_size is too large".into()))?;
        if chunk_size == 0 || chunk_size % CHUNK_ALIGNMENT != 0 {
            return Err(StorageError::Configuration(format!(
                "sharepoint.chunk_size must be a positive multiple of {CHUNK_ALIGNMENT} bytes, got {chunk_size}"
            )));
        }
        let small_upload_threshold = usize::try_from(settings.small_upload_threshold).map_err(|_| {
            StorageError::Configuration("sharepoint.small_upload_threshold is too large".into())
        })?;

        Ok(Self {
            graph_base_url: settings.graph_base_url.trim_end_matches('/').to_string(),
            site_id: site_id.to_string(),
            drive_id: settings.drive_id.clone().filter(|d| !d.trim().is_empty()),
            base_folder: settings.base_folder.trim_matches('/').to_string(),
            small_upload_threshold,
            chunk_size,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: Option<String>,
    size: Option<u64>,
    #[serde(rename = "webUrl")]
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadSession {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// SharePoint document-library backend
///
/// # Examples
///
/// ```rust,no_run
/// use invoice_storage::config::SharePointSettings;
/// use invoice_storage::storage::SharePointBackend;
///
/// let settings = SharePointSettings {
///     tenant_id: Some("contoso.onmicrosoft.com".into()),
///     client_id: Some("00000000-0000-0000-0000-000000000000".into()),
///     client_secret: Some("...".into()),
///     site_id: Some("contoso.sharepoint.com,1111,2222".into()),
///     ..SharePointSettings::default()
/// };
/// let backend = SharePointBackend::from_settings(&settings)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct SharePointBackend {
    transport: Arc<dyn GraphTransport>,
    tokens: Arc<dyn TokenSource>,
    options: GraphOptions,
    /// `{graph}/sites/{site}/drives/{drive}` or `{graph}/sites/{site}/drive`
    drive_root: String,
}

impl std::fmt::Debug for SharePointBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharePointBackend")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SharePointBackend {
    /// Creates a backend from its parts
    pub fn new(
        options: GraphOptions,
        transport: Arc<dyn GraphTransport>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        let drive_root = match &options.drive_id {
            Some(drive) => format!(
                "{}/sites/{}/drives/{}",
                options.graph_base_url,
                encode_segment(&options.site_id),
                encode_segment(drive)
            ),
            None => format!(
                "{}/sites/{}/drive",
                options.graph_base_url,
                encode_segment(&options.site_id)
            ),
        };

        Self {
            transport,
            tokens,
            options,
            drive_root,
        }
    }

    /// Creates a backend using client credentials and a `reqwest` transport
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a required setting is missing or invalid.
    pub fn from_settings(settings: &SharePointSettings) -> StorageResult<Self> {
        let options = GraphOptions::from_settings(settings)?;

        let tokens = ClientCredentials::new(
            &settings.authority_url,
            required(settings.tenant_id.as_deref(), "sharepoint.tenant_id")?,
            required(settings.client_id.as_deref(), "sharepoint.client_id")?,
            required(settings.client_secret.as_deref(), "sharepoint.client_secret")?,
        )
        .map_err(|e| StorageError::Configuration(e.to_string()))?;

        let transport = ReqwestTransport::new(Duration::from_secs(settings.request_timeout_secs))
            .map_err(|e| StorageError::Configuration(e.to_string()))?;

        Ok(Self::new(options, Arc::new(transport), Arc::new(tokens)))
    }

    /// Options this backend was built with
    #[must_use]
    pub const fn options(&self) -> &GraphOptions {
        &self.options
    }

    /// Derives the drive path for a new upload
    #[must_use]
    pub fn derive_path(&self, metadata: &UploadMetadata, now: DateTime<Utc>) -> String {
        let date = metadata.invoice_date.unwrap_or_else(|| now.date_naive());
        let relative = format!(
            "Invoices/{}/{:02}/{}/{}",
            date.year(),
            date.month(),
            sanitize_path_segment(&metadata.invoice_id),
            unique_filename(&metadata.original_name, now)
        );
        // an empty base folder means the drive root
        join(&self.options.base_folder, &relative)
    }

    fn item_url(&self, path: &str, action: Option<&str>) -> String {
        let encoded = encode_path(path);
        match action {
            Some(action) => format!("{}/root:/{encoded}:/{action}", self.drive_root),
            None => format!("{}/root:/{encoded}", self.drive_root),
        }
    }

    fn children_url(&self, folder: &str) -> String {
        if folder.is_empty() {
            format!("{}/root/children", self.drive_root)
        } else {
            format!("{}/root:/{}:/children", self.drive_root, encode_path(folder))
        }
    }

    /// `parentReference.path` form of a folder
    fn parent_reference(&self, folder: &str) -> String {
        let drive = self
            .options
            .drive_id
            .as_ref()
            .map_or_else(|| "/drive".to_string(), |d| format!("/drives/{d}"));
        if folder.is_empty() {
            format!("{drive}/root")
        } else {
            format!("{drive}/root:/{folder}")
        }
    }

    /// Sends an authenticated request
    async fn graph(
        &self,
        op: Operation,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> StorageResult<Response<Bytes>> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| StorageError::failed(op, "could not obtain a Graph access token", Some(e)))?;

        let mut builder = http::Request::builder()
            .method(method)
            .uri(url)
            .header(AUTHORIZATION, format!("Bearer {token}"));

        let body = match body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Bytes::from(value.to_string())
            }
            None => Bytes::new(),
        };

        self.dispatch(op, builder, body).await
    }

    async fn dispatch(
        &self,
        op: Operation,
        builder: http::request::Builder,
        body: Bytes,
    ) -> StorageResult<Response<Bytes>> {
        let request = builder
            .body(body)
            .map_err(|e| StorageError::failed(op, "invalid Graph request", Some(e)))?;

        self.transport
            .send(request)
            .await
            .map_err(|e| StorageError::failed(op, "Graph request failed", Some(e)))
    }

    /// Makes sure every folder along `folder` exists, creating missing ones
    ///
    /// A create that loses a race with another uploader (409) counts as success.
    async fn ensure_folders(&self, op: Operation, folder: &str) -> StorageResult<()> {
        let mut parent = String::new();

        for segment in folder.split('/').filter(|s| !s.is_empty() && *s != ".") {
            let current = if parent.is_empty() {
                segment.to_string()
            } else {
                format!("{parent}/{segment}")
            };

            let response = self
                .graph(op, Method::GET, &self.item_url(&current, None), None)
                .await?;

            match response.status() {
                status if status.is_success() => {}
                StatusCode::NOT_FOUND => self.create_folder(op, &parent, segment).await?,
                _ => return Err(status_error(op, &current, &response)),
            }

            parent = current;
        }

        Ok(())
    }

    async fn create_folder(&self, op: Operation, parent: &str, name: &str) -> StorageResult<()> {
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let response = self
            .graph(op, Method::POST, &self.children_url(parent), Some(body))
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!(parent = %parent, folder = %name, "sharepoint: folder created");
                Ok(())
            }
            StatusCode::CONFLICT => {
                debug!(parent = %parent, folder = %name, "sharepoint: folder created concurrently");
                Ok(())
            }
            _ => Err(status_error(op, &join(parent, name), &response)),
        }
    }

    async fn upload_at(&self, path: &str, data: Bytes) -> StorageResult<StoredObject> {
        validate_storage_path(path)?;

        if let Some((folder, _)) = path.rsplit_once('/') {
            self.ensure_folders(Operation::Upload, folder).await?;
        }

        let item = if data.len() < self.options.small_upload_threshold {
            self.put_small(path, data.clone()).await?
        } else {
            self.put_in_chunks(path, &data).await?
        };

        debug!(path = %path, size = data.len(), item_id = ?item.id, "sharepoint: uploaded");
        Ok(StoredObject {
            path: path.to_string(),
            size: item.size.unwrap_or(data.len() as u64),
            item_id: item.id,
        })
    }

    async fn put_small(&self, path: &str, data: Bytes) -> StorageResult<DriveItem> {
        let token = self.tokens.access_token().await.map_err(|e| {
            StorageError::failed(Operation::Upload, "could not obtain a Graph access token", Some(e))
        })?;

        let builder = http::Request::builder()
            .method(Method::PUT)
            .uri(self.item_url(path, Some("content")))
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(CONTENT_TYPE, "application/octet-stream");

        let response = self.dispatch(Operation::Upload, builder, data).await?;
        if !response.status().is_success() {
            return Err(status_error(Operation::Upload, path, &response));
        }
        parse_json(Operation::Upload, &response)
    }

    async fn put_in_chunks(&self, path: &str, data: &Bytes) -> StorageResult<DriveItem> {
        let body = json!({ "item": { "@microsoft.graph.conflictBehavior": "fail" } });
        let response = self
            .graph(
                Operation::Upload,
                Method::POST,
                &self.item_url(path, Some("createUploadSession")),
                Some(body),
            )
            .await?;
        if !response.status().is_success() {
            return Err(status_error(Operation::Upload, path, &response));
        }
        let session: UploadSession = parse_json(Operation::Upload, &response)?;

        let total = data.len();
        let mut start = 0;
        while start < total {
            let end = (start + self.options.chunk_size).min(total);
            let range = format!("bytes {}-{}/{total}", start, end - 1);

            // The session URL is pre-authenticated; no bearer token is sent
            let builder = http::Request::builder()
                .method(Method::PUT)
                .uri(&session.upload_url)
                .header(CONTENT_RANGE, &range);

            let response = match self
                .dispatch(Operation::Upload, builder, data.slice(start..end))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.cancel_session(&session.upload_url).await;
                    return Err(e);
                }
            };

            match response.status() {
                StatusCode::ACCEPTED => {
                    debug!(path = %path, range = %range, "sharepoint: chunk accepted");
                }
                StatusCode::OK | StatusCode::CREATED => {
                    return parse_json(Operation::Upload, &response);
                }
                _ => {
                    let err = status_error(Operation::Upload, path, &response);
                    warn!(path = %path, range = %range, error = %err, "sharepoint: chunk rejected");
                    self.cancel_session(&session.upload_url).await;
                    return Err(err);
                }
            }

            start = end;
        }

        Err(StorageError::failed_msg(
            Operation::Upload,
            format!("{path}: upload session accepted every chunk but returned no item"),
        ))
    }

    /// Best-effort cancellation of an upload session
    async fn cancel_session(&self, upload_url: &str) {
        let builder = http::Request::builder()
            .method(Method::DELETE)
            .uri(upload_url);

        if let Err(e) = self.dispatch(Operation::Upload, builder, Bytes::new()).await {
            debug!(error = %e, "sharepoint: upload session not cancelled");
        }
    }

    async fn fetch_item(&self, op: Operation, path: &str) -> StorageResult<Option<DriveItem>> {
        let response = self
            .graph(op, Method::GET, &self.item_url(path, None), None)
            .await?;

        match response.status() {
            status if status.is_success() => parse_json(op, &response).map(Some),
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(op, path, &response)),
        }
    }
}

#[async_trait]
impl AttachmentBackend for SharePointBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SharePoint
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            move_objects: true,
            upload_to_path: true,
            public_urls: true,
        }
    }

    async fn upload(&self, data: Bytes, metadata: &UploadMetadata) -> StorageResult<StoredObject> {
        let path = self.derive_path(metadata, Utc::now());
        self.upload_at(&path, data).await
    }

    async fn download(&self, path: &str) -> StorageResult<Bytes> {
        validate_storage_path(path)?;

        let response = self
            .graph(
                Operation::Download,
                Method::GET,
                &self.item_url(path, Some("content")),
                None,
            )
            .await?;

        if !response.status().is_success() {
            return Err(status_error(Operation::Download, path, &response));
        }

        let data = response.into_body();
        debug!(path = %path, size = data.len(), "sharepoint: downloaded");
        Ok(data)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        validate_storage_path(path)?;

        let response = self
            .graph(Operation::Delete, Method::DELETE, &self.item_url(path, None), None)
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!(path = %path, "sharepoint: deleted");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(path = %path, "sharepoint: already gone");
                Ok(())
            }
            _ => Err(status_error(Operation::Delete, path, &response)),
        }
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        validate_storage_path(path)?;
        Ok(self.fetch_item(Operation::Exists, path).await?.is_some())
    }

    async fn move_object(&self, from: &str, to: &str) -> StorageResult<()> {
        validate_storage_path(from)?;
        validate_storage_path(to)?;

        let (folder, name) = to.rsplit_once('/').unwrap_or(("", to));
        self.ensure_folders(Operation::Move, folder).await?;

        let body = json!({
            "parentReference": { "path": self.parent_reference(folder) },
            "name": name,
        });
        let response = self
            .graph(Operation::Move, Method::PATCH, &self.item_url(from, None), Some(body))
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!(from = %from, to = %to, "sharepoint: moved");
                Ok(())
            }
            StatusCode::CONFLICT => Err(StorageError::failed_msg(
                Operation::Move,
                format!("destination {to} already exists"),
            )),
            _ => Err(status_error(Operation::Move, from, &response)),
        }
    }

    async fn upload_to_path(&self, data: Bytes, path: &str) -> StorageResult<StoredObject> {
        self.upload_at(path, data).await
    }

    async fn public_url(&self, path: &str) -> StorageResult<Option<String>> {
        validate_storage_path(path)?;

        match self.fetch_item(Operation::Download, path).await? {
            Some(item) => Ok(item.web_url),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }
}

fn required<'a>(value: Option<&'a str>, key: &str) -> StorageResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StorageError::Configuration(format!("{key} is required")))
}

fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .map(encode_segment)
        .collect::<Vec<_>>()
        .join("/")
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn parse_json<T: DeserializeOwned>(op: Operation, response: &Response<Bytes>) -> StorageResult<T> {
    serde_json::from_slice(response.body())
        .map_err(|e| StorageError::failed(op, "unexpected Graph response body", Some(e)))
}

/// Human-readable description of a Graph error body
fn describe(body: &[u8]) -> String {
    serde_json::from_slice::<GraphErrorBody>(body).map_or_else(
        |_| String::from_utf8_lossy(body).chars().take(200).collect(),
        |e| format!("{}: {}", e.error.code, e.error.message),
    )
}

/// Maps a non-success Graph response onto the error taxonomy
fn status_error(op: Operation, path: &str, response: &Response<Bytes>) -> StorageError {
    let status = response.status();
    let detail = format!("HTTP {status}: {}", describe(response.body()));

    match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StorageError::PermissionDenied {
            path: path.to_string(),
            source: Some(detail.into()),
        },
        StatusCode::INSUFFICIENT_STORAGE => StorageError::DiskFull {
            path: path.to_string(),
            source: Some(detail.into()),
        },
        _ => StorageError::failed_msg(op, format!("{path}: {detail}")),
    }
}
