//! NetBackup API client.
//!
//! This module provides the transport used by every collector: authenticated
//! GET requests with the API version carried in the `Accept` header, response
//! validation, transport-level retry and cooperative shutdown.

use crate::config::NbuConfig;
use crate::error::{NbuError, Result};
use crate::pagination::PaginationCursor;
use crate::retry::RetryPolicy;
use crate::version::VersionNegotiator;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use url::Url;

/// Vendor JSON media type; the API version is appended as a parameter.
pub const NBU_MEDIA_TYPE: &str = "application/vnd.netbackup+json";

const JSON_MEDIA_TYPE: &str = "application/json";

/// Bytes of a rejected body kept for diagnostics.
pub const BODY_PREVIEW_LEN: usize = 200;

const JOBS_PATH: &str = "/admin/jobs";
const STORAGE_UNITS_PATH: &str = "/storage/storage-units";

/// NetBackup API client.
///
/// The API version is always passed explicitly to each request; the only
/// version state the client holds is the one committed for the session by
/// [`ApiClient::ensure_api_version`].
pub struct ApiClient {
    http: RwLock<Option<Client>>,
    config: NbuConfig,
    base_url: String,
    api_version: OnceLock<String>,
    negotiation: Mutex<()>,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl ApiClient {
    /// Create a new NetBackup API client.
    ///
    /// # Arguments
    ///
    /// * `config` - NetBackup connection configuration
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use nbu_exporter::client::ApiClient;
    /// use nbu_exporter::config::NbuConfig;
    ///
    /// let config = NbuConfig::new("nbu.example.com", "my-api-key");
    /// let client = ApiClient::new(config).unwrap();
    /// ```
    pub fn new(config: NbuConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(!config.verify_tls)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_seconds))
            .build()
            .map_err(|source| NbuError::Transport {
                url: config.base_url(),
                source,
            })?;

        let base_url = config.base_url();
        // Validate once so request URLs can be built without surprises later.
        Url::parse(&base_url)?;

        let api_version = OnceLock::new();
        if let Some(version) = &config.api_version {
            let _ = api_version.set(version.clone());
        }

        Ok(Self {
            http: RwLock::new(Some(client)),
            config,
            base_url,
            api_version,
            negotiation: Mutex::new(()),
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub fn config(&self) -> &NbuConfig {
        &self.config
    }

    /// API version committed for this client, if any.
    pub fn api_version(&self) -> Option<&str> {
        self.api_version.get().map(String::as_str)
    }

    /// Return the session API version, negotiating it on first use.
    ///
    /// A version pinned in the configuration is returned as is and no probe
    /// requests are made.
    pub async fn ensure_api_version(&self) -> Result<String> {
        if let Some(version) = self.api_version.get() {
            return Ok(version.clone());
        }

        let _guard = self.negotiation.lock().await;
        if let Some(version) = self.api_version.get() {
            return Ok(version.clone());
        }

        let negotiation = VersionNegotiator::with_defaults(self).negotiate().await?;

        info!(
            "Using NetBackup API version {} (attempted: {})",
            negotiation.version,
            negotiation.attempted.join(", ")
        );
        Ok(self.api_version.get_or_init(|| negotiation.version).clone())
    }

    /// Number of requests currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Build an absolute URL below the API base path.
    pub fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    /// GET `url` with `version` and decode the JSON body into `T`.
    ///
    /// Transient failures are retried according to the configured policy.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url, version: &str) -> Result<T> {
        let _guard = self.begin()?;
        let body = self.execute(url, version, &self.config.retry).await?;
        serde_json::from_slice(&body).map_err(|source| NbuError::Decode {
            url: url.to_string(),
            preview: body_preview(&body),
            source,
        })
    }

    /// Single-attempt GET used to test whether the server accepts `version`.
    ///
    /// Any 2xx response counts as acceptance; the body and its content type
    /// are not inspected.
    pub async fn probe(&self, url: &Url, version: &str) -> Result<()> {
        let _guard = self.begin()?;
        match self
            .execute(url, version, &RetryPolicy::single_attempt())
            .await
        {
            Ok(_) | Err(NbuError::UnexpectedContentType { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// URL of the smallest possible jobs request, used for version probes.
    pub fn probe_url(&self) -> Result<Url> {
        self.url(JOBS_PATH, &[("page[limit]", "1")])
    }

    /// Fetch one page of jobs that ended after `ended_after`.
    pub async fn get_jobs_page(
        &self,
        version: &str,
        limit: u32,
        offset: u64,
        ended_after: DateTime<Utc>,
    ) -> Result<ApiResponse<JobAttributes>> {
        let limit = limit.to_string();
        let offset = offset.to_string();
        let filter = format!(
            "endTime gt {}",
            ended_after.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let url = self.url(
            JOBS_PATH,
            &[
                ("page[limit]", limit.as_str()),
                ("page[offset]", offset.as_str()),
                ("filter", filter.as_str()),
            ],
        )?;
        debug!("Fetching jobs page from: {}", url);
        self.get_json(&url, version).await
    }

    /// Fetch all storage units.
    pub async fn get_storage_units(
        &self,
        version: &str,
    ) -> Result<ApiResponse<StorageUnitAttributes>> {
        let url = self.url(STORAGE_UNITS_PATH, &[])?;
        debug!("Fetching storage units from: {}", url);
        self.get_json(&url, version).await
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    ///
    /// Waits at most `shutdown_timeout_seconds`, then releases pooled
    /// connections. Calling it twice fails with [`NbuError::AlreadyClosed`].
    pub async fn close(&self) -> Result<()> {
        self.close_with(std::future::pending::<()>()).await
    }

    /// Like [`ApiClient::close`], but gives up waiting as soon as `cancel`
    /// completes and returns [`NbuError::ShutdownCancelled`]. Pooled
    /// connections are released either way.
    pub async fn close_with<F>(&self, cancel: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(NbuError::AlreadyClosed);
        }

        info!(
            "Closing NetBackup client, {} request(s) in flight",
            self.in_flight()
        );

        let timeout = self.config.shutdown_timeout();
        // None when the wait was cancelled
        let drained = tokio::select! {
            res = tokio::time::timeout(timeout, self.wait_idle()) => Some(res.is_ok()),
            _ = cancel => None,
        };

        // In-flight requests keep their own handle to the pool
        self.http
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match drained {
            Some(true) => {
                debug!("NetBackup client closed");
                Ok(())
            }
            Some(false) => {
                let in_flight = self.in_flight();
                warn!(
                    "Shutdown timed out after {:?} with {} request(s) in flight",
                    timeout, in_flight
                );
                Err(NbuError::ShutdownTimeout { in_flight })
            }
            None => {
                warn!(
                    "Shutdown wait cancelled with {} request(s) in flight",
                    self.in_flight()
                );
                Err(NbuError::ShutdownCancelled)
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn begin(&self) -> Result<InFlightGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard { client: self };
        if self.is_closed() {
            return Err(NbuError::Closed);
        }
        Ok(guard)
    }

    fn http(&self) -> Result<Client> {
        self.http
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(NbuError::Closed)
    }

    async fn execute(&self, url: &Url, version: &str, policy: &RetryPolicy) -> Result<Vec<u8>> {
        let http = self.http()?;
        let mut attempt = 1;

        loop {
            let failed = match self.send_once(&http, url, version).await {
                Ok(body) => return Ok(body),
                Err(failed) => failed,
            };

            if !failed.error.is_retryable() || !policy.should_retry(attempt) {
                return Err(failed.error);
            }

            let delay = failed
                .retry_after
                .unwrap_or_else(|| policy.delay_for(attempt));
            warn!(
                "Attempt {}/{} for {} failed: {}; retrying in {:?}",
                attempt,
                policy.attempts(),
                url,
                failed.error,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send_once(
        &self,
        http: &Client,
        url: &Url,
        version: &str,
    ) -> std::result::Result<Vec<u8>, FailedAttempt> {
        let response = http
            .get(url.clone())
            .header(ACCEPT, media_type(version))
            .header(AUTHORIZATION, &self.config.api_key)
            .send()
            .await
            .map_err(|source| NbuError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if status == StatusCode::NOT_ACCEPTABLE {
            return Err(NbuError::UnsupportedVersion {
                version: version.to_string(),
                url: url.to_string(),
            }
            .into());
        }

        if !status.is_success() {
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                parse_retry_after(response.headers())
            } else {
                None
            };
            return Err(FailedAttempt {
                error: NbuError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                    content_type: content_type.unwrap_or_default(),
                },
                retry_after,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| NbuError::Transport {
                url: url.to_string(),
                source,
            })?
            .to_vec();

        if let Some(content_type) = content_type {
            if !is_json_content_type(&content_type) {
                return Err(NbuError::UnexpectedContentType {
                    url: url.to_string(),
                    content_type,
                    preview: body_preview(&body),
                }
                .into());
            }
        }

        Ok(body)
    }
}

struct InFlightGuard<'a> {
    client: &'a ApiClient,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.client.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.client.idle.notify_waiters();
        }
    }
}

struct FailedAttempt {
    error: NbuError,
    retry_after: Option<Duration>,
}

impl From<NbuError> for FailedAttempt {
    fn from(error: NbuError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// `Accept` header value for `version`.
pub fn media_type(version: &str) -> String {
    format!("{};version={}", NBU_MEDIA_TYPE, version)
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case(JSON_MEDIA_TYPE) || essence.eq_ignore_ascii_case(NBU_MEDIA_TYPE)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn body_preview(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(BODY_PREVIEW_LEN)]).into_owned()
}

/// Generic NetBackup API response wrapper.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiResponse<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<Resource<T>>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    /// Pagination cursor of this page, if the server sent one.
    pub fn cursor(&self) -> Option<&PaginationCursor> {
        self.meta.as_ref().and_then(|m| m.pagination.as_ref())
    }
}

/// A single JSON:API resource.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Resource<T> {
    /// Resource type ("job", "storageUnit", ...)
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Resource identifier
    #[serde(default)]
    pub id: String,
    pub attributes: T,
}

/// Response metadata.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Meta {
    #[serde(default)]
    pub pagination: Option<PaginationCursor>,
}

/// Job information from the admin jobs endpoint.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAttributes {
    #[serde(default)]
    pub job_id: u64,
    /// Job action (BACKUP, RESTORE, DUPLICATION, ...)
    #[serde(default)]
    pub job_type: Option<String>,
    /// Policy type (VMWARE, STANDARD, ...)
    #[serde(default)]
    pub policy_type: Option<String>,
    /// Exit status, 0 = success, 1 = partial success, anything else failed
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub kilobytes_transferred: Option<i64>,
    #[serde(default)]
    pub end_time: Option<String>,
}

/// Storage unit capacity information.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUnitAttributes {
    #[serde(default)]
    pub name: String,
    /// DISK, TAPE, CLOUD
    #[serde(default)]
    pub storage_type: Option<String>,
    /// Storage server flavour (PureDisk, AdvancedDisk, ...)
    #[serde(default)]
    pub storage_server_type: Option<String>,
    #[serde(default)]
    pub free_capacity_bytes: Option<u64>,
    #[serde(default)]
    pub used_capacity_bytes: Option<u64>,
}
