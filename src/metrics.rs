//! Prometheus metrics definitions and collection logic.
//!
//! This module defines all Prometheus metrics exposed by the exporter and
//! runs one collection cycle per scrape: storage capacity (served from the
//! TTL cache when fresh) followed by the paginated job walk. A failure in one
//! source never hides the other's data.

use crate::cache::TtlCache;
use crate::client::ApiClient;
use crate::config::NbuConfig;
use crate::error::{NbuError, Result};
use crate::pagination::{JobAccumulators, JobWalker};
use crate::storage::{build_snapshot, StorageSnapshot};
use chrono::Utc;
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};
use tracing::{debug, error, field, info, instrument, warn, Span};

const STORAGE: &str = "storage";
const JOBS: &str = "jobs";

/// Tunables of a collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorOptions {
    /// Jobs that ended within this window are collected
    pub scrape_window: Duration,
    /// Jobs per page
    pub page_limit: u32,
    /// Hard budget for one cycle
    pub collect_timeout: Duration,
    /// Storage snapshot reuse interval
    pub cache_ttl: Duration,
}

impl CollectorOptions {
    pub fn from_config(config: &NbuConfig) -> Self {
        Self {
            scrape_window: config.scrape_window(),
            page_limit: config.page_limit,
            collect_timeout: config.collect_timeout(),
            cache_ttl: config.cache_ttl(),
        }
    }
}

/// What happened during one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    /// API version used, if one could be determined
    pub api_version: Option<String>,
    pub storage_error: Option<String>,
    pub jobs_error: Option<String>,
    /// Whether storage data came from the cache
    pub storage_cached: bool,
    pub duration: Duration,
    pub storage_samples: usize,
    pub job_samples: usize,
}

impl ScrapeOutcome {
    /// Both sources were collected.
    pub fn is_success(&self) -> bool {
        self.storage_error.is_none() && self.jobs_error.is_none()
    }

    /// Exactly one source failed.
    pub fn is_partial(&self) -> bool {
        self.storage_error.is_some() != self.jobs_error.is_some()
    }
}

/// Metrics collector for the NetBackup exporter.
pub struct MetricsCollector {
    client: Arc<ApiClient>,
    registry: Registry,
    cache: Arc<TtlCache<Arc<StorageSnapshot>>>,
    options: CollectorOptions,
    publish_lock: Mutex<()>,

    // Exporter metrics
    up: Gauge,
    response_time_ms: Gauge,
    collector_success: GaugeVec,
    storage_last_success: Gauge,

    // Job metrics
    jobs_bytes: GaugeVec,
    jobs_count: GaugeVec,
    jobs_status_count: GaugeVec,

    // Storage metrics
    storage_bytes: GaugeVec,

    // Version info
    api_version: GaugeVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| NbuError::Metrics(e.to_string()))?;
    Ok(collector)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge =
        Gauge::with_opts(Opts::new(name, help)).map_err(|e| NbuError::Metrics(e.to_string()))?;
    register(registry, gauge)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help), labels)
        .map_err(|e| NbuError::Metrics(e.to_string()))?;
    register(registry, vec)
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new(client: Arc<ApiClient>, options: CollectorOptions) -> Result<Self> {
        let registry = Registry::new();

        let up = gauge(
            &registry,
            "nbu_up",
            "Whether the last scrape collected both storage and jobs (1 = success, 0 = failure)",
        )?;
        let response_time_ms = gauge(
            &registry,
            "nbu_response_time_ms",
            "Duration of the last collection cycle in milliseconds",
        )?;
        let collector_success = gauge_vec(
            &registry,
            "nbu_collector_success",
            "Whether the last scrape of a source succeeded (1 = success, 0 = failure)",
            &["collector"],
        )?;
        let storage_last_success = gauge(
            &registry,
            "nbu_storage_last_success_timestamp_seconds",
            "Unix timestamp of the last successful storage collection",
        )?;

        let jobs_bytes = gauge_vec(
            &registry,
            "nbu_jobs_bytes",
            "Bytes transferred by jobs that ended within the scrape window",
            &["action", "policy_type", "status"],
        )?;
        let jobs_count = gauge_vec(
            &registry,
            "nbu_jobs_count",
            "Number of jobs that ended within the scrape window",
            &["action", "policy_type", "status"],
        )?;
        let jobs_status_count = gauge_vec(
            &registry,
            "nbu_jobs_status_count",
            "Number of jobs per action and exit status within the scrape window",
            &["action", "status"],
        )?;

        let storage_bytes = gauge_vec(
            &registry,
            "nbu_storage_bytes",
            "Free and used capacity of disk storage units in bytes",
            &["name", "type", "size"],
        )?;

        let api_version = gauge_vec(
            &registry,
            "nbu_api_version",
            "NetBackup API version in use",
            &["version"],
        )?;

        Ok(Self {
            client,
            registry,
            cache: Arc::new(TtlCache::new(options.cache_ttl)),
            options,
            publish_lock: Mutex::new(()),
            up,
            response_time_ms,
            collector_success,
            storage_last_success,
            jobs_bytes,
            jobs_count,
            jobs_status_count,
            storage_bytes,
            api_version,
        })
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    /// Storage snapshot cache, e.g. to start its sweeper.
    pub fn cache(&self) -> &Arc<TtlCache<Arc<StorageSnapshot>>> {
        &self.cache
    }

    /// Forget the cached storage snapshot.
    pub fn flush_cache(&self) {
        self.cache.flush();
    }

    /// Run one collection cycle and publish whatever was gathered.
    ///
    /// Returns an error only when neither storage nor jobs could be collected.
    #[instrument(
        skip(self),
        fields(
            api_version = field::Empty,
            success = field::Empty,
            storage_error = field::Empty,
            jobs_error = field::Empty,
            duration_ms = field::Empty
        )
    )]
    pub async fn collect(&self) -> Result<ScrapeOutcome> {
        info!("Collecting metrics from NetBackup");

        let started = Instant::now();
        let budget = self.options.collect_timeout;
        let deadline = tokio::time::Instant::now() + budget;
        let mut outcome = ScrapeOutcome::default();
        let mut storage = None;
        let mut jobs = None;

        match bounded(deadline, budget, self.client.ensure_api_version()).await {
            Ok(version) => {
                match bounded(deadline, budget, self.fetch_storage(&version)).await {
                    Ok((snapshot, cached)) => {
                        outcome.storage_cached = cached;
                        storage = Some(snapshot);
                    }
                    Err(e) => {
                        error!("Failed to collect storage metrics: {}", e);
                        outcome.storage_error = Some(e.to_string());
                    }
                }

                match bounded(deadline, budget, self.fetch_jobs(&version)).await {
                    Ok(acc) => jobs = Some(acc),
                    Err(e) => {
                        error!("Failed to collect job metrics: {}", e);
                        outcome.jobs_error = Some(e.to_string());
                    }
                }

                outcome.api_version = Some(version);
            }
            Err(e) => {
                if e.is_auth_failure() {
                    error!("NetBackup rejected the API key: {}", e);
                } else {
                    error!("Could not determine the NetBackup API version: {}", e);
                }
                outcome.storage_error = Some(e.to_string());
                outcome.jobs_error = Some(e.to_string());
            }
        }

        outcome.duration = started.elapsed();
        outcome.storage_samples = storage.as_ref().map_or(0, |s| s.len());
        outcome.job_samples = jobs.as_ref().map_or(0, JobAccumulators::samples);
        self.publish(&outcome, storage.as_deref(), jobs.as_ref());

        let span = Span::current();
        span.record("success", outcome.is_success());
        span.record("duration_ms", outcome.duration.as_millis() as u64);
        if let Some(version) = &outcome.api_version {
            span.record("api_version", version.as_str());
        }
        if let Some(e) = &outcome.storage_error {
            span.record("storage_error", e.as_str());
        }
        if let Some(e) = &outcome.jobs_error {
            span.record("jobs_error", e.as_str());
        }

        match (&outcome.storage_error, &outcome.jobs_error) {
            (Some(storage), Some(jobs)) => Err(NbuError::Collection {
                storage: storage.clone(),
                jobs: jobs.clone(),
            }),
            (None, None) => {
                info!(
                    "Successfully collected metrics in {:?} ({} storage, {} job samples)",
                    outcome.duration, outcome.storage_samples, outcome.job_samples
                );
                Ok(outcome)
            }
            _ => {
                warn!(
                    "Partial collection in {:?}: storage ok = {}, jobs ok = {}",
                    outcome.duration,
                    outcome.storage_error.is_none(),
                    outcome.jobs_error.is_none()
                );
                Ok(outcome)
            }
        }
    }

    async fn fetch_storage(&self, version: &str) -> Result<(Arc<StorageSnapshot>, bool)> {
        if let Some(snapshot) = self.cache.get() {
            debug!("Using cached storage snapshot");
            return Ok((snapshot, true));
        }

        let response = self.client.get_storage_units(version).await?;
        let snapshot = Arc::new(build_snapshot(&response.data));
        debug!(
            "Fetched {} storage units, {} samples",
            response.data.len(),
            snapshot.len()
        );
        self.cache.set(Arc::clone(&snapshot));
        Ok((snapshot, false))
    }

    async fn fetch_jobs(&self, version: &str) -> Result<JobAccumulators> {
        let window = chrono::Duration::from_std(self.options.scrape_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let ended_after = Utc::now() - window;

        let mut acc = JobAccumulators::new();
        let summary = JobWalker::new(&self.client, version, self.options.page_limit, ended_after)
            .walk(&mut acc)
            .await?;
        debug!(
            "Aggregated {} jobs from {} pages into {} samples",
            summary.jobs,
            summary.pages,
            acc.samples()
        );
        Ok(acc)
    }

    /// Replace every published sample with the result of one cycle.
    fn publish(
        &self,
        outcome: &ScrapeOutcome,
        storage: Option<&StorageSnapshot>,
        jobs: Option<&JobAccumulators>,
    ) {
        let _guard = self.publish_lock.lock().unwrap_or_else(|p| p.into_inner());

        // Label sets disappear between cycles, so start from scratch.
        self.jobs_bytes.reset();
        self.jobs_count.reset();
        self.jobs_status_count.reset();
        self.storage_bytes.reset();
        self.api_version.reset();
        self.collector_success.reset();

        if let Some(storage) = storage {
            for (key, bytes) in storage {
                self.storage_bytes
                    .with_label_values(&key.labels())
                    .set(*bytes as f64);
            }
        }

        if let Some(jobs) = jobs {
            for (key, count) in &jobs.count {
                self.jobs_count
                    .with_label_values(&key.labels())
                    .set(*count as f64);
            }
            for (key, bytes) in &jobs.bytes {
                self.jobs_bytes
                    .with_label_values(&key.labels())
                    .set(*bytes as f64);
            }
            for (key, count) in &jobs.status_count {
                self.jobs_status_count
                    .with_label_values(&key.labels())
                    .set(*count as f64);
            }
        }

        if let Some(version) = &outcome.api_version {
            self.api_version
                .with_label_values(&[version.as_str()])
                .set(1.0);
        }

        self.collector_success
            .with_label_values(&[STORAGE])
            .set(if outcome.storage_error.is_none() { 1.0 } else { 0.0 });
        self.collector_success
            .with_label_values(&[JOBS])
            .set(if outcome.jobs_error.is_none() { 1.0 } else { 0.0 });

        if let Some(ts) = self.cache.last_success() {
            if let Ok(since_epoch) = ts.duration_since(UNIX_EPOCH) {
                self.storage_last_success.set(since_epoch.as_secs_f64());
            }
        }

        self.response_time_ms
            .set(outcome.duration.as_secs_f64() * 1000.0);
        self.up.set(if outcome.is_success() { 1.0 } else { 0.0 });
    }

    /// Encode metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = {
            let _guard = self.publish_lock.lock().unwrap_or_else(|p| p.into_inner());
            self.registry.gather()
        };

        // Reuse buffer to avoid allocation on every scrape
        thread_local! {
            static BUFFER: std::cell::RefCell<Vec<u8>> = std::cell::RefCell::new(Vec::with_capacity(8192));
        }

        BUFFER.with(|buf| {
            let mut buffer = buf.borrow_mut();
            buffer.clear();

            encoder
                .encode(&metric_families, &mut *buffer)
                .map_err(|e| NbuError::Metrics(e.to_string()))?;

            String::from_utf8(buffer.clone()).map_err(|e| NbuError::Metrics(e.to_string()))
        })
    }
}

/// Run `fut` until the cycle deadline.
async fn bounded<T, F>(deadline: tokio::time::Instant, budget: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(NbuError::Deadline { budget }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(text: &str, metric: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let with_labels = format!("{}{{", metric);
        let bare = format!("{} ", metric);
        text.lines()
            .filter(|line| line.starts_with(&with_labels) || line.starts_with(&bare))
            .find(|line| {
                labels
                    .iter()
                    .all(|(k, v)| line.contains(&format!("{}=\"{}\"", k, v)))
            })
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|v| v.parse().ok())
    }

    fn collector() -> MetricsCollector {
        let mut config = NbuConfig::new("nbu.example.com", "key");
        config.api_version = Some("13.0".to_string());
        let options = CollectorOptions::from_config(&config);
        let client = Arc::new(ApiClient::new(config).unwrap());
        MetricsCollector::new(client, options).unwrap()
    }

    #[test]
    fn test_outcome_classification() {
        let mut outcome = ScrapeOutcome::default();
        assert!(outcome.is_success());
        assert!(!outcome.is_partial());

        outcome.jobs_error = Some("boom".to_string());
        assert!(!outcome.is_success());
        assert!(outcome.is_partial());

        outcome.storage_error = Some("boom".to_string());
        assert!(!outcome.is_partial());
    }

    #[test]
    fn test_publish_exposes_storage_when_jobs_failed() {
        let collector = collector();
        let mut storage = StorageSnapshot::new();
        storage.insert(
            crate::storage::StorageKey::new("stu1", "PureDisk", "free"),
            4096,
        );
        let outcome = ScrapeOutcome {
            api_version: Some("13.0".to_string()),
            jobs_error: Some("jobs down".to_string()),
            ..Default::default()
        };

        collector.publish(&outcome, Some(&storage), None);
        let text = collector.encode().unwrap();

        assert_eq!(
            sample(
                &text,
                "nbu_storage_bytes",
                &[("name", "stu1"), ("type", "PureDisk"), ("size", "free")]
            ),
            Some(4096.0)
        );
        assert_eq!(sample(&text, "nbu_api_version", &[("version", "13.0")]), Some(1.0));
        assert_eq!(sample(&text, "nbu_collector_success", &[("collector", "jobs")]), Some(0.0));
        assert_eq!(sample(&text, "nbu_collector_success", &[("collector", "storage")]), Some(1.0));
        assert_eq!(sample(&text, "nbu_up", &[]), Some(0.0));
        assert!(!text.contains("nbu_jobs_count{"));
    }

    #[test]
    fn test_publish_replaces_previous_cycle() {
        let collector = collector();
        let mut acc = JobAccumulators::new();
        acc.fold(&crate::client::JobAttributes {
            job_type: Some("BACKUP".to_string()),
            policy_type: Some("VMWARE".to_string()),
            status: Some(0),
            kilobytes_transferred: Some(1),
            ..Default::default()
        });
        let outcome = ScrapeOutcome {
            api_version: Some("13.0".to_string()),
            ..Default::default()
        };

        collector.publish(&outcome, None, Some(&acc));
        assert!(collector.encode().unwrap().contains("nbu_jobs_count{"));

        collector.publish(&outcome, None, Some(&JobAccumulators::new()));
        assert!(!collector.encode().unwrap().contains("nbu_jobs_count{"));
    }
}
