//! Job collection via offset pagination.
//!
//! The jobs endpoint returns at most `page[limit]` items per request together
//! with a `meta.pagination` cursor. [`JobWalker`] requests one page at a time
//! and folds every job straight into [`JobAccumulators`], so memory use is
//! bounded by the number of distinct label combinations rather than the
//! number of jobs.

use crate::client::{ApiClient, JobAttributes};
use crate::config::MAX_PAGE_LIMIT;
use crate::error::{NbuError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Hard ceiling on pages per walk, whatever the server claims.
pub const MAX_PAGES: usize = 10_000;

const UNKNOWN: &str = "unknown";

/// Pagination metadata as reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PaginationCursor {
    /// Offset of the returned page
    #[serde(default)]
    pub offset: u64,
    /// Offset of the last page
    #[serde(default)]
    pub last: u64,
    /// Offset of the following page, absent on the last page
    #[serde(default)]
    pub next: Option<u64>,
}

impl PaginationCursor {
    pub fn is_last_page(&self) -> bool {
        self.offset >= self.last
    }
}

/// Label tuple for per-job families: (action, policy_type, status).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub action: String,
    pub policy_type: String,
    pub status: String,
}

impl JobKey {
    pub fn new(action: &str, policy_type: &str, status: &str) -> Self {
        Self {
            action: action.to_string(),
            policy_type: policy_type.to_string(),
            status: status.to_string(),
        }
    }

    pub fn labels(&self) -> [&str; 3] {
        [&self.action, &self.policy_type, &self.status]
    }
}

/// Label tuple for the status family: (action, status).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusKey {
    pub action: String,
    pub status: String,
}

impl StatusKey {
    pub fn new(action: &str, status: &str) -> Self {
        Self {
            action: action.to_string(),
            status: status.to_string(),
        }
    }

    pub fn labels(&self) -> [&str; 2] {
        [&self.action, &self.status]
    }
}

/// Per-cycle job aggregates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobAccumulators {
    /// Number of jobs per (action, policy_type, status)
    pub count: HashMap<JobKey, u64>,
    /// Bytes transferred per (action, policy_type, status)
    pub bytes: HashMap<JobKey, u64>,
    /// Number of jobs per (action, status)
    pub status_count: HashMap<StatusKey, u64>,
}

impl JobAccumulators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one job to every accumulator.
    ///
    /// Missing labels become `"unknown"`; missing or negative transfer sizes
    /// count as zero bytes.
    pub fn fold(&mut self, job: &JobAttributes) {
        let action = job.job_type.as_deref().unwrap_or(UNKNOWN);
        let policy_type = job.policy_type.as_deref().unwrap_or(UNKNOWN);
        let status = job
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        let bytes = (job.kilobytes_transferred.unwrap_or(0).max(0) as u64).saturating_mul(1024);

        let key = JobKey::new(action, policy_type, &status);
        *self.count.entry(key.clone()).or_insert(0) += 1;
        let total = self.bytes.entry(key).or_insert(0);
        *total = total.saturating_add(bytes);
        *self
            .status_count
            .entry(StatusKey::new(action, &status))
            .or_insert(0) += 1;
    }

    /// Total number of jobs folded.
    pub fn jobs(&self) -> u64 {
        self.count.values().sum()
    }

    /// Number of samples these accumulators expose.
    pub fn samples(&self) -> usize {
        self.count.len() + self.bytes.len() + self.status_count.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count.is_empty()
    }
}

/// What to do after a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStep {
    /// Request the page at this offset next
    Next(u64),
    /// No further pages
    Done,
}

/// Result of fetching one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub step: PageStep,
    pub items: usize,
    pub cursor: Option<PaginationCursor>,
}

/// Totals of a completed walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub pages: usize,
    pub jobs: u64,
}

/// Walks the jobs endpoint for one time window.
pub struct JobWalker<'a> {
    client: &'a ApiClient,
    version: &'a str,
    page_limit: u32,
    ended_after: DateTime<Utc>,
}

impl<'a> JobWalker<'a> {
    /// `page_limit` is clamped to `1..=100`.
    pub fn new(
        client: &'a ApiClient,
        version: &'a str,
        page_limit: u32,
        ended_after: DateTime<Utc>,
    ) -> Self {
        Self {
            client,
            version,
            page_limit: page_limit.clamp(1, MAX_PAGE_LIMIT),
            ended_after,
        }
    }

    /// Fetch the page at `offset` and fold its jobs into `acc`.
    pub async fn fetch_page(&self, offset: u64, acc: &mut JobAccumulators) -> Result<Page> {
        let response = self
            .client
            .get_jobs_page(self.version, self.page_limit, offset, self.ended_after)
            .await?;

        for job in &response.data {
            acc.fold(&job.attributes);
        }

        let items = response.data.len();
        let cursor = response.cursor().copied();
        Ok(Page {
            step: next_step(offset, items, cursor.as_ref()),
            items,
            cursor,
        })
    }

    /// Fetch every page from offset 0, folding all of them into `acc`.
    ///
    /// Any page error aborts the walk. The number of pages is bounded by the
    /// `last` offset reported on the first page.
    #[instrument(skip(self, acc), fields(version = self.version, page_limit = self.page_limit))]
    pub async fn walk(&self, acc: &mut JobAccumulators) -> Result<WalkSummary> {
        let mut offset = 0;
        let mut summary = WalkSummary::default();
        let mut max_pages = MAX_PAGES;

        loop {
            if summary.pages >= max_pages {
                return Err(NbuError::PaginationOverrun {
                    pages: summary.pages,
                });
            }

            let page = self.fetch_page(offset, acc).await?;
            summary.pages += 1;
            summary.jobs += page.items as u64;

            if summary.pages == 1 {
                if let Some(cursor) = page.cursor {
                    max_pages = page_bound(cursor.last, self.page_limit);
                }
            }

            match page.step {
                PageStep::Next(next) => offset = next,
                PageStep::Done => break,
            }
        }

        debug!(
            "Job walk finished: {} jobs in {} pages",
            summary.jobs, summary.pages
        );
        Ok(summary)
    }
}

/// A page is terminal when it is empty or the server says it is the last one.
fn next_step(offset: u64, items: usize, cursor: Option<&PaginationCursor>) -> PageStep {
    if items == 0 {
        return PageStep::Done;
    }

    match cursor {
        None => PageStep::Done,
        Some(cursor) if cursor.is_last_page() => PageStep::Done,
        Some(cursor) => {
            let fallback = offset + items as u64;
            PageStep::Next(cursor.next.filter(|n| *n > offset).unwrap_or(fallback))
        }
    }
}

/// Pages needed to reach `last`, plus one for a trailing empty page.
fn page_bound(last: u64, page_limit: u32) -> usize {
    let pages = last / u64::from(page_limit.max(1)) + 2;
    usize::try_from(pages).unwrap_or(MAX_PAGES).min(MAX_PAGES)
}
