//! API version negotiation.
//!
//! NetBackup primary servers only accept the API versions their release
//! ships with and answer anything else with `406 Not Acceptable`. The
//! negotiator probes the candidates from newest to oldest and returns the
//! first one the server accepts. The candidate version is passed to each
//! probe request directly, so nothing shared is touched until the caller
//! commits the result.

use crate::client::ApiClient;
use crate::error::{NbuError, Result};
use crate::retry::RetryPolicy;
use tracing::{debug, instrument, warn};
use url::Url;

/// API versions this exporter understands, highest preference first.
pub const SUPPORTED_API_VERSIONS: &[&str] = &["13.0", "12.0", "3.0"];

/// Result of a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Version the server accepted
    pub version: String,
    /// Every version probed, in probe order, including the accepted one
    pub attempted: Vec<String>,
}

enum Verdict {
    Accept,
    Reject(NbuError),
    Abort(NbuError),
}

/// Probes candidate versions against the server.
pub struct VersionNegotiator<'a> {
    client: &'a ApiClient,
    candidates: Vec<String>,
    retry: RetryPolicy,
}

impl<'a> VersionNegotiator<'a> {
    /// `candidates` are tried in the order given.
    pub fn new(client: &'a ApiClient, candidates: Vec<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            candidates,
            retry,
        }
    }

    /// Negotiator over [`SUPPORTED_API_VERSIONS`] using the client's retry policy.
    pub fn with_defaults(client: &'a ApiClient) -> Self {
        Self::new(
            client,
            SUPPORTED_API_VERSIONS.iter().map(|v| v.to_string()).collect(),
            client.config().retry.clone(),
        )
    }

    /// Find the first candidate version the server accepts.
    ///
    /// Any 2xx answer to a probe accepts the candidate, whatever its body.
    /// A `401` aborts immediately with [`NbuError::Authentication`]; if every
    /// candidate is rejected the result is [`NbuError::NoCompatibleVersion`].
    #[instrument(skip(self), fields(candidates = ?self.candidates))]
    pub async fn negotiate(&self) -> Result<Negotiation> {
        let url = self.client.probe_url()?;
        let mut attempted = Vec::with_capacity(self.candidates.len());

        for candidate in &self.candidates {
            attempted.push(candidate.clone());
            debug!("Probing API version {}", candidate);

            match self.probe_candidate(&url, candidate).await {
                Verdict::Accept => {
                    debug!("Server accepted API version {}", candidate);
                    return Ok(Negotiation {
                        version: candidate.clone(),
                        attempted,
                    });
                }
                Verdict::Reject(reason) => {
                    warn!("API version {} rejected: {}", candidate, reason);
                }
                Verdict::Abort(err) => return Err(err),
            }
        }

        Err(NbuError::NoCompatibleVersion { attempted })
    }

    async fn probe_candidate(&self, url: &Url, version: &str) -> Verdict {
        let mut attempt = 1;

        loop {
            let err = match self.client.probe(url, version).await {
                Ok(()) => return Verdict::Accept,
                Err(err) => err,
            };

            match err {
                NbuError::HttpStatus { status: 401, .. } => {
                    return Verdict::Abort(NbuError::Authentication {
                        url: url.to_string(),
                        version: version.to_string(),
                    });
                }
                NbuError::Closed => return Verdict::Abort(err),
                NbuError::UnsupportedVersion { .. } => return Verdict::Reject(err),
                _ if is_transient(&err) && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Probe {}/{} for API version {} failed: {}; retrying in {:?}",
                        attempt,
                        self.retry.attempts(),
                        version,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                _ => return Verdict::Reject(err),
            }
        }
    }
}

fn is_transient(err: &NbuError) -> bool {
    match err {
        NbuError::Transport { .. } => true,
        NbuError::HttpStatus { status, .. } => matches!(status, 500 | 502 | 503 | 504),
        _ => false,
    }
}
