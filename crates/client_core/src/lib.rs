//! Client-side control loop for the archive server. One `run_cycle` drives a
//! full sync-then-media pass over the HTTP API: adaptive media batches,
//! exponential backoff on rate limits, a bounded timeout budget, and local
//! reconciliation of per-item outcomes so the caller's view stays current
//! without re-fetching pages.
//!
//! The loop carries its progress in small immutable records (`BackoffState`,
//! `BatchController`) threaded through each iteration, so every policy
//! decision is a pure function testable without a network.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use shared::{
    domain::{MediaStatus, MessageRowId, SyncMode},
    protocol::{MediaItemOutcome, MessageView, SyncResponse},
};
use thiserror::Error;
use tracing::{info, warn};

pub mod transport;

pub use transport::{ArchiveTransport, HttpTransport, TransportError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Credentials are no longer valid; retrying cannot succeed without
    /// external action.
    #[error("re-authentication required: {0}")]
    ReauthRequired(String),
    #[error("timeout retry budget exhausted")]
    TimeoutBudgetExhausted,
    #[error("cycle cancelled")]
    Cancelled,
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_sync_iterations: u32,
    pub max_media_batches: u32,
    pub min_batch: u32,
    pub max_batch: u32,
    /// Consecutive successful batches required before the size may grow.
    pub growth_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub timeout_retries: u32,
    pub timeout_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_sync_iterations: 50,
            max_media_batches: 100,
            min_batch: 1,
            max_batch: 10,
            growth_threshold: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            timeout_retries: 3,
            timeout_delay: Duration::from_secs(2),
        }
    }
}

/// Consecutive-rate-limit counter. The wait for the n-th consecutive signal
/// is `base * 2^n` capped at the ceiling; a server-supplied hint always wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    consecutive: u32,
}

impl BackoffState {
    pub fn wait(self, config: &OrchestratorConfig, hint: Option<u64>) -> Duration {
        if let Some(seconds) = hint {
            return Duration::from_secs(seconds);
        }
        let shift = self.consecutive.min(16);
        let computed = config.backoff_base.saturating_mul(1u32 << shift);
        computed.min(config.backoff_cap)
    }

    pub fn escalate(self) -> Self {
        Self {
            consecutive: self.consecutive.saturating_add(1),
        }
    }

    pub fn reset(self) -> Self {
        Self::default()
    }
}

/// Media batch sizing. Grows one step after a run of consecutive successes;
/// any pressure signal (rate limit, timeout) drops straight back to the
/// minimum and restarts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchController {
    size: u32,
    consecutive_successes: u32,
}

impl BatchController {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            size: config.min_batch,
            consecutive_successes: 0,
        }
    }

    pub fn size(self) -> u32 {
        self.size
    }

    pub fn on_success(self, config: &OrchestratorConfig) -> Self {
        let consecutive_successes = self.consecutive_successes + 1;
        if consecutive_successes >= config.growth_threshold {
            Self {
                size: (self.size + 1).min(config.max_batch),
                consecutive_successes: 0,
            }
        } else {
            Self {
                size: self.size,
                consecutive_successes,
            }
        }
    }

    pub fn on_pressure(self, config: &OrchestratorConfig) -> Self {
        Self::new(config)
    }
}

/// Shared cancellation flag checked between calls; an in-flight request is
/// allowed to finish.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Client-side message view, reconciled optimistically from sync windows and
/// per-item media outcomes instead of re-fetching pages.
#[derive(Default)]
pub struct LocalArchive {
    media_base_url: String,
    messages: HashMap<MessageRowId, LocalMessage>,
}

pub struct LocalMessage {
    pub view: MessageView,
    /// Display URL for the archived blob, set once the media completes.
    pub media_url: Option<String>,
}

impl LocalArchive {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            media_base_url: server_url.into().trim_end_matches('/').to_string(),
            messages: HashMap::new(),
        }
    }

    pub fn get(&self, id: MessageRowId) -> Option<&LocalMessage> {
        self.messages.get(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn apply_sync(&mut self, response: &SyncResponse) {
        for view in &response.messages {
            let media_url = view
                .media_key
                .as_deref()
                .map(|key| self.media_url_for(key));
            self.messages.insert(
                view.id,
                LocalMessage {
                    view: view.clone(),
                    media_url,
                },
            );
        }
    }

    pub fn apply_media_outcome(&mut self, outcome: &MediaItemOutcome) {
        let media_url = outcome
            .media_key
            .as_deref()
            .map(|key| self.media_url_for(key));
        let Some(local) = self.messages.get_mut(&outcome.message_id) else {
            return;
        };
        local.view.media_status = outcome.status;
        if let Some(key) = &outcome.media_key {
            local.view.media_key = Some(key.clone());
            local.media_url = media_url;
        }
    }

    fn media_url_for(&self, key: &str) -> String {
        format!("{}/media/{key}", self.media_base_url)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub sync_calls: u32,
    pub synced: u64,
    pub backfilled: u64,
    pub media_calls: u32,
    pub media_completed: u64,
    pub media_skipped: u64,
    pub media_failed: u64,
    pub media_remaining: u64,
}

pub struct Orchestrator {
    transport: Arc<dyn ArchiveTransport>,
    config: OrchestratorConfig,
    cancel: CancelFlag,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn ArchiveTransport>, config: OrchestratorConfig) -> Self {
        Self {
            transport,
            config,
            cancel: CancelFlag::new(),
        }
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// One full archiving pass: drain the sync endpoint, then drain the media
    /// backlog. Per-item failures are reconciled and counted, never fatal;
    /// only credential failures and an exhausted timeout budget abort.
    pub async fn run_cycle(
        &self,
        view: &mut LocalArchive,
    ) -> Result<CycleReport, OrchestratorError> {
        let mut report = CycleReport::default();
        self.sync_phase(view, &mut report).await?;
        self.media_phase(view, &mut report).await?;
        info!(
            sync_calls = report.sync_calls,
            synced = report.synced,
            media_calls = report.media_calls,
            completed = report.media_completed,
            remaining = report.media_remaining,
            "archive cycle finished"
        );
        Ok(report)
    }

    async fn sync_phase(
        &self,
        view: &mut LocalArchive,
        report: &mut CycleReport,
    ) -> Result<(), OrchestratorError> {
        let mut backoff = BackoffState::default();
        let mut timeouts_left = self.config.timeout_retries;
        let mut consecutive_zero = 0u32;

        // Every transport invocation counts toward the safety bound, retried
        // iterations included, so sustained throttling cannot spin forever.
        let mut attempts = 0u32;
        while attempts < self.config.max_sync_iterations {
            attempts += 1;
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            match self.transport.sync().await {
                Ok(response) => {
                    backoff = backoff.reset();
                    timeouts_left = self.config.timeout_retries;
                    report.sync_calls += 1;
                    match response.mode {
                        SyncMode::Forward => report.synced += response.synced,
                        SyncMode::Backfill => report.backfilled += response.synced,
                    }
                    view.apply_sync(&response);

                    if response.synced == 0 {
                        consecutive_zero += 1;
                        if consecutive_zero >= 2 {
                            break;
                        }
                    } else {
                        consecutive_zero = 0;
                    }

                    if response.cooldown_seconds > 0 {
                        tokio::time::sleep(Duration::from_secs(response.cooldown_seconds)).await;
                    }
                }
                Err(TransportError::RateLimited {
                    retry_after_seconds,
                }) => {
                    let wait = backoff.wait(&self.config, retry_after_seconds);
                    warn!(wait_ms = wait.as_millis() as u64, "sync rate limited");
                    tokio::time::sleep(wait).await;
                    backoff = backoff.escalate();
                }
                Err(TransportError::Timeout) => {
                    if timeouts_left == 0 {
                        return Err(OrchestratorError::TimeoutBudgetExhausted);
                    }
                    timeouts_left -= 1;
                    tokio::time::sleep(self.config.timeout_delay).await;
                }
                Err(TransportError::Credential(message)) => {
                    return Err(OrchestratorError::ReauthRequired(message));
                }
                Err(TransportError::Http(message)) => {
                    return Err(OrchestratorError::Transport(message));
                }
            }
        }

        Ok(())
    }

    async fn media_phase(
        &self,
        view: &mut LocalArchive,
        report: &mut CycleReport,
    ) -> Result<(), OrchestratorError> {
        let mut backoff = BackoffState::default();
        let mut batch = BatchController::new(&self.config);
        let mut timeouts_left = self.config.timeout_retries;

        let mut attempts = 0u32;
        while attempts < self.config.max_media_batches {
            attempts += 1;
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            match self.transport.process_media(batch.size()).await {
                Ok(response) => {
                    backoff = backoff.reset();
                    timeouts_left = self.config.timeout_retries;
                    report.media_calls += 1;
                    report.media_remaining = response.remaining;

                    for outcome in &response.outcomes {
                        view.apply_media_outcome(outcome);
                        if outcome.skipped {
                            report.media_skipped += 1;
                        } else if outcome.status == MediaStatus::Completed {
                            report.media_completed += 1;
                        } else {
                            report.media_failed += 1;
                        }
                    }

                    batch = batch.on_success(&self.config);
                    if response.remaining == 0 {
                        break;
                    }
                }
                Err(TransportError::RateLimited {
                    retry_after_seconds,
                }) => {
                    let wait = backoff.wait(&self.config, retry_after_seconds);
                    warn!(
                        wait_ms = wait.as_millis() as u64,
                        batch = batch.size(),
                        "media batch rate limited, entering recovery"
                    );
                    batch = batch.on_pressure(&self.config);
                    tokio::time::sleep(wait).await;
                    backoff = backoff.escalate();
                }
                Err(TransportError::Timeout) => {
                    if timeouts_left == 0 {
                        return Err(OrchestratorError::TimeoutBudgetExhausted);
                    }
                    timeouts_left -= 1;
                    batch = batch.on_pressure(&self.config);
                    tokio::time::sleep(self.config.timeout_delay).await;
                }
                Err(TransportError::Credential(message)) => {
                    return Err(OrchestratorError::ReauthRequired(message));
                }
                Err(TransportError::Http(message)) => {
                    return Err(OrchestratorError::Transport(message));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
