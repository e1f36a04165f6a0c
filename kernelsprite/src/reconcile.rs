use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use common::types::{compare_ids, Domain, TrackedItem};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{CycleError, PersistError};
use crate::source::RemoteSource;
use crate::store::{Parked, RecordStore};

/// Failed actions after which a parked item is dropped for good.
pub const RETRY_LIMIT: u32 = 5;

/// What a failed action does to the rest of the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Act on every new item first, then settle them in one atomic batch.
    /// The first failed action discards the whole batch.
    #[default]
    DiscardBatch,
    /// Every new item is read, acted on and settled on its own. A failure
    /// leaves only that item unsettled.
    PerItem,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown failure policy '{0}' (expected discard-batch or per-item)")]
pub struct UnknownPolicy(pub String);

impl FromStr for FailurePolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "discard-batch" => Ok(FailurePolicy::DiscardBatch),
            "per-item" => Ok(FailurePolicy::PerItem),
            other => Err(UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::DiscardBatch => f.write_str("discard-batch"),
            FailurePolicy::PerItem => f.write_str("per-item"),
        }
    }
}

/// Counts for one cycle. Logged, never acted upon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub domain: Domain,
    pub fetched: usize,
    pub new: usize,
    pub acted: usize,
    pub persisted: usize,
    pub failed: usize,
    /// Parked items given another attempt.
    pub retried: usize,
    /// Items parked by this cycle.
    pub parked: usize,
}

impl CycleReport {
    fn new(domain: Domain, fetched: usize) -> Self {
        Self {
            domain,
            fetched,
            new: 0,
            acted: 0,
            persisted: 0,
            failed: 0,
            retried: 0,
            parked: 0,
        }
    }
}

/// Snapshot items the cursor may move past.
#[derive(Default)]
struct Passed<'a> {
    keys: HashSet<&'a str>,
    markers: HashSet<&'a str>,
}

impl<'a> Passed<'a> {
    fn insert(&mut self, item: &'a TrackedItem) {
        self.keys.insert(item.key.as_str());
        self.markers.insert(item.marker.as_str());
    }
}

/// Compares remote snapshots against the record store and acts on what is
/// new. Owns shared handles to both; built once at startup.
pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    source: Arc<dyn RemoteSource>,
    policy: FailurePolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        source: Arc<dyn RemoteSource>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            source,
            policy,
        }
    }

    /// Runs fetch, classify, act and persist for `domain` once.
    ///
    /// A cycle that starts cancelled touches nothing. Later cancellation
    /// aborts an in-flight fetch, or stops the item loop after recording
    /// every item already acted on.
    ///
    /// For cursored domains a failed action parks the item, which lets the
    /// cursor move past it. Parked items get one more attempt at the start of
    /// every later cycle until they succeed or reach [`RETRY_LIMIT`].
    pub async fn run_cycle(
        &self,
        domain: Domain,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        if shutdown.is_cancelled() {
            return Err(CycleError::Cancelled(domain));
        }

        let cursor = if domain.uses_cursor() {
            self.store.cursor(domain)?
        } else {
            None
        };

        let snapshot = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(CycleError::Cancelled(domain)),
            fetched = self.source.fetch_snapshot(domain, cursor.as_deref()) => {
                fetched.map_err(|source| CycleError::Fetch { domain, source })?
            }
        };
        tracing::info!(%domain, fetched = snapshot.len(), cursor = ?cursor, "fetched snapshot");

        let mut report = CycleReport::new(domain, snapshot.len());
        let held = if domain.uses_cursor() {
            self.retry_parked(domain, &mut report, shutdown).await?
        } else {
            HashSet::new()
        };

        let passed = match self.policy {
            FailurePolicy::DiscardBatch => {
                self.settle_batch(domain, &snapshot, &held, &mut report, shutdown)
                    .await?
            }
            FailurePolicy::PerItem => {
                self.settle_each(domain, &snapshot, &held, &mut report, shutdown)
                    .await?
            }
        };

        if domain.uses_cursor() {
            if let Some(next) = advance_cursor(cursor.as_deref(), &snapshot, &passed.markers) {
                self.store.set_cursor(domain, &next)?;
                tracing::debug!(%domain, cursor = %next, "advanced cursor");
            }
        }

        Ok(report)
    }

    /// Gives every parked item one more action attempt. Returns the keys that
    /// stay out of this cycle's snapshot pass: still parked, given up on, or
    /// not reached before shutdown.
    async fn retry_parked(
        &self,
        domain: Domain,
        report: &mut CycleReport,
        shutdown: &CancellationToken,
    ) -> Result<HashSet<String>, CycleError> {
        let mut held = HashSet::new();

        for Parked { item, attempts } in self.store.parked(domain)? {
            if shutdown.is_cancelled() {
                held.insert(item.key);
                continue;
            }
            if self.store.get(domain, &item.key)?.is_some() {
                self.store.unpark(domain, &item.marker)?;
                continue;
            }

            report.retried += 1;
            match self.source.act(domain, &item).await {
                Ok(()) => {
                    report.acted += 1;
                    match self.store.settle(domain, &item.key, &item.marker) {
                        Ok(inserted) => {
                            if inserted {
                                report.persisted += 1;
                            }
                            self.store.unpark(domain, &item.marker)?;
                            tracing::debug!(%domain, key = %item.key, attempts, "retry succeeded");
                            continue;
                        }
                        Err(e) => {
                            report.failed += 1;
                            tracing::error!(
                                %domain,
                                key = %item.key,
                                error = %e,
                                "could not record retried item, it stays parked"
                            );
                        }
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    let attempts = attempts + 1;
                    if attempts >= RETRY_LIMIT {
                        tracing::warn!(
                            %domain,
                            key = %item.key,
                            attempts,
                            error = %e,
                            "giving up on item"
                        );
                        self.store.unpark(domain, &item.marker)?;
                    } else {
                        tracing::warn!(%domain, key = %item.key, attempts, error = %e, "retry failed");
                        self.store.park(
                            domain,
                            &Parked {
                                item: item.clone(),
                                attempts,
                            },
                        )?;
                    }
                }
            }
            held.insert(item.key);
        }

        Ok(held)
    }

    /// Parks `item` after its first failed action. Only cursored domains
    /// park; the others see the item again in their next full snapshot.
    fn park_failed(&self, domain: Domain, item: &TrackedItem) -> Result<bool, PersistError> {
        if !domain.uses_cursor() {
            return Ok(false);
        }
        self.store.park(
            domain,
            &Parked {
                item: item.clone(),
                attempts: 1,
            },
        )?;
        Ok(true)
    }

    async fn settle_each<'a>(
        &self,
        domain: Domain,
        snapshot: &'a [TrackedItem],
        held: &HashSet<String>,
        report: &mut CycleReport,
        shutdown: &CancellationToken,
    ) -> Result<Passed<'a>, CycleError> {
        let mut passed = Passed::default();
        let mut seen = HashSet::new();

        for item in snapshot {
            if shutdown.is_cancelled() {
                tracing::info!(%domain, "shutdown requested, leaving remaining items for later");
                break;
            }

            if self.store.get(domain, &item.key)?.is_some() || held.contains(&item.key) {
                passed.insert(item);
                continue;
            }
            if !seen.insert(item.key.as_str()) {
                if passed.keys.contains(item.key.as_str()) {
                    passed.insert(item);
                }
                continue;
            }

            report.new += 1;
            if let Err(e) = self.source.act(domain, item).await {
                tracing::warn!(%domain, key = %item.key, error = %e, "action failed, moving on");
                report.failed += 1;
                if self.park_failed(domain, item)? {
                    report.parked += 1;
                    passed.insert(item);
                }
                continue;
            }
            report.acted += 1;
            tracing::debug!(
                %domain,
                key = %item.key,
                created_at = ?item.created_at,
                "{} done",
                domain.action()
            );

            match self.store.settle(domain, &item.key, &item.marker) {
                Ok(inserted) => {
                    if inserted {
                        report.persisted += 1;
                    }
                    passed.insert(item);
                }
                Err(e) => {
                    tracing::error!(
                        %domain,
                        key = %item.key,
                        error = %e,
                        "could not record item, it will be acted on again"
                    );
                    report.failed += 1;
                }
            }
        }

        Ok(passed)
    }

    async fn settle_batch<'a>(
        &self,
        domain: Domain,
        snapshot: &'a [TrackedItem],
        held: &HashSet<String>,
        report: &mut CycleReport,
        shutdown: &CancellationToken,
    ) -> Result<Passed<'a>, CycleError> {
        let mut passed = Passed::default();
        let mut fresh: Vec<&'a TrackedItem> = Vec::new();
        let mut seen = HashSet::new();

        for item in snapshot {
            if shutdown.is_cancelled() {
                tracing::info!(
                    %domain,
                    acted = fresh.len(),
                    "shutdown requested, recording what was already acted on"
                );
                break;
            }

            if self.store.get(domain, &item.key)?.is_some() || held.contains(&item.key) {
                passed.insert(item);
                continue;
            }
            if !seen.insert(item.key.as_str()) {
                continue;
            }

            report.new += 1;
            if let Err(source) = self.source.act(domain, item).await {
                report.failed += 1;
                if self.park_failed(domain, item)? {
                    report.parked += 1;
                }
                tracing::warn!(
                    %domain,
                    key = %item.key,
                    acted = report.acted,
                    discarded = fresh.len(),
                    "action failed, discarding batch"
                );
                return Err(CycleError::BatchDiscarded { domain, source });
            }
            report.acted += 1;
            fresh.push(item);
        }

        self.store.put_batch(domain, &fresh)?;
        report.persisted += fresh.len();

        let recorded: HashSet<&str> = fresh.iter().map(|item| item.key.as_str()).collect();
        for item in snapshot {
            if recorded.contains(item.key.as_str()) {
                passed.insert(item);
            }
        }

        Ok(passed)
    }
}

/// Highest id such that every snapshot item at or below it was passed, or
/// `None` when the cursor would not move forward.
fn advance_cursor(
    current: Option<&str>,
    snapshot: &[TrackedItem],
    passed: &HashSet<&str>,
) -> Option<String> {
    let mut ids: Vec<&str> = snapshot.iter().map(|item| item.marker.as_str()).collect();
    ids.sort_by(|a, b| compare_ids(a, b));
    ids.dedup();

    let candidate = ids
        .into_iter()
        .take_while(|id| passed.contains(id))
        .last()?;

    match current {
        Some(current) if compare_ids(candidate, current) != Ordering::Greater => None,
        _ => Some(candidate.to_string()),
    }
}
