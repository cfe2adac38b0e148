/// Phase aggregator: race-free completion tracking for fan-out phases
///
/// Workers report partial results concurrently and possibly out of order.
/// Each report is folded into the scan record by one atomic conditional
/// update, and the caller whose report performs the final increment is the
/// only one that gets the completed record back. That single return value is
/// the completion signal downstream work hangs off.

use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::scan::cache::PhaseCache;
use crate::scan::storage::ScanRecordStore;
use crate::scan::types::{NewPhase, ScanRecord, ScanStatus};
use crate::store::with_retry;
use chrono::Utc;
use std::time::Duration;
use uuid::Uuid;

/// Fan-in counter over the scan record store
#[derive(Debug)]
pub struct PhaseAggregator {
    store: ScanRecordStore,
    cache: PhaseCache,
    retry: RetryConfig,
}

impl PhaseAggregator {
    pub fn new(store: ScanRecordStore, retry: RetryConfig, cache: PhaseCache) -> Self {
        Self {
            store,
            cache,
            retry,
        }
    }

    /// Start tracking a phase with all counters at zero
    ///
    /// A phase expecting zero results has nothing to wait for and is created
    /// COMPLETED. Fails with `DuplicatePhase` while a record for the token
    /// exists.
    pub async fn begin_phase(&self, phase: NewPhase) -> Result<ScanRecord> {
        if !(0.0..=1.0).contains(&phase.failure_threshold) {
            return Err(Error::invalid_input(format!(
                "failure threshold must be within [0, 1], got {}",
                phase.failure_threshold
            )));
        }

        let now = Utc::now();
        let record = ScanRecord {
            token: phase.token,
            target_type: phase.target_type,
            target_identifier: phase.target_identifier,
            owner: phase.owner,
            expected_results: phase.expected_results,
            received_results: 0,
            scan_total: 0,
            scan_failed: 0,
            failure_threshold: phase.failure_threshold,
            status: if phase.expected_results == 0 {
                ScanStatus::Completed
            } else {
                ScanStatus::InProgress
            },
            started_at: now,
            updated_at: now,
        };

        self.store.insert(&record).await?;
        self.cache.insert(&record);

        tracing::info!(
            "📡 Began phase {} expecting {} result(s) (threshold {})",
            record.token,
            record.expected_results,
            record.failure_threshold
        );
        Ok(record)
    }

    /// Read-only snapshot of a phase
    ///
    /// Only the calls that close a phase fill the cache; a plain read could
    /// otherwise put back a record an override has just replaced.
    pub async fn get_phase(&self, token: Uuid) -> Result<Option<ScanRecord>> {
        if let Some(cached) = self.cache.get(&token) {
            return Ok(Some(cached));
        }
        self.store.find(token).await
    }

    /// Fold one partial-result report into the phase
    ///
    /// Returns the post-update record only when this call moved the phase to
    /// COMPLETED; every other call, including late or duplicate deliveries to
    /// an already closed phase, returns `None`. Transient storage errors are
    /// retried a bounded number of times before surfacing.
    pub async fn ingest_result(
        &self,
        token: Uuid,
        result_count: u32,
        failed_count: u32,
    ) -> Result<Option<ScanRecord>> {
        if failed_count > result_count {
            return Err(Error::invalid_input(format!(
                "failed count {failed_count} exceeds result count {result_count}"
            )));
        }

        let store = &self.store;
        let updated = with_retry(&self.retry, "result ingestion", move || {
            store.record_result(token, result_count, failed_count, Utc::now())
        })
        .await?;

        match updated {
            Some(record) if record.status == ScanStatus::Completed => {
                self.cache.insert(&record);
                tracing::info!(
                    "🏁 Phase {} completed: {}/{} results, {} of {} scans failed",
                    token,
                    record.received_results,
                    record.expected_results,
                    record.scan_failed,
                    record.scan_total
                );
                Ok(Some(record))
            }
            Some(record) => {
                tracing::debug!(
                    "📥 Phase {} received {}/{} results",
                    token,
                    record.received_results,
                    record.expected_results
                );
                Ok(None)
            }
            None => match self.get_phase(token).await? {
                Some(existing) => {
                    tracing::debug!(
                        "⏭️ Ignoring late result for phase {} (status {})",
                        token,
                        existing.status
                    );
                    Ok(None)
                }
                None => Err(Error::not_found(format!("phase {token}"))),
            },
        }
    }

    /// Administrative status override; counters are left untouched
    pub async fn update_phase_status(&self, token: Uuid, status: ScanStatus) -> Result<ScanRecord> {
        let record = self
            .store
            .update_status(token, status, Utc::now())
            .await?
            .ok_or_else(|| Error::not_found(format!("phase {token}")))?;

        if record.status.is_terminal() {
            self.cache.insert(&record);
        } else {
            self.cache.invalidate(&token);
        }
        tracing::warn!("✏️ Phase {} status overridden to {}", token, status);
        Ok(record)
    }

    /// Mark an open phase FAILED without counting a result
    ///
    /// Returns `None` when the phase closed in the meantime, so a final
    /// report racing the sweeper keeps its completion.
    pub async fn expire_phase(&self, token: Uuid) -> Result<Option<ScanRecord>> {
        let store = &self.store;
        let expired = with_retry(&self.retry, "phase expiry", move || {
            store.close_if_open(token, ScanStatus::Failed, Utc::now())
        })
        .await?;

        if let Some(record) = &expired {
            self.cache.insert(record);
            tracing::warn!(
                "⌛ Phase {} expired with {}/{} results",
                token,
                record.received_results,
                record.expected_results
            );
        }
        Ok(expired)
    }

    /// Closed phases whose owning step is still IN_PROGRESS after `older_than`
    pub async fn unsettled_phases(&self, older_than: Duration) -> Result<Vec<ScanRecord>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::invalid_input(format!("settlement grace out of range: {e}")))?;
        self.store.find_unsettled(Utc::now() - age).await
    }

    /// IN_PROGRESS phases that have not received anything for `older_than`
    pub async fn stale_phases(&self, older_than: Duration) -> Result<Vec<ScanRecord>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| Error::invalid_input(format!("staleness threshold out of range: {e}")))?;
        self.store.find_stale(Utc::now() - age).await
    }

    /// Forget a phase so its token may be reused
    pub async fn reap_phase(&self, token: Uuid) -> Result<()> {
        self.cache.invalidate(&token);
        if !self.store.delete(token).await? {
            return Err(Error::not_found(format!("phase {token}")));
        }
        tracing::info!("🧹 Reaped phase {}", token);
        Ok(())
    }
}
