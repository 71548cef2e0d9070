use std::future::Future;

use chrono::{Local, NaiveDateTime};

use crate::{
    fingerprint::{Fingerprint, KeyGrowth, compare_keys, fingerprint_and_keys},
    flow::FlowRecord,
    retry::RetryPolicy,
    store::{ExistingFlow, FlowStore, StoreError, StoredFlowEntry},
    tail::RecordSource,
};

/// What happened to one processed flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted {
        id: i64,
    },
    /// The fingerprint was already stored. The stored row is left untouched even when the new
    /// observation carries more query keys.
    Skipped {
        existing_id: i64,
        key_growth: KeyGrowth,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: u64,
    pub skipped: u64,
    pub dropped: u64,
}

/// Applies the read-before-write dedup policy to decoded flows.
///
/// Owns the store handle for the lifetime of the pipeline; `into_store` hands it back for
/// closing.
pub struct Ingestor<S> {
    store: S,
    retry: RetryPolicy,
    stats: IngestStats,
    clock: fn() -> NaiveDateTime,
}

impl<S: FlowStore + Send> Ingestor<S> {
    pub fn new(store: S, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            stats: IngestStats::default(),
            clock: local_now,
        }
    }

    /// Replaces the wall clock used for creation timestamps.
    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Fingerprints `record`, then inserts it unless its fingerprint is already stored.
    pub async fn process(&mut self, record: &FlowRecord) -> Result<Outcome, StoreError> {
        let (fingerprint, keys) = fingerprint_and_keys(record);

        if let Some(existing) = self.lookup(&fingerprint).await? {
            let key_growth = compare_keys(&existing.keys, &keys);
            self.stats.skipped += 1;
            tracing::info!(
                host = %record.request.host,
                fingerprint = %fingerprint,
                keys = %keys,
                outcome = "skipped",
                existing_id = existing.id,
                stored_keys = %existing.keys,
                key_growth = key_growth.as_str(),
                "flow already stored"
            );
            return Ok(Outcome::Skipped {
                existing_id: existing.id,
                key_growth,
            });
        }

        let entry = StoredFlowEntry::from_record(record, fingerprint, keys, (self.clock)());
        let id = self.insert(&entry).await?;
        self.stats.inserted += 1;
        tracing::info!(
            host = %entry.host,
            fingerprint = %entry.fingerprint,
            keys = %entry.keys,
            outcome = "inserted",
            id,
            "flow stored"
        );
        Ok(Outcome::Inserted { id })
    }

    /// Processes records from `source` until it is exhausted or `shutdown` resolves.
    ///
    /// Store failures only drop the record at hand. A source error ends the run. A store call
    /// still pending when `shutdown` resolves is abandoned along with its record.
    pub async fn run<R, F>(&mut self, source: &mut R, shutdown: F) -> anyhow::Result<IngestStats>
    where
        R: RecordSource,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping ingestion");
                    break;
                }
                next = source.next_record() => next?,
            };
            let Some(record) = next else {
                tracing::info!("record source exhausted");
                break;
            };

            let result = tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!(
                        host = %record.request.host,
                        "shutdown requested while storing a flow, abandoning it"
                    );
                    break;
                }
                result = self.process(&record) => result,
            };
            if let Err(err) = result {
                self.stats.dropped += 1;
                let (fingerprint, keys) = fingerprint_and_keys(&record);
                let error_kind = err.kind();
                tracing::error!(
                    host = %record.request.host,
                    fingerprint = %fingerprint,
                    keys = %keys,
                    outcome = "dropped",
                    error_kind,
                    method = %record.request.method,
                    path = %record.request.path,
                    request_bytes = record.request.content.len(),
                    response_bytes = record.response.content.len(),
                    "failed to store flow: {err}"
                );
            }
        }

        let stats = self.stats;
        tracing::info!(
            inserted = stats.inserted,
            skipped = stats.skipped,
            dropped = stats.dropped,
            "ingestion stopped"
        );
        Ok(stats)
    }

    async fn lookup(&mut self, fingerprint: &Fingerprint) -> Result<Option<ExistingFlow>, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.exists(fingerprint).await {
                Err(err) => attempt = self.recover("exists", attempt, err).await?,
                found => return found,
            }
        }
    }

    async fn insert(&mut self, entry: &StoredFlowEntry) -> Result<i64, StoreError> {
        let mut attempt = 0;
        loop {
            match self.store.insert(entry).await {
                Err(err) => attempt = self.recover("insert", attempt, err).await?,
                inserted => return inserted,
            }
        }
    }

    /// Waits out the backoff for `err` and reopens the store connection, repeating while the
    /// reconnect itself fails. Returns the attempt number for the next call.
    async fn recover(
        &mut self,
        operation: &str,
        mut attempt: u32,
        mut err: StoreError,
    ) -> Result<u32, StoreError> {
        loop {
            attempt = backoff(self.retry, operation, attempt, err).await?;
            match self.store.reconnect().await {
                Ok(()) => return Ok(attempt),
                Err(reconnect_err) => err = reconnect_err,
            }
        }
    }
}

/// Sleeps before retrying a call that failed with `err`, or gives the error back when it is not
/// retryable or attempts are exhausted. Returns the next attempt number.
async fn backoff(
    retry: RetryPolicy,
    operation: &str,
    attempt: u32,
    err: StoreError,
) -> Result<u32, StoreError> {
    let StoreError::Unavailable(_) = err else {
        return Err(err);
    };
    let Some(delay) = retry.delay_after(attempt) else {
        return Err(err);
    };

    tracing::warn!(
        operation,
        attempt = attempt + 1,
        max_attempts = retry.max_attempts(),
        delay_ms = delay.as_millis(),
        "flow store call failed, retrying: {err}"
    );
    tokio::time::sleep(delay).await;
    Ok(attempt + 1)
}

fn local_now() -> NaiveDateTime {
    Local::now().naive_local()
}
