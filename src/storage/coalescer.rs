//! Write coalescing for the store.
//!
//! Each write re-arms a per-collection quiescence timer. When it fires, or
//! when the queue reaches `max_queue_size`, the newest queued snapshot is
//! written and every waiter in the batch is resolved with the outcome. Older
//! snapshots of the same batch are discarded, never merged.

use super::collection::{Collection, CollectionState};
use super::persistence::save_snapshot;
use super::store::Store;
use crate::core::{DbError, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Resolves once the batch containing a write has been flushed.
///
/// Dropping the ticket does not cancel the flush.
#[derive(Debug)]
pub struct FlushTicket {
    rx: oneshot::Receiver<Result<()>>,
}

impl FlushTicket {
    pub(crate) fn new(rx: oneshot::Receiver<Result<()>>) -> Self {
        Self { rx }
    }

    /// Waits for the flush; a failed flush yields its `WriteFailure`.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or_else(|_| {
            Err(DbError::WriteFailure(
                "flush was abandoned before completing".to_string(),
            ))
        })
    }
}

/// What a flush attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushOutcome {
    /// A snapshot was written (or the write failed; see the result).
    Flushed,
    /// Nothing to write.
    Clean,
    /// Another flush of the same collection is in flight.
    Busy,
}

impl Store {
    /// (Re)arms the quiescence timer of `collection`.
    pub(crate) fn arm_timer(
        &self,
        handle: &Handle,
        collection: &Arc<Collection>,
        state: &mut CollectionState,
    ) {
        state.cancel_timer();
        let store = self.clone();
        let target = collection.clone();
        let delay = self.inner.config.batch_delay;
        // The timer only sleeps; the flush runs in its own task so aborting a
        // timer can never cut a flush short.
        state.timer = Some(handle.spawn(async move {
            sleep(delay).await;
            let _ = store.spawn_flush(target);
        }));
    }

    pub(crate) fn spawn_flush(&self, collection: Arc<Collection>) -> JoinHandle<Result<FlushOutcome>> {
        let store = self.clone();
        tokio::spawn(async move { store.flush_collection(&collection).await })
    }

    pub(crate) fn spawn_flush_on(
        &self,
        handle: &Handle,
        collection: Arc<Collection>,
    ) -> JoinHandle<Result<FlushOutcome>> {
        let store = self.clone();
        handle.spawn(async move { store.flush_collection(&collection).await })
    }

    /// Writes the newest queued snapshot of `collection` to disk.
    async fn flush_collection(&self, collection: &Arc<Collection>) -> Result<FlushOutcome> {
        let (batch, snapshot) = {
            let mut state = collection.state();
            if state.writing {
                // The in-flight flush re-arms the timer when it sees a non-empty queue.
                return Ok(FlushOutcome::Busy);
            }
            let snapshot = match state.queue.last() {
                Some(pending) => pending.snapshot.clone(),
                // Dirty with nothing queued: an earlier flush failed.
                None if state.dirty => match &state.snapshot {
                    Some(snapshot) => snapshot.clone(),
                    None => return Ok(FlushOutcome::Clean),
                },
                None => return Ok(FlushOutcome::Clean),
            };
            state.cancel_timer();
            state.writing = true;
            (std::mem::take(&mut state.queue), snapshot)
        };

        let span = info_span!(
            "store.flush",
            collection = %collection.name,
            batch = batch.len(),
            records = snapshot.len()
        );
        let started = Instant::now();
        let result = save_snapshot(&collection.path, &collection.name, &snapshot)
            .instrument(span.clone())
            .await;
        let elapsed = started.elapsed();

        let rearm = {
            let mut state = collection.state();
            state.writing = false;
            match &result {
                Ok(()) => {
                    state.counters.record_flush(elapsed, batch.len());
                    state.last_write = Some(chrono::Utc::now());
                    if state.queue.is_empty() {
                        state.dirty = false;
                    }
                }
                Err(_) => state.counters.flush_failures += 1,
            }
            !state.queue.is_empty()
        };
        collection.flushed.notify_waiters();

        span.in_scope(|| match &result {
            Ok(()) => event!(
                Level::DEBUG,
                elapsed_ms = elapsed.as_millis() as u64,
                "collection flushed"
            ),
            Err(err) => event!(Level::ERROR, error = %err, "collection flush failed"),
        });

        for pending in batch {
            let _ = pending.done.send(result.clone());
        }

        if rearm {
            let handle = Handle::current();
            let mut state = collection.state();
            if !state.writing && !state.queue.is_empty() {
                self.arm_timer(&handle, collection, &mut state);
            }
        }

        result.map(|()| FlushOutcome::Flushed)
    }

    /// Flushes `collection` now, waiting out any flush already in flight.
    pub(crate) async fn drain(&self, collection: &Arc<Collection>) -> Result<()> {
        loop {
            let flushed = collection.flushed.notified();
            let writing = {
                let state = collection.state();
                if !state.writing && !state.dirty {
                    return Ok(());
                }
                state.writing
            };
            if writing {
                flushed.await;
                continue;
            }

            let outcome = self
                .spawn_flush(collection.clone())
                .await
                .map_err(|err| DbError::WriteFailure(format!("flush task join: {}", err)))??;
            match outcome {
                FlushOutcome::Busy => continue,
                FlushOutcome::Flushed | FlushOutcome::Clean => return Ok(()),
            }
        }
    }

    /// Flushes every dirty collection immediately and waits for the writes.
    ///
    /// Intended for orderly shutdown. It offers no protection against the
    /// process being killed mid-write; the recovery sweep covers that.
    /// Every collection is attempted; the first failure is returned.
    pub async fn flush_all(&self) -> Result<()> {
        let collections = self.all_collections()?;
        for collection in &collections {
            collection.state().cancel_timer();
        }

        let results = join_all(collections.iter().map(|c| self.drain(c))).await;
        let mut first_error = None;
        for (collection, result) in collections.iter().zip(results) {
            if let Err(err) = result {
                event!(Level::ERROR, collection = %collection.name, error = %err, "flush_all failed for collection");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
