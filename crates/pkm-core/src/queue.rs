//! Visit Queue
//!
//! Serialises analysis: many producers (intake handlers, orphan repair)
//! enqueue, exactly one consumer runs the workflow, in enqueue order. The
//! consumer pulls small batches (up to 3 items or a 1 s wait) for
//! throughput, but still hands visits to the workflow one at a time - tree
//! reconciliation read-modifies-writes shared tree state and must never run
//! concurrently with itself.
//!
//! A 5 s ticker owns orphan retries: reparenting visits whose opener has
//! appeared, and flushing expired or retry-exhausted orphans into the queue
//! as roots.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::model::Visit;
use crate::orphan::{OrphanManager, RETRY_INTERVAL_SECS};
use crate::storage::Storage;
use crate::tracker::TabTracker;
use crate::workflow::VisitProcessor;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Shutdown has begun; no new visits are accepted.
    #[error("Queue is shutting down")]
    ShuttingDown,
}

// ============================================================================
// QUEUE
// ============================================================================

/// Handle shared by all producers.
pub struct VisitQueue {
    tx: mpsc::UnboundedSender<Visit>,
    depth: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl VisitQueue {
    /// Build the queue and start its consumer and retry-ticker tasks.
    /// The returned handles complete once shutdown has drained.
    pub fn spawn(
        processor: Arc<dyn VisitProcessor>,
        storage: Arc<Storage>,
        tracker: Arc<Mutex<TabTracker>>,
        orphans: Arc<Mutex<OrphanManager>>,
        config: QueueConfig,
    ) -> (Arc<VisitQueue>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let depth = Arc::new(AtomicUsize::new(0));

        let queue = Arc::new(VisitQueue {
            tx,
            depth: depth.clone(),
            shutdown_tx,
        });

        let consumer = tokio::spawn(consumer_loop(
            rx,
            processor,
            depth,
            config,
            shutdown_rx.clone(),
        ));
        let ticker = tokio::spawn(orphan_retry_loop(
            queue.clone(),
            storage,
            tracker,
            orphans,
            shutdown_rx,
        ));

        (queue, vec![consumer, ticker])
    }

    /// Enqueue a visit for analysis. Returns the 1-based position in line.
    pub fn enqueue(&self, visit: Visit) -> Result<usize, QueueError> {
        if *self.shutdown_tx.borrow() {
            return Err(QueueError::ShuttingDown);
        }
        let position = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        self.tx.send(visit).map_err(|_| QueueError::ShuttingDown)?;
        Ok(position)
    }

    /// Visits currently waiting or being analysed.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Begin shutdown: refuse new visits; the consumer finishes its current
    /// batch and exits, the ticker stops.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

// ============================================================================
// CONSUMER
// ============================================================================

async fn consumer_loop(
    mut rx: mpsc::UnboundedReceiver<Visit>,
    processor: Arc<dyn VisitProcessor>,
    depth: Arc<AtomicUsize>,
    config: QueueConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        batch_size = config.batch_size,
        batch_timeout_ms = config.batch_timeout_ms,
        "Visit queue consumer started"
    );

    loop {
        // Wait for the first item of the next batch (or shutdown).
        let first = tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(visit) => visit,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        // Fill the batch up to batch_size or until the timeout lapses.
        let mut batch = vec![first];
        let deadline = tokio::time::sleep(Duration::from_millis(config.batch_timeout_ms));
        tokio::pin!(deadline);
        while batch.len() < config.batch_size {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(visit) => batch.push(visit),
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        // One workflow execution per visit, in order. A failure is logged
        // and the remainder of the batch still runs; the visit stays in the
        // relational store as unanalysed.
        for visit in batch {
            let visit_id = visit.id.clone();
            match processor.process(visit).await {
                Ok(outcome) => {
                    tracing::debug!(visit_id = %visit_id, ?outcome, "Visit processed");
                }
                Err(e) => {
                    error!(visit_id = %visit_id, error = %e, "Workflow failed; visit left unanalysed");
                }
            }
            depth.fetch_sub(1, Ordering::SeqCst);
        }

        if *shutdown_rx.borrow() {
            break;
        }
    }

    info!("Visit queue consumer stopped");
}

// ============================================================================
// ORPHAN RETRY TICKER
// ============================================================================

async fn orphan_retry_loop(
    queue: Arc<VisitQueue>,
    storage: Arc<Storage>,
    tracker: Arc<Mutex<TabTracker>>,
    orphans: Arc<Mutex<OrphanManager>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(RETRY_INTERVAL_SECS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                retry_orphans(&queue, &storage, &tracker, &orphans).await;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("Orphan retry ticker stopped");
}

/// One retry scan: flush expired orphans as roots, reparent those whose
/// opener has appeared, bump the rest.
async fn retry_orphans(
    queue: &VisitQueue,
    storage: &Storage,
    tracker: &Mutex<TabTracker>,
    orphans: &Mutex<OrphanManager>,
) {
    let (retryable, swept) = orphans.lock().await.retryable();
    enqueue_as_roots(queue, swept);

    let mut seen_openers: HashSet<i64> = HashSet::new();
    for orphan in retryable {
        if !seen_openers.insert(orphan.opener_tab_id) {
            continue;
        }

        let opener_page = tracker.lock().await.current_of(orphan.opener_tab_id);
        match opener_page {
            Some((url, at)) => {
                let (taken, swept) = orphans.lock().await.take_for(orphan.opener_tab_id);
                enqueue_as_roots(queue, swept);
                for mut reparented in taken {
                    if let Err(e) = storage.update_visit_referrer(
                        &reparented.visit.id,
                        &url,
                        Some(at),
                    ) {
                        warn!(
                            visit_id = %reparented.visit.id,
                            error = %e,
                            "Failed to persist repaired referrer"
                        );
                    }
                    reparented.visit.referrer = Some(url.clone());
                    reparented.visit.referrer_timestamp = Some(at);
                    info!(
                        visit_id = %reparented.visit.id,
                        referrer = %url,
                        "Orphan reparented"
                    );
                    if let Err(e) = queue.enqueue(reparented.visit) {
                        warn!(error = %e, "Could not enqueue reparented visit");
                    }
                }
            }
            None => {
                let exhausted = orphans
                    .lock()
                    .await
                    .bump(orphan.opener_tab_id, &orphan.visit.id);
                if let Some(orphan) = exhausted {
                    enqueue_as_roots(queue, vec![orphan]);
                }
            }
        }
    }
}

/// Expired and retry-exhausted orphans are still analysed, just without a
/// parent.
fn enqueue_as_roots(queue: &VisitQueue, orphans: Vec<crate::orphan::Orphan>) {
    for orphan in orphans {
        if let Err(e) = queue.enqueue(orphan.visit) {
            warn!(error = %e, "Could not enqueue expired orphan");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
