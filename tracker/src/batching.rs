use crate::db::insert_batch;
use crate::metrics::{ARCHIVE_BATCH_SIZE, ARCHIVE_LATENCY_SECONDS};
use crate::model::LocationSample;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info};

/// Drains accepted samples into the durable store in batches of at most
/// `max_batch`, flushing a partial batch `max_wait_ms` after its first sample.
pub async fn run_archiver(
    mut rx: mpsc::Receiver<LocationSample>,
    pool: PgPool,
    max_batch: usize,
    max_wait_ms: u64,
) {
    info!(max_batch, max_wait_ms, "Starting archiver");

    let max_wait = Duration::from_millis(max_wait_ms);
    while let Some(batch) = next_batch(&mut rx, max_batch, max_wait).await {
        flush_batch(&pool, &batch).await;
    }

    info!("Archive channel closed, archiver stopped");
}

/// Waits for one sample, then keeps collecting until the batch is full or
/// `max_wait` has passed. `None` once the channel is closed and drained.
async fn next_batch(
    rx: &mut mpsc::Receiver<LocationSample>,
    max_batch: usize,
    max_wait: Duration,
) -> Option<Vec<LocationSample>> {
    let max_batch = max_batch.max(1);
    let mut batch = Vec::with_capacity(max_batch);
    if rx.recv_many(&mut batch, max_batch).await == 0 {
        return None;
    }

    let deadline = Instant::now() + max_wait;
    while batch.len() < max_batch {
        let room = max_batch - batch.len();
        match timeout_at(deadline, rx.recv_many(&mut batch, room)).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    Some(batch)
}

async fn flush_batch(pool: &PgPool, batch: &[LocationSample]) {
    debug!("Archiving batch of {} samples", batch.len());
    ARCHIVE_BATCH_SIZE.set(batch.len() as f64);
    let start = Instant::now();

    match insert_batch(pool, batch).await {
        Ok(()) => {
            let elapsed = start.elapsed().as_secs_f64();
            ARCHIVE_LATENCY_SECONDS.observe(elapsed);
            debug!("Batch archived in {:.3}s", elapsed);
        }
        // The in-memory history still holds these samples.
        Err(e) => error!("Dropping {} samples after archive failure: {}", batch.len(), e),
    }

    ARCHIVE_BATCH_SIZE.set(0.0);
}
