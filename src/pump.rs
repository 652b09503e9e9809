// Egress pump: drains one logical queue through a delivery backend
//
// Each batch of entries is delivered and deleted inside its own queue
// transaction. A failed delivery stops the pass; the failed entry and
// everything after it stay queued for the next pass.

use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::message::Message;
use crate::queue::Queue;

/// Deletions are flushed at least this often.
///
/// A batch is delivered inside one write transaction, so the queue stays
/// locked for every SMTP exchange of the batch. Other writers (ingestion,
/// `submit` from another process) wait on it and give up after the SQLite
/// busy timeout. Smaller batches bound that wait.
pub const DELETE_BATCH: usize = 1024;

/// An outbound delivery backend
pub trait Deliver {
    /// Hand one message to the next hop
    fn deliver(&mut self, message: &Message) -> Result<()>;

    /// Called once after the pass, also when it was aborted
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: Deliver + ?Sized> Deliver for Box<D> {
    fn deliver(&mut self, message: &Message) -> Result<()> {
        (**self).deliver(message)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

/// Outcome of one pump pass
#[derive(Debug, Default)]
pub struct PumpReport {
    pub delivered: usize,
    /// Corrupt entries that were dropped
    pub discarded: usize,
    /// The delivery error that ended the pass early
    pub aborted: Option<RelayError>,
}

impl PumpReport {
    pub fn completed(&self) -> bool {
        self.aborted.is_none()
    }
}

struct Batch {
    delivered: usize,
    discarded: usize,
    last_key: Option<Vec<u8>>,
    more: bool,
    aborted: Option<RelayError>,
}

/// Drain `queue_name` once
pub fn drain<D: Deliver + ?Sized>(queue: &Queue, queue_name: &str, deliverer: &mut D) -> Result<PumpReport> {
    drain_batched(queue, queue_name, deliverer, DELETE_BATCH)
}

/// Drain with an explicit deletion batch size
pub fn drain_batched<D: Deliver + ?Sized>(
    queue: &Queue,
    queue_name: &str,
    deliverer: &mut D,
    batch_size: usize,
) -> Result<PumpReport> {
    let batch_size = batch_size.max(1);
    let mut report = PumpReport::default();
    let mut resume: Option<Vec<u8>> = None;

    let result = loop {
        let batch = queue.process(|tx| {
            let cursor = match &resume {
                Some(key) => tx.fetch_after(queue_name, key),
                None => tx.fetch(queue_name),
            };

            let mut doomed = Vec::new();
            let mut batch = Batch {
                delivered: 0,
                discarded: 0,
                last_key: None,
                more: false,
                aborted: None,
            };

            for item in cursor {
                match item {
                    Ok(entry) => {
                        if let Err(err) = deliverer.deliver(&entry.message) {
                            warn!("Delivery of {} failed: {}", entry.key_str(), err);
                            batch.aborted = Some(err);
                            break;
                        }
                        debug!("Delivered {}", entry.key_str());
                        batch.delivered += 1;
                        batch.last_key = Some(entry.key.clone());
                        doomed.push(entry.key);
                    }
                    Err(RelayError::Deserialize { key, reason }) => {
                        warn!(
                            "Discarding corrupt entry {}: {}",
                            String::from_utf8_lossy(&key),
                            reason
                        );
                        batch.discarded += 1;
                        batch.last_key = Some(key.clone());
                        doomed.push(key);
                    }
                    Err(err) => return Err(err),
                }

                if doomed.len() >= batch_size {
                    batch.more = true;
                    break;
                }
            }

            tx.remove_all(queue_name, &doomed)?;
            Ok::<_, RelayError>(batch)
        });

        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => break Err(err),
        };

        report.delivered += batch.delivered;
        report.discarded += batch.discarded;

        if batch.aborted.is_some() {
            report.aborted = batch.aborted;
            break Ok(());
        }
        if !batch.more {
            break Ok(());
        }
        resume = batch.last_key;
    };

    if let Err(err) = deliverer.finish() {
        warn!("Closing delivery backend failed: {}", err);
    }
    result?;

    info!(
        "Pump pass on {}: {} delivered, {} discarded{}",
        queue_name,
        report.delivered,
        report.discarded,
        if report.completed() { "" } else { ", aborted" }
    );
    Ok(report)
}
