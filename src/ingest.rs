//! Inbound side of the relay.
//!
//! An [`Ingestor`] takes raw mail from a [`Mailbox`], peels the remailer
//! layers addressed to this node and hands the result to an
//! [`EnqueueTarget`]. [`Submission`] is the direct path for mail that is
//! already addressed and only needs queueing.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ErrorKind, RelayError, Result};
use crate::message::Message;
use crate::queue::Queue;
use crate::remailer::Unwrapper;

/// Anything that can store a message in a named queue
pub trait EnqueueTarget {
    fn enqueue_message(&self, queue: &str, message: &Message) -> Result<Vec<u8>>;
}

impl EnqueueTarget for Queue {
    fn enqueue_message(&self, queue: &str, message: &Message) -> Result<Vec<u8>> {
        self.enqueue(queue, message)
    }
}

impl<T: EnqueueTarget + ?Sized> EnqueueTarget for &T {
    fn enqueue_message(&self, queue: &str, message: &Message) -> Result<Vec<u8>> {
        (**self).enqueue_message(queue, message)
    }
}

impl<T: EnqueueTarget + ?Sized> EnqueueTarget for Arc<T> {
    fn enqueue_message(&self, queue: &str, message: &Message) -> Result<Vec<u8>> {
        (**self).enqueue_message(queue, message)
    }
}

/// A source of inbound raw messages
pub trait Mailbox {
    type Id: Clone + fmt::Debug;

    fn list(&mut self) -> Result<Vec<Self::Id>>;
    fn read(&mut self, id: &Self::Id) -> Result<Vec<u8>>;
    fn delete(&mut self, ids: &[Self::Id]) -> Result<()>;
}

/// A directory of `*.eml` files, one message each
#[derive(Debug, Clone)]
pub struct SpoolDir {
    dir: PathBuf,
}

impl SpoolDir {
    /// Open the spool, creating the directory if needed
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Mailbox for SpoolDir {
    type Id = PathBuf;

    fn list(&mut self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "eml") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read(&mut self, id: &PathBuf) -> Result<Vec<u8>> {
        Ok(std::fs::read(id)?)
    }

    fn delete(&mut self, ids: &[PathBuf]) -> Result<()> {
        for path in ids {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// What happened to one inbound message
#[derive(Debug)]
pub enum Disposition {
    /// Unwrapped and stored under the key
    Enqueued(Vec<u8>),
    /// Cannot be relayed: format, crypto or size problem
    Invalid(RelayError),
    /// Could not be stored; retry on a later pass
    Deferred(RelayError),
}

/// Totals for one ingestion pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub enqueued: usize,
    pub invalid: usize,
    pub deferred: usize,
    pub deleted: usize,
}

/// Unwraps inbound mail and enqueues it
pub struct Ingestor<T> {
    unwrapper: Unwrapper,
    target: T,
    queue_name: String,
    max_message_size: usize,
    delete_invalid: bool,
}

impl<T: EnqueueTarget> Ingestor<T> {
    pub fn new(unwrapper: Unwrapper, target: T, queue_name: impl Into<String>) -> Self {
        Self {
            unwrapper,
            target,
            queue_name: queue_name.into(),
            max_message_size: usize::MAX,
            delete_invalid: false,
        }
    }

    pub fn with_max_message_size(mut self, limit: usize) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn with_delete_invalid(mut self, delete_invalid: bool) -> Self {
        self.delete_invalid = delete_invalid;
        self
    }

    /// Process one raw message
    pub fn ingest(&self, raw: &[u8]) -> Disposition {
        if raw.len() > self.max_message_size {
            let err = RelayError::Capacity {
                size: raw.len(),
                limit: self.max_message_size,
            };
            warn!("Rejecting inbound message: {}", err);
            return Disposition::Invalid(err);
        }

        let peeled = match self.unwrapper.unwrap(raw) {
            Ok(peeled) => peeled,
            Err(err) => {
                match err.kind() {
                    ErrorKind::Crypto => warn!("Cannot decrypt inbound message: {}", err),
                    _ => info!("Ignoring inbound message: {}", err),
                }
                return if err.is_invalid_input() {
                    Disposition::Invalid(err)
                } else {
                    Disposition::Deferred(err)
                };
            }
        };

        match self.target.enqueue_message(&self.queue_name, &peeled.message) {
            Ok(key) => {
                debug!(
                    "Enqueued unwrapped message ({} layer(s)) as {}",
                    peeled.layers,
                    String::from_utf8_lossy(&key)
                );
                Disposition::Enqueued(key)
            }
            Err(err) => {
                warn!("Failed to enqueue unwrapped message: {}", err);
                Disposition::Deferred(err)
            }
        }
    }

    /// Whether the source copy of a message should be removed
    pub fn should_delete(&self, disposition: &Disposition) -> bool {
        match disposition {
            Disposition::Enqueued(_) => true,
            Disposition::Invalid(_) => self.delete_invalid,
            Disposition::Deferred(_) => false,
        }
    }

    /// One pass over `mailbox`
    pub fn ingest_mailbox<M: Mailbox>(&self, mailbox: &mut M) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut doomed = Vec::new();

        for id in mailbox.list()? {
            let raw = match mailbox.read(&id) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("Skipping unreadable message {:?}: {}", id, err);
                    report.deferred += 1;
                    continue;
                }
            };

            let disposition = self.ingest(&raw);
            match &disposition {
                Disposition::Enqueued(_) => report.enqueued += 1,
                Disposition::Invalid(_) => report.invalid += 1,
                Disposition::Deferred(_) => report.deferred += 1,
            }
            if self.should_delete(&disposition) {
                doomed.push(id);
            }
        }

        mailbox.delete(&doomed)?;
        report.deleted = doomed.len();

        info!(
            "Ingested {} message(s): {} invalid, {} deferred, {} removed",
            report.enqueued, report.invalid, report.deferred, report.deleted
        );
        Ok(report)
    }
}

/// Direct, size-capped enqueue of already-addressed mail
pub struct Submission {
    queue: Arc<Queue>,
    queue_name: String,
    max_message_size: usize,
}

impl Submission {
    pub fn new(queue: Arc<Queue>, queue_name: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            max_message_size,
        }
    }

    /// Read the raw message from `reader` and enqueue it in one transaction
    pub fn send<R: Read>(&self, from: &str, to: &[String], reader: R) -> Result<Vec<u8>> {
        self.queue.process(|tx| {
            tx.enqueue_reader(&self.queue_name, from, to, reader, self.max_message_size)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keyring::fixtures::*;
    use crate::remailer::{wrap, Hop, LayerCompression};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTarget {
        stored: Mutex<Vec<(String, Message)>>,
        fail: bool,
    }

    impl EnqueueTarget for RecordingTarget {
        fn enqueue_message(&self, queue: &str, message: &Message) -> Result<Vec<u8>> {
            if self.fail {
                return Err(RelayError::Storage(rusqlite::Error::InvalidQuery));
            }
            let mut stored = self.stored.lock().unwrap();
            stored.push((queue.to_string(), message.clone()));
            Ok(format!("key-{}", stored.len()).into_bytes())
        }
    }

    fn wrapped_for_hop1() -> Vec<u8> {
        let original = Message::new(
            "alice@example.org",
            vec!["bob@example.org".to_string()],
            b"Subject: hi\r\n\r\nhello\r\n".to_vec(),
        );
        let hop = Hop::new("hop1@example.net", recipient(HOP1_PUBLIC));
        wrap(&original, &hop, LayerCompression::None).unwrap().body
    }

    fn ingestor(target: &RecordingTarget) -> Ingestor<&RecordingTarget> {
        let unwrapper = Unwrapper::new(ring(&[HOP1_SECRET]), "hop1@example.net");
        Ingestor::new(unwrapper, target, "outbound")
    }

    #[test]
    fn test_remailer_message_is_enqueued() {
        let target = RecordingTarget::default();
        let ingestor = ingestor(&target);

        let disposition = ingestor.ingest(&wrapped_for_hop1());
        assert!(matches!(disposition, Disposition::Enqueued(_)));
        assert!(ingestor.should_delete(&disposition));

        let stored = target.stored.lock().unwrap();
        assert_eq!(stored[0].0, "outbound");
        assert_eq!(stored[0].1.from, "hop1@example.net");
        assert_eq!(stored[0].1.to, vec!["bob@example.org"]);
    }

    #[test]
    fn test_plain_mail_is_invalid() {
        let target = RecordingTarget::default();
        let ingestor = ingestor(&target);

        let disposition = ingestor.ingest(b"Subject: hi\r\n\r\nnot for a remailer\r\n");
        assert!(matches!(disposition, Disposition::Invalid(RelayError::NotRemailerMessage)));
        assert!(!ingestor.should_delete(&disposition));
        assert!(target.stored.lock().unwrap().is_empty());

        let ingestor = ingestor.with_delete_invalid(true);
        assert!(ingestor.should_delete(&disposition));
    }

    #[test]
    fn test_foreign_key_is_invalid() {
        let target = RecordingTarget::default();
        let unwrapper = Unwrapper::new(ring(&[STRANGER_SECRET]), "stranger@example.net");
        let ingestor = Ingestor::new(unwrapper, &target, "outbound");

        let disposition = ingestor.ingest(&wrapped_for_hop1());
        match disposition {
            Disposition::Invalid(err) => assert_eq!(err.kind(), ErrorKind::Crypto),
            other => panic!("unexpected disposition {other:?}"),
        }
    }

    #[test]
    fn test_oversized_is_rejected() {
        let target = RecordingTarget::default();
        let ingestor = ingestor(&target).with_max_message_size(16);

        let disposition = ingestor.ingest(&wrapped_for_hop1());
        assert!(matches!(disposition, Disposition::Invalid(RelayError::Capacity { limit: 16, .. })));
        assert!(target.stored.lock().unwrap().is_empty());
    }

    #[test]
    fn test_enqueue_failure_is_deferred() {
        let target = RecordingTarget {
            fail: true,
            ..RecordingTarget::default()
        };
        let ingestor = ingestor(&target).with_delete_invalid(true);

        let disposition = ingestor.ingest(&wrapped_for_hop1());
        assert!(matches!(disposition, Disposition::Deferred(_)));
        assert!(!ingestor.should_delete(&disposition));
    }

    #[test]
    fn test_spool_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = SpoolDir::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("1.eml"), wrapped_for_hop1()).unwrap();
        std::fs::write(dir.path().join("2.eml"), b"Subject: junk\r\n\r\njunk\r\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let target = RecordingTarget::default();
        let report = ingestor(&target).ingest_mailbox(&mut spool).unwrap();

        assert_eq!(
            report,
            IngestReport {
                enqueued: 1,
                invalid: 1,
                deferred: 0,
                deleted: 1
            }
        );
        assert!(!dir.path().join("1.eml").exists());
        assert!(dir.path().join("2.eml").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_submission_cap() {
        let queue = Arc::new(Queue::open_in_memory().unwrap());
        let submission = Submission::new(queue.clone(), "outbound", 8);
        let to = vec!["bob@example.org".to_string()];

        let err = submission
            .send("alice@example.org", &to, &b"far too long"[..])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(queue.len("outbound").unwrap(), 0);

        submission.send("alice@example.org", &to, &b"short"[..]).unwrap();
        assert_eq!(queue.len("outbound").unwrap(), 1);
    }

    #[test]
    fn test_queue_is_a_target() {
        let queue = Queue::open_in_memory().unwrap();
        let unwrapper = Unwrapper::new(ring(&[HOP1_SECRET]), "hop1@example.net");
        let ingestor = Ingestor::new(unwrapper, &queue, "outbound");

        assert!(matches!(ingestor.ingest(&wrapped_for_hop1()), Disposition::Enqueued(_)));
        assert_eq!(queue.len("outbound").unwrap(), 1);
    }
}
