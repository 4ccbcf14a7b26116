use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use visor_files::{FileStore, FileUpload, StoredFile};

use crate::message::{AttachmentRef, UploadTicket};

/// A selected file whose upload has not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFile {
    pub ticket: UploadTicket,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// Per-file upload resolution, delivered in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEventPayload {
    Stored(StoredFile),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEvent {
    pub ticket: UploadTicket,
    pub payload: UploadEventPayload,
}

/// What applying one upload event did to the pending state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// A live upload resolved; its reference joined the pending list.
    Attached,
    /// The ticket was retired before resolution; the reference was discarded.
    Dropped,
    /// The storage call failed; the file left the pending list.
    Failed { file_name: String, reason: String },
}

pub type UploadWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving half of one upload batch.
pub struct UploadEventStream {
    events: mpsc::UnboundedReceiver<UploadEvent>,
}

impl UploadEventStream {
    pub async fn recv(&mut self) -> Option<UploadEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<UploadEvent> {
        self.events.try_recv().ok()
    }
}

/// Event stream plus the worker future driving the batch's storage calls.
pub struct UploadBatchHandle {
    pub stream: UploadEventStream,
    pub worker: UploadWorker,
}

/// Pending-upload state: the displayed file list, the resolved attachment
/// references, and the ticket set that keeps the two consistent.
#[derive(Debug, Default)]
pub struct Uploader {
    pending_files: Vec<PendingFile>,
    pending_attachments: Vec<AttachmentRef>,
    live_tickets: HashSet<UploadTicket>,
    next_ticket: u64,
}

impl Uploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_files(&self) -> &[PendingFile] {
        &self.pending_files
    }

    pub fn pending_attachments(&self) -> &[AttachmentRef] {
        &self.pending_attachments
    }

    /// Starts one batch of independent, concurrent storage calls.
    ///
    /// Every file gets a ticket and a pending-file row immediately; results
    /// arrive on the event stream in completion order, which the caller feeds
    /// back through [`Uploader::apply_event`].
    pub fn begin_batch(
        &mut self,
        files: Vec<FileUpload>,
        store: Arc<dyn FileStore>,
    ) -> UploadBatchHandle {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let ticket = self.alloc_ticket();
            self.pending_files.push(PendingFile {
                ticket,
                file_name: file.file_name.clone(),
                content_type: file.content_type.clone(),
                size_bytes: file.size_bytes(),
            });
            self.live_tickets.insert(ticket);
            entries.push((ticket, file));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker: UploadWorker = Box::pin(run_batch_worker(entries, store, event_tx));

        UploadBatchHandle {
            stream: UploadEventStream { events: event_rx },
            worker,
        }
    }

    /// Applies one resolution event to the pending state.
    pub fn apply_event(&mut self, event: UploadEvent) -> UploadOutcome {
        if !self.live_tickets.remove(&event.ticket) {
            // The file was removed (or spent) before its upload resolved;
            // attaching now would orphan the reference.
            tracing::debug!(ticket = ?event.ticket, "dropping resolution for a retired upload ticket");
            return UploadOutcome::Dropped;
        }

        let file_name = self
            .pending_files
            .iter()
            .find(|file| file.ticket == event.ticket)
            .map(|file| file.file_name.clone())
            .unwrap_or_default();
        self.pending_files.retain(|file| file.ticket != event.ticket);

        match event.payload {
            UploadEventPayload::Stored(stored) => {
                self.pending_attachments.push(AttachmentRef::new(
                    stored.key,
                    stored.content_type,
                    stored.url,
                ));
                UploadOutcome::Attached
            }
            UploadEventPayload::Failed(reason) => UploadOutcome::Failed { file_name, reason },
        }
    }

    /// Removes a displayed pending file before its upload resolves.
    ///
    /// Retiring the ticket guarantees the late resolution is discarded.
    pub fn remove_pending(&mut self, ticket: UploadTicket) -> bool {
        let known = self.live_tickets.remove(&ticket);
        self.pending_files.retain(|file| file.ticket != ticket);
        known
    }

    /// Spends the pending state on a successful send.
    ///
    /// Returns the attachment snapshot and clears both lists; unresolved
    /// uploads are retired so their late references cannot reappear.
    pub fn take_for_send(&mut self) -> Vec<AttachmentRef> {
        self.pending_files.clear();
        self.live_tickets.clear();
        std::mem::take(&mut self.pending_attachments)
    }

    fn alloc_ticket(&mut self) -> UploadTicket {
        self.next_ticket = self.next_ticket.saturating_add(1);
        UploadTicket::new(self.next_ticket)
    }
}

async fn run_batch_worker(
    entries: Vec<(UploadTicket, FileUpload)>,
    store: Arc<dyn FileStore>,
    event_tx: mpsc::UnboundedSender<UploadEvent>,
) {
    let mut in_flight = entries
        .into_iter()
        .map(|(ticket, file)| {
            let store = Arc::clone(&store);
            async move { (ticket, store.store(file).await) }
        })
        .collect::<FuturesUnordered<_>>();

    while let Some((ticket, result)) = in_flight.next().await {
        let payload = match result {
            Ok(stored) => UploadEventPayload::Stored(stored),
            Err(error) => {
                tracing::warn!(ticket = ?ticket, error = %error, "file upload failed");
                UploadEventPayload::Failed(error.to_string())
            }
        };

        if event_tx.send(UploadEvent { ticket, payload }).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_files::MemoryFileStore;

    fn upload(name: &str) -> FileUpload {
        FileUpload::new(name, "image/png", vec![0xAA; 8])
    }

    async fn drain_into(uploader: &mut Uploader, handle: UploadBatchHandle) -> Vec<UploadOutcome> {
        let UploadBatchHandle { mut stream, worker } = handle;
        worker.await;

        let mut outcomes = Vec::new();
        while let Some(event) = stream.try_recv() {
            outcomes.push(uploader.apply_event(event));
        }
        outcomes
    }

    #[tokio::test(flavor = "current_thread")]
    async fn a_resolved_batch_yields_one_reference_per_stored_file() {
        let mut uploader = Uploader::new();
        let store = Arc::new(MemoryFileStore::new());

        let handle = uploader.begin_batch(vec![upload("a.png"), upload("b.png")], store);
        assert_eq!(uploader.pending_files().len(), 2);

        drain_into(&mut uploader, handle).await;

        assert!(uploader.pending_files().is_empty());
        assert_eq!(uploader.pending_attachments().len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn a_failed_file_is_dropped_without_touching_its_siblings() {
        let mut uploader = Uploader::new();
        let store = Arc::new(MemoryFileStore::new().with_failing_file("bad.png"));

        let handle = uploader.begin_batch(vec![upload("good.png"), upload("bad.png")], store);
        let outcomes = drain_into(&mut uploader, handle).await;

        assert!(uploader.pending_files().is_empty());
        assert_eq!(uploader.pending_attachments().len(), 1);
        assert!(outcomes.iter().any(
            |outcome| matches!(outcome, UploadOutcome::Failed { file_name, .. } if file_name == "bad.png")
        ));
    }

    #[test]
    fn completion_order_governs_the_pending_attachment_order() {
        let mut uploader = Uploader::new();
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let _handle = uploader.begin_batch(vec![upload("first.png"), upload("second.png")], store);
        let first_ticket = uploader.pending_files()[0].ticket;
        let second_ticket = uploader.pending_files()[1].ticket;

        // The second submission resolves before the first.
        uploader.apply_event(UploadEvent {
            ticket: second_ticket,
            payload: UploadEventPayload::Stored(StoredFile::new(
                "k2",
                "image/png",
                "memory://files/k2/second.png",
            )),
        });
        uploader.apply_event(UploadEvent {
            ticket: first_ticket,
            payload: UploadEventPayload::Stored(StoredFile::new(
                "k1",
                "image/png",
                "memory://files/k1/first.png",
            )),
        });

        let keys = uploader
            .pending_attachments()
            .iter()
            .map(|attachment| attachment.key.as_str())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["k2", "k1"]);
    }

    #[test]
    fn removing_a_pending_file_suppresses_its_late_resolution() {
        let mut uploader = Uploader::new();
        let store: Arc<dyn FileStore> = Arc::new(MemoryFileStore::new());
        let _handle = uploader.begin_batch(vec![upload("a.png")], store);
        let ticket = uploader.pending_files()[0].ticket;

        assert!(uploader.remove_pending(ticket));
        assert!(uploader.pending_files().is_empty());

        let outcome = uploader.apply_event(UploadEvent {
            ticket,
            payload: UploadEventPayload::Stored(StoredFile::new(
                "k1",
                "image/png",
                "memory://files/k1/a.png",
            )),
        });

        assert_eq!(outcome, UploadOutcome::Dropped);
        assert!(uploader.pending_attachments().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn take_for_send_spends_everything_exactly_once() {
        let mut uploader = Uploader::new();
        let store = Arc::new(MemoryFileStore::new());
        let handle = uploader.begin_batch(vec![upload("a.png")], store);
        drain_into(&mut uploader, handle).await;

        let spent = uploader.take_for_send();
        assert_eq!(spent.len(), 1);
        assert!(uploader.pending_attachments().is_empty());
        assert!(uploader.pending_files().is_empty());
        assert!(uploader.take_for_send().is_empty());
    }
}
