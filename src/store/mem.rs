//! In-memory queue store for tests and embedding.

use crate::model::request::MergeRequest;
use crate::model::types::{BranchRef, RequestId, SessionId};

use super::{EnqueueOutcome, QueueDocument, QueueStore, StatusUpdate, StoreError};

/// A [`QueueStore`] with no persistence. Used by unit and scenario tests;
/// the document is public so tests can set up arbitrary states directly.
#[derive(Clone, Debug, Default)]
pub struct MemStore {
    /// The backing document.
    pub doc: QueueDocument,
}

impl MemStore {
    /// An empty in-memory store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            doc: QueueDocument::new(),
        }
    }
}

impl QueueStore for MemStore {
    fn enqueue(
        &mut self,
        request_id: RequestId,
        source_ref: BranchRef,
        target_ref: BranchRef,
        origin_id: SessionId,
        now: u64,
    ) -> Result<EnqueueOutcome, StoreError> {
        Ok(self
            .doc
            .enqueue(request_id, source_ref, target_ref, origin_id, now))
    }

    fn next_eligible(&mut self) -> Result<Option<MergeRequest>, StoreError> {
        Ok(self.doc.next_eligible().cloned())
    }

    fn apply(
        &mut self,
        request_id: RequestId,
        update: StatusUpdate,
    ) -> Result<MergeRequest, StoreError> {
        self.doc.apply(request_id, update)
    }

    fn remove(&mut self, request_id: RequestId) -> Result<MergeRequest, StoreError> {
        self.doc.remove(request_id)
    }

    fn list(&mut self) -> Result<Vec<MergeRequest>, StoreError> {
        Ok(self.doc.entries.clone())
    }
}
