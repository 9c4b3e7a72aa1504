use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::clock::Clock;
use super::domain::{
    ConsentRequest, ConsentRequestId, DocumentRef, StudentId, SubmissionId, SubmissionRecord,
    SubmissionStatus,
};
use super::repository::{ConsentStore, RepositoryError, StatusSwap, StoreTransaction};
use super::service::ConsentError;

/// Owner of the per-student submission rows of every consent request.
///
/// Every status write goes through the store's compare-and-set so a sweep and a parent
/// submission racing on the same row settle on whichever commits first, and a terminal
/// status is never replaced.
pub struct SubmissionLedger<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S> Clone for SubmissionLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S> SubmissionLedger<S>
where
    S: ConsentStore + 'static,
{
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Insert one `Pending` row per student. All rows commit or none do.
    pub fn create_records_for_request(
        &self,
        request: &ConsentRequest,
        student_ids: &[StudentId],
    ) -> Result<usize, ConsentError> {
        let at = self.clock.now();
        let created = self.store.transaction(|tx| -> Result<usize, ConsentError> {
            if tx.fetch_request(request.id)?.is_none() {
                return Err(ConsentError::not_found("consent request", request.id));
            }
            Ok(stage_records(tx, request.id, student_ids, at)?)
        })?;

        info!(request_id = %request.id, created, "submission rows created");
        Ok(created)
    }

    pub fn list_by_request(
        &self,
        request_id: ConsentRequestId,
    ) -> Result<Vec<SubmissionRecord>, ConsentError> {
        Ok(self.store.submissions_for_request(request_id)?)
    }

    pub fn list_by_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<SubmissionRecord>, ConsentError> {
        Ok(self.store.submissions_for_student(student_id)?)
    }

    /// Move a row out of `Pending`.
    ///
    /// The guard is evaluated against the stored status at write time, not against the
    /// copy read here, so a concurrent writer can only make this call fail.
    pub fn update_status(
        &self,
        record_id: SubmissionId,
        next: SubmissionStatus,
        document: Option<DocumentRef>,
    ) -> Result<SubmissionRecord, ConsentError> {
        let record = self
            .store
            .submission(record_id)?
            .ok_or_else(|| ConsentError::not_found("submission", record_id))?;

        if !record.status.can_transition_to(next) {
            return Err(ConsentError::InvalidTransition {
                record: record_id,
                from: record.status,
                to: next,
            });
        }

        match self.store.compare_and_set_status(
            record_id,
            record.status,
            next,
            document,
            self.clock.now(),
        )? {
            StatusSwap::Applied(updated) => {
                info!(
                    submission_id = %record_id,
                    request_id = %updated.request_id,
                    from = %record.status,
                    to = %updated.status,
                    "submission status updated"
                );
                Ok(updated)
            }
            StatusSwap::Conflict(current) => {
                debug!(
                    submission_id = %record_id,
                    stored = %current.status,
                    "status changed underneath update"
                );
                Err(ConsentError::InvalidTransition {
                    record: record_id,
                    from: current.status,
                    to: next,
                })
            }
            StatusSwap::Missing => Err(ConsentError::not_found("submission", record_id)),
        }
    }

    /// Expire every `Pending` row of a request and return how many changed.
    pub fn bulk_expire(&self, request_id: ConsentRequestId) -> Result<usize, ConsentError> {
        self.expire_pending(request_id).map(|expired| expired.len())
    }

    /// Same as [`Self::bulk_expire`] but hands back the rows that changed.
    pub fn expire_pending(
        &self,
        request_id: ConsentRequestId,
    ) -> Result<Vec<SubmissionRecord>, ConsentError> {
        let expired = self.store.expire_pending(request_id, self.clock.now())?;
        if !expired.is_empty() {
            info!(%request_id, expired = expired.len(), "pending submissions expired");
        }
        Ok(expired)
    }
}

/// Stage `Pending` rows inside an open transaction.
pub(crate) fn stage_records(
    tx: &mut dyn StoreTransaction,
    request_id: ConsentRequestId,
    student_ids: &[StudentId],
    at: DateTime<Utc>,
) -> Result<usize, RepositoryError> {
    for student_id in student_ids {
        tx.insert_submission(request_id, *student_id, at)?;
    }
    Ok(student_ids.len())
}
