use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::classification::classify_with_evidence;
use super::clock::Clock;
use super::domain::{
    ClassId, ConsentDraft, ConsentRequest, ConsentRequestId, ContactHandle, DocumentRef, ParentId,
    Student, StudentId, SubmissionId, SubmissionRecord, SubmissionStatus,
};
use super::ledger::{stage_records, SubmissionLedger};
use super::repository::{ConsentStore, NotificationSink, RepositoryError, TextExtractor};

/// Service composing the store, ledger, classifier, and notification sink.
///
/// The service is the system of record for "what is the state of consent X for student
/// Y". Callers are expected to have authorized the acting identity already.
pub struct ConsentLifecycleService<S, N> {
    store: Arc<S>,
    ledger: SubmissionLedger<S>,
    notifier: Arc<N>,
    extractor: Arc<dyn TextExtractor>,
    clock: Arc<dyn Clock>,
}

impl<S, N> ConsentLifecycleService<S, N>
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(
        store: Arc<S>,
        notifier: Arc<N>,
        extractor: Arc<dyn TextExtractor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ledger = SubmissionLedger::new(store.clone(), clock.clone());
        Self {
            store,
            ledger,
            notifier,
            extractor,
            clock,
        }
    }

    pub fn ledger(&self) -> &SubmissionLedger<S> {
        &self.ledger
    }

    /// Issue a consent request to a class and create a `Pending` row for every student
    /// enrolled right now. An empty class still gets its request.
    pub fn create_consent_request(
        &self,
        draft: ConsentDraft,
    ) -> Result<ConsentRequestId, ConsentError> {
        let created_at = self.clock.now();
        let (request, created) =
            self.store
                .transaction(|tx| -> Result<(ConsentRequest, usize), ConsentError> {
                    tx.class(draft.class_id)?
                        .ok_or_else(|| ConsentError::not_found("class", draft.class_id))?;
                    let request = tx.insert_request(&draft, created_at)?;
                    let students = tx.enrolled_student_ids(draft.class_id)?;
                    let created = stage_records(tx, request.id, &students, created_at)?;
                    Ok((request, created))
                })?;

        info!(
            request_id = %request.id,
            class_id = %request.class_id,
            name = %request.name,
            submissions = created,
            "consent request created"
        );

        self.announce(&request);
        Ok(request.id)
    }

    pub fn get_consent(&self, request_id: ConsentRequestId) -> Result<ConsentRequest, ConsentError> {
        self.store
            .fetch_request(request_id)?
            .ok_or_else(|| ConsentError::not_found("consent request", request_id))
    }

    /// Requests issued to a class, newest first.
    pub fn list_consents_for_class(
        &self,
        class_id: ClassId,
    ) -> Result<Vec<ConsentRequest>, ConsentError> {
        self.store
            .class(class_id)?
            .ok_or_else(|| ConsentError::not_found("class", class_id))?;
        Ok(self.store.requests_for_class(class_id)?)
    }

    /// Record a parent's answer for one student using already extracted text.
    pub fn submit_for_student(
        &self,
        student_id: StudentId,
        request_id: ConsentRequestId,
        extracted_text: &str,
        document: DocumentRef,
    ) -> Result<SubmissionStatus, ConsentError> {
        let record = self.open_submission(student_id, request_id)?;
        self.record_answer(record, extracted_text, document)
    }

    /// Extract text from the uploaded document and record the answer.
    ///
    /// The document is only read once the row is known to accept an answer. When
    /// extraction fails the submission is classified as accepted and the failure is
    /// logged: a parent who did upload a document is not blocked by an extractor fault.
    pub fn submit_document(
        &self,
        student_id: StudentId,
        request_id: ConsentRequestId,
        document: DocumentRef,
    ) -> Result<SubmissionStatus, ConsentError> {
        let record = self.open_submission(student_id, request_id)?;
        // Expired rows are rejected by the ledger without reading the file.
        if record.status != SubmissionStatus::Pending {
            return self.record_answer(record, "", document);
        }

        let text = match self.extractor.extract(&document) {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    %request_id,
                    %student_id,
                    %document,
                    error = %err,
                    "text extraction failed; defaulting to acceptance"
                );
                String::new()
            }
        };

        self.record_answer(record, &text, document)
    }

    /// Parent-facing intake: find which linked child the request belongs to.
    pub fn submit_for_parent(
        &self,
        parent_id: ParentId,
        request_id: ConsentRequestId,
        extracted_text: &str,
        document: DocumentRef,
    ) -> Result<SubmissionStatus, ConsentError> {
        self.store
            .parent(parent_id)?
            .ok_or_else(|| ConsentError::not_found("parent", parent_id))?;

        for student_id in self.store.students_of_parent(parent_id)? {
            if self.store.submission_for(request_id, student_id)?.is_some() {
                return self.submit_for_student(student_id, request_id, extracted_text, document);
            }
        }

        Err(ConsentError::not_found("consent request", request_id))
    }

    /// Consents of every child linked to the parent, newest request first.
    pub fn get_consents_for_parent(
        &self,
        parent_id: ParentId,
    ) -> Result<Vec<ParentConsentEntry>, ConsentError> {
        self.store
            .parent(parent_id)?
            .ok_or_else(|| ConsentError::not_found("parent", parent_id))?;

        let mut entries = Vec::new();
        for student_id in self.store.students_of_parent(parent_id)? {
            let Some(student) = self.store.student(student_id)? else {
                continue;
            };
            for submission in self.ledger.list_by_student(student_id)? {
                let Some(request) = self.store.fetch_request(submission.request_id)? else {
                    continue;
                };
                entries.push(ParentConsentEntry {
                    request,
                    student: student.clone(),
                    submission,
                });
            }
        }

        entries.sort_by(|a, b| {
            b.request
                .created_at
                .cmp(&a.request.created_at)
                .then_with(|| b.request.id.cmp(&a.request.id))
                .then_with(|| a.student.full_name.cmp(&b.student.full_name))
        });
        Ok(entries)
    }

    /// The row a new answer for (request, student) would land on, if it can still take one.
    fn open_submission(
        &self,
        student_id: StudentId,
        request_id: ConsentRequestId,
    ) -> Result<SubmissionRecord, ConsentError> {
        self.store
            .fetch_request(request_id)?
            .ok_or_else(|| ConsentError::not_found("consent request", request_id))?;
        self.store
            .student(student_id)?
            .ok_or_else(|| ConsentError::not_found("student", student_id))?;

        // A row exists only if the student's class was a target of this request.
        let record = self
            .store
            .submission_for(request_id, student_id)?
            .ok_or_else(|| ConsentError::not_found("consent request", request_id))?;

        if record.status.is_terminal() {
            return Err(ConsentError::AlreadyFinalized {
                record: record.id,
                status: record.status,
            });
        }
        Ok(record)
    }

    fn record_answer(
        &self,
        record: SubmissionRecord,
        extracted_text: &str,
        document: DocumentRef,
    ) -> Result<SubmissionStatus, ConsentError> {
        let classification = classify_with_evidence(extracted_text);
        debug!(
            request_id = %record.request_id,
            student_id = %record.student_id,
            outcome = ?classification.outcome,
            keyword = classification.matched_keyword.unwrap_or("-"),
            "document classified"
        );

        match self
            .ledger
            .update_status(record.id, classification.outcome.status(), Some(document))
        {
            Ok(updated) => Ok(updated.status),
            Err(ConsentError::InvalidTransition { record, from, .. }) if from.is_terminal() => {
                Err(ConsentError::AlreadyFinalized {
                    record,
                    status: from,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Tell registered parents of the class about a freshly committed request.
    fn announce(&self, request: &ConsentRequest) {
        let submissions = match self.ledger.list_by_request(request.id) {
            Ok(submissions) => submissions,
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "unable to load recipients for announcement");
                return;
            }
        };

        let text = format!(
            "A new consent is available for your child: {}. Deadline: {}. Please review it in your consents list.",
            request.name,
            request
                .deadline
                .with_timezone(&self.clock.reference_offset())
                .format("%d.%m.%Y %H:%M")
        );

        let mut notified = HashSet::new();
        for submission in submissions {
            let parents = match self.store.parents_of_student(submission.student_id) {
                Ok(parents) => parents,
                Err(err) => {
                    warn!(request_id = %request.id, error = %err, "unable to load parents for announcement");
                    return;
                }
            };
            for parent in parents {
                if !notified.insert(parent.id) {
                    continue;
                }
                if let Some(contact) = parent.contact.as_ref() {
                    deliver(self.notifier.as_ref(), contact, &text);
                }
            }
        }
    }
}

/// One consent as seen by a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentConsentEntry {
    pub request: ConsentRequest,
    pub student: Student,
    pub submission: SubmissionRecord,
}

/// Send one message, logging instead of propagating a delivery failure.
pub(crate) fn deliver<N>(sink: &N, recipient: &ContactHandle, text: &str) -> bool
where
    N: NotificationSink + ?Sized,
{
    match sink.send(recipient, text) {
        Ok(()) => true,
        Err(err) => {
            warn!(%recipient, error = %err, "notification delivery failed");
            false
        }
    }
}

/// Error raised by the lifecycle service and the ledger.
///
/// `NotFound`, `InvalidTransition` and `AlreadyFinalized` are expected user-facing outcomes;
/// `Persistence` is a system fault and always reaches the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsentError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("submission {record} cannot move from {from} to {to}")]
    InvalidTransition {
        record: SubmissionId,
        from: SubmissionStatus,
        to: SubmissionStatus,
    },
    #[error("submission {record} is already finalized as {status}")]
    AlreadyFinalized {
        record: SubmissionId,
        status: SubmissionStatus,
    },
    #[error(transparent)]
    Persistence(#[from] RepositoryError),
}

impl ConsentError {
    pub(crate) fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
