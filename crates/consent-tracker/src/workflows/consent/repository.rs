use chrono::{DateTime, Utc};

use super::domain::{
    ClassId, ClassRoom, ConsentDraft, ConsentRequest, ConsentRequestId, ContactHandle,
    DocumentRef, ParentAccount, ParentId, Student, StudentId, SubmissionId, SubmissionRecord,
    SubmissionStatus, TeacherAccount, TeacherId,
};

/// Storage abstraction over consent requests, submission rows, and the enrollment graph.
///
/// Implementations must provide serializable transactions and compare-and-set status
/// writes; the lifecycle code holds no locks of its own.
pub trait ConsentStore: Send + Sync {
    /// Run `work` as one unit. Either every write staged through `tx` commits or none does.
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> Result<T, E>,
        E: From<RepositoryError>;

    fn fetch_request(&self, id: ConsentRequestId)
        -> Result<Option<ConsentRequest>, RepositoryError>;
    /// Requests issued to a class, newest first.
    fn requests_for_class(&self, class_id: ClassId)
        -> Result<Vec<ConsentRequest>, RepositoryError>;
    /// Requests whose deadline is strictly before `now` and that still hold a `Pending` row.
    fn expiry_candidates(&self, now: DateTime<Utc>)
        -> Result<Vec<ConsentRequest>, RepositoryError>;
    /// Requests with `start <= deadline < end`.
    fn requests_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ConsentRequest>, RepositoryError>;

    fn submission(&self, id: SubmissionId) -> Result<Option<SubmissionRecord>, RepositoryError>;
    fn submission_for(
        &self,
        request_id: ConsentRequestId,
        student_id: StudentId,
    ) -> Result<Option<SubmissionRecord>, RepositoryError>;
    fn submissions_for_request(
        &self,
        request_id: ConsentRequestId,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError>;
    fn submissions_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError>;

    /// Write `next` only if the stored status still equals `expected`.
    fn compare_and_set_status(
        &self,
        id: SubmissionId,
        expected: SubmissionStatus,
        next: SubmissionStatus,
        document: Option<DocumentRef>,
        at: DateTime<Utc>,
    ) -> Result<StatusSwap, RepositoryError>;
    /// Atomically move every `Pending` row of the request to `Expired`, returning the rows changed.
    fn expire_pending(
        &self,
        request_id: ConsentRequestId,
        at: DateTime<Utc>,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError>;

    fn student(&self, id: StudentId) -> Result<Option<Student>, RepositoryError>;
    fn class(&self, id: ClassId) -> Result<Option<ClassRoom>, RepositoryError>;
    /// Every class, ordered by name.
    fn classes(&self) -> Result<Vec<ClassRoom>, RepositoryError>;
    fn teacher(&self, id: TeacherId) -> Result<Option<TeacherAccount>, RepositoryError>;
    fn parent(&self, id: ParentId) -> Result<Option<ParentAccount>, RepositoryError>;
    fn parents_of_student(&self, id: StudentId) -> Result<Vec<ParentAccount>, RepositoryError>;
    fn students_of_parent(&self, id: ParentId) -> Result<Vec<StudentId>, RepositoryError>;
}

/// Writes and reads available inside [`ConsentStore::transaction`].
pub trait StoreTransaction {
    fn class(&self, id: ClassId) -> Result<Option<ClassRoom>, RepositoryError>;
    fn enrolled_student_ids(&self, class_id: ClassId) -> Result<Vec<StudentId>, RepositoryError>;
    fn fetch_request(&self, id: ConsentRequestId)
        -> Result<Option<ConsentRequest>, RepositoryError>;
    fn insert_request(
        &mut self,
        draft: &ConsentDraft,
        created_at: DateTime<Utc>,
    ) -> Result<ConsentRequest, RepositoryError>;
    /// Insert a `Pending` row. Fails with `Conflict` if the (request, student) pair exists.
    fn insert_submission(
        &mut self,
        request_id: ConsentRequestId,
        student_id: StudentId,
        at: DateTime<Utc>,
    ) -> Result<SubmissionRecord, RepositoryError>;
}

/// Result of a compare-and-set status write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSwap {
    Applied(SubmissionRecord),
    /// The stored status no longer matched; nothing was written.
    Conflict(SubmissionRecord),
    Missing,
}

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Outbound message delivery (chat bot, e-mail, ...). Delivery is best effort per recipient.
pub trait NotificationSink: Send + Sync {
    fn send(&self, recipient: &ContactHandle, text: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("recipient {0} blocked delivery")]
    Blocked(ContactHandle),
    #[error("notification transport unavailable: {0}")]
    Transport(String),
}

/// Pulls plain text out of a submitted document.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, document: &DocumentRef) -> Result<String, ExtractionError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("document {0} not found")]
    Missing(DocumentRef),
    #[error("document {0} is outside the upload directory")]
    OutsideUploadRoot(DocumentRef),
    #[error("unsupported document format '{extension}' for {document}")]
    UnsupportedFormat {
        document: DocumentRef,
        extension: String,
    },
    #[error("unable to read document {document}")]
    Unreadable {
        document: DocumentRef,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to extract text from {document}: {reason}")]
    Malformed { document: DocumentRef, reason: String },
}
