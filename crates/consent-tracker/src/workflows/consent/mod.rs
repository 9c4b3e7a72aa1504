//! Consent request lifecycle for school classes.
//!
//! A teacher issues a [`ConsentRequest`] to a class; the [`SubmissionLedger`] tracks one row
//! per enrolled student; parents answer through [`ConsentLifecycleService`], whose uploads
//! are classified as accepted or refused; the [`DeadlineSweeper`] expires overdue rows and
//! sends reminders; [`ReportingAggregator`] summarizes the ledger.

pub mod authorization;
pub mod classification;
pub mod clock;
pub mod domain;
pub mod extraction;
pub mod ledger;
pub mod memory;
pub mod report;
pub mod repository;
pub mod router;
pub mod service;
pub mod sweeper;

#[cfg(test)]
mod tests;

pub use authorization::{ensure_capability, AuthorizationError, CallerRole, Capability};
pub use classification::{
    classify, classify_with_evidence, Classification, ConsentOutcome, REFUSAL_KEYWORDS,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    day_bounds, end_of_day, parse_deadline, ClassId, ClassRoom, ConsentDraft, ConsentRequest,
    ConsentRequestId, ContactHandle, DocumentRef, ParentAccount, ParentId, Student, StudentId,
    SubmissionId, SubmissionRecord, SubmissionStatus, TeacherAccount, TeacherId, UnknownStatus,
};
pub use extraction::UploadExtractor;
pub use ledger::SubmissionLedger;
pub use memory::{InMemoryConsentStore, RecordingNotificationSink, SentNotification};
pub use report::{
    percent_of, ClassStatistics, FleetReport, ReportingAggregator, RequestStatistics,
    StatusReport, StatusShare,
};
pub use repository::{
    ConsentStore, DeliveryError, ExtractionError, NotificationSink, RepositoryError, StatusSwap,
    StoreTransaction, TextExtractor,
};
pub use router::{
    authorization_response, authorize, consent_error_response, consent_router, ConsentApi,
    ROLE_HEADER,
};
pub use service::{ConsentError, ConsentLifecycleService, ParentConsentEntry};
pub use sweeper::{
    spawn_schedule, DeadlineSweeper, ExpirySweepReport, ReminderSweepReport, SweepError,
    SweepKind, SweepRun, SweepSettings, SweepSummary,
};
