use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Identifier wrapper for consent requests issued to a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsentRequestId(pub u64);

/// Identifier wrapper for per-student submission rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StudentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeacherId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParentId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(ConsentRequestId, SubmissionId, StudentId, ClassId, TeacherId, ParentId);

/// Opaque external identity a notification can be delivered to (chat id, e-mail, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactHandle(pub String);

impl fmt::Display for ContactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a stored document (upload path, object key, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef(pub String);

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Teacher input captured before a consent request is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDraft {
    pub name: String,
    pub document: DocumentRef,
    pub deadline: DateTime<Utc>,
    pub class_id: ClassId,
}

/// A single document plus deadline issued to every student of one class.
///
/// Requests are immutable once stored; an amendment means issuing a new request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRequest {
    pub id: ConsentRequestId,
    pub name: String,
    pub document: DocumentRef,
    pub deadline: DateTime<Utc>,
    pub class_id: ClassId,
    pub created_at: DateTime<Utc>,
}

impl ConsentRequest {
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline < now
    }

    /// Calendar date of the deadline as seen from the reference timezone.
    pub fn deadline_date(&self, reference: &FixedOffset) -> NaiveDate {
        self.deadline.with_timezone(reference).date_naive()
    }
}

/// Per-student tracking row for one consent request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: SubmissionId,
    pub request_id: ConsentRequestId,
    pub student_id: StudentId,
    pub status: SubmissionStatus,
    pub document: Option<DocumentRef>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a submission record.
///
/// `Pending` is the only state with outgoing transitions. `Accepted` and `Refused` are
/// terminal; `Expired` is reached only through a deadline sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubmissionStatus {
    Pending,
    Accepted,
    Refused,
    Expired,
}

impl SubmissionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "Pending",
            SubmissionStatus::Accepted => "Accepted",
            SubmissionStatus::Refused => "Refused",
            SubmissionStatus::Expired => "Expired",
        }
    }

    pub const fn ordered() -> [SubmissionStatus; 4] {
        [
            SubmissionStatus::Pending,
            SubmissionStatus::Accepted,
            SubmissionStatus::Refused,
            SubmissionStatus::Expired,
        ]
    }

    /// A parent's answer has been recorded and can no longer change.
    pub const fn is_terminal(self) -> bool {
        matches!(self, SubmissionStatus::Accepted | SubmissionStatus::Refused)
    }

    pub const fn can_transition_to(self, next: SubmissionStatus) -> bool {
        matches!(self, SubmissionStatus::Pending) && !matches!(next, SubmissionStatus::Pending)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown submission status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for SubmissionStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SubmissionStatus::ordered()
            .into_iter()
            .find(|status| status.label() == value.trim())
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub id: StudentId,
    pub full_name: String,
    pub class_id: ClassId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRoom {
    pub id: ClassId,
    pub name: String,
    pub teacher_id: TeacherId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherAccount {
    pub id: TeacherId,
    pub full_name: String,
    pub contact: Option<ContactHandle>,
}

/// Parent linked to one or more students.
///
/// Enrollment creates the account before the parent registers, so `contact` stays `None`
/// until an external identity is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentAccount {
    pub id: ParentId,
    pub full_name: Option<String>,
    pub contact: Option<ContactHandle>,
}

impl ParentAccount {
    pub fn is_registered(&self) -> bool {
        self.contact.is_some()
    }
}

/// Last second of a calendar day in the reference timezone.
pub fn end_of_day(date: NaiveDate, reference: &FixedOffset) -> DateTime<Utc> {
    let (_, next_day) = day_bounds(date, reference);
    next_day - Duration::seconds(1)
}

/// UTC half-open range `[start, end)` covering one calendar day in the reference timezone.
pub fn day_bounds(date: NaiveDate, reference: &FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_midnight = date.and_time(NaiveTime::default());
    let utc_midnight = local_midnight - Duration::seconds(i64::from(reference.local_minus_utc()));
    let start = Utc.from_utc_datetime(&utc_midnight);
    (start, start + Duration::days(1))
}

/// Parse a deadline typed by a teacher.
///
/// Accepts an RFC 3339 timestamp, or a bare date as `DD.MM.YYYY` or `YYYY-MM-DD`. A bare
/// date resolves to midnight at the start of that day in the reference timezone.
pub fn parse_deadline(raw: &str, reference: &FixedOffset) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    ["%d.%m.%Y", "%Y-%m-%d"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
        .map(|date| day_bounds(date, reference).0)
        .ok_or_else(|| format!("invalid deadline '{raw}'; expected DD.MM.YYYY"))
}
