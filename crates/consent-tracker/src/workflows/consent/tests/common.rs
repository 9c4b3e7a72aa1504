use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::workflows::consent::clock::ManualClock;
use crate::workflows::consent::domain::{
    ClassId, ClassRoom, ConsentDraft, ConsentRequest, ConsentRequestId, ContactHandle,
    DocumentRef, ParentAccount, ParentId, Student, StudentId, SubmissionId, SubmissionRecord,
    SubmissionStatus, TeacherAccount, TeacherId,
};
use crate::workflows::consent::memory::{InMemoryConsentStore, RecordingNotificationSink};
use crate::workflows::consent::repository::{
    ConsentStore, ExtractionError, RepositoryError, StatusSwap, StoreTransaction, TextExtractor,
};
use crate::workflows::consent::{
    ConsentApi, ConsentLifecycleService, DeadlineSweeper, ReportingAggregator, SweepSettings,
};

pub(super) type MemoryService = ConsentLifecycleService<InMemoryConsentStore, RecordingNotificationSink>;

pub(super) fn moscow() -> FixedOffset {
    FixedOffset::east_opt(3 * 3600).expect("valid offset")
}

/// 2024-12-20 12:00 in Moscow.
pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 20, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub(super) fn teacher_contact() -> ContactHandle {
    ContactHandle("tg:teacher".to_string())
}

pub(super) fn parent_contact(student_name: &str) -> ContactHandle {
    ContactHandle(format!("tg:parent-of-{}", student_name.to_lowercase()))
}

pub(super) fn document(name: &str) -> DocumentRef {
    DocumentRef(format!("uploads/{name}"))
}

/// A class with a contactable teacher and one parent per student.
pub(super) struct Classroom {
    pub(super) class: ClassRoom,
    pub(super) teacher: TeacherAccount,
    pub(super) students: Vec<Student>,
    pub(super) parents: Vec<ParentAccount>,
}

impl Classroom {
    pub(super) fn student(&self, name: &str) -> &Student {
        self.students
            .iter()
            .find(|student| student.full_name == name)
            .expect("student seeded")
    }

    pub(super) fn parent_of(&self, name: &str) -> &ParentAccount {
        let index = self
            .students
            .iter()
            .position(|student| student.full_name == name)
            .expect("student seeded");
        &self.parents[index]
    }
}

/// Seed a class; parents of students listed in `unregistered` never attach a contact.
pub(super) fn seed_class(
    store: &InMemoryConsentStore,
    class_name: &str,
    students: &[&str],
    unregistered: &[&str],
) -> Classroom {
    let teacher = store
        .add_teacher("Anna Petrova", Some(teacher_contact()))
        .expect("teacher added");
    let class = store.add_class(class_name, teacher.id).expect("class added");

    let mut seeded_students = Vec::new();
    let mut parents = Vec::new();
    for name in students {
        let (student, parent) = store
            .enroll_student(class.id, name, Some(format!("Parent of {name}").as_str()))
            .expect("student enrolled");
        let parent = if unregistered.contains(name) {
            parent
        } else {
            store
                .register_parent(parent.id, parent_contact(name))
                .expect("parent registered")
        };
        seeded_students.push(student);
        parents.push(parent);
    }

    Classroom {
        class,
        teacher,
        students: seeded_students,
        parents,
    }
}

pub(super) fn draft(class_id: ClassId, name: &str, deadline: DateTime<Utc>) -> ConsentDraft {
    ConsentDraft {
        name: name.to_string(),
        document: document(&format!("{}.pdf", name.to_lowercase().replace(' ', "-"))),
        deadline,
        class_id,
    }
}

/// Extractor answering from a fixed table; unknown documents are unsupported.
#[derive(Default)]
pub(super) struct StubExtractor {
    texts: HashMap<String, String>,
    reads: Arc<AtomicUsize>,
}

impl StubExtractor {
    pub(super) fn with(mut self, document: &DocumentRef, text: &str) -> Self {
        self.texts.insert(document.0.clone(), text.to_string());
        self
    }

    /// Counter of `extract` calls, shared with the extractor once it is moved into a service.
    pub(super) fn reads(&self) -> Arc<AtomicUsize> {
        self.reads.clone()
    }
}

impl TextExtractor for StubExtractor {
    fn extract(&self, document: &DocumentRef) -> Result<String, ExtractionError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.texts
            .get(&document.0)
            .cloned()
            .ok_or_else(|| ExtractionError::UnsupportedFormat {
                document: document.clone(),
                extension: "pdf".to_string(),
            })
    }
}

pub(super) struct Harness {
    pub(super) store: Arc<InMemoryConsentStore>,
    pub(super) sink: Arc<RecordingNotificationSink>,
    pub(super) clock: Arc<ManualClock>,
    pub(super) service: MemoryService,
}

impl Harness {
    pub(super) fn new() -> Self {
        Self::with_extractor(StubExtractor::default())
    }

    pub(super) fn with_extractor(extractor: StubExtractor) -> Self {
        let store = Arc::new(InMemoryConsentStore::new());
        let sink = Arc::new(RecordingNotificationSink::new());
        let clock = Arc::new(ManualClock::new(now(), moscow()));
        let service = ConsentLifecycleService::new(
            store.clone(),
            sink.clone(),
            Arc::new(extractor),
            clock.clone(),
        );
        Self {
            store,
            sink,
            clock,
            service,
        }
    }

    pub(super) fn sweeper(
        &self,
        settings: SweepSettings,
    ) -> DeadlineSweeper<InMemoryConsentStore, RecordingNotificationSink> {
        DeadlineSweeper::new(
            self.store.clone(),
            self.sink.clone(),
            self.clock.clone(),
            settings,
        )
    }

    pub(super) fn reports(&self) -> ReportingAggregator<InMemoryConsentStore> {
        ReportingAggregator::new(self.store.clone())
    }

    /// Issue a request and return it as stored.
    pub(super) fn issue(
        &self,
        class_id: ClassId,
        name: &str,
        deadline: DateTime<Utc>,
    ) -> ConsentRequest {
        let id = self
            .service
            .create_consent_request(draft(class_id, name, deadline))
            .expect("request created");
        self.service.get_consent(id).expect("request stored")
    }

    pub(super) fn status_of(&self, request_id: ConsentRequestId, student_id: StudentId) -> SubmissionStatus {
        self.store
            .submission_for(request_id, student_id)
            .expect("store readable")
            .expect("row exists")
            .status
    }

    pub(super) fn api(
        &self,
    ) -> Arc<ConsentApi<InMemoryConsentStore, RecordingNotificationSink>> {
        Arc::new(ConsentApi {
            service: ConsentLifecycleService::new(
                self.store.clone(),
                self.sink.clone(),
                Arc::new(StubExtractor::default()),
                self.clock.clone(),
            ),
            reports: self.reports(),
            sweeper: Arc::new(self.sweeper(SweepSettings::default())),
            reference_offset: moscow(),
        })
    }
}

pub(super) fn yesterday() -> DateTime<Utc> {
    now() - Duration::days(1)
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

pub(super) async fn read_text_body(response: Response) -> String {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    String::from_utf8(body.to_vec()).expect("utf-8 body")
}

/// Store wrapper with scripted faults layered over the in-memory store.
#[derive(Default)]
pub(super) struct ScriptedStore {
    pub(super) inner: InMemoryConsentStore,
    /// Successful row inserts allowed per transaction before the next one fails.
    insert_budget: Mutex<Option<usize>>,
    failing_expiry: Mutex<HashSet<ConsentRequestId>>,
    /// Make every compare-and-set observe this status instead of the stored one.
    racing_status: Mutex<Option<SubmissionStatus>>,
}

impl ScriptedStore {
    pub(super) fn fail_insert_after(&self, successful: usize) {
        *self.insert_budget.lock().expect("script mutex poisoned") = Some(successful);
    }

    pub(super) fn fail_expiry_of(&self, request_id: ConsentRequestId) {
        self.failing_expiry
            .lock()
            .expect("script mutex poisoned")
            .insert(request_id);
    }

    /// Simulate a sweep committing `status` right before the next status write.
    pub(super) fn race_with(&self, status: SubmissionStatus) {
        *self.racing_status.lock().expect("script mutex poisoned") = Some(status);
    }
}

struct FlakyTransaction<'a> {
    inner: &'a mut dyn StoreTransaction,
    remaining: usize,
}

impl StoreTransaction for FlakyTransaction<'_> {
    fn class(&self, id: ClassId) -> Result<Option<ClassRoom>, RepositoryError> {
        self.inner.class(id)
    }

    fn enrolled_student_ids(&self, class_id: ClassId) -> Result<Vec<StudentId>, RepositoryError> {
        self.inner.enrolled_student_ids(class_id)
    }

    fn fetch_request(
        &self,
        id: ConsentRequestId,
    ) -> Result<Option<ConsentRequest>, RepositoryError> {
        self.inner.fetch_request(id)
    }

    fn insert_request(
        &mut self,
        draft: &ConsentDraft,
        created_at: DateTime<Utc>,
    ) -> Result<ConsentRequest, RepositoryError> {
        self.inner.insert_request(draft, created_at)
    }

    fn insert_submission(
        &mut self,
        request_id: ConsentRequestId,
        student_id: StudentId,
        at: DateTime<Utc>,
    ) -> Result<SubmissionRecord, RepositoryError> {
        if self.remaining == 0 {
            return Err(RepositoryError::Unavailable("disk full".to_string()));
        }
        self.remaining -= 1;
        self.inner.insert_submission(request_id, student_id, at)
    }
}

impl ConsentStore for ScriptedStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let budget = *self.insert_budget.lock().expect("script mutex poisoned");
        self.inner.transaction(|tx| match budget {
            Some(remaining) => {
                let mut flaky = FlakyTransaction {
                    inner: tx,
                    remaining,
                };
                work(&mut flaky)
            }
            None => work(tx),
        })
    }

    fn fetch_request(
        &self,
        id: ConsentRequestId,
    ) -> Result<Option<ConsentRequest>, RepositoryError> {
        self.inner.fetch_request(id)
    }

    fn requests_for_class(
        &self,
        class_id: ClassId,
    ) -> Result<Vec<ConsentRequest>, RepositoryError> {
        self.inner.requests_for_class(class_id)
    }

    fn expiry_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsentRequest>, RepositoryError> {
        self.inner.expiry_candidates(now)
    }

    fn requests_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ConsentRequest>, RepositoryError> {
        self.inner.requests_due_between(start, end)
    }

    fn submission(&self, id: SubmissionId) -> Result<Option<SubmissionRecord>, RepositoryError> {
        self.inner.submission(id)
    }

    fn submission_for(
        &self,
        request_id: ConsentRequestId,
        student_id: StudentId,
    ) -> Result<Option<SubmissionRecord>, RepositoryError> {
        self.inner.submission_for(request_id, student_id)
    }

    fn submissions_for_request(
        &self,
        request_id: ConsentRequestId,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError> {
        self.inner.submissions_for_request(request_id)
    }

    fn submissions_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError> {
        self.inner.submissions_for_student(student_id)
    }

    fn compare_and_set_status(
        &self,
        id: SubmissionId,
        expected: SubmissionStatus,
        next: SubmissionStatus,
        document: Option<DocumentRef>,
        at: DateTime<Utc>,
    ) -> Result<StatusSwap, RepositoryError> {
        let racing = self
            .racing_status
            .lock()
            .expect("script mutex poisoned")
            .take();
        if let Some(status) = racing {
            self.inner
                .compare_and_set_status(id, SubmissionStatus::Pending, status, None, at)?;
        }
        self.inner
            .compare_and_set_status(id, expected, next, document, at)
    }

    fn expire_pending(
        &self,
        request_id: ConsentRequestId,
        at: DateTime<Utc>,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError> {
        if self
            .failing_expiry
            .lock()
            .expect("script mutex poisoned")
            .contains(&request_id)
        {
            return Err(RepositoryError::Unavailable("connection reset".to_string()));
        }
        self.inner.expire_pending(request_id, at)
    }

    fn student(&self, id: StudentId) -> Result<Option<Student>, RepositoryError> {
        self.inner.student(id)
    }

    fn class(&self, id: ClassId) -> Result<Option<ClassRoom>, RepositoryError> {
        self.inner.class(id)
    }

    fn classes(&self) -> Result<Vec<ClassRoom>, RepositoryError> {
        self.inner.classes()
    }

    fn teacher(&self, id: TeacherId) -> Result<Option<TeacherAccount>, RepositoryError> {
        self.inner.teacher(id)
    }

    fn parent(&self, id: ParentId) -> Result<Option<ParentAccount>, RepositoryError> {
        self.inner.parent(id)
    }

    fn parents_of_student(&self, id: StudentId) -> Result<Vec<ParentAccount>, RepositoryError> {
        self.inner.parents_of_student(id)
    }

    fn students_of_parent(&self, id: ParentId) -> Result<Vec<StudentId>, RepositoryError> {
        self.inner.students_of_parent(id)
    }
}

/// Service and sweeper wired over a [`ScriptedStore`].
pub(super) struct ScriptedHarness {
    pub(super) store: Arc<ScriptedStore>,
    pub(super) sink: Arc<RecordingNotificationSink>,
    pub(super) clock: Arc<ManualClock>,
    pub(super) service: ConsentLifecycleService<ScriptedStore, RecordingNotificationSink>,
}

impl ScriptedHarness {
    pub(super) fn new() -> Self {
        let store = Arc::new(ScriptedStore::default());
        let sink = Arc::new(RecordingNotificationSink::new());
        let clock = Arc::new(ManualClock::new(now(), moscow()));
        let service = ConsentLifecycleService::new(
            store.clone(),
            sink.clone(),
            Arc::new(StubExtractor::default()),
            clock.clone(),
        );
        Self {
            store,
            sink,
            clock,
            service,
        }
    }

    pub(super) fn sweeper(&self) -> DeadlineSweeper<ScriptedStore, RecordingNotificationSink> {
        DeadlineSweeper::new(
            self.store.clone(),
            self.sink.clone(),
            self.clock.clone(),
            SweepSettings::default(),
        )
    }
}
