//! Reference implementations of the store and notification collaborators.
//!
//! `InMemoryConsentStore` serializes every call behind one mutex and applies transactions
//! to a staged copy of its state, which gives the all-or-nothing and compare-and-set
//! behavior a relational store would provide.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::domain::{
    ClassId, ClassRoom, ConsentDraft, ConsentRequest, ConsentRequestId, ContactHandle,
    DocumentRef, ParentAccount, ParentId, Student, StudentId, SubmissionId, SubmissionRecord,
    SubmissionStatus, TeacherAccount, TeacherId,
};
use super::repository::{
    ConsentStore, DeliveryError, NotificationSink, RepositoryError, StatusSwap, StoreTransaction,
};

#[derive(Debug, Default, Clone)]
struct StoreState {
    next_id: u64,
    teachers: BTreeMap<TeacherId, TeacherAccount>,
    classes: BTreeMap<ClassId, ClassRoom>,
    students: BTreeMap<StudentId, Student>,
    parents: BTreeMap<ParentId, ParentAccount>,
    guardianships: Vec<(ParentId, StudentId)>,
    requests: BTreeMap<ConsentRequestId, ConsentRequest>,
    submissions: BTreeMap<SubmissionId, SubmissionRecord>,
}

impl StoreState {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn enrolled_student_ids(&self, class_id: ClassId) -> Vec<StudentId> {
        self.students
            .values()
            .filter(|student| student.class_id == class_id)
            .map(|student| student.id)
            .collect()
    }

    fn insert_request(&mut self, draft: &ConsentDraft, created_at: DateTime<Utc>) -> ConsentRequest {
        let request = ConsentRequest {
            id: ConsentRequestId(self.allocate()),
            name: draft.name.clone(),
            document: draft.document.clone(),
            deadline: draft.deadline,
            class_id: draft.class_id,
            created_at,
        };
        self.requests.insert(request.id, request.clone());
        request
    }

    fn insert_submission(
        &mut self,
        request_id: ConsentRequestId,
        student_id: StudentId,
        at: DateTime<Utc>,
    ) -> Result<SubmissionRecord, RepositoryError> {
        if !self.requests.contains_key(&request_id) || !self.students.contains_key(&student_id) {
            return Err(RepositoryError::NotFound);
        }
        if self
            .submissions
            .values()
            .any(|row| row.request_id == request_id && row.student_id == student_id)
        {
            return Err(RepositoryError::Conflict);
        }

        let record = SubmissionRecord {
            id: SubmissionId(self.allocate()),
            request_id,
            student_id,
            status: SubmissionStatus::Pending,
            document: None,
            updated_at: at,
        };
        self.submissions.insert(record.id, record.clone());
        Ok(record)
    }

    fn has_pending(&self, request_id: ConsentRequestId) -> bool {
        self.submissions
            .values()
            .any(|row| row.request_id == request_id && row.status == SubmissionStatus::Pending)
    }
}

/// Process-local consent store used by the API binary, demos, and tests.
#[derive(Debug, Default)]
pub struct InMemoryConsentStore {
    state: Mutex<StoreState>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("store mutex poisoned".to_string()))
    }

    pub fn add_teacher(
        &self,
        full_name: &str,
        contact: Option<ContactHandle>,
    ) -> Result<TeacherAccount, RepositoryError> {
        let mut state = self.lock()?;
        let teacher = TeacherAccount {
            id: TeacherId(state.allocate()),
            full_name: full_name.to_string(),
            contact,
        };
        state.teachers.insert(teacher.id, teacher.clone());
        Ok(teacher)
    }

    pub fn add_class(&self, name: &str, teacher_id: TeacherId) -> Result<ClassRoom, RepositoryError> {
        let mut state = self.lock()?;
        if !state.teachers.contains_key(&teacher_id) {
            return Err(RepositoryError::NotFound);
        }
        let class = ClassRoom {
            id: ClassId(state.allocate()),
            name: name.to_string(),
            teacher_id,
        };
        state.classes.insert(class.id, class.clone());
        Ok(class)
    }

    /// Classes owned by a teacher, ordered by name.
    pub fn classes_for_teacher(&self, teacher_id: TeacherId) -> Result<Vec<ClassRoom>, RepositoryError> {
        let state = self.lock()?;
        let mut classes: Vec<ClassRoom> = state
            .classes
            .values()
            .filter(|class| class.teacher_id == teacher_id)
            .cloned()
            .collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(classes)
    }

    pub fn add_student(&self, class_id: ClassId, full_name: &str) -> Result<Student, RepositoryError> {
        let mut state = self.lock()?;
        if !state.classes.contains_key(&class_id) {
            return Err(RepositoryError::NotFound);
        }
        let student = Student {
            id: StudentId(state.allocate()),
            full_name: full_name.to_string(),
            class_id,
        };
        state.students.insert(student.id, student.clone());
        Ok(student)
    }

    /// Enroll a student together with a placeholder parent who has not registered yet.
    pub fn enroll_student(
        &self,
        class_id: ClassId,
        student_name: &str,
        parent_name: Option<&str>,
    ) -> Result<(Student, ParentAccount), RepositoryError> {
        let mut state = self.lock()?;
        if !state.classes.contains_key(&class_id) {
            return Err(RepositoryError::NotFound);
        }
        let parent = ParentAccount {
            id: ParentId(state.allocate()),
            full_name: parent_name.map(str::to_string),
            contact: None,
        };
        let student = Student {
            id: StudentId(state.allocate()),
            full_name: student_name.to_string(),
            class_id,
        };
        state.parents.insert(parent.id, parent.clone());
        state.students.insert(student.id, student.clone());
        state.guardianships.push((parent.id, student.id));
        Ok((student, parent))
    }

    pub fn add_parent(
        &self,
        full_name: Option<&str>,
        contact: Option<ContactHandle>,
    ) -> Result<ParentAccount, RepositoryError> {
        let mut state = self.lock()?;
        let parent = ParentAccount {
            id: ParentId(state.allocate()),
            full_name: full_name.map(str::to_string),
            contact,
        };
        state.parents.insert(parent.id, parent.clone());
        Ok(parent)
    }

    pub fn link_parent(&self, parent_id: ParentId, student_id: StudentId) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if !state.parents.contains_key(&parent_id) || !state.students.contains_key(&student_id) {
            return Err(RepositoryError::NotFound);
        }
        if state.guardianships.contains(&(parent_id, student_id)) {
            return Err(RepositoryError::Conflict);
        }
        state.guardianships.push((parent_id, student_id));
        Ok(())
    }

    /// Attach the external identity a placeholder parent registered with.
    pub fn register_parent(
        &self,
        parent_id: ParentId,
        contact: ContactHandle,
    ) -> Result<ParentAccount, RepositoryError> {
        let mut state = self.lock()?;
        let parent = state
            .parents
            .get_mut(&parent_id)
            .ok_or(RepositoryError::NotFound)?;
        parent.contact = Some(contact);
        Ok(parent.clone())
    }
}

struct StagedTransaction {
    state: StoreState,
}

impl StoreTransaction for StagedTransaction {
    fn class(&self, id: ClassId) -> Result<Option<ClassRoom>, RepositoryError> {
        Ok(self.state.classes.get(&id).cloned())
    }

    fn enrolled_student_ids(&self, class_id: ClassId) -> Result<Vec<StudentId>, RepositoryError> {
        Ok(self.state.enrolled_student_ids(class_id))
    }

    fn fetch_request(
        &self,
        id: ConsentRequestId,
    ) -> Result<Option<ConsentRequest>, RepositoryError> {
        Ok(self.state.requests.get(&id).cloned())
    }

    fn insert_request(
        &mut self,
        draft: &ConsentDraft,
        created_at: DateTime<Utc>,
    ) -> Result<ConsentRequest, RepositoryError> {
        Ok(self.state.insert_request(draft, created_at))
    }

    fn insert_submission(
        &mut self,
        request_id: ConsentRequestId,
        student_id: StudentId,
        at: DateTime<Utc>,
    ) -> Result<SubmissionRecord, RepositoryError> {
        self.state.insert_submission(request_id, student_id, at)
    }
}

impl ConsentStore for InMemoryConsentStore {
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTransaction) -> Result<T, E>,
        E: From<RepositoryError>,
    {
        let mut guard = self.lock()?;
        let mut staged = StagedTransaction {
            state: guard.clone(),
        };
        let value = work(&mut staged)?;
        *guard = staged.state;
        Ok(value)
    }

    fn fetch_request(
        &self,
        id: ConsentRequestId,
    ) -> Result<Option<ConsentRequest>, RepositoryError> {
        Ok(self.lock()?.requests.get(&id).cloned())
    }

    fn requests_for_class(
        &self,
        class_id: ClassId,
    ) -> Result<Vec<ConsentRequest>, RepositoryError> {
        let state = self.lock()?;
        let mut requests: Vec<ConsentRequest> = state
            .requests
            .values()
            .filter(|request| request.class_id == class_id)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(requests)
    }

    fn expiry_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConsentRequest>, RepositoryError> {
        let state = self.lock()?;
        let mut requests: Vec<ConsentRequest> = state
            .requests
            .values()
            .filter(|request| request.deadline < now && state.has_pending(request.id))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.deadline.cmp(&b.deadline).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    fn requests_due_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ConsentRequest>, RepositoryError> {
        let state = self.lock()?;
        let mut requests: Vec<ConsentRequest> = state
            .requests
            .values()
            .filter(|request| request.deadline >= start && request.deadline < end)
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.deadline.cmp(&b.deadline).then_with(|| a.id.cmp(&b.id)));
        Ok(requests)
    }

    fn submission(&self, id: SubmissionId) -> Result<Option<SubmissionRecord>, RepositoryError> {
        Ok(self.lock()?.submissions.get(&id).cloned())
    }

    fn submission_for(
        &self,
        request_id: ConsentRequestId,
        student_id: StudentId,
    ) -> Result<Option<SubmissionRecord>, RepositoryError> {
        Ok(self
            .lock()?
            .submissions
            .values()
            .find(|row| row.request_id == request_id && row.student_id == student_id)
            .cloned())
    }

    fn submissions_for_request(
        &self,
        request_id: ConsentRequestId,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError> {
        Ok(self
            .lock()?
            .submissions
            .values()
            .filter(|row| row.request_id == request_id)
            .cloned()
            .collect())
    }

    fn submissions_for_student(
        &self,
        student_id: StudentId,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError> {
        Ok(self
            .lock()?
            .submissions
            .values()
            .filter(|row| row.student_id == student_id)
            .cloned()
            .collect())
    }

    fn compare_and_set_status(
        &self,
        id: SubmissionId,
        expected: SubmissionStatus,
        next: SubmissionStatus,
        document: Option<DocumentRef>,
        at: DateTime<Utc>,
    ) -> Result<StatusSwap, RepositoryError> {
        let mut state = self.lock()?;
        let Some(row) = state.submissions.get_mut(&id) else {
            return Ok(StatusSwap::Missing);
        };
        if row.status != expected {
            return Ok(StatusSwap::Conflict(row.clone()));
        }

        row.status = next;
        if document.is_some() {
            row.document = document;
        }
        row.updated_at = at;
        Ok(StatusSwap::Applied(row.clone()))
    }

    fn expire_pending(
        &self,
        request_id: ConsentRequestId,
        at: DateTime<Utc>,
    ) -> Result<Vec<SubmissionRecord>, RepositoryError> {
        let mut state = self.lock()?;
        let mut expired = Vec::new();
        for row in state.submissions.values_mut() {
            if row.request_id == request_id && row.status == SubmissionStatus::Pending {
                row.status = SubmissionStatus::Expired;
                row.updated_at = at;
                expired.push(row.clone());
            }
        }
        Ok(expired)
    }

    fn student(&self, id: StudentId) -> Result<Option<Student>, RepositoryError> {
        Ok(self.lock()?.students.get(&id).cloned())
    }

    fn class(&self, id: ClassId) -> Result<Option<ClassRoom>, RepositoryError> {
        Ok(self.lock()?.classes.get(&id).cloned())
    }

    fn classes(&self) -> Result<Vec<ClassRoom>, RepositoryError> {
        let mut classes: Vec<ClassRoom> = self.lock()?.classes.values().cloned().collect();
        classes.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(classes)
    }

    fn teacher(&self, id: TeacherId) -> Result<Option<TeacherAccount>, RepositoryError> {
        Ok(self.lock()?.teachers.get(&id).cloned())
    }

    fn parent(&self, id: ParentId) -> Result<Option<ParentAccount>, RepositoryError> {
        Ok(self.lock()?.parents.get(&id).cloned())
    }

    fn parents_of_student(&self, id: StudentId) -> Result<Vec<ParentAccount>, RepositoryError> {
        let state = self.lock()?;
        Ok(state
            .guardianships
            .iter()
            .filter(|(_, student_id)| *student_id == id)
            .filter_map(|(parent_id, _)| state.parents.get(parent_id).cloned())
            .collect())
    }

    fn students_of_parent(&self, id: ParentId) -> Result<Vec<StudentId>, RepositoryError> {
        Ok(self
            .lock()?
            .guardianships
            .iter()
            .filter(|(parent_id, _)| *parent_id == id)
            .map(|(_, student_id)| *student_id)
            .collect())
    }
}

/// A message handed to [`RecordingNotificationSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub recipient: ContactHandle,
    pub text: String,
}

/// Sink that keeps every delivered message and can be told to reject chosen recipients.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<SentNotification>>,
    blocked: Mutex<HashSet<ContactHandle>>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future delivery to `recipient` fail.
    pub fn block(&self, recipient: ContactHandle) {
        self.blocked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(recipient);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn sent_to(&self, recipient: &ContactHandle) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|message| &message.recipient == recipient)
            .map(|message| message.text)
            .collect()
    }

    pub fn clear(&self) {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn send(&self, recipient: &ContactHandle, text: &str) -> Result<(), DeliveryError> {
        let blocked = self
            .blocked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(recipient);
        if blocked {
            return Err(DeliveryError::Blocked(recipient.clone()));
        }

        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SentNotification {
                recipient: recipient.clone(),
                text: text.to_string(),
            });
        Ok(())
    }
}
