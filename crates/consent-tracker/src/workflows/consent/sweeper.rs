use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::domain::{
    day_bounds, ConsentRequest, ContactHandle, ParentId, StudentId, SubmissionRecord,
    SubmissionStatus,
};
use super::ledger::SubmissionLedger;
use super::repository::{ConsentStore, NotificationSink, RepositoryError};
use super::service::{deliver, ConsentError};

/// Knobs shared by both sweep kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    /// Reminders go out for deadlines falling on `today + reminder_lookahead_days`.
    pub reminder_lookahead_days: u32,
    /// Work left when the budget runs out is picked up on the next interval.
    pub run_budget: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            reminder_lookahead_days: 3,
            run_budget: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Expiry,
    Reminder,
}

impl SweepKind {
    pub const fn label(self) -> &'static str {
        match self {
            SweepKind::Expiry => "expiry",
            SweepKind::Reminder => "reminder",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySweepReport {
    pub requests_processed: usize,
    pub records_expired: usize,
    pub teachers_notified: usize,
    pub delivery_failures: usize,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderSweepReport {
    pub horizon: NaiveDate,
    pub requests_processed: usize,
    pub parents_notified: usize,
    pub teachers_notified: usize,
    pub unreachable_students: usize,
    pub delivery_failures: usize,
    pub timed_out: bool,
}

impl ReminderSweepReport {
    fn new(horizon: NaiveDate) -> Self {
        Self {
            horizon,
            requests_processed: 0,
            parents_notified: 0,
            teachers_notified: 0,
            unreachable_students: 0,
            delivery_failures: 0,
            timed_out: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SweepSummary {
    Expiry(ExpirySweepReport),
    Reminder(ReminderSweepReport),
}

/// Result of asking for a sweep: either it ran, or one of the same kind was in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum SweepRun<T> {
    Completed(T),
    Skipped,
}

impl<T> SweepRun<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SweepRun<U> {
        match self {
            SweepRun::Completed(value) => SweepRun::Completed(f(value)),
            SweepRun::Skipped => SweepRun::Skipped,
        }
    }

    pub fn completed(self) -> Option<T> {
        match self {
            SweepRun::Completed(value) => Some(value),
            SweepRun::Skipped => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SweepError {
    #[error("sweep aborted by store failure: {0}")]
    Store(#[from] RepositoryError),
    #[error("sweep aborted: {0}")]
    Lifecycle(ConsentError),
}

impl From<ConsentError> for SweepError {
    fn from(value: ConsentError) -> Self {
        match value {
            ConsentError::Persistence(err) => Self::Store(err),
            other => Self::Lifecycle(other),
        }
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic escalation of overdue and soon-due consent requests.
///
/// The sweeper keeps no state between runs; each pass re-queries the store. Two runs of
/// the same kind never overlap, the second one is skipped.
pub struct DeadlineSweeper<S, N> {
    store: Arc<S>,
    ledger: SubmissionLedger<S>,
    notifier: Arc<N>,
    clock: Arc<dyn Clock>,
    settings: SweepSettings,
    expiry_in_flight: AtomicBool,
    reminder_in_flight: AtomicBool,
}

impl<S, N> DeadlineSweeper<S, N>
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    pub fn new(
        store: Arc<S>,
        notifier: Arc<N>,
        clock: Arc<dyn Clock>,
        settings: SweepSettings,
    ) -> Self {
        let ledger = SubmissionLedger::new(store.clone(), clock.clone());
        Self {
            store,
            ledger,
            notifier,
            clock,
            settings,
            expiry_in_flight: AtomicBool::new(false),
            reminder_in_flight: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> SweepSettings {
        self.settings
    }

    pub fn run(&self, kind: SweepKind) -> Result<SweepRun<SweepSummary>, SweepError> {
        match kind {
            SweepKind::Expiry => Ok(self.run_expiry()?.map(SweepSummary::Expiry)),
            SweepKind::Reminder => Ok(self.run_reminders()?.map(SweepSummary::Reminder)),
        }
    }

    /// Expire every `Pending` row of requests whose deadline has passed and send the owning
    /// teacher one summary per request that actually changed.
    pub fn run_expiry(&self) -> Result<SweepRun<ExpirySweepReport>, SweepError> {
        let Some(_flight) = InFlight::acquire(&self.expiry_in_flight) else {
            info!("expiry sweep already in flight; skipping");
            return Ok(SweepRun::Skipped);
        };

        let mut report = ExpirySweepReport::default();
        match self.expire_overdue(&mut report) {
            Ok(()) => {
                info!(
                    requests = report.requests_processed,
                    expired = report.records_expired,
                    notified = report.teachers_notified,
                    failures = report.delivery_failures,
                    timed_out = report.timed_out,
                    "expiry sweep finished"
                );
                Ok(SweepRun::Completed(report))
            }
            Err(err) => {
                error!(
                    error = %err,
                    requests = report.requests_processed,
                    expired = report.records_expired,
                    "expiry sweep aborted"
                );
                Err(err)
            }
        }
    }

    /// Remind parents and teachers about requests due on the look-ahead date.
    pub fn run_reminders(&self) -> Result<SweepRun<ReminderSweepReport>, SweepError> {
        let Some(_flight) = InFlight::acquire(&self.reminder_in_flight) else {
            info!("reminder sweep already in flight; skipping");
            return Ok(SweepRun::Skipped);
        };

        let today = self.clock.today();
        let horizon = today
            .checked_add_days(Days::new(u64::from(self.settings.reminder_lookahead_days)))
            .unwrap_or(today);
        let mut report = ReminderSweepReport::new(horizon);

        match self.remind_upcoming(&mut report) {
            Ok(()) => {
                info!(
                    %horizon,
                    requests = report.requests_processed,
                    parents = report.parents_notified,
                    teachers = report.teachers_notified,
                    unreachable = report.unreachable_students,
                    failures = report.delivery_failures,
                    timed_out = report.timed_out,
                    "reminder sweep finished"
                );
                Ok(SweepRun::Completed(report))
            }
            Err(err) => {
                error!(
                    error = %err,
                    %horizon,
                    requests = report.requests_processed,
                    "reminder sweep aborted"
                );
                Err(err)
            }
        }
    }

    fn expire_overdue(&self, report: &mut ExpirySweepReport) -> Result<(), SweepError> {
        let started = Instant::now();
        let candidates = self.store.expiry_candidates(self.clock.now())?;
        debug!(candidates = candidates.len(), "expiry candidates loaded");

        for request in candidates {
            if started.elapsed() >= self.settings.run_budget {
                warn!(request_id = %request.id, "expiry sweep out of time; resuming next interval");
                report.timed_out = true;
                break;
            }

            // Resolve recipients and names before the write so nothing but delivery
            // happens after the transition commits.
            let teacher = self.teacher_contact(&request)?;
            let names = self.pending_student_names(&request)?;

            let expired = self.ledger.expire_pending(request.id)?;
            report.requests_processed += 1;
            if expired.is_empty() {
                continue;
            }
            report.records_expired += expired.len();

            let Some(contact) = teacher else {
                info!(request_id = %request.id, "owning teacher has no contact; summary skipped");
                continue;
            };

            let mut expired_names: Vec<String> = expired
                .iter()
                .map(|record| display_name(&names, record.student_id))
                .collect();
            expired_names.sort();

            let text = format!(
                "Deadline for consent '{}' (ID: {}) has passed.\nThe following students did not submit the consent in time:\n{}",
                request.name,
                request.id,
                expired_names.join("\n")
            );
            if deliver(self.notifier.as_ref(), &contact, &text) {
                report.teachers_notified += 1;
            } else {
                report.delivery_failures += 1;
            }
        }

        Ok(())
    }

    fn remind_upcoming(&self, report: &mut ReminderSweepReport) -> Result<(), SweepError> {
        let started = Instant::now();
        let (start, end) = day_bounds(report.horizon, &self.clock.reference_offset());
        let requests = self.store.requests_due_between(start, end)?;
        debug!(horizon = %report.horizon, requests = requests.len(), "reminder candidates loaded");

        for request in requests {
            if started.elapsed() >= self.settings.run_budget {
                warn!(request_id = %request.id, "reminder sweep out of time; resuming next interval");
                report.timed_out = true;
                break;
            }

            let pending: Vec<SubmissionRecord> = self
                .ledger
                .list_by_request(request.id)?
                .into_iter()
                .filter(|record| record.status == SubmissionStatus::Pending)
                .collect();
            if pending.is_empty() {
                continue;
            }
            report.requests_processed += 1;

            let teacher = self.teacher_contact(&request)?;
            let mut pending_names = Vec::with_capacity(pending.len());
            let mut by_parent: BTreeMap<ParentId, (ContactHandle, Vec<String>)> = BTreeMap::new();

            for record in &pending {
                let name = match self.store.student(record.student_id)? {
                    Some(student) => student.full_name,
                    None => format!("student #{}", record.student_id),
                };

                let mut reachable = false;
                for parent in self.store.parents_of_student(record.student_id)? {
                    if let Some(contact) = parent.contact {
                        reachable = true;
                        by_parent
                            .entry(parent.id)
                            .or_insert_with(|| (contact, Vec::new()))
                            .1
                            .push(name.clone());
                    }
                }
                if !reachable {
                    warn!(
                        request_id = %request.id,
                        student_id = %record.student_id,
                        "no registered parent for pending student; reminder skipped"
                    );
                    report.unreachable_students += 1;
                }

                pending_names.push(name);
            }
            pending_names.sort();

            let deadline = request
                .deadline
                .with_timezone(&self.clock.reference_offset())
                .format("%d.%m.%Y %H:%M");

            for (contact, mut children) in by_parent.into_values() {
                children.sort();
                let text = format!(
                    "Reminder: consent '{}' is due {}. Still waiting for a signed document for: {}.",
                    request.name,
                    deadline,
                    children.join(", ")
                );
                if deliver(self.notifier.as_ref(), &contact, &text) {
                    report.parents_notified += 1;
                } else {
                    report.delivery_failures += 1;
                }
            }

            if let Some(contact) = teacher {
                let text = format!(
                    "Consent '{}' (ID: {}) is due {}. {} student(s) still pending:\n{}",
                    request.name,
                    request.id,
                    deadline,
                    pending_names.len(),
                    pending_names.join("\n")
                );
                if deliver(self.notifier.as_ref(), &contact, &text) {
                    report.teachers_notified += 1;
                } else {
                    report.delivery_failures += 1;
                }
            }
        }

        Ok(())
    }

    fn teacher_contact(&self, request: &ConsentRequest) -> Result<Option<ContactHandle>, SweepError> {
        let Some(class) = self.store.class(request.class_id)? else {
            return Ok(None);
        };
        Ok(self
            .store
            .teacher(class.teacher_id)?
            .and_then(|teacher| teacher.contact))
    }

    fn pending_student_names(
        &self,
        request: &ConsentRequest,
    ) -> Result<HashMap<StudentId, String>, SweepError> {
        let mut names = HashMap::new();
        for record in self.ledger.list_by_request(request.id)? {
            if record.status != SubmissionStatus::Pending {
                continue;
            }
            if let Some(student) = self.store.student(record.student_id)? {
                names.insert(student.id, student.full_name);
            }
        }
        Ok(names)
    }
}

fn display_name(names: &HashMap<StudentId, String>, id: StudentId) -> String {
    names
        .get(&id)
        .cloned()
        .unwrap_or_else(|| format!("student #{id}"))
}

/// Run one sweep kind on a fixed interval until the task is aborted.
///
/// Each run executes on the blocking pool; missed ticks are skipped rather than bursted.
pub fn spawn_schedule<S, N>(
    sweeper: Arc<DeadlineSweeper<S, N>>,
    kind: SweepKind,
    every: Duration,
) -> JoinHandle<()>
where
    S: ConsentStore + 'static,
    N: NotificationSink + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(sweep = kind.label(), every_secs = every.as_secs(), "sweep scheduled");

        loop {
            interval.tick().await;
            let worker = Arc::clone(&sweeper);
            match tokio::task::spawn_blocking(move || worker.run(kind)).await {
                Ok(Ok(SweepRun::Skipped)) => debug!(sweep = kind.label(), "tick skipped"),
                Ok(Ok(SweepRun::Completed(_))) => {}
                // Already logged by the sweep; the next tick retries.
                Ok(Err(_)) => {}
                Err(join_error) => {
                    error!(sweep = kind.label(), error = %join_error, "sweep task failed");
                }
            }
        }
    })
}
