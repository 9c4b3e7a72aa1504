use crate::infra::{parse_date, ConsentRuntime};
use crate::roster::{import_roster, import_roster_file, RosterSummary};
use chrono::{DateTime, Duration, FixedOffset, Local, NaiveDate, Utc};
use clap::{Args, Subcommand, ValueEnum};
use consent_tracker::config::{AppConfig, SweepConfig};
use consent_tracker::error::AppError;
use consent_tracker::workflows::consent::{
    day_bounds, end_of_day, Clock, ConsentDraft, ConsentRequest, ConsentRequestId, ConsentStore,
    DocumentRef, ManualClock, ParentConsentEntry, ParentId, SubmissionStatus, SweepKind, SweepRun,
    SweepSummary, UploadExtractor,
};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEMO_ROSTER: &str = "\
class,teacher,teacher_contact,student,parent,parent_contact
5A,Anna Petrova,tg:anna.petrova,Ivan Ivanov,Irina Ivanova,tg:irina.ivanova
5A,Anna Petrova,tg:anna.petrova,Maria Smirnova,Sergey Smirnov,tg:sergey.smirnov
5A,Anna Petrova,tg:anna.petrova,Oleg Kuznetsov,,
5A,Anna Petrova,tg:anna.petrova,Anya Ivanova,Irina Ivanova,tg:irina.ivanova
6B,Boris Orlov,tg:boris.orlov,Pavel Sokolov,Petr Sokolov,tg:petr.sokolov
6B,Boris Orlov,tg:boris.orlov,Daria Volkova,,
";

/// Requests every seeded class receives: name plus deadline offset from "today" in days.
/// `None` means "today + reminder lookahead", so the reminder sweep has something to do.
const DEMO_REQUESTS: [(&str, Option<i64>); 3] = [
    ("Field Trip", Some(-1)),
    ("Theatre Visit", None),
    ("Vaccination", Some(10)),
];

/// Outbox size for CLI runs; large enough to hold every demo message.
const CLI_OUTBOX_CAPACITY: usize = 1_024;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Evaluation date (YYYY-MM-DD or DD.MM.YYYY). Defaults to today.
    #[arg(long, value_parser = parse_date)]
    pub(crate) today: Option<NaiveDate>,
    /// Roster CSV (class,teacher,teacher_contact,student,parent,parent_contact) replacing the built-in school.
    #[arg(long)]
    pub(crate) roster: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum SweepTarget {
    Expiry,
    Reminder,
}

impl From<SweepTarget> for SweepKind {
    fn from(value: SweepTarget) -> Self {
        match value {
            SweepTarget::Expiry => SweepKind::Expiry,
            SweepTarget::Reminder => SweepKind::Reminder,
        }
    }
}

#[derive(Args, Debug)]
pub(crate) struct SweepArgs {
    /// Which sweep to run against the seeded school
    #[arg(value_enum)]
    pub(crate) kind: SweepTarget,
    #[command(flatten)]
    pub(crate) school: DemoArgs,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ReportCommand {
    /// Per-student status breakdown for one consent request, or for all of them
    Status(StatusReportArgs),
    /// Per-class percentages across every consent request
    Fleet(FleetReportArgs),
}

#[derive(Args, Debug)]
pub(crate) struct StatusReportArgs {
    /// Consent request ID; omit to print every request
    #[arg(long)]
    pub(crate) consent_id: Option<u64>,
    #[command(flatten)]
    pub(crate) school: DemoArgs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum ReportFormat {
    #[default]
    Text,
    Csv,
    Json,
}

#[derive(Args, Debug)]
pub(crate) struct FleetReportArgs {
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub(crate) format: ReportFormat,
    #[command(flatten)]
    pub(crate) school: DemoArgs,
}

/// A seeded school: every class holds the demo requests, some already answered.
pub(crate) struct DemoSchool {
    pub(crate) runtime: ConsentRuntime,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) roster: RosterSummary,
    pub(crate) requests: Vec<ConsentRequest>,
    pub(crate) announcements: usize,
}

pub(crate) fn seed_school(
    sweeps: &SweepConfig,
    upload_root: &Path,
    today: NaiveDate,
    roster: Option<&Path>,
) -> Result<DemoSchool, AppError> {
    let offset = sweeps.reference_offset;
    let clock = Arc::new(ManualClock::new(
        morning_of(today - Duration::days(7), &offset),
        offset,
    ));
    let runtime = ConsentRuntime::new(
        sweeps,
        clock.clone(),
        Arc::new(UploadExtractor::new(upload_root.to_path_buf())),
        CLI_OUTBOX_CAPACITY,
    );

    let roster = match roster {
        Some(path) => import_roster_file(path, &runtime.store)?,
        None => import_roster(Cursor::new(DEMO_ROSTER), &runtime.store)?,
    };

    let lookahead = i64::from(sweeps.reminder_lookahead_days);
    let mut requests = Vec::new();
    for class in runtime.store.classes()? {
        for (name, days) in DEMO_REQUESTS {
            let due = today + Duration::days(days.unwrap_or(lookahead));
            let slug = name.to_lowercase().replace(' ', "-");
            let id = runtime.api.service.create_consent_request(ConsentDraft {
                name: name.to_string(),
                document: DocumentRef(format!("{}/{slug}.pdf", class.name)),
                deadline: end_of_day(due, &offset),
                class_id: class.id,
            })?;
            requests.push(runtime.api.service.get_consent(id)?);
        }
    }
    let announcements = runtime.outbox.drain().len();

    // First student of each class agrees to the trip, the second turns the theatre down.
    clock.advance(Duration::days(2));
    for request in &requests {
        let rows = runtime.api.service.ledger().list_by_request(request.id)?;
        let (pick, text) = match request.name.as_str() {
            "Field Trip" => (rows.first(), "Я согласен на поездку"),
            "Theatre Visit" => (rows.get(1), "Я не согласен"),
            _ => (None, ""),
        };
        if let Some(row) = pick {
            runtime.api.service.submit_for_student(
                row.student_id,
                request.id,
                text,
                DocumentRef(format!("answers/{}-{}.pdf", request.id, row.student_id)),
            )?;
        }
    }

    clock.set(morning_of(today, &offset));
    Ok(DemoSchool {
        runtime,
        clock,
        roster,
        requests,
        announcements,
    })
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let today = args.today.unwrap_or_else(|| Local::now().date_naive());
    let school = seed_school(
        &config.sweeps,
        &config.upload_root,
        today,
        args.roster.as_deref(),
    )?;
    let offset = config.sweeps.reference_offset;
    let runtime = &school.runtime;
    let service = &runtime.api.service;

    println!(
        "Consent lifecycle demo (today {}, UTC{})",
        school.clock.today(),
        offset
    );
    println!(
        "Roster: {} teachers, {} classes, {} students, {} registered parents",
        school.roster.teachers,
        school.roster.classes,
        school.roster.students,
        school.roster.registered_parents
    );
    println!(
        "Issued {} consent requests; {} parent announcements sent",
        school.requests.len(),
        school.announcements
    );
    for request in &school.requests {
        println!(
            "- #{} {} (class {}) due {}",
            request.id,
            request.name,
            request.class_id,
            local_time(request.deadline, &offset)
        );
    }

    if let Some(request) = school.requests.first() {
        let rows = service.ledger().list_by_request(request.id)?;
        if let Some(row) = rows.iter().find(|row| row.status == SubmissionStatus::Pending) {
            // Nothing readable at this path, so the answer defaults to acceptance.
            let scan = DocumentRef(format!("scans/{}.pdf", row.student_id));
            match service.submit_document(row.student_id, request.id, scan.clone()) {
                Ok(status) => println!("\nUnreadable scan {scan} recorded as {status}"),
                Err(err) => println!("\nUnreadable scan {scan} rejected: {err}"),
            }
        }
    }

    println!("\nReminder sweep");
    print_sweep(runtime.sweeper.run(SweepKind::Reminder)?);
    print_outbox(&school);

    println!("\nExpiry sweep");
    print_sweep(runtime.sweeper.run(SweepKind::Expiry)?);
    print_outbox(&school);

    println!("\nExpiry sweep again (nothing left to expire)");
    print_sweep(runtime.sweeper.run(SweepKind::Expiry)?);

    if let Some(request) = school.requests.first() {
        let rows = service.ledger().list_by_request(request.id)?;
        if let Some(row) = rows.iter().find(|row| row.status == SubmissionStatus::Expired) {
            match service.submit_for_student(
                row.student_id,
                request.id,
                "Согласен",
                DocumentRef("late.pdf".to_string()),
            ) {
                Ok(status) => println!("\nLate answer unexpectedly recorded as {status}"),
                Err(err) => println!("\nLate answer rejected: {err}"),
            }
        }
    }

    if let Some((parent, entries)) = first_registered_parent(&school)? {
        println!("\nConsents visible to parent #{parent}");
        for entry in entries {
            println!(
                "- {} for {}: {} (due {})",
                entry.request.name,
                entry.student.full_name,
                entry.submission.status,
                local_time(entry.request.deadline, &offset)
            );
        }
    }

    if let Some(request) = school.requests.first() {
        println!("\n{}", runtime.api.reports.status_report(request.id)?.render());
    }
    println!("{}", runtime.api.reports.fleet_report()?.render());

    Ok(())
}

pub(crate) fn run_sweep(args: SweepArgs) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let today = args.school.today.unwrap_or_else(|| Local::now().date_naive());
    let school = seed_school(
        &config.sweeps,
        &config.upload_root,
        today,
        args.school.roster.as_deref(),
    )?;

    let run = school.runtime.sweeper.run(args.kind.into())?;
    match serde_json::to_string_pretty(&run) {
        Ok(json) => println!("{json}"),
        Err(err) => println!("Sweep summary unavailable: {err}"),
    }
    print_outbox(&school);
    Ok(())
}

pub(crate) fn run_report(command: ReportCommand) -> Result<(), AppError> {
    let config = AppConfig::load()?;
    let school_args = match &command {
        ReportCommand::Status(args) => &args.school,
        ReportCommand::Fleet(args) => &args.school,
    };
    let today = school_args.today.unwrap_or_else(|| Local::now().date_naive());
    let school = seed_school(
        &config.sweeps,
        &config.upload_root,
        today,
        school_args.roster.as_deref(),
    )?;
    let reports = &school.runtime.api.reports;

    match command {
        ReportCommand::Status(args) => {
            let ids: Vec<ConsentRequestId> = match args.consent_id {
                Some(id) => vec![ConsentRequestId(id)],
                None => school.requests.iter().map(|request| request.id).collect(),
            };
            for id in ids {
                println!("{}", reports.status_report(id)?.render());
            }
        }
        ReportCommand::Fleet(args) => {
            let report = reports.fleet_report()?;
            match args.format {
                ReportFormat::Text => print!("{}", report.render()),
                ReportFormat::Csv => report.write_csv(std::io::stdout().lock())?,
                ReportFormat::Json => match serde_json::to_string_pretty(&report) {
                    Ok(json) => println!("{json}"),
                    Err(err) => println!("Fleet report unavailable: {err}"),
                },
            }
        }
    }

    Ok(())
}

type ParentView = (ParentId, Vec<ParentConsentEntry>);

fn first_registered_parent(school: &DemoSchool) -> Result<Option<ParentView>, AppError> {
    let store = &school.runtime.store;
    for request in &school.requests {
        for row in school.runtime.api.service.ledger().list_by_request(request.id)? {
            let parents = store.parents_of_student(row.student_id)?;
            if let Some(parent) = parents.into_iter().find(|parent| parent.is_registered()) {
                let entries = school.runtime.api.service.get_consents_for_parent(parent.id)?;
                return Ok(Some((parent.id, entries)));
            }
        }
    }
    Ok(None)
}

fn print_sweep(run: SweepRun<SweepSummary>) {
    match run {
        SweepRun::Skipped => println!("- skipped: another sweep of this kind is running"),
        SweepRun::Completed(SweepSummary::Expiry(report)) => println!(
            "- {} requests processed | {} records expired | {} teachers notified | {} delivery failures{}",
            report.requests_processed,
            report.records_expired,
            report.teachers_notified,
            report.delivery_failures,
            if report.timed_out { " | timed out" } else { "" }
        ),
        SweepRun::Completed(SweepSummary::Reminder(report)) => println!(
            "- deadlines on {}: {} requests | {} parents reminded | {} teachers sent pending lists | {} unreachable students | {} delivery failures{}",
            report.horizon,
            report.requests_processed,
            report.parents_notified,
            report.teachers_notified,
            report.unreachable_students,
            report.delivery_failures,
            if report.timed_out { " | timed out" } else { "" }
        ),
    }
}

fn print_outbox(school: &DemoSchool) {
    let messages = school.runtime.outbox.drain();
    if messages.is_empty() {
        println!("Outbox: empty");
        return;
    }

    println!("Outbox ({} messages)", messages.len());
    for message in messages {
        println!("  -> {}", message.recipient);
        for line in message.text.lines() {
            println!("     {line}");
        }
    }
}

fn morning_of(date: NaiveDate, offset: &FixedOffset) -> DateTime<Utc> {
    day_bounds(date, offset).0 + Duration::hours(9)
}

fn local_time(at: DateTime<Utc>, offset: &FixedOffset) -> String {
    at.with_timezone(offset).format("%d.%m.%Y %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn school() -> DemoSchool {
        let today = NaiveDate::from_ymd_opt(2024, 12, 20).expect("valid date");
        seed_school(
            &SweepConfig::default(),
            &std::env::temp_dir(),
            today,
            None,
        )
        .expect("school seeds")
    }

    #[test]
    fn seeded_school_has_requests_and_answers() {
        let school = school();

        assert_eq!(school.roster.classes, 2);
        assert_eq!(school.requests.len(), 6);
        // Siblings share a parent: two registered families in 5A, one in 6B.
        assert_eq!(school.announcements, 9);
        assert_eq!(
            school.clock.today(),
            NaiveDate::from_ymd_opt(2024, 12, 20).expect("valid date")
        );

        let trip = &school.requests[0];
        let report = school
            .runtime
            .api
            .reports
            .status_report(trip.id)
            .expect("report");
        assert_eq!(report.count(SubmissionStatus::Accepted), 1);
        assert_eq!(report.count(SubmissionStatus::Pending), 3);

        let theatre = &school.requests[1];
        let report = school
            .runtime
            .api
            .reports
            .status_report(theatre.id)
            .expect("report");
        assert_eq!(report.count(SubmissionStatus::Refused), 1);
    }

    #[test]
    fn sweeps_expire_the_overdue_trip_and_remind_about_the_theatre() {
        let school = school();

        let expiry = school
            .runtime
            .sweeper
            .run_expiry()
            .expect("expiry runs")
            .completed()
            .expect("not skipped");
        assert_eq!(expiry.requests_processed, 2);
        // Maria, Oleg and Anya in 5A plus Daria in 6B never answered.
        assert_eq!(expiry.records_expired, 4);
        assert_eq!(expiry.teachers_notified, 2);

        let reminders = school
            .runtime
            .sweeper
            .run_reminders()
            .expect("reminders run")
            .completed()
            .expect("not skipped");
        assert_eq!(reminders.requests_processed, 2);
        // Irina hears once for both children; Oleg has nobody registered.
        assert_eq!(reminders.parents_notified, 2);
        assert_eq!(reminders.unreachable_students, 1);
        assert_eq!(reminders.teachers_notified, 2);
    }

    #[test]
    fn missing_roster_file_is_an_io_error() {
        let today = NaiveDate::from_ymd_opt(2024, 12, 20).expect("valid date");
        let result = seed_school(
            &SweepConfig::default(),
            &std::env::temp_dir(),
            today,
            Some(Path::new("/definitely/not/here.csv")),
        );
        assert!(matches!(result, Err(AppError::Io(_))));
    }
}
