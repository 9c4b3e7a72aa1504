use super::common::*;
use chrono::Duration;

use crate::workflows::consent::domain::{ConsentRequestId, SubmissionStatus};
use crate::workflows::consent::service::ConsentError;

#[test]
fn status_report_groups_students_by_status() {
    let harness = Harness::new();
    let room = seed_class(&harness.store, "5A", &["Oleg", "Ivan", "Maria", "Anya"], &[]);
    let request = harness.issue(room.class.id, "Museum", now() + Duration::days(2));
    harness
        .service
        .submit_for_student(room.student("Oleg").id, request.id, "Согласен", document("o.pdf"))
        .expect("accepted");
    harness
        .service
        .submit_for_student(room.student("Anya").id, request.id, "Согласна", document("a.pdf"))
        .expect("accepted");
    harness
        .service
        .submit_for_student(room.student("Maria").id, request.id, "Отказываюсь", document("m.pdf"))
        .expect("refused");

    let report = harness.reports().status_report(request.id).expect("report");

    assert_eq!(report.total, 4);
    assert_eq!(report.count(SubmissionStatus::Accepted), 2);
    assert_eq!(report.count(SubmissionStatus::Refused), 1);
    assert_eq!(report.count(SubmissionStatus::Pending), 1);
    assert_eq!(report.count(SubmissionStatus::Expired), 0);
    assert_eq!(report.counts.len(), 4, "every status is listed");
    assert_eq!(
        report.students[&SubmissionStatus::Accepted],
        vec!["Anya".to_string(), "Oleg".to_string()]
    );

    let rendered = report.render();
    assert!(rendered.starts_with(&format!("Report for consent 'Museum' (ID: {})", request.id)));
    assert!(rendered.contains("  - Accepted: 2\n"));
    assert!(rendered.contains("  - Total: 4\n"));
    assert!(rendered.contains("Students with status 'Refused':\n  - Maria\n"));
    assert!(!rendered.contains("Students with status 'Expired'"));
}

#[test]
fn status_report_for_unknown_request_is_not_found() {
    let harness = Harness::new();
    let err = harness
        .reports()
        .status_report(ConsentRequestId(12))
        .expect_err("missing");
    assert!(matches!(err, ConsentError::NotFound { .. }));
}

#[test]
fn fleet_report_covers_every_class_and_empty_requests() {
    let harness = Harness::new();
    let busy = seed_class(&harness.store, "5A", &["Ivan", "Maria", "Oleg"], &[]);
    let empty = seed_class(&harness.store, "1B", &[], &[]);
    seed_class(&harness.store, "9C", &["Anya"], &[]);

    let trip = harness.issue(busy.class.id, "Field Trip", yesterday());
    harness
        .service
        .submit_for_student(busy.student("Ivan").id, trip.id, "", document("i.pdf"))
        .expect("accepted");
    harness
        .sweeper(Default::default())
        .run_expiry()
        .expect("sweep runs");
    harness.issue(empty.class.id, "Photo Day", now() + Duration::days(1));

    let fleet = harness.reports().fleet_report().expect("fleet");
    let names: Vec<&str> = fleet
        .classes
        .iter()
        .map(|class| class.class.name.as_str())
        .collect();
    assert_eq!(names, vec!["1B", "5A", "9C"]);

    let photo = &fleet.classes[0].requests[0];
    assert_eq!(photo.total, 0);
    assert!(photo.shares.iter().all(|share| share.percent == 0.0));

    let trip_stats = &fleet.classes[1].requests[0];
    assert_eq!(trip_stats.total, 3);
    let accepted = trip_stats.share(SubmissionStatus::Accepted).expect("share");
    assert_eq!((accepted.count, accepted.percent), (1, 33.3));
    let expired = trip_stats.share(SubmissionStatus::Expired).expect("share");
    assert_eq!((expired.count, expired.percent), (2, 66.7));

    assert!(fleet.classes[2].requests.is_empty());

    let rendered = fleet.render();
    assert!(rendered.contains("Class: 9C\n  No consents for this class.\n"));
    assert!(rendered.contains("    Expired: 2 (66.7%)\n"));
    assert!(rendered.contains("  Consent: Photo Day"));
}

#[test]
fn fleet_report_exports_csv_rows() {
    let harness = Harness::new();
    let room = seed_class(&harness.store, "5A", &["Ivan"], &[]);
    let request = harness.issue(room.class.id, "Museum", now() + Duration::days(2));

    let fleet = harness.reports().fleet_report().expect("fleet");
    let mut buffer = Vec::new();
    fleet.write_csv(&mut buffer).expect("csv written");
    let csv = String::from_utf8(buffer).expect("utf-8");

    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "class_id,class,consent_id,consent,status,count,percent");
    assert_eq!(lines.len(), 5, "header plus one row per status");
    assert_eq!(
        lines[1],
        format!("{},5A,{},Museum,Pending,1,100.0", room.class.id, request.id)
    );
    assert!(lines[4].ends_with("Expired,0,0.0"));
}
