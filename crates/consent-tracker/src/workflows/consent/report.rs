use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;

use serde::Serialize;

use super::domain::{ClassRoom, ConsentRequest, ConsentRequestId, SubmissionRecord, SubmissionStatus};
use super::repository::ConsentStore;
use super::service::ConsentError;

/// Count and share of one status within a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusShare {
    pub status: SubmissionStatus,
    pub count: usize,
    /// Percentage of the request total, rounded to one decimal place.
    pub percent: f64,
}

/// Per-status breakdown of a single consent request, with student names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub request: ConsentRequest,
    pub total: usize,
    pub counts: BTreeMap<SubmissionStatus, usize>,
    pub students: BTreeMap<SubmissionStatus, Vec<String>>,
}

impl StatusReport {
    pub fn count(&self, status: SubmissionStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Report for consent '{}' (ID: {})",
            self.request.name, self.request.id
        );
        out.push('\n');

        if self.total == 0 {
            out.push_str("No submissions recorded.\n");
            return out;
        }

        out.push_str("Status counts:\n");
        for status in SubmissionStatus::ordered() {
            let _ = writeln!(out, "  - {}: {}", status, self.count(status));
        }
        let _ = writeln!(out, "  - Total: {}", self.total);

        for status in SubmissionStatus::ordered() {
            let Some(names) = self.students.get(&status).filter(|names| !names.is_empty()) else {
                continue;
            };
            let _ = writeln!(out, "\nStudents with status '{status}':");
            for name in names {
                let _ = writeln!(out, "  - {name}");
            }
        }

        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStatistics {
    pub request_id: ConsentRequestId,
    pub name: String,
    pub total: usize,
    pub shares: Vec<StatusShare>,
}

impl RequestStatistics {
    fn from_records(request: &ConsentRequest, records: &[SubmissionRecord]) -> Self {
        let total = records.len();
        let shares = SubmissionStatus::ordered()
            .into_iter()
            .map(|status| {
                let count = records.iter().filter(|record| record.status == status).count();
                StatusShare {
                    status,
                    count,
                    percent: percent_of(count, total),
                }
            })
            .collect();

        Self {
            request_id: request.id,
            name: request.name.clone(),
            total,
            shares,
        }
    }

    pub fn share(&self, status: SubmissionStatus) -> Option<&StatusShare> {
        self.shares.iter().find(|share| share.status == status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassStatistics {
    pub class: ClassRoom,
    pub requests: Vec<RequestStatistics>,
}

/// Statistics across every class and every consent request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetReport {
    pub classes: Vec<ClassStatistics>,
}

impl FleetReport {
    pub fn render(&self) -> String {
        if self.classes.is_empty() {
            return "No classes on record.\n".to_string();
        }

        let mut out = String::from("Consent statistics by class\n\n");
        for class in &self.classes {
            let _ = writeln!(out, "Class: {}", class.class.name);
            if class.requests.is_empty() {
                out.push_str("  No consents for this class.\n\n");
                continue;
            }
            for request in &class.requests {
                let _ = writeln!(out, "  Consent: {} (ID: {})", request.name, request.request_id);
                if request.total == 0 {
                    out.push_str("    No submissions recorded.\n");
                }
                for share in &request.shares {
                    let _ = writeln!(
                        out,
                        "    {}: {} ({:.1}%)",
                        share.status, share.count, share.percent
                    );
                }
            }
            out.push('\n');
        }
        out
    }

    /// One row per class, request and status.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record([
            "class_id",
            "class",
            "consent_id",
            "consent",
            "status",
            "count",
            "percent",
        ])?;

        for class in &self.classes {
            for request in &class.requests {
                for share in &request.shares {
                    csv_writer.write_record([
                        class.class.id.to_string(),
                        class.class.name.clone(),
                        request.request_id.to_string(),
                        request.name.clone(),
                        share.status.label().to_string(),
                        share.count.to_string(),
                        format!("{:.1}", share.percent),
                    ])?;
                }
            }
        }

        csv_writer.flush()?;
        Ok(())
    }
}

/// `count / total * 100` to one decimal place; zero when there is nothing to divide by.
pub fn percent_of(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 1000.0 / total as f64).round() / 10.0
}

/// Read-only aggregation over the submission ledger.
pub struct ReportingAggregator<S> {
    store: Arc<S>,
}

impl<S> ReportingAggregator<S>
where
    S: ConsentStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn status_report(&self, request_id: ConsentRequestId) -> Result<StatusReport, ConsentError> {
        let request = self
            .store
            .fetch_request(request_id)?
            .ok_or_else(|| ConsentError::not_found("consent request", request_id))?;
        let records = self.store.submissions_for_request(request_id)?;

        let mut counts: BTreeMap<SubmissionStatus, usize> = SubmissionStatus::ordered()
            .into_iter()
            .map(|status| (status, 0))
            .collect();
        let mut students: BTreeMap<SubmissionStatus, Vec<String>> = BTreeMap::new();

        for record in &records {
            *counts.entry(record.status).or_insert(0) += 1;
            let name = match self.store.student(record.student_id)? {
                Some(student) => student.full_name,
                None => format!("student #{}", record.student_id),
            };
            students.entry(record.status).or_default().push(name);
        }
        for names in students.values_mut() {
            names.sort();
        }

        Ok(StatusReport {
            request,
            total: records.len(),
            counts,
            students,
        })
    }

    pub fn fleet_report(&self) -> Result<FleetReport, ConsentError> {
        let mut classes = Vec::new();
        for class in self.store.classes()? {
            let mut requests = Vec::new();
            for request in self.store.requests_for_class(class.id)? {
                let records = self.store.submissions_for_request(request.id)?;
                requests.push(RequestStatistics::from_records(&request, &records));
            }
            classes.push(ClassStatistics { class, requests });
        }
        Ok(FleetReport { classes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentages_round_to_one_decimal() {
        assert_eq!(percent_of(1, 3), 33.3);
        assert_eq!(percent_of(2, 3), 66.7);
        assert_eq!(percent_of(3, 3), 100.0);
        assert_eq!(percent_of(0, 7), 0.0);
    }

    #[test]
    fn empty_total_is_zero_percent() {
        assert_eq!(percent_of(0, 0), 0.0);
        assert_eq!(percent_of(5, 0), 0.0);
    }
}
