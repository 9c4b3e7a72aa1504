//! Consent lifecycle engine: issue consent requests to a class, collect and classify
//! parent answers, expire overdue requests, remind ahead of deadlines, and report.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
