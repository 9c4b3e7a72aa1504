use crate::cli::ServeArgs;
use crate::infra::{AppState, ConsentRuntime};
use crate::roster::import_roster_file;
use crate::routes::with_consent_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use consent_tracker::config::AppConfig;
use consent_tracker::error::AppError;
use consent_tracker::telemetry;
use consent_tracker::workflows::consent::{
    spawn_schedule, Clock, SweepKind, SystemClock, UploadExtractor,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

/// Messages kept in memory for inspection; older ones are dropped.
const OUTBOX_CAPACITY: usize = 10_000;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.sweeps.reference_offset));
    let extractor = Arc::new(UploadExtractor::new(config.upload_root.clone()));
    let runtime = ConsentRuntime::new(&config.sweeps, clock, extractor, OUTBOX_CAPACITY);

    if let Some(path) = args.roster.take() {
        let summary = import_roster_file(&path, &runtime.store)?;
        info!(
            roster = %path.display(),
            classes = summary.classes,
            students = summary.students,
            registered_parents = summary.registered_parents,
            "roster imported"
        );
    }

    let schedules = [
        spawn_schedule(
            runtime.sweeper.clone(),
            SweepKind::Expiry,
            config.sweeps.expiry_interval,
        ),
        spawn_schedule(
            runtime.sweeper.clone(),
            SweepKind::Reminder,
            config.sweeps.reminder_interval,
        ),
    ];

    let app = with_consent_routes(&runtime)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        reference_offset = %config.sweeps.reference_offset,
        "consent tracker ready"
    );

    let served = axum::serve(listener, app).await;
    for schedule in schedules {
        schedule.abort();
    }
    served?;
    Ok(())
}
