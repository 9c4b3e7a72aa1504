use chrono::NaiveDate;
use consent_tracker::config::SweepConfig;
use consent_tracker::workflows::consent::{
    Clock, ConsentApi, ConsentLifecycleService, ContactHandle, DeadlineSweeper, DeliveryError,
    InMemoryConsentStore, NotificationSink, ReportingAggregator, SentNotification, TextExtractor,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Delivery channel used until a messenger integration is wired in: every message is
/// logged and the most recent ones are kept for inspection.
#[derive(Debug)]
pub(crate) struct OutboxNotificationSink {
    capacity: usize,
    outbox: Mutex<VecDeque<SentNotification>>,
}

impl OutboxNotificationSink {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn messages(&self) -> Vec<SentNotification> {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Take everything queued so far, oldest first.
    pub(crate) fn drain(&self) -> Vec<SentNotification> {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect()
    }
}

impl NotificationSink for OutboxNotificationSink {
    fn send(&self, recipient: &ContactHandle, text: &str) -> Result<(), DeliveryError> {
        let mut outbox = self
            .outbox
            .lock()
            .map_err(|_| DeliveryError::Transport("outbox mutex poisoned".to_string()))?;
        if outbox.len() >= self.capacity {
            outbox.pop_front();
        }
        outbox.push_back(SentNotification {
            recipient: recipient.clone(),
            text: text.to_string(),
        });
        info!(%recipient, chars = text.chars().count(), "notification queued");
        Ok(())
    }
}

pub(crate) type ConsentState = ConsentApi<InMemoryConsentStore, OutboxNotificationSink>;

/// The collaborators behind one running instance of the consent engine.
pub(crate) struct ConsentRuntime {
    pub(crate) store: Arc<InMemoryConsentStore>,
    pub(crate) outbox: Arc<OutboxNotificationSink>,
    pub(crate) sweeper: Arc<DeadlineSweeper<InMemoryConsentStore, OutboxNotificationSink>>,
    pub(crate) api: Arc<ConsentState>,
}

impl ConsentRuntime {
    pub(crate) fn new(
        sweeps: &SweepConfig,
        clock: Arc<dyn Clock>,
        extractor: Arc<dyn TextExtractor>,
        outbox_capacity: usize,
    ) -> Self {
        let store = Arc::new(InMemoryConsentStore::new());
        let outbox = Arc::new(OutboxNotificationSink::with_capacity(outbox_capacity));
        let sweeper = Arc::new(DeadlineSweeper::new(
            store.clone(),
            outbox.clone(),
            clock.clone(),
            sweeps.sweep_settings(),
        ));
        let api = Arc::new(ConsentApi {
            service: ConsentLifecycleService::new(store.clone(), outbox.clone(), extractor, clock),
            reports: ReportingAggregator::new(store.clone()),
            sweeper: sweeper.clone(),
            reference_offset: sweeps.reference_offset,
        });

        Self {
            store,
            outbox,
            sweeper,
            api,
        }
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw.trim(), "%d.%m.%Y"))
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD or DD.MM.YYYY ({err})"))
}
