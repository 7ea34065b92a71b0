// Financial document services
pub mod invoicing;
pub mod orders;

// Building blocks composed by the document services
pub mod payment_ledger;
pub mod references;
pub mod status_machine;
pub mod totals;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use validator::validate_length;

use crate::cache::CacheInvalidator;
use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};

const MAX_NOTES_LEN: u64 = 2000;

/// A note sent along with a status change obeys the same bound as header notes.
pub(crate) fn check_status_notes(notes: Option<&str>) -> Result<(), ServiceError> {
    match notes {
        Some(notes) if !validate_length(notes, None, Some(MAX_NOTES_LEN), None) => {
            Err(ServiceError::ValidationError(format!(
                "Notes must be at most {} characters",
                MAX_NOTES_LEN
            )))
        }
        _ => Ok(()),
    }
}

/// Tunables shared by the document services.
#[derive(Debug, Clone)]
pub struct DocumentSettings {
    /// Upper bound for one document transaction
    pub transaction_timeout: Duration,
    /// Currency for invoices that do not name one
    pub default_currency: String,
    /// Terms copied onto invoices that do not carry their own
    pub default_payment_terms: Option<String>,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            transaction_timeout: Duration::from_secs(15),
            default_currency: "USD".to_string(),
            default_payment_terms: None,
        }
    }
}

impl From<&AppConfig> for DocumentSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            transaction_timeout: cfg.transaction_timeout(),
            default_currency: cfg.default_currency.clone(),
            default_payment_terms: cfg.default_payment_terms.clone(),
        }
    }
}

/// Work that runs only after a document transaction has committed.
///
/// Failures here never undo or fail the committed change; they are logged.
#[derive(Clone)]
pub struct SideEffects {
    cache: Arc<dyn CacheInvalidator>,
    events: Option<EventSender>,
}

impl SideEffects {
    pub fn new(cache: Arc<dyn CacheInvalidator>, events: Option<EventSender>) -> Self {
        Self { cache, events }
    }

    pub async fn invalidate(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.cache.invalidate(key).await {
                warn!(key = %key, error = %e, "cache invalidation failed after commit");
            }
        }
    }

    pub async fn publish(&self, event: Event) {
        let Some(sender) = &self.events else {
            return;
        };
        let document_id = event.document_id();
        if let Err(e) = sender.send(event).await {
            warn!(%document_id, error = %e, "failed to publish document event");
        }
    }

    /// Invalidates `keys`, then publishes `events` in order.
    pub async fn after_commit(&self, keys: Vec<String>, events: Vec<Event>) {
        debug!(keys = keys.len(), events = events.len(), "running post-commit side effects");
        self.invalidate(&keys).await;
        for event in events {
            self.publish(event).await;
        }
    }
}
