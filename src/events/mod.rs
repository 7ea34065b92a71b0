use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::{InvoiceStatus, OrderStatus, PaymentMethod};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiver `process_events` drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Committed changes to financial documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        customer_id: Uuid,
        total_amount: Decimal,
    },
    OrderUpdated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    },
    OrderDeleted(Uuid),
    InvoiceCreated {
        invoice_id: Uuid,
        invoice_number: String,
        total_amount: Decimal,
    },
    InvoiceUpdated(Uuid),
    InvoiceStatusChanged {
        invoice_id: Uuid,
        from: InvoiceStatus,
        to: InvoiceStatus,
    },
    InvoicePaymentRecorded {
        invoice_id: Uuid,
        payment_id: Uuid,
        amount: Decimal,
        method: PaymentMethod,
        balance_due: Decimal,
    },
    InvoicePaid {
        invoice_id: Uuid,
        paid_date: NaiveDate,
    },
    InvoiceDeleted(Uuid),
}

impl Event {
    /// Id of the document the event is about.
    pub fn document_id(&self) -> Uuid {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::OrderStatusChanged { order_id, .. } => *order_id,
            Event::OrderUpdated(id) | Event::OrderDeleted(id) => *id,
            Event::InvoiceCreated { invoice_id, .. }
            | Event::InvoiceStatusChanged { invoice_id, .. }
            | Event::InvoicePaymentRecorded { invoice_id, .. }
            | Event::InvoicePaid { invoice_id, .. } => *invoice_id,
            Event::InvoiceUpdated(id) | Event::InvoiceDeleted(id) => *id,
        }
    }
}

// Handlers receive every event; each one picks what it cares about.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event) -> Result<(), String>;
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: Event) -> Result<(), String> {
        match &event {
            Event::OrderStatusChanged { order_id, from, to } => {
                info!(%order_id, %from, %to, "order status changed")
            }
            Event::InvoiceStatusChanged { invoice_id, from, to } => {
                info!(%invoice_id, %from, %to, "invoice status changed")
            }
            Event::InvoicePaymentRecorded {
                invoice_id,
                amount,
                balance_due,
                ..
            } => info!(%invoice_id, %amount, %balance_due, "invoice payment recorded"),
            other => debug!(document_id = %other.document_id(), "document event: {:?}", other),
        }
        Ok(())
    }
}

/// Drains `rx`, fanning each event out to every handler. Ends when all senders are gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let results = join_all(
            handlers
                .iter()
                .map(|handler| handler.handle_event(event.clone())),
        )
        .await;

        for err in results.into_iter().filter_map(Result::err) {
            error!(
                "Failed to handle event for document {}: {}",
                event.document_id(),
                err
            );
        }
    }

    warn!("Event processing loop has ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: Event) -> Result<(), String> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle_event(&self, _event: Event) -> Result<(), String> {
            Err("handler down".into())
        }
    }

    #[tokio::test]
    async fn events_reach_every_handler_despite_failures() {
        let (sender, rx) = EventSender::channel(8);
        let recorder = Arc::new(Recorder::default());
        let handlers: Vec<Arc<dyn EventHandler>> =
            vec![Arc::new(Failing), recorder.clone(), Arc::new(LoggingEventHandler)];

        let id = Uuid::new_v4();
        sender.send(Event::OrderUpdated(id)).await.unwrap();
        sender.send(Event::InvoiceDeleted(id)).await.unwrap();
        drop(sender);

        process_events(rx, handlers).await;

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|e| e.document_id() == id));
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        assert!(sender.send(Event::OrderDeleted(Uuid::new_v4())).await.is_err());
    }
}
