#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use gasdesk_api::{
    cache::{CacheError, CacheInvalidator},
    db::{self, DbConfig, DbPool},
    entities::{DeliveryMethod, InvoiceStatus, PaymentMethod, TransactionType, CylinderCondition},
    events::{Event, EventSender},
    services::{
        invoicing::{CreateInvoiceRequest, InvoiceItemInput},
        orders::{CreateOrderRequest, OrderDetailInput},
        payment_ledger::NewPayment,
        references::{InMemoryReferences, ReferenceKind},
        DocumentSettings,
    },
    AppServices,
};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Cache sink that remembers every key it was asked to drop.
#[derive(Default)]
pub struct RecordingInvalidator {
    keys: Mutex<Vec<String>>,
}

impl RecordingInvalidator {
    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.keys.lock().unwrap().clear();
    }
}

#[async_trait]
impl CacheInvalidator for RecordingInvalidator {
    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }
}

/// Services wired to a private in-memory SQLite database.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub refs: Arc<InMemoryReferences>,
    pub cache: Arc<RecordingInvalidator>,
    pub services: AppServices,
    pub customer_id: Uuid,
    pub category_id: Uuid,
    events: Option<mpsc::Receiver<Event>>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::build(false).await
    }

    /// Same as `new`, with domain events captured for inspection.
    pub async fn with_events() -> Self {
        Self::build(true).await
    }

    async fn build(capture_events: bool) -> Self {
        let pool = db::establish_connection_with_config(&DbConfig::sqlite_in_memory())
            .await
            .expect("sqlite connection");
        db::run_migrations(&pool).await.expect("migrations");
        let db = Arc::new(pool);

        let refs = Arc::new(InMemoryReferences::new());
        let customer_id = refs.add(ReferenceKind::Customer);
        let category_id = refs.add(ReferenceKind::CylinderCategory);
        let cache = Arc::new(RecordingInvalidator::default());

        let (sender, events) = if capture_events {
            let (sender, rx) = EventSender::channel(1024);
            (Some(sender), Some(rx))
        } else {
            (None, None)
        };

        let services = AppServices::new(
            db.clone(),
            refs.clone(),
            cache.clone(),
            sender,
            DocumentSettings::default(),
        );

        Self {
            db,
            refs,
            cache,
            services,
            customer_id,
            category_id,
            events,
        }
    }

    /// Events published so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut seen = Vec::new();
        if let Some(rx) = self.events.as_mut() {
            while let Ok(event) = rx.try_recv() {
                seen.push(event);
            }
        }
        seen
    }

    pub fn detail(&self, quantity: i32, unit_price: Decimal) -> OrderDetailInput {
        OrderDetailInput {
            cylinder_category_id: self.category_id,
            transaction_type: TransactionType::Refill,
            quantity,
            unit_price,
            cylinder_condition: CylinderCondition::Good,
            notes: None,
        }
    }

    pub fn order_request(&self, details: Vec<OrderDetailInput>) -> CreateOrderRequest {
        CreateOrderRequest {
            customer_id: self.customer_id,
            delivery_method: DeliveryMethod::Delivery,
            delivery_address_id: None,
            driver_id: None,
            payment_status: None,
            notes: None,
            details,
        }
    }

    pub fn invoice_request(&self, items: Vec<InvoiceItemInput>) -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            invoice_number: None,
            customer_id: self.customer_id,
            customer_name: "Harbour Bakery".to_string(),
            issue_date: date(2024, 3, 1),
            due_date: date(2024, 3, 31),
            status: Some(InvoiceStatus::Issued),
            discount_amount: Decimal::ZERO,
            notes: None,
            payment_terms: None,
            currency: None,
            created_by: None,
            items,
        }
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn item(quantity: Decimal, unit_price: Decimal, tax_rate: Decimal) -> InvoiceItemInput {
    InvoiceItemInput {
        product_id: None,
        product_name: "Cylinder refill".to_string(),
        quantity,
        unit_price,
        tax_rate,
    }
}

pub fn payment(amount: Decimal) -> NewPayment {
    NewPayment {
        amount,
        payment_date: date(2024, 3, 10),
        payment_method: PaymentMethod::Cash,
        reference: None,
        notes: None,
        created_by: None,
    }
}
