//! GasDesk API Library
//!
//! Financial document core of a gas-delivery back office: orders with
//! cylinder details, invoices with items and a payment ledger, each mutation
//! running in one bounded database transaction.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod cache;
pub mod config;
pub mod correlation;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod repositories;
pub mod services;

use std::sync::Arc;

use crate::cache::CacheInvalidator;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::{
    invoicing::InvoiceService, orders::OrderService, references::ReferenceValidator,
    DocumentSettings, SideEffects,
};

/// Document services sharing one pool, reference registry and side-effect sink.
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub invoices: Arc<InvoiceService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DbPool>,
        references: Arc<dyn ReferenceValidator>,
        cache: Arc<dyn CacheInvalidator>,
        events: Option<EventSender>,
        settings: DocumentSettings,
    ) -> Self {
        let side_effects = SideEffects::new(cache, events);
        Self {
            orders: Arc::new(OrderService::new(
                db.clone(),
                references.clone(),
                side_effects.clone(),
                settings.clone(),
            )),
            invoices: Arc::new(InvoiceService::new(db, references, side_effects, settings)),
        }
    }
}
