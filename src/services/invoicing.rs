use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    cache::keys,
    config::validate_currency,
    db::{bounded_transaction, DbPool},
    entities::{
        invoice::{ActiveModel as InvoiceActiveModel, Model as InvoiceModel},
        invoice_item::{ActiveModel as InvoiceItemActiveModel, Model as InvoiceItemModel},
        invoice_payment::Model as InvoicePaymentModel,
        InvoiceStatus, PaymentMethod,
    },
    errors::{ResultExt, ServiceError},
    events::Event,
    repositories::{DocumentStore, InvoiceFilter, InvoiceStore, Page, Pagination},
    services::{
        payment_ledger::{
            self, ensure_cancellable, ensure_voidable, validate_payment_amount, AppliedPayment,
            NewPayment, Settlement,
        },
        references::{ensure_exists, ensure_optional_exists, ReferenceKind, ReferenceValidator},
        status_machine::{
            check_manual_invoice_transition, check_transition, ensure_invoice_editable,
            Transition,
        },
        totals::{
            line_amounts, recalculate, validate_discount, validate_quantity, validate_tax_rate,
            validate_unit_price, LineItem,
        },
        check_status_notes, DocumentSettings, SideEffects,
    },
};

/// One priced line on a new or existing invoice.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InvoiceItemInput {
    pub product_id: Option<Uuid>,
    #[validate(length(min = 1, max = 255, message = "Product name is required"))]
    pub product_name: String,
    #[validate(custom = "validate_quantity")]
    pub quantity: Decimal,
    #[validate(custom = "validate_unit_price")]
    pub unit_price: Decimal,
    #[serde(default)]
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Decimal,
}

impl LineItem for InvoiceItemInput {
    fn quantity(&self) -> Decimal {
        self.quantity
    }

    fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    fn tax_rate(&self) -> Decimal {
        self.tax_rate
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_create_dates", skip_on_field_errors = false))]
pub struct CreateInvoiceRequest {
    /// Generated as `INV-{year}-{seq}` when absent
    #[validate(length(min = 1, max = 50))]
    pub invoice_number: Option<String>,
    pub customer_id: Uuid,
    #[validate(length(min = 1, max = 255, message = "Customer name is required"))]
    pub customer_name: String,
    pub issue_date: NaiveDate,
    pub due_date: NaiveDate,
    /// Initial status: draft (default), issued or sent
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    #[serde(default)]
    #[validate(custom = "validate_discount")]
    pub discount_amount: Decimal,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(max = 255))]
    pub payment_terms: Option<String>,
    #[validate(custom = "validate_currency")]
    pub currency: Option<String>,
    pub created_by: Option<Uuid>,
    #[validate]
    #[serde(default)]
    pub items: Vec<InvoiceItemInput>,
}

fn validate_create_dates(request: &CreateInvoiceRequest) -> Result<(), ValidationError> {
    check_due_date(request.issue_date, request.due_date)
}

fn check_due_date(issue_date: NaiveDate, due_date: NaiveDate) -> Result<(), ValidationError> {
    if due_date < issue_date {
        let mut err = ValidationError::new("due_date");
        err.message = Some("Due date cannot be before the issue date".into());
        return Err(err);
    }
    Ok(())
}

/// Header edits; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateInvoiceRequest {
    #[validate(length(min = 1, max = 255))]
    pub customer_name: Option<String>,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    #[validate(custom = "validate_discount")]
    pub discount_amount: Option<Decimal>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[validate(length(max = 255))]
    pub payment_terms: Option<String>,
    #[validate(custom = "validate_currency")]
    pub currency: Option<String>,
    pub updated_by: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateInvoiceItemRequest {
    pub product_id: Option<Uuid>,
    #[validate(length(min = 1, max = 255))]
    pub product_name: Option<String>,
    #[validate(custom = "validate_quantity")]
    pub quantity: Option<Decimal>,
    #[validate(custom = "validate_unit_price")]
    pub unit_price: Option<Decimal>,
    #[validate(custom = "validate_tax_rate")]
    pub tax_rate: Option<Decimal>,
}

/// Settles an invoice in one payment. Without an amount the open balance is used.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MarkPaidRequest {
    #[validate(custom = "validate_payment_amount")]
    pub amount: Option<Decimal>,
    pub payment_date: NaiveDate,
    pub payment_method: PaymentMethod,
    #[validate(length(max = 100))]
    pub reference: Option<String>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
}

/// An invoice with its items and payment ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDetails {
    #[serde(flatten)]
    pub invoice: InvoiceModel,
    pub items: Vec<InvoiceItemModel>,
    pub payments: Vec<InvoicePaymentModel>,
}

enum PaymentRequest {
    Partial(NewPayment),
    Settle(MarkPaidRequest),
}

fn invoice_keys(invoice: &InvoiceModel) -> Vec<String> {
    vec![
        keys::invoice(invoice.id),
        keys::INVOICES_LIST.to_string(),
        keys::invoices_for_customer(invoice.customer_id),
    ]
}

fn item_active_model(invoice_id: Uuid, input: InvoiceItemInput) -> InvoiceItemActiveModel {
    let now = Utc::now();
    let amounts = line_amounts(input.quantity, input.unit_price, input.tax_rate);
    InvoiceItemActiveModel {
        id: Set(Uuid::new_v4()),
        invoice_id: Set(invoice_id),
        product_id: Set(input.product_id),
        product_name: Set(input.product_name),
        quantity: Set(input.quantity),
        unit_price: Set(input.unit_price),
        tax_rate: Set(input.tax_rate),
        subtotal: Set(amounts.subtotal),
        tax_amount: Set(amounts.tax_amount),
        total: Set(amounts.total),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

fn status_event(invoice_id: Uuid, transition: Transition<InvoiceStatus>) -> Option<Event> {
    match transition {
        Transition::Changed { from, to } => Some(Event::InvoiceStatusChanged {
            invoice_id,
            from,
            to,
        }),
        Transition::Unchanged(_) => None,
    }
}

fn initial_status(requested: Option<InvoiceStatus>) -> Result<InvoiceStatus, ServiceError> {
    match requested.unwrap_or(InvoiceStatus::Draft) {
        status @ (InvoiceStatus::Draft | InvoiceStatus::Issued | InvoiceStatus::Sent) => Ok(status),
        other => Err(ServiceError::ValidationError(format!(
            "an invoice cannot be created as {}",
            other
        ))),
    }
}

/// Invoices, their items and payments.
#[derive(Clone)]
pub struct InvoiceService {
    db: Arc<DbPool>,
    store: InvoiceStore,
    references: Arc<dyn ReferenceValidator>,
    side_effects: SideEffects,
    settings: DocumentSettings,
}

impl InvoiceService {
    pub fn new(
        db: Arc<DbPool>,
        references: Arc<dyn ReferenceValidator>,
        side_effects: SideEffects,
        settings: DocumentSettings,
    ) -> Self {
        Self {
            db,
            store: InvoiceStore,
            references,
            side_effects,
            settings,
        }
    }

    async fn lock_invoice<C>(&self, conn: &C, invoice_id: Uuid) -> Result<InvoiceModel, ServiceError>
    where
        C: ConnectionTrait,
    {
        self.store
            .find_by_id_for_update(conn, invoice_id)
            .await
            .during(|| format!("locking invoice {}", invoice_id))?
            .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))
    }

    async fn load_details<C>(
        &self,
        conn: &C,
        invoice: InvoiceModel,
        items: Option<Vec<InvoiceItemModel>>,
    ) -> Result<InvoiceDetails, ServiceError>
    where
        C: ConnectionTrait,
    {
        let invoice_id = invoice.id;
        let items = match items {
            Some(items) => items,
            None => self
                .store
                .find_children(conn, invoice_id)
                .await
                .during(|| format!("loading items of invoice {}", invoice_id))?,
        };
        let payments = self
            .store
            .find_payments(conn, invoice_id)
            .await
            .during(|| format!("loading payments of invoice {}", invoice_id))?;
        Ok(InvoiceDetails {
            invoice,
            items,
            payments,
        })
    }

    /// Recomputes header totals from every stored item and persists them.
    ///
    /// Rejects results that would go negative or fall below what has already
    /// been paid. An invoice whose recorded payments now cover the new total
    /// is settled.
    async fn refresh_totals<C>(
        &self,
        conn: &C,
        invoice: InvoiceModel,
        discount: Decimal,
        updated_by: Option<Uuid>,
    ) -> Result<(InvoiceDetails, Transition<InvoiceStatus>), ServiceError>
    where
        C: ConnectionTrait,
    {
        let invoice_id = invoice.id;
        let items = self
            .store
            .find_children(conn, invoice_id)
            .await
            .during(|| format!("loading items of invoice {}", invoice_id))?;
        let totals = recalculate(&items, discount);

        if totals.total_amount < Decimal::ZERO {
            warn!(%invoice_id, gross = %totals.gross(), %discount, "discount exceeds invoice amount");
            return Err(ServiceError::InvalidState(format!(
                "discount of {} exceeds the invoice amount of {}",
                totals.discount_amount,
                totals.gross()
            )));
        }
        if totals.total_amount < invoice.paid_amount {
            warn!(%invoice_id, total = %totals.total_amount, paid = %invoice.paid_amount, "total would fall below paid amount");
            return Err(ServiceError::InvalidState(format!(
                "invoice total of {} would fall below the {} already paid",
                totals.total_amount, invoice.paid_amount
            )));
        }

        let settles = invoice.paid_amount > Decimal::ZERO
            && invoice.paid_amount == totals.total_amount
            && invoice.status != InvoiceStatus::Paid;
        let status = if settles {
            check_transition(invoice.status, InvoiceStatus::Paid)?
        } else {
            Transition::Unchanged(invoice.status)
        };

        let is_paid = invoice.paid_amount >= totals.total_amount;
        let mut active: InvoiceActiveModel = invoice.into();
        active.subtotal = Set(totals.subtotal);
        active.tax_amount = Set(totals.tax_amount);
        active.discount_amount = Set(totals.discount_amount);
        active.total_amount = Set(totals.total_amount);
        active.is_paid = Set(is_paid);
        if let Transition::Changed { to, .. } = status {
            active.status = Set(to);
            active.paid_date = Set(Some(Utc::now().date_naive()));
        }
        if updated_by.is_some() {
            active.updated_by = Set(updated_by);
        }

        let invoice = self
            .store
            .update(conn, active)
            .await
            .during(|| format!("persisting totals of invoice {}", invoice_id))?;

        let details = self.load_details(conn, invoice, Some(items)).await?;
        Ok((details, status))
    }

    async fn check_product_references<I>(&self, product_ids: I) -> Result<(), ServiceError>
    where
        I: IntoIterator<Item = Option<Uuid>>,
    {
        let products: BTreeSet<Uuid> = product_ids.into_iter().flatten().collect();
        for product_id in products {
            ensure_exists(self.references.as_ref(), ReferenceKind::Product, product_id).await?;
        }
        Ok(())
    }

    async fn after_recalculation(&self, invoice: &InvoiceModel, status: Transition<InvoiceStatus>) {
        let invoice_id = invoice.id;
        let mut events = vec![Event::InvoiceUpdated(invoice_id)];
        events.extend(status_event(invoice_id, status));
        if let (Transition::Changed { to: InvoiceStatus::Paid, .. }, Some(paid_date)) =
            (status, invoice.paid_date)
        {
            events.push(Event::InvoicePaid {
                invoice_id,
                paid_date,
            });
        }
        self.side_effects
            .after_commit(invoice_keys(invoice), events)
            .await;
    }

    /// Creates an invoice and its items in one transaction.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, items = request.items.len()))]
    pub async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<InvoiceDetails, ServiceError> {
        request.validate()?;
        let status = initial_status(request.status)?;

        let gross = recalculate(&request.items, Decimal::ZERO).gross();
        if request.discount_amount > gross {
            return Err(ServiceError::ValidationError(format!(
                "Discount of {} exceeds the invoice amount of {}",
                request.discount_amount, gross
            )));
        }

        ensure_exists(self.references.as_ref(), ReferenceKind::Customer, request.customer_id).await?;
        self.check_product_references(request.items.iter().map(|i| i.product_id))
            .await?;

        let invoice_id = Uuid::new_v4();
        let currency = request
            .currency
            .clone()
            .unwrap_or_else(|| self.settings.default_currency.clone());
        let payment_terms = request
            .payment_terms
            .clone()
            .or_else(|| self.settings.default_payment_terms.clone());

        let created = bounded_transaction(self.settings.transaction_timeout, "creating invoice", async {
            let txn = self.db.begin().await.during(|| "starting invoice transaction")?;

            let invoice_number = match request.invoice_number {
                Some(number) => {
                    let taken = self
                        .store
                        .find_by_number(&txn, &number)
                        .await
                        .during(|| format!("checking invoice number {}", number))?;
                    if taken.is_some() {
                        return Err(ServiceError::ValidationError(format!(
                            "Invoice number {} is already in use",
                            number
                        )));
                    }
                    number
                }
                None => self
                    .store
                    .next_invoice_number(&txn, request.issue_date.year())
                    .await
                    .during(|| "allocating invoice number")?,
            };

            let header = InvoiceActiveModel {
                id: Set(invoice_id),
                invoice_number: Set(invoice_number),
                customer_id: Set(request.customer_id),
                customer_name: Set(request.customer_name),
                issue_date: Set(request.issue_date),
                due_date: Set(request.due_date),
                status: Set(status),
                subtotal: Set(Decimal::ZERO),
                tax_amount: Set(Decimal::ZERO),
                discount_amount: Set(Decimal::ZERO),
                total_amount: Set(Decimal::ZERO),
                notes: Set(request.notes),
                payment_terms: Set(payment_terms),
                currency: Set(currency),
                is_paid: Set(false),
                paid_amount: Set(Decimal::ZERO),
                paid_date: Set(None),
                created_by: Set(request.created_by),
                updated_by: Set(request.created_by),
                ..Default::default()
            };
            let invoice = self
                .store
                .create(&txn, header)
                .await
                .during(|| format!("inserting invoice {}", invoice_id))?;

            let items = request
                .items
                .into_iter()
                .map(|input| item_active_model(invoice_id, input))
                .collect();
            self.store
                .bulk_create_children(&txn, items)
                .await
                .during(|| format!("inserting items of invoice {}", invoice_id))?;

            let (created, _) = self
                .refresh_totals(&txn, invoice, request.discount_amount, None)
                .await?;
            txn.commit().await.during(|| format!("committing invoice {}", invoice_id))?;
            Ok(created)
        })
        .await?;

        info!(
            %invoice_id,
            invoice_number = %created.invoice.invoice_number,
            total_amount = %created.invoice.total_amount,
            "invoice created"
        );
        self.side_effects
            .after_commit(
                invoice_keys(&created.invoice),
                vec![Event::InvoiceCreated {
                    invoice_id,
                    invoice_number: created.invoice.invoice_number.clone(),
                    total_amount: created.invoice.total_amount,
                }],
            )
            .await;

        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_invoice(&self, invoice_id: Uuid) -> Result<InvoiceDetails, ServiceError> {
        let db = &*self.db;
        let invoice = self
            .store
            .find_by_id(db, invoice_id)
            .await
            .during(|| format!("fetching invoice {}", invoice_id))?
            .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
        self.load_details(db, invoice, None).await
    }

    #[instrument(skip(self))]
    pub async fn list_invoices(
        &self,
        filter: InvoiceFilter,
        pagination: Pagination,
    ) -> Result<Page<InvoiceModel>, ServiceError> {
        self.store
            .list(&*self.db, &filter, pagination)
            .await
            .during(|| "listing invoices")
    }

    #[instrument(skip(self))]
    pub async fn list_invoice_payments(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoicePaymentModel>, ServiceError> {
        let db = &*self.db;
        self.store
            .find_by_id(db, invoice_id)
            .await
            .during(|| format!("fetching invoice {}", invoice_id))?
            .ok_or_else(|| ServiceError::not_found("Invoice", invoice_id))?;
        self.store
            .find_payments(db, invoice_id)
            .await
            .during(|| format!("loading payments of invoice {}", invoice_id))
    }

    /// Edits header fields, recalculating totals when the discount changes.
    #[instrument(skip(self, request))]
    pub async fn update_invoice(
        &self,
        invoice_id: Uuid,
        request: UpdateInvoiceRequest,
    ) -> Result<InvoiceDetails, ServiceError> {
        request.validate()?;

        let (details, status) = bounded_transaction(
            self.settings.transaction_timeout,
            "updating invoice",
            async {
                let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
                let invoice = self.lock_invoice(&txn, invoice_id).await?;
                ensure_invoice_editable(invoice.status)?;

                let issue_date = request.issue_date.unwrap_or(invoice.issue_date);
                let due_date = request.due_date.unwrap_or(invoice.due_date);
                check_due_date(issue_date, due_date)
                    .map_err(|_| {
                        ServiceError::ValidationError(format!(
                            "Due date {} cannot be before the issue date {}",
                            due_date, issue_date
                        ))
                    })?;
                let discount = request.discount_amount.unwrap_or(invoice.discount_amount);

                let mut active: InvoiceActiveModel = invoice.into();
                active.issue_date = Set(issue_date);
                active.due_date = Set(due_date);
                if let Some(name) = request.customer_name {
                    active.customer_name = Set(name);
                }
                if let Some(notes) = request.notes {
                    active.notes = Set(Some(notes));
                }
                if let Some(terms) = request.payment_terms {
                    active.payment_terms = Set(Some(terms));
                }
                if let Some(currency) = request.currency {
                    active.currency = Set(currency);
                }
                let invoice = self
                    .store
                    .update(&txn, active)
                    .await
                    .during(|| format!("updating invoice {}", invoice_id))?;

                let updated = self
                    .refresh_totals(&txn, invoice, discount, request.updated_by)
                    .await?;
                txn.commit().await.during(|| format!("committing invoice {}", invoice_id))?;
                Ok(updated)
            },
        )
        .await?;

        info!(%invoice_id, total_amount = %details.invoice.total_amount, "invoice updated");
        self.after_recalculation(&details.invoice, status).await;
        Ok(details)
    }

    /// Moves an invoice along its lifecycle. Payment-driven statuses are only
    /// reachable by recording payments; requesting the current status is a no-op.
    /// `notes` replaces the invoice notes only when the status changes.
    #[instrument(skip(self, notes), fields(invoice_id = %invoice_id, new_status = %new_status))]
    pub async fn update_invoice_status(
        &self,
        invoice_id: Uuid,
        new_status: InvoiceStatus,
        notes: Option<String>,
    ) -> Result<InvoiceModel, ServiceError> {
        check_status_notes(notes.as_deref())?;

        let (invoice, transition) = bounded_transaction(
            self.settings.transaction_timeout,
            "updating invoice status",
            async {
                let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
                let invoice = self.lock_invoice(&txn, invoice_id).await?;

                let transition = check_manual_invoice_transition(invoice.status, new_status)?;
                let Transition::Changed { to, .. } = transition else {
                    return Ok((invoice, transition));
                };
                match to {
                    InvoiceStatus::Cancelled => ensure_cancellable(&invoice)?,
                    InvoiceStatus::Void => ensure_voidable(&invoice)?,
                    _ => {}
                }

                let mut active: InvoiceActiveModel = invoice.into();
                active.status = Set(to);
                if let Some(notes) = notes {
                    active.notes = Set(Some(notes));
                }
                let invoice = self
                    .store
                    .update(&txn, active)
                    .await
                    .during(|| format!("updating status of invoice {}", invoice_id))?;
                txn.commit().await.during(|| format!("committing invoice {}", invoice_id))?;
                Ok((invoice, transition))
            },
        )
        .await?;

        if let Transition::Changed { from, to } = transition {
            info!(%invoice_id, %from, %to, "invoice status updated");
            self.side_effects
                .after_commit(
                    invoice_keys(&invoice),
                    vec![Event::InvoiceStatusChanged {
                        invoice_id,
                        from,
                        to,
                    }],
                )
                .await;
        }
        Ok(invoice)
    }

    pub async fn cancel_invoice(&self, invoice_id: Uuid) -> Result<InvoiceModel, ServiceError> {
        self.update_invoice_status(invoice_id, InvoiceStatus::Cancelled, None)
            .await
    }

    #[instrument(skip(self, input), fields(invoice_id = %invoice_id))]
    pub async fn add_invoice_item(
        &self,
        invoice_id: Uuid,
        input: InvoiceItemInput,
    ) -> Result<InvoiceDetails, ServiceError> {
        input.validate()?;
        ensure_optional_exists(self.references.as_ref(), ReferenceKind::Product, input.product_id)
            .await?;

        let (details, status) = bounded_transaction(self.settings.transaction_timeout, "adding invoice item", async {
            let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
            let invoice = self.lock_invoice(&txn, invoice_id).await?;
            ensure_invoice_editable(invoice.status)?;

            self.store
                .create_child(&txn, item_active_model(invoice_id, input))
                .await
                .during(|| format!("inserting item on invoice {}", invoice_id))?;

            let discount = invoice.discount_amount;
            let updated = self.refresh_totals(&txn, invoice, discount, None).await?;
            txn.commit().await.during(|| format!("committing invoice {}", invoice_id))?;
            Ok(updated)
        })
        .await?;

        info!(%invoice_id, total_amount = %details.invoice.total_amount, "invoice item added");
        self.after_recalculation(&details.invoice, status).await;
        Ok(details)
    }

    #[instrument(skip(self, request), fields(invoice_id = %invoice_id, item_id = %item_id))]
    pub async fn update_invoice_item(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
        request: UpdateInvoiceItemRequest,
    ) -> Result<InvoiceDetails, ServiceError> {
        request.validate()?;
        ensure_optional_exists(self.references.as_ref(), ReferenceKind::Product, request.product_id)
            .await?;

        let (details, status) = bounded_transaction(self.settings.transaction_timeout, "updating invoice item", async {
            let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
            let invoice = self.lock_invoice(&txn, invoice_id).await?;
            ensure_invoice_editable(invoice.status)?;

            let item = self
                .store
                .find_child(&txn, invoice_id, item_id)
                .await
                .during(|| format!("fetching item {} of invoice {}", item_id, invoice_id))?
                .ok_or_else(|| ServiceError::not_found("Invoice item", item_id))?;

            let quantity = request.quantity.unwrap_or(item.quantity);
            let unit_price = request.unit_price.unwrap_or(item.unit_price);
            let tax_rate = request.tax_rate.unwrap_or(item.tax_rate);
            let amounts = line_amounts(quantity, unit_price, tax_rate);

            let mut active: InvoiceItemActiveModel = item.into();
            if let Some(product_id) = request.product_id {
                active.product_id = Set(Some(product_id));
            }
            if let Some(name) = request.product_name {
                active.product_name = Set(name);
            }
            active.quantity = Set(quantity);
            active.unit_price = Set(unit_price);
            active.tax_rate = Set(tax_rate);
            active.subtotal = Set(amounts.subtotal);
            active.tax_amount = Set(amounts.tax_amount);
            active.total = Set(amounts.total);
            self.store
                .update_child(&txn, active)
                .await
                .during(|| format!("updating item {} of invoice {}", item_id, invoice_id))?;

            let discount = invoice.discount_amount;
            let updated = self.refresh_totals(&txn, invoice, discount, None).await?;
            txn.commit().await.during(|| format!("committing invoice {}", invoice_id))?;
            Ok(updated)
        })
        .await?;

        info!(%invoice_id, %item_id, total_amount = %details.invoice.total_amount, "invoice item updated");
        self.after_recalculation(&details.invoice, status).await;
        Ok(details)
    }

    #[instrument(skip(self))]
    pub async fn remove_invoice_item(
        &self,
        invoice_id: Uuid,
        item_id: Uuid,
    ) -> Result<InvoiceDetails, ServiceError> {
        let (details, status) = bounded_transaction(self.settings.transaction_timeout, "removing invoice item", async {
            let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
            let invoice = self.lock_invoice(&txn, invoice_id).await?;
            ensure_invoice_editable(invoice.status)?;

            let removed = self
                .store
                .delete_child(&txn, invoice_id, item_id)
                .await
                .during(|| format!("deleting item {} of invoice {}", item_id, invoice_id))?;
            if removed == 0 {
                return Err(ServiceError::not_found("Invoice item", item_id));
            }

            let discount = invoice.discount_amount;
            let updated = self.refresh_totals(&txn, invoice, discount, None).await?;
            txn.commit().await.during(|| format!("committing invoice {}", invoice_id))?;
            Ok(updated)
        })
        .await?;

        info!(%invoice_id, %item_id, total_amount = %details.invoice.total_amount, "invoice item removed");
        self.after_recalculation(&details.invoice, status).await;
        Ok(details)
    }

    async fn record_payment(
        &self,
        invoice_id: Uuid,
        request: PaymentRequest,
    ) -> Result<AppliedPayment, ServiceError> {
        let settlement = match request {
            PaymentRequest::Partial(_) => Settlement::Partial,
            PaymentRequest::Settle(_) => Settlement::Exact,
        };

        let applied = bounded_transaction(self.settings.transaction_timeout, "recording invoice payment", async {
            let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
            let invoice = self.lock_invoice(&txn, invoice_id).await?;

            let payment = match request {
                PaymentRequest::Partial(payment) => payment,
                PaymentRequest::Settle(request) => {
                    if invoice.is_paid || invoice.status == InvoiceStatus::Paid {
                        return Err(ServiceError::InvalidState(format!(
                            "invoice {} is already paid",
                            invoice.invoice_number
                        )));
                    }
                    let amount = match request.amount {
                        Some(amount) => amount,
                        None => {
                            let paid = self
                                .store
                                .sum_payments(&txn, invoice_id)
                                .await
                                .during(|| format!("summing payments for invoice {}", invoice_id))?;
                            invoice.total_amount - paid
                        }
                    };
                    NewPayment {
                        amount,
                        payment_date: request.payment_date,
                        payment_method: request.payment_method,
                        reference: request.reference,
                        notes: request.notes,
                        created_by: request.created_by,
                    }
                }
            };

            let applied = payment_ledger::apply(&txn, &self.store, invoice, payment, settlement).await?;
            txn.commit().await.during(|| format!("committing payment on invoice {}", invoice_id))?;
            Ok(applied)
        })
        .await?;

        let mut events = vec![Event::InvoicePaymentRecorded {
            invoice_id,
            payment_id: applied.payment.id,
            amount: applied.payment.amount,
            method: applied.payment.payment_method,
            balance_due: applied.outcome.balance_due,
        }];
        events.extend(status_event(invoice_id, applied.outcome.status));
        if applied.outcome.is_paid {
            events.push(Event::InvoicePaid {
                invoice_id,
                paid_date: applied.payment.payment_date,
            });
        }
        self.side_effects
            .after_commit(invoice_keys(&applied.invoice), events)
            .await;

        Ok(applied)
    }

    /// Records a payment of any amount up to the open balance.
    #[instrument(skip(self, payment), fields(invoice_id = %invoice_id, amount = %payment.amount))]
    pub async fn add_invoice_payment(
        &self,
        invoice_id: Uuid,
        payment: NewPayment,
    ) -> Result<AppliedPayment, ServiceError> {
        payment.validate()?;
        self.record_payment(invoice_id, PaymentRequest::Partial(payment))
            .await
    }

    /// Settles the whole open balance with one payment.
    #[instrument(skip(self, request), fields(invoice_id = %invoice_id))]
    pub async fn mark_invoice_as_paid(
        &self,
        invoice_id: Uuid,
        request: MarkPaidRequest,
    ) -> Result<AppliedPayment, ServiceError> {
        request.validate()?;
        self.record_payment(invoice_id, PaymentRequest::Settle(request))
            .await
    }

    /// Moves unpaid invoices due before `as_of` to overdue, one transaction each.
    /// Returns the ids that changed.
    #[instrument(skip(self))]
    pub async fn mark_overdue_invoices(&self, as_of: NaiveDate) -> Result<Vec<Uuid>, ServiceError> {
        let candidates = self
            .store
            .find_overdue_candidates(&*self.db, as_of)
            .await
            .during(|| "finding overdue invoices")?;

        let mut marked = Vec::with_capacity(candidates.len());
        for invoice_id in candidates {
            match self.mark_one_overdue(invoice_id, as_of).await {
                Ok(Some((invoice, from))) => {
                    self.side_effects
                        .after_commit(
                            invoice_keys(&invoice),
                            vec![Event::InvoiceStatusChanged {
                                invoice_id,
                                from,
                                to: InvoiceStatus::Overdue,
                            }],
                        )
                        .await;
                    marked.push(invoice_id);
                }
                Ok(None) => {}
                Err(e) => warn!(%invoice_id, error = %e, "could not mark invoice overdue"),
            }
        }

        info!(count = marked.len(), %as_of, "overdue invoices marked");
        Ok(marked)
    }

    async fn mark_one_overdue(
        &self,
        invoice_id: Uuid,
        as_of: NaiveDate,
    ) -> Result<Option<(InvoiceModel, InvoiceStatus)>, ServiceError> {
        bounded_transaction(self.settings.transaction_timeout, "marking invoice overdue", async {
            let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
            let invoice = self.lock_invoice(&txn, invoice_id).await?;

            let still_due = !invoice.is_paid
                && invoice.due_date < as_of
                && matches!(
                    invoice.status,
                    InvoiceStatus::Issued | InvoiceStatus::Sent | InvoiceStatus::PartiallyPaid
                );
            if !still_due {
                return Ok(None);
            }
            let Transition::Changed { from, to } = check_transition(invoice.status, InvoiceStatus::Overdue)?
            else {
                return Ok(None);
            };

            let mut active: InvoiceActiveModel = invoice.into();
            active.status = Set(to);
            let invoice = self
                .store
                .update(&txn, active)
                .await
                .during(|| format!("marking invoice {} overdue", invoice_id))?;
            txn.commit().await.during(|| format!("committing invoice {}", invoice_id))?;
            Ok(Some((invoice, from)))
        })
        .await
    }

    /// Permanently removes a draft invoice. Issued invoices are cancelled or voided instead.
    #[instrument(skip(self))]
    pub async fn delete_invoice(&self, invoice_id: Uuid) -> Result<(), ServiceError> {
        let invoice = bounded_transaction(self.settings.transaction_timeout, "deleting invoice", async {
            let txn = self.db.begin().await.during(|| "starting invoice transaction")?;
            let invoice = self.lock_invoice(&txn, invoice_id).await?;
            if invoice.status != InvoiceStatus::Draft {
                warn!(%invoice_id, status = %invoice.status, "refusing to delete issued invoice");
                return Err(ServiceError::InvalidState(format!(
                    "only draft invoices can be deleted; invoice {} is {}",
                    invoice.invoice_number, invoice.status
                )));
            }

            let deleted = self
                .store
                .hard_delete(&txn, invoice_id)
                .await
                .during(|| format!("deleting invoice {}", invoice_id))?;
            if deleted == 0 {
                return Err(ServiceError::InvalidState(format!(
                    "invoice {} could not be deleted",
                    invoice.invoice_number
                )));
            }
            txn.commit().await.during(|| format!("committing deletion of invoice {}", invoice_id))?;
            Ok(invoice)
        })
        .await?;

        info!(%invoice_id, invoice_number = %invoice.invoice_number, "invoice deleted");
        self.side_effects
            .after_commit(invoice_keys(&invoice), vec![Event::InvoiceDeleted(invoice_id)])
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn item(quantity: Decimal, unit_price: Decimal, tax_rate: Decimal) -> InvoiceItemInput {
        InvoiceItemInput {
            product_id: None,
            product_name: "13kg LPG refill".to_string(),
            quantity,
            unit_price,
            tax_rate,
        }
    }

    fn request() -> CreateInvoiceRequest {
        CreateInvoiceRequest {
            invoice_number: None,
            customer_id: Uuid::new_v4(),
            customer_name: "Harbour Bakery".to_string(),
            issue_date: date(2024, 5, 1),
            due_date: date(2024, 5, 31),
            status: None,
            discount_amount: Decimal::ZERO,
            notes: None,
            payment_terms: None,
            currency: Some("KES".to_string()),
            created_by: None,
            items: vec![item(dec!(2), dec!(10), dec!(16))],
        }
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn due_date_before_issue_date_is_rejected() {
        let mut req = request();
        req.due_date = date(2024, 4, 30);
        assert!(req.validate().is_err());
    }

    #[test]
    fn currency_must_be_iso_code() {
        let mut req = request();
        req.currency = Some("kes".to_string());
        assert!(req.validate().is_err());
    }

    #[test]
    fn nested_items_are_validated() {
        let mut req = request();
        req.items.push(item(dec!(1), dec!(5), dec!(120)));
        assert!(req.validate().is_err());
    }

    #[test]
    fn only_pre_payment_statuses_are_valid_at_creation() {
        assert_eq!(initial_status(None).unwrap(), InvoiceStatus::Draft);
        assert_eq!(
            initial_status(Some(InvoiceStatus::Sent)).unwrap(),
            InvoiceStatus::Sent
        );
        assert_matches!(
            initial_status(Some(InvoiceStatus::Paid)),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn item_rows_carry_line_amounts() {
        let row = item_active_model(Uuid::new_v4(), item(dec!(1.5), dec!(4.00), dec!(10)));
        assert_eq!(row.subtotal, Set(dec!(6.00)));
        assert_eq!(row.tax_amount, Set(dec!(0.60)));
        assert_eq!(row.total, Set(dec!(6.60)));
    }

    #[test]
    fn mark_paid_amount_is_optional_but_positive() {
        let mut req = MarkPaidRequest {
            amount: None,
            payment_date: date(2024, 5, 10),
            payment_method: PaymentMethod::MobileMoney,
            reference: None,
            notes: None,
            created_by: None,
        };
        assert!(req.validate().is_ok());
        req.amount = Some(dec!(-1));
        assert!(req.validate().is_err());
    }
}
