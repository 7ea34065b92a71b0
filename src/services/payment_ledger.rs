//! Invoice payment ledger.
//!
//! The paid amount is always re-summed from the stored payment rows inside the
//! caller's transaction, with the invoice row already locked, so concurrent
//! payments against one invoice cannot overshoot its total.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::entities::{invoice, invoice_payment, InvoiceStatus, PaymentMethod};
use crate::errors::{ResultExt, ServiceError};
use crate::repositories::InvoiceStore;
use crate::services::status_machine::{check_transition, DocumentStatus, Transition};
use crate::services::totals::round_money;

/// How a payment must relate to the open balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Any amount up to the open balance.
    Partial,
    /// Exactly the open balance, settling the invoice.
    Exact,
}

/// A payment to record against an invoice.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewPayment {
    #[validate(custom = "validate_payment_amount")]
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub payment_method: PaymentMethod,
    #[validate(length(max = 100, message = "Reference must be at most 100 characters"))]
    pub reference: Option<String>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
}

pub(crate) fn validate_payment_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if *amount <= Decimal::ZERO {
        let mut err = ValidationError::new("amount");
        err.message = Some("Payment amount must be greater than zero".into());
        return Err(err);
    }
    if round_money(*amount) != *amount {
        let mut err = ValidationError::new("amount");
        err.message = Some("Payment amount must have at most two decimal places".into());
        return Err(err);
    }
    Ok(())
}

/// Ledger position after a payment is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub paid_amount: Decimal,
    pub balance_due: Decimal,
    pub is_paid: bool,
    pub status: Transition<InvoiceStatus>,
}

/// Decides whether `amount` may be applied to an invoice, without touching storage.
pub fn evaluate(
    invoice_id: Uuid,
    status: InvoiceStatus,
    total_amount: Decimal,
    already_paid: Decimal,
    amount: Decimal,
    settlement: Settlement,
) -> Result<LedgerOutcome, ServiceError> {
    match status {
        InvoiceStatus::Cancelled | InvoiceStatus::Void => {
            return Err(ServiceError::InvalidState(format!(
                "cannot record a payment on a {} invoice",
                status
            )))
        }
        InvoiceStatus::Draft => {
            return Err(ServiceError::InvalidState(
                "invoice must be issued before payments are recorded".to_string(),
            ))
        }
        _ => {}
    }

    if amount <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "Payment amount must be greater than zero".to_string(),
        ));
    }

    let remaining = total_amount - already_paid;
    if amount > remaining {
        return Err(ServiceError::AmountExceedsBalance {
            invoice_id,
            amount,
            remaining,
        });
    }
    if settlement == Settlement::Exact && amount < remaining {
        return Err(ServiceError::ValidationError(format!(
            "Payment of {} does not settle the outstanding balance of {}",
            amount, remaining
        )));
    }

    let paid_amount = already_paid + amount;
    let is_paid = paid_amount >= total_amount;
    let status = if is_paid {
        check_transition(status, InvoiceStatus::Paid)?
    } else if status == InvoiceStatus::PartiallyPaid
        || status.can_transition_to(InvoiceStatus::PartiallyPaid)
    {
        check_transition(status, InvoiceStatus::PartiallyPaid)?
    } else {
        Transition::Unchanged(status)
    };

    Ok(LedgerOutcome {
        paid_amount,
        balance_due: total_amount - paid_amount,
        is_paid,
        status,
    })
}

/// A fully paid invoice is closed and cannot be cancelled. An invoice whose
/// total is zero and which never received money counts as unpaid here.
pub fn ensure_cancellable(invoice: &invoice::Model) -> Result<(), ServiceError> {
    let settled = invoice.is_paid && invoice.paid_amount > Decimal::ZERO;
    if invoice.status == InvoiceStatus::Paid || settled {
        return Err(ServiceError::InvalidState(format!(
            "invoice {} is paid and cannot be cancelled",
            invoice.invoice_number
        )));
    }
    Ok(())
}

/// Voiding is reserved for invoices that never received money.
pub fn ensure_voidable(invoice: &invoice::Model) -> Result<(), ServiceError> {
    if invoice.paid_amount > Decimal::ZERO {
        return Err(ServiceError::InvalidState(format!(
            "invoice {} has recorded payments and cannot be voided",
            invoice.invoice_number
        )));
    }
    Ok(())
}

/// Result of a recorded payment.
#[derive(Debug, Clone)]
pub struct AppliedPayment {
    pub invoice: invoice::Model,
    pub payment: invoice_payment::Model,
    pub outcome: LedgerOutcome,
}

/// Records `payment` against `invoice` on `conn`, which must be the
/// transaction that locked the invoice row.
pub async fn apply<C>(
    conn: &C,
    store: &InvoiceStore,
    invoice: invoice::Model,
    payment: NewPayment,
    settlement: Settlement,
) -> Result<AppliedPayment, ServiceError>
where
    C: ConnectionTrait,
{
    let invoice_id = invoice.id;
    let already_paid = store
        .sum_payments(conn, invoice_id)
        .await
        .during(|| format!("summing payments for invoice {}", invoice_id))?;

    let outcome = evaluate(
        invoice_id,
        invoice.status,
        invoice.total_amount,
        already_paid,
        payment.amount,
        settlement,
    )
    .map_err(|e| {
        warn!(%invoice_id, amount = %payment.amount, error = %e, "payment rejected");
        e
    })?;

    let payment_date = payment.payment_date;
    let created_by = payment.created_by;
    let recorded = store
        .create_payment(
            conn,
            invoice_payment::ActiveModel {
                id: Set(Uuid::new_v4()),
                invoice_id: Set(invoice_id),
                amount: Set(payment.amount),
                payment_date: Set(payment_date),
                payment_method: Set(payment.payment_method),
                reference: Set(payment.reference),
                notes: Set(payment.notes),
                created_by: Set(created_by),
                ..Default::default()
            },
        )
        .await
        .during(|| format!("inserting payment for invoice {}", invoice_id))?;

    let mut active: invoice::ActiveModel = invoice.into();
    active.paid_amount = Set(outcome.paid_amount);
    active.is_paid = Set(outcome.is_paid);
    if outcome.is_paid {
        active.paid_date = Set(Some(payment_date));
    }
    if let Transition::Changed { to, .. } = outcome.status {
        active.status = Set(to);
    }
    if created_by.is_some() {
        active.updated_by = Set(created_by);
    }
    let updated = active
        .update(conn)
        .await
        .during(|| format!("updating ledger totals of invoice {}", invoice_id))?;

    info!(
        %invoice_id,
        payment_id = %recorded.id,
        amount = %recorded.amount,
        paid_amount = %outcome.paid_amount,
        balance_due = %outcome.balance_due,
        "payment recorded"
    );

    Ok(AppliedPayment {
        invoice: updated,
        payment: recorded,
        outcome,
    })
}
