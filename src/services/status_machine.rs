use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::entities::{InvoiceStatus, OrderStatus};
use crate::errors::ServiceError;

/// A closed document status with a static transition table.
pub trait DocumentStatus: Copy + Eq + Hash + Display + Send + Sync + 'static {
    /// Entity name used in transition errors.
    const ENTITY: &'static str;

    fn transitions() -> &'static HashMap<Self, &'static [Self]>;

    fn allowed_targets(self) -> &'static [Self] {
        Self::transitions().get(&self).copied().unwrap_or(&[])
    }

    fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    fn can_transition_to(self, next: Self) -> bool {
        self.allowed_targets().contains(&next)
    }
}

static ORDER_TRANSITIONS: Lazy<HashMap<OrderStatus, &'static [OrderStatus]>> = Lazy::new(|| {
    use OrderStatus::*;
    let table: [(OrderStatus, &'static [OrderStatus]); 4] = [
        (Pending, &[Processing, Completed, Cancelled]),
        (Processing, &[Completed, Cancelled]),
        (Completed, &[]),
        (Cancelled, &[]),
    ];
    HashMap::from(table)
});

static INVOICE_TRANSITIONS: Lazy<HashMap<InvoiceStatus, &'static [InvoiceStatus]>> =
    Lazy::new(|| {
        use InvoiceStatus::*;
        let table: [(InvoiceStatus, &'static [InvoiceStatus]); 8] = [
            (Draft, &[Issued, Sent, Cancelled]),
            (Issued, &[Sent, PartiallyPaid, Paid, Overdue, Cancelled, Void]),
            (Sent, &[PartiallyPaid, Paid, Overdue, Cancelled]),
            (PartiallyPaid, &[Paid, Overdue, Cancelled]),
            (Overdue, &[PartiallyPaid, Paid, Cancelled, Void]),
            (Paid, &[]),
            (Cancelled, &[]),
            (Void, &[]),
        ];
        HashMap::from(table)
    });

impl DocumentStatus for OrderStatus {
    const ENTITY: &'static str = "order";

    fn transitions() -> &'static HashMap<Self, &'static [Self]> {
        &ORDER_TRANSITIONS
    }
}

impl DocumentStatus for InvoiceStatus {
    const ENTITY: &'static str = "invoice";

    fn transitions() -> &'static HashMap<Self, &'static [Self]> {
        &INVOICE_TRANSITIONS
    }
}

/// Outcome of a status request that passed the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Requested status equals the current one; nothing is written.
    Unchanged(S),
    Changed { from: S, to: S },
}

impl<S: DocumentStatus> Transition<S> {
    pub fn target(&self) -> S {
        match *self {
            Transition::Unchanged(s) => s,
            Transition::Changed { to, .. } => to,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

fn rejected<S: DocumentStatus>(from: S, to: S) -> ServiceError {
    warn!(entity = S::ENTITY, %from, %to, "rejected status transition");
    ServiceError::InvalidTransition {
        entity: S::ENTITY,
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Validates `current -> requested` against the transition table.
pub fn check_transition<S: DocumentStatus>(
    current: S,
    requested: S,
) -> Result<Transition<S>, ServiceError> {
    if current == requested {
        return Ok(Transition::Unchanged(current));
    }
    if current.can_transition_to(requested) {
        Ok(Transition::Changed {
            from: current,
            to: requested,
        })
    } else {
        Err(rejected(current, requested))
    }
}

/// Status change requested directly by a caller rather than by the payment ledger.
/// Payment-driven states are only reachable by recording payments.
pub fn check_manual_invoice_transition(
    current: InvoiceStatus,
    requested: InvoiceStatus,
) -> Result<Transition<InvoiceStatus>, ServiceError> {
    let transition = check_transition(current, requested)?;
    match transition {
        Transition::Changed { from, to }
            if matches!(to, InvoiceStatus::Paid | InvoiceStatus::PartiallyPaid) =>
        {
            Err(rejected(from, to))
        }
        other => Ok(other),
    }
}

pub fn ensure_order_header_editable(status: OrderStatus) -> Result<(), ServiceError> {
    if status.is_terminal() {
        return Err(ServiceError::InvalidState(format!(
            "order is {} and can no longer be edited",
            status
        )));
    }
    Ok(())
}

/// Details may be added or changed while the order is pending or processing.
pub fn ensure_order_details_editable(status: OrderStatus) -> Result<(), ServiceError> {
    match status {
        OrderStatus::Pending | OrderStatus::Processing => Ok(()),
        other => Err(ServiceError::InvalidState(format!(
            "cannot modify details of a {} order",
            other
        ))),
    }
}

/// Details may only be removed before processing starts.
pub fn ensure_order_detail_removable(status: OrderStatus) -> Result<(), ServiceError> {
    match status {
        OrderStatus::Pending => Ok(()),
        other => Err(ServiceError::InvalidState(format!(
            "cannot remove details from a {} order",
            other
        ))),
    }
}

/// Items and header amounts are frozen once an invoice is settled or closed.
pub fn ensure_invoice_editable(status: InvoiceStatus) -> Result<(), ServiceError> {
    match status {
        InvoiceStatus::Paid | InvoiceStatus::Cancelled | InvoiceStatus::Void => {
            Err(ServiceError::InvalidState(format!(
                "cannot modify a {} invoice",
                status
            )))
        }
        _ => Ok(()),
    }
}
