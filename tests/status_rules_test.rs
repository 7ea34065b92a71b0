//! Lifecycle enforcement against stored documents: rejected transitions leave
//! the stored state untouched, and same-status requests write nothing.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{item, payment, TestContext};
use gasdesk_api::{
    entities::{InvoiceStatus, OrderStatus},
    errors::ServiceError,
    services::{invoicing::UpdateInvoiceItemRequest, status_machine::DocumentStatus},
};
use rust_decimal_macros::dec;
use sea_orm::Iterable;
use uuid::Uuid;

async fn order_in(ctx: &TestContext, status: OrderStatus) -> Uuid {
    let orders = &ctx.services.orders;
    let id = orders
        .create_order(ctx.order_request(vec![ctx.detail(1, dec!(10))]))
        .await
        .unwrap()
        .order
        .id;
    if status != OrderStatus::Pending {
        orders.update_order_status(id, status, None).await.unwrap();
    }
    id
}

#[tokio::test]
async fn completed_order_cannot_return_to_processing() {
    let ctx = TestContext::new().await;
    let id = order_in(&ctx, OrderStatus::Completed).await;

    assert_matches!(
        ctx.services.orders.update_order_status(id, OrderStatus::Processing, None).await,
        Err(ServiceError::InvalidTransition { entity: "order", from, to })
            if from == "completed" && to == "processing"
    );
    let stored = ctx.services.orders.get_order(id).await.unwrap();
    assert_eq!(stored.order.order_status, OrderStatus::Completed);
}

#[tokio::test]
async fn every_unlisted_order_transition_is_rejected_without_writing() {
    let ctx = TestContext::new().await;
    for from in OrderStatus::iter() {
        for to in OrderStatus::iter() {
            if from == to || from.can_transition_to(to) {
                continue;
            }
            let id = order_in(&ctx, from).await;
            let before = ctx.services.orders.get_order(id).await.unwrap().order;

            assert_matches!(
                ctx.services.orders.update_order_status(id, to, None).await,
                Err(ServiceError::InvalidTransition { .. }),
                "{from} -> {to} should be rejected"
            );
            let after = ctx.services.orders.get_order(id).await.unwrap().order;
            assert_eq!(before, after);
        }
    }
}

#[tokio::test]
async fn same_status_request_is_a_silent_no_op() {
    let ctx = TestContext::new().await;
    let id = order_in(&ctx, OrderStatus::Processing).await;
    let before = ctx.services.orders.get_order(id).await.unwrap().order;
    ctx.cache.clear();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let result = ctx
        .services
        .orders
        .update_order_status(id, OrderStatus::Processing, None)
        .await
        .unwrap();

    assert_eq!(result, before);
    let after = ctx.services.orders.get_order(id).await.unwrap().order;
    assert_eq!(after.updated_at, before.updated_at);
    assert!(ctx.cache.keys().is_empty());
}

#[tokio::test]
async fn same_invoice_status_is_a_no_op() {
    let ctx = TestContext::new().await;
    let invoices = &ctx.services.invoices;
    let id = invoices
        .create_invoice(ctx.invoice_request(vec![item(dec!(1), dec!(10), dec!(0))]))
        .await
        .unwrap()
        .invoice
        .id;
    let before = invoices.get_invoice(id).await.unwrap().invoice;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let result = invoices
        .update_invoice_status(id, InvoiceStatus::Issued, None)
        .await
        .unwrap();
    assert_eq!(result.updated_at, before.updated_at);
}

#[tokio::test]
async fn payment_statuses_cannot_be_set_directly() {
    let ctx = TestContext::new().await;
    let invoices = &ctx.services.invoices;
    let id = invoices
        .create_invoice(ctx.invoice_request(vec![item(dec!(1), dec!(10), dec!(0))]))
        .await
        .unwrap()
        .invoice
        .id;

    for status in [InvoiceStatus::Paid, InvoiceStatus::PartiallyPaid] {
        assert_matches!(
            invoices.update_invoice_status(id, status, None).await,
            Err(ServiceError::InvalidTransition { .. })
        );
    }
    let stored = invoices.get_invoice(id).await.unwrap().invoice;
    assert_eq!(stored.status, InvoiceStatus::Issued);
    assert!(!stored.is_paid);
}

#[tokio::test]
async fn cancelled_invoice_is_terminal() {
    let ctx = TestContext::new().await;
    let invoices = &ctx.services.invoices;
    let id = invoices
        .create_invoice(ctx.invoice_request(vec![item(dec!(1), dec!(10), dec!(0))]))
        .await
        .unwrap()
        .invoice
        .id;
    invoices.cancel_invoice(id).await.unwrap();

    for status in [InvoiceStatus::Issued, InvoiceStatus::Sent, InvoiceStatus::Overdue] {
        assert_matches!(
            invoices.update_invoice_status(id, status, None).await,
            Err(ServiceError::InvalidTransition { .. })
        );
    }
    assert_eq!(
        invoices.get_invoice(id).await.unwrap().invoice.status,
        InvoiceStatus::Cancelled
    );
}

#[tokio::test]
async fn items_of_a_paid_invoice_are_frozen() {
    let ctx = TestContext::new().await;
    let invoices = &ctx.services.invoices;
    let created = invoices
        .create_invoice(ctx.invoice_request(vec![item(dec!(1), dec!(10), dec!(0))]))
        .await
        .unwrap();
    let id = created.invoice.id;
    invoices.add_invoice_payment(id, payment(dec!(10))).await.unwrap();

    assert_matches!(
        invoices
            .add_invoice_item(id, item(dec!(1), dec!(5), dec!(0)))
            .await,
        Err(ServiceError::InvalidState(_))
    );
    assert_matches!(
        invoices
            .update_invoice_item(
                id,
                created.items[0].id,
                UpdateInvoiceItemRequest {
                    quantity: Some(dec!(3)),
                    ..Default::default()
                },
            )
            .await,
        Err(ServiceError::InvalidState(_))
    );
    assert_matches!(
        invoices.remove_invoice_item(id, created.items[0].id).await,
        Err(ServiceError::InvalidState(_))
    );

    let stored = invoices.get_invoice(id).await.unwrap();
    assert_eq!(stored.items.len(), 1);
    assert_eq!(stored.invoice.total_amount, dec!(10));
}

async fn invoice_in(ctx: &TestContext, status: InvoiceStatus) -> Uuid {
    let invoices = &ctx.services.invoices;
    let mut request = ctx.invoice_request(vec![item(dec!(1), dec!(10), dec!(0))]);
    request.status = match status {
        InvoiceStatus::Draft => None,
        InvoiceStatus::Sent => Some(InvoiceStatus::Sent),
        _ => Some(InvoiceStatus::Issued),
    };
    let id = invoices.create_invoice(request).await.unwrap().invoice.id;

    match status {
        InvoiceStatus::Draft | InvoiceStatus::Issued | InvoiceStatus::Sent => {}
        InvoiceStatus::PartiallyPaid => {
            invoices.add_invoice_payment(id, payment(dec!(4))).await.unwrap();
        }
        InvoiceStatus::Paid => {
            invoices.add_invoice_payment(id, payment(dec!(10))).await.unwrap();
        }
        InvoiceStatus::Overdue | InvoiceStatus::Cancelled | InvoiceStatus::Void => {
            invoices.update_invoice_status(id, status, None).await.unwrap();
        }
    }
    assert_eq!(invoices.get_invoice(id).await.unwrap().invoice.status, status);
    id
}

#[tokio::test]
async fn every_unlisted_invoice_transition_is_rejected_without_writing() {
    let ctx = TestContext::new().await;
    let invoices = &ctx.services.invoices;
    for from in InvoiceStatus::iter() {
        for to in InvoiceStatus::iter() {
            if from == to || from.can_transition_to(to) {
                continue;
            }
            let id = invoice_in(&ctx, from).await;
            let before = invoices.get_invoice(id).await.unwrap();

            assert_matches!(
                invoices.update_invoice_status(id, to, None).await,
                Err(ServiceError::InvalidTransition { entity: "invoice", .. }),
                "{from} -> {to} should be rejected"
            );
            let after = invoices.get_invoice(id).await.unwrap();
            assert_eq!(before, after);
        }
    }
}

#[tokio::test]
async fn sent_invoice_cannot_be_voided() {
    let ctx = TestContext::new().await;
    let id = invoice_in(&ctx, InvoiceStatus::Sent).await;

    assert_matches!(
        ctx.services
            .invoices
            .update_invoice_status(id, InvoiceStatus::Void, None)
            .await,
        Err(ServiceError::InvalidTransition { from, to, .. }) if from == "sent" && to == "void"
    );
}

#[tokio::test]
async fn status_notes_are_written_only_when_the_status_changes() {
    let ctx = TestContext::new().await;
    let orders = &ctx.services.orders;
    let order_id = order_in(&ctx, OrderStatus::Pending).await;

    let moved = orders
        .update_order_status(
            order_id,
            OrderStatus::Processing,
            Some("Driver 7 assigned".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(moved.notes.as_deref(), Some("Driver 7 assigned"));
    let before = orders.get_order(order_id).await.unwrap().order;

    tokio::time::sleep(Duration::from_millis(20)).await;
    orders
        .update_order_status(order_id, OrderStatus::Processing, Some("ignored".to_string()))
        .await
        .unwrap();
    assert_matches!(
        orders
            .update_order_status(order_id, OrderStatus::Pending, Some("rejected".to_string()))
            .await,
        Err(ServiceError::InvalidTransition { .. })
    );
    assert_eq!(orders.get_order(order_id).await.unwrap().order, before);

    let invoices = &ctx.services.invoices;
    let invoice_id = invoice_in(&ctx, InvoiceStatus::Issued).await;
    let sent = invoices
        .update_invoice_status(
            invoice_id,
            InvoiceStatus::Sent,
            Some("Emailed to accounts".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(sent.notes.as_deref(), Some("Emailed to accounts"));

    assert_matches!(
        invoices
            .update_invoice_status(invoice_id, InvoiceStatus::Overdue, Some("x".repeat(2001)))
            .await,
        Err(ServiceError::ValidationError(_))
    );
    let stored = invoices.get_invoice(invoice_id).await.unwrap().invoice;
    assert_eq!(stored.status, InvoiceStatus::Sent);
    assert_eq!(stored.notes.as_deref(), Some("Emailed to accounts"));
}
