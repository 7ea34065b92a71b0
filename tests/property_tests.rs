//! Randomised edit sequences against a SQLite-backed service: stored totals
//! always equal a from-scratch recomputation of the stored lines.

mod common;

use common::{item, TestContext};
use gasdesk_api::services::{
    invoicing::UpdateInvoiceItemRequest,
    orders::UpdateOrderDetailRequest,
    totals::{line_amounts, recalculate},
};
use proptest::prelude::*;
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
enum Edit {
    Add { quantity: u32, quarters: u32, tax_quarters: u32 },
    Update { slot: usize, quantity: u32 },
    Remove { slot: usize },
}

// Prices and rates in quarter steps stay exact when SQLite stores them as reals.
fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        3 => (1u32..20, 0u32..400, 0u32..=4).prop_map(|(quantity, quarters, tax_quarters)| Edit::Add {
            quantity,
            quarters,
            tax_quarters,
        }),
        2 => (0usize..8, 1u32..20).prop_map(|(slot, quantity)| Edit::Update { slot, quantity }),
        1 => (0usize..8).prop_map(|slot| Edit::Remove { slot }),
    ]
}

fn price(quarters: u32) -> Decimal {
    Decimal::new(i64::from(quarters) * 25, 2)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn order_total_converges(edits in prop::collection::vec(edit(), 1..15)) {
        runtime().block_on(async {
            let ctx = TestContext::new().await;
            let orders = &ctx.services.orders;
            let order_id = orders
                .create_order(ctx.order_request(Vec::new()))
                .await
                .unwrap()
                .order
                .id;

            for edit in edits {
                let current = orders.get_order(order_id).await.unwrap();
                match edit {
                    Edit::Add { quantity, quarters, .. } => {
                        orders
                            .add_order_detail(order_id, ctx.detail(quantity as i32, price(quarters)))
                            .await
                            .unwrap();
                    }
                    Edit::Update { slot, quantity } if !current.details.is_empty() => {
                        let detail = &current.details[slot % current.details.len()];
                        orders
                            .update_order_detail(
                                order_id,
                                detail.id,
                                UpdateOrderDetailRequest {
                                    quantity: Some(quantity as i32),
                                    ..Default::default()
                                },
                            )
                            .await
                            .unwrap();
                    }
                    Edit::Remove { slot } if !current.details.is_empty() => {
                        let detail = &current.details[slot % current.details.len()];
                        orders.remove_order_detail(order_id, detail.id).await.unwrap();
                    }
                    _ => continue,
                }

                let stored = orders.get_order(order_id).await.unwrap();
                let expected: Decimal = stored
                    .details
                    .iter()
                    .map(|d| Decimal::from(d.quantity) * d.unit_price)
                    .sum();
                assert_eq!(stored.order.total_amount, expected);
                for detail in &stored.details {
                    assert_eq!(detail.subtotal, Decimal::from(detail.quantity) * detail.unit_price);
                }
            }
        });
    }

    #[test]
    fn invoice_totals_converge(edits in prop::collection::vec(edit(), 1..15)) {
        runtime().block_on(async {
            let ctx = TestContext::new().await;
            let invoices = &ctx.services.invoices;
            let invoice_id = invoices
                .create_invoice(ctx.invoice_request(Vec::new()))
                .await
                .unwrap()
                .invoice
                .id;

            for edit in edits {
                let current = invoices.get_invoice(invoice_id).await.unwrap();
                match edit {
                    Edit::Add { quantity, quarters, tax_quarters } => {
                        let rate = Decimal::from(tax_quarters * 25);
                        invoices
                            .add_invoice_item(
                                invoice_id,
                                item(Decimal::from(quantity), price(quarters), rate),
                            )
                            .await
                            .unwrap();
                    }
                    Edit::Update { slot, quantity } if !current.items.is_empty() => {
                        let line = &current.items[slot % current.items.len()];
                        invoices
                            .update_invoice_item(
                                invoice_id,
                                line.id,
                                UpdateInvoiceItemRequest {
                                    quantity: Some(Decimal::from(quantity)),
                                    ..Default::default()
                                },
                            )
                            .await
                            .unwrap();
                    }
                    Edit::Remove { slot } if !current.items.is_empty() => {
                        let line = &current.items[slot % current.items.len()];
                        invoices.remove_invoice_item(invoice_id, line.id).await.unwrap();
                    }
                    _ => continue,
                }

                let stored = invoices.get_invoice(invoice_id).await.unwrap();
                let expected = recalculate(&stored.items, stored.invoice.discount_amount);
                assert_eq!(stored.invoice.subtotal, expected.subtotal);
                assert_eq!(stored.invoice.tax_amount, expected.tax_amount);
                assert_eq!(stored.invoice.total_amount, expected.total_amount);
                for line in &stored.items {
                    let amounts = line_amounts(line.quantity, line.unit_price, line.tax_rate);
                    assert_eq!(line.total, amounts.total);
                }
            }
        });
    }
}
