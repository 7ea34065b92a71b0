use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ConnectionTrait, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    cache::keys,
    db::{bounded_transaction, DbPool},
    entities::{
        order::{ActiveModel as OrderActiveModel, Model as OrderModel},
        order_detail::{ActiveModel as OrderDetailActiveModel, Model as OrderDetailModel},
        CylinderCondition, DeliveryMethod, OrderPaymentStatus, OrderStatus, TransactionType,
    },
    errors::{ResultExt, ServiceError},
    events::Event,
    repositories::{DocumentStore, OrderFilter, OrderStore, Page, Pagination},
    services::{
        references::{ensure_exists, ensure_optional_exists, ReferenceKind, ReferenceValidator},
        status_machine::{
            check_transition, ensure_order_detail_removable, ensure_order_details_editable,
            ensure_order_header_editable, Transition,
        },
        totals::{line_amounts, recalculate, validate_unit_price, LineItem},
        check_status_notes, DocumentSettings, SideEffects,
    },
};

/// One cylinder line on a new or existing order.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OrderDetailInput {
    pub cylinder_category_id: Uuid,
    pub transaction_type: TransactionType,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    #[validate(custom = "validate_unit_price")]
    pub unit_price: Decimal,
    #[serde(default = "default_cylinder_condition")]
    pub cylinder_condition: CylinderCondition,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

fn default_cylinder_condition() -> CylinderCondition {
    CylinderCondition::NotApplicable
}

impl LineItem for OrderDetailInput {
    fn quantity(&self) -> Decimal {
        Decimal::from(self.quantity)
    }

    fn unit_price(&self) -> Decimal {
        self.unit_price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub delivery_method: DeliveryMethod,
    pub delivery_address_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    #[serde(default)]
    pub payment_status: Option<OrderPaymentStatus>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
    #[validate]
    #[serde(default)]
    pub details: Vec<OrderDetailInput>,
}

/// Header edits; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateOrderRequest {
    pub delivery_method: Option<DeliveryMethod>,
    pub delivery_address_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub payment_status: Option<OrderPaymentStatus>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateOrderDetailRequest {
    pub cylinder_category_id: Option<Uuid>,
    pub transaction_type: Option<TransactionType>,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: Option<i32>,
    #[validate(custom = "validate_unit_price")]
    pub unit_price: Option<Decimal>,
    pub cylinder_condition: Option<CylinderCondition>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

/// An order header together with its details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderWithDetails {
    #[serde(flatten)]
    pub order: OrderModel,
    pub details: Vec<OrderDetailModel>,
}

fn order_keys(order: &OrderModel) -> Vec<String> {
    vec![
        keys::order(order.id),
        keys::ORDERS_LIST.to_string(),
        keys::orders_for_customer(order.customer_id),
    ]
}

fn detail_active_model(order_id: Uuid, input: OrderDetailInput) -> OrderDetailActiveModel {
    let now = Utc::now();
    let subtotal = line_amounts(input.quantity(), input.unit_price, Decimal::ZERO).subtotal;
    OrderDetailActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        cylinder_category_id: Set(input.cylinder_category_id),
        transaction_type: Set(input.transaction_type),
        quantity: Set(input.quantity),
        unit_price: Set(input.unit_price),
        subtotal: Set(subtotal),
        cylinder_condition: Set(input.cylinder_condition),
        notes: Set(input.notes),
        created_at: Set(now),
        updated_at: Set(now),
    }
}

/// Orders and their cylinder details.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    store: OrderStore,
    references: Arc<dyn ReferenceValidator>,
    side_effects: SideEffects,
    settings: DocumentSettings,
}

impl OrderService {
    pub fn new(
        db: Arc<DbPool>,
        references: Arc<dyn ReferenceValidator>,
        side_effects: SideEffects,
        settings: DocumentSettings,
    ) -> Self {
        Self {
            db,
            store: OrderStore,
            references,
            side_effects,
            settings,
        }
    }

    async fn lock_order<C>(&self, conn: &C, order_id: Uuid) -> Result<OrderModel, ServiceError>
    where
        C: ConnectionTrait,
    {
        self.store
            .find_by_id_for_update(conn, order_id)
            .await
            .during(|| format!("locking order {}", order_id))?
            .ok_or_else(|| ServiceError::not_found("Order", order_id))
    }

    /// Recomputes the order total from every stored detail and persists it.
    async fn refresh_total<C>(
        &self,
        conn: &C,
        order: OrderModel,
    ) -> Result<OrderWithDetails, ServiceError>
    where
        C: ConnectionTrait,
    {
        let order_id = order.id;
        let details = self
            .store
            .find_children(conn, order_id)
            .await
            .during(|| format!("loading details of order {}", order_id))?;
        let totals = recalculate(&details, Decimal::ZERO);

        let mut active: OrderActiveModel = order.into();
        active.total_amount = Set(totals.subtotal);
        let order = self
            .store
            .update(conn, active)
            .await
            .during(|| format!("persisting total of order {}", order_id))?;

        Ok(OrderWithDetails { order, details })
    }

    async fn check_detail_references(
        &self,
        details: &[OrderDetailInput],
    ) -> Result<(), ServiceError> {
        let categories: BTreeSet<Uuid> = details.iter().map(|d| d.cylinder_category_id).collect();
        for category_id in categories {
            ensure_exists(
                self.references.as_ref(),
                ReferenceKind::CylinderCategory,
                category_id,
            )
            .await?;
        }
        Ok(())
    }

    /// Creates an order and its details in one transaction.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, details = request.details.len()))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderWithDetails, ServiceError> {
        request.validate()?;

        let refs = self.references.as_ref();
        ensure_exists(refs, ReferenceKind::Customer, request.customer_id).await?;
        ensure_optional_exists(refs, ReferenceKind::Address, request.delivery_address_id).await?;
        ensure_optional_exists(refs, ReferenceKind::Driver, request.driver_id).await?;
        self.check_detail_references(&request.details).await?;

        let order_id = Uuid::new_v4();
        let created = bounded_transaction(self.settings.transaction_timeout, "creating order", async {
            let txn = self.db.begin().await.during(|| "starting order transaction")?;

            let header = OrderActiveModel {
                id: Set(order_id),
                customer_id: Set(request.customer_id),
                order_status: Set(OrderStatus::Pending),
                payment_status: Set(request.payment_status.unwrap_or(OrderPaymentStatus::Pending)),
                total_amount: Set(Decimal::ZERO),
                delivery_method: Set(request.delivery_method),
                delivery_address_id: Set(request.delivery_address_id),
                driver_id: Set(request.driver_id),
                completed_at: Set(None),
                notes: Set(request.notes),
                ..Default::default()
            };
            let order = self
                .store
                .create(&txn, header)
                .await
                .during(|| format!("inserting order {}", order_id))?;

            let details = request
                .details
                .into_iter()
                .map(|input| detail_active_model(order_id, input))
                .collect();
            self.store
                .bulk_create_children(&txn, details)
                .await
                .during(|| format!("inserting details of order {}", order_id))?;

            let created = self.refresh_total(&txn, order).await?;
            txn.commit().await.during(|| format!("committing order {}", order_id))?;
            Ok(created)
        })
        .await?;

        info!(
            order_id = %created.order.id,
            total_amount = %created.order.total_amount,
            "order created"
        );
        self.side_effects
            .after_commit(
                order_keys(&created.order),
                vec![Event::OrderCreated {
                    order_id: created.order.id,
                    customer_id: created.order.customer_id,
                    total_amount: created.order.total_amount,
                }],
            )
            .await;

        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderWithDetails, ServiceError> {
        let db = &*self.db;
        let order = self
            .store
            .find_by_id(db, order_id)
            .await
            .during(|| format!("fetching order {}", order_id))?
            .ok_or_else(|| ServiceError::not_found("Order", order_id))?;
        let details = self
            .store
            .find_children(db, order_id)
            .await
            .during(|| format!("loading details of order {}", order_id))?;
        Ok(OrderWithDetails { order, details })
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        filter: OrderFilter,
        pagination: Pagination,
    ) -> Result<Page<OrderModel>, ServiceError> {
        self.store
            .list(&*self.db, &filter, pagination)
            .await
            .during(|| "listing orders")
    }

    /// Edits header fields of a non-terminal order.
    #[instrument(skip(self, request))]
    pub async fn update_order(
        &self,
        order_id: Uuid,
        request: UpdateOrderRequest,
    ) -> Result<OrderWithDetails, ServiceError> {
        request.validate()?;

        let refs = self.references.as_ref();
        ensure_optional_exists(refs, ReferenceKind::Address, request.delivery_address_id).await?;
        ensure_optional_exists(refs, ReferenceKind::Driver, request.driver_id).await?;

        let updated = bounded_transaction(self.settings.transaction_timeout, "updating order", async {
            let txn = self.db.begin().await.during(|| "starting order transaction")?;
            let order = self.lock_order(&txn, order_id).await?;
            ensure_order_header_editable(order.order_status)?;

            let mut active: OrderActiveModel = order.into();
            if let Some(method) = request.delivery_method {
                active.delivery_method = Set(method);
            }
            if let Some(address_id) = request.delivery_address_id {
                active.delivery_address_id = Set(Some(address_id));
            }
            if let Some(driver_id) = request.driver_id {
                active.driver_id = Set(Some(driver_id));
            }
            if let Some(payment_status) = request.payment_status {
                active.payment_status = Set(payment_status);
            }
            if let Some(notes) = request.notes {
                active.notes = Set(Some(notes));
            }

            let order = self
                .store
                .update(&txn, active)
                .await
                .during(|| format!("updating order {}", order_id))?;
            let details = self
                .store
                .find_children(&txn, order_id)
                .await
                .during(|| format!("loading details of order {}", order_id))?;
            txn.commit().await.during(|| format!("committing order {}", order_id))?;
            Ok(OrderWithDetails { order, details })
        })
        .await?;

        info!(%order_id, "order updated");
        self.side_effects
            .after_commit(order_keys(&updated.order), vec![Event::OrderUpdated(order_id)])
            .await;
        Ok(updated)
    }

    /// Moves an order along its lifecycle. Requesting the current status is a
    /// no-op; `notes` replaces the order notes only when the status changes.
    #[instrument(skip(self, notes), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        notes: Option<String>,
    ) -> Result<OrderModel, ServiceError> {
        check_status_notes(notes.as_deref())?;

        let (order, transition) = bounded_transaction(
            self.settings.transaction_timeout,
            "updating order status",
            async {
                let txn = self.db.begin().await.during(|| "starting order transaction")?;
                let order = self.lock_order(&txn, order_id).await?;

                let transition = check_transition(order.order_status, new_status)?;
                let Transition::Changed { to, .. } = transition else {
                    return Ok((order, transition));
                };

                let mut active: OrderActiveModel = order.into();
                active.order_status = Set(to);
                if let Some(notes) = notes {
                    active.notes = Set(Some(notes));
                }
                if to == OrderStatus::Completed {
                    active.completed_at = Set(Some(Utc::now()));
                }
                let order = self
                    .store
                    .update(&txn, active)
                    .await
                    .during(|| format!("updating status of order {}", order_id))?;
                txn.commit().await.during(|| format!("committing order {}", order_id))?;
                Ok((order, transition))
            },
        )
        .await?;

        if let Transition::Changed { from, to } = transition {
            info!(%order_id, %from, %to, "order status updated");
            self.side_effects
                .after_commit(
                    order_keys(&order),
                    vec![Event::OrderStatusChanged { order_id, from, to }],
                )
                .await;
        }
        Ok(order)
    }

    pub async fn cancel_order(&self, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        self.update_order_status(order_id, OrderStatus::Cancelled, None)
            .await
    }

    #[instrument(skip(self, input), fields(order_id = %order_id))]
    pub async fn add_order_detail(
        &self,
        order_id: Uuid,
        input: OrderDetailInput,
    ) -> Result<OrderWithDetails, ServiceError> {
        input.validate()?;
        self.check_detail_references(std::slice::from_ref(&input)).await?;

        let updated = bounded_transaction(self.settings.transaction_timeout, "adding order detail", async {
            let txn = self.db.begin().await.during(|| "starting order transaction")?;
            let order = self.lock_order(&txn, order_id).await?;
            ensure_order_details_editable(order.order_status)?;

            self.store
                .create_child(&txn, detail_active_model(order_id, input))
                .await
                .during(|| format!("inserting detail on order {}", order_id))?;

            let updated = self.refresh_total(&txn, order).await?;
            txn.commit().await.during(|| format!("committing order {}", order_id))?;
            Ok(updated)
        })
        .await?;

        info!(%order_id, total_amount = %updated.order.total_amount, "order detail added");
        self.side_effects
            .after_commit(order_keys(&updated.order), vec![Event::OrderUpdated(order_id)])
            .await;
        Ok(updated)
    }

    #[instrument(skip(self, request), fields(order_id = %order_id, detail_id = %detail_id))]
    pub async fn update_order_detail(
        &self,
        order_id: Uuid,
        detail_id: Uuid,
        request: UpdateOrderDetailRequest,
    ) -> Result<OrderWithDetails, ServiceError> {
        request.validate()?;
        if let Some(category_id) = request.cylinder_category_id {
            ensure_exists(
                self.references.as_ref(),
                ReferenceKind::CylinderCategory,
                category_id,
            )
            .await?;
        }

        let updated = bounded_transaction(self.settings.transaction_timeout, "updating order detail", async {
            let txn = self.db.begin().await.during(|| "starting order transaction")?;
            let order = self.lock_order(&txn, order_id).await?;
            ensure_order_details_editable(order.order_status)?;

            let detail = self
                .store
                .find_child(&txn, order_id, detail_id)
                .await
                .during(|| format!("fetching detail {} of order {}", detail_id, order_id))?
                .ok_or_else(|| ServiceError::not_found("Order detail", detail_id))?;

            let quantity = request.quantity.unwrap_or(detail.quantity);
            let unit_price = request.unit_price.unwrap_or(detail.unit_price);
            let mut active: OrderDetailActiveModel = detail.into();
            if let Some(category_id) = request.cylinder_category_id {
                active.cylinder_category_id = Set(category_id);
            }
            if let Some(transaction_type) = request.transaction_type {
                active.transaction_type = Set(transaction_type);
            }
            if let Some(condition) = request.cylinder_condition {
                active.cylinder_condition = Set(condition);
            }
            if let Some(notes) = request.notes {
                active.notes = Set(Some(notes));
            }
            active.quantity = Set(quantity);
            active.unit_price = Set(unit_price);
            active.subtotal =
                Set(line_amounts(Decimal::from(quantity), unit_price, Decimal::ZERO).subtotal);

            self.store
                .update_child(&txn, active)
                .await
                .during(|| format!("updating detail {} of order {}", detail_id, order_id))?;

            let updated = self.refresh_total(&txn, order).await?;
            txn.commit().await.during(|| format!("committing order {}", order_id))?;
            Ok(updated)
        })
        .await?;

        info!(%order_id, %detail_id, total_amount = %updated.order.total_amount, "order detail updated");
        self.side_effects
            .after_commit(order_keys(&updated.order), vec![Event::OrderUpdated(order_id)])
            .await;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn remove_order_detail(
        &self,
        order_id: Uuid,
        detail_id: Uuid,
    ) -> Result<OrderWithDetails, ServiceError> {
        let updated = bounded_transaction(self.settings.transaction_timeout, "removing order detail", async {
            let txn = self.db.begin().await.during(|| "starting order transaction")?;
            let order = self.lock_order(&txn, order_id).await?;
            ensure_order_detail_removable(order.order_status)?;

            let removed = self
                .store
                .delete_child(&txn, order_id, detail_id)
                .await
                .during(|| format!("deleting detail {} of order {}", detail_id, order_id))?;
            if removed == 0 {
                return Err(ServiceError::not_found("Order detail", detail_id));
            }

            let updated = self.refresh_total(&txn, order).await?;
            txn.commit().await.during(|| format!("committing order {}", order_id))?;
            Ok(updated)
        })
        .await?;

        info!(%order_id, %detail_id, total_amount = %updated.order.total_amount, "order detail removed");
        self.side_effects
            .after_commit(order_keys(&updated.order), vec![Event::OrderUpdated(order_id)])
            .await;
        Ok(updated)
    }

    /// Permanently removes a pending order. Later orders are cancelled instead.
    #[instrument(skip(self))]
    pub async fn delete_order(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let order = bounded_transaction(self.settings.transaction_timeout, "deleting order", async {
            let txn = self.db.begin().await.during(|| "starting order transaction")?;
            let order = self.lock_order(&txn, order_id).await?;
            if order.order_status != OrderStatus::Pending {
                warn!(%order_id, status = %order.order_status, "refusing to delete non-pending order");
                return Err(ServiceError::InvalidState(format!(
                    "only pending orders can be deleted; order is {}",
                    order.order_status
                )));
            }

            let deleted = self
                .store
                .hard_delete(&txn, order_id)
                .await
                .during(|| format!("deleting order {}", order_id))?;
            if deleted == 0 {
                return Err(ServiceError::InvalidState(format!(
                    "order {} could not be deleted",
                    order_id
                )));
            }
            txn.commit().await.during(|| format!("committing deletion of order {}", order_id))?;
            Ok(order)
        })
        .await?;

        info!(%order_id, "order deleted");
        self.side_effects
            .after_commit(order_keys(&order), vec![Event::OrderDeleted(order_id)])
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn detail(quantity: i32, unit_price: Decimal) -> OrderDetailInput {
        OrderDetailInput {
            cylinder_category_id: Uuid::new_v4(),
            transaction_type: TransactionType::Refill,
            quantity,
            unit_price,
            cylinder_condition: CylinderCondition::Good,
            notes: None,
        }
    }

    #[test]
    fn detail_validation() {
        assert!(detail(1, dec!(10)).validate().is_ok());
        assert!(detail(0, dec!(10)).validate().is_err());
        assert!(detail(1, dec!(-1)).validate().is_err());
        assert!(detail(1, dec!(1.005)).validate().is_err());
    }

    #[test]
    fn create_request_validates_nested_details() {
        let request = CreateOrderRequest {
            customer_id: Uuid::new_v4(),
            delivery_method: DeliveryMethod::Pickup,
            delivery_address_id: None,
            driver_id: None,
            payment_status: None,
            notes: None,
            details: vec![detail(2, dec!(10)), detail(0, dec!(5))],
        };
        assert!(request.validate().is_err());
    }

    #[test]
    fn detail_rows_carry_their_subtotal() {
        let order_id = Uuid::new_v4();
        let row = detail_active_model(order_id, detail(3, dec!(12.50)));
        assert_eq!(row.subtotal, Set(dec!(37.50)));
        assert_eq!(row.order_id, Set(order_id));
    }

    #[test]
    fn condition_defaults_to_not_applicable() {
        let json = serde_json::json!({
            "cylinder_category_id": Uuid::new_v4(),
            "transaction_type": "new_purchase",
            "quantity": 1,
            "unit_price": "20.00"
        });
        let input: OrderDetailInput = serde_json::from_value(json).unwrap();
        assert_eq!(input.cylinder_condition, CylinderCondition::NotApplicable);
    }
}
