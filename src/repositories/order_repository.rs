use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{fetch_page, for_update, DocumentStore, Page, Pagination};
use crate::entities::order::{
    self, ActiveModel as OrderActiveModel, Entity as Order, Model as OrderModel,
};
use crate::entities::order_detail::{
    self, ActiveModel as OrderDetailActiveModel, Entity as OrderDetail, Model as OrderDetailModel,
};
use crate::entities::{OrderPaymentStatus, OrderStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub customer_id: Option<Uuid>,
    pub order_status: Option<OrderStatus>,
    pub payment_status: Option<OrderPaymentStatus>,
    pub driver_id: Option<Uuid>,
}

impl OrderFilter {
    fn condition(&self) -> Condition {
        let mut cond = Condition::all();
        if let Some(customer_id) = self.customer_id {
            cond = cond.add(order::Column::CustomerId.eq(customer_id));
        }
        if let Some(status) = self.order_status {
            cond = cond.add(order::Column::OrderStatus.eq(status));
        }
        if let Some(payment_status) = self.payment_status {
            cond = cond.add(order::Column::PaymentStatus.eq(payment_status));
        }
        if let Some(driver_id) = self.driver_id {
            cond = cond.add(order::Column::DriverId.eq(driver_id));
        }
        cond
    }
}

/// Store for orders and their cylinder details.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrderStore;

#[async_trait]
impl DocumentStore for OrderStore {
    type Header = OrderModel;
    type HeaderActive = OrderActiveModel;
    type Child = OrderDetailModel;
    type ChildActive = OrderDetailActiveModel;
    type Filter = OrderFilter;

    async fn find_by_id<C>(&self, conn: &C, id: Uuid) -> Result<Option<OrderModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        Order::find_by_id(id).one(conn).await
    }

    async fn find_by_id_for_update<C>(&self, conn: &C, id: Uuid) -> Result<Option<OrderModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        for_update(conn, Order::find_by_id(id)).one(conn).await
    }

    async fn create<C>(&self, conn: &C, header: OrderActiveModel) -> Result<OrderModel, DbErr>
    where
        C: ConnectionTrait,
    {
        header.insert(conn).await
    }

    async fn update<C>(&self, conn: &C, header: OrderActiveModel) -> Result<OrderModel, DbErr>
    where
        C: ConnectionTrait,
    {
        header.update(conn).await
    }

    async fn soft_delete<C>(&self, conn: &C, id: Uuid) -> Result<Option<OrderModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        let Some(existing) = Order::find_by_id(id).one(conn).await? else {
            return Ok(None);
        };
        let mut active: OrderActiveModel = existing.into();
        active.order_status = Set(OrderStatus::Cancelled);
        active.update(conn).await.map(Some)
    }

    async fn hard_delete<C>(&self, conn: &C, id: Uuid) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        OrderDetail::delete_many()
            .filter(order_detail::Column::OrderId.eq(id))
            .exec(conn)
            .await?;

        let result = Order::delete_many()
            .filter(order::Column::Id.eq(id))
            .filter(order::Column::OrderStatus.eq(OrderStatus::Pending))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn find_children<C>(&self, conn: &C, parent_id: Uuid) -> Result<Vec<OrderDetailModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        OrderDetail::find()
            .filter(order_detail::Column::OrderId.eq(parent_id))
            .order_by_asc(order_detail::Column::CreatedAt)
            .order_by_asc(order_detail::Column::Id)
            .all(conn)
            .await
    }

    async fn find_child<C>(
        &self,
        conn: &C,
        parent_id: Uuid,
        child_id: Uuid,
    ) -> Result<Option<OrderDetailModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        OrderDetail::find_by_id(child_id)
            .filter(order_detail::Column::OrderId.eq(parent_id))
            .one(conn)
            .await
    }

    async fn create_child<C>(
        &self,
        conn: &C,
        child: OrderDetailActiveModel,
    ) -> Result<OrderDetailModel, DbErr>
    where
        C: ConnectionTrait,
    {
        child.insert(conn).await
    }

    async fn update_child<C>(
        &self,
        conn: &C,
        child: OrderDetailActiveModel,
    ) -> Result<OrderDetailModel, DbErr>
    where
        C: ConnectionTrait,
    {
        child.update(conn).await
    }

    async fn delete_child<C>(&self, conn: &C, parent_id: Uuid, child_id: Uuid) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        let result = OrderDetail::delete_many()
            .filter(order_detail::Column::Id.eq(child_id))
            .filter(order_detail::Column::OrderId.eq(parent_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn bulk_create_children<C>(
        &self,
        conn: &C,
        children: Vec<OrderDetailActiveModel>,
    ) -> Result<(), DbErr>
    where
        C: ConnectionTrait,
    {
        if children.is_empty() {
            return Ok(());
        }
        OrderDetail::insert_many(children)
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    async fn list<C>(
        &self,
        conn: &C,
        filter: &OrderFilter,
        pagination: Pagination,
    ) -> Result<Page<OrderModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        let select = Order::find()
            .filter(filter.condition())
            .order_by_desc(order::Column::CreatedAt)
            .order_by_asc(order::Column::Id);
        fetch_page(conn, select, pagination).await
    }
}
