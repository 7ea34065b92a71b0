use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{fetch_page, for_update, DocumentStore, Page, Pagination};
use crate::entities::invoice::{
    self, ActiveModel as InvoiceActiveModel, Entity as Invoice, Model as InvoiceModel,
};
use crate::entities::invoice_item::{
    self, ActiveModel as InvoiceItemActiveModel, Entity as InvoiceItem, Model as InvoiceItemModel,
};
use crate::entities::invoice_payment::{
    self, ActiveModel as InvoicePaymentActiveModel, Entity as InvoicePayment,
    Model as InvoicePaymentModel,
};
use crate::entities::InvoiceStatus;
use crate::services::totals::round_money;

const INVOICE_NUMBER_PREFIX: &str = "INV";

fn sequence_of(number: &str, prefix: &str) -> Option<u64> {
    let seq = number.strip_prefix(prefix)?;
    if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    seq.parse().ok()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvoiceFilter {
    pub customer_id: Option<Uuid>,
    pub status: Option<InvoiceStatus>,
    pub is_paid: Option<bool>,
    /// Only invoices due strictly before this date
    pub due_before: Option<NaiveDate>,
}

impl InvoiceFilter {
    fn condition(&self) -> Condition {
        let mut cond = Condition::all();
        if let Some(customer_id) = self.customer_id {
            cond = cond.add(invoice::Column::CustomerId.eq(customer_id));
        }
        if let Some(status) = self.status {
            cond = cond.add(invoice::Column::Status.eq(status));
        }
        if let Some(is_paid) = self.is_paid {
            cond = cond.add(invoice::Column::IsPaid.eq(is_paid));
        }
        if let Some(due_before) = self.due_before {
            cond = cond.add(invoice::Column::DueDate.lt(due_before));
        }
        cond
    }
}

/// Store for invoices, their items and their payment ledger.
#[derive(Debug, Default, Clone, Copy)]
pub struct InvoiceStore;

impl InvoiceStore {
    pub async fn find_by_number<C>(
        &self,
        conn: &C,
        invoice_number: &str,
    ) -> Result<Option<InvoiceModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        Invoice::find()
            .filter(invoice::Column::InvoiceNumber.eq(invoice_number))
            .one(conn)
            .await
    }

    pub async fn find_payments<C>(
        &self,
        conn: &C,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoicePaymentModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        InvoicePayment::find()
            .filter(invoice_payment::Column::InvoiceId.eq(invoice_id))
            .order_by_asc(invoice_payment::Column::CreatedAt)
            .order_by_asc(invoice_payment::Column::Id)
            .all(conn)
            .await
    }

    pub async fn create_payment<C>(
        &self,
        conn: &C,
        payment: InvoicePaymentActiveModel,
    ) -> Result<InvoicePaymentModel, DbErr>
    where
        C: ConnectionTrait,
    {
        payment.insert(conn).await
    }

    /// Sum of every recorded payment, read from the ledger rows.
    pub async fn sum_payments<C>(&self, conn: &C, invoice_id: Uuid) -> Result<Decimal, DbErr>
    where
        C: ConnectionTrait,
    {
        let amounts: Vec<Decimal> = InvoicePayment::find()
            .select_only()
            .column(invoice_payment::Column::Amount)
            .filter(invoice_payment::Column::InvoiceId.eq(invoice_id))
            .into_tuple()
            .all(conn)
            .await?;
        Ok(round_money(amounts.into_iter().sum()))
    }

    /// Next free number in the `INV-{year}-{seq}` series. Numbers in that
    /// year whose suffix is not purely numeric are ignored.
    pub async fn next_invoice_number<C>(&self, conn: &C, year: i32) -> Result<String, DbErr>
    where
        C: ConnectionTrait,
    {
        let prefix = format!("{}-{}-", INVOICE_NUMBER_PREFIX, year);
        let taken: Vec<String> = Invoice::find()
            .select_only()
            .column(invoice::Column::InvoiceNumber)
            .filter(invoice::Column::InvoiceNumber.starts_with(prefix.as_str()))
            .into_tuple()
            .all(conn)
            .await?;

        let next = taken
            .iter()
            .filter_map(|n| sequence_of(n, &prefix))
            .max()
            .map_or(1, |seq| seq + 1);

        Ok(format!("{}{:06}", prefix, next))
    }

    /// Unpaid, issued invoices whose due date is before `as_of`.
    pub async fn find_overdue_candidates<C>(
        &self,
        conn: &C,
        as_of: NaiveDate,
    ) -> Result<Vec<Uuid>, DbErr>
    where
        C: ConnectionTrait,
    {
        Invoice::find()
            .select_only()
            .column(invoice::Column::Id)
            .filter(invoice::Column::Status.is_in([
                InvoiceStatus::Issued,
                InvoiceStatus::Sent,
                InvoiceStatus::PartiallyPaid,
            ]))
            .filter(invoice::Column::IsPaid.eq(false))
            .filter(invoice::Column::DueDate.lt(as_of))
            .order_by_asc(invoice::Column::DueDate)
            .into_tuple()
            .all(conn)
            .await
    }
}

#[async_trait]
impl DocumentStore for InvoiceStore {
    type Header = InvoiceModel;
    type HeaderActive = InvoiceActiveModel;
    type Child = InvoiceItemModel;
    type ChildActive = InvoiceItemActiveModel;
    type Filter = InvoiceFilter;

    async fn find_by_id<C>(&self, conn: &C, id: Uuid) -> Result<Option<InvoiceModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        Invoice::find_by_id(id).one(conn).await
    }

    async fn find_by_id_for_update<C>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<Option<InvoiceModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        for_update(conn, Invoice::find_by_id(id)).one(conn).await
    }

    async fn create<C>(&self, conn: &C, header: InvoiceActiveModel) -> Result<InvoiceModel, DbErr>
    where
        C: ConnectionTrait,
    {
        header.insert(conn).await
    }

    async fn update<C>(&self, conn: &C, header: InvoiceActiveModel) -> Result<InvoiceModel, DbErr>
    where
        C: ConnectionTrait,
    {
        header.update(conn).await
    }

    async fn soft_delete<C>(&self, conn: &C, id: Uuid) -> Result<Option<InvoiceModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        let Some(existing) = Invoice::find_by_id(id).one(conn).await? else {
            return Ok(None);
        };
        let mut active: InvoiceActiveModel = existing.into();
        active.status = Set(InvoiceStatus::Cancelled);
        active.update(conn).await.map(Some)
    }

    async fn hard_delete<C>(&self, conn: &C, id: Uuid) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        InvoicePayment::delete_many()
            .filter(invoice_payment::Column::InvoiceId.eq(id))
            .exec(conn)
            .await?;
        InvoiceItem::delete_many()
            .filter(invoice_item::Column::InvoiceId.eq(id))
            .exec(conn)
            .await?;

        let result = Invoice::delete_many()
            .filter(invoice::Column::Id.eq(id))
            .filter(invoice::Column::Status.eq(InvoiceStatus::Draft))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn find_children<C>(&self, conn: &C, parent_id: Uuid) -> Result<Vec<InvoiceItemModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        InvoiceItem::find()
            .filter(invoice_item::Column::InvoiceId.eq(parent_id))
            .order_by_asc(invoice_item::Column::CreatedAt)
            .order_by_asc(invoice_item::Column::Id)
            .all(conn)
            .await
    }

    async fn find_child<C>(
        &self,
        conn: &C,
        parent_id: Uuid,
        child_id: Uuid,
    ) -> Result<Option<InvoiceItemModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        InvoiceItem::find_by_id(child_id)
            .filter(invoice_item::Column::InvoiceId.eq(parent_id))
            .one(conn)
            .await
    }

    async fn create_child<C>(
        &self,
        conn: &C,
        child: InvoiceItemActiveModel,
    ) -> Result<InvoiceItemModel, DbErr>
    where
        C: ConnectionTrait,
    {
        child.insert(conn).await
    }

    async fn update_child<C>(
        &self,
        conn: &C,
        child: InvoiceItemActiveModel,
    ) -> Result<InvoiceItemModel, DbErr>
    where
        C: ConnectionTrait,
    {
        child.update(conn).await
    }

    async fn delete_child<C>(&self, conn: &C, parent_id: Uuid, child_id: Uuid) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        let result = InvoiceItem::delete_many()
            .filter(invoice_item::Column::Id.eq(child_id))
            .filter(invoice_item::Column::InvoiceId.eq(parent_id))
            .exec(conn)
            .await?;
        Ok(result.rows_affected)
    }

    async fn bulk_create_children<C>(
        &self,
        conn: &C,
        children: Vec<InvoiceItemActiveModel>,
    ) -> Result<(), DbErr>
    where
        C: ConnectionTrait,
    {
        if children.is_empty() {
            return Ok(());
        }
        InvoiceItem::insert_many(children)
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }

    async fn list<C>(
        &self,
        conn: &C,
        filter: &InvoiceFilter,
        pagination: Pagination,
    ) -> Result<Page<InvoiceModel>, DbErr>
    where
        C: ConnectionTrait,
    {
        let select = Invoice::find()
            .filter(filter.condition())
            .order_by_desc(invoice::Column::IssueDate)
            .order_by_desc(invoice::Column::CreatedAt)
            .order_by_asc(invoice::Column::Id);
        fetch_page(conn, select, pagination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_numeric_suffixes_count_as_sequence() {
        let prefix = "INV-2024-";
        assert_eq!(sequence_of("INV-2024-000042", prefix), Some(42));
        assert_eq!(sequence_of("INV-2024-1000000", prefix), Some(1_000_000));
        assert_eq!(sequence_of("INV-2024-X1", prefix), None);
        assert_eq!(sequence_of("INV-2024-", prefix), None);
        assert_eq!(sequence_of("INV-2024-+5", prefix), None);
        assert_eq!(sequence_of("INV-2023-000001", prefix), None);
    }
}
