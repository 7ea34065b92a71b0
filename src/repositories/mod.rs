use async_trait::async_trait;
use sea_orm::{
    ConnectionTrait, DbBackend, DbErr, EntityTrait, FromQueryResult, PaginatorTrait, QuerySelect,
    Select,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod invoice_repository;
pub mod order_repository;

pub use invoice_repository::{InvoiceFilter, InvoiceStore};
pub use order_repository::{OrderFilter, OrderStore};

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u64,
    pub per_page: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn new(page: u64, per_page: u64) -> Self {
        Self { page, per_page }
    }

    fn page(&self) -> u64 {
        self.page.max(1)
    }

    fn per_page(&self) -> u64 {
        self.per_page.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            per_page: self.per_page,
            total_pages: self.total_pages,
        }
    }
}

/// Runs a filtered select as one page plus the total row count.
pub(crate) async fn fetch_page<C, E>(
    conn: &C,
    select: Select<E>,
    pagination: Pagination,
) -> Result<Page<E::Model>, DbErr>
where
    C: ConnectionTrait,
    E: EntityTrait,
    E::Model: FromQueryResult + Send + Sync,
{
    let page = pagination.page();
    let per_page = pagination.per_page();
    let paginator = select.paginate(conn, per_page);

    let total = paginator.num_items().await?;
    let items = paginator.fetch_page(page - 1).await?;

    Ok(Page {
        items,
        total,
        page,
        per_page,
        total_pages: total.div_ceil(per_page),
    })
}

/// Adds `FOR UPDATE` where the backend supports row locks. SQLite serializes
/// writers on its own.
pub(crate) fn for_update<C, E>(conn: &C, select: Select<E>) -> Select<E>
where
    C: ConnectionTrait,
    E: EntityTrait,
{
    match conn.get_database_backend() {
        DbBackend::Sqlite => select,
        _ => select.lock_exclusive(),
    }
}

/// Persistence for a document header and its line items.
///
/// Every method takes either the pool or an open transaction, so a service
/// can compose several calls into one atomic unit.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    type Header: Send + Sync;
    type HeaderActive: Send;
    type Child: Send + Sync;
    type ChildActive: Send;
    type Filter: Send + Sync;

    async fn find_by_id<C>(&self, conn: &C, id: Uuid) -> Result<Option<Self::Header>, DbErr>
    where
        C: ConnectionTrait;

    /// Reads the header holding an exclusive row lock until the transaction ends.
    async fn find_by_id_for_update<C>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<Option<Self::Header>, DbErr>
    where
        C: ConnectionTrait;

    async fn create<C>(&self, conn: &C, header: Self::HeaderActive) -> Result<Self::Header, DbErr>
    where
        C: ConnectionTrait;

    /// Writes the fields set on `header`.
    async fn update<C>(&self, conn: &C, header: Self::HeaderActive) -> Result<Self::Header, DbErr>
    where
        C: ConnectionTrait;

    /// Moves the document to its cancelled status.
    async fn soft_delete<C>(&self, conn: &C, id: Uuid) -> Result<Option<Self::Header>, DbErr>
    where
        C: ConnectionTrait;

    /// Removes children then the header, only while the header is in its
    /// initial status. Returns the number of headers removed.
    async fn hard_delete<C>(&self, conn: &C, id: Uuid) -> Result<u64, DbErr>
    where
        C: ConnectionTrait;

    async fn find_children<C>(&self, conn: &C, parent_id: Uuid) -> Result<Vec<Self::Child>, DbErr>
    where
        C: ConnectionTrait;

    async fn find_child<C>(
        &self,
        conn: &C,
        parent_id: Uuid,
        child_id: Uuid,
    ) -> Result<Option<Self::Child>, DbErr>
    where
        C: ConnectionTrait;

    async fn create_child<C>(&self, conn: &C, child: Self::ChildActive) -> Result<Self::Child, DbErr>
    where
        C: ConnectionTrait;

    async fn update_child<C>(&self, conn: &C, child: Self::ChildActive) -> Result<Self::Child, DbErr>
    where
        C: ConnectionTrait;

    async fn delete_child<C>(&self, conn: &C, parent_id: Uuid, child_id: Uuid) -> Result<u64, DbErr>
    where
        C: ConnectionTrait;

    async fn bulk_create_children<C>(
        &self,
        conn: &C,
        children: Vec<Self::ChildActive>,
    ) -> Result<(), DbErr>
    where
        C: ConnectionTrait;

    async fn list<C>(
        &self,
        conn: &C,
        filter: &Self::Filter,
        pagination: Pagination,
    ) -> Result<Page<Self::Header>, DbErr>
    where
        C: ConnectionTrait;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_is_clamped() {
        let p = Pagination::new(0, 10_000);
        assert_eq!(p.page(), 1);
        assert_eq!(p.per_page(), MAX_PAGE_SIZE);
        assert_eq!(Pagination::default().per_page(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn page_map_keeps_counts() {
        let page = Page {
            items: vec![1, 2, 3],
            total: 7,
            page: 1,
            per_page: 3,
            total_pages: 3,
        };
        let mapped = page.map(|n| n * 10);
        assert_eq!(mapped.items, vec![10, 20, 30]);
        assert_eq!(mapped.total_pages, 3);
    }
}
