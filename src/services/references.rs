use async_trait::async_trait;
use dashmap::DashSet;
use tracing::warn;
use uuid::Uuid;

use crate::errors::ServiceError;

/// Records owned by other subsystems that documents point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ReferenceKind {
    Customer,
    Driver,
    Address,
    CylinderCategory,
    Product,
}

/// Lookup into the customer, fleet and catalogue subsystems.
#[async_trait]
pub trait ReferenceValidator: Send + Sync {
    async fn exists(&self, kind: ReferenceKind, id: Uuid) -> Result<bool, ServiceError>;
}

/// Fails with a validation error when `id` does not resolve.
pub async fn ensure_exists(
    validator: &dyn ReferenceValidator,
    kind: ReferenceKind,
    id: Uuid,
) -> Result<(), ServiceError> {
    if validator.exists(kind, id).await? {
        Ok(())
    } else {
        warn!(%kind, %id, "unknown reference");
        Err(ServiceError::ValidationError(format!(
            "{} {} does not exist",
            kind, id
        )))
    }
}

pub async fn ensure_optional_exists(
    validator: &dyn ReferenceValidator,
    kind: ReferenceKind,
    id: Option<Uuid>,
) -> Result<(), ServiceError> {
    match id {
        Some(id) => ensure_exists(validator, kind, id).await,
        None => Ok(()),
    }
}

/// Accepts every reference. For deployments where integrity is enforced elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllReferences;

#[async_trait]
impl ReferenceValidator for AcceptAllReferences {
    async fn exists(&self, _kind: ReferenceKind, _id: Uuid) -> Result<bool, ServiceError> {
        Ok(true)
    }
}

/// Registry of known ids, shared across tasks.
#[derive(Debug, Default)]
pub struct InMemoryReferences {
    known: DashSet<(ReferenceKind, Uuid)>,
}

impl InMemoryReferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ReferenceKind, id: Uuid) {
        self.known.insert((kind, id));
    }

    /// Registers and returns a fresh id.
    pub fn add(&self, kind: ReferenceKind) -> Uuid {
        let id = Uuid::new_v4();
        self.register(kind, id);
        id
    }

    pub fn forget(&self, kind: ReferenceKind, id: Uuid) {
        self.known.remove(&(kind, id));
    }
}

#[async_trait]
impl ReferenceValidator for InMemoryReferences {
    async fn exists(&self, kind: ReferenceKind, id: Uuid) -> Result<bool, ServiceError> {
        Ok(self.known.contains(&(kind, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn registry_distinguishes_kinds() {
        let refs = InMemoryReferences::new();
        let customer = refs.add(ReferenceKind::Customer);

        assert!(ensure_exists(&refs, ReferenceKind::Customer, customer).await.is_ok());
        assert_matches!(
            ensure_exists(&refs, ReferenceKind::Driver, customer).await,
            Err(ServiceError::ValidationError(msg)) if msg.starts_with("driver ")
        );

        refs.forget(ReferenceKind::Customer, customer);
        assert!(ensure_exists(&refs, ReferenceKind::Customer, customer).await.is_err());
    }

    #[tokio::test]
    async fn optional_reference_may_be_absent() {
        let refs = InMemoryReferences::new();
        assert!(ensure_optional_exists(&refs, ReferenceKind::Address, None).await.is_ok());
        assert!(AcceptAllReferences
            .exists(ReferenceKind::Product, Uuid::new_v4())
            .await
            .unwrap());
    }
}
