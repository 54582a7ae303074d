/*!
 * Transaction Helper Utilities
 *
 * Runs a unit of work inside one database transaction, committing on `Ok`
 * and rolling back on `Err`.
 */

use sea_orm::{DatabaseTransaction, TransactionError, TransactionTrait};
use std::future::Future;
use std::pin::Pin;

use crate::errors::ServiceError;

/// Type alias for boxed future used in transactions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Execute a function within a database transaction
///
/// Errors raised inside the closure come back unchanged, so a promo-code or
/// validation failure is still reported as itself after the rollback. Only
/// failures to begin or commit are turned into `PersistenceError`.
///
/// ```rust,ignore
/// let purchase = with_transaction(&db, |txn| {
///     Box::pin(async move {
///         let purchaser = purchaser.insert(txn).await?;
///         let purchase = purchase.insert(txn).await?;
///         Ok(purchase)
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<C, F, T>(db: &C, f: F) -> Result<T, ServiceError>
where
    C: TransactionTrait,
    F: for<'a> FnOnce(&'a DatabaseTransaction) -> BoxFuture<'a, Result<T, ServiceError>> + Send,
    T: Send,
{
    db.transaction::<_, T, ServiceError>(f)
        .await
        .map_err(|e| match e {
            TransactionError::Connection(db_err) => ServiceError::PersistenceError(db_err),
            TransactionError::Transaction(err) => err,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::lead::{self, LeadStatus};
    use sea_orm::{ActiveModelTrait, Database, EntityTrait, PaginatorTrait, Set};

    async fn test_db() -> sea_orm::DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        crate::db::run_migrations(&db).await.unwrap();
        db
    }

    fn lead_row(email: &str) -> lead::ActiveModel {
        let now = chrono::Utc::now();
        lead::ActiveModel {
            id: Set(uuid::Uuid::new_v4()),
            email: Set(email.to_string()),
            full_name: Set("Ada Lovelace".into()),
            phone: Set("+15550100".into()),
            country: Set("GB".into()),
            status: Set(LeadStatus::Contacted),
            metadata: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
    }

    #[tokio::test]
    async fn commits_on_ok() {
        let db = test_db().await;
        with_transaction(&db, |txn| {
            Box::pin(async move {
                lead_row("a@example.com").insert(txn).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(lead::Entity::find().count(&db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rolls_back_and_preserves_error() {
        let db = test_db().await;
        let result: Result<(), ServiceError> = with_transaction(&db, |txn| {
            Box::pin(async move {
                lead_row("b@example.com").insert(txn).await?;
                Err(ServiceError::validation("attendees", "mismatch"))
            })
        })
        .await;

        assert!(matches!(result, Err(ServiceError::ValidationError(_))));
        assert_eq!(lead::Entity::find().count(&db).await.unwrap(), 0);
    }
}
