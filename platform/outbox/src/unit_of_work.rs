//! Unit of Work
//!
//! `execute` opens one transaction, hands its context to the caller's work,
//! commits when the work succeeds and rolls back when it fails. The work's
//! error comes back unchanged.
//!
//! The transaction context is the associated `Tx` type. Business code only
//! passes it along; repositories reach the underlying connection through the
//! adapter's accessor ([`PgTransaction::connection`],
//! [`MemoryTransaction::stage`]).
//!
//! Nested units of work are not supported: everything inside one callback
//! must use the single `tx` it was given. Queue enqueues and other side
//! effects that cannot be rolled back belong after `execute` returns.
//!
//! ```rust,no_run
//! use outbox::{PgUnitOfWork, UnitOfWork, OutboxError};
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), OutboxError> {
//! let uow = PgUnitOfWork::new(pool);
//! let rows = uow
//!     .execute(|tx| {
//!         Box::pin(async move {
//!             let done = sqlx::query("UPDATE users SET active = true WHERE id = 1")
//!                 .execute(tx.connection())
//!                 .await?;
//!             Ok::<_, OutboxError>(done.rows_affected())
//!         })
//!     })
//!     .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::UnitOfWorkError;

/// Runs work inside a single database transaction
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Opaque transaction context handed to the work
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, UnitOfWorkError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), UnitOfWorkError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), UnitOfWorkError>;

    /// Run `work` atomically
    ///
    /// Commits and returns the work's value on success. On failure the
    /// transaction is rolled back and the work's error is returned as-is; a
    /// rollback failure is logged but never replaces that error.
    async fn execute<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut Self::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<UnitOfWorkError> + Send,
    {
        let mut tx = self.begin().await?;

        match work(&mut tx).await {
            Ok(value) => {
                self.commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(tx).await {
                    tracing::error!(error = %rollback_err, "Failed to roll back unit of work");
                }
                Err(err)
            }
        }
    }
}

// ============================================================================
// Postgres
// ============================================================================

/// Unit of work backed by a Postgres transaction
#[derive(Clone)]
pub struct PgUnitOfWork {
    pool: PgPool,
}

impl PgUnitOfWork {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Transaction context for [`PgUnitOfWork`]
pub struct PgTransaction {
    inner: Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// Connection to run statements on inside this transaction
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut *self.inner
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, UnitOfWorkError> {
        let inner = self
            .pool
            .begin()
            .await
            .map_err(|e| UnitOfWorkError::Begin(e.to_string()))?;
        Ok(PgTransaction { inner })
    }

    async fn commit(&self, tx: PgTransaction) -> Result<(), UnitOfWorkError> {
        tx.inner
            .commit()
            .await
            .map_err(|e| UnitOfWorkError::Commit(e.to_string()))
    }

    async fn rollback(&self, tx: PgTransaction) -> Result<(), UnitOfWorkError> {
        tx.inner
            .rollback()
            .await
            .map_err(|e| UnitOfWorkError::Rollback(e.to_string()))
    }
}

// ============================================================================
// In-memory
// ============================================================================

type StagedCheck = Box<dyn FnOnce() -> Result<(), String> + Send>;

struct StagedWrite {
    check: Option<StagedCheck>,
    apply: Box<dyn FnOnce() + Send>,
}

/// Serializes in-memory commits with the writes that race them
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

pub(crate) fn lock_commits() -> MutexGuard<'static, ()> {
    COMMIT_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transaction context for [`MemoryUnitOfWork`]
///
/// Collects writes and applies them in staging order on commit. A rolled
/// back transaction simply drops them. Reads made inside the transaction do
/// not see its own staged writes.
///
/// Writes staged with [`stage_checked`](Self::stage_checked) are validated
/// again at commit time. If any check fails, nothing is applied and the
/// commit returns an error.
#[derive(Default)]
pub struct MemoryTransaction {
    staged: Vec<StagedWrite>,
}

impl MemoryTransaction {
    /// Stage a write to apply on commit
    pub fn stage<F>(&mut self, write: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.staged.push(StagedWrite {
            check: None,
            apply: Box::new(write),
        });
    }

    /// Stage a write that only applies if `check` still passes at commit
    pub fn stage_checked<C, F>(&mut self, check: C, write: F)
    where
        C: FnOnce() -> Result<(), String> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.staged.push(StagedWrite {
            check: Some(Box::new(check)),
            apply: Box::new(write),
        });
    }

    /// Number of writes waiting for commit
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn apply(self) -> Result<(), UnitOfWorkError> {
        let _commits = lock_commits();
        let mut staged = self.staged;
        for write in &mut staged {
            if let Some(check) = write.check.take() {
                check().map_err(UnitOfWorkError::Commit)?;
            }
        }
        for write in staged {
            (write.apply)();
        }
        Ok(())
    }
}

/// In-memory unit of work for tests and local development
#[derive(Clone, Default)]
pub struct MemoryUnitOfWork {
    commits: Arc<AtomicU64>,
    rollbacks: Arc<AtomicU64>,
}

impl MemoryUnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, UnitOfWorkError> {
        Ok(MemoryTransaction::default())
    }

    async fn commit(&self, tx: MemoryTransaction) -> Result<(), UnitOfWorkError> {
        if let Err(e) = tx.apply() {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTransaction) -> Result<(), UnitOfWorkError> {
        drop(tx);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
