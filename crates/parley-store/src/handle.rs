//! Async access to a shared [`Database`].
//!
//! `rusqlite::Connection` is synchronous and `!Sync`, so the database lives
//! behind a mutex and every closure runs on tokio's blocking pool. Holding
//! the lock for the whole closure is what serializes appends.

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub struct StoreHandle {
    db: Arc<Mutex<Database>>,
}

impl StoreHandle {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Database::open_at(path).map(Self::new)
    }

    pub fn open_in_memory() -> Result<Self> {
        Database::open_in_memory().map(Self::new)
    }

    /// Run `f` with exclusive access to the database on the blocking pool.
    ///
    /// The closure may return any error type that a [`StoreError`] converts
    /// into, so callers can mix store calls with their own checks.
    pub async fn run<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Database) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| E::from(StoreError::Worker(e.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewUser;

    #[tokio::test]
    async fn test_run_shares_one_database() {
        let store = StoreHandle::open_in_memory().unwrap();

        let created = store
            .run(|db| db.create_user(&NewUser::new("alice", "Alice")))
            .await
            .unwrap();

        let other = store.clone();
        let found = other
            .run(move |db| db.find_user(created.id))
            .await
            .unwrap();
        assert_eq!(found.map(|u| u.username), Some("alice".to_string()));
    }

    #[tokio::test]
    async fn test_run_propagates_store_errors() {
        let store = StoreHandle::open_in_memory().unwrap();
        store
            .run(|db| db.create_user(&NewUser::new("bob", "Bob")))
            .await
            .unwrap();

        let err = store
            .run(|db| db.create_user(&NewUser::new("bob", "Bob again")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
