//! Durable `TicketStore` backend on top of `redb`, standing in for a
//! Redis-backed deployment without committing the crate to a specific
//! external store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use super::{GoldenTicket, TicketStore, TicketStoreError};

const TICKETS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("golden_tickets");

#[derive(Debug, thiserror::Error)]
pub enum RedbTicketStoreError {
    #[error("failed to open redb database: {0}")]
    Open(#[from] redb::DatabaseError),
    #[error("redb transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("ticket serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<RedbTicketStoreError> for TicketStoreError {
    fn from(err: RedbTicketStoreError) -> Self {
        TicketStoreError::Backend(err.to_string())
    }
}

pub struct RedbTicketStore {
    db: Arc<Database>,
}

impl RedbTicketStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RedbTicketStoreError> {
        let db = Database::create(path)?;
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(TICKETS_TABLE)?;
            write_txn.commit()?;
        }
        Ok(Self { db: Arc::new(db) })
    }

    fn read_ticket(&self, domain: &str) -> Result<Option<GoldenTicket>, RedbTicketStoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TICKETS_TABLE)?;
        match table.get(domain)? {
            Some(bytes) => {
                let ticket: GoldenTicket = serde_json::from_slice(bytes.value())?;
                Ok(Some(ticket))
            }
            None => Ok(None),
        }
    }

    fn write_ticket(&self, ticket: &GoldenTicket) -> Result<(), RedbTicketStoreError> {
        let bytes = serde_json::to_vec(ticket)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TICKETS_TABLE)?;
            table.insert(ticket.domain.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl TicketStore for RedbTicketStore {
    async fn get(&self, domain: &str) -> Result<Option<GoldenTicket>, TicketStoreError> {
        let domain = domain.to_string();
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let store = RedbTicketStore { db };
            store.read_ticket(&domain)
        })
        .await
        .map_err(|err| TicketStoreError::Backend(err.to_string()))?
        .map_err(TicketStoreError::from)
        .map(|maybe| maybe.filter(|ticket| !ticket.is_expired()))
    }

    async fn put(&self, ticket: GoldenTicket) -> Result<(), TicketStoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let store = RedbTicketStore { db };
            store.write_ticket(&ticket) // overwrite semantics: redb insert replaces the prior value
        })
        .await
        .map_err(|err| TicketStoreError::Backend(err.to_string()))?
        .map_err(TicketStoreError::from)
    }

    async fn invalidate(&self, domain: &str) -> Result<(), TicketStoreError> {
        let domain = domain.to_string();
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RedbTicketStoreError> {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(TICKETS_TABLE)?;
                table.remove(domain.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .map_err(|err| TicketStoreError::Backend(err.to_string()))?
        .map_err(TicketStoreError::from)
    }

    async fn get_all_domains(&self) -> Result<Vec<String>, TicketStoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, RedbTicketStoreError> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(TICKETS_TABLE)?;
            let mut domains = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                domains.push(key.value().to_string());
            }
            Ok(domains)
        })
        .await
        .map_err(|err| TicketStoreError::Backend(err.to_string()))?
        .map_err(TicketStoreError::from)
    }

    async fn extend(&self, domain: &str, delta_seconds: i64, max_ttl: i64) -> Result<bool, TicketStoreError> {
        let domain = domain.to_string();
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<bool, RedbTicketStoreError> {
            let store = RedbTicketStore { db: db.clone() };
            match store.read_ticket(&domain)? {
                Some(mut ticket) => {
                    ticket.extend(delta_seconds, max_ttl);
                    store.write_ticket(&ticket)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
        .map_err(|err| TicketStoreError::Backend(err.to_string()))?
        .map_err(TicketStoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket_store::Cookie;

    fn temp_db_path() -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("titan-ticket-store-test-{}.redb", uuid::Uuid::new_v4()));
        path
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_disk() {
        let path = temp_db_path();
        let store = RedbTicketStore::open(&path).expect("open redb store");
        let ticket = GoldenTicket::new(
            "example.com",
            "https://example.com/",
            vec![Cookie::new("cf_clearance", "xyz", "example.com")],
            300,
            3600,
        );
        store.put(ticket).await.unwrap();
        let fetched = store.get("example.com").await.unwrap().unwrap();
        assert!(fetched.has_cloudflare_clearance());
        let _ = std::fs::remove_file(&path);
    }
}
