//! Per-peer payment-address vending: keeps a rotating pool of addresses
//! the server generated specifically to receive payment from one peer, so
//! the payment verifier can attribute on-chain receipts without trusting
//! the peer's say-so.

use std::fmt;
use std::sync::Mutex;

use rand_core::{OsRng, RngCore};
use rusqlite::{params, Connection};

use crate::wallet::Wallet;

pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Debug)]
pub enum VendingError {
    Wallet(crate::wallet::WalletError),
    Unexpected(String),
}

impl fmt::Display for VendingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VendingError::Wallet(e) => write!(f, "wallet error vending addresses: {}", e),
            VendingError::Unexpected(s) => write!(f, "unexpected error vending addresses: {}", s),
        }
    }
}

impl std::error::Error for VendingError {}

impl From<crate::wallet::WalletError> for VendingError {
    fn from(e: crate::wallet::WalletError) -> Self {
        VendingError::Wallet(e)
    }
}

impl From<rusqlite::Error> for VendingError {
    fn from(e: rusqlite::Error) -> Self {
        VendingError::Unexpected(e.to_string())
    }
}

pub struct VendingPool {
    conn: Mutex<Connection>,
    pool_size: usize,
}

impl VendingPool {
    pub fn new(conn: Connection, pool_size: usize) -> Self {
        VendingPool {
            conn: Mutex::new(conn),
            pool_size,
        }
    }

    /// All addresses ever vended to `node_id`, creating the pool from the
    /// wallet on first use. The create path is idempotent under races: the
    /// pool read and the lazy-create both happen under the same connection
    /// lock, so two callers for the same peer simply serialize.
    pub fn addresses_for(
        &self,
        wallet: &dyn Wallet,
        node_id: &str,
    ) -> Result<Vec<String>, VendingError> {
        let mut conn = self.conn.lock().expect("vending pool lock poisoned");
        let existing: Vec<String> = crate::db::db_query::<_, _, _, VendingError>(
            &conn,
            "SELECT address FROM vended_addresses WHERE node_id = ?1",
            params![node_id],
            |row| row.get(0),
        )?;
        if !existing.is_empty() {
            return Ok(existing);
        }

        let mut fresh = Vec::with_capacity(self.pool_size);
        for _ in 0..self.pool_size {
            fresh.push(wallet.get_new_address()?);
        }
        crate::db::db_exec(&mut conn, |tx| -> Result<(), VendingError> {
            for addr in &fresh {
                tx.execute(
                    "INSERT OR IGNORE INTO vended_addresses (node_id, address) VALUES (?1, ?2)",
                    params![node_id, addr],
                )?;
            }
            Ok(())
        })?;
        Ok(fresh)
    }

    /// Vend a uniformly random address from `node_id`'s pool, lazily
    /// creating the pool if this is the peer's first request.
    pub fn payment_addr(&self, wallet: &dyn Wallet, node_id: &str) -> Result<String, VendingError> {
        let addrs = self.addresses_for(wallet, node_id)?;
        let idx = (OsRng.next_u32() as usize) % addrs.len();
        Ok(addrs[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::fake::FakeWallet;

    #[test]
    fn lazily_creates_pool_once() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::db::SCHEMA).unwrap();
        let pool = VendingPool::new(conn, 3);
        let wallet = FakeWallet::new();
        wallet.seed_addresses(vec!["a1".into(), "a2".into(), "a3".into()]);

        let first = pool.addresses_for(&wallet, "c1").unwrap();
        assert_eq!(first.len(), 3);

        // A second read must not mint new addresses.
        let second = pool.addresses_for(&wallet, "c1").unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(
            first.iter().collect::<std::collections::HashSet<_>>(),
            second.iter().collect::<std::collections::HashSet<_>>()
        );
    }

    #[test]
    fn random_pick_comes_from_the_pool() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::db::SCHEMA).unwrap();
        let pool = VendingPool::new(conn, 2);
        let wallet = FakeWallet::new();
        wallet.seed_addresses(vec!["a1".into(), "a2".into()]);

        let addrs = pool.addresses_for(&wallet, "c1").unwrap();
        let picked = pool.payment_addr(&wallet, "c1").unwrap();
        assert!(addrs.contains(&picked));
    }
}
