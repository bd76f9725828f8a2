//! Deriving a verified `Peer` from an incoming request, and the durable
//! coin-to-identity binding store that enforces the coin-reuse invariant.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::ident::{self, NodeId};
use crate::msg::OcReq;
use crate::wallet::Wallet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub coins: HashSet<String>,
}

#[derive(Debug)]
pub enum PeerError {
    InvalidSignature,
    CoinReuse(String),
    Unexpected(String),
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PeerError::InvalidSignature => write!(f, "invalid signature"),
            PeerError::CoinReuse(coin) => write!(f, "coin {} is bound to another identity", coin),
            PeerError::Unexpected(s) => write!(f, "unexpected error deriving peer: {}", s),
        }
    }
}

impl std::error::Error for PeerError {}

impl From<rusqlite::Error> for PeerError {
    fn from(e: rusqlite::Error) -> Self {
        PeerError::Unexpected(e.to_string())
    }
}

/// Durable coin -> identity binding store, backed by one shared connection:
/// every check-and-set goes through the connection's mutex, which is the
/// global lock spec §5 explicitly allows to close the TOCTOU hole in the
/// original check-then-write.
pub struct PeerRegistry {
    conn: Mutex<Connection>,
}

impl PeerRegistry {
    pub fn new(conn: Connection) -> Self {
        PeerRegistry {
            conn: Mutex::new(conn),
        }
    }

    /// The single entry point: verify the request's full signature set,
    /// then bind any attested coins, atomically and all-or-nothing.
    pub fn peer_from_request(
        &self,
        wallet: &dyn Wallet,
        req: &OcReq,
    ) -> Result<Peer, PeerError> {
        self.verify_signatures(wallet, req)?;

        let coins = req.unique_coins();
        let mut guard = self
            .conn
            .lock()
            .expect("coin-binding connection lock poisoned by a prior panic");

        crate::db::db_exec(&mut guard, |tx| -> Result<(), PeerError> {
            for coin in &coins {
                let bound_id: Option<String> = crate::db::db_query_row::<_, _, _, PeerError>(
                    tx,
                    "SELECT node_id FROM coin_bindings WHERE coin = ?1",
                    params![coin],
                    |row| row.get(0),
                )?;
                match bound_id {
                    Some(bound) if bound != req.id => {
                        // Returning here rolls the transaction back: a
                        // colliding coin rejects the whole request, no
                        // partial binding.
                        return Err(PeerError::CoinReuse(coin.clone()));
                    }
                    Some(_) => {}
                    None => {
                        tx.execute(
                            "INSERT INTO coin_bindings (coin, node_id) VALUES (?1, ?2)",
                            params![coin, req.id],
                        )?;
                    }
                }
            }
            Ok(())
        })?;

        Ok(Peer {
            id: NodeId(req.id.clone()),
            coins: coins.into_iter().collect(),
        })
    }

    fn verify_signatures(&self, wallet: &dyn Wallet, req: &OcReq) -> Result<(), PeerError> {
        if req.coins.len() != req.coin_sigs.len() {
            return Err(PeerError::InvalidSignature);
        }
        let digest = req.digest();

        let id_ok = ident::verify_prehash(&req.id, &req.sig, &digest)
            .map_err(|_| PeerError::InvalidSignature)?;
        if !id_ok {
            return Err(PeerError::InvalidSignature);
        }

        for (coin, sig) in req.coins.iter().zip(req.coin_sigs.iter()) {
            match wallet.verify_message(coin, sig, &digest) {
                Ok(true) => {}
                Ok(false) => return Err(PeerError::InvalidSignature),
                Err(e) => return Err(PeerError::Unexpected(e.to_string())),
            }
        }
        Ok(())
    }
}
