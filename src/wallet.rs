//! The external Bitcoin wallet oracle: a fallible synchronous interface the
//! core treats as a black box. `BitcoindWallet` talks to a real `bitcoind`
//! over its JSON-RPC interface; tests substitute `FakeWallet`.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use jsonrpc::minreq_http::{self, MinreqHttpTransport};
use jsonrpc::Client;
use serde::Deserialize;
use serde_json::value::RawValue;

/// Matches `lianad::bitcoin::d`'s retry/timeout posture: bitcoind under load
/// (e.g. rescanning) can take a while to answer.
const RPC_SOCKET_TIMEOUT: u64 = 30;
const RPC_RETRY_LIMIT: usize = 4;

#[derive(Debug)]
pub enum WalletError {
    Transport(jsonrpc::Error),
    MalformedAddress(String),
    MalformedSignature(String),
    Unavailable(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::Transport(e) => write!(f, "wallet rpc error: {}", e),
            WalletError::MalformedAddress(s) => write!(f, "invalid address: {}", s),
            WalletError::MalformedSignature(s) => write!(f, "malformed base64 encoding: {}", s),
            WalletError::Unavailable(s) => write!(f, "wallet unavailable: {}", s),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<jsonrpc::Error> for WalletError {
    fn from(e: jsonrpc::Error) -> Self {
        WalletError::Transport(e)
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedByAddress {
    pub address: String,
    pub amount_minor: i64,
}

/// The four operations the credential store, payment verifier, and vending
/// pool need from a Bitcoin wallet, per the protocol's external oracle
/// contract (§6).
pub trait Wallet: Send + Sync {
    /// `signMessage(addr, base64-hash) -> base64-sig`
    fn sign_message(&self, addr: &str, digest: &[u8; 32]) -> Result<String, WalletError>;
    /// `verifyMessage(addr, sig, base64-hash) -> bool`
    fn verify_message(&self, addr: &str, sig: &str, digest: &[u8; 32]) -> Result<bool, WalletError>;
    /// `listUnspent() -> [{address, amount}]`, restricted by the caller to
    /// the addresses it cares about.
    fn received_by_address(&self, min_conf: u32) -> Result<Vec<ReceivedByAddress>, WalletError>;
    /// `sendToAddress(addr, amount) -> txid`
    fn send_to_address(&self, addr: &str, amount_minor: i64) -> Result<String, WalletError>;
    /// `getNewAddress() -> addr`
    fn get_new_address(&self) -> Result<String, WalletError>;
}

pub struct BitcoindWallet {
    client: Client,
}

impl BitcoindWallet {
    pub fn new(addr: &str, cookie_path: Option<&std::path::Path>, user_pass: Option<(String, String)>) -> Result<Self, WalletError> {
        let url = format!("http://{}", addr);
        let mut builder = MinreqHttpTransport::builder()
            .url(&url)
            .map_err(|e| WalletError::Unavailable(e.to_string()))?
            .timeout(Duration::from_secs(RPC_SOCKET_TIMEOUT));
        if let Some(path) = cookie_path {
            builder = builder.cookie_auth(path);
        } else if let Some((user, pass)) = user_pass {
            builder = builder.auth(user, Some(pass));
        }
        let client = Client::with_transport(builder.build());
        Ok(BitcoindWallet { client })
    }

    fn call<T: for<'a> Deserialize<'a>>(
        &self,
        method: &str,
        params: &[Box<RawValue>],
    ) -> Result<T, WalletError> {
        let mut last_err = None;
        for _ in 0..RPC_RETRY_LIMIT {
            let request = self.client.build_request(method, params);
            match self.client.send_request(request) {
                Ok(response) => return response.result().map_err(WalletError::Transport),
                Err(e) => {
                    last_err = Some(e);
                    std::thread::sleep(Duration::from_millis(200));
                }
            }
        }
        Err(WalletError::Transport(last_err.expect("retry loop runs at least once")))
    }

    fn arg<T: serde::Serialize>(value: &T) -> Box<RawValue> {
        RawValue::from_string(serde_json::to_string(value).expect("value is serializable")).expect("valid json")
    }
}

impl Wallet for BitcoindWallet {
    fn sign_message(&self, addr: &str, digest: &[u8; 32]) -> Result<String, WalletError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
        self.call("signmessage", &[Self::arg(&addr), Self::arg(&encoded)])
    }

    fn verify_message(&self, addr: &str, sig: &str, digest: &[u8; 32]) -> Result<bool, WalletError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
        self.call(
            "verifymessage",
            &[Self::arg(&addr), Self::arg(&sig), Self::arg(&encoded)],
        )
    }

    fn received_by_address(&self, min_conf: u32) -> Result<Vec<ReceivedByAddress>, WalletError> {
        #[derive(Deserialize)]
        struct Row {
            address: String,
            amount: f64,
        }
        let rows: Vec<Row> = self.call(
            "listreceivedbyaddress",
            &[Self::arg(&min_conf), Self::arg(&false)],
        )?;
        Ok(rows
            .into_iter()
            .map(|r| ReceivedByAddress {
                address: r.address,
                amount_minor: (r.amount * 100_000_000.0).round() as i64,
            })
            .collect())
    }

    fn send_to_address(&self, addr: &str, amount_minor: i64) -> Result<String, WalletError> {
        let amount_btc = amount_minor as f64 / 100_000_000.0;
        self.call("sendtoaddress", &[Self::arg(&addr), Self::arg(&amount_btc)])
    }

    fn get_new_address(&self) -> Result<String, WalletError> {
        self.call("getnewaddress", &[])
    }
}

impl From<minreq_http::Error> for WalletError {
    fn from(e: minreq_http::Error) -> Self {
        WalletError::Unavailable(e.to_string())
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory stand-in wallet for tests, with deterministic
    /// signature verification so the admission pipeline can be exercised
    /// end to end without a live bitcoind (unavailable in this environment).
    pub struct FakeWallet {
        /// address -> (digest it was "signed" over) -> valid
        signatures: Mutex<HashMap<(String, [u8; 32]), String>>,
        received: Mutex<HashMap<String, i64>>,
        addresses: Mutex<Vec<String>>,
    }

    impl FakeWallet {
        pub fn new() -> Self {
            FakeWallet {
                signatures: Mutex::new(HashMap::new()),
                received: Mutex::new(HashMap::new()),
                addresses: Mutex::new(Vec::new()),
            }
        }

        pub fn attest(&self, addr: &str, digest: &[u8; 32]) -> String {
            let sig = format!("sig:{}:{}", addr, hex::encode(digest));
            self.signatures
                .lock()
                .unwrap()
                .insert((addr.to_string(), *digest), sig.clone());
            sig
        }

        pub fn credit(&self, addr: &str, amount_minor: i64) {
            *self.received.lock().unwrap().entry(addr.to_string()).or_insert(0) += amount_minor;
        }

        pub fn seed_addresses(&self, addrs: Vec<String>) {
            *self.addresses.lock().unwrap() = addrs;
        }
    }

    impl Wallet for FakeWallet {
        fn sign_message(&self, addr: &str, digest: &[u8; 32]) -> Result<String, WalletError> {
            Ok(self.attest(addr, digest))
        }

        fn verify_message(&self, addr: &str, sig: &str, digest: &[u8; 32]) -> Result<bool, WalletError> {
            let expected = self
                .signatures
                .lock()
                .unwrap()
                .get(&(addr.to_string(), *digest))
                .cloned();
            Ok(expected.as_deref() == Some(sig))
        }

        fn received_by_address(&self, _min_conf: u32) -> Result<Vec<ReceivedByAddress>, WalletError> {
            Ok(self
                .received
                .lock()
                .unwrap()
                .iter()
                .map(|(addr, amount)| ReceivedByAddress {
                    address: addr.clone(),
                    amount_minor: *amount,
                })
                .collect())
        }

        fn send_to_address(&self, addr: &str, amount_minor: i64) -> Result<String, WalletError> {
            self.credit(addr, amount_minor);
            Ok(format!("txid:{}:{}", addr, amount_minor))
        }

        fn get_new_address(&self) -> Result<String, WalletError> {
            let mut addrs = self.addresses.lock().unwrap();
            if let Some(addr) = addrs.pop() {
                return Ok(addr);
            }
            Ok(format!("addr{}", addrs.len()))
        }
    }
}
