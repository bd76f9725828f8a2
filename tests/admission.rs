//! End-to-end admission pipeline scenarios, driven over a real `TcpStream`
//! against a `Core` wired with an in-memory wallet stand-in (no live
//! `bitcoind` is reachable from this environment).

use std::collections::HashMap;
use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use oc::config::{BitcoindConfig, BitcoindRpcAuth, Config};
use oc::datadir::DataDirectory;
use oc::dispatch::{CalcHandler, Registry};
use oc::ident::Credential;
use oc::money::Money;
use oc::msg::{self, status, OcReq, PaymentType};
use oc::policy::{Cmd, Policy, Selector};
use oc::wallet::{ReceivedByAddress, Wallet, WalletError};
use oc::Core;

/// A minimal in-memory wallet oracle: deterministic signature "verification"
/// keyed by (address, digest), and an address-indexed receipt ledger a test
/// can credit directly to simulate on-chain settlement.
struct TestWallet {
    signatures: Mutex<HashMap<(String, [u8; 32]), String>>,
    received: Mutex<HashMap<String, i64>>,
    addresses: Mutex<Vec<String>>,
}

impl TestWallet {
    fn new() -> Self {
        TestWallet {
            signatures: Mutex::new(HashMap::new()),
            received: Mutex::new(HashMap::new()),
            addresses: Mutex::new(Vec::new()),
        }
    }

    fn attest(&self, addr: &str, digest: &[u8; 32]) -> String {
        let sig = format!("sig:{}:{}", addr, hex::encode(digest));
        self.signatures
            .lock()
            .unwrap()
            .insert((addr.to_string(), *digest), sig.clone());
        sig
    }

    fn credit(&self, addr: &str, amount_minor: i64) {
        *self.received.lock().unwrap().entry(addr.to_string()).or_insert(0) += amount_minor;
    }

    fn seed_addresses(&self, addrs: Vec<String>) {
        *self.addresses.lock().unwrap() = addrs;
    }
}

impl Wallet for TestWallet {
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

fn start_server(
    tmp: &std::path::Path,
    policies: Vec<Policy>,
    wallet: Arc<dyn Wallet>,
) -> (std::net::SocketAddr, Arc<AtomicBool>, thread::JoinHandle<()>) {
    let data_dir = DataDirectory::new(tmp.to_path_buf());
    let config = Config {
        data_dir: Some(tmp.to_path_buf()),
        log_level: log::LevelFilter::Off,
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        vending_pool_size: 2,
        max_balance: None,
        accounting_interval_secs: 10,
        accounting_tick_secs: 3600,
        min_confirmations: 0,
        bitcoind: BitcoindConfig {
            rpc_auth: BitcoindRpcAuth::CookieFile("/dev/null".into()),
            addr: "127.0.0.1:1".parse().unwrap(),
        },
        policies: Vec::new(),
    };

    let core = Core::new(config, &data_dir, Some(wallet), |registry: Registry, _vending, _wallet| {
        registry.register("calc", Box::new(CalcHandler))
    })
    .unwrap();
    let mut core = core;
    core.policies = policies;
    let core = Arc::new(core);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let server_core = core.clone();
    let server_shutdown = shutdown.clone();
    let handle = thread::spawn(move || oc::pipeline::serve(server_core, listener, server_shutdown));
    thread::sleep(Duration::from_millis(100));
    (addr, shutdown, handle)
}

fn signed_request(cred: &Credential, service: &str, method: &str, args: Vec<&str>) -> OcReq {
    let mut req = OcReq {
        service: service.into(),
        method: method.into(),
        args: args.into_iter().map(String::from).collect(),
        nonce: "n1".into(),
        ..Default::default()
    };
    let digest = req.digest();
    req.id = cred.node_id().0.clone();
    req.sig = cred.sign_prehash_encoded(&digest);
    req
}

fn roundtrip(addr: std::net::SocketAddr, req: &OcReq) -> oc::msg::OcResp {
    let mut stream = TcpStream::connect(addr).unwrap();
    msg::write_request(&mut stream, req).unwrap();
    let mut reader = BufReader::new(stream);
    msg::read_response(&mut reader).unwrap()
}

#[test]
fn happy_path_calculator_with_no_policies() {
    let tmp = tempfile::tempdir().unwrap();
    let wallet: Arc<dyn Wallet> = Arc::new(TestWallet::new());
    let (addr, shutdown, handle) = start_server(tmp.path(), Vec::new(), wallet);

    let cred = Credential::init_or_load(&tmp.path().join("client")).unwrap();
    let req = signed_request(&cred, "calc", "calc", vec!["1 2 +"]);
    let resp = roundtrip(addr, &req);

    assert_eq!(resp.status, status::OK);
    assert_eq!(resp.body, b"3");

    shutdown.store(true, Ordering::Relaxed);
    let _ = handle.join();
}

#[test]
fn payment_required_without_min_fee_met() {
    let tmp = tempfile::tempdir().unwrap();
    let wallet: Arc<dyn Wallet> = Arc::new(TestWallet::new());
    let policies = vec![Policy {
        selector: Selector {
            service: Some("calc".into()),
            method: Some("calc".into()),
        },
        cmd: Cmd::MinFee(Money::parse("1 BTC").unwrap()),
    }];
    let (addr, shutdown, handle) = start_server(tmp.path(), policies, wallet);

    let cred = Credential::init_or_load(&tmp.path().join("client")).unwrap();
    let req = signed_request(&cred, "calc", "calc", vec!["1 2 +"]);
    let resp = roundtrip(addr, &req);

    assert_eq!(resp.status, status::REQUEST_DECLINED_PAYMENT_REQUIRED);

    shutdown.store(true, Ordering::Relaxed);
    let _ = handle.join();
}

#[test]
fn payment_too_low_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let wallet: Arc<dyn Wallet> = Arc::new(TestWallet::new());
    let policies = vec![Policy {
        selector: Selector::default(),
        cmd: Cmd::MinFee(Money::parse("1 BTC").unwrap()),
    }];
    let (addr, shutdown, handle) = start_server(tmp.path(), policies, wallet);

    let cred = Credential::init_or_load(&tmp.path().join("client")).unwrap();
    let mut req = signed_request(&cred, "calc", "calc", vec!["1 2 +"]);
    req.payment_type = PaymentType::Attached;
    req.payment_value = Some(Money::parse("0.5 BTC").unwrap());
    let digest = req.digest();
    req.sig = cred.sign_prehash_encoded(&digest);
    let resp = roundtrip(addr, &req);

    assert_eq!(resp.status, status::REQUEST_DECLINED_PAYMENT_TOO_LOW);

    shutdown.store(true, Ordering::Relaxed);
    let _ = handle.join();
}

#[test]
fn second_identity_reusing_a_bound_coin_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let wallet = Arc::new(TestWallet::new());
    let wallet_dyn: Arc<dyn Wallet> = wallet.clone();
    let (addr, shutdown, handle) = start_server(tmp.path(), Vec::new(), wallet_dyn);

    let alice = Credential::init_or_load(&tmp.path().join("alice")).unwrap();
    let bob = Credential::init_or_load(&tmp.path().join("bob")).unwrap();

    let mut req1 = signed_request(&alice, "calc", "calc", vec!["1 2 +"]);
    req1.coins = vec!["coin-X".into()];
    let digest1 = req1.digest();
    req1.coin_sigs = vec![wallet.attest("coin-X", &digest1)];
    req1.sig = alice.sign_prehash_encoded(&digest1);
    let resp1 = roundtrip(addr, &req1);
    assert_eq!(resp1.status, status::OK);

    let mut req2 = signed_request(&bob, "calc", "calc", vec!["1 2 +"]);
    req2.coins = vec!["coin-X".into()];
    let digest2 = req2.digest();
    req2.coin_sigs = vec![wallet.attest("coin-X", &digest2)];
    req2.sig = bob.sign_prehash_encoded(&digest2);
    let resp2 = roundtrip(addr, &req2);
    assert_eq!(resp2.status, status::CLIENT_ERROR_INVALID_SIGNATURE);
    assert!(String::from_utf8_lossy(&resp2.body).contains("coin-reuse"));

    shutdown.store(true, Ordering::Relaxed);
    let _ = handle.join();
}

#[test]
fn max_balance_trips_please_pay_then_clears_after_settlement() {
    let tmp = tempfile::tempdir().unwrap();
    let wallet = Arc::new(TestWallet::new());
    wallet.seed_addresses(vec!["vend-addr".into()]);
    let wallet_dyn: Arc<dyn Wallet> = wallet.clone();
    let policies = vec![Policy {
        selector: Selector::default(),
        cmd: Cmd::MaxBalance(Money::parse("0.03 BTC").unwrap()),
    }];
    let (addr, shutdown, handle) = start_server(tmp.path(), policies, wallet_dyn);

    let cred = Credential::init_or_load(&tmp.path().join("client")).unwrap();

    // Four deferred requests at 0.01 BTC each leave consumed at 0.04 BTC,
    // strictly over the 0.03 BTC limit once the next request is evaluated
    // (balancing reads consumed from records already committed, not this
    // request's own not-yet-appended one).
    for i in 0..4 {
        let mut req = signed_request(&cred, "calc", "calc", vec!["1 2 +"]);
        req.nonce = format!("n{}", i);
        req.payment_type = PaymentType::Defer;
        req.payment_value = Some(Money::parse("0.01 BTC").unwrap());
        let digest = req.digest();
        req.sig = cred.sign_prehash_encoded(&digest);
        let resp = roundtrip(addr, &req);
        assert_eq!(resp.status, status::OK, "iteration {}", i);
    }

    let mut over_req = signed_request(&cred, "calc", "calc", vec!["1 2 +"]);
    over_req.nonce = "n-over".into();
    over_req.payment_type = PaymentType::Defer;
    over_req.payment_value = Some(Money::parse("0.01 BTC").unwrap());
    let digest = over_req.digest();
    over_req.sig = cred.sign_prehash_encoded(&digest);
    let resp = roundtrip(addr, &over_req);
    assert_eq!(resp.status, status::REQUEST_DECLINED_PLEASE_PAY);

    let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    let pay_addr = body["addr"].as_str().unwrap().to_string();

    // Settle: credit the vended address with enough to clear the balance.
    wallet.credit(&pay_addr, Money::parse("0.1 BTC").unwrap().amount);

    let mut retry_req = signed_request(&cred, "calc", "calc", vec!["1 2 +"]);
    retry_req.nonce = "n-retry".into();
    retry_req.payment_type = PaymentType::Defer;
    retry_req.payment_value = Some(Money::parse("0.01 BTC").unwrap());
    let digest = retry_req.digest();
    retry_req.sig = cred.sign_prehash_encoded(&digest);
    let resp = roundtrip(addr, &retry_req);
    assert_eq!(resp.status, status::OK);

    shutdown.store(true, Ordering::Relaxed);
    let _ = handle.join();
}
