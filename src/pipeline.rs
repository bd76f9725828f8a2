//! The server-side admission pipeline: one OS thread per accepted
//! connection runs the linear state machine `Framing -> Verifying ->
//! Binding -> Balancing -> Policing -> Dispatching -> Accounting ->
//! Responding -> Closed`. The accept loop itself tolerates individual
//! connection panics; it never stops serving because one handler misbehaved.

use std::io::BufReader;
use std::net::{TcpListener, TcpStream};
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::db::curr_timestamp;
use crate::dispatch::HandlerError;
use crate::ledger::{Record, RecordStatus, Role};
use crate::money::{Currency, Money};
use crate::msg::{self, status, FrameError, OcReq, OcResp, PaymentType};
use crate::peer::{Peer, PeerError};
use crate::policy::{self, Verdict};
use crate::Core;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Accept connections until `shutdown` is set. Uses a non-blocking listener
/// polled at a short interval rather than a blocking `accept()` so the loop
/// can observe the shutdown flag without an extra wakeup channel.
pub fn serve(core: Arc<Core>, listener: TcpListener, shutdown: Arc<AtomicBool>) {
    listener
        .set_nonblocking(true)
        .expect("setting a freshly bound listener non-blocking cannot fail");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, addr)) => {
                let core = core.clone();
                let builder = thread::Builder::new().name(format!("oc-conn-{}", addr));
                if let Err(e) = builder.spawn(move || {
                    let result = panic::catch_unwind(panic::AssertUnwindSafe(|| {
                        handle_connection(&core, stream)
                    }));
                    if result.is_err() {
                        log::error!("connection handler panicked; accept loop continues");
                    }
                }) {
                    log::error!("failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("accept() failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn sign_response(core: &Core, mut resp: OcResp) -> OcResp {
    resp.id = core.credential.node_id().0.clone();
    let mut hasher = Sha256::new();
    hasher.update(resp.nonce.as_bytes());
    hasher.update(resp.status.as_bytes());
    hasher.update(&resp.body);
    let digest: [u8; 32] = hasher.finalize().into();
    resp.sig = core.credential.sign_prehash_encoded(&digest);
    resp
}

fn respond(core: &Core, stream: &mut TcpStream, status: &str, body: Vec<u8>) {
    let resp = sign_response(core, OcResp::new(status, body));
    if let Err(e) = msg::write_response(stream, &resp) {
        log::error!("failed to write response: {}", e);
    }
}

fn handle_connection(core: &Core, mut stream: TcpStream) {
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        log::error!("failed to set read timeout: {}", e);
        return;
    }

    // Framing.
    let req = {
        let mut reader = BufReader::new(stream.try_clone().expect("cloning a live socket cannot fail"));
        match msg::read_request(&mut reader) {
            Ok(req) => req,
            Err(e) => {
                log_frame_error(&e);
                respond(core, &mut stream, status::CLIENT_ERROR_BAD_REQUEST, Vec::new());
                return;
            }
        }
    };

    // Verifying + Binding.
    let peer = match core.peers.peer_from_request(core.wallet.as_ref(), &req) {
        Ok(peer) => peer,
        Err(PeerError::InvalidSignature) => {
            respond(core, &mut stream, status::CLIENT_ERROR_INVALID_SIGNATURE, Vec::new());
            return;
        }
        Err(PeerError::CoinReuse(coin)) => {
            respond(
                core,
                &mut stream,
                status::CLIENT_ERROR_INVALID_SIGNATURE,
                format!("coin-reuse: {}", coin).into_bytes(),
            );
            return;
        }
        Err(PeerError::Unexpected(e)) => {
            log::error!("unexpected error deriving peer: {}", e);
            respond(core, &mut stream, status::SERVER_ERROR, Vec::new());
            return;
        }
    };

    // Balancing.
    let consumed = match core.ledger.payment_value_served_to_id(&peer.id.0) {
        Ok(v) => v,
        Err(e) => {
            log::error!("ledger error computing consumed amount: {}", e);
            respond(core, &mut stream, status::SERVER_ERROR, Vec::new());
            return;
        }
    };
    let paid = match paid_amount(core, &peer.id.0) {
        Ok(v) => v,
        Err(e) => {
            log::error!("wallet error computing paid amount: {}", e);
            respond(core, &mut stream, status::SERVER_ERROR, Vec::new());
            return;
        }
    };

    // Policing. The operator-wide `max_balance` cap, if configured, is
    // checked ahead of any per-route policy — same priority `evaluate`
    // itself gives `Cmd::MaxBalance` — so a deployment relying solely on
    // the global config cap (no `[[policy]] cmd = "max-balance"` entry)
    // still gets it enforced.
    let verdict = global_balance_verdict(core, &peer, consumed, paid).unwrap_or_else(|| {
        policy::evaluate(
            &core.policies,
            &req,
            consumed,
            paid,
            || coin_balance(core, &peer).ok(),
            |_spec| true, // max-work is handler-specific; no handler in this crate declares one.
            || core.vending.payment_addr(core.wallet.as_ref(), &peer.id.0).ok(),
        )
    });
    match verdict {
        Verdict::Deny(status) => {
            respond(core, &mut stream, status, Vec::new());
            return;
        }
        Verdict::PayPlease { amount, addr } => {
            let body = serde_json::json!({
                "amount": amount.amount,
                "currency": amount.currency.to_string(),
                "addr": addr,
            });
            respond(
                core,
                &mut stream,
                status::REQUEST_DECLINED_PLEASE_PAY,
                serde_json::to_vec(&body).expect("json object always serializes"),
            );
            return;
        }
        Verdict::Allow => {}
    }

    // Dispatching.
    let handler = match core.dispatch.get(&req.service) {
        Some(h) => h,
        None => {
            respond(core, &mut stream, status::CLIENT_ERROR_SERVICE_UNSUPPORTED, Vec::new());
            return;
        }
    };
    let dispatch_result = handler.handle(&peer, &req);

    match &dispatch_result {
        Ok(resp) => {
            // Accounting.
            let record_status = accounting_status(req.payment_type);
            let record = Record {
                role: Role::Server,
                service: req.service.clone(),
                method: req.method.clone(),
                timestamp: curr_timestamp(),
                node_id: peer.id.0.clone(),
                status: record_status,
                payment_type: req.payment_type,
                payment_value: req.payment_value.unwrap_or(Money {
                    amount: 0,
                    currency: Currency::Btc,
                }),
                perf: None,
            };
            if let Err(e) = core.ledger.put(&record) {
                log::error!("failed to append ledger record: {}", e);
            }
            // Responding.
            respond(core, &mut stream, &resp.status, resp.body.clone());
        }
        Err(HandlerError::UnknownMethod) => {
            respond(core, &mut stream, status::CLIENT_ERROR_METHOD_UNSUPPORTED, Vec::new());
        }
        Err(HandlerError::InvalidArguments(msg)) => {
            respond(
                core,
                &mut stream,
                status::CLIENT_ERROR_INVALID_ARGUMENTS,
                msg.clone().into_bytes(),
            );
        }
        Err(HandlerError::Internal(e)) => {
            log::error!("handler internal error: {}", e);
            respond(core, &mut stream, status::SERVER_ERROR, Vec::new());
        }
    }
}

/// `success-paid` if the client attached or referenced a payment,
/// `success-unpaid` if it deferred, `failure` otherwise — billability, not
/// correctness of the computation the handler performed.
fn accounting_status(payment_type: PaymentType) -> RecordStatus {
    match payment_type {
        PaymentType::Attached | PaymentType::Txid => RecordStatus::SuccessPaid,
        PaymentType::Defer => RecordStatus::SuccessUnpaid,
        PaymentType::None => RecordStatus::Failure,
    }
}

/// The operator-wide balance cap from configuration, checked ahead of any
/// per-route policy, mirroring `Cmd::MaxBalance`'s own priority inside
/// `policy::evaluate`. Returns `None` when no cap is configured or the
/// peer's unsettled balance is within it, leaving normal policing to decide.
fn global_balance_verdict(core: &Core, peer: &Peer, consumed: Money, paid: Money) -> Option<Verdict> {
    let limit = core.config.max_balance?;
    let over = consumed.checked_sub(&paid)?;
    if over.currency != limit.currency || over.amount <= limit.amount {
        return None;
    }
    Some(
        match core.vending.payment_addr(core.wallet.as_ref(), &peer.id.0).ok() {
            Some(addr) => Verdict::PayPlease { amount: over, addr },
            None => Verdict::Deny(status::SERVER_ERROR),
        },
    )
}

fn paid_amount(core: &Core, node_id: &str) -> Result<Money, crate::wallet::WalletError> {
    let addrs = core
        .vending
        .addresses_for(core.wallet.as_ref(), node_id)
        .map_err(|e| crate::wallet::WalletError::Unavailable(e.to_string()))?;
    let received = core.wallet.received_by_address(core.config.min_confirmations)?;
    let total = received
        .iter()
        .filter(|r| addrs.contains(&r.address))
        .map(|r| r.amount_minor)
        .sum();
    Ok(Money {
        amount: total,
        currency: Currency::Btc,
    })
}

fn coin_balance(core: &Core, peer: &Peer) -> Result<Money, crate::wallet::WalletError> {
    let received = core.wallet.received_by_address(core.config.min_confirmations)?;
    let total = received
        .iter()
        .filter(|r| peer.coins.contains(&r.address))
        .map(|r| r.amount_minor)
        .sum();
    Ok(Money {
        amount: total,
        currency: Currency::Btc,
    })
}

fn log_frame_error(e: &FrameError) {
    match e {
        FrameError::Eof => log::debug!("connection closed before a full header was read"),
        other => log::warn!("frame error: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BitcoindConfig, BitcoindRpcAuth, Config};
    use crate::datadir::DataDirectory;
    use crate::dispatch::{CalcHandler, Registry};
    use crate::ident::Credential;
    use crate::wallet::fake::FakeWallet;
    use std::net::TcpListener as StdTcpListener;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn test_core(tmp: &std::path::Path) -> Arc<Core> {
        let data_dir = DataDirectory::new(tmp.to_path_buf());
        let config = Config {
            data_dir: Some(tmp.to_path_buf()),
            log_level: log::LevelFilter::Off,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            vending_pool_size: 2,
            max_balance: None,
            accounting_interval_secs: 10,
            accounting_tick_secs: 1,
            min_confirmations: 1,
            bitcoind: BitcoindConfig {
                rpc_auth: BitcoindRpcAuth::CookieFile("/dev/null".into()),
                addr: "127.0.0.1:1".parse().unwrap(),
            },
            policies: Vec::new(),
        };
        let wallet: Arc<dyn crate::wallet::Wallet> = Arc::new(FakeWallet::new());
        let core = Core::new(config, &data_dir, Some(wallet), |registry, _vending, _wallet| {
            registry.register("calc", Box::new(CalcHandler))
        })
        .unwrap();
        Arc::new(core)
    }

    #[test]
    fn happy_path_calculator() {
        let tmp = tempfile::tempdir().unwrap();
        let core = test_core(tmp.path());

        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let server_core = core.clone();
        let server_shutdown = shutdown.clone();
        let handle = thread::spawn(move || serve(server_core, listener, server_shutdown));

        // Give the accept loop a moment to start polling.
        thread::sleep(Duration::from_millis(100));

        let client_cred = Credential::init_or_load(&tmp.path().join("client-key")).unwrap();
        let mut req = OcReq {
            service: "calc".into(),
            method: "calc".into(),
            args: vec!["1 2 +".into()],
            ..Default::default()
        };
        let digest = req.digest();
        req.id = client_cred.node_id().0.clone();
        req.sig = client_cred.sign_prehash_encoded(&digest);

        let mut stream = TcpStream::connect(addr).unwrap();
        msg::write_request(&mut stream, &req).unwrap();
        let mut reader = BufReader::new(stream);
        let resp = msg::read_response(&mut reader).unwrap();

        assert_eq!(resp.status, status::OK);
        assert_eq!(resp.body, b"3");

        shutdown.store(true, Ordering::Relaxed);
        let _ = handle.join();
    }
}
