//! The periodic accounting sweep: a single timer-driven thread that walks
//! every peer holding time-billed resources and appends a `success-unpaid`
//! debit, turning long-lived storage into a stream of tiny charges the
//! payment verifier can reconcile. Shaped directly on a poll-forever loop
//! waking on `recv_timeout` with a cooperative shutdown message.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::ledger::{Ledger, Record, RecordStatus, Role};
use crate::money::{Currency, Money};
use crate::msg::PaymentType;

#[derive(Debug, Clone)]
pub struct Billable {
    pub service: String,
    pub method: String,
    pub rate_per_sec: i64,
    pub resource_amount: i64,
    pub currency: Currency,
}

/// Tracks which peers currently hold a resource billed by elapsed time.
/// Registration/removal happens from connection-handling threads; the sweep
/// reads it once per tick.
#[derive(Default)]
pub struct BillingRegistry {
    billables: Mutex<HashMap<String, Billable>>,
}

impl BillingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, billable: Billable) {
        self.billables
            .lock()
            .expect("billing registry lock poisoned")
            .insert(node_id.to_string(), billable);
    }

    pub fn unregister(&self, node_id: &str) {
        self.billables
            .lock()
            .expect("billing registry lock poisoned")
            .remove(node_id);
    }

    fn snapshot(&self) -> Vec<(String, Billable)> {
        self.billables
            .lock()
            .expect("billing registry lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

pub enum AccountingMessage {
    Shutdown,
}

/// Runs until a `Shutdown` message is received. `tick` is the wake-up
/// granularity (default 1s); `elapsed` passed to the rate multiplication is
/// always the real time since the previous tick, not a fixed constant, so a
/// delayed wakeup (GC pause, loaded host) still bills the correct amount.
pub fn run(
    ledger: Arc<Ledger>,
    billing: Arc<BillingRegistry>,
    tick: Duration,
    receiver: mpsc::Receiver<AccountingMessage>,
) {
    let mut last_tick = Instant::now();
    loop {
        match receiver.recv_timeout(tick) {
            Ok(AccountingMessage::Shutdown) => return,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let now = Instant::now();
                let elapsed = now.duration_since(last_tick);
                last_tick = now;
                sweep(&ledger, &billing, elapsed);
            }
        }
    }
}

fn sweep(ledger: &Ledger, billing: &BillingRegistry, elapsed: Duration) {
    let elapsed_secs = elapsed.as_secs_f64();
    for (node_id, billable) in billing.snapshot() {
        let amount = (billable.rate_per_sec as f64 * billable.resource_amount as f64 * elapsed_secs)
            .round() as i64;
        if amount == 0 {
            continue;
        }
        let record = Record {
            role: Role::Server,
            service: billable.service,
            method: billable.method,
            timestamp: crate::db::curr_timestamp(),
            node_id,
            status: RecordStatus::SuccessUnpaid,
            payment_type: PaymentType::Defer,
            payment_value: Money {
                amount,
                currency: billable.currency,
            },
            perf: None,
        };
        if let Err(e) = ledger.put(&record) {
            log::error!("periodic accounting: failed to append ledger record: {}", e);
        }
    }
}
