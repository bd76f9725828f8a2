//! The append-only per-request accounting ledger: `put` appends, `reduce`
//! folds over a field-prefix selector, and a handful of derived queries
//! (`success_rate`, `paid_rate`, `payment_value_served_to_id`) answer the
//! questions admission and settlement actually ask.

use std::fmt;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::money::{Currency, Money};
use crate::msg::PaymentType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn wire_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    fn parse(s: &str) -> Role {
        match s {
            "client" => Role::Client,
            _ => Role::Server,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Pending,
    SuccessUnpaid,
    SuccessPaid,
    Failure,
}

impl RecordStatus {
    fn wire_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::SuccessUnpaid => "success-unpaid",
            RecordStatus::SuccessPaid => "success-paid",
            RecordStatus::Failure => "failure",
        }
    }

    fn parse(s: &str) -> RecordStatus {
        match s {
            "success-unpaid" => RecordStatus::SuccessUnpaid,
            "success-paid" => RecordStatus::SuccessPaid,
            "failure" => RecordStatus::Failure,
            _ => RecordStatus::Pending,
        }
    }

    fn is_terminal(&self) -> bool {
        !matches!(self, RecordStatus::Pending)
    }

    fn is_success(&self) -> bool {
        matches!(self, RecordStatus::SuccessUnpaid | RecordStatus::SuccessPaid)
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub role: Role,
    pub service: String,
    pub method: String,
    pub timestamp: u32,
    pub node_id: String,
    pub status: RecordStatus,
    pub payment_type: PaymentType,
    pub payment_value: Money,
    pub perf: Option<serde_json::Value>,
}

/// A (possibly empty) selector prefix over which `reduce` and the derived
/// queries operate. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    pub role: Option<Role>,
    pub service: Option<String>,
    pub method: Option<String>,
    pub node_id: Option<String>,
}

#[derive(Debug)]
pub enum LedgerError {
    Unexpected(String),
    CurrencyMismatch,
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LedgerError::Unexpected(s) => write!(f, "ledger error: {}", s),
            LedgerError::CurrencyMismatch => {
                write!(f, "cannot aggregate payment values across currencies")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Unexpected(e.to_string())
    }
}

pub struct Ledger {
    conn: Mutex<Connection>,
}

fn push_selector(selector: &Selector, clauses: &mut Vec<String>, binds: &mut Vec<String>) {
    if let Some(role) = selector.role {
        clauses.push(format!("role = ?{}", binds.len() + 1));
        binds.push(role.wire_str().to_string());
    }
    if let Some(service) = &selector.service {
        clauses.push(format!("service = ?{}", binds.len() + 1));
        binds.push(service.clone());
    }
    if let Some(method) = &selector.method {
        clauses.push(format!("method = ?{}", binds.len() + 1));
        binds.push(method.clone());
    }
    if let Some(node_id) = &selector.node_id {
        clauses.push(format!("node_id = ?{}", binds.len() + 1));
        binds.push(node_id.clone());
    }
}

impl Ledger {
    pub fn new(conn: Connection) -> Self {
        Ledger {
            conn: Mutex::new(conn),
        }
    }

    /// Append one record. Writes are synchronous and serialized through the
    /// connection's mutex — the ledger is the source of truth for billing.
    pub fn put(&self, record: &Record) -> Result<i64, LedgerError> {
        let mut conn = self.conn.lock().expect("ledger connection lock poisoned");
        crate::db::db_exec(&mut conn, |tx| -> Result<(), LedgerError> {
            tx.execute(
                "INSERT INTO ledger (role, service, method, timestamp, node_id, status, payment_type, payment_amount, payment_currency, perf)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.role.wire_str(),
                    record.service,
                    record.method,
                    record.timestamp,
                    record.node_id,
                    record.status.wire_str(),
                    payment_type_str(record.payment_type),
                    record.payment_value.amount,
                    record.payment_value.currency.to_string(),
                    record.perf.as_ref().map(|v| v.to_string()),
                ],
            )?;
            Ok(())
        })?;
        Ok(conn.last_insert_rowid())
    }

    fn matching(&self, selector: &Selector) -> Result<Vec<Record>, LedgerError> {
        let mut clauses = Vec::new();
        let mut binds = Vec::new();
        push_selector(selector, &mut clauses, &mut binds);
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT role, service, method, timestamp, node_id, status, payment_type, payment_amount, payment_currency, perf FROM ledger{}",
            where_clause
        );
        let conn = self.conn.lock().expect("ledger connection lock poisoned");
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b as &dyn rusqlite::ToSql).collect();
        crate::db::db_query(&conn, &sql, param_refs.as_slice(), |row| {
            let currency: String = row.get(8)?;
            let perf: Option<String> = row.get(9)?;
            Ok(Record {
                role: Role::parse(&row.get::<_, String>(0)?),
                service: row.get(1)?,
                method: row.get(2)?,
                timestamp: row.get(3)?,
                node_id: row.get(4)?,
                status: RecordStatus::parse(&row.get::<_, String>(5)?),
                payment_type: parse_payment_type(&row.get::<_, String>(6)?),
                payment_value: Money {
                    amount: row.get(7)?,
                    currency: if currency == "USD" {
                        Currency::Usd
                    } else {
                        Currency::Btc
                    },
                },
                perf: perf.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })
    }

    /// Fold `f` over every record matching `selector`.
    pub fn reduce<T, F>(&self, selector: &Selector, init: T, mut f: F) -> Result<T, LedgerError>
    where
        F: FnMut(T, &Record) -> T,
    {
        let records = self.matching(selector)?;
        Ok(records.iter().fold(init, |acc, r| f(acc, r)))
    }

    /// `matched / (matched + failed)` over terminal statuses only, or `-1`
    /// if there are no terminal rows.
    pub fn success_rate(&self, selector: &Selector) -> Result<f64, LedgerError> {
        let records = self.matching(selector)?;
        let (success, total) = records
            .iter()
            .filter(|r| r.status.is_terminal())
            .fold((0u64, 0u64), |(s, t), r| {
                (s + r.status.is_success() as u64, t + 1)
            });
        if total == 0 {
            Ok(-1.0)
        } else {
            Ok(success as f64 / total as f64)
        }
    }

    /// `success-paid / (success-paid + success-unpaid)`, or `-1` if there
    /// are no successful rows at all.
    pub fn paid_rate(&self, selector: &Selector) -> Result<f64, LedgerError> {
        let records = self.matching(selector)?;
        let (paid, total) = records.iter().fold((0u64, 0u64), |(p, t), r| match r.status {
            RecordStatus::SuccessPaid => (p + 1, t + 1),
            RecordStatus::SuccessUnpaid => (p, t + 1),
            _ => (p, t),
        });
        if total == 0 {
            Ok(-1.0)
        } else {
            Ok(paid as f64 / total as f64)
        }
    }

    /// Sum of `paymentValue.amount` over `{role=server, id, status ∈
    /// {success-unpaid, success-paid}}`. Panics on a currency-mismatched
    /// sum: cross-currency aggregation is disallowed at this layer by
    /// design.
    pub fn payment_value_served_to_id(&self, id: &str) -> Result<Money, LedgerError> {
        let selector = Selector {
            role: Some(Role::Server),
            node_id: Some(id.to_string()),
            ..Default::default()
        };
        let records = self.matching(&selector)?;
        let mut total: Option<Money> = None;
        for r in records.iter().filter(|r| r.status.is_success()) {
            total = Some(match total {
                None => r.payment_value,
                Some(t) => {
                    assert_eq!(
                        t.currency, r.payment_value.currency,
                        "payment_value_served_to_id: currency mismatch within a single peer's records"
                    );
                    Money {
                        amount: t.amount + r.payment_value.amount,
                        currency: t.currency,
                    }
                }
            });
        }
        Ok(total.unwrap_or(Money {
            amount: 0,
            currency: Currency::Btc,
        }))
    }
}

fn payment_type_str(pt: PaymentType) -> &'static str {
    match pt {
        PaymentType::None => "none",
        PaymentType::Attached => "attached",
        PaymentType::Txid => "txid",
        PaymentType::Defer => "defer",
    }
}

fn parse_payment_type(s: &str) -> PaymentType {
    match s {
        "attached" => PaymentType::Attached,
        "txid" => PaymentType::Txid,
        "defer" => PaymentType::Defer,
        _ => PaymentType::None,
    }
}
