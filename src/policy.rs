//! Static, configured policies gating each request by service+method, and
//! the evaluation loop the admission pipeline's Policing stage runs.

use std::fmt;

use serde::Deserialize;

use crate::money::{Money, MoneyError};
use crate::msg::{status, OcReq, PaymentType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub service: Option<String>,
    pub method: Option<String>,
}

impl Selector {
    /// Unset fields are wildcards; `service` gates `method` (two separate
    /// wildcard levels, per spec).
    pub fn matches(&self, service: &str, method: &str) -> bool {
        let service_ok = self.service.as_deref().map_or(true, |s| s == service);
        let method_ok = self.method.as_deref().map_or(true, |m| m == method);
        service_ok && method_ok
    }
}

#[derive(Debug, Clone)]
pub enum Cmd {
    Allow,
    Deny,
    MinFee(Money),
    MinCoins(Money),
    MaxWork(String),
    MaxBalance(Money),
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub selector: Selector,
    pub cmd: Cmd,
}

/// TOML-facing shape: `cmd` is a plain string and `args` are opaque strings,
/// mirroring how the config file expresses a policy line.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug)]
pub enum PolicyConfigError {
    UnknownCmd(String),
    MissingArg(&'static str),
    BadAmount(MoneyError),
}

impl fmt::Display for PolicyConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PolicyConfigError::UnknownCmd(s) => write!(f, "unknown policy cmd '{}'", s),
            PolicyConfigError::MissingArg(cmd) => write!(f, "policy '{}' requires an argument", cmd),
            PolicyConfigError::BadAmount(e) => write!(f, "invalid monetary argument: {}", e),
        }
    }
}

impl std::error::Error for PolicyConfigError {}

impl TryFrom<PolicyConfig> for Policy {
    type Error = PolicyConfigError;

    fn try_from(c: PolicyConfig) -> Result<Self, Self::Error> {
        let cmd = match c.cmd.as_str() {
            "allow" => Cmd::Allow,
            "deny" => Cmd::Deny,
            "min-fee" => Cmd::MinFee(
                Money::parse(c.args.first().ok_or(PolicyConfigError::MissingArg("min-fee"))?)
                    .map_err(PolicyConfigError::BadAmount)?,
            ),
            "min-coins" => Cmd::MinCoins(
                Money::parse(c.args.first().ok_or(PolicyConfigError::MissingArg("min-coins"))?)
                    .map_err(PolicyConfigError::BadAmount)?,
            ),
            "max-work" => Cmd::MaxWork(
                c.args
                    .first()
                    .cloned()
                    .ok_or(PolicyConfigError::MissingArg("max-work"))?,
            ),
            "max-balance" => Cmd::MaxBalance(
                Money::parse(
                    c.args
                        .first()
                        .ok_or(PolicyConfigError::MissingArg("max-balance"))?,
                )
                .map_err(PolicyConfigError::BadAmount)?,
            ),
            other => return Err(PolicyConfigError::UnknownCmd(other.to_string())),
        };
        Ok(Policy {
            selector: Selector {
                service: c.service,
                method: c.method,
            },
            cmd,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Allow,
    Deny(&'static str),
    PayPlease { amount: Money, addr: String },
}

/// `evaluate(peer, req, consumed, paid) -> Verdict`. `coin_balance` and
/// `handler_checks_work` are called lazily — only `min-coins`/`max-work`
/// policies force the (possibly expensive) checks they gate. `vend_addr` is
/// called only when a `max-balance` policy actually trips.
pub fn evaluate(
    policies: &[Policy],
    req: &OcReq,
    consumed: Money,
    paid: Money,
    coin_balance: impl Fn() -> Option<Money>,
    handler_checks_work: impl Fn(&str) -> bool,
    mut vend_addr: impl FnMut() -> Option<String>,
) -> Verdict {
    let matched: Vec<&Policy> = policies
        .iter()
        .filter(|p| p.selector.matches(&req.service, &req.method))
        .collect();

    // Step 1: max-balance is checked ahead of everything else.
    for p in &matched {
        if let Cmd::MaxBalance(limit) = &p.cmd {
            if let Some(over) = consumed.checked_sub(&paid) {
                if over.currency == limit.currency && over.amount > limit.amount {
                    return match vend_addr() {
                        Some(addr) => Verdict::PayPlease { amount: over, addr },
                        None => Verdict::Deny(status::SERVER_ERROR),
                    };
                }
            }
        }
    }

    // Step 2/3: the rest, in declared order; first terminal verdict wins.
    for p in &matched {
        match &p.cmd {
            Cmd::MaxBalance(_) => continue,
            Cmd::Deny => return Verdict::Deny(status::ACCESS_DENIED),
            Cmd::Allow => continue,
            Cmd::MinFee(required) => match req.payment_value {
                None => return Verdict::Deny(status::REQUEST_DECLINED_PAYMENT_REQUIRED),
                Some(_) if req.payment_type == PaymentType::None => {
                    return Verdict::Deny(status::REQUEST_DECLINED_PAYMENT_REQUIRED)
                }
                Some(actual) if actual.currency != required.currency => {
                    return Verdict::Deny(status::REQUEST_DECLINED_CURRENCY_UNSUPPORTED)
                }
                Some(actual) if actual.amount < required.amount => {
                    return Verdict::Deny(status::REQUEST_DECLINED_PAYMENT_TOO_LOW)
                }
                Some(_) => continue,
            },
            Cmd::MinCoins(required) => match coin_balance() {
                Some(bal) if bal.currency == required.currency && bal.amount >= required.amount => {
                    continue
                }
                Some(_) | None => return Verdict::Deny(status::ACCESS_DENIED),
            },
            Cmd::MaxWork(spec) => {
                if handler_checks_work(spec) {
                    continue;
                }
                return Verdict::Deny(status::CLIENT_ERROR_INVALID_ARGUMENTS);
            }
        }
    }

    Verdict::Allow
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;

    fn req(service: &str, method: &str, pv: Option<Money>, pt: PaymentType) -> OcReq {
        OcReq {
            service: service.into(),
            method: method.into(),
            payment_value: pv,
            payment_type: pt,
            ..Default::default()
        }
    }

    fn zero() -> Money {
        Money {
            amount: 0,
            currency: Currency::Btc,
        }
    }

    #[test]
    fn no_policies_allows() {
        let verdict = evaluate(
            &[],
            &req("calc", "calc", None, PaymentType::None),
            zero(),
            zero(),
            || None,
            |_| true,
            || None,
        );
        assert!(matches!(verdict, Verdict::Allow));
    }

    #[test]
    fn min_fee_unmet_declines_payment_required() {
        let policies = vec![Policy {
            selector: Selector {
                service: Some("calc".into()),
                method: Some("calc".into()),
            },
            cmd: Cmd::MinFee(Money::parse("1 BTC").unwrap()),
        }];
        let verdict = evaluate(
            &policies,
            &req("calc", "calc", None, PaymentType::None),
            zero(),
            zero(),
            || None,
            |_| true,
            || None,
        );
        assert!(matches!(
            verdict,
            Verdict::Deny(status::REQUEST_DECLINED_PAYMENT_REQUIRED)
        ));
    }

    #[test]
    fn min_fee_too_low() {
        let policies = vec![Policy {
            selector: Selector::default(),
            cmd: Cmd::MinFee(Money::parse("1 BTC").unwrap()),
        }];
        let attached = Money::parse("0.5 BTC").unwrap();
        let verdict = evaluate(
            &policies,
            &req("calc", "calc", Some(attached), PaymentType::Attached),
            zero(),
            zero(),
            || None,
            |_| true,
            || None,
        );
        assert!(matches!(
            verdict,
            Verdict::Deny(status::REQUEST_DECLINED_PAYMENT_TOO_LOW)
        ));
    }

    #[test]
    fn max_balance_trips_please_pay() {
        let policies = vec![Policy {
            selector: Selector::default(),
            cmd: Cmd::MaxBalance(Money::parse("0.1 BTC").unwrap()),
        }];
        let consumed = Money::parse("0.2 BTC").unwrap();
        let verdict = evaluate(
            &policies,
            &req("calc", "calc", None, PaymentType::Defer),
            consumed,
            zero(),
            || None,
            |_| true,
            || Some("addr1".to_string()),
        );
        match verdict {
            Verdict::PayPlease { amount, addr } => {
                assert_eq!(amount.amount, 20_000_000);
                assert_eq!(addr, "addr1");
            }
            other => panic!("expected PayPlease, got {:?}", other),
        }
    }

    #[test]
    fn selector_wildcards() {
        let s = Selector {
            service: Some("calc".into()),
            method: None,
        };
        assert!(s.matches("calc", "anything"));
        assert!(!s.matches("other", "anything"));
    }
}
