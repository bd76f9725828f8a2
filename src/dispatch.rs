//! Service dispatch: a closed, read-only-after-construction map from
//! service name to handler. The core does not interpret a handler's
//! semantics, only its `Result<OcResp, HandlerError>` contract.

use std::collections::HashMap;
use std::fmt;

use crate::msg::{status, OcReq, OcResp};
use crate::peer::Peer;

#[derive(Debug)]
pub enum HandlerError {
    UnknownMethod,
    InvalidArguments(String),
    Internal(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::UnknownMethod => write!(f, "unsupported method"),
            HandlerError::InvalidArguments(s) => write!(f, "invalid arguments: {}", s),
            HandlerError::Internal(s) => write!(f, "internal handler error: {}", s),
        }
    }
}

impl std::error::Error for HandlerError {}

/// One request, already admitted, dispatched to a service. The handler
/// builds the response itself (status plus body); the pipeline signs it
/// and appends the ledger record. Handlers are blind to payment and policy
/// concerns — those are settled before dispatch ever runs.
pub trait Handler: Send + Sync {
    fn handle(&self, peer: &Peer, req: &OcReq) -> Result<OcResp, HandlerError>;
}

/// Installed once at server construction and never mutated afterward —
/// "dynamic dispatch of handlers" here means polymorphism through the
/// trait object, not a registry patched at runtime.
pub struct Registry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            handlers: HashMap::new(),
        }
    }

    pub fn register(mut self, service: &str, handler: Box<dyn Handler>) -> Self {
        self.handlers.insert(service.to_string(), handler);
        self
    }

    pub fn get(&self, service: &str) -> Option<&dyn Handler> {
        self.handlers.get(service).map(|h| h.as_ref())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// A postfix-notation calculator, recovered from the original prototype's
/// demonstration service. `args[0]` is a space-separated token stream;
/// numbers push, operators pop two and push the result.
pub struct CalcHandler;

impl Handler for CalcHandler {
    fn handle(&self, _peer: &Peer, req: &OcReq) -> Result<OcResp, HandlerError> {
        if req.method != "calc" {
            return Err(HandlerError::UnknownMethod);
        }
        let expr = req
            .args
            .first()
            .ok_or_else(|| HandlerError::InvalidArguments("missing expression".into()))?;

        let mut stack: Vec<f64> = Vec::new();
        for tok in expr.split_whitespace() {
            match tok {
                "+" | "-" | "*" | "/" => {
                    let b = stack
                        .pop()
                        .ok_or_else(|| HandlerError::InvalidArguments("stack underflow".into()))?;
                    let a = stack
                        .pop()
                        .ok_or_else(|| HandlerError::InvalidArguments("stack underflow".into()))?;
                    let result = match tok {
                        "+" => a + b,
                        "-" => a - b,
                        "*" => a * b,
                        "/" => {
                            if b == 0.0 {
                                return Err(HandlerError::InvalidArguments("division by zero".into()));
                            }
                            a / b
                        }
                        _ => unreachable!(),
                    };
                    stack.push(result);
                }
                num => {
                    let v: f64 = num
                        .parse()
                        .map_err(|_| HandlerError::InvalidArguments(format!("not a number: {}", num)))?;
                    stack.push(v);
                }
            }
        }
        if stack.len() != 1 {
            return Err(HandlerError::InvalidArguments(
                "expression did not reduce to a single value".into(),
            ));
        }
        Ok(OcResp::new(status::OK, format_number(stack[0]).into_bytes()))
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Node-info / payment-address vending passthrough, recovered from the
/// original prototype's `info`/`payment` services. `payment-addr` is the
/// only method: it hands back a fresh address from this peer's vending
/// pool, JSON-encoded as `{"currency":"BTC","addr":"..."}`.
pub struct InfoHandler {
    pub vending: std::sync::Arc<crate::vending::VendingPool>,
    pub wallet: std::sync::Arc<dyn crate::wallet::Wallet>,
}

impl Handler for InfoHandler {
    fn handle(&self, peer: &Peer, req: &OcReq) -> Result<OcResp, HandlerError> {
        match req.method.as_str() {
            "payment-addr" => {
                let addr = self
                    .vending
                    .payment_addr(self.wallet.as_ref(), &peer.id.0)
                    .map_err(|e| HandlerError::Internal(e.to_string()))?;
                let body = serde_json::json!({ "currency": "BTC", "addr": addr });
                Ok(OcResp::new(
                    status::OK,
                    serde_json::to_vec(&body).expect("json object always serializes"),
                ))
            }
            _ => Err(HandlerError::UnknownMethod),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::NodeId;
    use std::collections::HashSet;

    fn peer() -> Peer {
        Peer {
            id: NodeId("c00,00".into()),
            coins: HashSet::new(),
        }
    }

    fn req(method: &str, args: Vec<&str>) -> OcReq {
        OcReq {
            method: method.to_string(),
            args: args.into_iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn calc_adds() {
        let h = CalcHandler;
        let resp = h.handle(&peer(), &req("calc", vec!["1 2 +"])).unwrap();
        assert_eq!(resp.body, b"3");
    }

    #[test]
    fn calc_rejects_unknown_method() {
        let h = CalcHandler;
        let err = h.handle(&peer(), &req("frobnicate", vec!["1 2 +"])).unwrap_err();
        assert!(matches!(err, HandlerError::UnknownMethod));
    }

    #[test]
    fn calc_rejects_underflow() {
        let h = CalcHandler;
        let err = h.handle(&peer(), &req("calc", vec!["+"])).unwrap_err();
        assert!(matches!(err, HandlerError::InvalidArguments(_)));
    }

    #[test]
    fn registry_dispatches_by_service_name() {
        let registry = Registry::new().register("calc", Box::new(CalcHandler));
        assert!(registry.get("calc").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
