//! Wire format: `OcReq`/`OcResp`, the hierarchical status strings, and the
//! line-delimited-header-plus-declared-length-body codec.

use std::fmt;
use std::io::{self, BufRead, Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::money::Money;

/// Hierarchical, `/`-separated status strings. Clients match by prefix.
pub mod status {
    pub const OK: &str = "ok";
    pub const ACCESS_DENIED: &str = "access-denied";
    pub const CLIENT_ERROR: &str = "client-error";
    pub const CLIENT_ERROR_BAD_REQUEST: &str = "client-error/bad-request";
    pub const CLIENT_ERROR_INVALID_SIGNATURE: &str = "client-error/invalid-signature";
    pub const CLIENT_ERROR_SERVICE_UNSUPPORTED: &str = "client-error/service-unsupported";
    pub const CLIENT_ERROR_METHOD_UNSUPPORTED: &str = "client-error/method-unsupported";
    pub const CLIENT_ERROR_INVALID_ARGUMENTS: &str = "client-error/invalid-arguments";
    pub const SERVER_ERROR: &str = "server-error";
    pub const REQUEST_DECLINED: &str = "request-declined";
    pub const REQUEST_DECLINED_REFRESH_NONCE: &str = "request-declined/refresh-nonce";
    pub const REQUEST_DECLINED_CURRENCY_UNSUPPORTED: &str =
        "request-declined/currency-unsupported";
    pub const REQUEST_DECLINED_PAYMENT_REQUIRED: &str = "request-declined/payment-required";
    pub const REQUEST_DECLINED_PLEASE_PAY: &str = "request-declined/please-pay";
    pub const REQUEST_DECLINED_PAYMENT: &str = "request-declined/payment";
    pub const REQUEST_DECLINED_PAYMENT_INVALID_TRANSACTION: &str =
        "request-declined/payment/invalid-transaction";
    pub const REQUEST_DECLINED_PAYMENT_INVALID_TXID: &str =
        "request-declined/payment/invalid-txid";
    pub const REQUEST_DECLINED_PAYMENT_TOO_LOW: &str = "request-declined/payment/too-low";
    pub const REQUEST_DECLINED_PAYMENT_NO_DEFER: &str = "request-declined/payment/no-defer";

    /// A client matches a response's status against an expected class by
    /// prefix: `matches("client-error/bad-request", "client-error")`.
    pub fn matches(status: &str, class: &str) -> bool {
        status == class || status.starts_with(&format!("{}/", class))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    None,
    Attached,
    Txid,
    Defer,
}

impl PaymentType {
    fn wire_str(&self) -> &'static str {
        match self {
            PaymentType::None => "none",
            PaymentType::Attached => "attached",
            PaymentType::Txid => "txid",
            PaymentType::Defer => "defer",
        }
    }
}

impl Default for PaymentType {
    fn default() -> Self {
        PaymentType::None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcReq {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sig: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coins: Vec<String>,
    #[serde(
        default,
        rename = "coinSigs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub coin_sigs: Vec<String>,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, rename = "paymentType")]
    pub payment_type: PaymentType,
    #[serde(default, rename = "paymentValue", skip_serializing_if = "Option::is_none")]
    pub payment_value: Option<Money>,
    #[serde(default, rename = "paymentTxn", skip_serializing_if = "String::is_empty")]
    pub payment_txn: String,
    #[serde(default, rename = "contentLength")]
    pub content_length: u64,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl OcReq {
    /// The ordered byte concatenation that gets SHA-256-hashed and signed:
    /// nonce, service, method, each arg in order, paymentType, paymentTxn,
    /// body.
    pub fn signable_range(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.nonce.as_bytes());
        buf.extend_from_slice(self.service.as_bytes());
        buf.extend_from_slice(self.method.as_bytes());
        for arg in &self.args {
            buf.extend_from_slice(arg.as_bytes());
        }
        buf.extend_from_slice(self.payment_type.wire_str().as_bytes());
        buf.extend_from_slice(self.payment_txn.as_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.signable_range());
        hasher.finalize().into()
    }

    /// Coins deduplicated (set semantics) while preserving first occurrence
    /// order, per the peer registry's tie-break rule.
    pub fn unique_coins(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.coins
            .iter()
            .filter(|c| seen.insert((*c).clone()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcResp {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sig: String,
    #[serde(default)]
    pub nonce: String,
    pub status: String,
    #[serde(default, rename = "contentLength")]
    pub content_length: u64,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl OcResp {
    pub fn new(status: &str, body: Vec<u8>) -> Self {
        OcResp {
            content_length: body.len() as u64,
            body,
            status: status.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Eof,
    Json(serde_json::Error),
    BodyTruncated { expected: u64, got: u64 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "i/o error framing message: {}", e),
            FrameError::Eof => write!(f, "connection closed before a full header line"),
            FrameError::Json(e) => write!(f, "malformed header json: {}", e),
            FrameError::BodyTruncated { expected, got } => write!(
                f,
                "declared contentLength {} but only {} bytes available",
                expected, got
            ),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        FrameError::Json(e)
    }
}

fn read_header_line<R: BufRead>(r: &mut R) -> Result<String, FrameError> {
    let mut line = String::new();
    let n = r.read_line(&mut line)?;
    if n == 0 {
        return Err(FrameError::Eof);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(line)
}

pub fn read_request<R: BufRead>(r: &mut R) -> Result<OcReq, FrameError> {
    let line = read_header_line(r)?;
    let mut req: OcReq = serde_json::from_str(&line)?;
    let mut body = vec![0u8; req.content_length as usize];
    r.read_exact(&mut body).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::BodyTruncated {
                expected: req.content_length,
                got: 0,
            }
        } else {
            FrameError::Io(e)
        }
    })?;
    req.body = body;
    Ok(req)
}

pub fn read_response<R: BufRead>(r: &mut R) -> Result<OcResp, FrameError> {
    let line = read_header_line(r)?;
    let mut resp: OcResp = serde_json::from_str(&line)?;
    let mut body = vec![0u8; resp.content_length as usize];
    r.read_exact(&mut body).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::BodyTruncated {
                expected: resp.content_length,
                got: 0,
            }
        } else {
            FrameError::Io(e)
        }
    })?;
    resp.body = body;
    Ok(resp)
}

pub fn write_request<W: Write>(w: &mut W, req: &OcReq) -> Result<(), FrameError> {
    let header = serde_json::to_string(req)?;
    w.write_all(header.as_bytes())?;
    w.write_all(b"\n")?;
    w.write_all(&req.body)?;
    Ok(())
}

pub fn write_response<W: Write>(w: &mut W, resp: &OcResp) -> Result<(), FrameError> {
    let header = serde_json::to_string(resp)?;
    w.write_all(header.as_bytes())?;
    w.write_all(b"\n")?;
    w.write_all(&resp.body)?;
    Ok(())
}
