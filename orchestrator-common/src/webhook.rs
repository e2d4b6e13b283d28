//! The webhook payload schema, HMAC signing, and the anti-SSRF URL check
//! shared between the ingress validation pass and `WebhookDeliverer`'s
//! send-time re-validation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use crate::job::{JobError, JobStatus, Operation};

/// The stable JSON body delivered to a job's `webhookUrl`. `attempt` is
/// 1-based and monotonically non-decreasing per job, supporting idempotent
/// handling on the receiver side.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_ref: Option<Value>,
    pub status: JobStatus,
    pub operation: String,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub execution: WebhookExecution,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookExecution {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl WebhookPayload {
    #[allow(clippy::too_many_arguments)]
    pub fn for_terminal_job(
        job_id: &str,
        caller_ref: Option<Value>,
        status: JobStatus,
        operation: Operation,
        attempt: u32,
        result: Option<Value>,
        error: Option<JobError>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        let duration_ms = match (start_time, end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        Self {
            job_id: job_id.to_owned(),
            caller_ref,
            status,
            operation: operation.base_name().to_owned(),
            attempt,
            result,
            error,
            execution: WebhookExecution {
                start_time,
                end_time,
                duration_ms,
            },
        }
    }
}

/// The header name used to carry the HMAC signature, when `webhookSecret` is
/// configured.
pub const SIGNATURE_HEADER: &str = "X-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Computes `sha256=<hex>` over the raw body bytes, for the `X-Signature`
/// header.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    format!("sha256={}", hex_encode(&digest))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlValidationError {
    #[error("webhook url must be absolute")]
    NotAbsolute,
    #[error("webhook url scheme must be http or https, got {0}")]
    UnsupportedScheme(String),
    #[error("webhook url has no host")]
    NoHost,
    #[error("webhook url resolves to a disallowed address: {0}")]
    DisallowedAddress(IpAddr),
    #[error("webhook url host could not be resolved")]
    UnresolvableHost,
}

/// Validates a webhook URL per §4.4: absolute, `http`/`https` only, and must
/// not resolve to loopback, private (RFC 1918), link-local, unique-local
/// (IPv6 ULA), or `0.0.0.0/8` address ranges. Applied both at ingress time
/// and again by `WebhookDeliverer` immediately before every send.
pub fn validate_url(url: &str) -> Result<(), UrlValidationError> {
    let parsed = url::Url::parse(url).map_err(|_| UrlValidationError::NotAbsolute)?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UrlValidationError::UnsupportedScheme(
            parsed.scheme().to_owned(),
        ));
    }

    let host = parsed.host_str().ok_or(UrlValidationError::NoHost)?;
    let port = parsed.port_or_known_default().unwrap_or(80);

    // Try parsing the host as a literal IP first, to avoid a DNS round trip.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return check_address(ip);
    }

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|_| UrlValidationError::UnresolvableHost)?
        .collect::<Vec<SocketAddr>>();

    if addrs.is_empty() {
        return Err(UrlValidationError::UnresolvableHost);
    }

    for addr in addrs {
        check_address(addr.ip())?;
    }

    Ok(())
}

fn check_address(ip: IpAddr) -> Result<(), UrlValidationError> {
    let disallowed = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.octets()[0] == 0
                || v4 == Ipv4Addr::UNSPECIFIED
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unique_local() || v6.is_unicast_link_local(),
    };

    if disallowed {
        Err(UrlValidationError::DisallowedAddress(ip))
    } else {
        Ok(())
    }
}
