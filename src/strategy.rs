//! Body framing decisions
//!
//! Pure functions from a message's framing-relevant headers to a framing
//! decision. No I/O, no state across calls.
//!
//! Two policies exist because the two directions trust their input
//! differently: messages we construct ourselves must never carry malformed
//! framing ([`LengthPolicy::Strict`]), while messages received from a peer
//! outside our control must not crash us ([`LengthPolicy::Lax`]).

use crate::headers::Headers;
use crate::{Error, Result};

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    /// Chunked transfer-coding
    Chunked,
    /// No delimiter; the body runs until the connection closes
    Identity,
    /// Exactly this many bytes
    Fixed(u64),
}

/// Policy for resolving transfer-coding and content-length headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthPolicy {
    /// Reject contradictory or malformed framing headers.
    Strict,
    /// Tolerate malformed framing headers, preferring the chunked
    /// indicator, then content-length, then identity.
    Lax,
}

pub(crate) const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub(crate) const CONTENT_LENGTH: &str = "Content-Length";
const CHUNKED_CODING: &str = "chunked";
const IDENTITY_CODING: &str = "identity";

impl LengthPolicy {
    /// Decide how the body described by `headers` is delimited.
    pub fn body_length(&self, headers: &Headers) -> Result<BodyLength> {
        match self {
            LengthPolicy::Strict => strict_length(headers),
            LengthPolicy::Lax => lax_length(headers),
        }
    }
}

/// All transfer codings named by the message, lowercased, in wire order.
fn codings(headers: &Headers) -> Vec<String> {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .flat_map(|value| value.split(','))
        .map(|coding| coding.trim().to_ascii_lowercase())
        .filter(|coding| !coding.is_empty())
        .collect()
}

fn ends_chunked(codings: &[String]) -> bool {
    codings.last().map(String::as_str) == Some(CHUNKED_CODING)
}

fn lax_length(headers: &Headers) -> Result<BodyLength> {
    if ends_chunked(&codings(headers)) {
        return Ok(BodyLength::Chunked);
    }
    // The last parseable content-length wins; garbage values are ignored
    // rather than trusted.
    for value in headers.get_all(CONTENT_LENGTH).iter().rev() {
        if let Ok(len) = value.trim().parse::<u64>() {
            return Ok(BodyLength::Fixed(len));
        }
    }
    Ok(BodyLength::Identity)
}

fn strict_length(headers: &Headers) -> Result<BodyLength> {
    let has_encoding = headers.contains(TRANSFER_ENCODING);
    let has_length = headers.contains(CONTENT_LENGTH);
    if has_encoding && has_length {
        return Err(Error::Protocol(
            "both Transfer-Encoding and Content-Length present".to_string(),
        ));
    }
    if has_encoding {
        let codings = codings(headers);
        if ends_chunked(&codings) {
            return Ok(BodyLength::Chunked);
        }
        if codings.len() == 1 && codings[0] == IDENTITY_CODING {
            return Ok(BodyLength::Identity);
        }
        return Err(Error::Protocol(format!(
            "unsupported transfer encoding: {}",
            headers.get(TRANSFER_ENCODING).unwrap_or("")
        )));
    }
    if has_length {
        let values = headers.get_all(CONTENT_LENGTH);
        let first = values[0].trim();
        let len = first
            .parse::<u64>()
            .map_err(|_| Error::Protocol(format!("invalid content length: {}", first)))?;
        if values.iter().any(|value| value.trim() != first) {
            return Err(Error::Protocol(
                "multiple disagreeing Content-Length headers".to_string(),
            ));
        }
        return Ok(BodyLength::Fixed(len));
    }
    Ok(BodyLength::Identity)
}
