//! Transport-neutral HTTP records and the tunnel greeting.
//!
//! Records are exchanged as JSON text frames with capitalized field names
//! (`Method`, `URL`, `StatusCode`, ...). Bodies never travel inside a
//! record; they follow in their own binary frame.

use std::collections::BTreeMap;
use std::fmt;

use axum::body::Body;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{response, Request, Response, StatusCode, Uri, Version};
use bytes::Bytes;
use http_body_util::Full;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::DestinationMode;
use crate::error::TunnelError;

/// Reserved header carrying the destination URL in `header` mode.
pub const DESTINATION_HEADER: &str = "X-PROXY-DESTINATION";

/// Headers that describe a single hop and are never carried through the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "host",
];

/// Multi-valued header map keyed by canonical MIME header names.
pub type HeaderRecord = BTreeMap<String, Vec<String>>;

/// Serializable subset of an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestRecord {
    #[serde(rename = "Method")]
    pub method: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Proto", default)]
    pub proto: String,
    #[serde(rename = "ProtoMajor", default)]
    pub proto_major: u32,
    #[serde(rename = "ProtoMinor", default)]
    pub proto_minor: u32,
    #[serde(rename = "Header", default, deserialize_with = "null_as_empty")]
    pub header: HeaderRecord,
    #[serde(rename = "ContentLength", default)]
    pub content_length: i64,
}

/// Serializable subset of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResponseRecord {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "StatusCode")]
    pub status_code: u16,
    #[serde(rename = "Proto", default)]
    pub proto: String,
    #[serde(rename = "ProtoMajor", default)]
    pub proto_major: u32,
    #[serde(rename = "ProtoMinor", default)]
    pub proto_minor: u32,
    #[serde(rename = "Header", default, deserialize_with = "null_as_empty")]
    pub header: HeaderRecord,
    #[serde(rename = "ContentLength", default)]
    pub content_length: i64,
}

/// Peers may send a missing header map as `null`.
fn null_as_empty<'de, D>(deserializer: D) -> Result<HeaderRecord, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HeaderRecord>::deserialize(deserializer)?.unwrap_or_default())
}

impl HttpRequestRecord {
    /// Snapshot the client-facing request head. `body_len` is the size of the
    /// body frame that will follow.
    pub fn from_request<B>(request: &Request<B>, body_len: usize) -> Self {
        let (proto, proto_major, proto_minor) = proto_of(request.version());
        Self {
            method: request.method().to_string(),
            url: request.uri().to_string(),
            proto: proto.to_string(),
            proto_major,
            proto_minor,
            header: headers_to_record(request.headers()),
            content_length: i64::try_from(body_len).unwrap_or(i64::MAX),
        }
    }

    /// Resolve the URL the agent must call.
    pub fn destination(&self, mode: DestinationMode) -> Result<Uri, TunnelError> {
        let raw = match mode {
            DestinationMode::Url => self.url.as_str(),
            DestinationMode::Header => self
                .header
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(DESTINATION_HEADER))
                .and_then(|(_, values)| values.first())
                .map(String::as_str)
                .ok_or_else(|| {
                    TunnelError::Destination(format!("Missing {DESTINATION_HEADER} header"))
                })?,
        };
        parse_absolute(raw)
    }

    /// Rebuild a real request aimed at the origin.
    pub fn into_request(
        self,
        mode: DestinationMode,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>, TunnelError> {
        let uri = self.destination(mode)?;
        let mut builder = Request::builder()
            .method(self.method.as_str())
            .uri(uri)
            .version(version_of(self.proto_major, self.proto_minor));
        if let Some(headers) = builder.headers_mut() {
            apply_record_headers(&self.header, headers)?;
            headers.remove(DESTINATION_HEADER);
        }
        builder
            .body(Full::new(body))
            .map_err(|e| TunnelError::Protocol(format!("invalid request record: {e}")))
    }
}

impl HttpResponseRecord {
    /// Snapshot an origin response head. `body_len` is the size of the body
    /// frame that will follow.
    pub fn from_parts(parts: &response::Parts, body_len: usize) -> Self {
        let (proto, proto_major, proto_minor) = proto_of(parts.version);
        Self {
            status: format!(
                "{} {}",
                parts.status.as_u16(),
                parts.status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_string(),
            status_code: parts.status.as_u16(),
            proto: proto.to_string(),
            proto_major,
            proto_minor,
            header: headers_to_record(&parts.headers),
            content_length: i64::try_from(body_len).unwrap_or(i64::MAX),
        }
    }

    /// Build the client-facing response from this head and the tunneled body.
    pub fn into_response(self, body: Bytes) -> Result<Response<Body>, TunnelError> {
        let status = StatusCode::from_u16(self.status_code).map_err(|_| {
            TunnelError::Protocol(format!("invalid status code {}", self.status_code))
        })?;
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        apply_record_headers(&self.header, response.headers_mut())?;
        Ok(response)
    }
}

/// First message of every tunnel connection: `"<name>_<size>"` or a bare name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub name: String,
    pub pool_size: Option<usize>,
}

impl Greeting {
    pub fn new(name: &str, pool_size: usize) -> Self {
        Self {
            name: name.to_string(),
            pool_size: Some(pool_size),
        }
    }

    /// Parse both the canonical and the bare form. The size is whatever
    /// follows the last `_`, provided it is a number; names may contain `_`.
    pub fn parse(text: &str) -> Result<Self, TunnelError> {
        let text = text.trim();
        let greeting = match text.rsplit_once('_') {
            Some((name, size)) => match size.parse::<usize>() {
                Ok(size) => Self {
                    name: name.to_string(),
                    pool_size: Some(size),
                },
                Err(_) => Self {
                    name: text.to_string(),
                    pool_size: None,
                },
            },
            None => Self {
                name: text.to_string(),
                pool_size: None,
            },
        };
        if greeting.name.is_empty() {
            return Err(TunnelError::Greeting("empty agent name".to_string()));
        }
        Ok(greeting)
    }
}

impl fmt::Display for Greeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pool_size {
            Some(size) => write!(f, "{}_{size}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Parse a URL the agent can dial: it must carry a scheme and an authority.
pub fn parse_absolute(raw: &str) -> Result<Uri, TunnelError> {
    let uri: Uri = raw
        .parse()
        .map_err(|e| TunnelError::Destination(format!("Invalid destination {raw}: {e}")))?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return Err(TunnelError::Destination(format!("Invalid destination {raw}: not an absolute URL")));
    }
    Ok(uri)
}

/// `content-type` -> `Content-Type`, canonical MIME header form.
pub fn canonical_header_key(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn headers_to_record(headers: &HeaderMap) -> HeaderRecord {
    let mut record = HeaderRecord::new();
    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        record
            .entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    record
}

/// Copy record headers onto a real header map. `Content-Length` is left to
/// the body, which is always known in full.
fn apply_record_headers(record: &HeaderRecord, target: &mut HeaderMap) -> Result<(), TunnelError> {
    for (name, values) in record {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TunnelError::Protocol(format!("invalid header name {name}: {e}")))?;
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|e| TunnelError::Protocol(format!("invalid value for {name}: {e}")))?;
            target.append(header.clone(), value);
        }
    }
    Ok(())
}

fn proto_of(version: Version) -> (&'static str, u32, u32) {
    match version {
        Version::HTTP_09 => ("HTTP/0.9", 0, 9),
        Version::HTTP_10 => ("HTTP/1.0", 1, 0),
        Version::HTTP_2 => ("HTTP/2.0", 2, 0),
        Version::HTTP_3 => ("HTTP/3.0", 3, 0),
        _ => ("HTTP/1.1", 1, 1),
    }
}

/// The origin is always called over HTTP/1.x.
fn version_of(major: u32, minor: u32) -> Version {
    match (major, minor) {
        (1, 0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}
