//! Audit record for a single inbound HTTP request

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{ConnectInfo, OriginalUri, Request};
use chrono::{DateTime, Utc};
use http::{header, HeaderMap, Uri, Version};

use super::body::dump_body;
use crate::error::{Error, Op, Result};
use crate::ids::RequestId;
use crate::net::{protocol_parts, split_host_port, transfer_encodings, wants_close, ConnectionInfo};

const OP_SET_REQUEST: Op = "audit/AuditRecord.from_request";

/// Observable metadata of an inbound request
///
/// Built once by [`AuditRecord::from_request`] and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub protocol: String,
    pub protocol_major: i32,
    pub protocol_minor: i32,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: String,
    pub path: String,
    /// JSON object of header name to its values
    pub header: String,
    /// JSON object of trailer name to its values
    pub trailer: String,
    pub body: String,
    /// `None` when the request did not declare a length
    pub content_length: Option<i64>,
    /// Comma-joined transfer codings
    pub transfer_encoding: String,
    pub close: bool,
    pub remote_address: String,
    pub request_uri: String,
}

/// One request's audit trail entry
#[derive(Debug, Clone)]
pub struct AuditRecord {
    request_id: RequestId,
    time_started: DateTime<Utc>,
    time_finished: Option<DateTime<Utc>>,
    elapsed: Option<Duration>,
    request: RequestSnapshot,
}

impl AuditRecord {
    /// Capture `request` into a new record
    ///
    /// Drains the body and puts an identical copy back into `request`, so the
    /// downstream handler still reads the full body. On error nothing has been
    /// handed to any sink.
    pub async fn from_request(request: &mut Request, body_limit: usize) -> Result<Self> {
        let time_started = Utc::now();

        let raw_host = raw_host(request)?;
        let (host, port) = split_host_port(&raw_host)?;

        let connection = request
            .extensions()
            .get::<ConnectInfo<ConnectionInfo>>()
            .map(|ConnectInfo(info)| *info);
        let scheme = connection.map_or("http", |info| info.scheme());
        let remote_address = connection
            .map(|info| info.remote_addr.to_string())
            .unwrap_or_default();

        let header = serialize_fields(request.headers())?;

        let request_id = RequestId::new();

        let dumped = dump_body(request, body_limit).await?;
        let trailer = match dumped.trailers {
            Some(ref trailers) => serialize_fields(trailers)?,
            None => "{}".to_string(),
        };

        let (protocol, protocol_major, protocol_minor) = protocol_parts(request.version());
        let request_uri = request
            .extensions()
            .get::<OriginalUri>()
            .map(|OriginalUri(uri)| request_target(uri, request.version()))
            .unwrap_or_else(|| request_target(request.uri(), request.version()));

        let snapshot = RequestSnapshot {
            protocol: protocol.to_string(),
            protocol_major,
            protocol_minor,
            method: request.method().to_string(),
            scheme: scheme.to_string(),
            host,
            port,
            path: request.uri().path().to_string(),
            header,
            trailer,
            body: String::from_utf8_lossy(&dumped.content).into_owned(),
            content_length: content_length(request.headers()),
            transfer_encoding: transfer_encodings(request.headers()).join(","),
            close: wants_close(request.version(), request.headers()),
            remote_address,
            request_uri,
        };

        request.extensions_mut().insert(request_id.clone());

        Ok(Self {
            request_id,
            time_started,
            time_finished: None,
            elapsed: None,
            request: snapshot,
        })
    }

    /// Correlation identifier of this request
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// When capture started (UTC)
    pub fn time_started(&self) -> DateTime<Utc> {
        self.time_started
    }

    /// When the wrapped handler returned
    pub fn time_finished(&self) -> Option<DateTime<Utc>> {
        self.time_finished
    }

    /// Wall time from capture start to handler return
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// The captured request fields
    pub fn request(&self) -> &RequestSnapshot {
        &self.request
    }

    /// Stamp the finish time once the wrapped handler has returned
    pub fn finish(&mut self) {
        let now = Utc::now();
        self.time_finished = Some(now);
        self.elapsed = (now - self.time_started).to_std().ok();
    }
}

/// `Host` header, falling back to the URI authority (HTTP/2 `:authority`)
fn raw_host(request: &Request) -> Result<String> {
    if let Some(value) = request.headers().get(header::HOST) {
        return value
            .to_str()
            .map(str::to_string)
            .map_err(|_| Error::MalformedHost {
                host: String::from_utf8_lossy(value.as_bytes()).into_owned(),
                reason: "host is not valid ASCII",
            });
    }

    Ok(request
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_default())
}

/// The request target as the client sent it
///
/// HTTP/2 and later always carry scheme and authority as pseudo-headers, so
/// only the origin form is kept for them.
fn request_target(uri: &Uri, version: Version) -> String {
    if version >= Version::HTTP_2 {
        uri.path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
    } else {
        uri.to_string()
    }
}

/// Encode a header map as a JSON object of name to list of values
fn serialize_fields(fields: &HeaderMap) -> Result<String> {
    let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (name, value) in fields {
        grouped
            .entry(name.as_str())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    serde_json::to_string(&grouped).map_err(|e| Error::serialization(OP_SET_REQUEST, e))
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}
