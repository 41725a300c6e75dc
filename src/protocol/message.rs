//! The message envelope and its wire form.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

use super::Path;

/// Number of comma-separated fields in the wire header line.
const HEADER_FIELDS: usize = 8;

/// An immutable message envelope.
///
/// `id` is assigned by the store and is strictly monotonic within the
/// message's partition. `node_id` identifies the cluster node of origin;
/// zero means the message has not yet crossed a node boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub node_id: u8,
    pub time: i64,
    pub path: Path,
    pub user_id: String,
    pub application_id: String,
    pub publisher_message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("message truncated: {reason}")]
    Truncated { reason: &'static str },
    #[error("message header invalid: {reason}")]
    HeaderInvalid { reason: String },
    #[error("message headers line invalid: {source}")]
    HeadersInvalid {
        #[source]
        source: serde_json::Error,
    },
}

impl Message {
    /// Wire form: a comma-separated header line, a JSON headers line, then
    /// the raw body bytes. Round-trip preserving.
    ///
    /// The sixth header field is reserved and always empty; headers live on
    /// their own line so the header line stays comma-splittable.
    pub fn encode(&self) -> Vec<u8> {
        let headers =
            serde_json::to_string(&self.headers).expect("string map serializes to json");
        let header_line = format!(
            "{},{},{},{},{},,{},{}",
            self.path,
            self.id,
            self.user_id,
            self.application_id,
            self.publisher_message_id.as_deref().unwrap_or(""),
            self.time,
            self.node_id,
        );

        let mut buf =
            Vec::with_capacity(header_line.len() + headers.len() + 2 + self.body.len());
        buf.extend_from_slice(header_line.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(headers.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (header_line, rest) = split_line(bytes).ok_or(ProtocolError::Truncated {
            reason: "missing header line",
        })?;
        let (headers_line, body) = split_line(rest).ok_or(ProtocolError::Truncated {
            reason: "missing headers line",
        })?;

        let header_line =
            std::str::from_utf8(header_line).map_err(|_| ProtocolError::HeaderInvalid {
                reason: "header line is not utf-8".to_string(),
            })?;
        let fields: Vec<&str> = header_line.split(',').collect();
        if fields.len() != HEADER_FIELDS {
            return Err(ProtocolError::HeaderInvalid {
                reason: format!(
                    "expected {HEADER_FIELDS} header fields, got {}",
                    fields.len()
                ),
            });
        }
        if !fields[5].is_empty() {
            return Err(ProtocolError::HeaderInvalid {
                reason: "reserved header field is not empty".to_string(),
            });
        }

        let id = parse_field(fields[1], "id")?;
        let time = parse_field(fields[6], "time")?;
        let node_id = parse_field(fields[7], "nodeID")?;
        let publisher_message_id = if fields[4].is_empty() {
            None
        } else {
            Some(fields[4].to_string())
        };

        let headers_line =
            std::str::from_utf8(headers_line).map_err(|_| ProtocolError::HeaderInvalid {
                reason: "headers line is not utf-8".to_string(),
            })?;
        let headers = if headers_line.is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(headers_line)
                .map_err(|source| ProtocolError::HeadersInvalid { source })?
        };

        Ok(Self {
            id,
            node_id,
            time,
            path: Path::from(fields[0]),
            user_id: fields[2].to_string(),
            application_id: fields[3].to_string(),
            publisher_message_id,
            headers,
            body: Bytes::copy_from_slice(body),
        })
    }
}

fn split_line(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|&b| b == b'\n')?;
    Some((&bytes[..pos], &bytes[pos + 1..]))
}

fn parse_field<T: std::str::FromStr>(raw: &str, name: &'static str) -> Result<T, ProtocolError> {
    raw.parse().map_err(|_| ProtocolError::HeaderInvalid {
        reason: format!("field {name} invalid: {raw:?}"),
    })
}
