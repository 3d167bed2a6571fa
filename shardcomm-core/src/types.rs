//! Core types for operation correlation.
//!
//! This module provides the identifiers and message types the engine works with:
//! - [`Ticket`]: process-unique operation identifier
//! - [`Method`]: request method
//! - [`Request`] / [`Response`]: wire-neutral request and answer

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-supplied correlation string. Empty matches any.
pub type ClientTransactionId = String;

/// Caller-supplied correlation number. Zero matches any.
pub type CoordTransactionId = u64;

/// Identifier of a data shard.
pub type ShardId = String;

/// Identifier of a cluster node.
pub type ServerId = String;

/// Process-unique identifier of a submitted operation.
///
/// Tickets are issued monotonically starting at 1 and never reused.
/// [`Ticket::NONE`] marks synthetic records that correspond to no
/// submitted operation.
///
/// # Examples
///
/// ```
/// use shardcomm_core::Ticket;
///
/// assert!(Ticket::NONE.is_none());
/// assert_eq!(Ticket::new(42).to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Ticket(u64);

impl Ticket {
    /// The reserved "no operation" ticket.
    pub const NONE: Ticket = Ticket(0);

    /// Wrap a raw ticket value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw ticket value.
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Whether this is [`Ticket::NONE`].
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Ticket {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Ticket)
    }
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// PATCH
    Patch,
    /// OPTIONS
    Options,
}

impl Method {
    /// Canonical upper-case name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown method name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown request method: {0}")]
pub struct ParseMethodError(pub String);

impl FromStr for Method {
    type Err = ParseMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "PATCH" => Ok(Method::Patch),
            "OPTIONS" => Ok(Method::Options),
            _ => Err(ParseMethodError(s.to_string())),
        }
    }
}

/// Whether a response code belongs to the success class (200, 201, 202).
pub const fn is_success_code(code: u16) -> bool {
    matches!(code, 200..=202)
}

/// A request as handed to the transport.
///
/// Header names are stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Path below the endpoint, starting with `/`.
    pub path: String,
    /// Request body. Cheap to clone so one body can feed many requests.
    pub body: Bytes,
    /// Header fields.
    pub headers: HashMap<String, String>,
}

impl Request {
    /// Create a request with an empty body and no headers.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: Bytes::new(),
            headers: HashMap::new(),
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header field.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header field by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }
}

/// An answer received for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response status code.
    pub code: u16,
    /// Response body.
    pub body: Bytes,
    /// Header fields.
    pub headers: HashMap<String, String>,
}

impl Response {
    /// Create a response with an empty body and no headers.
    pub fn new(code: u16) -> Self {
        Self {
            code,
            body: Bytes::new(),
            headers: HashMap::new(),
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header field.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Look up a header field by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        lookup_header(&self.headers, name)
    }

    /// Whether the code is 200, 201 or 202.
    pub fn is_success(&self) -> bool {
        is_success_code(self.code)
    }
}

fn lookup_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    if let Some(value) = headers.get(name) {
        return Some(value.as_str());
    }
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
