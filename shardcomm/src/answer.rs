//! Out-of-band answers.
//!
//! A non-single request carries a correlation header naming the originator
//! and the ticket. The peer may acknowledge the request with
//! `x-shardcomm-async: store` and later deliver the real answer to the
//! originator with `PUT /_api/shard-comm`, repeating the correlation header
//! and the answer's status code.
//!
//! ```text
//! coordinator                                   peer
//!     │── request + x-shardcomm-coordinator ───────►│
//!     │◄─────────── 202 + x-shardcomm-async: store ─│   record: Sent
//!     │                                              │
//!     │◄── PUT /_api/shard-comm ────────────────────│   async_answer
//!     │     x-shardcomm-coordinator                  │
//!     │     x-shardcomm-response-code                │
//! process_answer ──► record: Received
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::CommError;
use crate::{ClientTransactionId, CoordTransactionId, Response, ServerId, Ticket};

/// Correlation header attached to non-single requests and to answers.
pub const COORDINATOR_HEADER: &str = "x-shardcomm-coordinator";

/// Header asking the peer to store the request and answer out-of-band.
pub const ASYNC_HEADER: &str = "x-shardcomm-async";

/// Value of [`ASYNC_HEADER`] on requests and on store acknowledgements.
pub const ASYNC_STORE: &str = "store";

/// Header carrying the status code of an out-of-band answer.
pub const RESPONSE_CODE_HEADER: &str = "x-shardcomm-response-code";

/// Header carrying the value of the [`TokenSource`](crate::TokenSource).
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Path out-of-band answers are sent to.
pub const ANSWER_PATH: &str = "/_api/shard-comm";

/// Parsed `x-shardcomm-coordinator` value:
/// `<originator>:<ticket>:<client transaction>:<coordinator transaction>`.
///
/// ```
/// use shardcomm::{CoordinatorHeader, Ticket};
///
/// let header: CoordinatorHeader = "crdn-1:17:trx-a:42".parse().expect("valid header");
/// assert_eq!(header.originator, "crdn-1");
/// assert_eq!(header.ticket, Ticket::new(17));
/// assert_eq!(header.client_transaction_id, "trx-a");
/// assert_eq!(header.coord_transaction_id, 42);
/// assert_eq!(header.to_string(), "crdn-1:17:trx-a:42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorHeader {
    /// Server that issued the request and receives the answer.
    pub originator: ServerId,
    /// Ticket of the operation on the originator.
    pub ticket: Ticket,
    /// Client transaction id, possibly empty.
    pub client_transaction_id: ClientTransactionId,
    /// Coordinator transaction id, 0 if none.
    pub coord_transaction_id: CoordTransactionId,
}

impl CoordinatorHeader {
    /// Parse a header value.
    ///
    /// The client transaction id may itself contain `:`.
    pub fn parse(value: &str) -> Result<Self, CommError> {
        let malformed = |reason| CommError::MalformedCoordinatorHeader {
            header: value.to_string(),
            reason,
        };

        let (originator, rest) = value
            .split_once(':')
            .ok_or_else(|| malformed("could not find originator"))?;
        let (ticket, rest) = rest
            .split_once(':')
            .ok_or_else(|| malformed("could not find ticket"))?;
        let (client, coord) = rest
            .rsplit_once(':')
            .ok_or_else(|| malformed("could not find coordinator transaction id"))?;

        let ticket = ticket
            .parse::<Ticket>()
            .map_err(|_| malformed("ticket is not a number"))?;
        if ticket.is_none() {
            return Err(malformed("ticket must not be 0"));
        }
        let coord_transaction_id = coord
            .parse::<CoordTransactionId>()
            .map_err(|_| malformed("coordinator transaction id is not a number"))?;

        Ok(Self {
            originator: originator.to_string(),
            ticket,
            client_transaction_id: client.to_string(),
            coord_transaction_id,
        })
    }
}

impl FromStr for CoordinatorHeader {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CoordinatorHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.originator, self.ticket, self.client_transaction_id, self.coord_transaction_id
        )
    }
}

/// Status code from a response-code header value.
///
/// Accepts a bare code (`"201"`) or a code with reason phrase
/// (`"201 Created"`).
pub(crate) fn parse_response_code(value: Option<&str>) -> Result<u16, CommError> {
    let digits: String = value
        .unwrap_or_default()
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    match digits.parse::<u16>() {
        Ok(code) if (100..=599).contains(&code) => Ok(code),
        _ => Err(CommError::MissingResponseCode),
    }
}

/// Rebuild the answer carried by an inbound `PUT /_api/shard-comm`.
pub(crate) fn answer_from_parts(
    headers: HashMap<String, String>,
    body: Bytes,
) -> Result<Response, CommError> {
    let mut answer = Response::new(0).with_body(body);
    for (name, value) in headers {
        answer = answer.with_header(&name, value);
    }
    answer.code = parse_response_code(answer.header(RESPONSE_CODE_HEADER))?;
    Ok(answer)
}

/// Header fields of the answer request sent back to the originator.
pub(crate) fn answer_headers(
    coordinator_header: &str,
    response: &Response,
) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = response
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect();
    headers.insert(COORDINATOR_HEADER.to_string(), coordinator_header.to_string());
    headers.insert(RESPONSE_CODE_HEADER.to_string(), response.code.to_string());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip_with_empty_client() {
        let header = CoordinatorHeader {
            originator: "crdn-1".to_string(),
            ticket: Ticket::new(5),
            client_transaction_id: String::new(),
            coord_transaction_id: 0,
        };
        let text = header.to_string();
        assert_eq!(text, "crdn-1:5::0");
        assert_eq!(CoordinatorHeader::parse(&text).expect("parses"), header);
    }

    #[test]
    fn test_client_transaction_may_contain_colons() {
        let header = CoordinatorHeader::parse("crdn-1:9:a:b:c:3").expect("parses");
        assert_eq!(header.client_transaction_id, "a:b:c");
        assert_eq!(header.coord_transaction_id, 3);
    }

    #[test]
    fn test_malformed_headers() {
        for bad in ["", "crdn-1", "crdn-1:12", "crdn-1:x:a:1", "crdn-1:0:a:1", "crdn-1:4:a:z"] {
            assert!(
                matches!(
                    CoordinatorHeader::parse(bad),
                    Err(CommError::MalformedCoordinatorHeader { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_parse_response_code() {
        assert_eq!(parse_response_code(Some("200")).ok(), Some(200));
        assert_eq!(parse_response_code(Some(" 404 Not Found")).ok(), Some(404));
        assert!(matches!(
            parse_response_code(None),
            Err(CommError::MissingResponseCode)
        ));
        assert!(parse_response_code(Some("OK")).is_err());
        assert!(parse_response_code(Some("999")).is_err());
    }

    #[test]
    fn test_answer_from_parts_reads_code() {
        let mut headers = HashMap::new();
        headers.insert("X-Shardcomm-Response-Code".to_string(), "201".to_string());
        headers.insert("content-type".to_string(), "application/json".to_string());

        let answer = answer_from_parts(headers, Bytes::from_static(b"{}")).expect("valid answer");
        assert_eq!(answer.code, 201);
        assert_eq!(answer.header("Content-Type"), Some("application/json"));
        assert_eq!(&answer.body[..], b"{}");
    }

    #[test]
    fn test_answer_headers() {
        let response = Response::new(202).with_header("Content-Type", "application/json");
        let headers = answer_headers("crdn-1:5::7", &response);
        assert_eq!(headers.get(COORDINATOR_HEADER).map(String::as_str), Some("crdn-1:5::7"));
        assert_eq!(headers.get(RESPONSE_CODE_HEADER).map(String::as_str), Some("202"));
        assert_eq!(
            headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
    }
}
