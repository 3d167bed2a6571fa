//! Destination resolution: `shard:` / `server:` / raw endpoints.
//!
//! ```text
//! "shard:S1"      ──directory──► server "dbserver-1" ──directory──► "tcp://h:1"
//! "server:db-1"   ─────────────────────────────────────directory──► "tcp://h:1"
//! "tcp://h:1"     ──────────────────────────────────────────────────► verbatim
//! anything else   ──► BackendUnavailable
//! ```

use std::fmt;

use crate::{Directory, OpStatus, OperationRecord, ServerId, ShardId};

const SHARD_PREFIX: &str = "shard:";
const SERVER_PREFIX: &str = "server:";
const TCP_SCHEME: &str = "tcp://";
const SSL_SCHEME: &str = "ssl://";

/// A parsed destination string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Whichever server is responsible for the shard.
    Shard(ShardId),
    /// A server by id.
    Server(ServerId),
    /// A raw `tcp://` or `ssl://` endpoint.
    Endpoint(String),
}

impl Destination {
    /// Parse a destination string, `None` if the grammar is not understood.
    pub fn parse(destination: &str) -> Option<Self> {
        if let Some(shard) = destination.strip_prefix(SHARD_PREFIX) {
            Some(Destination::Shard(shard.to_string()))
        } else if let Some(server) = destination.strip_prefix(SERVER_PREFIX) {
            Some(Destination::Server(server.to_string()))
        } else if destination.starts_with(TCP_SCHEME) || destination.starts_with(SSL_SCHEME) {
            Some(Destination::Endpoint(destination.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Shard(shard) => write!(f, "{SHARD_PREFIX}{shard}"),
            Destination::Server(server) => write!(f, "{SERVER_PREFIX}{server}"),
            Destination::Endpoint(endpoint) => f.write_str(endpoint),
        }
    }
}

/// Concrete address a destination resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Shard named by the destination, empty otherwise.
    pub shard_id: ShardId,
    /// Responsible or named server, empty for raw endpoints.
    pub server_id: ServerId,
    /// Endpoint to talk to. Empty when resolution failed.
    pub endpoint: String,
    /// Why resolution failed, `None` on success.
    pub failure: Option<String>,
}

impl Resolution {
    /// Whether an endpoint was found.
    pub fn is_resolved(&self) -> bool {
        self.failure.is_none()
    }

    /// Copy the resolved address into `record`, marking it
    /// `BackendUnavailable` if resolution failed.
    pub fn apply_to(&self, record: &mut OperationRecord) {
        record.shard_id = self.shard_id.clone();
        record.server_id = self.server_id.clone();
        record.endpoint = self.endpoint.clone();
        if let Some(message) = &self.failure {
            record.status = OpStatus::BackendUnavailable;
            record.error_message = message.clone();
        }
    }
}

/// Resolves destination strings through a [`Directory`].
#[derive(Debug)]
pub struct DestinationResolver<'a, D: Directory> {
    directory: &'a D,
    log_connection_errors: bool,
}

impl<'a, D: Directory> DestinationResolver<'a, D> {
    /// Create a resolver. `log_connection_errors` selects `error` over
    /// `info` for resolution failures.
    pub fn new(directory: &'a D, log_connection_errors: bool) -> Self {
        Self {
            directory,
            log_connection_errors,
        }
    }

    /// Resolve `destination` to a concrete endpoint.
    pub fn resolve(&self, destination: &str) -> Resolution {
        let mut resolution = Resolution::default();
        let server = match Destination::parse(destination) {
            Some(Destination::Shard(shard)) => {
                let owner = self.directory.responsible_server(&shard);
                resolution.shard_id = shard;
                match owner {
                    Some(server) => {
                        tracing::debug!(
                            shard = %resolution.shard_id,
                            server = %server,
                            "responsible server"
                        );
                        server
                    }
                    None => {
                        let message = format!(
                            "cannot find responsible server for shard '{}'",
                            resolution.shard_id
                        );
                        self.report(&message);
                        resolution.failure = Some(message);
                        return resolution;
                    }
                }
            }
            Some(Destination::Server(server)) => server,
            Some(Destination::Endpoint(endpoint)) => {
                resolution.endpoint = endpoint;
                return resolution;
            }
            None => {
                let message = format!("did not understand destination '{destination}'");
                self.report(&message);
                resolution.failure = Some(message);
                return resolution;
            }
        };

        match self.directory.server_endpoint(&server) {
            Some(endpoint) if !endpoint.is_empty() => resolution.endpoint = endpoint,
            _ => {
                let message = format!("did not find endpoint of server '{server}'");
                self.report(&message);
                resolution.failure = Some(message);
            }
        }
        resolution.server_id = server;
        resolution
    }

    fn report(&self, message: &str) {
        report_connection_problem(self.log_connection_errors, message);
    }
}

/// Log a connection-related problem at `error` or `info`.
pub(crate) fn report_connection_problem(log_connection_errors: bool, message: &str) {
    if log_connection_errors {
        tracing::error!("{message}");
    } else {
        tracing::info!("{message}");
    }
}

/// URL handed to the transport for `endpoint` and `path`.
///
/// `tcp://` becomes `http://` and `ssl://` becomes `https://`.
///
/// ```
/// use shardcomm::endpoint_url;
///
/// assert_eq!(endpoint_url("tcp://h:1", "/_api/version"), "http://h:1/_api/version");
/// assert_eq!(endpoint_url("ssl://h:2", "/x"), "https://h:2/x");
/// ```
pub fn endpoint_url(endpoint: &str, path: &str) -> String {
    let base = if let Some(rest) = endpoint.strip_prefix(TCP_SCHEME) {
        format!("http://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix(SSL_SCHEME) {
        format!("https://{rest}")
    } else {
        endpoint.to_string()
    };
    format!("{base}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticDirectory;

    fn directory() -> StaticDirectory {
        let directory = StaticDirectory::new();
        directory.assign_shard("S1", "dbserver-1");
        directory.set_endpoint("dbserver-1", "tcp://h:1");
        directory
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            Destination::parse("shard:S1"),
            Some(Destination::Shard("S1".to_string()))
        );
        assert_eq!(
            Destination::parse("server:dbserver-1"),
            Some(Destination::Server("dbserver-1".to_string()))
        );
        assert_eq!(
            Destination::parse("ssl://h:1"),
            Some(Destination::Endpoint("ssl://h:1".to_string()))
        );
        assert_eq!(Destination::parse("bogus:foo"), None);
        assert_eq!(Destination::parse("http://h:1"), None);
    }

    #[test]
    fn test_display_round_trips() {
        for text in ["shard:S1", "server:dbserver-1", "tcp://h:1"] {
            let parsed = Destination::parse(text).expect("parses");
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn test_resolve_shard() {
        let directory = directory();
        let resolution = DestinationResolver::new(&directory, false).resolve("shard:S1");
        assert!(resolution.is_resolved());
        assert_eq!(resolution.shard_id, "S1");
        assert_eq!(resolution.server_id, "dbserver-1");
        assert_eq!(resolution.endpoint, "tcp://h:1");
    }

    #[test]
    fn test_resolve_server_skips_shard_step() {
        let directory = directory();
        let resolution = DestinationResolver::new(&directory, false).resolve("server:dbserver-1");
        assert!(resolution.is_resolved());
        assert_eq!(resolution.shard_id, "");
        assert_eq!(resolution.server_id, "dbserver-1");
        assert_eq!(resolution.endpoint, "tcp://h:1");
    }

    #[test]
    fn test_resolve_raw_endpoint_without_lookup() {
        let empty = StaticDirectory::new();
        let resolution = DestinationResolver::new(&empty, true).resolve("tcp://h:1");
        assert!(resolution.is_resolved());
        assert_eq!(resolution.server_id, "");
        assert_eq!(resolution.endpoint, "tcp://h:1");
    }

    #[test]
    fn test_resolve_unknown_grammar() {
        let directory = directory();
        let resolution = DestinationResolver::new(&directory, false).resolve("bogus:foo");
        assert!(!resolution.is_resolved());
        assert_eq!(
            resolution.failure.as_deref(),
            Some("did not understand destination 'bogus:foo'")
        );
        assert_eq!(resolution.endpoint, "");
    }

    #[test]
    fn test_resolve_missing_shard_owner() {
        let directory = directory();
        let resolution = DestinationResolver::new(&directory, true).resolve("shard:S9");
        assert_eq!(resolution.shard_id, "S9");
        assert!(resolution
            .failure
            .as_deref()
            .is_some_and(|msg| msg.contains("'S9'")));
    }

    #[test]
    fn test_resolve_missing_endpoint() {
        let directory = directory();
        directory.assign_shard("S2", "dbserver-2");
        let resolution = DestinationResolver::new(&directory, false).resolve("shard:S2");
        assert_eq!(resolution.server_id, "dbserver-2");
        assert_eq!(
            resolution.failure.as_deref(),
            Some("did not find endpoint of server 'dbserver-2'")
        );
    }

    #[test]
    fn test_apply_failure_marks_backend_unavailable() {
        let directory = directory();
        let resolution = DestinationResolver::new(&directory, false).resolve("bogus:foo");
        let mut record =
            OperationRecord::new(crate::Ticket::new(1), std::time::Duration::from_secs(1));
        resolution.apply_to(&mut record);
        assert_eq!(record.status, OpStatus::BackendUnavailable);
        assert!(record.error_message.contains("bogus:foo"));
    }
}
