//! Shared fixture for engine integration tests.
//!
//! Builds a small in-process cluster:
//! - shards `s1`, `s2`, `s3` owned by `dbserver-1`, `dbserver-2`, `dbserver-3`
//! - each server reachable at `tcp://dbN:8529`
//! - the coordinator itself (`crdn-1`) reachable at `tcp://crdn:8529`

#![allow(dead_code)]

use std::sync::Arc;

use shardcomm::{
    CommConfig, CommEngine, HandlerAction, LoopbackTransport, Request, StaticDirectory,
};

/// Install a test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

/// Endpoint of `dbserver-N`.
pub fn server_endpoint(n: usize) -> String {
    format!("tcp://db{n}:8529")
}

pub const COORDINATOR_ENDPOINT: &str = "tcp://crdn:8529";

pub struct Cluster {
    pub transport: Arc<LoopbackTransport>,
    pub directory: Arc<StaticDirectory>,
    pub engine: CommEngine<LoopbackTransport, StaticDirectory>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(CommConfig::local().with_originator_id("crdn-1"))
    }

    pub fn with_config(config: CommConfig) -> Self {
        init_tracing();
        let transport = Arc::new(LoopbackTransport::new());
        let directory = Arc::new(StaticDirectory::new());
        for n in 1..=3 {
            directory.assign_shard(format!("s{n}"), format!("dbserver-{n}"));
            directory.set_endpoint(format!("dbserver-{n}"), server_endpoint(n));
        }
        directory.set_endpoint("crdn-1", COORDINATOR_ENDPOINT);

        let engine = CommEngine::new(config, transport.clone(), directory.clone());
        engine.start().expect("engine starts");
        Self {
            transport,
            directory,
            engine,
        }
    }

    /// Serve `dbserver-n` with `handler`.
    pub fn serve<F>(&self, n: usize, handler: F)
    where
        F: Fn(&Request) -> HandlerAction + Send + Sync + 'static,
    {
        self.transport.register_handler(&server_endpoint(n), handler);
    }
}
