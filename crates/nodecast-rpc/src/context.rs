//! RPC dependency-injection context.

use std::sync::Arc;
use std::time::Instant;

use nodecast_core::{EchoPolicy, NodeManager};

/// Shared context passed to every RPC handler.
pub struct RpcContext {
    /// Node registry.
    pub nodes: Arc<NodeManager>,
    /// Name this broker process reports in `serverInfo`.
    pub server_name: String,
    /// Whether a client's own `nodeChannelSend` is echoed back to it.
    pub echo_policy: EchoPolicy,
    /// Answer unknown methods with an `UNSUPPORTED_METHOD` error instead of
    /// dropping them.
    pub report_unknown_methods: bool,
    /// When the server started.
    pub server_start_time: Instant,
}

impl RpcContext {
    /// Context with default settings around `nodes`.
    pub fn new(nodes: Arc<NodeManager>, server_name: impl Into<String>) -> Self {
        Self {
            nodes,
            server_name: server_name.into(),
            echo_policy: EchoPolicy::default(),
            report_unknown_methods: true,
            server_start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("server_name", &self.server_name)
            .field("echo_policy", &self.echo_policy)
            .field("report_unknown_methods", &self.report_unknown_methods)
            .finish_non_exhaustive()
    }
}
