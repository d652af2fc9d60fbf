//! Server handlers: connect handshake.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;

use crate::errors::RpcError;
use crate::registry::{Call, MethodHandler};
use crate::types::Reply;

/// Returns server identity, supported node types, and the node count.
pub struct ServerConnectHandler;

#[async_trait]
impl MethodHandler for ServerConnectHandler {
    #[instrument(skip_all, fields(method = "serverConnect"))]
    async fn handle(&self, _params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
        let ctx = call.ctx;
        Ok(Some(Reply::new(
            "serverInfo",
            json!({
                "name": ctx.server_name,
                "version": env!("CARGO_PKG_VERSION"),
                "nodeTypes": ctx.nodes.node_types(),
                "nodeCount": ctx.nodes.node_count(),
                "uptimeSecs": ctx.server_start_time.elapsed().as_secs(),
            }),
        )))
    }
}
