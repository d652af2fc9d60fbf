//! Method registry and async dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::client::Client;
use crate::context::RpcContext;
use crate::errors::RpcError;
use crate::method::Method;
use crate::types::{Envelope, Reply};

/// Method name of error envelopes.
pub const ERROR_METHOD: &str = "error";

/// Metric label for method names outside the method table.
const UNKNOWN_METHOD_LABEL: &str = "unknown";

/// Everything a handler knows about the request besides its params.
pub struct Call<'a> {
    /// Shared server state.
    pub ctx: &'a RpcContext,
    /// The client that sent the request.
    pub client: &'a Arc<Client>,
    /// `id` of the request envelope.
    pub id: u64,
    /// `requestId` of the request envelope.
    pub request_id: Option<u64>,
}

/// Trait implemented by every RPC method handler.
///
/// A handler may push any number of envelopes through `call.client`. A
/// returned [`Reply`] is sent as the answer with `requestId` set to the
/// request's `id`; an error is sent as an `error` envelope.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Execute the handler with the given params.
    async fn handle(&self, params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError>;
}

/// Registry mapping methods to handlers.
pub struct MethodRegistry {
    handlers: HashMap<Method, Arc<dyn MethodHandler>>,
    handler_timeout: Duration,
}

impl MethodRegistry {
    /// Maximum time a single handler is allowed to run.
    pub const HANDLER_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            handler_timeout: Self::HANDLER_TIMEOUT,
        }
    }

    /// Override [`Self::HANDLER_TIMEOUT`].
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Register a handler for a method.
    pub fn register(&mut self, method: Method, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method, Arc::new(handler));
    }

    /// Dispatch one inbound envelope from `client`.
    pub async fn dispatch(&self, envelope: Envelope, client: &Arc<Client>, ctx: &RpcContext) {
        let Envelope {
            id,
            request_id,
            method: name,
            params,
        } = envelope;
        // Metric labels only ever come from the method table.
        let method = name.parse::<Method>().ok();
        let label = method.map_or(UNKNOWN_METHOD_LABEL, Method::as_str);
        counter!("rpc_requests_total", "method" => label).increment(1);

        let handler = method.and_then(|m| self.handlers.get(&m));
        let Some(handler) = handler else {
            counter!("rpc_errors_total", "method" => label, "error_type" => "unsupported_method").increment(1);
            warn!(client_id = %client.id(), method = %name, id, "unsupported method");
            if ctx.report_unknown_methods {
                let err = RpcError::UnsupportedMethod {
                    method: name.clone(),
                };
                reply_error(client, id, &name, &err);
            }
            return;
        };

        let start = Instant::now();
        let call = Call {
            ctx,
            client,
            id,
            request_id,
        };
        let result = tokio::time::timeout(self.handler_timeout, handler.handle(params, &call)).await;
        match result {
            Err(_elapsed) => {
                counter!("rpc_errors_total", "method" => label, "error_type" => "timeout").increment(1);
                error!(client_id = %client.id(), method = %name, timeout = ?self.handler_timeout, "handler timed out");
                let err = RpcError::Internal {
                    message: format!("Handler for '{name}' timed out"),
                };
                reply_error(client, id, &name, &err);
            }
            Ok(Ok(Some(reply))) => {
                if let Err(e) = client.send(reply.method, reply.params, Some(id)) {
                    debug!(client_id = %client.id(), method = %name, error = %e, "reply not queued");
                }
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                counter!("rpc_errors_total", "method" => label, "error_type" => err.code()).increment(1);
                debug!(client_id = %client.id(), method = %name, code = err.code(), error = %err, "request failed");
                reply_error(client, id, &name, &err);
            }
        }

        let duration = start.elapsed();
        histogram!("rpc_request_duration_seconds", "method" => label)
            .record(duration.as_secs_f64());

        if duration.as_secs() >= 1 {
            warn!(
                method = %name,
                duration_secs = duration.as_secs_f64(),
                "slow RPC request"
            );
        }
    }

    /// List all registered methods (sorted by name).
    pub fn methods(&self) -> Vec<Method> {
        let mut methods: Vec<Method> = self.handlers.keys().copied().collect();
        methods.sort_by_key(|m| m.as_str());
        methods
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: Method) -> bool {
        self.handlers.contains_key(&method)
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .field("handler_timeout", &self.handler_timeout)
            .finish()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn reply_error(client: &Client, id: u64, method: &str, err: &RpcError) {
    let body = err.to_error_body(method);
    let params = serde_json::to_value(body).unwrap_or(Value::Null);
    if let Err(e) = client.send(ERROR_METHOD, params, Some(id)) {
        debug!(client_id = %client.id(), method, error = %e, "error reply not queued");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors;
    use crate::handlers::test_helpers::{drain, make_client, make_test_context};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::json;

    // ── Test handler implementations ────────────────────────────────

    struct EchoHandler;

    #[async_trait]
    impl MethodHandler for EchoHandler {
        async fn handle(&self, params: Value, _call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
            Ok(Some(Reply::new("echo", params)))
        }
    }

    struct SilentHandler;

    #[async_trait]
    impl MethodHandler for SilentHandler {
        async fn handle(&self, _params: Value, call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
            let _ = call.client.send("side", json!({"req": call.request_id}), Some(call.id));
            Ok(None)
        }
    }

    struct FailHandler;

    #[async_trait]
    impl MethodHandler for FailHandler {
        async fn handle(&self, _params: Value, _call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
            Err(RpcError::InvalidParams {
                message: "missing thing".into(),
            })
        }
    }

    struct StallHandler;

    #[async_trait]
    impl MethodHandler for StallHandler {
        async fn handle(&self, _params: Value, _call: &Call<'_>) -> Result<Option<Reply>, RpcError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    fn envelope(id: u64, method: &str, params: Value) -> Envelope {
        Envelope::new(id, None, method, params)
    }

    #[tokio::test]
    async fn reply_correlates_with_request_id() {
        let ctx = make_test_context();
        let (client, mut rx) = make_client(1, 8);
        let mut reg = MethodRegistry::new();
        reg.register(Method::ServerConnect, EchoHandler);

        reg.dispatch(envelope(7, "serverConnect", json!({"a": 1})), &client, &ctx)
            .await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 1);
        assert_eq!(sent[0].request_id, Some(7));
        assert_eq!(sent[0].method, "echo");
        assert_eq!(sent[0].params, json!({"a": 1}));
    }

    #[tokio::test]
    async fn handler_may_send_without_reply() {
        let ctx = make_test_context();
        let (client, mut rx) = make_client(1, 8);
        let mut reg = MethodRegistry::new();
        reg.register(Method::NodeChannelSend, SilentHandler);

        let env = Envelope::new(3, Some(2), "nodeChannelSend", json!({}));
        reg.dispatch(env, &client, &ctx).await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, "side");
        assert_eq!(sent[0].params["req"], 2);
    }

    #[tokio::test]
    async fn handler_error_becomes_error_envelope() {
        let ctx = make_test_context();
        let (client, mut rx) = make_client(1, 8);
        let mut reg = MethodRegistry::new();
        reg.register(Method::NodeRemove, FailHandler);

        reg.dispatch(envelope(5, "nodeRemove", json!({})), &client, &ctx)
            .await;

        let sent = drain(&mut rx);
        assert_eq!(sent[0].method, ERROR_METHOD);
        assert_eq!(sent[0].request_id, Some(5));
        assert_eq!(sent[0].params["code"], errors::INVALID_PARAMS);
        assert_eq!(sent[0].params["method"], "nodeRemove");
        assert_eq!(sent[0].params["message"], "missing thing");
    }

    #[tokio::test]
    async fn unknown_method_reported_when_enabled() {
        let ctx = make_test_context();
        let (client, mut rx) = make_client(1, 8);
        let reg = MethodRegistry::new();

        reg.dispatch(envelope(9, "nodeTeleport", json!({})), &client, &ctx)
            .await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].params["code"], errors::UNSUPPORTED_METHOD);
        assert_eq!(sent[0].request_id, Some(9));
    }

    #[tokio::test]
    async fn unknown_method_dropped_when_disabled() {
        let mut ctx = make_test_context();
        ctx.report_unknown_methods = false;
        let (client, mut rx) = make_client(1, 8);
        let reg = MethodRegistry::new();

        reg.dispatch(envelope(9, "nodeTeleport", json!({})), &client, &ctx)
            .await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn table_method_without_handler_is_unsupported() {
        let ctx = make_test_context();
        let (client, mut rx) = make_client(1, 8);
        let reg = MethodRegistry::new();

        reg.dispatch(envelope(1, "nodeGetList", json!({})), &client, &ctx)
            .await;
        let sent = drain(&mut rx);
        assert_eq!(sent[0].params["code"], errors::UNSUPPORTED_METHOD);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_handler_times_out_with_error() {
        let ctx = make_test_context();
        let (client, mut rx) = make_client(1, 8);
        let mut reg = MethodRegistry::new().with_handler_timeout(Duration::from_secs(5));
        reg.register(Method::NodeMigrate, StallHandler);

        reg.dispatch(envelope(4, "nodeMigrate", json!({})), &client, &ctx)
            .await;

        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, ERROR_METHOD);
        assert_eq!(sent[0].request_id, Some(4));
        assert_eq!(sent[0].params["code"], errors::INTERNAL_ERROR);
    }

    #[test]
    fn unknown_methods_share_one_metric_label() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let ctx = make_test_context();
        let (client, _rx) = make_client(1, 8);
        let mut reg = MethodRegistry::new();
        reg.register(Method::ServerConnect, EchoHandler);
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        metrics::with_local_recorder(&recorder, || {
            rt.block_on(async {
                for method in ["x1", "x2", "serverConnect"] {
                    reg.dispatch(envelope(1, method, json!({})), &client, &ctx)
                        .await;
                }
            });
        });

        let text = handle.render();
        assert!(text.contains(r#"rpc_requests_total{method="unknown"} 2"#));
        assert!(text.contains(r#"rpc_requests_total{method="serverConnect"} 1"#));
        assert!(!text.contains("x1"));
        assert!(!text.contains("x2"));
    }

    #[test]
    fn methods_sorted_and_queryable() {
        let mut reg = MethodRegistry::default();
        reg.register(Method::NodeRemove, FailHandler);
        reg.register(Method::NodeCreate, FailHandler);
        assert_eq!(reg.methods(), vec![Method::NodeCreate, Method::NodeRemove]);
        assert!(reg.has_method(Method::NodeCreate));
        assert!(!reg.has_method(Method::NodeGetList));
    }
}
