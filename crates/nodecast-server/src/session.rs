//! Session lifecycle: one [`Connection`] from accept through disconnect.
//!
//! Both listeners end up here, so clients behave identically regardless of
//! transport.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use nodecast_core::SubscriberId;
use nodecast_rpc::{Client, Envelope, MethodRegistry, RpcContext};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::clients::{ClientSet, ConnectionSlot};
use crate::metrics::{
    CONNECTION_DURATION_SECONDS, CONNECTIONS_ACTIVE, CONNECTIONS_TOTAL, DISCONNECTIONS_TOTAL,
    TRANSPORT_ERRORS_TOTAL,
};
use crate::transport::{Connection, ConnectionEvent};

/// How long the writer may keep flushing queued envelopes after close.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State every session needs. Cheap to clone.
#[derive(Clone, Debug)]
pub struct SessionDeps {
    /// Method table.
    pub registry: Arc<MethodRegistry>,
    /// Shared handler state.
    pub ctx: Arc<RpcContext>,
    /// Live clients.
    pub clients: Arc<ClientSet>,
    /// Outbound queue capacity per client.
    pub outbound_buffer: usize,
}

/// Run a session for an accepted connection.
///
/// 1. Registers a new [`Client`] in the live set
/// 2. Spawns the writer draining the client's outbound queue into the sink
/// 3. Activates the client on `Connect` and dispatches every `Message`
/// 4. On `Close`, a fatal error, or client destruction, destroys the client
///    (dropping all of its subscriptions) and deregisters it
#[instrument(skip_all, fields(client_id = %client_id, transport = conn.kind().as_str()))]
pub async fn run_session<C: Connection>(
    conn: C,
    client_id: SubscriberId,
    slot: ConnectionSlot,
    deps: SessionDeps,
) {
    let kind = conn.kind();
    let peer = conn.peer();
    let (mut events, mut sink) = conn.into_parts();

    let (tx, mut rx) = mpsc::channel::<Envelope>(deps.outbound_buffer.max(1));
    let client = Arc::new(Client::new(client_id, tx));

    let started = Instant::now();
    info!(peer, "client connected");
    counter!(CONNECTIONS_TOTAL, "transport" => kind.as_str()).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    deps.clients.add(Arc::clone(&client)).await;

    let closed = client.closed_token();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => {
                    let Some(envelope) = msg else { break };
                    if let Err(e) = sink.send(envelope).await {
                        if e.is_fatal() {
                            debug!(error = %e, "outbound transport failed");
                            break;
                        }
                        warn!(error = %e, "dropping outbound envelope");
                    }
                }
                () = closed.cancelled() => break,
            }
        }
        let _ = sink.close().await;
    });

    let closed = client.closed_token();
    loop {
        let event = tokio::select! {
            event = events.next() => event,
            () = closed.cancelled() => break,
        };
        let Some(event) = event else { break };
        match event {
            ConnectionEvent::Connect => {
                let _ = client.activate();
            }
            ConnectionEvent::Message(envelope) => {
                deps.registry.dispatch(envelope, &client, &deps.ctx).await;
            }
            ConnectionEvent::Error(e) => {
                let fatal = e.is_fatal();
                counter!(
                    TRANSPORT_ERRORS_TOTAL,
                    "transport" => kind.as_str(),
                    "fatal" => if fatal { "true" } else { "false" }
                )
                .increment(1);
                if fatal {
                    warn!(error = %e, "transport failed");
                    break;
                }
                warn!(error = %e, "discarding inbound unit");
            }
            ConnectionEvent::Close => break,
        }
    }

    // Clean up
    let _ = client.destroy(&deps.ctx.nodes);
    let _ = deps.clients.remove(client_id).await;
    drop(slot);
    info!(peer, "client disconnected");
    counter!(DISCONNECTIONS_TOTAL, "transport" => kind.as_str()).increment(1);
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(CONNECTION_DURATION_SECONDS, "transport" => kind.as_str())
        .record(started.elapsed().as_secs_f64());

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("writer did not drain in time");
        abort.abort();
    }
}
