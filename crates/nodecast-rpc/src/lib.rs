//! # nodecast-rpc
//!
//! Protocol layer of the nodecast broker.
//!
//! - [`Envelope`]: the `{id, requestId, method, params}` message shape
//! - [`Method`]: the fixed method table
//! - [`MethodRegistry`]: method → handler dispatch with error replies
//! - [`Client`]: one protocol endpoint, independent of its transport
//! - [`handlers`]: server, node, and channel methods

#![deny(unsafe_code)]

pub mod client;
pub mod context;
pub mod errors;
pub mod handlers;
pub mod method;
pub mod registry;
pub mod types;

pub use client::{Client, ClientState};
pub use context::RpcContext;
pub use errors::RpcError;
pub use method::Method;
pub use registry::{Call, MethodHandler, MethodRegistry};
pub use types::{Envelope, ErrorBody, Reply};
