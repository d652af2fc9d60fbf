//! # nodecast-core
//!
//! Data model of the nodecast broker: nodes, the channels they own, the
//! registry that tracks them, and the pluggable node types that decide what
//! a node does.
//!
//! - [`Channel`]: a named value with an ordered subscriber set and
//!   broadcast-on-change
//! - [`Node`]: an identified, typed collection of channels
//! - [`NodeManager`]: create, remove, migrate, and look up nodes and channels
//! - [`NodeTypeRegistry`]: type tag → [`NodeFactory`]
//! - [`node_types`]: the built-in `variable` and `timer` types
//! - [`logging`]: tracing subscriber setup shared by the binaries

#![deny(unsafe_code)]

pub mod channel;
pub mod channel_registry;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod manager;
pub mod node;
pub mod node_type;
pub mod node_types;

pub use channel::{
    BroadcastReport, Channel, ChannelSubscriber, ChannelUpdate, DeliveryError, EchoPolicy,
};
pub use channel_registry::ChannelRegistry;
pub use errors::NodeError;
pub use ids::{ChannelId, NodeId, SubscriberId};
pub use manager::NodeManager;
pub use node::{Node, NodeSpec};
pub use node_type::{Migration, NodeBehavior, NodeFactory, NodeParts, NodeTypeRegistry};
