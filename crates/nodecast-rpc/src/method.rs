//! The fixed table of protocol methods.

use std::fmt;
use std::str::FromStr;

/// Every method a client may send.
///
/// Parsing is an explicit name table; a name that is not listed here has no
/// handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// Server identity, node types, node count.
    ServerConnect,
    /// All node ids.
    NodeGetList,
    /// Create and start a node.
    NodeCreate,
    /// Reserved.
    NodeUpdate,
    /// Remove a node.
    NodeRemove,
    /// Run a node's migration hook.
    NodeMigrate,
    /// Channel ids of one node.
    NodeGetChannelList,
    /// Current value of a channel.
    NodeChannelRead,
    /// Set a channel's value.
    NodeChannelSend,
    /// Subscribe to a channel.
    NodeChannelWatch,
    /// Unsubscribe from a channel.
    NodeChannelUnwatch,
}

impl Method {
    /// All methods, in table order.
    pub const ALL: [Self; 11] = [
        Self::ServerConnect,
        Self::NodeGetList,
        Self::NodeCreate,
        Self::NodeUpdate,
        Self::NodeRemove,
        Self::NodeMigrate,
        Self::NodeGetChannelList,
        Self::NodeChannelRead,
        Self::NodeChannelSend,
        Self::NodeChannelWatch,
        Self::NodeChannelUnwatch,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerConnect => "serverConnect",
            Self::NodeGetList => "nodeGetList",
            Self::NodeCreate => "nodeCreate",
            Self::NodeUpdate => "nodeUpdate",
            Self::NodeRemove => "nodeRemove",
            Self::NodeMigrate => "nodeMigrate",
            Self::NodeGetChannelList => "nodeGetChannelList",
            Self::NodeChannelRead => "nodeChannelRead",
            Self::NodeChannelSend => "nodeChannelSend",
            Self::NodeChannelWatch => "nodeChannelWatch",
            Self::NodeChannelUnwatch => "nodeChannelUnwatch",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name that is not in the method table.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| UnknownMethod(s.to_owned()))
    }
}
