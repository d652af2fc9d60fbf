//! Built-in node types.

mod timer;
mod variable;

pub use timer::{TimerFactory, TimerNode};
pub use variable::{VariableFactory, VariableNode};

use crate::node_type::NodeTypeRegistry;

/// Add every built-in node type to `registry`.
pub fn register_builtin(registry: &mut NodeTypeRegistry) {
    registry.register(VariableFactory);
    registry.register(TimerFactory);
}

/// A registry holding only the built-in node types.
pub fn builtin_registry() -> NodeTypeRegistry {
    let mut registry = NodeTypeRegistry::new();
    register_builtin(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_registered() {
        assert_eq!(builtin_registry().type_names(), vec!["timer", "variable"]);
    }
}
