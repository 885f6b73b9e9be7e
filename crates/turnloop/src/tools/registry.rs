// Tool registry
//
// Thread-safe name -> ToolDefinition map. The registry reaches the executor
// through the RunContext, never through Turn data, so live callables are never
// persisted. Re-registering a name replaces the earlier definition.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;

use super::definition::{ToolDefinition, ToolDescriptor};
use crate::error::ToolError;

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for fluent tool registration
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    /// Register `def` under `name`. A definition carrying a different name
    /// is rejected; an empty definition name is filled in.
    pub fn register(&self, name: &str, mut def: ToolDefinition) -> Result<(), ToolError> {
        if name.is_empty() {
            return Err(ToolError::EmptyName);
        }
        if !def.name.is_empty() && def.name != name {
            return Err(ToolError::NameMismatch {
                registered: name.to_string(),
                definition: def.name,
            });
        }
        def.name = name.to_string();
        self.tools.write().insert(name.to_string(), def);
        Ok(())
    }

    /// Register under the definition's own name
    pub fn register_tool(&self, def: ToolDefinition) -> Result<(), ToolError> {
        let name = def.name.clone();
        self.register(&name, def)
    }

    pub fn get(&self, name: &str) -> Result<ToolDefinition, ToolError> {
        self.tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.read().is_empty()
    }

    pub fn unregister(&self, name: &str) -> Result<ToolDefinition, ToolError> {
        self.tools
            .write()
            .remove(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// All definitions, ordered by name
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.read().values().cloned().collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.read().keys().cloned().collect()
    }

    /// Provider-facing descriptions, ordered by name
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .values()
            .map(ToolDefinition::descriptor)
            .collect()
    }

    /// New registry holding both sets; `other` wins on name conflicts
    pub fn merge(&self, other: &ToolRegistry) -> ToolRegistry {
        let mut tools = self.tools.read().clone();
        tools.extend(
            other
                .tools
                .read()
                .iter()
                .map(|(name, def)| (name.clone(), def.clone())),
        );
        ToolRegistry {
            tools: RwLock::new(tools),
        }
    }
}

/// Independent copy; later registrations on either side do not leak
impl Clone for ToolRegistry {
    fn clone(&self) -> Self {
        ToolRegistry {
            tools: RwLock::new(self.tools.read().clone()),
        }
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}

// ============================================================================
// ToolRegistryBuilder
// ============================================================================

#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool(mut self, def: ToolDefinition) -> Self {
        self.tools.push(def);
        self
    }

    /// Fails on the first definition without a name
    pub fn build(self) -> Result<ToolRegistry, ToolError> {
        let registry = ToolRegistry::new();
        for def in self.tools {
            registry.register_tool(def)?;
        }
        Ok(registry)
    }
}
