use crate::tool::{Tool, ToolDefinition};
use indexmap::IndexMap;
use std::sync::Arc;

/// Manages available tools, their schemas, and lookup. Registration order
/// is preserved so the definitions sent to the provider are deterministic.
pub struct ToolRegistry {
    tools: IndexMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: IndexMap::new(),
        }
    }

    /// Register a tool. Returns error if name already registered.
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let def = tool.definition();
        if self.tools.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        self.tools.insert(def.name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tool definitions (for sending to the provider).
    pub fn list(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Tool with name '{0}' is already registered")]
    DuplicateName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::LabelTool;

    #[test]
    fn register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(LabelTool).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get("label").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(LabelTool).unwrap();
        assert!(registry.register(LabelTool).is_err());
    }

    #[test]
    fn list_preserves_registration_order() {
        use crate::tool::{Tool, ToolDefinition, ToolError, ToolOrigin};
        use async_trait::async_trait;
        use tokio_util::sync::CancellationToken;

        struct Named(&'static str);

        #[async_trait]
        impl Tool for Named {
            fn definition(&self) -> ToolDefinition {
                ToolDefinition {
                    name: self.0.to_string(),
                    description: String::new(),
                    input_schema: serde_json::json!({"type": "object"}),
                    origin: ToolOrigin::default(),
                }
            }
            async fn invoke(
                &self,
                _arguments: serde_json::Value,
                _cancel: &CancellationToken,
            ) -> Result<String, ToolError> {
                Ok(String::new())
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Named("zebra")).unwrap();
        registry.register(Named("alpha")).unwrap();
        registry.register(Named("mango")).unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["zebra", "alpha", "mango"]);
    }
}
