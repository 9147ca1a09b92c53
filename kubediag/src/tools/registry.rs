use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use super::{ToolDescriptor, ToolSpec};
use crate::error::{RegistryError, ToolError};

static TOOL_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid tool name regex"));

pub fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME.is_match(name)
}

/// Immutable-once-published set of tools, in registration order.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if !is_valid_tool_name(&descriptor.name) {
            return Err(RegistryError::InvalidToolName(descriptor.name));
        }
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateToolName(descriptor.name));
        }
        self.index.insert(descriptor.name.clone(), self.tools.len());
        self.tools.push(descriptor);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor, ToolError> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn list(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDescriptor::spec).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
