use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::errors::{AgentError, AgentResult};
use crate::models::tool::ToolSpec;

use super::{LocalTool, ToolOutput};

/// The set of in-process tools exposed to the model. Insertion order is
/// preserved so tool listings are stable across runs.
#[derive(Default)]
pub struct ToolCollection {
    tools: HashMap<String, Arc<dyn LocalTool>>,
    order: Vec<String>,
}

impl ToolCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn LocalTool>) -> Self {
        self.add(tool);
        self
    }

    pub fn add(&mut self, tool: Arc<dyn LocalTool>) {
        let name = tool.name();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn LocalTool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn to_specs(&self) -> Vec<ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.spec())
            .collect()
    }

    pub async fn run(&self, name: &str, arguments: &Map<String, Value>) -> AgentResult<ToolOutput> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;
        tool.run(arguments).await
    }
}
