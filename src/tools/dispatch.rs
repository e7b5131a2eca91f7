use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::errors::{AgentError, AgentResult};
use crate::models::message::{ToolCallSegment, ToolResultSegment};
use crate::models::tool::ToolSpec;

use super::{RemoteToolProvider, ToolCollection, ToolOutput};

/// Routes tool calls to their executor: in-process tools first, then remote
/// providers in registration order. Execution failures become error-flagged
/// result segments so the model can react; they never abort the loop.
pub struct ToolDispatcher {
    local: ToolCollection,
    remote: Vec<Box<dyn RemoteToolProvider>>,
    /// Tool names served by each remote provider, cached at connect time.
    remote_tools: Vec<Vec<ToolSpec>>,
}

impl ToolDispatcher {
    pub fn new(local: ToolCollection) -> Self {
        Self {
            local,
            remote: Vec::new(),
            remote_tools: Vec::new(),
        }
    }

    pub fn with_remote(mut self, provider: Box<dyn RemoteToolProvider>) -> Self {
        self.remote.push(provider);
        self
    }

    pub fn local(&self) -> &ToolCollection {
        &self.local
    }

    /// Connect every remote provider and cache its tool listing. A provider
    /// that fails to connect fails the whole startup.
    pub async fn connect(&mut self) -> AgentResult<()> {
        self.remote_tools.clear();
        for provider in &mut self.remote {
            provider.connect().await?;
        }
        for provider in &self.remote {
            self.remote_tools.push(provider.list_tools().await?);
        }
        Ok(())
    }

    /// Tear down remote sessions. Failures are logged and swallowed so that
    /// cleanup of later providers still runs.
    pub async fn cleanup(&mut self) {
        for provider in &mut self.remote {
            if let Err(err) = provider.cleanup().await {
                warn!("remote tool provider cleanup failed: {err}");
            }
        }
        self.remote_tools.clear();
    }

    /// Combined tool listing offered to the model. Local tools shadow remote
    /// tools of the same name.
    pub fn tool_specs(&self) -> Vec<ToolSpec> {
        let mut specs = self.local.to_specs();
        for provider_tools in &self.remote_tools {
            for spec in provider_tools {
                if !specs.iter().any(|existing| existing.name == spec.name) {
                    specs.push(spec.clone());
                }
            }
        }
        specs
    }

    /// Execute one tool call and fold the outcome into a result segment.
    pub async fn dispatch(&self, call: &ToolCallSegment) -> ToolResultSegment {
        debug!(tool = %call.tool_name, call_id = %call.call_id, "dispatching tool call");
        match self.execute(&call.tool_name, &call.arguments).await {
            Ok(output) => output.into_segment(&call.call_id),
            Err(err) => {
                warn!(tool = %call.tool_name, "tool execution failed: {err}");
                ToolOutput::error(err.to_string()).into_segment(&call.call_id)
            }
        }
    }

    async fn execute(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> AgentResult<ToolOutput> {
        if self.local.contains(name) {
            return self.local.run(name, arguments).await;
        }
        for (provider, tools) in self.remote.iter().zip(&self.remote_tools) {
            if tools.iter().any(|spec| spec.name == name) {
                return provider.call_tool(name, arguments).await;
            }
        }
        Err(AgentError::ToolNotFound(name.to_string()))
    }
}
