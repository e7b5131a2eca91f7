pub mod collection;
pub mod dispatch;
pub mod remote;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::errors::AgentResult;
use crate::models::content::ImageSource;
use crate::models::message::ToolResultSegment;
use crate::models::tool::ToolSpec;

pub use collection::ToolCollection;
pub use dispatch::ToolDispatcher;
pub use remote::RemoteToolProvider;

/// What a tool execution produced. Any combination of fields may be set;
/// `error` marks the execution as failed without aborting the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub output: Option<String>,
    pub error: Option<String>,
    pub base64_image: Option<ImageSource>,
    /// Out-of-band note for the model, rendered inside `<system>` tags.
    pub system: Option<String>,
}

impl ToolOutput {
    pub fn text<S: Into<String>>(output: S) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn error<S: Into<String>>(error: S) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: ImageSource) -> Self {
        self.base64_image = Some(image);
        self
    }

    pub fn with_system<S: Into<String>>(mut self, system: S) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Fold this output into the canonical result segment for `call_id`.
    pub fn into_segment(self, call_id: &str) -> ToolResultSegment {
        let is_error = self.error.is_some();
        ToolResultSegment {
            call_id: call_id.to_string(),
            output_text: self.error.or(self.output),
            images: self.base64_image.into_iter().collect(),
            is_error,
            system_note: self.system,
            annotations: None,
        }
    }
}

/// A tool executed in-process.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    fn name(&self) -> String {
        self.spec().name
    }

    async fn run(&self, arguments: &Map<String, Value>) -> AgentResult<ToolOutput>;
}
