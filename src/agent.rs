//! The sampling loop: model call, tool dispatch, turn closure, repeated until
//! the model stops asking for tools or a stop condition fires.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::detection::{LoopAction, LoopPolicy, LoopSignal, LoopTracker, ObserveOnly};
use crate::errors::{AgentError, ProviderError};
use crate::models::message::{Message, Segment, ToolCallSegment, ToolResultSegment, Transcript};
use crate::providers::base::{ProviderAdapter, ProviderOptions};
use crate::telemetry::{emit, EventKind, NullSink, TelemetrySink};
use crate::tools::ToolDispatcher;

const DEFAULT_REFUSAL_RETRY_LIMIT: usize = 2;
const DEFAULT_LOOP_THRESHOLD: usize = 3;
const DEFAULT_IMAGE_CHUNK: usize = 10;
const TOOL_OUTPUT_PREVIEW: usize = 200;

/// Lowercased substrings that mark a refusal turn.
const REFUSAL_MARKERS: &[&str] = &[
    "i cannot",
    "i can't",
    "unable to",
    "i am not able",
    "no access to",
    "i apologize",
];

const REFUSAL_REMINDER: &str = "Please continue with the task using the tools available to you. \
If the current approach is blocked, try a different one rather than stopping.";

/// Per-run knobs. Everything here is fixed for the duration of one `run`.
#[derive(Clone)]
pub struct LoopConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub thinking_budget: Option<u32>,
    /// Beta flags forwarded to backends that take them.
    pub betas: Vec<String>,
    pub max_model_calls: Option<usize>,
    /// Keep only the newest N tool-result images; `None` keeps everything.
    pub only_n_most_recent_images: Option<usize>,
    /// Images are removed in multiples of this to avoid constant cache churn.
    pub image_chunk_size: usize,
    pub refusal_retry_limit: usize,
    pub loop_threshold: usize,
    pub enable_prompt_caching: bool,
    pub extra_options: Map<String, Value>,
}

impl LoopConfig {
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            temperature: 0.0,
            max_output_tokens: 4096,
            thinking_budget: None,
            betas: Vec::new(),
            max_model_calls: None,
            only_n_most_recent_images: None,
            image_chunk_size: DEFAULT_IMAGE_CHUNK,
            refusal_retry_limit: DEFAULT_REFUSAL_RETRY_LIMIT,
            loop_threshold: DEFAULT_LOOP_THRESHOLD,
            enable_prompt_caching: false,
            extra_options: Map::new(),
        }
    }

    pub fn with_extra<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.extra_options.insert(key.into(), value);
        self
    }
}

/// Why `run` stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The model ended its turn without tool calls.
    Completed,
    TimedOut,
    ModelCallLimit,
    /// The loop policy asked for termination.
    LoopInterrupted(LoopSignal),
    ToolSetup(AgentError),
    Provider(ProviderError),
}

/// The transcript as accumulated when the run stopped, plus the reason. The
/// transcript is returned on every path, including errors.
#[derive(Debug)]
pub struct RunOutcome {
    pub transcript: Transcript,
    pub stop: StopReason,
}

type SegmentCallback = Arc<dyn Fn(&Segment) + Send + Sync>;
type ToolResultCallback = Arc<dyn Fn(&ToolResultSegment) + Send + Sync>;
type TimeoutPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Drives one task to completion against a provider adapter and a tool set.
/// Exclusive owner of the transcript while `run` executes.
pub struct Agent {
    adapter: Arc<dyn ProviderAdapter>,
    dispatcher: ToolDispatcher,
    config: LoopConfig,
    telemetry: Arc<dyn TelemetrySink>,
    loop_policy: Arc<dyn LoopPolicy>,
    timeout_predicate: Option<TimeoutPredicate>,
    on_segment: Option<SegmentCallback>,
    on_tool_result: Option<ToolResultCallback>,
}

impl Agent {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        dispatcher: ToolDispatcher,
        config: LoopConfig,
    ) -> Self {
        Self {
            adapter,
            dispatcher,
            config,
            telemetry: Arc::new(NullSink),
            loop_policy: Arc::new(ObserveOnly),
            timeout_predicate: None,
            on_segment: None,
            on_tool_result: None,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn with_loop_policy(mut self, policy: Arc<dyn LoopPolicy>) -> Self {
        self.loop_policy = policy;
        self
    }

    /// Cooperative timeout: polled at iteration start and again right before
    /// each model call. There is no mid-call cancellation.
    pub fn with_timeout_predicate(mut self, predicate: TimeoutPredicate) -> Self {
        self.timeout_predicate = Some(predicate);
        self
    }

    pub fn with_segment_callback(mut self, callback: SegmentCallback) -> Self {
        self.on_segment = Some(callback);
        self
    }

    pub fn with_tool_result_callback(mut self, callback: ToolResultCallback) -> Self {
        self.on_tool_result = Some(callback);
        self
    }

    /// Run the loop until the model finishes or a stop condition fires.
    /// Remote tool sessions are connected before the first turn and cleaned up
    /// on every exit path.
    pub async fn run(&mut self, mut transcript: Transcript) -> RunOutcome {
        if let Err(err) = self.dispatcher.connect().await {
            self.dispatcher.cleanup().await;
            return RunOutcome {
                transcript,
                stop: StopReason::ToolSetup(err),
            };
        }
        let stop = self.run_inner(&mut transcript).await;
        if !matches!(stop, StopReason::Provider(_)) {
            self.save_best_effort().await;
        }
        self.dispatcher.cleanup().await;
        emit(
            self.telemetry.as_ref(),
            EventKind::Terminated,
            &json!({"stop": format!("{stop:?}")}),
        );
        RunOutcome { transcript, stop }
    }

    async fn run_inner(&self, transcript: &mut Transcript) -> StopReason {
        let tools = self.dispatcher.tool_specs();
        let caching = self.config.enable_prompt_caching && self.adapter.supports_prompt_caching();
        let mut tracker = LoopTracker::with_threshold(self.config.loop_threshold);
        let mut model_calls: usize = 0;
        let mut refusal_retries: usize = 0;

        loop {
            if self.timed_out() {
                return StopReason::TimedOut;
            }
            if let Some(limit) = self.config.max_model_calls {
                if model_calls >= limit {
                    return StopReason::ModelCallLimit;
                }
            }

            if caching {
                inject_prompt_caching(transcript);
            } else if let Some(keep) = self.config.only_n_most_recent_images {
                filter_recent_images(transcript, keep, self.config.image_chunk_size);
            }

            emit(
                self.telemetry.as_ref(),
                EventKind::TurnStarted,
                &json!({"model_calls": model_calls}),
            );

            if self.timed_out() {
                return StopReason::TimedOut;
            }
            let options = self.provider_options();
            let request = match self.adapter.prepare_request(transcript, &tools, &options) {
                Ok(request) => request,
                Err(err) => return StopReason::Provider(err),
            };
            let response = match self.adapter.invoke(&request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!("model call failed: {err}");
                    return StopReason::Provider(err);
                }
            };
            let mut message = match self.adapter.parse_response(&response) {
                Ok(message) => message,
                Err(err) => return StopReason::Provider(err),
            };
            model_calls += 1;
            let (input_tokens, output_tokens) = message.usage();
            emit(
                self.telemetry.as_ref(),
                EventKind::ModelResponse,
                &json!({
                    "input_tokens": input_tokens,
                    "output_tokens": output_tokens,
                    "model_calls": model_calls,
                }),
            );

            let calls: Vec<ToolCallSegment> = message.tool_calls().cloned().collect();
            if !calls.is_empty() && message.text().is_empty() {
                message
                    .segments
                    .insert(0, Segment::text(describe_calls(&calls)));
            }
            if let Some(callback) = &self.on_segment {
                for segment in &message.segments {
                    callback(segment);
                }
            }

            if calls.is_empty() {
                let done = message.text().to_lowercase();
                transcript.push(message);
                if is_refusal(&done) && refusal_retries < self.config.refusal_retry_limit {
                    refusal_retries += 1;
                    debug!(attempt = refusal_retries, "refusal detected, reminding");
                    emit(
                        self.telemetry.as_ref(),
                        EventKind::RefusalRetry,
                        &json!({"attempt": refusal_retries}),
                    );
                    transcript.push(Message::user().with_text(REFUSAL_REMINDER));
                    continue;
                }
                return StopReason::Completed;
            }
            refusal_retries = 0;

            for call in &calls {
                if let Some(signal) = tracker.record(call) {
                    emit(
                        self.telemetry.as_ref(),
                        EventKind::LoopDetected,
                        &json!({"signal": format!("{signal:?}")}),
                    );
                    if self.loop_policy.on_loop(&signal) == LoopAction::Terminate {
                        transcript.push(message);
                        return StopReason::LoopInterrupted(signal);
                    }
                }
            }

            transcript.push(message);
            let mut results = Message::user();
            for call in &calls {
                emit(
                    self.telemetry.as_ref(),
                    EventKind::ToolCallStarted,
                    &json!({
                        "tool": call.tool_name,
                        "arguments": preview(
                            serde_json::to_string(&call.arguments).ok().as_deref(),
                        ),
                    }),
                );
                let result = self.dispatcher.dispatch(call).await;
                emit(
                    self.telemetry.as_ref(),
                    EventKind::ToolExecuted,
                    &json!({
                        "tool": call.tool_name,
                        "is_error": result.is_error,
                        "output": preview(result.output_text.as_deref()),
                    }),
                );
                if let Some(callback) = &self.on_tool_result {
                    callback(&result);
                }
                results.segments.push(Segment::ToolResult(result));
            }
            transcript.push(results);
        }
    }

    fn provider_options(&self) -> ProviderOptions {
        let mut options = ProviderOptions::new(self.config.model.clone());
        options.temperature = self.config.temperature;
        options.max_output_tokens = self.config.max_output_tokens;
        options.thinking_budget = self.config.thinking_budget;
        options.extra_options = self.config.extra_options.clone();
        if !self.config.betas.is_empty() {
            options
                .extra_options
                .insert("anthropic_betas".to_string(), json!(self.config.betas));
        }
        options
    }

    fn timed_out(&self) -> bool {
        self.timeout_predicate
            .as_ref()
            .map(|predicate| predicate())
            .unwrap_or(false)
    }

    /// Best-effort save keystroke through a local computer tool, so work in
    /// open editors survives the end of the session.
    async fn save_best_effort(&self) {
        if !self.dispatcher.local().contains("computer") {
            return;
        }
        let mut arguments = Map::new();
        arguments.insert("action".to_string(), json!("key"));
        arguments.insert("text".to_string(), json!("ctrl+s"));
        if let Err(err) = self.dispatcher.local().run("computer", &arguments).await {
            debug!("save keystroke failed: {err}");
        }
    }
}

fn is_refusal(lowercased_text: &str) -> bool {
    REFUSAL_MARKERS
        .iter()
        .any(|marker| lowercased_text.contains(marker))
}

/// One-line stand-in text for a tool-only turn.
fn describe_calls(calls: &[ToolCallSegment]) -> String {
    let described: Vec<String> = calls
        .iter()
        .map(|call| {
            let salient = ["action", "command", "path"]
                .iter()
                .find_map(|key| call.arguments.get(*key))
                .and_then(Value::as_str);
            match salient {
                Some(argument) => format!("{}({})", call.tool_name, argument),
                None => call.tool_name.clone(),
            }
        })
        .collect();
    format!("Using {}.", described.join(", "))
}

fn preview(text: Option<&str>) -> String {
    text.unwrap_or_default()
        .chars()
        .take(TOOL_OUTPUT_PREVIEW)
        .collect()
}

/// Mark the final segment of the three most recent user turns as cache
/// breakpoints and unmark the turn that just aged out. Walking further back is
/// unnecessary since only one turn ages out per iteration.
pub(crate) fn inject_prompt_caching(transcript: &mut Transcript) {
    let mut breakpoints_remaining = 3;
    for message in transcript.messages.iter_mut().rev() {
        if message.role != crate::models::role::Role::User {
            continue;
        }
        let Some(last) = message.segments.last_mut() else {
            continue;
        };
        if breakpoints_remaining > 0 {
            breakpoints_remaining -= 1;
            last.set_cache_control(true);
        } else {
            last.set_cache_control(false);
            break;
        }
    }
}

/// Drop the oldest tool-result images so at most `keep` remain, removing in
/// multiples of `chunk` so the retained prefix stays stable between turns.
pub(crate) fn filter_recent_images(transcript: &mut Transcript, keep: usize, chunk: usize) {
    let total: usize = transcript
        .messages
        .iter()
        .flat_map(|message| message.segments.iter())
        .filter_map(Segment::as_tool_result)
        .map(|result| result.images.len())
        .sum();
    let mut to_remove = total.saturating_sub(keep);
    if chunk > 1 {
        to_remove -= to_remove % chunk;
    }
    if to_remove == 0 {
        return;
    }
    for message in &mut transcript.messages {
        for segment in &mut message.segments {
            if let Segment::ToolResult(result) = segment {
                while to_remove > 0 && !result.images.is_empty() {
                    result.images.remove(0);
                    to_remove -= 1;
                }
            }
        }
        if to_remove == 0 {
            break;
        }
    }
}
