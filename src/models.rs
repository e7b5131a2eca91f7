//! Canonical, backend-agnostic conversation objects.
//!
//! Every backend speaks a different dialect of "chat with tools": Anthropic-style
//! typed content blocks, OpenAI-style role/content/tool_calls triples, and local
//! servers that embed tool intent in plain text. The adapters translate each of
//! those to and from the structs here, so nothing outside `providers` ever sees
//! a wire format.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
