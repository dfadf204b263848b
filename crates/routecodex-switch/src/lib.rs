//! LLMSwitch: pair-wise converters between the three entry protocols.
//!
//! The canonical in-gateway form is OpenAI Chat Completions for chat-style
//! routes and OpenAI Responses for Responses routes; Anthropic Messages
//! always converts through the chat canonical. Converters are pure functions
//! except for the small state carried through streaming (delta joining and
//! tool-call assembly).

pub mod claude_chat;
pub mod collect;
pub mod responses_chat;
pub mod synthesize;
pub mod toolcall;
