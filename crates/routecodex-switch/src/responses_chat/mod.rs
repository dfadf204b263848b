//! OpenAI Responses ↔ OpenAI Chat Completions.

pub mod request;
pub mod response;
pub mod stream;
