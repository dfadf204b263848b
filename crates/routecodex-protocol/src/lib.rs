//! Wire types for the three entry protocols and the SSE framing shared by all
//! of them.
//!
//! The structs here are envelopes: the fields the gateway routes on or
//! rewrites are typed, everything else rides along untouched in `extra` maps
//! so unknown provider fields survive a round-trip.

pub mod claude;
pub mod openai;
pub mod sse;

pub use sse::{SseEvent, SseParser, encode_comment, encode_event};
