use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn rand_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..SUFFIX_ALPHABET.len());
            SUFFIX_ALPHABET[idx] as char
        })
        .collect()
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Mint a request id: `req_<ms>_<rand8>`. Assigned at ingress when the client
/// did not supply one; propagates to snapshots, logs, and upstream headers.
pub fn new_request_id() -> String {
    format!("req_{}_{}", now_millis(), rand_suffix(8))
}

/// Mint a Responses-protocol response id used to correlate tool-loop
/// continuations.
pub fn new_response_id() -> String {
    format!("resp_{}_{}", now_millis(), rand_suffix(12))
}

/// Mint a tool-call id for calls synthesized out of text markup.
pub fn new_tool_call_id() -> String {
    format!("call_{}", rand_suffix(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_prefixed() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
        let suffix = a.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 8);
    }
}
