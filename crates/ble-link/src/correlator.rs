//! Command/response correlation
//!
//! The interpreter answers one command at a time and terminates every
//! reply with the `>` prompt. Notifications arrive as arbitrary fragments,
//! so the correlator accumulates them until the prompt shows up and then
//! resolves the single outstanding request.

use obd_protocol::ObdError;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// End-of-response marker
pub const PROMPT: char = '>';

/// Identifies one armed request
pub type RequestId = u64;

/// Receives the trimmed response text or the failure that ended the request
pub type ResponseReceiver = oneshot::Receiver<Result<String, ObdError>>;

#[derive(Debug)]
struct PendingRequest {
    id: RequestId,
    buffer: Vec<u8>,
    responder: oneshot::Sender<Result<String, ObdError>>,
}

/// Tracks at most one outstanding command
#[derive(Debug, Default)]
pub struct Correlator {
    next_id: RequestId,
    pending: Option<PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request with an empty buffer
    ///
    /// Any request still pending is abandoned; its receiver observes a
    /// closed channel.
    pub fn arm(&mut self) -> (RequestId, ResponseReceiver) {
        if let Some(stale) = self.pending.take() {
            warn!(
                request = stale.id,
                buffered = stale.buffer.len(),
                "Abandoning unanswered request"
            );
        }
        self.next_id = self.next_id.wrapping_add(1);
        let (responder, receiver) = oneshot::channel();
        self.pending = Some(PendingRequest {
            id: self.next_id,
            buffer: Vec::new(),
            responder,
        });
        (self.next_id, receiver)
    }

    /// Append a notification fragment
    ///
    /// Returns the id of the request resolved by this fragment, if any.
    /// Fragments with no pending request are discarded.
    pub fn feed(&mut self, fragment: &[u8]) -> Option<RequestId> {
        let Some(pending) = self.pending.as_mut() else {
            debug!(bytes = fragment.len(), "Discarding unsolicited notification");
            return None;
        };
        pending.buffer.extend_from_slice(fragment);

        // Characters may straddle fragments
        let end = pending.buffer.iter().position(|&b| b == PROMPT as u8)?;
        let response = String::from_utf8_lossy(&pending.buffer[..end])
            .trim()
            .to_string();
        let pending = self.pending.take()?;
        debug!(request = pending.id, response = %response, "Response complete");
        // Receiver may have timed out already
        let _ = pending.responder.send(Ok(response));
        Some(pending.id)
    }

    /// Drop the request if it is still the pending one
    pub fn cancel(&mut self, id: RequestId) -> bool {
        if self.pending.as_ref().map(|p| p.id) == Some(id) {
            self.pending = None;
            true
        } else {
            false
        }
    }

    /// Fail the pending request, if any
    pub fn fail(&mut self, error: ObdError) -> bool {
        match self.pending.take() {
            Some(pending) => {
                let _ = pending.responder.send(Err(error));
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fragments_resolve_once() {
        let mut correlator = Correlator::new();
        let (id, mut rx) = correlator.arm();

        assert_eq!(correlator.feed(b"4"), None);
        assert_eq!(correlator.feed(b"3 0"), None);
        assert_eq!(correlator.feed(b"1 33 00 00 00 00 00>"), Some(id));

        assert_eq!(rx.try_recv().unwrap(), Ok("43 01 33 00 00 00 00".to_string()));
        assert!(!correlator.is_pending());
        assert_eq!(correlator.feed(b"\r>"), None);
    }

    #[test]
    fn test_response_is_trimmed() {
        let mut correlator = Correlator::new();
        let (_, mut rx) = correlator.arm();
        correlator.feed(b"\r\nOK\r\r>");
        assert_eq!(rx.try_recv().unwrap(), Ok("OK".to_string()));
    }

    #[test]
    fn test_text_after_prompt_is_dropped() {
        let mut correlator = Correlator::new();
        let (_, mut rx) = correlator.arm();
        correlator.feed(b"41 0C 1A F8\r>STRAY");
        assert_eq!(rx.try_recv().unwrap(), Ok("41 0C 1A F8".to_string()));
    }

    #[test]
    fn test_split_multibyte_character() {
        let mut correlator = Correlator::new();
        let (_, mut rx) = correlator.arm();
        let reply = "12.6V \u{00B0}C\r>".as_bytes();
        let split = reply.iter().position(|&b| b == 0xC2).unwrap() + 1;

        assert_eq!(correlator.feed(&reply[..split]), None);
        correlator.feed(&reply[split..]);
        assert_eq!(rx.try_recv().unwrap(), Ok("12.6V \u{00B0}C".to_string()));
    }

    #[test]
    fn test_unsolicited_fragment_discarded() {
        let mut correlator = Correlator::new();
        assert_eq!(correlator.feed(b"OK\r>"), None);

        let (_, mut rx) = correlator.arm();
        correlator.feed(b"NO DATA\r>");
        assert_eq!(rx.try_recv().unwrap(), Ok("NO DATA".to_string()));
    }

    #[test]
    fn test_cancel_only_matches_current() {
        let mut correlator = Correlator::new();
        let (first, _rx1) = correlator.arm();
        let (second, _rx2) = correlator.arm();
        assert_ne!(first, second);
        assert!(!correlator.cancel(first));
        assert!(correlator.cancel(second));
        assert!(!correlator.is_pending());
    }

    #[test]
    fn test_rearm_closes_stale_receiver() {
        let mut correlator = Correlator::new();
        let (_, mut stale) = correlator.arm();
        let (_, _fresh) = correlator.arm();
        assert!(matches!(
            stale.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_fail_delivers_error() {
        let mut correlator = Correlator::new();
        let (_, mut rx) = correlator.arm();
        assert!(correlator.fail(ObdError::NotConnected));
        assert_eq!(rx.try_recv().unwrap(), Err(ObdError::NotConnected));
        assert!(!correlator.fail(ObdError::NotConnected));
    }

    proptest! {
        #[test]
        fn prop_any_split_resolves_once(
            payload in "[0-9A-F ]{0,40}",
            cuts in proptest::collection::vec(0usize..48, 0..6),
        ) {
            let reply = format!("{}\r\r>", payload);
            let mut points: Vec<usize> = cuts.into_iter().map(|c| c.min(reply.len())).collect();
            points.push(0);
            points.push(reply.len());
            points.sort_unstable();
            points.dedup();

            let mut correlator = Correlator::new();
            let (id, mut rx) = correlator.arm();
            let mut resolved = Vec::new();
            for window in points.windows(2) {
                if let Some(done) = correlator.feed(reply[window[0]..window[1]].as_bytes()) {
                    resolved.push(done);
                }
            }

            prop_assert_eq!(resolved, vec![id]);
            prop_assert_eq!(rx.try_recv().unwrap(), Ok(payload.trim().to_string()));
        }
    }
}
