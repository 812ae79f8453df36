//! Stream envelopes and the per-turn delivery state machine.
//!
//! A turn moves `Started -> Streaming(n) -> {Completed | Errored | Cancelled}`.
//! [`TurnTracker`] enforces the transitions and assembles the final message
//! from the chunks it has emitted, so a completed turn's text is always the
//! exact concatenation of its chunk payloads.

use serde::Serialize;
use thiserror::Error;

use crate::intent::Intent;
use crate::routing::SupportMenu;

/// The unit returned to a client once a turn completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub query: String,
    pub intent: Intent,
    pub message: String,
    pub support_menu: SupportMenu,
}

/// Wire shape shared by every transport: `{message, supportMessage}`.
#[derive(Debug, Clone, Serialize)]
pub struct TurnPayload {
    pub message: String,
    #[serde(rename = "supportMessage")]
    pub support_message: SupportMenu,
}

impl ConversationTurn {
    pub fn payload(&self) -> TurnPayload {
        TurnPayload {
            message: self.message.clone(),
            support_message: self.support_menu,
        }
    }
}

/// One message on the channel between the turn engine and a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEnvelope {
    Chunk { seq: u64, text: String },
    Complete(ConversationTurn),
    Error { message: String },
}

impl StreamEnvelope {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEnvelope::Chunk { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Started,
    /// Number of chunks emitted so far.
    Streaming(u64),
    Completed,
    Errored,
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnState::Completed | TurnState::Errored | TurnState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("turn is already {state:?}")]
pub struct TurnStateError {
    pub state: TurnState,
}

/// Tracks one turn's state and the text emitted so far.
#[derive(Debug)]
pub struct TurnTracker {
    state: TurnState,
    assembled: String,
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        Self {
            state: TurnState::Started,
            assembled: String::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Text emitted so far, in emission order.
    pub fn assembled(&self) -> &str {
        &self.assembled
    }

    fn ensure_open(&self) -> Result<(), TurnStateError> {
        if self.state.is_terminal() {
            return Err(TurnStateError { state: self.state });
        }
        Ok(())
    }

    /// Emit the next chunk. Sequence numbers start at 0 and increase by one.
    pub fn chunk(&mut self, text: impl Into<String>) -> Result<StreamEnvelope, TurnStateError> {
        self.ensure_open()?;
        let seq = match self.state {
            TurnState::Streaming(n) => n,
            _ => 0,
        };
        let text = text.into();
        self.assembled.push_str(&text);
        self.state = TurnState::Streaming(seq + 1);
        Ok(StreamEnvelope::Chunk { seq, text })
    }

    /// Close the turn successfully. The message is the assembled chunk text.
    pub fn complete(
        &mut self,
        query: impl Into<String>,
        intent: Intent,
        support_menu: SupportMenu,
    ) -> Result<StreamEnvelope, TurnStateError> {
        self.ensure_open()?;
        self.state = TurnState::Completed;
        Ok(StreamEnvelope::Complete(ConversationTurn {
            query: query.into(),
            intent,
            message: std::mem::take(&mut self.assembled),
            support_menu,
        }))
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<StreamEnvelope, TurnStateError> {
        self.ensure_open()?;
        self.state = TurnState::Errored;
        Ok(StreamEnvelope::Error {
            message: message.into(),
        })
    }

    /// Transport went away. Nothing further is emitted.
    pub fn cancel(&mut self) -> Result<(), TurnStateError> {
        self.ensure_open()?;
        self.state = TurnState::Cancelled;
        self.assembled.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::support_menu;

    #[test]
    fn chunks_then_complete_concatenate() {
        let mut t = TurnTracker::new();
        assert_eq!(t.state(), TurnState::Started);

        let mut emitted = String::new();
        for (i, piece) in ["Hel", "lo, ", "world"].iter().enumerate() {
            match t.chunk(*piece).unwrap() {
                StreamEnvelope::Chunk { seq, text } => {
                    assert_eq!(seq, i as u64);
                    emitted.push_str(&text);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(t.state(), TurnState::Streaming(3));

        let done = t.complete("hi", Intent::Other, support_menu(Intent::Other)).unwrap();
        let StreamEnvelope::Complete(turn) = done else {
            panic!("expected completion");
        };
        assert_eq!(turn.message, emitted);
        assert_eq!(turn.message, "Hello, world");
        assert_eq!(t.state(), TurnState::Completed);
    }

    #[test]
    fn no_chunks_after_terminal_states() {
        let mut done = TurnTracker::new();
        done.complete("q", Intent::Rp, support_menu(Intent::Rp)).unwrap();
        assert_eq!(
            done.chunk("late"),
            Err(TurnStateError { state: TurnState::Completed })
        );

        let mut failed = TurnTracker::new();
        failed.chunk("a").unwrap();
        failed.fail("boom").unwrap();
        assert!(failed.chunk("b").is_err());
        assert!(failed.complete("q", Intent::Rp, support_menu(Intent::Rp)).is_err());

        let mut cancelled = TurnTracker::new();
        cancelled.chunk("a").unwrap();
        cancelled.cancel().unwrap();
        assert_eq!(cancelled.state(), TurnState::Cancelled);
        assert!(cancelled.chunk("b").is_err());
        assert!(cancelled.fail("x").is_err());
        assert!(cancelled.cancel().is_err());
    }

    #[test]
    fn completion_without_chunks_is_allowed() {
        let mut t = TurnTracker::new();
        let env = t.complete("q", Intent::Refund, support_menu(Intent::Refund)).unwrap();
        assert!(env.is_terminal());
        let StreamEnvelope::Complete(turn) = env else {
            panic!("expected completion");
        };
        assert!(turn.message.is_empty());
    }

    #[test]
    fn payload_uses_support_message_key() {
        let turn = ConversationTurn {
            query: "q".into(),
            intent: Intent::AdBooking,
            message: "pick one".into(),
            support_menu: support_menu(Intent::AdBooking),
        };
        let json = serde_json::to_value(turn.payload()).unwrap();
        assert_eq!(json["message"], "pick one");
        assert_eq!(json["supportMessage"]["options"][1], "Agency");
    }
}
