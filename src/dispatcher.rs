//! The chat engine: runs one turn and streams its envelopes to a transport.
//!
//! Each turn runs in its own task and talks to the transport through a
//! bounded `mpsc` channel. The transport owns the receiver; dropping it
//! (client disconnect) closes the channel, which the engine observes at
//! every suspension point and answers by cancelling the turn and dropping
//! any in-flight generation stream.
//!
//! Recovered failures follow one rule: if nothing has been sent yet, the
//! turn substitutes a safe fallback text and still completes; once text is
//! on the wire, a generation failure ends the turn with an error envelope.

use std::sync::Arc;

use futures::StreamExt;
use patrika_assist_core::envelope::{ConversationTurn, StreamEnvelope, TurnState, TurnTracker};
use patrika_assist_core::models::RetrievalResult;
use patrika_assist_core::routing::ResponseStrategy;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

use crate::agents::{Answer, ResponseAssembler};
use crate::generation::TextGenerator;
use crate::retriever::Retriever;
use crate::router::IntentRouter;

const CHANNEL_CAPACITY: usize = 32;

/// A turn that ended with an error envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TurnFailed(pub String);

/// Receiving side of a running turn. Dropping it cancels the turn.
pub struct TurnHandle {
    pub id: Uuid,
    pub events: mpsc::Receiver<StreamEnvelope>,
}

#[derive(Clone)]
pub struct ChatEngine {
    router: IntentRouter,
    retriever: Retriever,
    assembler: ResponseAssembler,
    generator: Arc<dyn TextGenerator>,
}

/// Returned by [`ChatEngine::emit`] when the transport has gone away.
struct Disconnected;

impl ChatEngine {
    pub fn new(
        router: IntentRouter,
        retriever: Retriever,
        assembler: ResponseAssembler,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            router,
            retriever,
            assembler,
            generator,
        }
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Spawn a turn and return its envelope stream.
    pub fn start_turn(&self, query: impl Into<String>) -> TurnHandle {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = Uuid::new_v4();
        let engine = self.clone();
        let query = query.into();
        let span = tracing::info_span!("turn", turn_id = %id);
        tokio::spawn(
            async move {
                engine.run_turn(&query, tx).await;
            }
            .instrument(span),
        );
        TurnHandle { id, events: rx }
    }

    /// Run a turn to completion, discarding chunk envelopes.
    pub async fn collect_turn(&self, query: impl Into<String>) -> Result<ConversationTurn, TurnFailed> {
        let mut handle = self.start_turn(query);
        while let Some(envelope) = handle.events.recv().await {
            match envelope {
                StreamEnvelope::Chunk { .. } => continue,
                StreamEnvelope::Complete(turn) => return Ok(turn),
                StreamEnvelope::Error { message } => return Err(TurnFailed(message)),
            }
        }
        Err(TurnFailed("turn ended without a result".to_string()))
    }

    async fn emit(
        tx: &mpsc::Sender<StreamEnvelope>,
        tracker: &mut TurnTracker,
        envelope: Result<StreamEnvelope, patrika_assist_core::envelope::TurnStateError>,
    ) -> Result<(), Disconnected> {
        let envelope = match envelope {
            Ok(e) => e,
            Err(e) => {
                // Illegal transition: an engine bug, never sent to the client.
                tracing::error!(error = %e, "dropping envelope");
                return Ok(());
            }
        };
        if tx.send(envelope).await.is_err() {
            let _ = tracker.cancel();
            return Err(Disconnected);
        }
        Ok(())
    }

    /// Drive one turn, sending envelopes on `tx`. Returns the final state.
    pub async fn run_turn(&self, query: &str, tx: mpsc::Sender<StreamEnvelope>) -> TurnState {
        let mut tracker = TurnTracker::new();

        let plan = tokio::select! {
            plan = self.router.plan(query) => plan,
            _ = tx.closed() => return cancelled(&mut tracker, "classification"),
        };
        tracing::debug!(intent = %plan.intent, shortcut = plan.shortcut, "planned");

        let context = if plan.strategy == ResponseStrategy::Grounded {
            tokio::select! {
                ctx = self.retriever.retrieve(
                    query,
                    self.retriever.top_k(),
                    self.retriever.default_filter(),
                ) => ctx,
                _ = tx.closed() => return cancelled(&mut tracker, "retrieval"),
            }
        } else {
            RetrievalResult::empty()
        };

        match self.assembler.prepare(plan.strategy, query, &context) {
            Answer::Fixed(text) => {
                let env = tracker.chunk(text);
                if Self::emit(&tx, &mut tracker, env).await.is_err() {
                    return cancelled(&mut tracker, "delivery");
                }
            }
            Answer::Generate {
                prompt,
                params,
                fallback,
            } => {
                let started = tokio::select! {
                    s = self.generator.stream(&prompt, &params) => s,
                    _ = tx.closed() => return cancelled(&mut tracker, "generation"),
                };
                match started {
                    Ok(mut deltas) => loop {
                        let next = tokio::select! {
                            biased;
                            _ = tx.closed() => return cancelled(&mut tracker, "generation"),
                            item = deltas.next() => item,
                        };
                        match next {
                            Some(Ok(delta)) if delta.is_empty() => continue,
                            Some(Ok(delta)) => {
                                let env = tracker.chunk(delta);
                                if Self::emit(&tx, &mut tracker, env).await.is_err() {
                                    return cancelled(&mut tracker, "delivery");
                                }
                            }
                            Some(Err(e)) if tracker.state() == TurnState::Started => {
                                tracing::warn!(error = %e, "generation failed before any output; using fallback");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "generation failed mid-stream");
                                let env = tracker.fail(format!("Response generation failed: {e}"));
                                let _ = Self::emit(&tx, &mut tracker, env).await;
                                return tracker.state();
                            }
                            None => break,
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "generation unavailable; using fallback");
                    }
                }

                if tracker.state() == TurnState::Started {
                    let env = tracker.chunk(fallback);
                    if Self::emit(&tx, &mut tracker, env).await.is_err() {
                        return cancelled(&mut tracker, "delivery");
                    }
                }
            }
        }

        let chunks = match tracker.state() {
            TurnState::Streaming(n) => n,
            _ => 0,
        };
        let env = tracker.complete(query, plan.intent, plan.menu);
        if Self::emit(&tx, &mut tracker, env).await.is_err() {
            return cancelled(&mut tracker, "delivery");
        }
        tracing::info!(intent = %plan.intent, chunks, "turn completed");
        tracker.state()
    }
}

fn cancelled(tracker: &mut TurnTracker, stage: &str) -> TurnState {
    let _ = tracker.cancel();
    tracing::info!(stage, "client disconnected; turn cancelled");
    TurnState::Cancelled
}
