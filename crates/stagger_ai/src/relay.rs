//! Stream relay -- turns race events into the caller-facing event stream.
//!
//! The relay is the only writer of the outward channel. It emits exactly one
//! terminal event per request, forwards tokens only from the declared
//! winner, and stops forwarding status updates once a winner exists.

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};

use crate::race::RaceEvent;

const OUT_BUFFER: usize = 64;

/// Event as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutEvent {
    Token(String),
    Status(String),
    Done { model_used: String },
    /// Generic failure; `message` is the user-facing busy text.
    Error { message: String },
}

impl OutEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// Server-sent-event frame, terminated by a blank line.
    pub fn to_frame(&self) -> String {
        let payload = match self {
            Self::Token(text) => json!({ "content": text }),
            Self::Status(text) => json!({ "status": text }),
            Self::Done { model_used } => json!({ "done": true, "modelUsed": model_used }),
            Self::Error { message } => json!({ "content": message }),
        };
        format!("data: {payload}\n\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RelayState {
    Idle,
    Racing,
    Delivering { winner: String },
    Finished,
}

pub struct StreamRelay {
    state: RelayState,
    busy_message: String,
}

impl StreamRelay {
    pub fn new(busy_message: impl Into<String>) -> Self {
        Self {
            state: RelayState::Idle,
            busy_message: busy_message.into(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == RelayState::Finished
    }

    /// Feed one race event; returns what, if anything, the caller should see.
    pub fn accept(&mut self, event: RaceEvent) -> Option<OutEvent> {
        match (&self.state, event) {
            (RelayState::Finished, _) => None,

            (RelayState::Idle | RelayState::Racing, RaceEvent::Status(text)) => {
                self.state = RelayState::Racing;
                Some(OutEvent::Status(text))
            }
            (RelayState::Idle | RelayState::Racing, RaceEvent::Winner { model }) => {
                self.state = RelayState::Delivering { winner: model };
                None
            }
            (RelayState::Delivering { winner }, RaceEvent::Token { model, text }) => {
                (*winner == model).then_some(OutEvent::Token(text))
            }

            (_, RaceEvent::Settled(summary)) => {
                self.state = RelayState::Finished;
                Some(match (summary.error, summary.winner) {
                    (None, Some(model_used)) => OutEvent::Done { model_used },
                    _ => self.busy(),
                })
            }

            // Status after a winner, tokens before one, a second winner.
            _ => None,
        }
    }

    /// The race went away without settling.
    pub fn finish(&mut self) -> Option<OutEvent> {
        if self.is_finished() {
            return None;
        }
        self.state = RelayState::Finished;
        Some(self.busy())
    }

    fn busy(&self) -> OutEvent {
        OutEvent::Error {
            message: self.busy_message.clone(),
        }
    }

    /// Relay `events` onto a new outward channel in the background.
    /// Dropping the returned receiver cancels `cancel`.
    pub fn spawn(
        mut self,
        mut events: mpsc::Receiver<RaceEvent>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<OutEvent> {
        let (tx, rx) = mpsc::channel(OUT_BUFFER);
        self.state = RelayState::Racing;

        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        _ = tx.closed() => {
                            debug!("Caller disconnected, cancelling race");
                            cancel.cancel();
                            return;
                        }
                        event = events.recv() => event,
                    };

                    let Some(event) = event else {
                        if let Some(out) = self.finish() {
                            let _ = tx.send(out).await;
                        }
                        return;
                    };

                    match self.accept(event) {
                        Some(OutEvent::Status(text)) => {
                            let _ = tx.try_send(OutEvent::Status(text));
                        }
                        Some(out) => {
                            let terminal = out.is_terminal();
                            if tx.send(out).await.is_err() {
                                cancel.cancel();
                                return;
                            }
                            if terminal {
                                return;
                            }
                        }
                        None => {}
                    }
                }
            }
            .in_current_span(),
        );
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stagger_core::{ReplyMode, TierConfig};

    use crate::executor::AttemptExecutor;
    use crate::providers::scripted::{Script, ScriptedProvider};
    use crate::race::{RaceCoordinator, RaceError, RacePolicy, RaceRequest, RaceSummary};
    use crate::types::ChatMessage;

    const BUSY: &str = "All models are busy.";

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn settled(winner: Option<&str>, error: Option<RaceError>) -> RaceEvent {
        RaceEvent::Settled(RaceSummary {
            winner: winner.map(str::to_string),
            error,
            attempts: Vec::new(),
            elapsed: Duration::ZERO,
        })
    }

    fn token(model: &str, text: &str) -> RaceEvent {
        RaceEvent::Token {
            model: model.into(),
            text: text.into(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<OutEvent>) -> Vec<OutEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    fn relay_race(provider: ScriptedProvider, tiers: Vec<TierConfig>, timeout: u64) -> mpsc::Receiver<OutEvent> {
        let policy = RacePolicy::staggered(tiers, ms(timeout), ms(30_000)).unwrap();
        let coordinator = RaceCoordinator::new(
            AttemptExecutor::new(Arc::new(provider), ReplyMode::Stream),
            policy,
        );
        let cancel = CancellationToken::new();
        let events = coordinator.subscribe(
            RaceRequest {
                messages: vec![ChatMessage::user("hi")],
                context: String::new(),
            },
            cancel.clone(),
        );
        StreamRelay::new(BUSY).spawn(events, cancel)
    }

    #[test]
    fn frames_match_the_wire_format() {
        assert_eq!(
            OutEvent::Token("Hi".into()).to_frame(),
            "data: {\"content\":\"Hi\"}\n\n"
        );
        assert_eq!(
            OutEvent::Status("Trying fast models...".into()).to_frame(),
            "data: {\"status\":\"Trying fast models...\"}\n\n"
        );
        let done: serde_json::Value = serde_json::from_str(
            OutEvent::Done {
                model_used: "m1".into(),
            }
            .to_frame()
            .trim_start_matches("data: ")
            .trim_end(),
        )
        .unwrap();
        assert_eq!(done, json!({ "done": true, "modelUsed": "m1" }));
        assert_eq!(
            OutEvent::Error {
                message: BUSY.into()
            }
            .to_frame(),
            format!("data: {{\"content\":\"{BUSY}\"}}\n\n")
        );
    }

    #[test]
    fn tokens_only_flow_from_the_winner() {
        let mut relay = StreamRelay::new(BUSY);
        assert_eq!(relay.accept(token("m2", "early")), None);
        assert_eq!(
            relay.accept(RaceEvent::Status("Trying".into())),
            Some(OutEvent::Status("Trying".into()))
        );
        assert_eq!(relay.accept(RaceEvent::Winner { model: "m1".into() }), None);
        assert_eq!(relay.accept(RaceEvent::Winner { model: "m2".into() }), None);
        assert_eq!(relay.accept(token("m2", "loser")), None);
        assert_eq!(
            relay.accept(token("m1", "Hello")),
            Some(OutEvent::Token("Hello".into()))
        );
        assert_eq!(relay.accept(RaceEvent::Status("late".into())), None);
        assert_eq!(
            relay.accept(settled(Some("m1"), None)),
            Some(OutEvent::Done {
                model_used: "m1".into()
            })
        );
    }

    #[test]
    fn exactly_one_terminal_event() {
        let mut relay = StreamRelay::new(BUSY);
        assert_eq!(
            relay.accept(settled(None, Some(RaceError::Exhausted { attempts: 3 }))),
            Some(OutEvent::Error {
                message: BUSY.into()
            })
        );
        assert!(relay.is_finished());
        assert_eq!(relay.accept(settled(Some("m1"), None)), None);
        assert_eq!(relay.accept(token("m1", "x")), None);
        assert_eq!(relay.finish(), None);
    }

    #[test]
    fn interrupted_winner_ends_with_busy_error() {
        let mut relay = StreamRelay::new(BUSY);
        relay.accept(RaceEvent::Winner { model: "m1".into() });
        relay.accept(token("m1", "par"));
        let interrupted = RaceError::Interrupted {
            model: "m1".into(),
            reason: "reset".into(),
        };
        assert_eq!(
            relay.accept(settled(Some("m1"), Some(interrupted))),
            Some(OutEvent::Error {
                message: BUSY.into()
            })
        );
    }

    #[test]
    fn vanished_race_still_gets_a_terminal() {
        let mut relay = StreamRelay::new(BUSY);
        assert_eq!(
            relay.finish(),
            Some(OutEvent::Error {
                message: BUSY.into()
            })
        );
        assert_eq!(relay.finish(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sse_reply_becomes_token_then_done() {
        let provider = ScriptedProvider::new().script(
            "m1",
            Script::Sse {
                after: ms(30),
                parts: vec![
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
                    "data: [DONE]\n\n",
                ],
            },
        );
        let out = drain(relay_race(provider, vec![TierConfig::new("t0", 0, &["m1"])], 6_000)).await;
        let without_status: Vec<OutEvent> = out
            .into_iter()
            .filter(|e| !matches!(e, OutEvent::Status(_)))
            .collect();
        assert_eq!(
            without_status,
            vec![
                OutEvent::Token("Hi".into()),
                OutEvent::Done {
                    model_used: "m1".into()
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_race_yields_no_tokens_and_one_error() {
        let provider = ScriptedProvider::new()
            .script("m1", Script::Hang)
            .script("m2", Script::Hang);
        let out = drain(relay_race(
            provider,
            vec![
                TierConfig::new("t0", 0, &["m1"]),
                TierConfig::new("t1", 500, &["m2"]),
            ],
            1_000,
        ))
        .await;

        assert!(out.iter().all(|e| !matches!(e, OutEvent::Token(_))));
        let terminals: Vec<&OutEvent> = out.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(
            terminals,
            vec![&OutEvent::Error {
                message: BUSY.into()
            }]
        );
        assert_eq!(out.last().map(OutEvent::is_terminal), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn loser_output_never_reaches_the_caller() {
        let provider = ScriptedProvider::new()
            .script(
                "a",
                Script::Tokens {
                    after: ms(100),
                    gap: ms(100),
                    tokens: vec!["a1", "a2"],
                },
            )
            .script(
                "b",
                Script::Tokens {
                    after: ms(150),
                    gap: ms(1),
                    tokens: vec!["b1", "b2"],
                },
            );
        let out = drain(relay_race(provider, vec![TierConfig::new("t0", 0, &["a", "b"])], 6_000)).await;
        let tokens: Vec<&OutEvent> = out
            .iter()
            .filter(|e| matches!(e, OutEvent::Token(_)))
            .collect();
        assert_eq!(
            tokens,
            vec![&OutEvent::Token("a1".into()), &OutEvent::Token("a2".into())]
        );
        assert_eq!(
            out.last(),
            Some(&OutEvent::Done {
                model_used: "a".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_receiver_cancels_the_race() {
        let (tx, events) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let out = StreamRelay::new(BUSY).spawn(events, cancel.clone());

        tx.send(RaceEvent::Status("Trying".into())).await.unwrap();
        drop(out);
        tokio::time::sleep(ms(10)).await;
        assert!(cancel.is_cancelled());
    }
}
