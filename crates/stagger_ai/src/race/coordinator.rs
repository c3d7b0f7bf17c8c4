//! Race coordinator -- one loop per request that launches tiers on their
//! stagger schedule, declares the first usable output the winner, and
//! forwards only the winner's text.
//!
//! Attempts run as separate tasks and report back over a channel; the
//! attempt table lives inside the coordinator loop so every state change
//! happens in one place.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use super::attempt::{AttemptId, AttemptSnapshot, AttemptState, AttemptTable};
use super::policy::{RacePolicy, Tier};
use crate::executor::{AttemptExecutor, AttemptOutcome, AttemptOutput};
use crate::types::ChatMessage;

const EVENT_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Why a race ended without a complete answer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RaceError {
    #[error("All {attempts} attempts failed or timed out")]
    Exhausted { attempts: usize },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error("{model} stopped mid-reply: {reason}")]
    Interrupted { model: String, reason: String },
}

/// Final report of a race.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceSummary {
    /// The declared winner, if any attempt produced usable output.
    pub winner: Option<String>,
    pub error: Option<RaceError>,
    pub attempts: Vec<AttemptSnapshot>,
    pub elapsed: Duration,
}

/// Events emitted while a race runs. `Status` only appears before `Winner`;
/// `Token` only after it and only for the winning model. `Settled` is always
/// last.
#[derive(Debug, Clone, PartialEq)]
pub enum RaceEvent {
    Status(String),
    Winner { model: String },
    Token { model: String, text: String },
    Settled(RaceSummary),
}

/// Collected result of [`RaceCoordinator::run`].
#[derive(Debug, Clone)]
pub struct RaceResult {
    pub winner: Option<String>,
    pub answer: String,
    pub error: Option<RaceError>,
    pub attempts: Vec<AttemptSnapshot>,
}

impl RaceResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.winner.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct RaceRequest {
    pub messages: Vec<ChatMessage>,
    pub context: String,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct RaceCoordinator {
    executor: Arc<AttemptExecutor>,
    policy: RacePolicy,
}

impl RaceCoordinator {
    pub fn new(executor: AttemptExecutor, policy: RacePolicy) -> Self {
        Self {
            executor: Arc::new(executor),
            policy,
        }
    }

    pub fn policy(&self) -> &RacePolicy {
        &self.policy
    }

    /// Start a race in the background and return its event stream.
    ///
    /// Cancelling `cancel` (or dropping the receiver) stops every attempt;
    /// the stream still ends with `Settled`.
    pub fn subscribe(
        &self,
        request: RaceRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<RaceEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = info_span!(
            "race",
            request_id = %Uuid::new_v4(),
            mode = ?self.policy.mode(),
        );
        let race = Race::new(
            self.executor.clone(),
            self.policy.clone(),
            request,
            cancel,
            tx,
        );
        tokio::spawn(race.run().instrument(span));
        rx
    }

    /// Run a race to completion and collect the winner's text.
    pub async fn run(&self, request: RaceRequest, cancel: CancellationToken) -> RaceResult {
        let mut events = self.subscribe(request, cancel);
        let mut answer = String::new();
        while let Some(event) = events.recv().await {
            match event {
                RaceEvent::Token { text, .. } => answer.push_str(&text),
                RaceEvent::Settled(summary) => {
                    return RaceResult {
                        winner: summary.winner,
                        answer,
                        error: summary.error,
                        attempts: summary.attempts,
                    };
                }
                RaceEvent::Status(_) | RaceEvent::Winner { .. } => {}
            }
        }
        RaceResult {
            winner: None,
            answer,
            error: Some(RaceError::Cancelled),
            attempts: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Race loop
// ---------------------------------------------------------------------------

struct AttemptReport {
    id: AttemptId,
    outcome: AttemptOutcome,
}

enum Verdict {
    Won(AttemptId, AttemptOutput),
    Aborted(RaceError),
}

struct Race {
    executor: Arc<AttemptExecutor>,
    policy: RacePolicy,
    request: Arc<RaceRequest>,
    cancel: CancellationToken,
    events: mpsc::Sender<RaceEvent>,
    reports_tx: mpsc::UnboundedSender<AttemptReport>,
    reports_rx: mpsc::UnboundedReceiver<AttemptReport>,
    table: AttemptTable,
    origin: Instant,
    next_tier: usize,
}

impl Race {
    fn new(
        executor: Arc<AttemptExecutor>,
        policy: RacePolicy,
        request: RaceRequest,
        cancel: CancellationToken,
        events: mpsc::Sender<RaceEvent>,
    ) -> Self {
        let origin = Instant::now();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            executor,
            policy,
            request: Arc::new(request),
            cancel,
            events,
            reports_tx,
            reports_rx,
            table: AttemptTable::new(origin),
            origin,
            next_tier: 0,
        }
    }

    async fn run(mut self) {
        let deadline = self.origin + self.policy.request_deadline();
        let error = match self.race(deadline).await {
            Verdict::Won(id, output) => self.deliver(id, output, deadline).await.err(),
            Verdict::Aborted(error) => Some(error),
        };
        self.settle(error).await;
    }

    async fn race(&mut self, deadline: Instant) -> Verdict {
        loop {
            self.launch_due_tiers();

            if self.next_tier == self.policy.tiers().len() && self.table.in_flight() == 0 {
                return Verdict::Aborted(RaceError::Exhausted {
                    attempts: self.table.len(),
                });
            }

            let next_launch = self.next_launch_at();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.abort(RaceError::Cancelled),
                _ = self.events.closed() => return self.abort(RaceError::Cancelled),
                _ = sleep_until(deadline) => return self.abort(RaceError::DeadlineExceeded),
                Some(report) = self.reports_rx.recv() => {
                    if let Some(verdict) = self.record(report) {
                        return verdict;
                    }
                }
                _ = sleep_until(next_launch.unwrap_or(deadline)), if next_launch.is_some() => {}
            }
        }
    }

    fn launch_due_tiers(&mut self) {
        let now = Instant::now();
        while let Some(tier) = self.policy.tiers().get(self.next_tier) {
            if now < self.origin + tier.stagger {
                break;
            }
            if self.policy.is_exclusive() && self.table.in_flight() > 0 {
                break;
            }
            let tier = tier.clone();
            self.next_tier += 1;
            self.launch(&tier, now);
        }
    }

    fn launch(&mut self, tier: &Tier, now: Instant) {
        info!(
            tier = %tier.name,
            models = tier.models.len(),
            offset_ms = now.duration_since(self.origin).as_millis() as u64,
            "Launching tier"
        );
        let status = if self.policy.is_exclusive() {
            format!(
                "Trying model {} of {}...",
                self.next_tier,
                self.policy.tiers().len()
            )
        } else {
            format!("Trying {} models...", tier.name)
        };
        self.status(status);

        let deadline = now + self.policy.attempt_timeout();
        for model in &tier.models {
            let token = self.cancel.child_token();
            let id = self.table.insert(model.clone(), token.clone());
            self.table.start(id, now);
            let task = tokio::spawn(
                run_attempt(
                    self.executor.clone(),
                    self.request.clone(),
                    model.id.clone(),
                    id,
                    deadline,
                    token,
                    self.reports_tx.clone(),
                )
                .in_current_span(),
            );
            self.table.attach(id, task);
        }
    }

    fn next_launch_at(&self) -> Option<Instant> {
        let tier = self.policy.tiers().get(self.next_tier)?;
        let at = self.origin + tier.stagger;
        (at > Instant::now()).then_some(at)
    }

    fn record(&mut self, report: AttemptReport) -> Option<Verdict> {
        let AttemptReport { id, outcome } = report;
        if self.table.state(id).is_terminal() {
            return None;
        }
        let model = self.table.model(id).id.clone();

        match outcome {
            AttemptOutcome::Succeeded(output) => {
                if !self.table.declare_winner(id) {
                    return None;
                }
                let cancelled = self.table.cancel_all_except(Some(id));
                info!(
                    model = %model,
                    elapsed_ms = self.origin.elapsed().as_millis() as u64,
                    cancelled,
                    "Winner declared"
                );
                Some(Verdict::Won(id, output))
            }
            AttemptOutcome::Failed(e) => {
                warn!(model = %model, error = %e, "Attempt failed");
                self.table
                    .finish(id, AttemptState::Failed, Some(e.to_string()));
                self.still_racing();
                None
            }
            AttemptOutcome::TimedOut => {
                warn!(model = %model, "Attempt timed out");
                self.table
                    .finish(id, AttemptState::TimedOut, Some("timed out".into()));
                self.still_racing();
                None
            }
            AttemptOutcome::Cancelled => {
                self.table.finish(id, AttemptState::Cancelled, None);
                None
            }
        }
    }

    fn abort(&mut self, error: RaceError) -> Verdict {
        let cancelled = self.table.cancel_all_except(None);
        warn!(%error, cancelled, "Race aborted");
        Verdict::Aborted(error)
    }

    async fn deliver(
        &mut self,
        id: AttemptId,
        output: AttemptOutput,
        deadline: Instant,
    ) -> Result<(), RaceError> {
        let model = self.table.model(id).id.clone();
        self.emit(RaceEvent::Winner {
            model: model.clone(),
        })
        .await?;

        let (first, mut rest) = match output {
            AttemptOutput::Complete(text) => {
                return self.emit(RaceEvent::Token { model, text }).await;
            }
            AttemptOutput::Streaming { first, rest } => (first, rest),
        };
        self.emit(RaceEvent::Token {
            model: model.clone(),
            text: first,
        })
        .await?;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RaceError::Cancelled),
                _ = self.events.closed() => {
                    debug!(model = %model, "Race subscriber went away mid-reply");
                    return Err(RaceError::Cancelled);
                }
                _ = sleep_until(deadline) => return Err(RaceError::DeadlineExceeded),
                Some(late) = self.reports_rx.recv() => {
                    // Drop anything a loser produced before it saw its
                    // cancellation so its connection closes now.
                    debug!(model = %self.table.model(late.id).id, "Discarding late attempt result");
                }
                chunk = rest.recv() => match chunk {
                    Some(Ok(chunk)) => {
                        if !chunk.content.is_empty() {
                            self.emit(RaceEvent::Token {
                                model: model.clone(),
                                text: chunk.content,
                            })
                            .await?;
                        }
                        if chunk.done {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => {
                        warn!(model = %model, error = %e, "Winning stream failed");
                        return Err(RaceError::Interrupted {
                            model,
                            reason: e.to_string(),
                        });
                    }
                    None => {
                        return Err(RaceError::Interrupted {
                            model,
                            reason: "stream closed early".into(),
                        });
                    }
                },
            }
        }
    }

    async fn settle(mut self, error: Option<RaceError>) {
        // Losers have been cancelled; wait for their calls to be dropped so
        // nothing outlives the race.
        for task in self.table.take_tasks() {
            let _ = task.await;
        }

        let winner = self.table.winner().map(|id| self.table.model(id).id.clone());
        let summary = RaceSummary {
            winner,
            error,
            attempts: self.table.snapshot(),
            elapsed: self.origin.elapsed(),
        };
        match &summary.error {
            None => info!(
                winner = summary.winner.as_deref().unwrap_or_default(),
                attempts = summary.attempts.len(),
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Race settled"
            ),
            Some(error) => warn!(
                %error,
                attempts = summary.attempts.len(),
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Race settled without an answer"
            ),
        }
        let _ = self.events.send(RaceEvent::Settled(summary)).await;
    }

    async fn emit(&self, event: RaceEvent) -> Result<(), RaceError> {
        self.events.send(event).await.map_err(|_| {
            debug!("Race subscriber went away");
            RaceError::Cancelled
        })
    }

    /// Advisory only; dropped when the subscriber is slow.
    fn status(&self, message: String) {
        let _ = self.events.try_send(RaceEvent::Status(message));
    }

    fn still_racing(&self) {
        let in_flight = self.table.in_flight();
        if in_flight > 0 {
            self.status(format!("Still working ({in_flight} in flight)..."));
        } else if self.next_tier < self.policy.tiers().len() {
            self.status("Waiting for the next tier...".into());
        }
    }
}

async fn run_attempt(
    executor: Arc<AttemptExecutor>,
    request: Arc<RaceRequest>,
    model: String,
    id: AttemptId,
    deadline: Instant,
    cancel: CancellationToken,
    reports: mpsc::UnboundedSender<AttemptReport>,
) {
    debug!(model = %model, "Attempt started");
    let outcome = executor
        .execute(&model, &request.messages, &request.context, deadline, &cancel)
        .await;
    let _ = reports.send(AttemptReport { id, outcome });
}
