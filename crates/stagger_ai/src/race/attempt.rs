use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::policy::ModelDescriptor;

pub(crate) type AttemptId = usize;

/// Lifecycle of one attempt. Transitions only move forward:
/// `Pending -> Running -> {Succeeded | Failed | TimedOut | Cancelled}`,
/// plus `Pending -> Cancelled` for attempts aborted before launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    fn can_become(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Cancelled) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

/// Read-only view of an attempt, reported once the race settles.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSnapshot {
    pub model: String,
    pub tier: usize,
    pub state: AttemptState,
    /// Offset from the start of the request at which the call was issued.
    pub started_after: Option<Duration>,
    pub failure: Option<String>,
}

struct AttemptEntry {
    model: ModelDescriptor,
    state: AttemptState,
    started_at: Option<Instant>,
    failure: Option<String>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Attempt bookkeeping for one request. Owned by the coordinator task, which
/// is the only writer.
pub(crate) struct AttemptTable {
    origin: Instant,
    entries: Vec<AttemptEntry>,
    winner: Option<AttemptId>,
}

impl AttemptTable {
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            entries: Vec::new(),
            winner: None,
        }
    }

    pub fn insert(&mut self, model: ModelDescriptor, cancel: CancellationToken) -> AttemptId {
        self.entries.push(AttemptEntry {
            model,
            state: AttemptState::Pending,
            started_at: None,
            failure: None,
            cancel,
            task: None,
        });
        self.entries.len() - 1
    }

    pub fn start(&mut self, id: AttemptId, at: Instant) -> bool {
        let moved = self.transition(id, AttemptState::Running);
        if moved {
            self.entries[id].started_at = Some(at);
        }
        moved
    }

    pub fn attach(&mut self, id: AttemptId, task: JoinHandle<()>) {
        self.entries[id].task = Some(task);
    }

    /// Record a non-winning terminal state.
    pub fn finish(&mut self, id: AttemptId, state: AttemptState, failure: Option<String>) -> bool {
        if state == AttemptState::Succeeded {
            return false;
        }
        let moved = self.transition(id, state);
        if moved {
            self.entries[id].failure = failure;
        }
        moved
    }

    /// Promote `id` to winner. Fails if a winner already exists or the
    /// attempt is no longer running.
    pub fn declare_winner(&mut self, id: AttemptId) -> bool {
        if self.winner.is_some() || !self.transition(id, AttemptState::Succeeded) {
            return false;
        }
        self.winner = Some(id);
        true
    }

    /// Cancel every attempt that has not reached a terminal state, except
    /// `keep`. Returns how many were cancelled.
    pub fn cancel_all_except(&mut self, keep: Option<AttemptId>) -> usize {
        let mut cancelled = 0;
        for (id, entry) in self.entries.iter_mut().enumerate() {
            if Some(id) == keep || entry.state.is_terminal() {
                continue;
            }
            entry.cancel.cancel();
            entry.state = AttemptState::Cancelled;
            cancelled += 1;
        }
        cancelled
    }

    pub fn state(&self, id: AttemptId) -> AttemptState {
        self.entries[id].state
    }

    pub fn model(&self, id: AttemptId) -> &ModelDescriptor {
        &self.entries[id].model
    }

    pub fn winner(&self) -> Option<AttemptId> {
        self.winner
    }

    pub fn in_flight(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn take_tasks(&mut self) -> Vec<JoinHandle<()>> {
        self.entries
            .iter_mut()
            .filter_map(|e| e.task.take())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<AttemptSnapshot> {
        self.entries
            .iter()
            .map(|e| AttemptSnapshot {
                model: e.model.id.clone(),
                tier: e.model.tier,
                state: e.state,
                started_after: e.started_at.map(|at| at.duration_since(self.origin)),
                failure: e.failure.clone(),
            })
            .collect()
    }

    fn transition(&mut self, id: AttemptId, next: AttemptState) -> bool {
        let entry = &mut self.entries[id];
        if !entry.state.can_become(next) {
            return false;
        }
        entry.state = next;
        true
    }
}
