use tracing::error;

use common::{EngineEvent, Error, Result};

/// Lifecycle of a single instrument's trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    /// No position, no pending order.
    Flat,
    /// A candidate signal is being scored.
    Evaluating,
    /// An entry order is out, awaiting the execution result.
    PendingEntry,
    /// A position is live; stops and targets are enforced per candle.
    Open,
    /// A close order is out, awaiting the execution result.
    Exiting,
}

impl TradeState {
    pub fn name(self) -> &'static str {
        match self {
            TradeState::Flat => "Flat",
            TradeState::Evaluating => "Evaluating",
            TradeState::PendingEntry => "PendingEntry",
            TradeState::Open => "Open",
            TradeState::Exiting => "Exiting",
        }
    }

    /// The complete set of legal transitions. Anything not listed here is
    /// a correctness bug in the caller, not a market condition.
    pub fn can_transition(self, to: TradeState) -> bool {
        use TradeState::*;
        matches!(
            (self, to),
            (Flat, Evaluating)
                | (Evaluating, Flat)
                | (Evaluating, PendingEntry)
                | (PendingEntry, Open)
                | (PendingEntry, Flat)
                | (Open, Exiting)
                | (Exiting, Flat)
        )
    }
}

/// Transition guard around `TradeState`.
///
/// An illegal transition halts the machine permanently: the engine must
/// never keep trading after its own bookkeeping has diverged from reality.
#[derive(Debug)]
pub struct StateMachine {
    state: TradeState,
    halted: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: TradeState::Flat,
            halted: false,
        }
    }

    pub fn state(&self) -> TradeState {
        self.state
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Halt without a transition, for divergence detected outside the
    /// transition table (e.g. an Open state with no tracked position).
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn transition(&mut self, to: TradeState) -> Result<EngineEvent> {
        if self.halted {
            return Err(Error::InconsistentState {
                from: self.state.name(),
                to: to.name(),
            });
        }
        if !self.state.can_transition(to) {
            self.halted = true;
            error!(
                from = self.state.name(),
                to = to.name(),
                "Illegal state transition, halting"
            );
            return Err(Error::InconsistentState {
                from: self.state.name(),
                to: to.name(),
            });
        }
        let from = self.state.name();
        self.state = to;
        Ok(EngineEvent::Transition {
            from,
            to: to.name(),
        })
    }
}
