use crate::callbacks::GuardEvent;
use crate::election::Decision;
use crate::model::{LeaderState, TabRecord};

/// A state change worth telling anyone about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Activated { from: LeaderState },
    Conflicted { winner: TabRecord, was_active: bool },
}

impl Transition {
    /// Events this transition raises, in delivery order.
    pub fn events(&self, tab_id: &str) -> Vec<GuardEvent> {
        match self {
            Self::Unchanged => Vec::new(),
            Self::Activated { .. } => vec![GuardEvent::Activated {
                tab_id: tab_id.to_string(),
            }],
            Self::Conflicted { winner, was_active } => {
                let mut events = Vec::with_capacity(2);
                if *was_active {
                    events.push(GuardEvent::Deactivated {
                        tab_id: tab_id.to_string(),
                    });
                }
                events.push(GuardEvent::Conflict {
                    tab_id: tab_id.to_string(),
                    winner: winner.clone(),
                });
                events
            }
        }
    }
}

/// Per-tab leadership state machine: `Unclaimed -> Active <-> Conflicted`.
///
/// Staying in a state is silent, so the conflict and activation events fire
/// once per transition however often the election re-runs.
#[derive(Debug, Default)]
pub struct Detector {
    state: LeaderState,
    winner: Option<String>,
}

impl Detector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LeaderState {
        self.state
    }

    /// The peer this tab is yielding to, while conflicted.
    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    pub fn apply(&mut self, decision: Decision) -> Transition {
        match decision {
            Decision::Lead => {
                self.winner = None;
                if self.state == LeaderState::Active {
                    return Transition::Unchanged;
                }
                let from = std::mem::replace(&mut self.state, LeaderState::Active);
                Transition::Activated { from }
            }
            Decision::Yield(winner) => {
                self.winner = Some(winner.id.clone());
                if self.state == LeaderState::Conflicted {
                    return Transition::Unchanged;
                }
                let was_active = self.state == LeaderState::Active;
                self.state = LeaderState::Conflicted;
                Transition::Conflicted { winner, was_active }
            }
        }
    }

    /// Back to `Unclaimed`, silently (used when the tab stops).
    pub fn reset(&mut self) {
        self.state = LeaderState::Unclaimed;
        self.winner = None;
    }
}
