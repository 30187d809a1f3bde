//! Realization lifecycle state.
//!
//! Every case carries a state map with one entry per realization. Entries
//! move forward along `Undefined -> Initialized -> HasData`, or to one of the
//! failure states from anywhere. A realization never silently falls back to
//! `Undefined`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lifecycle state of one realization within a case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealizationState {
    /// Nothing has been written for this realization.
    Undefined,
    /// Parameters are in place; no simulated responses yet.
    Initialized,
    /// Simulated responses were loaded successfully.
    HasData,
    /// Loading results (or init files) for this realization failed.
    LoadFailure,
    /// The realization it was derived from had failed.
    ParentFailure,
}

impl RealizationState {
    /// Returns true if `self -> next` is a legal transition.
    ///
    /// Setting the current state again is always legal.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (_, Self::LoadFailure | Self::ParentFailure)
                | (Self::Undefined, Self::Undefined | Self::Initialized)
                | (Self::Initialized, Self::Initialized | Self::HasData)
                | (Self::LoadFailure, Self::Initialized | Self::HasData)
                | (Self::HasData, Self::HasData)
        )
    }

    /// Returns true for the two failure states.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::LoadFailure | Self::ParentFailure)
    }

    /// Canonical upper-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undefined => "UNDEFINED",
            Self::Initialized => "INITIALIZED",
            Self::HasData => "HAS_DATA",
            Self::LoadFailure => "LOAD_FAILURE",
            Self::ParentFailure => "PARENT_FAILURE",
        }
    }
}

impl fmt::Display for RealizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-length per-realization state vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMap {
    states: Vec<RealizationState>,
}

impl StateMap {
    /// Create an all-`Undefined` map for the given ensemble size.
    #[must_use]
    pub fn new(ensemble_size: usize) -> Self {
        Self {
            states: vec![RealizationState::Undefined; ensemble_size],
        }
    }

    /// Number of realizations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true for a zero-size ensemble.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// State of one realization.
    #[must_use]
    pub fn get(&self, realization: usize) -> Option<RealizationState> {
        self.states.get(realization).copied()
    }

    /// Set a realization's state, rejecting illegal transitions.
    ///
    /// Returns whether the stored value changed.
    pub fn set(
        &mut self,
        realization: usize,
        state: RealizationState,
    ) -> Result<bool, ValidationError> {
        let ensemble_size = self.states.len();
        let slot = self
            .states
            .get_mut(realization)
            .ok_or(ValidationError::RealizationOutOfRange {
                realization,
                ensemble_size,
            })?;
        let from = *slot;
        if !from.can_transition_to(state) {
            return Err(ValidationError::IllegalStateTransition {
                realization,
                from,
                to: state,
            });
        }
        *slot = state;
        Ok(from != state)
    }

    /// Move `Undefined` or `LoadFailure` to `Initialized`; leave others alone.
    ///
    /// Returns whether the entry changed.
    pub fn advance_to_initialized(&mut self, realization: usize) -> Result<bool, ValidationError> {
        match self.get(realization) {
            Some(RealizationState::Undefined | RealizationState::LoadFailure) => {
                self.set(realization, RealizationState::Initialized)
            }
            Some(_) => Ok(false),
            None => Err(ValidationError::RealizationOutOfRange {
                realization,
                ensemble_size: self.states.len(),
            }),
        }
    }

    /// Boolean mask of realizations currently in `state`.
    #[must_use]
    pub fn select_matching(&self, state: RealizationState) -> Vec<bool> {
        self.states.iter().map(|s| *s == state).collect()
    }

    /// Indices of realizations currently in `state`.
    #[must_use]
    pub fn indices_matching(&self, state: RealizationState) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter_map(|(i, s)| (*s == state).then_some(i))
            .collect()
    }

    /// Number of realizations in `state`.
    #[must_use]
    pub fn count(&self, state: RealizationState) -> usize {
        self.states.iter().filter(|s| **s == state).count()
    }

    /// Iterate over states in realization order.
    pub fn iter(&self) -> impl Iterator<Item = RealizationState> + '_ {
        self.states.iter().copied()
    }
}
