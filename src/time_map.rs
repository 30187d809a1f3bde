//! Report-step to simulated-date mapping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Ordered simulated dates, indexed by report step.
///
/// Steps may be filled in any order; a step that already has a date only
/// accepts the same date again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeMap {
    dates: Vec<Option<DateTime<Utc>>>,
}

impl TimeMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of report steps covered (including gaps).
    #[must_use]
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    /// Returns true if no step has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Date recorded for a report step.
    #[must_use]
    pub fn get(&self, step: usize) -> Option<DateTime<Utc>> {
        self.dates.get(step).copied().flatten()
    }

    /// Record the date of a report step.
    ///
    /// Returns whether the map changed.
    pub fn update(&mut self, step: usize, date: DateTime<Utc>) -> Result<bool, ValidationError> {
        if step >= self.dates.len() {
            self.dates.resize(step + 1, None);
        }
        match self.dates[step] {
            Some(stored) if stored == date => Ok(false),
            Some(stored) => Err(ValidationError::TimeMapConflict {
                step,
                stored: stored.to_rfc3339(),
                got: date.to_rfc3339(),
            }),
            None => {
                self.dates[step] = Some(date);
                Ok(true)
            }
        }
    }

    /// Record a full sequence starting at step 0.
    pub fn update_all(&mut self, dates: &[DateTime<Utc>]) -> Result<bool, ValidationError> {
        let mut changed = false;
        for (step, date) in dates.iter().enumerate() {
            changed |= self.update(step, *date)?;
        }
        Ok(changed)
    }

    /// Report step with exactly this date.
    #[must_use]
    pub fn step_of(&self, date: DateTime<Utc>) -> Option<usize> {
        self.dates.iter().position(|d| *d == Some(date))
    }
}
