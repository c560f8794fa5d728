//! Discrete-time labels on a shared grid of cut points.

use crate::config::ConfigError;
use crate::data::SurvivalTargets;
use ndarray::{Array1, Axis};

/// Strictly increasing, finite cut points shared by every task head.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeGrid {
    cuts: Vec<f64>,
}

impl TimeGrid {
    pub fn new(cuts: Vec<f64>) -> Result<Self, ConfigError> {
        if cuts.len() < 2 {
            return Err(ConfigError::InvalidTimeGrid(
                "a discretization grid needs at least two cut points".to_string(),
            ));
        }
        if cuts.iter().any(|c| !c.is_finite()) {
            return Err(ConfigError::InvalidTimeGrid(
                "cut points must be finite".to_string(),
            ));
        }
        if cuts.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigError::InvalidTimeGrid(
                "cut points must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { cuts })
    }

    pub fn cuts(&self) -> &[f64] {
        &self.cuts
    }

    pub fn len(&self) -> usize {
        self.cuts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cuts.is_empty()
    }

    pub fn last_cut(&self) -> f64 {
        self.cuts[self.cuts.len() - 1]
    }

    /// Number of network outputs a discretization needs on this grid.
    pub fn output_width(&self, discretization: Discretization) -> usize {
        match discretization {
            Discretization::EventAtNextCut => self.cuts.len(),
            Discretization::IntervalFraction => self.cuts.len() - 1,
        }
    }

    pub fn discretize(&self, targets: &SurvivalTargets, discretization: Discretization) -> DiscreteLabels {
        let n = targets.len();
        let mut indices = Vec::with_capacity(n);
        let mut events = Array1::<f64>::zeros(n);
        let mut fractions = Array1::<f64>::ones(n);
        for (i, (&d, &e)) in targets.durations.iter().zip(targets.events.iter()).enumerate() {
            let (index, event, fraction) = match discretization {
                Discretization::EventAtNextCut => self.event_at_next_cut(d, e > 0.5),
                Discretization::IntervalFraction => self.interval_fraction(d, e > 0.5),
            };
            indices.push(index);
            events[i] = if event { 1.0 } else { 0.0 };
            fractions[i] = fraction;
        }
        DiscreteLabels {
            indices,
            events,
            fractions,
        }
    }

    fn event_at_next_cut(&self, duration: f64, event: bool) -> (usize, bool, f64) {
        let last = self.cuts.len() - 1;
        if duration > self.last_cut() {
            return (last, false, 1.0);
        }
        if event {
            // First cut at or after the event time.
            (self.cuts.partition_point(|&c| c < duration), true, 1.0)
        } else {
            // Last cut at or before the censoring time.
            let above = self.cuts.partition_point(|&c| c <= duration);
            (above.saturating_sub(1), false, 1.0)
        }
    }

    fn interval_fraction(&self, duration: f64, event: bool) -> (usize, bool, f64) {
        let intervals = self.cuts.len() - 1;
        if duration > self.last_cut() {
            return (intervals - 1, false, 1.0);
        }
        // Interval k covers (cuts[k], cuts[k + 1]].
        let index = self
            .cuts
            .partition_point(|&c| c < duration)
            .saturating_sub(1)
            .min(intervals - 1);
        let start = self.cuts[index];
        let end = self.cuts[index + 1];
        let fraction = ((duration - start) / (end - start)).clamp(0.0, 1.0);
        (index, event, fraction)
    }
}

/// How continuous follow-up is mapped onto the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discretization {
    /// Events move to the next cut, censorings to the previous one.
    EventAtNextCut,
    /// Interval index plus the fraction of the interval that was observed.
    IntervalFraction,
}

/// Per-sample grid labels.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscreteLabels {
    pub indices: Vec<usize>,
    pub events: Array1<f64>,
    /// Observed share of the labelled interval; always 1 for `EventAtNextCut`.
    pub fractions: Array1<f64>,
}

impl DiscreteLabels {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn subset(&self, rows: &[usize]) -> Self {
        Self {
            indices: rows.iter().map(|&r| self.indices[r]).collect(),
            events: self.events.select(Axis(0), rows),
            fractions: self.fractions.select(Axis(0), rows),
        }
    }
}
