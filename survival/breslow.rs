//! Breslow estimates of the cumulative baseline hazard, one per task.

use super::curve::{Interpolation, interpolate};
use crate::data::SurvivalTargets;
use ndarray::{Array1, ArrayView1};

/// Cumulative baseline hazard `H0(t)` at the unique event times of a task.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BaselineHazard {
    times: Vec<f64>,
    cumulative: Array1<f64>,
}

impl BaselineHazard {
    /// Fits from log-risks and follow-up; no events gives an empty baseline.
    pub fn fit(log_risk: ArrayView1<'_, f64>, durations: ArrayView1<'_, f64>, events: ArrayView1<'_, f64>) -> Self {
        let n = log_risk.len();
        if n == 0 || events.iter().all(|&e| e < 0.5) {
            return Self::default();
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| durations[a].total_cmp(&durations[b]));

        let gamma = log_risk.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        // risk[pos] = sum of exp(eta - gamma) over everyone still at risk at order[pos].
        let mut risk = vec![0.0; n];
        let mut acc = 0.0;
        for pos in (0..n).rev() {
            acc += (log_risk[order[pos]] - gamma).exp();
            risk[pos] = acc;
        }

        let mut times = Vec::new();
        let mut increments = Vec::new();
        let mut pos = 0;
        while pos < n {
            let t = durations[order[pos]];
            let start = pos;
            let mut deaths = 0.0;
            while pos < n && durations[order[pos]] == t {
                deaths += events[order[pos]];
                pos += 1;
            }
            if deaths > 0.0 {
                times.push(t);
                increments.push(deaths * (-gamma).exp() / risk[start]);
            }
        }

        let mut total = 0.0;
        let cumulative = increments
            .into_iter()
            .map(|inc| {
                total += inc;
                total
            })
            .collect();
        Self { times, cumulative }
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.cumulative.view()
    }

    /// Zero before the first event time, linear between event times, flat
    /// after the last one; NaN for an empty baseline.
    pub fn at(&self, t: f64) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        if t < self.times[0] {
            return 0.0;
        }
        interpolate(&self.times, self.cumulative.view(), t, Interpolation::Linear)
    }
}

/// One baseline per task head; tasks without events stay empty.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBaselines {
    baselines: Vec<BaselineHazard>,
}

impl TaskBaselines {
    pub fn fit(
        log_risk: ArrayView1<'_, f64>,
        tasks: &[usize],
        targets: &SurvivalTargets,
        num_tasks: usize,
    ) -> Self {
        let baselines = (0..num_tasks)
            .map(|task| {
                let rows: Vec<usize> = tasks
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &t)| (t == task).then_some(i))
                    .collect();
                let eta: Array1<f64> = rows.iter().map(|&r| log_risk[r]).collect();
                let subset = targets.subset(&rows);
                let baseline =
                    BaselineHazard::fit(eta.view(), subset.durations.view(), subset.events.view());
                if baseline.is_empty() {
                    log::debug!("Task {task} has no events; its baseline hazard is empty");
                }
                baseline
            })
            .collect();
        Self { baselines }
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    pub fn task(&self, task: usize) -> Option<&BaselineHazard> {
        self.baselines.get(task)
    }

    /// `S(t | task) = exp(-H0_task(t) * exp(eta))`; NaN without a baseline.
    pub fn survival(&self, task: usize, log_risk: f64, t: f64) -> f64 {
        match self.task(task) {
            Some(baseline) => (-baseline.at(t) * log_risk.exp()).exp(),
            None => f64::NAN,
        }
    }
}
