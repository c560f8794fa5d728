//! Standard time-dependent survival metrics with inverse-probability-of-censoring weights.

use ndarray::{ArrayView1, ArrayView2};

/// Right-continuous Kaplan-Meier step function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KaplanMeier {
    times: Vec<f64>,
    survival: Vec<f64>,
}

impl KaplanMeier {
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn survival(&self) -> &[f64] {
        &self.survival
    }

    /// `S(t)`, including the drop at `t` itself.
    pub fn at(&self, t: f64) -> f64 {
        let k = self.times.partition_point(|&x| x <= t);
        if k == 0 { 1.0 } else { self.survival[k - 1] }
    }

    /// `S(t-)`, the value just before any drop at `t`.
    pub fn before(&self, t: f64) -> f64 {
        let k = self.times.partition_point(|&x| x < t);
        if k == 0 { 1.0 } else { self.survival[k - 1] }
    }
}

/// Product-limit estimate over the distinct times at which `is_event` holds.
fn product_limit(durations: ArrayView1<'_, f64>, is_event: impl Fn(usize) -> bool) -> KaplanMeier {
    let mut order: Vec<usize> = (0..durations.len()).collect();
    order.sort_by(|&a, &b| durations[a].total_cmp(&durations[b]));

    let mut km = KaplanMeier::default();
    let mut at_risk = durations.len();
    let mut s = 1.0;
    let mut k = 0;
    while k < order.len() {
        let t = durations[order[k]];
        let mut tied = 0;
        let mut events = 0;
        while k + tied < order.len() && durations[order[k + tied]] == t {
            events += usize::from(is_event(order[k + tied]));
            tied += 1;
        }
        if events > 0 {
            s *= 1.0 - events as f64 / at_risk as f64;
            km.times.push(t);
            km.survival.push(s);
        }
        at_risk -= tied;
        k += tied;
    }
    km
}

pub fn kaplan_meier(durations: ArrayView1<'_, f64>, events: ArrayView1<'_, f64>) -> KaplanMeier {
    product_limit(durations, |i| events[i] > 0.5)
}

/// Kaplan-Meier estimate of the censoring distribution `G`.
pub fn censoring_distribution(durations: ArrayView1<'_, f64>, events: ArrayView1<'_, f64>) -> KaplanMeier {
    product_limit(durations, |i| events[i] <= 0.5)
}

fn inverse(g: f64) -> f64 {
    if g > 0.0 { 1.0 / g } else { 0.0 }
}

/// Uno's IPCW concordance truncated at `tau`.
///
/// Comparable pairs have an event for `i` before `tau` and `T_j > T_i`; each
/// is weighted by `G(T_i-)^-2` from the training censoring distribution.
/// Tied risks count half. NaN without comparable pairs.
pub fn concordance_index_ipcw(
    censoring: &KaplanMeier,
    durations: ArrayView1<'_, f64>,
    events: ArrayView1<'_, f64>,
    risk: ArrayView1<'_, f64>,
    tau: f64,
) -> f64 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for i in 0..durations.len() {
        if events[i] <= 0.5 || durations[i] >= tau {
            continue;
        }
        let weight = inverse(censoring.before(durations[i])).powi(2);
        if weight == 0.0 {
            continue;
        }
        for j in 0..durations.len() {
            if durations[j] <= durations[i] {
                continue;
            }
            denominator += weight;
            if risk[i] > risk[j] {
                numerator += weight;
            } else if risk[i] == risk[j] {
                numerator += 0.5 * weight;
            }
        }
    }
    if denominator > 0.0 {
        numerator / denominator
    } else {
        f64::NAN
    }
}

/// Graf's IPCW Brier score of survival predictions at `t`.
pub fn brier_score(
    censoring: &KaplanMeier,
    durations: ArrayView1<'_, f64>,
    events: ArrayView1<'_, f64>,
    survival: ArrayView1<'_, f64>,
    t: f64,
) -> f64 {
    let n = durations.len();
    if n == 0 {
        return f64::NAN;
    }
    let g_t = inverse(censoring.at(t));
    let total: f64 = (0..n)
        .map(|i| {
            if durations[i] <= t && events[i] > 0.5 {
                survival[i].powi(2) * inverse(censoring.before(durations[i]))
            } else if durations[i] > t {
                (1.0 - survival[i]).powi(2) * g_t
            } else {
                0.0
            }
        })
        .sum();
    total / n as f64
}

/// Trapezoid integral of the Brier score over `times`, divided by their span.
/// A single time gives the Brier score at that time.
pub fn integrated_brier_score(
    censoring: &KaplanMeier,
    durations: ArrayView1<'_, f64>,
    events: ArrayView1<'_, f64>,
    survival: ArrayView2<'_, f64>,
    times: &[f64],
) -> f64 {
    let scores: Vec<f64> = times
        .iter()
        .enumerate()
        .map(|(k, &t)| brier_score(censoring, durations, events, survival.column(k), t))
        .collect();
    match times {
        [] => f64::NAN,
        [_] => scores[0],
        [first, .., last] => {
            let area: f64 = times
                .windows(2)
                .zip(scores.windows(2))
                .map(|(t, s)| 0.5 * (s[0] + s[1]) * (t[1] - t[0]))
                .sum();
            area / (last - first)
        }
    }
}

/// Cumulative/dynamic AUC at each time and its mean weighted by the drops of
/// the test-set Kaplan-Meier curve.
///
/// Cases at `t` had an event at or before `t` and carry weight `1 / G(T_i-)`;
/// controls are still at risk after `t`. `risk` holds one column per time.
pub fn cumulative_dynamic_auc(
    censoring: &KaplanMeier,
    durations: ArrayView1<'_, f64>,
    events: ArrayView1<'_, f64>,
    risk: ArrayView2<'_, f64>,
    times: &[f64],
) -> (Vec<f64>, f64) {
    let n = durations.len();
    let scores: Vec<f64> = times
        .iter()
        .enumerate()
        .map(|(k, &t)| {
            let r = risk.column(k);
            let controls: Vec<usize> = (0..n).filter(|&j| durations[j] > t).collect();
            let mut numerator = 0.0;
            let mut denominator = 0.0;
            for i in (0..n).filter(|&i| durations[i] <= t && events[i] > 0.5) {
                let weight = inverse(censoring.before(durations[i]));
                for &j in &controls {
                    denominator += weight;
                    if r[i] > r[j] {
                        numerator += weight;
                    } else if r[i] == r[j] {
                        numerator += 0.5 * weight;
                    }
                }
            }
            if denominator > 0.0 {
                numerator / denominator
            } else {
                f64::NAN
            }
        })
        .collect();

    let mean = match scores.as_slice() {
        [] => f64::NAN,
        [only] => *only,
        _ => {
            let km = kaplan_meier(durations, events);
            let mut previous = 1.0;
            let mut area = 0.0;
            let mut mass = 0.0;
            for (&t, &score) in times.iter().zip(&scores) {
                let s = km.at(t);
                let drop = previous - s;
                previous = s;
                if score.is_finite() {
                    area += score * drop;
                    mass += drop;
                }
            }
            if mass > 0.0 { area / mass } else { f64::NAN }
        }
    };
    (scores, mean)
}
