//! Survival losses and their gradients with respect to the network output.
//!
//! Every loss is averaged over the batch. Discrete losses read grid labels,
//! the proportional-hazards loss reads raw durations and events; risk sets and
//! rank comparisons only span the samples of the current batch.

use super::discretize::DiscreteLabels;
use crate::data::SurvivalTargets;
use crate::net::layers::{sigmoid, softplus};
use ndarray::{Array1, Array2, ArrayView2};

const PMF_EPS: f64 = 1e-7;
const COX_EPS: f64 = 1e-7;
const LOG_SOFTPLUS_THRESHOLD: f64 = -15.0;

/// Targets in the form a loss consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingTargets {
    Discrete(DiscreteLabels),
    Continuous(SurvivalTargets),
}

impl TrainingTargets {
    pub fn len(&self) -> usize {
        match self {
            TrainingTargets::Discrete(labels) => labels.len(),
            TrainingTargets::Continuous(targets) => targets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subset(&self, rows: &[usize]) -> Self {
        match self {
            TrainingTargets::Discrete(labels) => TrainingTargets::Discrete(labels.subset(rows)),
            TrainingTargets::Continuous(targets) => {
                TrainingTargets::Continuous(targets.subset(rows))
            }
        }
    }
}

/// Hyperparameters of the rank-based loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankParams {
    pub alpha: f64,
    pub sigma: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossKind {
    LogisticHazard,
    PiecewiseConstantHazard,
    /// Pmf likelihood plus the pairwise ranking penalty.
    RankPmf,
    Mtlr,
    CoxPartial,
}

impl LossKind {
    /// Returns `None` when the targets are of the wrong form for this loss.
    pub fn evaluate(
        self,
        phi: ArrayView2<'_, f64>,
        targets: &TrainingTargets,
        rank: RankParams,
    ) -> Option<(f64, Array2<f64>)> {
        match (self, targets) {
            (LossKind::LogisticHazard, TrainingTargets::Discrete(labels)) => {
                Some(logistic_hazard(phi, labels))
            }
            (LossKind::PiecewiseConstantHazard, TrainingTargets::Discrete(labels)) => {
                Some(piecewise_constant_hazard(phi, labels))
            }
            (LossKind::RankPmf, TrainingTargets::Discrete(labels)) => {
                Some(rank_pmf(phi, labels, rank))
            }
            (LossKind::Mtlr, TrainingTargets::Discrete(labels)) => Some(mtlr(phi, labels)),
            (LossKind::CoxPartial, TrainingTargets::Continuous(targets)) => {
                let (loss, grad) = cox_partial(phi.column(0).to_owned(), targets);
                Some((loss, grad.insert_axis(ndarray::Axis(1))))
            }
            _ => None,
        }
    }
}

/// Binary cross-entropy on every bin up to and including the labelled one.
pub fn logistic_hazard(phi: ArrayView2<'_, f64>, labels: &DiscreteLabels) -> (f64, Array2<f64>) {
    let n = phi.nrows().max(1) as f64;
    let mut grad = Array2::<f64>::zeros(phi.raw_dim());
    let mut loss = 0.0;
    for (i, &idx) in labels.indices.iter().enumerate() {
        for j in 0..=idx {
            let z = phi[(i, j)];
            let y = if j == idx { labels.events[i] } else { 0.0 };
            loss += softplus(z) - y * z;
            grad[(i, j)] = (sigmoid(z) - y) / n;
        }
    }
    (loss / n, grad)
}

fn log_softplus(z: f64) -> (f64, f64) {
    if z < LOG_SOFTPLUS_THRESHOLD {
        (z, 1.0)
    } else {
        let sp = softplus(z);
        (sp.ln(), sigmoid(z) / sp)
    }
}

/// Negative log-likelihood of a hazard that is constant within each interval.
pub fn piecewise_constant_hazard(
    phi: ArrayView2<'_, f64>,
    labels: &DiscreteLabels,
) -> (f64, Array2<f64>) {
    let n = phi.nrows().max(1) as f64;
    let mut grad = Array2::<f64>::zeros(phi.raw_dim());
    let mut loss = 0.0;
    for (i, &idx) in labels.indices.iter().enumerate() {
        let e = labels.events[i];
        let rho = labels.fractions[i];
        let z = phi[(i, idx)];
        let (log_h, dlog_h) = log_softplus(z);
        loss += -e * log_h + rho * softplus(z);
        grad[(i, idx)] = (-e * dlog_h + rho * sigmoid(z)) / n;
        for j in 0..idx {
            loss += softplus(phi[(i, j)]);
            grad[(i, j)] = sigmoid(phi[(i, j)]) / n;
        }
    }
    (loss / n, grad)
}

/// Softmax over `[phi, 0]`; the padded column is the mass beyond the grid.
fn padded_softmax(row: ndarray::ArrayView1<'_, f64>) -> (Array1<f64>, f64, f64) {
    let m = row.len();
    let gamma = row.iter().fold(0.0_f64, |acc, &v| acc.max(v));
    let mut exp = Array1::<f64>::zeros(m + 1);
    for (l, &v) in row.iter().enumerate() {
        exp[l] = (v - gamma).exp();
    }
    exp[m] = (-gamma).exp();
    let total = exp.sum();
    (exp, total, gamma)
}

/// Per-sample pmf likelihood; adds `weight * d loss_i / d phi_i` into `grad`.
fn pmf_nll_into(
    phi: ArrayView2<'_, f64>,
    labels: &DiscreteLabels,
    weight: f64,
    grad: &mut Array2<f64>,
) -> f64 {
    let m = phi.ncols();
    let mut loss = 0.0;
    for (i, &idx) in labels.indices.iter().enumerate() {
        let (exp, total, gamma) = padded_softmax(phi.row(i));
        let denom = total + PMF_EPS;
        if labels.events[i] > 0.5 {
            loss += -(phi[(i, idx)] - gamma) + denom.ln();
            for l in 0..m {
                let onehot = if l == idx { 1.0 } else { 0.0 };
                grad[(i, l)] += weight * (exp[l] / denom - onehot);
            }
        } else {
            let tail: f64 = exp.iter().skip(idx + 1).sum();
            let tail_denom = tail + PMF_EPS;
            loss += denom.ln() - tail_denom.ln();
            for l in 0..m {
                let beyond = if l > idx { exp[l] / tail_denom } else { 0.0 };
                grad[(i, l)] += weight * (exp[l] / denom - beyond);
            }
        }
    }
    loss
}

/// Probability-mass-function likelihood.
pub fn pmf(phi: ArrayView2<'_, f64>, labels: &DiscreteLabels) -> (f64, Array2<f64>) {
    let n = phi.nrows().max(1) as f64;
    let mut grad = Array2::<f64>::zeros(phi.raw_dim());
    let loss = pmf_nll_into(phi, labels, 1.0 / n, &mut grad);
    (loss / n, grad)
}

/// `rank[i][j] = 1` when sample `i` had an event strictly before `j` was last
/// seen, or at the same index while `j` was censored.
fn rank_matrix(labels: &DiscreteLabels) -> Array2<f64> {
    let n = labels.len();
    let mut mat = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        if labels.events[i] < 0.5 {
            continue;
        }
        let di = labels.indices[i];
        for j in 0..n {
            let dj = labels.indices[j];
            if di < dj || (di == dj && labels.events[j] < 0.5) {
                mat[(i, j)] = 1.0;
            }
        }
    }
    mat
}

/// `alpha * pmf likelihood + (1 - alpha) * pairwise ranking penalty`.
pub fn rank_pmf(
    phi: ArrayView2<'_, f64>,
    labels: &DiscreteLabels,
    params: RankParams,
) -> (f64, Array2<f64>) {
    let n = phi.nrows();
    let nf = n.max(1) as f64;
    let m = phi.ncols();
    let mut grad = Array2::<f64>::zeros(phi.raw_dim());
    let nll = pmf_nll_into(phi, labels, params.alpha / nf, &mut grad) / nf;

    let mut probs = Array2::<f64>::zeros((n, m + 1));
    for i in 0..n {
        let (exp, total, _) = padded_softmax(phi.row(i));
        probs.row_mut(i).assign(&(exp / total));
    }
    // cdf[i][l] = P(T_i <= cut_l)
    let mut cdf = probs.clone();
    for mut row in cdf.rows_mut() {
        let mut acc = 0.0;
        for v in row.iter_mut() {
            acc += *v;
            *v = acc;
        }
    }

    let ranks = rank_matrix(labels);
    let scale = 1.0 / (nf * nf);
    let mut rank_loss = 0.0;
    // Gradient of the ranking term with respect to each cdf entry.
    let mut coef = Array2::<f64>::zeros((n, m + 1));
    for i in 0..n {
        let ti = labels.indices[i];
        for j in 0..n {
            if ranks[(i, j)] == 0.0 {
                continue;
            }
            let diff = cdf[(i, ti)] - cdf[(j, ti)];
            let term = scale * (-diff / params.sigma).exp();
            rank_loss += term;
            coef[(i, ti)] -= term / params.sigma;
            coef[(j, ti)] += term / params.sigma;
        }
    }

    let weight = 1.0 - params.alpha;
    for k in 0..n {
        // d cdf[k][t] / d p[k][l] = 1 for l <= t, so accumulate from the right.
        let mut grad_p = Array1::<f64>::zeros(m + 1);
        let mut acc = 0.0;
        for l in (0..=m).rev() {
            acc += coef[(k, l)];
            grad_p[l] = acc;
        }
        let p = probs.row(k);
        let dot: f64 = p.iter().zip(grad_p.iter()).map(|(a, b)| a * b).sum();
        for l in 0..m {
            grad[(k, l)] += weight * p[l] * (grad_p[l] - dot);
        }
    }

    (params.alpha * nll + weight * rank_loss, grad)
}

/// Multi-task logistic regression: pmf likelihood on reverse cumulative sums.
pub fn mtlr(phi: ArrayView2<'_, f64>, labels: &DiscreteLabels) -> (f64, Array2<f64>) {
    let summed = reverse_cumsum(phi);
    let (loss, grad_summed) = pmf(summed.view(), labels);
    // summed[j] = sum_{k >= j} phi[k], so d/d phi[k] collects every j <= k.
    let mut grad = grad_summed;
    for mut row in grad.rows_mut() {
        let mut acc = 0.0;
        for v in row.iter_mut() {
            acc += *v;
            *v = acc;
        }
    }
    (loss, grad)
}

/// `out[i][j] = sum_{k >= j} phi[i][k]`.
pub fn reverse_cumsum(phi: ArrayView2<'_, f64>) -> Array2<f64> {
    let mut out = phi.to_owned();
    for mut row in out.rows_mut() {
        let mut acc = 0.0;
        for v in row.iter_mut().rev() {
            acc += *v;
            *v = acc;
        }
    }
    out
}

/// Breslow partial likelihood of log-risks, normalised by the event count.
///
/// A batch without events contributes zero loss and zero gradient.
pub fn cox_partial(log_risk: Array1<f64>, targets: &SurvivalTargets) -> (f64, Array1<f64>) {
    let n = log_risk.len();
    let mut grad = Array1::<f64>::zeros(n);
    let event_count: f64 = targets.events.sum();
    if n == 0 || event_count <= 0.0 {
        return (0.0, grad);
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| targets.durations[b].total_cmp(&targets.durations[a]));

    let gamma = log_risk.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = order.iter().map(|&i| (log_risk[i] - gamma).exp()).collect();
    let mut risk_sums = Vec::with_capacity(n);
    let mut acc = 0.0;
    for &w in &weights {
        acc += w;
        risk_sums.push(acc + COX_EPS);
    }

    let mut loss = 0.0;
    for (pos, &i) in order.iter().enumerate() {
        let d = targets.events[i];
        if d > 0.0 {
            loss -= d * (log_risk[i] - gamma - risk_sums[pos].ln());
        }
    }
    // Tail sums of events / risk set, walked from the shortest duration up.
    let mut tail = 0.0;
    for pos in (0..n).rev() {
        let i = order[pos];
        let d = targets.events[i];
        tail += d / risk_sums[pos];
        grad[i] = -(d - weights[pos] * tail) / event_count;
    }
    (loss / event_count, grad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn labels(indices: Vec<usize>, events: Array1<f64>, fractions: Array1<f64>) -> DiscreteLabels {
        DiscreteLabels {
            indices,
            events,
            fractions,
        }
    }

    fn sample_labels() -> DiscreteLabels {
        labels(
            vec![1, 2, 0, 2],
            array![1.0, 0.0, 1.0, 1.0],
            array![0.4, 1.0, 0.7, 0.2],
        )
    }

    fn sample_phi() -> Array2<f64> {
        array![
            [0.3, -0.8, 1.1],
            [-0.5, 0.2, 0.4],
            [1.5, -1.2, 0.0],
            [0.1, 0.9, -0.3]
        ]
    }

    fn check_gradient<F>(phi: &Array2<f64>, f: F)
    where
        F: Fn(ArrayView2<'_, f64>) -> (f64, Array2<f64>),
    {
        let (_, analytic) = f(phi.view());
        let h = 1e-6;
        for i in 0..phi.nrows() {
            for j in 0..phi.ncols() {
                let mut plus = phi.clone();
                plus[(i, j)] += h;
                let mut minus = phi.clone();
                minus[(i, j)] -= h;
                let numeric = (f(plus.view()).0 - f(minus.view()).0) / (2.0 * h);
                assert_abs_diff_eq!(analytic[(i, j)], numeric, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn logistic_hazard_gradient_matches_finite_differences() {
        let l = sample_labels();
        check_gradient(&sample_phi(), |p| logistic_hazard(p, &l));
    }

    #[test]
    fn logistic_hazard_ignores_bins_after_the_label() {
        let l = labels(vec![0], array![1.0], array![1.0]);
        let (_, grad) = logistic_hazard(array![[0.0, 5.0, 5.0]].view(), &l);
        assert_eq!(grad[(0, 1)], 0.0);
        assert_eq!(grad[(0, 2)], 0.0);
        assert_abs_diff_eq!(grad[(0, 0)], -0.5, epsilon = 1e-12);
    }

    #[test]
    fn piecewise_constant_hazard_gradient_matches_finite_differences() {
        let l = sample_labels();
        check_gradient(&sample_phi(), |p| piecewise_constant_hazard(p, &l));
    }

    #[test]
    fn pmf_and_mtlr_gradients_match_finite_differences() {
        let l = sample_labels();
        check_gradient(&sample_phi(), |p| pmf(p, &l));
        check_gradient(&sample_phi(), |p| mtlr(p, &l));
    }

    #[test]
    fn rank_pmf_gradient_matches_finite_differences() {
        let l = sample_labels();
        let params = RankParams {
            alpha: 0.2,
            sigma: 0.1,
        };
        check_gradient(&sample_phi(), |p| rank_pmf(p, &l, params));
    }

    #[test]
    fn rank_matrix_orders_events_before_later_or_censored_samples() {
        let ranks = rank_matrix(&sample_labels());
        // Sample 2 (event at bin 0) outranks everyone else.
        assert_eq!(ranks.row(2).to_vec(), vec![1.0, 1.0, 0.0, 1.0]);
        // Sample 3 (event at bin 2) outranks only the censored sample at bin 2.
        assert_eq!(ranks.row(3).to_vec(), vec![0.0, 1.0, 0.0, 0.0]);
        // Censored samples outrank no one.
        assert!(ranks.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn cox_gradient_matches_finite_differences() {
        let targets =
            SurvivalTargets::new(array![5.0, 3.0, 9.0, 1.0, 3.0], array![1.0, 0.0, 1.0, 1.0, 1.0])
                .unwrap();
        let eta = array![0.2, -0.4, 0.9, 0.1, -1.3];
        let (_, grad) = cox_partial(eta.clone(), &targets);
        let h = 1e-6;
        for k in 0..eta.len() {
            let mut plus = eta.clone();
            plus[k] += h;
            let mut minus = eta.clone();
            minus[k] -= h;
            let numeric =
                (cox_partial(plus, &targets).0 - cox_partial(minus, &targets).0) / (2.0 * h);
            assert_abs_diff_eq!(grad[k], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn cox_batch_without_events_is_zero() {
        let targets = SurvivalTargets::new(array![5.0, 3.0], array![0.0, 0.0]).unwrap();
        let (loss, grad) = cox_partial(array![1.0, -1.0], &targets);
        assert_eq!(loss, 0.0);
        assert!(grad.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let targets = TrainingTargets::Discrete(sample_labels());
        let rank = RankParams {
            alpha: 0.2,
            sigma: 0.1,
        };
        assert!(LossKind::CoxPartial
            .evaluate(sample_phi().view(), &targets, rank)
            .is_none());
        assert!(LossKind::Mtlr
            .evaluate(sample_phi().view(), &targets, rank)
            .is_some());
    }
}
