//! C-for-benefit: concordance between predicted and observed benefit over
//! pairs of matched pairs.

use super::matching::MatchedPair;
use ndarray::ArrayView1;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Alive at `tau`: follow-up past `tau`, or censored exactly at `tau`.
///
/// A patient censored on the horizon day was last seen alive that day, so it
/// counts as alive. A death on the horizon day does not.
pub fn alive_at(duration: f64, event: bool, tau: f64) -> bool {
    duration > tau || (!event && duration >= tau)
}

/// How a matched pair's predicted benefit is formed from counterfactual
/// survival `S_A`, `S_B` of its two members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenefitEstimator {
    /// Mean of the members' individual effects `S_B(i) - S_A(i)`.
    #[default]
    MeanIte,
    /// B member's individual effect minus the A member's.
    IteDifference,
    /// `S_B(b) - S_A(a)`: each member under the arm it actually received.
    ArmContrast,
}

impl BenefitEstimator {
    pub fn pair_benefit(
        self,
        pair: &MatchedPair,
        s_a: ArrayView1<'_, f64>,
        s_b: ArrayView1<'_, f64>,
    ) -> f64 {
        let ite = |row: usize| s_b[row] - s_a[row];
        match self {
            Self::MeanIte => 0.5 * (ite(pair.a_row) + ite(pair.b_row)),
            Self::IteDifference => ite(pair.b_row) - ite(pair.a_row),
            Self::ArmContrast => s_b[pair.b_row] - s_a[pair.a_row],
        }
    }
}

/// Observed pair effect in {-1, 0, 1}: alive under B minus alive under A.
pub fn observed_benefit(
    pair: &MatchedPair,
    durations: ArrayView1<'_, f64>,
    events: ArrayView1<'_, f64>,
    tau: f64,
) -> f64 {
    let alive = |row: usize| f64::from(u8::from(alive_at(durations[row], events[row] > 0.5, tau)));
    alive(pair.b_row) - alive(pair.a_row)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CForBenefit {
    /// `concordant / informative`, NaN without informative comparisons.
    pub value: f64,
    pub concordant: f64,
    pub informative: usize,
    /// Pairs with a finite predicted benefit.
    pub pairs_used: usize,
}

/// `s_a` and `s_b` hold every patient's counterfactual survival at `tau`
/// under arms A and B, indexed by the rows the pairs refer to.
pub fn c_for_benefit(
    pairs: &[MatchedPair],
    s_a: ArrayView1<'_, f64>,
    s_b: ArrayView1<'_, f64>,
    durations: ArrayView1<'_, f64>,
    events: ArrayView1<'_, f64>,
    tau: f64,
    estimator: BenefitEstimator,
) -> CForBenefit {
    let scored: Vec<(f64, f64)> = pairs
        .iter()
        .filter_map(|pair| {
            let predicted = estimator.pair_benefit(pair, s_a, s_b);
            predicted
                .is_finite()
                .then(|| (predicted, observed_benefit(pair, durations, events, tau)))
        })
        .collect();

    let (concordant, informative) = (0..scored.len())
        .into_par_iter()
        .map(|p| {
            let (pred_p, obs_p) = scored[p];
            let mut concordant = 0.0;
            let mut informative = 0usize;
            for &(pred_q, obs_q) in &scored[p + 1..] {
                if obs_p == obs_q {
                    continue;
                }
                informative += 1;
                if pred_p == pred_q {
                    concordant += 0.5;
                } else if (pred_p > pred_q) == (obs_p > obs_q) {
                    concordant += 1.0;
                }
            }
            (concordant, informative)
        })
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

    let value = if informative > 0 {
        concordant / informative as f64
    } else {
        f64::NAN
    };
    CForBenefit {
        value,
        concordant,
        informative,
        pairs_used: scored.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, array};

    fn pair(a_row: usize, b_row: usize) -> MatchedPair {
        MatchedPair {
            a_row,
            b_row,
            a_id: a_row.to_string(),
            b_id: b_row.to_string(),
            distance: 0.0,
        }
    }

    /// Pair 0 (rows 0, 1): only B alive at day 365. Pair 1 (rows 2, 3): only A alive.
    fn outcomes() -> (Array1<f64>, Array1<f64>) {
        (array![100.0, 500.0, 500.0, 100.0], array![1.0, 1.0, 1.0, 1.0])
    }

    #[test]
    fn alive_status_at_the_horizon() {
        assert!(alive_at(400.0, true, 365.0));
        assert!(!alive_at(365.0, true, 365.0));
        assert!(alive_at(365.0, false, 365.0));
        assert!(!alive_at(200.0, false, 365.0));
    }

    #[test]
    fn horizon_day_outcomes_split_on_the_event_flag() {
        // Both members of each pair leave follow-up on day 365.
        let durations = array![365.0, 365.0, 365.0, 365.0];
        let events = array![1.0, 0.0, 0.0, 1.0];
        let (first, second) = (pair(0, 1), pair(2, 3));
        assert_eq!(observed_benefit(&first, durations.view(), events.view(), 365.0), 1.0);
        assert_eq!(observed_benefit(&second, durations.view(), events.view(), 365.0), -1.0);
        // One day later every member is past follow-up and nobody counts as alive.
        assert_eq!(observed_benefit(&first, durations.view(), events.view(), 366.0), 0.0);

        let s_a = array![0.2, 0.2, 0.7, 0.7];
        let s_b = array![0.8, 0.8, 0.3, 0.3];
        let result = c_for_benefit(
            &[first, second],
            s_a.view(),
            s_b.view(),
            durations.view(),
            events.view(),
            365.0,
            BenefitEstimator::MeanIte,
        );
        assert_eq!(result.informative, 1);
        assert_eq!(result.value, 1.0);
    }

    #[test]
    fn agreeing_orderings_give_one_and_reversed_give_zero() {
        let (durations, events) = outcomes();
        let pairs = [pair(0, 1), pair(2, 3)];
        let s_a = array![0.5, 0.0, 0.6, 0.0];
        let s_b = array![0.0, 0.8, 0.0, 0.5];
        let agree = c_for_benefit(
            &pairs,
            s_a.view(),
            s_b.view(),
            durations.view(),
            events.view(),
            365.0,
            BenefitEstimator::ArmContrast,
        );
        assert_eq!(agree.value, 1.0);
        assert_eq!(agree.informative, 1);

        // Pair 0 now predicts -0.3 instead of +0.3, below pair 1's -0.1.
        let s_b = array![0.0, 0.2, 0.0, 0.5];
        let reversed = c_for_benefit(
            &pairs,
            s_a.view(),
            s_b.view(),
            durations.view(),
            events.view(),
            365.0,
            BenefitEstimator::ArmContrast,
        );
        assert_eq!(reversed.value, 0.0);
    }

    #[test]
    fn predicted_ties_earn_half_credit() {
        let (durations, events) = outcomes();
        let s = array![0.5, 0.5, 0.5, 0.5];
        let result = c_for_benefit(
            &[pair(0, 1), pair(2, 3)],
            s.view(),
            s.view(),
            durations.view(),
            events.view(),
            365.0,
            BenefitEstimator::MeanIte,
        );
        assert_eq!(result.value, 0.5);
    }

    #[test]
    fn no_informative_comparisons_is_nan() {
        let (durations, events) = outcomes();
        let s_a = array![0.5, 0.5, 0.5, f64::NAN];
        let s_b = array![0.6, 0.6, 0.6, 0.6];
        let result = c_for_benefit(
            &[pair(0, 1), pair(2, 3)],
            s_a.view(),
            s_b.view(),
            durations.view(),
            events.view(),
            365.0,
            BenefitEstimator::IteDifference,
        );
        assert!(result.value.is_nan());
        assert_eq!(result.pairs_used, 1);
        assert_eq!(result.informative, 0);
    }

    #[test]
    fn estimators_combine_members_differently() {
        let s_a = array![0.4, 0.5];
        let s_b = array![0.6, 0.9];
        let p = pair(0, 1);
        let close = |a: f64, b: f64| (a - b).abs() < 1e-12;
        assert!(close(BenefitEstimator::MeanIte.pair_benefit(&p, s_a.view(), s_b.view()), 0.3));
        assert!(close(BenefitEstimator::IteDifference.pair_benefit(&p, s_a.view(), s_b.view()), 0.2));
        assert!(close(BenefitEstimator::ArmContrast.pair_benefit(&p, s_a.view(), s_b.view()), 0.5));
    }

    #[test]
    fn value_stays_in_the_unit_interval() {
        let n = 24;
        let durations = Array1::from_shape_fn(n, |i| 200.0 + 37.0 * ((i * 7) % 11) as f64);
        let events = Array1::from_shape_fn(n, |i| f64::from(u8::from(i % 3 != 0)));
        let s_a = Array1::from_shape_fn(n, |i| ((i * 5) % 13) as f64 / 13.0);
        let s_b = Array1::from_shape_fn(n, |i| ((i * 3) % 7) as f64 / 7.0);
        let pairs: Vec<_> = (0..n / 2).map(|k| pair(2 * k, 2 * k + 1)).collect();
        for estimator in [
            BenefitEstimator::MeanIte,
            BenefitEstimator::IteDifference,
            BenefitEstimator::ArmContrast,
        ] {
            let result = c_for_benefit(
                &pairs,
                s_a.view(),
                s_b.view(),
                durations.view(),
                events.view(),
                365.0,
                estimator,
            );
            assert!(result.value.is_nan() || (0.0..=1.0).contains(&result.value));
            assert!(result.concordant <= result.informative as f64);
        }
    }
}
