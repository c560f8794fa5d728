//! The survival parameterizations and the single table that wires each one to
//! its discretization, loss and survival reconstruction.

use super::discretize::{Discretization, TimeGrid};
use super::loss::{LossKind, reverse_cumsum};
use crate::config::ConfigError;
use crate::net::layers::{sigmoid, softplus};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SurvivalVariant {
    /// Discrete-time hazard with a sigmoid per bin.
    LogisticHazard,
    /// Hazard constant within each interval of the grid.
    PiecewiseConstantHazard,
    /// Softmax pmf with a pairwise ranking penalty (DeepHit).
    RankPmf,
    /// Multi-task logistic regression.
    Mtlr,
    /// Log-risk with a Breslow baseline hazard (DeepSurv).
    ProportionalHazards,
}

impl SurvivalVariant {
    pub const ALL: [SurvivalVariant; 5] = [
        SurvivalVariant::LogisticHazard,
        SurvivalVariant::PiecewiseConstantHazard,
        SurvivalVariant::RankPmf,
        SurvivalVariant::Mtlr,
        SurvivalVariant::ProportionalHazards,
    ];

    pub fn spec(self) -> VariantSpec {
        match self {
            SurvivalVariant::LogisticHazard => VariantSpec {
                discretization: Some(Discretization::EventAtNextCut),
                loss: LossKind::LogisticHazard,
                reconstruction: Reconstruction::HazardProduct,
            },
            SurvivalVariant::PiecewiseConstantHazard => VariantSpec {
                discretization: Some(Discretization::IntervalFraction),
                loss: LossKind::PiecewiseConstantHazard,
                reconstruction: Reconstruction::PiecewiseExponential,
            },
            SurvivalVariant::RankPmf => VariantSpec {
                discretization: Some(Discretization::EventAtNextCut),
                loss: LossKind::RankPmf,
                reconstruction: Reconstruction::PmfComplement,
            },
            SurvivalVariant::Mtlr => VariantSpec {
                discretization: Some(Discretization::EventAtNextCut),
                loss: LossKind::Mtlr,
                reconstruction: Reconstruction::Mtlr,
            },
            SurvivalVariant::ProportionalHazards => VariantSpec {
                discretization: None,
                loss: LossKind::CoxPartial,
                reconstruction: Reconstruction::BreslowBaseline,
            },
        }
    }

    pub fn is_discrete(self) -> bool {
        self.spec().discretization.is_some()
    }
}

impl FromStr for SurvivalVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "logistic_hazard" | "nnet_survival" => Ok(SurvivalVariant::LogisticHazard),
            "pc_hazard" | "piecewise_constant_hazard" => {
                Ok(SurvivalVariant::PiecewiseConstantHazard)
            }
            "deephit" | "rank_pmf" => Ok(SurvivalVariant::RankPmf),
            "mtlr" => Ok(SurvivalVariant::Mtlr),
            "cox_ph" | "deepsurv" | "proportional_hazards" => {
                Ok(SurvivalVariant::ProportionalHazards)
            }
            other => Err(ConfigError::UnknownVariant(other.to_string())),
        }
    }
}

impl TryFrom<String> for SurvivalVariant {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SurvivalVariant> for String {
    fn from(value: SurvivalVariant) -> Self {
        value.to_string()
    }
}

impl fmt::Display for SurvivalVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SurvivalVariant::LogisticHazard => "logistic_hazard",
            SurvivalVariant::PiecewiseConstantHazard => "pc_hazard",
            SurvivalVariant::RankPmf => "deephit",
            SurvivalVariant::Mtlr => "mtlr",
            SurvivalVariant::ProportionalHazards => "cox_ph",
        };
        f.write_str(name)
    }
}

/// One row of the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSpec {
    /// `None` for continuous-time variants trained on raw durations.
    pub discretization: Option<Discretization>,
    pub loss: LossKind,
    pub reconstruction: Reconstruction,
}

impl VariantSpec {
    /// Head width: one output per bin, or a single log-risk.
    pub fn output_width(&self, grid: &TimeGrid) -> usize {
        self.discretization
            .map(|d| grid.output_width(d))
            .unwrap_or(1)
    }
}

/// How network outputs become survival probabilities on the grid cuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconstruction {
    /// `S_k = prod_{j <= k} (1 - sigmoid(phi_j))`.
    HazardProduct,
    /// `S_0 = 1`, `S_{k+1} = exp(-sum_{j <= k} softplus(phi_j))`.
    PiecewiseExponential,
    /// `S_k = 1 - sum_{j <= k} pmf_j` with the pmf from a padded softmax.
    PmfComplement,
    /// Pmf complement after reverse cumulative sums of the outputs.
    Mtlr,
    /// Continuous time: baseline hazard scaled by the predicted risk.
    BreslowBaseline,
}

/// Survival on the grid cuts for the discrete reconstructions; `None` for
/// the Breslow baseline, which is evaluated at arbitrary times instead.
pub fn reconstruct_survival(
    reconstruction: Reconstruction,
    phi: ArrayView2<'_, f64>,
) -> Option<Array2<f64>> {
    match reconstruction {
        Reconstruction::HazardProduct => {
            let mut surv = phi.mapv(|z| 1.0 - sigmoid(z));
            for mut row in surv.rows_mut() {
                let mut acc = 1.0;
                for v in row.iter_mut() {
                    acc *= *v;
                    *v = acc;
                }
            }
            Some(surv)
        }
        Reconstruction::PiecewiseExponential => {
            let mut surv = Array2::<f64>::ones((phi.nrows(), phi.ncols() + 1));
            for (i, row) in phi.rows().into_iter().enumerate() {
                let mut cumulative = 0.0;
                for (j, &z) in row.iter().enumerate() {
                    cumulative += softplus(z);
                    surv[(i, j + 1)] = (-cumulative).exp();
                }
            }
            Some(surv)
        }
        Reconstruction::PmfComplement => Some(pmf_complement(phi)),
        Reconstruction::Mtlr => Some(pmf_complement(reverse_cumsum(phi).view())),
        Reconstruction::BreslowBaseline => None,
    }
}

fn pmf_complement(phi: ArrayView2<'_, f64>) -> Array2<f64> {
    let mut surv = Array2::<f64>::zeros(phi.raw_dim());
    for (i, row) in phi.rows().into_iter().enumerate() {
        let gamma = row.iter().fold(0.0_f64, |acc, &v| acc.max(v));
        let exp: Vec<f64> = row.iter().map(|&v| (v - gamma).exp()).collect();
        let total: f64 = exp.iter().sum::<f64>() + (-gamma).exp();
        let mut cumulative = 0.0;
        for (j, e) in exp.iter().enumerate() {
            cumulative += e / total;
            surv[(i, j)] = (1.0 - cumulative).clamp(0.0, 1.0);
        }
    }
    surv
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn is_monotone(surv: &Array2<f64>) -> bool {
        surv.rows().into_iter().all(|row| {
            row.iter().all(|&v| (0.0..=1.0).contains(&v))
                && row.as_slice().map_or(true, |s| s.windows(2).all(|w| w[1] <= w[0] + 1e-12))
        })
    }

    #[test]
    fn every_discrete_reconstruction_is_monotone() {
        let phi = array![[2.0, -1.0, 0.5, 3.0], [-4.0, 0.0, 6.0, -2.0]];
        for variant in SurvivalVariant::ALL {
            let Some(surv) = reconstruct_survival(variant.spec().reconstruction, phi.view()) else {
                assert_eq!(variant, SurvivalVariant::ProportionalHazards);
                continue;
            };
            assert!(is_monotone(&surv), "{variant} produced a non-monotone curve");
        }
    }

    #[test]
    fn piecewise_exponential_starts_at_one() {
        let surv = reconstruct_survival(Reconstruction::PiecewiseExponential, array![[0.0, 0.0]].view())
            .unwrap();
        assert_eq!(surv.ncols(), 3);
        assert_eq!(surv[(0, 0)], 1.0);
        assert!((surv[(0, 1)] - (-(2.0_f64.ln())).exp()).abs() < 1e-12);
    }

    #[test]
    fn output_widths_follow_the_discretization() {
        let grid = TimeGrid::new(vec![0.0, 10.0, 20.0, 30.0]).unwrap();
        assert_eq!(SurvivalVariant::LogisticHazard.spec().output_width(&grid), 4);
        assert_eq!(SurvivalVariant::PiecewiseConstantHazard.spec().output_width(&grid), 3);
        assert_eq!(SurvivalVariant::ProportionalHazards.spec().output_width(&grid), 1);
    }

    #[test]
    fn parses_aliases_and_rejects_unknown_names() {
        assert_eq!(
            "cox_ph".parse::<SurvivalVariant>().unwrap(),
            SurvivalVariant::ProportionalHazards
        );
        assert_eq!(
            "DeepHit".parse::<SurvivalVariant>().unwrap(),
            SurvivalVariant::RankPmf
        );
        assert!(matches!(
            "weibull".parse::<SurvivalVariant>(),
            Err(ConfigError::UnknownVariant(_))
        ));
        for variant in SurvivalVariant::ALL {
            assert_eq!(variant.to_string().parse::<SurvivalVariant>().unwrap(), variant);
        }
    }
}
