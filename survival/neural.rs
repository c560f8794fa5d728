//! Training and prediction shared by the multi-task and single-task networks.

use super::breslow::TaskBaselines;
use super::curve::{Interpolation, SurvivalCurves};
use super::discretize::TimeGrid;
use super::loss::{RankParams, TrainingTargets};
use super::variant::{VariantSpec, reconstruct_survival};
use super::ModelError;
use crate::config::ModelConfig;
use crate::data::SurvivalTargets;
use crate::net::gate::RuleGate;
use crate::net::multitask::{NetArchitecture, SurvivalNet};
use crate::net::optim::Optimizer;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

const SURVIVAL_FLOOR: f64 = 1e-10;

/// Held-out rows already resolved to concrete task indices.
pub struct Holdout<'a> {
    pub x: ArrayView2<'a, f64>,
    pub tasks: Vec<usize>,
    pub targets: &'a SurvivalTargets,
}

/// A survival network together with its grid, baselines and training state.
#[derive(Debug, Clone)]
pub struct NeuralSurvival {
    config: ModelConfig,
    spec: VariantSpec,
    grid: TimeGrid,
    num_tasks: usize,
    rule_gate: RuleGate,
    early_stopping: bool,
    net: Option<SurvivalNet>,
    baselines: Option<TaskBaselines>,
}

impl NeuralSurvival {
    pub fn new(
        config: ModelConfig,
        grid: TimeGrid,
        num_tasks: usize,
        rule_gate: RuleGate,
        early_stopping: bool,
    ) -> Result<Self, ModelError> {
        config.validate()?;
        Ok(Self {
            spec: config.variant.spec(),
            config,
            grid,
            num_tasks: num_tasks.max(1),
            rule_gate,
            early_stopping,
            net: None,
            baselines: None,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn grid(&self) -> &TimeGrid {
        &self.grid
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    pub fn is_fitted(&self) -> bool {
        self.net.is_some()
    }

    pub fn baselines(&self) -> Option<&TaskBaselines> {
        self.baselines.as_ref()
    }

    fn training_targets(&self, targets: &SurvivalTargets) -> TrainingTargets {
        match self.spec.discretization {
            Some(discretization) => {
                TrainingTargets::Discrete(self.grid.discretize(targets, discretization))
            }
            None => TrainingTargets::Continuous(targets.clone()),
        }
    }

    fn loss(
        &self,
        out: ArrayView2<'_, f64>,
        targets: &TrainingTargets,
    ) -> Result<(f64, Array2<f64>), ModelError> {
        let rank = RankParams {
            alpha: self.config.rank_alpha,
            sigma: self.config.rank_sigma,
        };
        self.spec
            .loss
            .evaluate(out, targets, rank)
            .ok_or(ModelError::TargetMismatch(self.config.variant))
    }

    fn check_rows(x: ArrayView2<'_, f64>, tasks: &[usize], targets: &SurvivalTargets) -> Result<(), ModelError> {
        if targets.len() != x.nrows() {
            return Err(ModelError::ShapeMismatch {
                what: "survival targets",
                expected: x.nrows(),
                found: targets.len(),
            });
        }
        if tasks.len() != x.nrows() {
            return Err(ModelError::ShapeMismatch {
                what: "task indices",
                expected: x.nrows(),
                found: tasks.len(),
            });
        }
        Ok(())
    }

    pub fn fit(
        &mut self,
        x: ArrayView2<'_, f64>,
        tasks: &[usize],
        targets: &SurvivalTargets,
        holdout: Option<Holdout<'_>>,
    ) -> Result<(), ModelError> {
        let n = x.nrows();
        if n == 0 {
            return Err(ModelError::EmptyTrainingSet);
        }
        Self::check_rows(x, tasks, targets)?;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let arch = NetArchitecture {
            input_size: x.ncols(),
            hidden_layers: self.config.hidden_layers.clone(),
            activation: self.config.activation,
            dropout: self.config.dropout,
            batch_norm: self.config.batch_norm,
            use_attention: self.config.use_attention,
            output_size: self.spec.output_width(&self.grid),
            num_tasks: self.num_tasks,
        };
        let mut net = SurvivalNet::new(&arch, self.rule_gate.clone(), &mut rng);
        let mut optimizer = Optimizer::new(
            self.config.optimizer,
            self.config.learning_rate,
            self.config.weight_decay,
        );
        let train_targets = self.training_targets(targets);

        let holdout = match holdout {
            Some(h) if self.early_stopping => {
                Self::check_rows(h.x, &h.tasks, h.targets)?;
                let labels = self.training_targets(h.targets);
                Some((h, labels))
            }
            Some(_) => {
                log::debug!("Validation data ignored: this model trains for a fixed epoch budget");
                None
            }
            None => None,
        };

        let patience = self.config.early_stopping.patience;
        let min_delta = self.config.early_stopping.min_delta;
        let mut best: Option<(f64, SurvivalNet)> = None;
        let mut stale_epochs = 0;
        let mut order: Vec<usize> = (0..n).collect();

        for epoch in 0..self.config.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;
            for rows in order.chunks(self.config.batch_size) {
                let xb = x.select(Axis(0), rows);
                let tb: Vec<usize> = rows.iter().map(|&r| tasks[r]).collect();
                let yb = train_targets.subset(rows);
                net.zero_grad();
                let (out, cache) = net.forward_train(xb.view(), &tb, &mut rng)?;
                let (loss, grad) = self.loss(out.view(), &yb)?;
                if !loss.is_finite() {
                    return Err(ModelError::NonFiniteLoss { epoch });
                }
                net.backward(&cache, &grad);
                optimizer.step(net.params_mut());
                epoch_loss += loss * rows.len() as f64;
            }
            epoch_loss /= n as f64;

            let Some((h, labels)) = &holdout else {
                log::debug!(
                    "Epoch {}/{}: training loss {:.6}",
                    epoch + 1,
                    self.config.epochs,
                    epoch_loss
                );
                continue;
            };
            let out = net.forward(h.x, &h.tasks)?;
            let (val_loss, _) = self.loss(out.view(), labels)?;
            log::debug!(
                "Epoch {}/{}: training loss {:.6}, validation loss {:.6}",
                epoch + 1,
                self.config.epochs,
                epoch_loss,
                val_loss
            );
            let improved = match &best {
                _ if !val_loss.is_finite() => false,
                Some((best_loss, _)) => val_loss < best_loss - min_delta,
                None => true,
            };
            if improved {
                best = Some((val_loss, net.clone()));
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
                if stale_epochs >= patience {
                    log::info!(
                        "Early stopping after epoch {} (no validation improvement for {} epochs)",
                        epoch + 1,
                        patience
                    );
                    break;
                }
            }
        }

        if let Some((best_loss, best_net)) = best {
            log::debug!("Restoring the network with validation loss {best_loss:.6}");
            net = best_net;
        }

        if self.spec.discretization.is_none() {
            let log_risk = net.forward(x, tasks)?.column(0).to_owned();
            self.baselines = Some(TaskBaselines::fit(
                log_risk.view(),
                tasks,
                targets,
                self.num_tasks,
            ));
        }
        log::info!(
            "Trained {} network with {} task head(s) on {} samples ({} events)",
            self.config.variant,
            self.num_tasks,
            n,
            targets.event_count()
        );
        self.net = Some(net);
        Ok(())
    }

    pub fn survival(
        &self,
        x: ArrayView2<'_, f64>,
        tasks: &[usize],
        times: Option<&[f64]>,
    ) -> Result<SurvivalCurves, ModelError> {
        let net = self.net.as_ref().ok_or(ModelError::NotFitted)?;
        let out = net.forward(x, tasks)?;
        if let Some(values) = reconstruct_survival(self.spec.reconstruction, out.view()) {
            let curves = SurvivalCurves::from_raw(values, Some(self.grid.cuts()))?;
            return match times {
                Some(times) => Ok(curves.resample(times, Interpolation::Nearest)?),
                None => Ok(curves),
            };
        }

        let baselines = self.baselines.as_ref().ok_or(ModelError::NotFitted)?;
        let times = times.unwrap_or(self.grid.cuts());
        let mut values = Array2::<f64>::zeros((x.nrows(), times.len()));
        for (i, (&task, &eta)) in tasks.iter().zip(out.column(0).iter()).enumerate() {
            for (j, &t) in times.iter().enumerate() {
                values[(i, j)] = baselines.survival(task, eta, t);
            }
        }
        Ok(SurvivalCurves::new(times.to_vec(), values)?)
    }

    /// Log-risk for continuous variants, cumulative hazard at the last cut otherwise.
    pub fn risk(&self, x: ArrayView2<'_, f64>, tasks: &[usize]) -> Result<Array1<f64>, ModelError> {
        let net = self.net.as_ref().ok_or(ModelError::NotFitted)?;
        if !self.config.variant.is_discrete() {
            return Ok(net.forward(x, tasks)?.column(0).to_owned());
        }
        let curves = self.survival(x, tasks, None)?;
        Ok(curves
            .last()
            .mapv(|s| -s.clamp(SURVIVAL_FLOOR, 1.0).ln()))
    }
}
