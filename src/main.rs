#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

// Run orchestrator. `evaluate` cross-validates every configured model, fits a
// final model per entry on the training split and scores it on the hold-out
// split. `predict` fits on the whole table and writes counterfactual survival
// under every arm. `neighbours` lists the treatment mix of the most similar
// patients. All numeric work lives in the library; this binary only wires
// files, logging and progress reporting together.

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use prognos::benefit::counterfactual::{CounterfactualPredictor, CounterfactualTable};
use prognos::benefit::neighbours::{DEFAULT_NEIGHBOURS, NeighbourReport, PatientsLikeMe};
use prognos::config::{ModelEntry, ModelKind, Outcome, RunConfig, Settings};
use prognos::data::{PatientTable, load_patient_table};
use prognos::evaluate::{ModelTemplate, ModelTrainer, train_test_split};
use prognos::evaluate::cross_validation::TrainedModel;
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeCli {
    Os,
    Pfs,
}

impl From<OutcomeCli> for Outcome {
    fn from(value: OutcomeCli) -> Self {
        match value {
            OutcomeCli::Os => Outcome::OverallSurvival,
            OutcomeCli::Pfs => Outcome::ProgressionFreeSurvival,
        }
    }
}

#[derive(Parser)]
#[command(
    name = "prognos",
    version,
    about = "Multi-task survival models and counterfactual treatment-benefit evaluation"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Cross-validate, train and evaluate the configured models
    Evaluate {
        /// Tab-separated patient table with duration, event and treatment_group_idx columns
        #[arg(long)]
        data: PathBuf,

        /// Run configuration (.toml); defaults to one multi-task model
        #[arg(long)]
        config: Option<PathBuf>,

        /// Outcome whose default time grids are used when no configuration is given
        #[arg(long, value_enum, default_value_t = OutcomeCli::Os)]
        outcome: OutcomeCli,

        /// Write all metrics to this TSV file
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Fit the configured models on the whole table and predict survival under every arm
    Predict {
        #[arg(long)]
        data: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutcomeCli::Os)]
        outcome: OutcomeCli,

        /// Days at which survival is reported
        #[arg(long, value_delimiter = ',', default_value = "365")]
        horizons: Vec<f64>,

        /// Tab-separated output with one row per model, patient, arm and horizon
        #[arg(long)]
        output: PathBuf,
    },
    /// Treatments received by the patients most similar to one patient
    Neighbours {
        #[arg(long)]
        data: PathBuf,

        /// Identifier of the patient in the table
        #[arg(long)]
        patient: String,

        /// Number of neighbours
        #[arg(long, default_value_t = DEFAULT_NEIGHBOURS)]
        k: usize,

        /// Run configuration; only its catalog selection is used
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn create_progress_bar(len: u64) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(4)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    pb
}

fn default_run(outcome: Outcome) -> RunConfig {
    RunConfig {
        settings: Settings::for_outcome(outcome),
        models: vec![ModelEntry {
            name: "multi_task".to_string(),
            kind: ModelKind::MultiTask,
            network: None,
            linear: None,
        }],
    }
}

fn write_metrics(path: &Path, trained: &[TrainedModel]) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?;
    writer.write_record(["model", "split", "metric", "value"])?;
    for model in trained {
        for (split, report) in [("cv", &model.cv), ("holdout", &model.holdout)] {
            for (metric, value) in report.iter() {
                writer.write_record([
                    model.name.as_str(),
                    split,
                    metric,
                    value.to_string().as_str(),
                ])?;
            }
        }
    }
    writer.flush()?;
    log::info!("Wrote metrics to '{}'", path.display());
    Ok(())
}

fn load_run(config: Option<PathBuf>, outcome: Outcome) -> Result<RunConfig, Box<dyn Error>> {
    let run = match config {
        Some(path) => RunConfig::load(&path)?,
        None => default_run(outcome),
    };
    if run.models.is_empty() {
        return Err("the run configuration lists no models".into());
    }
    Ok(run)
}

fn write_counterfactuals(
    writer: &mut csv::Writer<std::fs::File>,
    model: &str,
    ids: &[String],
    arms: &CounterfactualTable,
) -> Result<(), Box<dyn Error>> {
    for label in arms.labels() {
        let Some(survival) = arms.arm(label) else {
            continue;
        };
        for (id, row) in ids.iter().zip(survival.rows()) {
            for (horizon, value) in arms.horizons().iter().zip(row.iter()) {
                writer.write_record([
                    model,
                    id.as_str(),
                    label.as_str(),
                    horizon.to_string().as_str(),
                    value.to_string().as_str(),
                ])?;
            }
        }
    }
    Ok(())
}

fn run_predict(
    data: PathBuf,
    config: Option<PathBuf>,
    outcome: Outcome,
    horizons: Vec<f64>,
    output: PathBuf,
) -> Result<(), Box<dyn Error>> {
    if horizons.is_empty() || horizons.iter().any(|h| !h.is_finite() || *h < 0.0) {
        return Err("horizons must be finite, non-negative days".into());
    }
    let run = load_run(config, outcome)?;
    let catalog = run.settings.catalog.build();
    let table = load_patient_table(&data, &catalog)?;
    let trainer = ModelTrainer::new(run.settings.clone(), catalog)?;
    let predictor = CounterfactualPredictor::new(trainer.catalog(), table.feature_layout());

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&output)?;
    writer.write_record(["model", "patient_id", "arm", "horizon", "survival"])?;
    let pb = create_progress_bar(run.models.len() as u64);
    for entry in &run.models {
        pb.set_message(entry.name.clone());
        let template = ModelTemplate::from_entry(entry);
        let model = trainer.fit_final(&template, &table)?;
        let arms = predictor.all_arms(model.as_ref(), table.features(), &horizons)?;
        write_counterfactuals(&mut writer, &entry.name, &table.ids, &arms)?;
        pb.inc(1);
    }
    pb.finish_and_clear();
    writer.flush()?;
    log::info!(
        "Wrote survival under {} arms for {} patients to '{}'",
        trainer.catalog().len(),
        table.n_samples(),
        output.display()
    );
    Ok(())
}

fn print_neighbours(patient: &str, report: &NeighbourReport) {
    println!("== {} nearest patients to {} ==", report.neighbours.len(), patient);
    for neighbour in &report.neighbours {
        println!("{}\t{:.4}", neighbour.id, neighbour.distance);
    }
    println!("\n{:<48}{:>10}{:>10}", "treatment", "overall", "similar");
    for share in &report.shares {
        println!(
            "{:<48}{:>10.3}{:>10.3}",
            share.label, share.overall_fraction, share.neighbour_fraction
        );
    }
}

fn run_neighbours(
    data: PathBuf,
    patient: String,
    k: usize,
    config: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    if k == 0 {
        return Err("k must be at least 1".into());
    }
    let catalog = match config {
        Some(path) => RunConfig::load(&path)?.settings.catalog.build(),
        None => Settings::default().catalog.build(),
    };
    let table = load_patient_table(&data, &catalog)?;
    let row = table
        .ids
        .iter()
        .position(|id| *id == patient)
        .ok_or_else(|| format!("patient '{patient}' is not in '{}'", data.display()))?;
    let report = PatientsLikeMe::new(&catalog, k).find_for_row(&table, row)?;
    print_neighbours(&patient, &report);
    Ok(())
}

fn run_evaluate(
    data: PathBuf,
    config: Option<PathBuf>,
    outcome: Outcome,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    let run = load_run(config, outcome)?;
    let catalog = run.settings.catalog.build();
    let table: PatientTable = load_patient_table(&data, &catalog)?;

    let settings = run.settings.clone();
    let (train_rows, test_rows) =
        train_test_split(table.n_samples(), settings.test_fraction, settings.random_state);
    let train = table.subset(&train_rows);
    let test = table.subset(&test_rows);
    log::info!(
        "{} patients: {} for training, {} held out",
        table.n_samples(),
        train.n_samples(),
        test.n_samples()
    );

    let trainer = ModelTrainer::new(settings, catalog)?;
    let pb = create_progress_bar(run.models.len() as u64);
    let mut trained = Vec::with_capacity(run.models.len());
    for entry in &run.models {
        pb.set_message(entry.name.clone());
        let template = ModelTemplate::from_entry(entry);
        trained.push(trainer.evaluate_template(&entry.name, &template, &train, &test)?);
        pb.inc(1);
    }
    pb.finish_and_clear();
    trainer.release_matches();

    for model in &trained {
        println!("== {} (cross-validation) ==\n{}", model.name, model.cv);
        println!("== {} (hold-out) ==\n{}", model.name, model.holdout);
    }
    if let Some(path) = output {
        write_metrics(&path, &trained)?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Some(Commands::Evaluate {
            data,
            config,
            outcome,
            output,
        }) => run_evaluate(data, config, outcome.into(), output),
        Some(Commands::Predict {
            data,
            config,
            outcome,
            horizons,
            output,
        }) => run_predict(data, config, outcome.into(), horizons, output),
        Some(Commands::Neighbours {
            data,
            patient,
            k,
            config,
        }) => run_neighbours(data, patient, k, config),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_prints_help_and_succeeds() {
        assert!(run(Cli { command: None }).is_ok());
    }

    #[test]
    fn horizons_are_comma_separated() {
        let cli = Cli::try_parse_from([
            "prognos", "predict", "--data", "t.tsv", "--horizons", "182,365", "--output", "o.tsv",
        ])
        .unwrap();
        let Some(Commands::Predict { horizons, .. }) = cli.command else {
            panic!("expected the predict subcommand");
        };
        assert_eq!(horizons, vec![182.0, 365.0]);
    }
}
