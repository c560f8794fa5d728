use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use prognos::benefit::cfb::{BenefitEstimator, c_for_benefit};
use prognos::benefit::matching::{CovariateMatcher, MatchingMode};
use prognos::catalog::{REFERENCE_ARM, TreatmentCatalog};
use prognos::data::{PatientTable, SurvivalTargets};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const COVARIATES: usize = 12;

fn cohort(n: usize) -> PatientTable {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE + n as u64);
    let mut features = Array2::<f64>::zeros((n, COVARIATES + 1));
    let mut tasks = Vec::with_capacity(n);
    for i in 0..n {
        let treated = rng.gen_bool(0.5);
        for j in 0..COVARIATES {
            features[(i, j)] = rng.gen_range(-2.0..2.0);
        }
        features[(i, COVARIATES)] = f64::from(u8::from(treated));
        tasks.push(usize::from(treated));
    }
    let mut names: Vec<String> = (0..COVARIATES).map(|j| format!("x{j}")).collect();
    names.push("systemicTreatmentPlan_5-FU".to_string());
    let durations = Array1::from_shape_fn(n, |_| rng.gen_range(10.0..1500.0));
    let events = Array1::from_shape_fn(n, |_| f64::from(u8::from(rng.gen_bool(0.7))));
    PatientTable::new(
        (0..n).map(|i| format!("p{i}")).collect(),
        names,
        features,
        SurvivalTargets::new(durations, events).expect("valid targets"),
        tasks,
        &TreatmentCatalog::standard(),
    )
    .expect("valid table")
}

fn benchmark_matching(c: &mut Criterion) {
    let catalog = TreatmentCatalog::standard();
    let mut group = c.benchmark_group("covariate_matching");
    for n in [200_usize, 800, 2000] {
        let table = cohort(n);
        let cols: Vec<usize> = (0..COVARIATES).collect();
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &table, |b, table| {
            b.iter(|| {
                // Fresh matcher so every iteration pays for the distance matrix.
                let matcher = CovariateMatcher::new(MatchingMode::ManyToOne);
                black_box(
                    matcher
                        .build_pairs(table, &catalog, REFERENCE_ARM, "5-FU", &cols)
                        .expect("pairs"),
                )
            })
        });
    }
    group.finish();
}

fn benchmark_c_for_benefit(c: &mut Criterion) {
    let catalog = TreatmentCatalog::standard();
    let mut group = c.benchmark_group("c_for_benefit");
    for n in [200_usize, 800, 2000] {
        let table = cohort(n);
        let cols: Vec<usize> = (0..COVARIATES).collect();
        let pairs = CovariateMatcher::default()
            .build_pairs(&table, &catalog, REFERENCE_ARM, "5-FU", &cols)
            .expect("pairs");
        let mut rng = StdRng::seed_from_u64(n as u64);
        let s_a = Array1::from_shape_fn(n, |_| rng.gen_range(0.0..1.0));
        let s_b = Array1::from_shape_fn(n, |_| rng.gen_range(0.0..1.0));
        group.throughput(Throughput::Elements((pairs.len() * pairs.len()) as u64));
        group.bench_function(BenchmarkId::from_parameter(n), |b| {
            b.iter(|| {
                black_box(c_for_benefit(
                    &pairs,
                    s_a.view(),
                    s_b.view(),
                    table.targets.durations.view(),
                    table.targets.events.view(),
                    365.0,
                    BenefitEstimator::MeanIte,
                ))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_matching, benchmark_c_for_benefit);
criterion_main!(benches);
