use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use riskgrouper::boost::SearchStrategy;
use riskgrouper::config::{PipelineConfig, SplitInclusion};
use riskgrouper::data::{DelimitedFileSource, MemberTable, load_table};
use riskgrouper::model::{ModelKind, TrainedModel};
use riskgrouper::pipeline::{self, RunContext};
use riskgrouper::report::TargetStatus;
use riskgrouper::sigmoid;
use riskgrouper::split::Partition;
use chrono::NaiveDate;
use std::fmt::Write as FmtWrite;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const TARGET: &str = "any_event_next_90d";

/// Writes a member-period TSV with three monthly periods per member.
fn write_table(path: &Path, members: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut text = String::from(
        "FH_ID\tEffective_Month_Start\tAge\tChronic_Count\tRecent_ER_Flag\tLab_Score\tPlan\tany_event_next_90d\ted_event_next_30d\n",
    );
    for m in 0..members {
        let age = 30.0 + 40.0 * rng.gen_range(0.0..1.0);
        let chronic = rng.gen_range(0..5);
        for month in 7..=9 {
            let er = u8::from(rng.gen_bool(0.25));
            let lab: f64 = normal.sample(&mut rng);
            let margin = -2.0 + 0.5 * chronic as f64 + 1.3 * er as f64 + 0.8 * lab;
            let event = u8::from(rng.gen_bool(sigmoid(margin)));
            let ed = u8::from(event == 1 && rng.gen_bool(0.5));
            // Some lab values are missing.
            let lab_cell = if m % 17 == 0 { String::new() } else { format!("{lab:.5}") };
            writeln!(
                text,
                "M{m:05}\t2024-{month:02}-01\t{age:.1}\t{chronic}\t{er}\t{lab_cell}\t{}\t{event}\t{ed}",
                if m % 3 == 0 { "gold" } else { "silver" }
            )
            .unwrap();
        }
    }
    fs::write(path, text).unwrap();
}

fn load(path: &Path, config: &PipelineConfig) -> MemberTable {
    let mut source = DelimitedFileSource::new(path);
    load_table(&mut source, &config.schema()).unwrap()
}

fn quick_config(out: &Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        output_dir: out.join("reports"),
        run_log: Some(out.join("runs.csv")),
        window_start: NaiveDate::from_ymd_opt(2024, 8, 1),
        window_end: NaiveDate::from_ymd_opt(2024, 9, 1),
        background_cap: 50,
        ..PipelineConfig::default()
    };
    config.boosting.n_estimators = 25;
    config.boosting.max_depth = 3;
    config.search.strategy = SearchStrategy::Disabled;
    config
}

#[test]
fn end_to_end_run_writes_every_output() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("members.tsv");
    write_table(&input, 200, 7);
    let config = quick_config(dir.path());
    let table = load(&input, &config);
    assert_eq!(table.len(), 600);

    let context = RunContext::new(config).unwrap();
    let summary = pipeline::run(&context, &table).unwrap();
    let report = summary.report(TARGET).unwrap();
    assert_eq!(report.status, TargetStatus::Completed);
    assert!(report.features.contains(&"lab_score".to_string()));
    assert!(!report.features.contains(&"ed_event_next_30d".to_string()));
    assert!(!report.features.contains(&"plan".to_string()));

    // Records cover test rows inside the window only.
    assert!(!report.records.is_empty());
    let start = NaiveDate::from_ymd_opt(2024, 8, 1).unwrap();
    for record in &report.records {
        assert_eq!(record.split, Partition::Test);
        assert!(record.period.unwrap() >= start);
        let logistic = record.logistic.unwrap();
        let boosted = record.boosted.unwrap();
        assert!((0.0..=1.0).contains(&logistic.probability));
        assert!((0.0..=1.0).contains(&boosted.probability));
        let explanation = record.boosted_explanation.as_ref().unwrap();
        let base = explanation.base_value.unwrap();
        let build_up = record.boosted_build_up.as_ref().unwrap();
        assert!((build_up.total - boosted.probability).abs() < 1e-6);
        assert!((build_up.base_value - base).abs() < 1e-12);
    }

    let written = pipeline::write_outputs(&context, &summary).unwrap();
    let target_dir = dir.path().join("reports").join(TARGET);
    for name in [
        "summary.json",
        "records.jsonl",
        "metrics.json",
        "metrics.csv",
        "calibration.csv",
        "global_factors.json",
        "pr_curves.json",
        "logistic_model.toml",
        "boosted_model.toml",
    ] {
        assert!(target_dir.join(name).exists(), "missing {name}");
    }
    assert!(written.contains(&dir.path().join("reports").join("run_summary.json")));

    let calibration = fs::read_to_string(target_dir.join("calibration.csv")).unwrap();
    // Header plus ten bins for each model on the test partition.
    assert_eq!(calibration.lines().count(), 1 + 2 * 10);

    let lines = fs::read_to_string(target_dir.join("records.jsonl")).unwrap();
    assert_eq!(lines.lines().count(), report.records.len());

    let saved = TrainedModel::load(&target_dir.join("logistic_model.toml")).unwrap();
    assert_eq!(saved.kind(), ModelKind::Logistic);
    assert_eq!(
        saved.fingerprint().unwrap(),
        report.model(ModelKind::Logistic).unwrap().fingerprint
    );

    let run_log = fs::read_to_string(dir.path().join("runs.csv")).unwrap();
    assert_eq!(run_log.lines().count(), 2);
    assert!(run_log.lines().nth(1).unwrap().contains(",completed,"));
}

#[test]
fn explainers_are_reused_across_runs() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("members.tsv");
    write_table(&input, 120, 3);
    let mut config = quick_config(dir.path());
    config.cache_dir = Some(dir.path().join("cache"));
    config.include_splits = SplitInclusion::All;
    let table = load(&input, &config);

    let first = pipeline::run(&RunContext::new(config.clone()).unwrap(), &table).unwrap();
    let entries = |dir: &Path| fs::read_dir(dir).unwrap().count();
    assert_eq!(entries(&dir.path().join("cache")), 2);

    let second = pipeline::run(&RunContext::new(config).unwrap(), &table).unwrap();
    assert_eq!(entries(&dir.path().join("cache")), 2);
    assert_eq!(
        first.reports[0].records.len(),
        second.reports[0].records.len()
    );
    for (a, b) in first.reports[0].records.iter().zip(&second.reports[0].records) {
        assert_eq!(a.boosted_explanation, b.boosted_explanation);
    }
}

#[test]
fn single_class_target_is_skipped_and_logged() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("members.tsv");
    write_table(&input, 60, 1);
    let mut config = quick_config(dir.path());
    config.targets = vec![TARGET.to_string(), "ed_event_next_30d".to_string()];
    let table = load(&input, &config);

    // Blank out the second target so only one class remains.
    let mut text = fs::read_to_string(&input).unwrap();
    text = text
        .lines()
        .enumerate()
        .map(|(i, line)| {
            if i == 0 {
                line.to_string()
            } else {
                let (head, _) = line.rsplit_once('\t').unwrap();
                format!("{head}\t0")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    let flat = dir.path().join("flat.tsv");
    fs::write(&flat, text).unwrap();
    let flat_table = load(&flat, &config);
    assert_eq!(flat_table.len(), table.len());

    let summary = pipeline::run(&RunContext::new(config).unwrap(), &flat_table).unwrap();
    assert_eq!(summary.reports.len(), 2);
    assert_eq!(summary.reports[0].status, TargetStatus::Completed);
    assert!(matches!(summary.reports[1].status, TargetStatus::Skipped(_)));
    let run_log = fs::read_to_string(dir.path().join("runs.csv")).unwrap();
    assert_eq!(run_log.lines().count(), 3);
    assert!(run_log.contains(",skipped,"));
}
