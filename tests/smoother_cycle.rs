//! End-to-end: sample, run through a job queue, load, update.

use ensemble_store::analysis::ALL_ACTIVE_STEP;
use ensemble_store::error::AnalysisError;
use ensemble_store::run::RESPONSES_FILE;
use ensemble_store::{
    Distribution, EnsembleConfig, EnsembleError, ExecutionError, GenKwKey, IterativeEnsembleSmoother, Job, JobQueue,
    JobReport, Observation, ObservationSet, ObservationStatus, ParameterConfig, ParameterKind, ParameterSelection, RealizationState,
    Reporter, RunStatus, RunpathConfig, Session, SessionConfig, StorageConfig, UpdateConfiguration, UpdateStep,
};

use std::fs;
use std::path::Path;
use std::thread;
use tempfile::tempdir;

const N: usize = 10;

/// Forward model stand-in: reads `poro.txt` from each run path and writes
/// `FOPR = [sum, first]` and a constant `CONST = [1.0]`.
struct FakeSimulator {
    fail: Vec<usize>,
    silent: Vec<usize>,
}

impl FakeSimulator {
    fn simulate(job: &Job) -> Result<(), String> {
        let text = fs::read_to_string(job.runpath.join("poro.txt")).map_err(|e| e.to_string())?;
        let values: Vec<f64> = text
            .lines()
            .map(|l| l.trim().parse::<f64>().map_err(|e| e.to_string()))
            .collect::<Result<_, _>>()?;
        let sum: f64 = values.iter().sum();
        let doc = serde_json::json!({
            "dates": ["2020-01-01T00:00:00Z"],
            "responses": {
                "FOPR": { "0": [sum, values[0]] },
                "CONST": { "0": [1.0] },
            }
        });
        fs::write(job.runpath.join(RESPONSES_FILE), doc.to_string()).map_err(|e| e.to_string())
    }
}

impl JobQueue for FakeSimulator {
    fn submit(&self, jobs: Vec<Job>, reporter: Reporter) -> Result<(), ExecutionError> {
        let fail = self.fail.clone();
        let silent = self.silent.clone();
        thread::spawn(move || {
            for job in jobs {
                if silent.contains(&job.realization) {
                    continue;
                }
                let report = if fail.contains(&job.realization) {
                    JobReport::failure(job.realization, "simulator exited with status 1")
                } else {
                    match Self::simulate(&job) {
                        Ok(()) => JobReport::success(job.realization),
                        Err(reason) => JobReport::failure(job.realization, reason),
                    }
                };
                reporter.report(report);
            }
        });
        Ok(())
    }
}

fn ensemble() -> EnsembleConfig {
    EnsembleConfig::new()
        .with_parameter(ParameterConfig::new("PORO", ParameterKind::Field { size: 4 }).with_output_file("poro.txt"))
        .unwrap()
        .with_parameter(ParameterConfig::new(
            "MULT",
            ParameterKind::GenKw {
                keys: vec![GenKwKey::new("M", Distribution::Uniform { min: 0.5, max: 1.5 })],
            },
        ))
        .unwrap()
        .with_response("FOPR")
        .with_response("CONST")
}

fn observations() -> ObservationSet {
    ObservationSet::new()
        .with(Observation::new("FOPR_SUM", "FOPR", 0, vec![0.5], vec![0.5]))
        .unwrap()
        .with(Observation::new("CONST_OBS", "CONST", 0, vec![1.0], vec![0.1]))
        .unwrap()
}

fn open(dir: &Path) -> Session {
    let config = SessionConfig {
        storage: StorageConfig::new(dir.join("storage"), N),
        runpaths: RunpathConfig {
            base_dir: Some(dir.to_path_buf()),
            ..RunpathConfig::default()
        },
        random_seed: Some(2024),
        round_timeout_ms: 10_000,
        ..SessionConfig::default()
    };
    let mut config = config;
    config.analysis.update_log_path = Some(dir.join("update_log"));
    Session::open(config, ensemble(), observations()).unwrap()
}

/// Sample the prior, run it and load the results; realization 3 fails.
fn run_prior(session: &mut Session) -> ensemble_store::RunContext {
    session.sample_prior("prior", &[true; N], None).unwrap();
    let mut ctx = session
        .create_ensemble_smoother_run_context(None, 0, "prior", "posterior")
        .unwrap();
    assert_eq!(session.create_run_paths(&ctx).unwrap(), N);

    let queue = FakeSimulator {
        fail: vec![3],
        silent: vec![],
    };
    let report = session.run_forward_model(&queue, &mut ctx).unwrap();
    assert_eq!(report.loaded(), N - 1);
    assert_eq!(report.round.failed(), vec![3]);
    ctx
}

#[test]
fn test_full_cycle() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path());
    let ctx = run_prior(&mut session);

    let prior = session.case("prior").unwrap();
    let states = prior.state_map().unwrap();
    assert_eq!(states.count(RealizationState::HasData), N - 1);
    assert_eq!(states.get(3), Some(RealizationState::LoadFailure));
    assert_eq!(ctx.run_arg(3).unwrap().run_status(), RunStatus::RunFailure);
    assert!(!ctx.is_active(3));
    assert_eq!(prior.time_map().unwrap().len(), 1);

    let txt = fs::read_to_string(ctx.run_arg(0).unwrap().runpath().join("parameters.txt")).unwrap();
    assert!(txt.starts_with("MULT:M "));

    let snapshot = session.smoother_update(&ctx).unwrap();
    assert_eq!(snapshot.source_case, "prior");
    assert_eq!(snapshot.target_case, "posterior");
    assert_eq!(snapshot.realizations.len(), N - 1);

    let step = snapshot.step(ALL_ACTIVE_STEP).unwrap();
    assert_eq!(step.status("FOPR_SUM"), Some(ObservationStatus::Active));
    assert_eq!(step.status("CONST_OBS"), Some(ObservationStatus::Deactivated));

    let posterior = session.case("posterior").unwrap();
    let states = posterior.state_map().unwrap();
    assert_eq!(states.count(RealizationState::Initialized), N - 1);
    assert_eq!(states.get(3), Some(RealizationState::ParentFailure));
    assert_ne!(
        prior.load_parameter("PORO", 0).unwrap(),
        posterior.load_parameter("PORO", 0).unwrap()
    );

    let logged = session.snapshots().get(ctx.run_id()).unwrap();
    assert!(std::sync::Arc::ptr_eq(&logged, &snapshot));
    let report = dir.path().join("update_log").join(format!("update_{}.txt", ctx.run_id()));
    assert!(fs::read_to_string(report).unwrap().contains("FOPR_SUM"));
}

#[test]
fn test_localized_update_leaves_other_rows_identical() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path());
    let ctx = run_prior(&mut session);

    session
        .set_update_steps(UpdateConfiguration::new(vec![UpdateStep::new("local")
            .with_observation("FOPR_SUM")
            .with_parameter(ParameterSelection::subset("PORO", vec![0, 2]))]))
        .unwrap();
    session.smoother_update(&ctx).unwrap();

    let prior = session.case("prior").unwrap();
    let posterior = session.case("posterior").unwrap();
    for iens in (0..N).filter(|&i| i != 3) {
        let before = prior.load_parameter("PORO", iens).unwrap();
        let after = posterior.load_parameter("PORO", iens).unwrap();
        assert_eq!(before[1].to_bits(), after[1].to_bits());
        assert_eq!(before[3].to_bits(), after[3].to_bits());

        let mult_before = prior.load_parameter("MULT", iens).unwrap();
        let mult_after = posterior.load_parameter("MULT", iens).unwrap();
        assert_eq!(mult_before, mult_after);
    }
}

#[test]
fn test_zero_active_observations_is_analysis_error() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path());
    let ctx = run_prior(&mut session);

    session
        .set_update_steps(UpdateConfiguration::new(vec![UpdateStep::new("constant_only")
            .with_observation("CONST_OBS")
            .with_parameter(ParameterSelection::all("PORO"))]))
        .unwrap();
    let err = session.smoother_update(&ctx).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::Analysis(AnalysisError::NoActiveObservations { ref step }) if step == "constant_only"
    ));
    assert!(session.snapshots().is_empty());

    let posterior = session.case("posterior").unwrap();
    assert!(!posterior.has_parameter("PORO", 0));
    assert_eq!(
        posterior.state_map().unwrap().count(RealizationState::Undefined),
        N
    );
}

#[test]
fn test_unreported_realizations_fail_the_round_only() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path());
    session.sample_prior("default", &[true; N], None).unwrap();
    let mut ctx = session.create_ensemble_experiment_run_context(None, 0, None).unwrap();
    session.create_run_paths(&ctx).unwrap();

    let queue = FakeSimulator {
        fail: vec![],
        silent: vec![1, 7],
    };
    let report = session.run_forward_model(&queue, &mut ctx).unwrap();
    assert_eq!(report.loaded(), N - 2);
    assert_eq!(report.round.failed(), vec![1, 7]);
    assert_eq!(ctx.count_active(), N - 2);

    let states = session.case("default").unwrap().state_map().unwrap();
    assert_eq!(states.get(1), Some(RealizationState::LoadFailure));
    assert_eq!(states.get(7), Some(RealizationState::LoadFailure));
    assert_eq!(states.count(RealizationState::HasData), N - 2);
}

#[test]
fn test_runpath_manifest_and_reuse_check() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path());
    session.sample_prior("default", &[true; N], None).unwrap();

    let mut mask = vec![false; N];
    mask[2] = true;
    mask[5] = true;
    assert!(!session.check_if_runpath_exists(&[0], &mask).unwrap());
    let ctx = session
        .create_ensemble_experiment_run_context(Some(mask.clone()), 0, None)
        .unwrap();
    session.create_run_paths(&ctx).unwrap();
    assert!(session.check_if_runpath_exists(&[0], &mask).unwrap());
    assert!(!session.check_if_runpath_exists(&[1], &mask).unwrap());

    let manifest = session.runpaths().read_manifest().unwrap();
    let listed: Vec<usize> = manifest.iter().map(|e| e.realization).collect();
    assert_eq!(listed, vec![2, 5]);
    assert!(manifest.iter().all(|e| e.iteration == 0));
}

#[test]
fn test_snapshot_recorded_when_report_fails() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path());
    let ctx = run_prior(&mut session);
    // A regular file where the report directory should go.
    fs::write(dir.path().join("update_log"), "not a directory").unwrap();

    let err = session.smoother_update(&ctx).unwrap_err();
    assert!(err.is_file_system(), "{err}");

    let logged = session.snapshots().get(ctx.run_id()).unwrap();
    assert_eq!(logged.target_case, "posterior");
    let posterior = session.case("posterior").unwrap();
    assert!(posterior.has_parameter("PORO", 0));
}

#[test]
fn test_iterative_rounds_keep_state() {
    let dir = tempdir().unwrap();
    let mut session = open(dir.path());
    let ctx = run_prior(&mut session);

    let mut ies = IterativeEnsembleSmoother::new(N);
    let first = session.iterative_smoother_update(&ctx, &mut ies).unwrap();
    assert_eq!(first.analysis_module, "IES_ENKF");
    assert_eq!(ies.iteration(), 2);
    let prior = session.case("prior").unwrap();
    let posterior = session.case("posterior").unwrap();
    assert_ne!(
        prior.load_parameter("PORO", 0).unwrap(),
        posterior.load_parameter("PORO", 0).unwrap()
    );
    assert_eq!(posterior.state_map().unwrap().get(3), Some(RealizationState::ParentFailure));

    session
        .set_update_steps(UpdateConfiguration::new(vec![
            UpdateStep::new("a")
                .with_observation("FOPR_SUM")
                .with_parameter(ParameterSelection::all("PORO")),
            UpdateStep::new("b")
                .with_observation("FOPR_SUM")
                .with_parameter(ParameterSelection::all("MULT")),
        ]))
        .unwrap();
    let err = session.iterative_smoother_update(&ctx, &mut ies).unwrap_err();
    assert!(matches!(
        err,
        EnsembleError::Analysis(AnalysisError::IterativeMultiStep { steps: 2, .. })
    ));
    assert_eq!(ies.iteration(), 2);
}
