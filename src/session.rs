//! The session: one experiment's storage, run paths, seed and update log.
//!
//! There is no global state. Everything an experiment needs between calls
//! lives on [`Session`]: the storage manager (and with it the active case),
//! the run path formatter, the process seed and the streams derived from
//! it, and the snapshots of every smoother update run so far.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use tracing::{debug, info};

use crate::analysis::{
    write_update_report, AnalysisModule, EnsembleSmoother, IterativeEnsembleSmoother, ObservationSet, SmootherUpdate,
    SnapshotLog, UpdateConfiguration, UpdateSnapshot,
};
use crate::config::SessionConfig;
use crate::error::{EnsembleResult, FileSystemError, ValidationError};
use crate::export::generate_parameter_files;
use crate::parameter::EnsembleConfig;
use crate::run::{
    load_from_run_path, mark_load_failures, run_round, JobQueue, LoadReport, ResultLoader, RoundOutcome,
    RunContext, RunPathLoader, Runpaths,
};
use crate::sampling::{derive_rng, PriorSampler, SampleReport};
use crate::storage::{CaseStore, StorageManager};

/// Stream name the update noise is drawn from.
const UPDATE_STREAM: &str = "smoother-update";

/// Outcome of running and loading one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardModelReport {
    /// What the job queue reported.
    pub round: RoundOutcome,
    /// What loading the finished realizations produced.
    pub load: LoadReport,
}

impl ForwardModelReport {
    /// Number of realizations that now have data.
    #[must_use]
    pub fn loaded(&self) -> usize {
        self.load.loaded
    }

    /// Number of realizations that failed to run or load.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.round.failures.len() + self.load.failures.len()
    }
}

/// One experiment.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    ensemble: EnsembleConfig,
    observations: ObservationSet,
    update_steps: UpdateConfiguration,
    storage: StorageManager,
    runpaths: Runpaths,
    sampler: PriorSampler,
    update_rng: ChaCha20Rng,
    snapshots: SnapshotLog,
}

impl Session {
    /// Open a session: lock the storage root and mount the active case.
    ///
    /// Without a configured seed one is drawn and logged so the
    /// experiment can be repeated. The update uses a single
    /// `ALL_ACTIVE` step until [`Self::set_update_steps`] says otherwise.
    pub fn open(config: SessionConfig, ensemble: EnsembleConfig, observations: ObservationSet) -> EnsembleResult<Self> {
        let config = config.validate()?;
        observations.check_responses(&ensemble)?;

        let storage = StorageManager::open(config.storage.clone())?;
        let runpaths = Runpaths::new(&config.runpaths, storage.root())?;

        let seed = config.random_seed.unwrap_or_else(|| {
            let seed: u64 = rand::thread_rng().gen();
            info!(seed, "no random seed configured; set random_seed to this value to reproduce");
            seed
        });
        let sampler = PriorSampler::new(seed, runpaths.base_dir());
        let update_steps = UpdateConfiguration::all_active(&ensemble, &observations);

        info!(
            seed,
            case = %storage.active_case(),
            ensemble_size = storage.ensemble_size(),
            parameters = ensemble.parameters().len(),
            observations = observations.len(),
            "session opened"
        );

        Ok(Self {
            config,
            ensemble,
            observations,
            update_steps,
            storage,
            runpaths,
            sampler,
            update_rng: derive_rng(seed, UPDATE_STREAM),
            snapshots: SnapshotLog::new(),
        })
    }

    /// Replace the update steps.
    pub fn set_update_steps(&mut self, steps: UpdateConfiguration) -> EnsembleResult<()> {
        steps.validate(&self.ensemble, &self.observations)?;
        self.update_steps = steps;
        Ok(())
    }

    /// Process seed.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.sampler.seed()
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Parameter and response declarations.
    #[must_use]
    pub fn ensemble(&self) -> &EnsembleConfig {
        &self.ensemble
    }

    /// Observations.
    #[must_use]
    pub fn observations(&self) -> &ObservationSet {
        &self.observations
    }

    /// Current update steps.
    #[must_use]
    pub fn update_steps(&self) -> &UpdateConfiguration {
        &self.update_steps
    }

    /// Run path formatter.
    #[must_use]
    pub fn runpaths(&self) -> &Runpaths {
        &self.runpaths
    }

    /// Storage manager.
    #[must_use]
    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Storage manager, mutably.
    pub fn storage_mut(&mut self) -> &mut StorageManager {
        &mut self.storage
    }

    /// Snapshots of every update run in this session.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotLog {
        &self.snapshots
    }

    /// Name of the active case.
    #[must_use]
    pub fn current_case(&self) -> &str {
        self.storage.active_case()
    }

    /// Make an existing case the active one.
    pub fn switch_case(&mut self, name: &str) -> EnsembleResult<Arc<CaseStore>> {
        self.storage.set_active_case(name)
    }

    /// Handle to `name`, creating the case if needed.
    pub fn case(&mut self, name: &str) -> EnsembleResult<Arc<CaseStore>> {
        self.storage.open_or_create(name)
    }

    /// Write prior parameter values into `case` for the active realizations.
    ///
    /// `keys` defaults to every declared parameter.
    pub fn sample_prior(&mut self, case: &str, active: &[bool], keys: Option<&[String]>) -> EnsembleResult<SampleReport> {
        let handle = self.storage.open_or_create(case)?;
        let all;
        let keys = match keys {
            Some(keys) => keys,
            None => {
                all = self.ensemble.parameter_keys();
                &all
            }
        };
        self.sampler.sample(&handle, &self.ensemble, active, keys)
    }

    /// Context for running the forward model on `source` (default: the
    /// active case) without an update target.
    pub fn create_ensemble_experiment_run_context(
        &mut self,
        mask: Option<Vec<bool>>,
        iteration: usize,
        source: Option<&str>,
    ) -> EnsembleResult<RunContext> {
        let source = source.map_or_else(|| self.storage.active_case().to_string(), str::to_string);
        self.storage.open_or_create(&source)?;
        RunContext::build(&self.runpaths, self.storage.ensemble_size(), iteration, mask, &source, None)
    }

    /// Context for running `source` and updating into `target`.
    pub fn create_ensemble_smoother_run_context(
        &mut self,
        mask: Option<Vec<bool>>,
        iteration: usize,
        source: &str,
        target: &str,
    ) -> EnsembleResult<RunContext> {
        self.storage.open_or_create(source)?;
        self.storage.open_or_create(target)?;
        RunContext::build(
            &self.runpaths,
            self.storage.ensemble_size(),
            iteration,
            mask,
            source,
            Some(target),
        )
    }

    /// Returns true if any active run path of the given iterations exists.
    pub fn check_if_runpath_exists(&self, iterations: &[usize], mask: &[bool]) -> EnsembleResult<bool> {
        let realizations: Vec<usize> = (0..mask.len()).filter(|&i| mask[i]).collect();
        self.runpaths.any_exists(iterations, &realizations)
    }

    /// Create the run directories of the active realizations, write their
    /// parameter files and the run-path manifest.
    ///
    /// Returns the number of run paths created.
    pub fn create_run_paths(&mut self, context: &RunContext) -> EnsembleResult<usize> {
        context.ensure_active()?;
        let case = self.storage.open_or_create(context.source_case())?;
        let export_name = &self.config.runpaths.parameter_export_name;

        let mut created = 0;
        for run_arg in context.run_args().iter().filter(|a| a.is_active()) {
            let dir = run_arg.runpath();
            fs::create_dir_all(dir).map_err(|e| FileSystemError::io(dir, e))?;
            let files = generate_parameter_files(&case, &self.ensemble, run_arg, export_name)?;
            debug!(realization = run_arg.realization(), runpath = %dir.display(), files = files.len(), "created run path");
            created += 1;
        }

        self.runpaths
            .write_manifest(&[context.iteration()], &context.active_realizations())?;
        info!(
            case = %case.name(),
            iteration = context.iteration(),
            created,
            manifest = %self.runpaths.manifest_path().display(),
            "created run paths"
        );
        Ok(created)
    }

    /// Submit the active realizations, wait for the job queue and load the
    /// realizations that finished.
    ///
    /// Failed or unreported realizations become `LoadFailure` in the
    /// source case and are deactivated in `context`.
    pub fn run_forward_model(
        &mut self,
        queue: &dyn JobQueue,
        context: &mut RunContext,
    ) -> EnsembleResult<ForwardModelReport> {
        let timeout = Duration::from_millis(self.config.round_timeout_ms);
        let round = run_round(queue, context, timeout)?;
        let case = self.storage.open_or_create(context.source_case())?;
        mark_load_failures(&case, &round.failures)?;
        let load = load_from_run_path(&RunPathLoader, &case, &self.ensemble, context)?;
        Ok(ForwardModelReport { round, load })
    }

    /// Load results of the active realizations from their run paths.
    pub fn load_from_run_path(&mut self, context: &mut RunContext) -> EnsembleResult<LoadReport> {
        self.load_with(&RunPathLoader, context)
    }

    /// [`Self::load_from_run_path`] with a custom loader.
    pub fn load_with(&mut self, loader: &dyn ResultLoader, context: &mut RunContext) -> EnsembleResult<LoadReport> {
        let case = self.storage.open_or_create(context.source_case())?;
        load_from_run_path(loader, &case, &self.ensemble, context)
    }

    /// Update the source case of `context` into its target with the
    /// built-in ensemble smoother.
    pub fn smoother_update(&mut self, context: &RunContext) -> EnsembleResult<Arc<UpdateSnapshot>> {
        self.smoother_update_with(context, &mut EnsembleSmoother::default())
    }

    /// One round of the iterative ensemble smoother.
    ///
    /// `module` carries the iteration state between rounds; pass the same
    /// instance for every round of one experiment. Only a single update
    /// step may be configured.
    pub fn iterative_smoother_update(
        &mut self,
        context: &RunContext,
        module: &mut IterativeEnsembleSmoother,
    ) -> EnsembleResult<Arc<UpdateSnapshot>> {
        let iteration = module.iteration();
        let snapshot = self.smoother_update_with(context, &mut *module)?;
        info!(iteration, next = module.iteration(), run_id = %context.run_id(), "iterative update finished");
        Ok(snapshot)
    }

    /// [`Self::smoother_update`] with a custom analysis module.
    ///
    /// Once the posterior is written the snapshot is appended to
    /// [`Self::snapshots`] under the context's run id; a failing update
    /// report or target sync is returned after that.
    pub fn smoother_update_with(
        &mut self,
        context: &RunContext,
        module: &mut dyn AnalysisModule,
    ) -> EnsembleResult<Arc<UpdateSnapshot>> {
        let target_name = context.target_case().ok_or_else(|| ValidationError::InvalidConfig {
            field: "target_case".to_string(),
            reason: "a smoother update needs a run context with a target case".to_string(),
        })?;
        let source = self.storage.open_or_create(context.source_case())?;
        let target = self.storage.open_or_create(target_name)?;

        let update = SmootherUpdate {
            source: &source,
            target: &target,
            ensemble: &self.ensemble,
            observations: &self.observations,
            steps: &self.update_steps,
            config: &self.config.analysis,
        };
        let snapshot = update.run(module, context.run_id(), &mut self.update_rng)?;
        let snapshot = self.snapshots.record(snapshot);

        if let Some(dir) = &self.config.analysis.update_log_path {
            write_update_report(dir, &snapshot)?;
        }
        target.sync()?;
        Ok(snapshot)
    }
}
