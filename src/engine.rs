//! Observability experiments engine.
//!
//! The engine encapsulates everything needed to execute an experiment: it
//! loads and validates the specification, then drives N iterations of the
//! run lifecycle (compile-time treatments, SUE bring-up, readiness,
//! precondition checks, load generation, runtime treatments, observation,
//! persistence, reporting, teardown) with a best-effort cleanup chain on
//! every failure path.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OrchestrationError, OxnError};
use crate::loadgen::LoadGenerator;
use crate::orchestrator::DockerComposeOrchestrator;
use crate::report::Reporter;
use crate::runner::ExperimentRunner;
use crate::spec::ExperimentSpec;
use crate::store::Store;
use crate::treatments::{TreatmentConstructor, TreatmentRegistry};
use crate::util::utc_timestamp;

pub struct Engine {
    config_path: PathBuf,
    raw_spec: Option<serde_yaml::Value>,
    spec: Option<ExperimentSpec>,
    reporter: Reporter,
    registry: TreatmentRegistry,
    store_directory: PathBuf,
}

impl Engine {
    pub fn new(config_path: impl Into<PathBuf>, report_path: Option<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            raw_spec: None,
            spec: None,
            reporter: Reporter::new(report_path),
            registry: TreatmentRegistry::builtin(),
            store_directory: PathBuf::from("."),
        }
    }

    /// Override the directory holding the store and trie files.
    pub fn with_store_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.store_directory = directory.into();
        self
    }

    /// Register a user-supplied treatment constructor before the run.
    pub fn register_treatment(&mut self, action: &str, constructor: TreatmentConstructor) {
        self.registry.register(action, constructor);
    }

    /// Read the experiment specification file and confirm it is valid YAML.
    pub fn read_experiment_specification(&mut self) -> Result<(), OxnError> {
        let contents = std::fs::read_to_string(&self.config_path)?;
        self.raw_spec = Some(ExperimentSpec::read_yaml(&contents)?);
        Ok(())
    }

    /// Validate the specification syntactically.
    pub fn validate_syntax(&mut self) -> Result<(), OxnError> {
        let document = self.raw_spec.clone().ok_or_else(|| {
            OxnError::validation_explained(
                "Can't validate experiment spec",
                "specification has not been read",
            )
        })?;
        self.spec = Some(ExperimentSpec::from_yaml_value(document)?);
        Ok(())
    }

    fn spec(&self) -> Result<&ExperimentSpec, OxnError> {
        self.spec.as_ref().ok_or_else(|| {
            OxnError::validation_explained(
                "Can't validate experiment spec",
                "specification has not been validated",
            )
        })
    }

    fn config_filename(&self) -> String {
        self.config_path.display().to_string()
    }

    /// Run the experiment `runs` times.
    ///
    /// A keyboard interrupt triggers best-effort teardown: load generation
    /// is killed, the SUE torn down, compile-time mutations restored, and
    /// data accumulated so far stays on disk.
    pub async fn run(
        &mut self,
        runs: u32,
        orchestration_timeout: Duration,
        randomize: bool,
        accounting: bool,
    ) -> Result<(), OxnError> {
        tracing::info!(
            spec = %self.config_filename(),
            runs,
            "running experiment"
        );
        let spec = self.spec()?.clone();
        let config_filename = self.config_filename();

        for index in 0..runs {
            tracing::info!(run = index + 1, of = runs, "experiment run");
            let orchestrator = DockerComposeOrchestrator::new(&spec).await?;
            let mut generator = LoadGenerator::new(&spec.experiment.loadgen)?;
            let accountant_names: Vec<String> = if accounting {
                orchestrator
                    .translate_compose_names(orchestrator.sue_service_names())
                    .into_iter()
                    .flatten()
                    .collect()
            } else {
                Vec::new()
            };
            let mut runner = ExperimentRunner::new(
                &spec,
                &config_filename,
                &self.registry,
                randomize,
                accountant_names,
            )?;

            // The select ends every borrow held by the iteration future
            // before the cleanup chain touches the same components.
            let outcome: Result<bool, OxnError> = tokio::select! {
                result = Self::run_iteration(
                    &mut self.reporter,
                    &self.store_directory,
                    &orchestrator,
                    &mut generator,
                    &mut runner,
                    orchestration_timeout,
                    accounting,
                ) => result.map(|()| false),
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("trying to shut down gracefully, press ctrl-c to force");
                    Ok(true)
                }
            };
            match outcome {
                Ok(false) => {
                    tracing::info!(run = index + 1, of = runs, "experiment run completed");
                }
                Ok(true) => {
                    Self::emergency_cleanup(&orchestrator, &mut generator, &mut runner).await;
                    break;
                }
                Err(error) => {
                    Self::emergency_cleanup(&orchestrator, &mut generator, &mut runner).await;
                    return Err(error);
                }
            }
        }

        if self.reporter.enabled() {
            self.reporter.dump_report_data()?;
            tracing::debug!("wrote report data to file");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_iteration(
        reporter: &mut Reporter,
        store_directory: &PathBuf,
        orchestrator: &DockerComposeOrchestrator,
        generator: &mut LoadGenerator,
        runner: &mut ExperimentRunner,
        orchestration_timeout: Duration,
        accounting: bool,
    ) -> Result<(), OxnError> {
        runner.execute_compile_time_treatments().await?;
        orchestrator.orchestrate().await?;
        if !orchestrator.ready(orchestration_timeout).await? {
            return Err(OrchestrationError::Timeout {
                timeout: orchestration_timeout,
            }
            .into());
        }
        tracing::info!("started sue");

        for treatment in &mut runner.treatments {
            if !treatment.preconditions().await {
                return Err(OxnError::validation(
                    format!(
                        "Error while checking preconditions for treatment {}",
                        treatment.name()
                    ),
                    treatment.messages(),
                ));
            }
        }

        generator.start()?;
        tracing::info!("started load generation");

        let experiment_start = utc_timestamp();
        runner.experiment_start = Some(experiment_start);
        runner.observer.experiment_start = Some(experiment_start);
        runner.execute_runtime_treatments().await?;
        runner.finalize_compile_time_treatments();
        let experiment_end = utc_timestamp();
        runner.experiment_end = Some(experiment_end);
        runner.observer.experiment_end = Some(experiment_end);

        runner.observe_response_variables().await?;

        // Join the self-quit load generator before assembling the report so
        // the loadgen section sees final request counts.
        generator.stop().await?;
        tracing::info!("stopped load generation");

        let mut store = Store::open(store_directory)?;
        let run_key = runner.short_id().to_string();
        for variable in runner.observer.variables() {
            let data = variable.data();
            store.write(&data, &runner.config_filename, &run_key, variable.name())?;
            tracing::debug!(
                variable = variable.name(),
                rows = data.len(),
                "wrote response variable to store"
            );
            if reporter.enabled() {
                for treatment in &runner.treatments {
                    if let Err(error) = reporter.gather_interaction(
                        &runner.config_filename,
                        &run_key,
                        treatment.as_ref(),
                        variable,
                    ) {
                        tracing::error!(
                            treatment = treatment.name(),
                            variable = variable.name(),
                            %error,
                            "failed to gather interaction data"
                        );
                    }
                }
            }
        }
        if reporter.enabled() {
            reporter.assemble_interaction_data(&run_key);
            reporter.add_loadgen_data(&run_key, &generator.stats().snapshot());
            if accounting && let Some(accountant) = &runner.accountant {
                reporter.add_accountant_data(&run_key, accountant.consolidated_data());
            }
        }

        orchestrator.teardown().await?;
        tracing::info!("stopped sue");
        // Compile-time cleanup is deferred to after teardown so restored
        // config files never reach a live SUE.
        runner.clean_compile_time_treatments().await;
        Ok(())
    }

    /// Best-effort cleanup chain for error and interrupt paths.
    async fn emergency_cleanup(
        orchestrator: &DockerComposeOrchestrator,
        generator: &mut LoadGenerator,
        runner: &mut ExperimentRunner,
    ) {
        if generator.is_running() {
            generator.kill();
            tracing::info!("shut down load generation");
        }
        if let Err(error) = orchestrator.teardown().await {
            tracing::error!(%error, "failed to tear down the sue");
        } else {
            tracing::info!("shut down sue");
        }
        runner.clean_compile_time_treatments().await;
    }
}
