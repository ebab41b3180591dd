//! Experiment runner: deterministic sequencing of one experiment iteration.
//!
//! The runner builds the treatments in spec order (or shuffled), executes
//! the compile-time phase before the SUE exists and the runtime phase while
//! it is live, observes the response variables, and labels the observed data
//! with every treatment's interval. Multiple runs are handled by the engine;
//! a runner always represents exactly one run.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::time::{Duration, sleep};

use crate::accounting::Accountant;
use crate::error::OxnError;
use crate::observer::Observer;
use crate::spec::ExperimentSpec;
use crate::treatments::{Treatment, TreatmentRegistry};
use crate::util::{humanize_utc_timestamp, utc_timestamp};

#[derive(Debug)]
pub struct ExperimentRunner {
    id: String,
    hash: String,
    pub config_filename: String,
    pub treatments: Vec<Box<dyn Treatment>>,
    pub observer: Observer,
    pub accountant: Option<Accountant>,
    pub experiment_start: Option<f64>,
    pub experiment_end: Option<f64>,
}

impl ExperimentRunner {
    /// Build a runner for one iteration.
    ///
    /// Walks the spec's treatments in order (shuffled when `randomize` is
    /// set) and constructs each one through the registry. A treatment that
    /// fails validation aborts construction; so do two compile-time
    /// treatments mutating the same file.
    pub fn new(
        spec: &ExperimentSpec,
        config_filename: &str,
        registry: &TreatmentRegistry,
        randomize: bool,
        accountant_names: Vec<String>,
    ) -> Result<Self, OxnError> {
        let mut descriptions = spec.experiment.treatments.clone();
        if randomize {
            descriptions.shuffle(&mut rand::thread_rng());
        }

        let mut treatments = Vec::with_capacity(descriptions.len());
        for description in &descriptions {
            let treatment =
                registry.build(&description.action, &description.name, &description.params)?;
            tracing::debug!(
                name = %description.name,
                action = %description.action,
                "successfully built treatment"
            );
            treatments.push(treatment);
        }

        let mut mutated_files = HashSet::new();
        for treatment in &treatments {
            if let Some(path) = treatment.mutated_file()
                && !mutated_files.insert(path.clone())
            {
                return Err(OxnError::validation_explained(
                    format!("Error while building treatment {}", treatment.name()),
                    format!(
                        "File {} is already mutated by another treatment in this run",
                        path.display()
                    ),
                ));
            }
        }

        let accountant = if accountant_names.is_empty() {
            None
        } else {
            Some(Accountant::new(accountant_names)?)
        };

        Ok(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            hash: hash_filename(config_filename),
            config_filename: config_filename.to_string(),
            treatments,
            observer: Observer::new(spec.experiment.clone()),
            accountant,
            experiment_start: None,
            experiment_end: None,
        })
    }

    /// Truncated run id identifying this iteration.
    pub fn short_id(&self) -> &str {
        &self.id[..8]
    }

    /// Truncated hash identifying the experiment specification.
    pub fn short_hash(&self) -> &str {
        &self.hash[..8]
    }

    pub fn humanize_start_timestamp(&self) -> String {
        self.experiment_start
            .map(humanize_utc_timestamp)
            .unwrap_or_default()
    }

    pub fn humanize_end_timestamp(&self) -> String {
        self.experiment_end
            .map(humanize_utc_timestamp)
            .unwrap_or_default()
    }

    /// Inject every compile-time treatment, recording `start`. Failures
    /// abort the run; the engine's cleanup chain restores mutated files.
    pub async fn execute_compile_time_treatments(&mut self) -> Result<(), OxnError> {
        tracing::info!("starting compile time treatments");
        for treatment in compile_time(&mut self.treatments) {
            treatment.set_start(utc_timestamp());
            treatment.inject().await?;
        }
        Ok(())
    }

    /// Record `end` on compile-time treatments once the runtime phase has
    /// finished, so labeling sees their full interval. File restoration is
    /// deferred to [`Self::clean_compile_time_treatments`] after teardown.
    pub fn finalize_compile_time_treatments(&mut self) {
        for treatment in compile_time(&mut self.treatments) {
            if treatment.end().is_none() {
                treatment.set_end(utc_timestamp());
            }
        }
    }

    /// Restore everything the compile-time treatments mutated. Runs on
    /// every exit path, including errors, after teardown; failures are
    /// logged so the remaining treatments still get cleaned.
    pub async fn clean_compile_time_treatments(&mut self) {
        tracing::info!("cleaning compile time treatments");
        for treatment in compile_time(&mut self.treatments) {
            if treatment.start().is_none() {
                // Never injected, nothing to restore.
                continue;
            }
            if treatment.end().is_none() {
                treatment.set_end(utc_timestamp());
            }
            if let Err(error) = treatment.clean().await {
                tracing::error!(
                    treatment = treatment.name(),
                    %error,
                    "failed to clean compile time treatment"
                );
            }
        }
    }

    /// Execute the runtime phase: wait out the left observation window,
    /// then run each runtime treatment in order, non-overlapping, with
    /// `inject`, `clean`, and the interval recording per treatment.
    ///
    /// An inject failure is logged and the run continues; `clean` still
    /// runs so the container state is restored as far as possible.
    pub async fn execute_runtime_treatments(&mut self) -> Result<(), OxnError> {
        if let Some(accountant) = &mut self.accountant {
            accountant.read_all_containers().await?;
        }
        let time_to_wait_left = self.observer.time_to_wait_left();
        tracing::info!(seconds = time_to_wait_left, "sleeping for left window");
        sleep(Duration::from_secs_f64(time_to_wait_left)).await;

        tracing::info!("starting runtime treatments");
        for treatment in runtime(&mut self.treatments) {
            treatment.set_start(utc_timestamp());
            if let Err(error) = treatment.inject().await {
                tracing::error!(
                    treatment = treatment.name(),
                    %error,
                    "failed to inject treatment, continuing the run"
                );
            }
            if let Err(error) = treatment.clean().await {
                tracing::error!(
                    treatment = treatment.name(),
                    %error,
                    "failed to clean treatment, container state might be polluted"
                );
            }
            treatment.set_end(utc_timestamp());
        }
        tracing::info!("injected treatments");
        Ok(())
    }

    /// Observe the response variables after the runtime phase: build the
    /// variables against the now-known experiment interval, wait out the
    /// right observation window, fetch, and label.
    pub async fn observe_response_variables(&mut self) -> Result<(), OxnError> {
        self.observer.initialize_variables();
        let time_to_wait_right = self.observer.time_to_wait_right();
        tracing::info!(seconds = time_to_wait_right, "sleeping for right window");
        sleep(Duration::from_secs_f64(time_to_wait_right)).await;
        self.observer.observe().await;
        tracing::info!("observed response variables");
        self.label();
        if let Some(accountant) = &mut self.accountant {
            accountant.read_all_containers().await?;
            accountant.consolidate();
        }
        Ok(())
    }

    /// Add one label column per treatment to every observed variable.
    fn label(&mut self) {
        for treatment in &self.treatments {
            let (Some(start), Some(end)) = (treatment.start(), treatment.end()) else {
                tracing::warn!(
                    treatment = treatment.name(),
                    "treatment has no interval, skipping labeling"
                );
                continue;
            };
            for variable in self.observer.variables_mut() {
                variable.label(start, end, treatment.name(), treatment.name());
            }
        }
    }
}

fn compile_time(
    treatments: &mut [Box<dyn Treatment>],
) -> impl Iterator<Item = &mut Box<dyn Treatment>> {
    treatments
        .iter_mut()
        .filter(|treatment| !treatment.is_runtime())
}

fn runtime(
    treatments: &mut [Box<dyn Treatment>],
) -> impl Iterator<Item = &mut Box<dyn Treatment>> {
    treatments
        .iter_mut()
        .filter(|treatment| treatment.is_runtime())
}

fn hash_filename(config_filename: &str) -> String {
    let digest = Sha256::digest(config_filename.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
