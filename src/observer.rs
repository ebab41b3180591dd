//! Data capture during experiment execution.
//!
//! The observer constructs response variables from the experiment
//! specification and observes them after a run. Variables cannot be built at
//! spec-load time because their observation windows depend on the experiment
//! start and end timestamps.

use crate::responses::ResponseVariable;
use crate::spec::Experiment;
use crate::util::time_string_to_seconds;

#[derive(Debug)]
pub struct Observer {
    experiment: Experiment,
    pub experiment_start: Option<f64>,
    pub experiment_end: Option<f64>,
    variables: Vec<ResponseVariable>,
}

impl Observer {
    pub fn new(experiment: Experiment) -> Self {
        Self {
            experiment,
            experiment_start: None,
            experiment_end: None,
            variables: Vec::new(),
        }
    }

    /// Build one response variable per spec entry, fixing the observation
    /// windows against the now-known experiment interval.
    pub fn initialize_variables(&mut self) {
        let experiment_start = self.experiment_start.unwrap_or_default();
        let experiment_end = self.experiment_end.unwrap_or_default();
        self.variables = self
            .experiment
            .responses
            .iter()
            .map(|response| {
                ResponseVariable::from_spec(
                    &response.name,
                    &response.params,
                    experiment_start,
                    experiment_end,
                )
            })
            .collect();
    }

    pub fn variables(&self) -> &[ResponseVariable] {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut [ResponseVariable] {
        &mut self.variables
    }

    /// Seconds to wait before the treatments begin.
    ///
    /// The maximum left window over all responses, read from the spec
    /// because the wait happens before the variables exist.
    pub fn time_to_wait_left(&self) -> f64 {
        self.experiment
            .responses
            .iter()
            .map(|response| time_string_to_seconds(response.params.left_window()))
            .fold(0.0, f64::max)
    }

    /// Seconds to wait after the experiment end before observing.
    ///
    /// The distance from the experiment end to the furthest window end;
    /// requires initialized variables.
    pub fn time_to_wait_right(&self) -> f64 {
        let experiment_end = self.experiment_end.unwrap_or_default();
        self.variables
            .iter()
            .map(|variable| variable.end() - experiment_end)
            .fold(0.0, f64::max)
    }

    /// Observe every variable. A per-variable failure is logged and skipped;
    /// it does not abort the run.
    pub async fn observe(&mut self) {
        for variable in &mut self.variables {
            if let Err(error) = variable.observe().await {
                tracing::info!(
                    variable = variable.name(),
                    %error,
                    "failed to capture response variable, proceeding"
                );
            }
        }
    }
}
