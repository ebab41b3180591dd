//! Experiment report generation.
//!
//! For every (treatment, response) pair of a run the reporter performs a
//! two-sided Welch's t-test comparing rows inside the treatment interval
//! against untreated rows, then assembles the results into a YAML document
//! rooted at `report.runs.<run_id>`, together with load generation totals
//! and optional resource accounting.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::accounting::ContainerExpenditure;
use crate::error::OxnError;
use crate::loadgen::RequestStatsSnapshot;
use crate::responses::{NO_TREATMENT_LABEL, ResponseData, ResponseVariable};
use crate::store::construct_key;
use crate::treatments::Treatment;
use crate::util::humanize_utc_timestamp;

const TEST_NAME: &str = "welch t-test";

/// Result of a Welch's t-test.
#[derive(Debug, Clone, Copy)]
pub struct WelchResult {
    pub statistic: f64,
    pub p_value: f64,
}

/// Two-sided Welch's t-test with NaN values omitted.
///
/// The statistic carries the sign of `mean(experiment) - mean(control)`.
/// Degenerate partitions (fewer than two finite samples on a side, or zero
/// variance on both sides) yield NaN results rather than an error, matching
/// the omit policy.
pub fn welch_ttest(experiment: &[f64], control: &[f64]) -> WelchResult {
    let experiment: Vec<f64> = experiment.iter().copied().filter(|v| v.is_finite()).collect();
    let control: Vec<f64> = control.iter().copied().filter(|v| v.is_finite()).collect();
    if experiment.len() < 2 || control.len() < 2 {
        return WelchResult {
            statistic: f64::NAN,
            p_value: f64::NAN,
        };
    }

    let (n1, n2) = (experiment.len() as f64, control.len() as f64);
    let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
    let (m1, m2) = (mean(&experiment), mean(&control));
    let variance = |values: &[f64], mean: f64| {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0)
    };
    let (v1, v2) = (variance(&experiment, m1), variance(&control, m2));

    let pooled = v1 / n1 + v2 / n2;
    if pooled == 0.0 {
        return WelchResult {
            statistic: f64::NAN,
            p_value: f64::NAN,
        };
    }
    let statistic = (m1 - m2) / pooled.sqrt();

    // Welch-Satterthwaite degrees of freedom.
    let degrees_of_freedom =
        pooled.powi(2) / ((v1 / n1).powi(2) / (n1 - 1.0) + (v2 / n2).powi(2) / (n2 - 1.0));
    let p_value = match StudentsT::new(0.0, 1.0, degrees_of_freedom) {
        Ok(distribution) => 2.0 * (1.0 - distribution.cdf(statistic.abs())),
        Err(_) => f64::NAN,
    };
    WelchResult { statistic, p_value }
}

/// Partition a response table by a treatment's label column.
///
/// Returns `(experiment, control)` value vectors: rows labeled with the
/// treatment name versus rows labeled [`NO_TREATMENT_LABEL`]. Fails when the
/// label column is absent from any row, which covers unlabeled and empty
/// tables.
pub fn partition_by_label(
    data: &ResponseData,
    label_column: &str,
) -> Result<(Vec<f64>, Vec<f64>), OxnError> {
    let mut experiment = Vec::new();
    let mut control = Vec::new();
    let mut push = |label: Option<&String>, value: f64| match label.map(String::as_str) {
        Some(NO_TREATMENT_LABEL) => {
            control.push(value);
            Ok(())
        }
        Some(_) => {
            experiment.push(value);
            Ok(())
        }
        None => Err(OxnError::validation_explained(
            "Data passed to welch ttest has wrong format",
            format!("rows are missing the label column {label_column}"),
        )),
    };
    match data {
        ResponseData::Metrics(rows) => {
            if rows.is_empty() {
                return Err(OxnError::validation_explained(
                    "Data passed to welch ttest has wrong format",
                    format!("no rows to partition by {label_column}"),
                ));
            }
            for row in rows {
                push(row.treatment_labels.get(label_column), row.value)?;
            }
        }
        ResponseData::Traces(rows) => {
            if rows.is_empty() {
                return Err(OxnError::validation_explained(
                    "Data passed to welch ttest has wrong format",
                    format!("no rows to partition by {label_column}"),
                ));
            }
            for row in rows {
                push(row.treatment_labels.get(label_column), row.duration as f64)?;
            }
        }
    }
    Ok((experiment, control))
}

#[derive(Debug, Clone, Serialize)]
struct Interaction {
    treatment_name: String,
    treatment_start: String,
    treatment_end: String,
    treatment_type: String,
    response_name: String,
    response_start: String,
    response_end: String,
    response_type: String,
    p_value: String,
    test_statistic: String,
    test_performed: String,
    store_key: String,
}

#[derive(Debug, Serialize)]
struct LoadgenSection {
    loadgen_start_time: String,
    loadgen_end_time: String,
    loadgen_total_requests: u64,
    loadgen_total_failures: u64,
    task_details: BTreeMap<String, TaskDetail>,
}

#[derive(Debug, Serialize)]
struct TaskDetail {
    url: String,
    verb: String,
    requests: u64,
    failures: u64,
    fail_ratio: f64,
    sum_response_time: f64,
    min_response_time: f64,
    max_response_time: f64,
    avg_response_time: f64,
    median_response_time: f64,
}

#[derive(Debug, Serialize)]
struct AccountingEntry {
    cpu_seconds: f64,
    number_of_cpus: u64,
}

#[derive(Debug, Default, Serialize)]
struct RunReport {
    interactions: BTreeMap<String, Interaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    loadgen: Option<LoadgenSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    accounting: Option<BTreeMap<String, AccountingEntry>>,
}

#[derive(Debug, Default, Serialize)]
struct ReportBody {
    runs: BTreeMap<String, RunReport>,
}

#[derive(Debug, Default, Serialize)]
struct ReportDocument {
    report: ReportBody,
}

/// Gathers per-pair interaction statistics and writes the report document.
pub struct Reporter {
    report_path: Option<PathBuf>,
    document: ReportDocument,
    interactions: Vec<Interaction>,
}

impl Reporter {
    pub fn new(report_path: Option<PathBuf>) -> Self {
        Self {
            report_path,
            document: ReportDocument::default(),
            interactions: Vec::new(),
        }
    }

    /// Whether a report destination was configured.
    pub fn enabled(&self) -> bool {
        self.report_path.is_some()
    }

    /// Test one (treatment, response) pair and queue the interaction for the
    /// current run.
    pub fn gather_interaction(
        &mut self,
        experiment_key: &str,
        run_key: &str,
        treatment: &dyn Treatment,
        response: &ResponseVariable,
    ) -> Result<(), OxnError> {
        let data = response.data();
        let (experiment, control) = partition_by_label(&data, treatment.name())?;
        let result = welch_ttest(&experiment, &control);

        let display_response_name = match response {
            ResponseVariable::Metric(_) => response.name().to_string(),
            ResponseVariable::Trace(_) => format!("{}.duration", response.name()),
        };
        self.interactions.push(Interaction {
            treatment_name: treatment.name().to_string(),
            treatment_start: treatment
                .start()
                .map(humanize_utc_timestamp)
                .unwrap_or_default(),
            treatment_end: treatment
                .end()
                .map(humanize_utc_timestamp)
                .unwrap_or_default(),
            treatment_type: treatment.treatment_type().to_string(),
            response_name: display_response_name,
            response_start: response.humanized_start_timestamp(),
            response_end: response.humanized_end_timestamp(),
            response_type: response.response_type().to_string(),
            p_value: result.p_value.to_string(),
            test_statistic: result.statistic.to_string(),
            test_performed: TEST_NAME.to_string(),
            store_key: construct_key(experiment_key, run_key, response.name()),
        });
        Ok(())
    }

    /// Move the queued interactions into the report entry for a run.
    pub fn assemble_interaction_data(&mut self, run_key: &str) {
        let run = self
            .document
            .report
            .runs
            .entry(run_key.to_string())
            .or_default();
        for (index, interaction) in self.interactions.drain(..).enumerate() {
            run.interactions
                .insert(format!("interaction_{index}"), interaction);
        }
    }

    /// Add the load generation section for a run.
    pub fn add_loadgen_data(&mut self, run_key: &str, stats: &RequestStatsSnapshot) {
        let task_details = stats
            .entries
            .iter()
            .map(|entry| {
                let task_id = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
                (
                    task_id,
                    TaskDetail {
                        url: entry.url.clone(),
                        verb: entry.verb.clone(),
                        requests: entry.requests,
                        failures: entry.failures,
                        fail_ratio: entry.fail_ratio,
                        sum_response_time: entry.sum_response_time,
                        min_response_time: entry.min_response_time,
                        max_response_time: entry.max_response_time,
                        avg_response_time: entry.avg_response_time,
                        median_response_time: entry.median_response_time,
                    },
                )
            })
            .collect();
        let section = LoadgenSection {
            loadgen_start_time: stats
                .start_time
                .map(humanize_utc_timestamp)
                .unwrap_or_default(),
            loadgen_end_time: stats
                .last_request_timestamp
                .map(humanize_utc_timestamp)
                .unwrap_or_default(),
            loadgen_total_requests: stats.num_requests,
            loadgen_total_failures: stats.num_failures,
            task_details,
        };
        self.document
            .report
            .runs
            .entry(run_key.to_string())
            .or_default()
            .loadgen = Some(section);
    }

    /// Add the accounting section for a run.
    pub fn add_accountant_data(
        &mut self,
        run_key: &str,
        consolidated: &std::collections::HashMap<String, ContainerExpenditure>,
    ) {
        let accounting = consolidated
            .values()
            .map(|expenditure| {
                (
                    expenditure.container_name.clone(),
                    AccountingEntry {
                        cpu_seconds: expenditure.cpu_seconds,
                        number_of_cpus: expenditure.cpu_count,
                    },
                )
            })
            .collect();
        self.document
            .report
            .runs
            .entry(run_key.to_string())
            .or_default()
            .accounting = Some(accounting);
    }

    /// Serialize the report document to its destination as YAML.
    pub fn dump_report_data(&self) -> Result<(), OxnError> {
        let Some(path) = &self.report_path else {
            return Ok(());
        };
        let contents = serde_yaml::to_string(&self.document).map_err(|e| {
            OxnError::validation_explained("Cannot serialize experiment report", e.to_string())
        })?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    #[cfg(test)]
    fn rendered(&self) -> String {
        serde_yaml::to_string(&self.document).expect("report serializes")
    }
}
