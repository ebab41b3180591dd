//! Empty treatment: a plain observation of the response variables.

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::{Duration, sleep};

use crate::error::OxnError;
use crate::treatments::{
    ParamKind, ParamValidator, Treatment, TreatmentCore, invalid_config,
};
use crate::util::time_string_to_seconds;

/// Sleeps for `duration` in `inject`; cleanup is a no-op.
#[derive(Debug)]
pub struct EmptyTreatment {
    core: TreatmentCore,
    duration_seconds: f64,
}

impl EmptyTreatment {
    pub fn new(name: &str, params: &Value) -> Result<Self, OxnError> {
        let core = TreatmentCore::new(name, params);
        let mut validator = ParamValidator::new(&core.config, "EmptyTreatment");
        validator.require("duration", ParamKind::Str).duration("duration");
        let messages = validator.finish();
        if !messages.is_empty() {
            return Err(invalid_config("EmptyTreatment", name, messages));
        }
        let duration_seconds = core
            .config
            .get("duration")
            .and_then(Value::as_str)
            .map(time_string_to_seconds)
            .unwrap_or_default();
        Ok(Self {
            core,
            duration_seconds,
        })
    }
}

#[async_trait]
impl Treatment for EmptyTreatment {
    fn core(&self) -> &TreatmentCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut TreatmentCore {
        &mut self.core
    }

    fn action(&self) -> &'static str {
        "empty"
    }

    fn treatment_type(&self) -> &'static str {
        "EmptyTreatment"
    }

    fn is_runtime(&self) -> bool {
        true
    }

    async fn preconditions(&mut self) -> bool {
        true
    }

    async fn inject(&mut self) -> Result<(), OxnError> {
        sleep(Duration::from_secs_f64(self.duration_seconds)).await;
        Ok(())
    }

    async fn clean(&mut self) -> Result<(), OxnError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requires_a_duration() {
        let err = EmptyTreatment::new("observe", &json!({})).expect_err("must fail");
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn rejects_unitless_durations() {
        let err = EmptyTreatment::new("observe", &json!({ "duration": "90" }))
            .expect_err("must fail");
        assert!(err.to_string().contains("duration"));
    }

    #[test]
    fn transforms_duration_to_seconds() {
        let treatment =
            EmptyTreatment::new("observe", &json!({ "duration": "1m30s" })).expect("builds");
        assert_eq!(treatment.duration_seconds, 90.0);
        assert!(treatment.is_runtime());
    }
}
