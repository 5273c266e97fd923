//! Tracks which expected resources this invocation has reported fulfilled.

use indexmap::IndexMap;
use serde_json::Value;
use stagehand_types::task::TaskConfig;

use crate::executor::TaskError;
use crate::log::TaskLog;

#[derive(Debug, Clone)]
struct Expectation {
    resource: Value,
    expected_by: Option<Value>,
    fulfilled: bool,
}

/// Owned by a single running task; no synchronization.
#[derive(Debug, Clone, Default)]
pub struct ExpectationTracker {
    expectations: IndexMap<String, Expectation>,
}

impl ExpectationTracker {
    pub fn from_config(config: &TaskConfig) -> Self {
        let expectations = config
            .expectations
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    Expectation {
                        resource: spec.expected_resource.clone(),
                        expected_by: spec.expected_by.clone(),
                        fulfilled: false,
                    },
                )
            })
            .collect();
        Self { expectations }
    }

    pub fn is_empty(&self) -> bool {
        self.expectations.is_empty()
    }

    /// Mark every expectation structurally equal to any of `resources`.
    /// Returns the names newly fulfilled.
    pub fn mark_fulfilled(&mut self, resources: &[Value]) -> Vec<String> {
        let mut newly = Vec::new();
        for (name, expectation) in &mut self.expectations {
            if !expectation.fulfilled && resources.contains(&expectation.resource) {
                expectation.fulfilled = true;
                newly.push(name.clone());
            }
        }
        newly
    }

    /// Names still outstanding, in declaration order.
    pub fn unfulfilled(&self) -> Vec<String> {
        self.expectations
            .iter()
            .filter(|(_, e)| !e.fulfilled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The invocation that registered `name`, if it said so.
    pub fn expected_by(&self, name: &str) -> Option<&Value> {
        self.expectations.get(name)?.expected_by.as_ref()
    }

    /// Fail if anything is outstanding and `error_on_unfulfilled` is set.
    /// Either way each outstanding expectation is logged with the invocation
    /// that registered it.
    pub fn check_complete(&self, error_on_unfulfilled: bool, log: &TaskLog) -> Result<(), TaskError> {
        let names = self.unfulfilled();
        if names.is_empty() {
            return Ok(());
        }
        for name in &names {
            let expected_by = self.expected_by(name).cloned().unwrap_or(Value::Null);
            if error_on_unfulfilled {
                tracing::error!(parent: log.span(), expectation = name.as_str(), expected_by = %expected_by, "expectation unfulfilled");
            } else {
                tracing::warn!(parent: log.span(), expectation = name.as_str(), expected_by = %expected_by, "expectation unfulfilled");
            }
        }
        if error_on_unfulfilled {
            return Err(TaskError::UnfulfilledExpectations { names });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> TaskLog {
        TaskLog::detached(false)
    }

    fn tracker(expectations: Value) -> ExpectationTracker {
        let config: TaskConfig =
            serde_json::from_value(json!({ "expectations": expectations })).unwrap();
        ExpectationTracker::from_config(&config)
    }

    #[test]
    fn test_structural_equality() {
        let mut t = tracker(json!({ "out": { "expectedResource": { "bucket": "foo", "key": "bar" } } }));
        // Key order does not matter.
        let newly = t.mark_fulfilled(&[json!({ "key": "bar", "bucket": "foo" })]);
        assert_eq!(newly, vec!["out"]);
        assert!(t.check_complete(true, &log()).is_ok());
    }

    #[test]
    fn test_mismatch_stays_unfulfilled() {
        let mut t = tracker(json!({ "out": { "expectedResource": { "bucket": "foo", "key": "bar" } } }));
        t.mark_fulfilled(&[json!({ "bucket": "fro", "key": "bar" })]);
        assert_eq!(t.unfulfilled(), vec!["out"]);
        match t.check_complete(true, &log()) {
            Err(TaskError::UnfulfilledExpectations { names }) => assert_eq!(names, vec!["out"]),
            other => panic!("expected unfulfilled error, got {other:?}"),
        }
        assert!(t.check_complete(false, &log()).is_ok());
    }

    #[test]
    fn test_one_resource_fulfills_many() {
        let mut t = tracker(json!({
            "a": { "expectedResource": "same" },
            "b": { "expectedResource": "same" },
            "c": { "expectedResource": "other" }
        }));
        assert_eq!(t.mark_fulfilled(&[json!("same")]), vec!["a", "b"]);
        assert!(t.mark_fulfilled(&[json!("same")]).is_empty());
        assert_eq!(t.unfulfilled(), vec!["c"]);
    }

    #[test]
    fn test_expected_by_kept_from_config() {
        let t = tracker(json!({
            "out": {
                "expectedResource": "r",
                "expectedBy": { "functionName": "upstream", "invocationId": "i-1" }
            },
            "bare": { "expectedResource": "s" }
        }));
        assert_eq!(t.expected_by("out").unwrap()["functionName"], json!("upstream"));
        assert!(t.expected_by("bare").is_none());
        assert!(t.expected_by("missing").is_none());
    }

    #[test]
    fn test_no_expectations_is_complete() {
        let t = ExpectationTracker::default();
        assert!(t.is_empty());
        assert!(t.check_complete(true, &log()).is_ok());
    }
}
