//! Runner error types.

use cascade_bus::BusError;
use cascade_dsl::DslError;
use thiserror::Error;

/// Errors that can occur while running sequences.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Bus operation failed
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Rule evaluation failed
    #[error(transparent)]
    Rules(#[from] DslError),

    /// A call's task type could not be split into app and handler
    #[error("Unable to parse app and handler from call '{call}': task type '{task_type}' has no '_' separator")]
    MalformedTaskType { call: String, task_type: String },

    /// A dispatch task could not be joined
    #[error("Dispatch task failed: {0}")]
    Join(String),

    /// One or more calls of an `on` block failed
    #[error("On '{on}' failed: {}", join_errors(.errors))]
    OnFailed { on: String, errors: Vec<RunnerError> },

    /// One or more `on` blocks of a sequence failed
    #[error("{}", join_errors(.0))]
    Sequence(Vec<RunnerError>),
}

fn join_errors(errors: &[RunnerError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregated_errors_list_every_failure() {
        let err = RunnerError::OnFailed {
            on: "push0".to_string(),
            errors: vec![
                RunnerError::MalformedTaskType {
                    call: "first".to_string(),
                    task_type: "broken".to_string(),
                },
                RunnerError::Join("cancelled".to_string()),
            ],
        };

        let text = err.to_string();
        assert!(text.contains("push0"));
        assert!(text.contains("first"));
        assert!(text.contains("cancelled"));
    }
}
