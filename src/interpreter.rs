//! Workflow interpreter — named interface. Its own semantics (what each
//! recorded step does) are explicitly out of scope for redesign; this
//! module exists only so the execution worker has a real collaborator to
//! drive through a `Robot`'s `Workflow` against a `BrowserDriver` session.

use crate::browser_driver::BrowserDriver;
use crate::db::Workflow;
use crate::object_store::ObjectStore;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InterpretError {
    #[error("driver error: {0}")]
    Driver(#[from] crate::browser_driver::DriverError),
    #[error("object store error: {0}")]
    ObjectStore(#[from] crate::object_store::ObjectStoreError),
    #[error("step failed: {0}")]
    StepFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub log: String,
    pub serializable_output: Option<Value>,
    pub binary_output_uri: Option<String>,
}

/// Unlike a bare `Result`, a failed interpretation still carries whatever
/// `RunOutput` had been accumulated up to the failing step — the execution
/// worker needs that partial data to decide whether §4.4 step 7's
/// partial-failure integration push applies.
pub enum InterpretOutcome {
    Success(RunOutput),
    Failed {
        error: InterpretError,
        partial: RunOutput,
    },
}

#[async_trait]
pub trait WorkflowInterpreter: Send + Sync {
    async fn interpret(&self, run_id: &str, browser_id: &str, workflow: &Workflow) -> InterpretOutcome;
}

/// Walks each `{where, what}` pair in order, dispatching `navigate` actions
/// to the driver and accumulating `scrape`/`screenshot` actions into the
/// run's output. Everything else is logged and skipped — the interpreter's
/// action vocabulary itself is out of scope.
pub struct ReferenceInterpreter {
    driver: Arc<dyn BrowserDriver>,
    object_store: Arc<dyn ObjectStore>,
}

impl ReferenceInterpreter {
    pub fn new(driver: Arc<dyn BrowserDriver>, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            driver,
            object_store,
        }
    }
}

#[async_trait]
impl WorkflowInterpreter for ReferenceInterpreter {
    async fn interpret(&self, run_id: &str, browser_id: &str, workflow: &Workflow) -> InterpretOutcome {
        let mut log = String::new();
        let mut scraped = Vec::new();
        let mut binary_output_uri = None;

        for (step_index, step) in workflow.steps.iter().enumerate() {
            for action in &step.actions {
                let action_type = action.get("action").and_then(Value::as_str).unwrap_or("");
                match action_type {
                    "navigate" => {
                        if let Some(url) = action.get("url").and_then(Value::as_str) {
                            if let Err(error) = self.driver.goto(browser_id, url).await {
                                return InterpretOutcome::Failed {
                                    error: error.into(),
                                    partial: RunOutput {
                                        log,
                                        serializable_output: as_serializable(&scraped),
                                        binary_output_uri,
                                    },
                                };
                            }
                            log.push_str(&format!("step {step_index}: navigated to {url}\n"));
                        }
                    }
                    "scrape" => {
                        scraped.push(action.clone());
                        log.push_str(&format!("step {step_index}: scraped\n"));
                    }
                    "screenshot" => {
                        let bytes = match self.driver.screenshot(browser_id).await {
                            Ok(bytes) => bytes,
                            Err(error) => {
                                return InterpretOutcome::Failed {
                                    error: error.into(),
                                    partial: RunOutput {
                                        log,
                                        serializable_output: as_serializable(&scraped),
                                        binary_output_uri,
                                    },
                                }
                            }
                        };
                        let uri = match self
                            .object_store
                            .put(run_id, &format!("step-{step_index}.png"), bytes)
                            .await
                        {
                            Ok(uri) => uri,
                            Err(error) => {
                                return InterpretOutcome::Failed {
                                    error: error.into(),
                                    partial: RunOutput {
                                        log,
                                        serializable_output: as_serializable(&scraped),
                                        binary_output_uri,
                                    },
                                }
                            }
                        };
                        binary_output_uri = Some(uri);
                        log.push_str(&format!("step {step_index}: captured screenshot\n"));
                    }
                    other => {
                        log.push_str(&format!("step {step_index}: skipped unsupported action `{other}`\n"));
                    }
                }
            }
        }

        InterpretOutcome::Success(RunOutput {
            log,
            serializable_output: as_serializable(&scraped),
            binary_output_uri,
        })
    }
}

fn as_serializable(scraped: &[Value]) -> Option<Value> {
    if scraped.is_empty() {
        None
    } else {
        Some(Value::Array(scraped.to_vec()))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeInterpreter {
        pub calls: Mutex<Vec<String>>,
        pub fail: Mutex<bool>,
        /// When failing, whether the accumulated output should look like a
        /// partial scrape (exercises the §4.4 step 7 push-on-partial-data
        /// path) or come back empty.
        pub fail_with_partial_data: Mutex<bool>,
    }

    impl FakeInterpreter {
        pub fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        pub fn set_fail_with_partial_data(&self, partial: bool) {
            *self.fail_with_partial_data.lock().unwrap() = partial;
        }
    }

    #[async_trait]
    impl WorkflowInterpreter for FakeInterpreter {
        async fn interpret(&self, run_id: &str, _browser_id: &str, _workflow: &Workflow) -> InterpretOutcome {
            self.calls.lock().unwrap().push(run_id.to_string());
            if *self.fail.lock().unwrap() {
                let partial = if *self.fail_with_partial_data.lock().unwrap() {
                    RunOutput {
                        log: "partial".to_string(),
                        serializable_output: Some(serde_json::json!([{"scraped": true}])),
                        binary_output_uri: None,
                    }
                } else {
                    RunOutput::default()
                };
                return InterpretOutcome::Failed {
                    error: InterpretError::StepFailed("forced failure".to_string()),
                    partial,
                };
            }
            InterpretOutcome::Success(RunOutput {
                log: "ok".to_string(),
                serializable_output: Some(serde_json::json!([{"scraped": true}])),
                binary_output_uri: None,
            })
        }
    }
}
