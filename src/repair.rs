//! Generate → execute → repair cycle for numerical questions.

use crate::datam::Usage;
use crate::error::CoreError;
use crate::executor::{ExecutionResult, SqlExecutor};
use crate::keys::ApiKeyPool;
use crate::schema::SchemaDescriptor;
use crate::sqlgen::{GeneratedQuery, SqlGenerator};

use log::{debug, info, warn};
use serde::Serialize;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepairState {
    Generate,
    Execute,
    Repair,
    Success,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairEvent {
    /// A statement came back from the first generation.
    Generated,
    /// A corrected statement came back from a repair prompt.
    Repaired,
    ExecutionSucceeded,
    /// `attempts` executions have now failed out of `max_attempts` allowed.
    ExecutionFailed { attempts: u32, max_attempts: u32 },
}

/// The transition table. `None` means the event is not legal in `state`.
pub fn transition(state: RepairState, event: RepairEvent) -> Option<RepairState> {
    use RepairEvent::*;
    use RepairState::*;
    match (state, event) {
        (Generate, Generated) => Some(Execute),
        (Repair, Repaired) => Some(Execute),
        (Execute, ExecutionSucceeded) => Some(Success),
        (Execute, ExecutionFailed { attempts, max_attempts }) if attempts < max_attempts => {
            Some(Repair)
        }
        (Execute, ExecutionFailed { .. }) => Some(Exhausted),
        _ => None,
    }
}

fn advance(from: RepairState, event: RepairEvent) -> Result<RepairState, CoreError> {
    transition(from, event).ok_or(CoreError::InvalidTransition { from, event })
}

/// One execution attempt, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub sql: String,
    pub error_message: Option<String>,
}

/// How a run ended. `result` is the last execution, error intact when exhausted.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub terminal: RepairState,
    pub result: ExecutionResult,
    pub query: GeneratedQuery,
    pub attempts: u32,
    pub history: Vec<AttemptRecord>,
    pub usage: Usage,
}

impl RepairOutcome {
    /// The successful result, or `SqlExecution` carrying the last database error.
    pub fn into_result(self) -> Result<ExecutionResult, CoreError> {
        match self.terminal {
            RepairState::Success => Ok(self.result),
            _ => Err(CoreError::SqlExecution {
                message: self.result.error_message.unwrap_or_default(),
                attempts: self.attempts,
            }),
        }
    }
}

enum Stage {
    Generate,
    Execute {
        query: GeneratedQuery,
        sql: String,
    },
    Repair {
        sql: String,
        failure: ExecutionResult,
    },
    Done {
        terminal: RepairState,
        query: GeneratedQuery,
        result: ExecutionResult,
    },
}

impl Stage {
    fn state(&self) -> RepairState {
        match self {
            Stage::Generate => RepairState::Generate,
            Stage::Execute { .. } => RepairState::Execute,
            Stage::Repair { .. } => RepairState::Repair,
            Stage::Done { terminal, .. } => *terminal,
        }
    }
}

/// Drives one question through at most `max_attempts` executions.
pub struct RepairLoop<'a> {
    generator: &'a SqlGenerator,
    executor: &'a SqlExecutor,
    keys: &'a ApiKeyPool,
    max_attempts: u32,
}

impl<'a> RepairLoop<'a> {
    pub fn new(
        generator: &'a SqlGenerator,
        executor: &'a SqlExecutor,
        keys: &'a ApiKeyPool,
        max_attempts: u32,
    ) -> Self {
        Self {
            generator,
            executor,
            keys,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs to `Success` or `Exhausted`.
    ///
    /// Errors are reserved for failures outside the database: the LLM being
    /// unavailable or rate limited, or a completion with no SQL in it.
    pub fn run(&self, question: &str, schema: &SchemaDescriptor) -> Result<RepairOutcome, CoreError> {
        self.run_metered(question, schema, &mut Usage::default())
    }

    /// Like `run`, adding the tokens of every completion to `usage` as they arrive,
    /// so callers can bill a run that ends in an error.
    pub fn run_metered(
        &self,
        question: &str,
        schema: &SchemaDescriptor,
        usage: &mut Usage,
    ) -> Result<RepairOutcome, CoreError> {
        let mut stage = Stage::Generate;
        let mut attempts = 0u32;
        let mut history = Vec::new();

        loop {
            let from = stage.state();
            stage = match stage {
                Stage::Generate => {
                    let query = self.generator.generate(question, schema, self.keys.next_key())?;
                    let sql = take_sql(&query, usage)?;
                    advance(from, RepairEvent::Generated)?;
                    Stage::Execute { query, sql }
                }
                Stage::Repair { sql, failure } => {
                    let db_error = failure.error_message.unwrap_or_default();
                    info!("Retrying query due to database error: {}", db_error);
                    let query = self.generator.repair(
                        &sql,
                        &db_error,
                        schema,
                        self.keys.next_key(),
                        attempts + 1,
                    )?;
                    let sql = take_sql(&query, usage)?;
                    advance(from, RepairEvent::Repaired)?;
                    Stage::Execute { query, sql }
                }
                Stage::Execute { query, sql } => {
                    attempts += 1;
                    let result = self.executor.execute(&sql);
                    history.push(AttemptRecord {
                        attempt: attempts,
                        sql: sql.clone(),
                        error_message: result.error_message.clone(),
                    });
                    let event = if result.is_success() {
                        RepairEvent::ExecutionSucceeded
                    } else {
                        RepairEvent::ExecutionFailed {
                            attempts,
                            max_attempts: self.max_attempts,
                        }
                    };
                    match advance(from, event)? {
                        RepairState::Repair => Stage::Repair {
                            sql,
                            failure: result,
                        },
                        terminal => Stage::Done {
                            terminal,
                            query,
                            result,
                        },
                    }
                }
                Stage::Done {
                    terminal,
                    query,
                    result,
                } => {
                    if terminal == RepairState::Exhausted {
                        warn!("Query still failing after {} attempts", attempts);
                    } else {
                        debug!("Query succeeded on attempt {}", attempts);
                    }
                    return Ok(RepairOutcome {
                        terminal,
                        result,
                        query,
                        attempts,
                        history,
                        usage: usage.clone(),
                    });
                }
            };
        }
    }
}

fn take_sql(query: &GeneratedQuery, usage: &mut Usage) -> Result<String, CoreError> {
    if let Some(call_usage) = &query.usage {
        *usage += call_usage.clone();
    }
    match &query.sql {
        Some(sql) => {
            debug!("Generated SQL (attempt {}): {}", query.attempt_number, sql);
            Ok(sql.clone())
        }
        None => {
            warn!("Failed to extract SQL query from LLM response: {}", query.notes);
            Err(CoreError::SqlParseFailure {
                notes: query.notes.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_branches_on_attempt_count() {
        let failed = |attempts| RepairEvent::ExecutionFailed {
            attempts,
            max_attempts: 4,
        };
        assert_eq!(transition(RepairState::Execute, failed(1)), Some(RepairState::Repair));
        assert_eq!(transition(RepairState::Execute, failed(3)), Some(RepairState::Repair));
        assert_eq!(transition(RepairState::Execute, failed(4)), Some(RepairState::Exhausted));
        assert_eq!(
            transition(RepairState::Execute, RepairEvent::ExecutionSucceeded),
            Some(RepairState::Success)
        );
    }

    #[test]
    fn generation_and_repair_always_lead_to_execute() {
        assert_eq!(
            transition(RepairState::Generate, RepairEvent::Generated),
            Some(RepairState::Execute)
        );
        assert_eq!(
            transition(RepairState::Repair, RepairEvent::Repaired),
            Some(RepairState::Execute)
        );
    }

    #[test]
    fn usage_is_counted_even_without_sql() {
        let mut usage = Usage {
            prompt_tokens: 50,
            completion_tokens: 5,
            total_tokens: 55,
            cost: None,
        };
        let query = GeneratedQuery {
            sql: None,
            notes: "no matching table".to_string(),
            source_model: "llama-3.1-8b-instant".to_string(),
            attempt_number: 1,
            usage: Some(Usage {
                prompt_tokens: 100,
                completion_tokens: 20,
                total_tokens: 120,
                cost: None,
            }),
        };
        assert!(matches!(
            take_sql(&query, &mut usage),
            Err(CoreError::SqlParseFailure { .. })
        ));
        assert_eq!(usage.total_tokens, 175);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [RepairState::Success, RepairState::Exhausted] {
            assert_eq!(transition(state, RepairEvent::Generated), None);
            assert_eq!(transition(state, RepairEvent::ExecutionSucceeded), None);
        }
        assert_eq!(transition(RepairState::Generate, RepairEvent::ExecutionSucceeded), None);
        assert!(matches!(
            advance(RepairState::Success, RepairEvent::Repaired),
            Err(CoreError::InvalidTransition { .. })
        ));
    }
}
