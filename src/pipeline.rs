//! The hybrid question-answering entry point.

use crate::answer::{ContextualAnswer, ContextualAnswerer, SourceRef};
use crate::classifier::Classification;
use crate::config::Settings;
use crate::datam::Usage;
use crate::error::{CoreError, ErrorKind};
use crate::executor::{ExecutionResult, SqlExecutor, SqliteConnector};
use crate::keys::ApiKeyPool;
use crate::orchestra::Orchestra;
use crate::registry::ModelRegistry;
use crate::repair::{RepairLoop, DEFAULT_MAX_ATTEMPTS};
use crate::schema::{CompanyDirectory, SchemaResolver, SqliteDirectory, StaticDirectory};
use crate::sqlgen::SqlGenerator;
use crate::usage::log_usage_turn;

use log::{error, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_TOP_K: usize = 4;

/// A user question and the context the caller supplies with it.
#[derive(Debug, Clone, Default)]
pub struct Question {
    pub text: String,
    /// Company the question is about. When absent, the question text is scanned.
    pub company: Option<String>,
    pub session_id: Option<String>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }
}

/// A successful answer from either branch.
#[derive(Debug, Clone)]
pub enum Answer {
    Numerical {
        formatted_result: String,
        sql: String,
        result: ExecutionResult,
    },
    Contextual(ContextualAnswer),
}

/// What callers receive. Serializes to the same shapes the web layer returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Numerical {
        formatted_result: String,
        sql: String,
    },
    Contextual {
        response: String,
        sources: Vec<SourceRef>,
    },
    Failure {
        error: String,
        kind: ErrorKind,
        status: u16,
    },
}

impl Response {
    pub fn is_failure(&self) -> bool {
        matches!(self, Response::Failure { .. })
    }
}

impl From<Answer> for Response {
    fn from(answer: Answer) -> Self {
        match answer {
            Answer::Numerical {
                formatted_result,
                sql,
                ..
            } => Response::Numerical {
                formatted_result,
                sql,
            },
            Answer::Contextual(ContextualAnswer {
                response, sources, ..
            }) => Response::Contextual { response, sources },
        }
    }
}

impl From<&CoreError> for Response {
    fn from(err: &CoreError) -> Self {
        Response::Failure {
            error: err.to_string(),
            kind: err.kind(),
            status: err.status_code(),
        }
    }
}

/// Routes each question to the SQL branch or the retrieval branch.
pub struct Orchestrator {
    registry: Arc<ModelRegistry>,
    schema: SchemaResolver,
    generator: SqlGenerator,
    executor: SqlExecutor,
    answerer: ContextualAnswerer,
    keys: ApiKeyPool,
    /// Keys for the answer model when it lives on another provider than the SQL model.
    answer_keys: Option<ApiKeyPool>,
    max_attempts: u32,
    top_k: usize,
    usage_dir: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ModelRegistry>,
        schema: SchemaResolver,
        generator: SqlGenerator,
        executor: SqlExecutor,
        answerer: ContextualAnswerer,
        keys: ApiKeyPool,
    ) -> Self {
        Self {
            registry,
            schema,
            generator,
            executor,
            answerer,
            keys,
            answer_keys: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            top_k: DEFAULT_TOP_K,
            usage_dir: None,
        }
    }

    /// Assembles the production pipeline: catalogue models over HTTP, SQLite, arroy.
    pub fn from_settings(settings: &Settings) -> Result<Self, CoreError> {
        let registry = Arc::new(ModelRegistry::load(settings)?);

        let directory: Box<dyn CompanyDirectory> = match &settings.company_map_db {
            Some(path) => Box::new(SqliteDirectory::new(path)),
            None => Box::new(StaticDirectory::builtin()),
        };
        let schema = SchemaResolver::new(directory, &settings.ddl_dir);
        let generator = SqlGenerator::new(Arc::new(Orchestra::new(&settings.sql_model)?));
        let answerer = ContextualAnswerer::new(Arc::new(Orchestra::new(&settings.answer_model)?));
        let executor = SqlExecutor::new(Arc::new(SqliteConnector::new(settings.database.clone())));
        let keys = ApiKeyPool::new(settings.api_keys.clone())?;
        let answer_keys = ApiKeyPool::new(settings.answer_api_keys.clone())?;

        Ok(Self::new(registry, schema, generator, executor, answerer, keys)
            .with_answer_keys(answer_keys)
            .with_max_attempts(settings.max_repair_attempts)
            .with_top_k(settings.top_k)
            .with_usage_dir(settings.usage_dir.clone()))
    }

    /// Gives the contextual branch its own key rotation. Without it both branches share one pool.
    pub fn with_answer_keys(mut self, answer_keys: ApiKeyPool) -> Self {
        self.answer_keys = Some(answer_keys);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_usage_dir(mut self, usage_dir: Option<PathBuf>) -> Self {
        self.usage_dir = usage_dir;
        self
    }

    pub fn classify(&self, question: &str) -> Classification {
        self.registry.classifier().classify(question)
    }

    /// Answers `question`. Every failure becomes a `Response::Failure`.
    pub fn answer(&self, question: &Question) -> Response {
        match self.try_answer(question) {
            Ok(answer) => answer.into(),
            Err(e) => {
                if e.status_code() >= 500 {
                    error!("Question failed ({:?}): {}", e.kind(), e);
                } else {
                    warn!("Question rejected ({:?}): {}", e.kind(), e);
                }
                Response::from(&e)
            }
        }
    }

    pub fn try_answer(&self, question: &Question) -> Result<Answer, CoreError> {
        let request_id = Uuid::new_v4();
        let branch = self.classify(&question.text);
        info!(
            "Request {} (session {}) classified as {}",
            request_id,
            question.session_id.as_deref().unwrap_or("-"),
            branch
        );
        match branch {
            Classification::Numerical => self.answer_numerical(question, request_id),
            Classification::Contextual => self.answer_contextual(question, request_id),
        }
    }

    fn company_for(&self, question: &Question) -> Result<String, CoreError> {
        if let Some(company) = question.company.as_deref().filter(|c| !c.trim().is_empty()) {
            return Ok(company.to_string());
        }
        self.schema
            .detect_in_text(&question.text)?
            .ok_or_else(|| CoreError::CompanyNotRecognized("no company given or named in the question".to_string()))
    }

    fn answer_numerical(&self, question: &Question, request_id: Uuid) -> Result<Answer, CoreError> {
        let company = self.company_for(question)?;
        let schema = self.schema.resolve(&company)?;

        let mut usage = Usage::default();
        let run = RepairLoop::new(&self.generator, &self.executor, &self.keys, self.max_attempts)
            .run_metered(&question.text, &schema, &mut usage);
        if usage.total_tokens > 0 {
            self.record_usage(request_id, &usage, "numerical", self.generator.model_name());
        }
        let outcome = run?;

        let sql = outcome.history.last().map(|a| a.sql.clone()).unwrap_or_default();
        let result = outcome.into_result()?;
        Ok(Answer::Numerical {
            formatted_result: result.formatted_scalar(),
            sql,
            result,
        })
    }

    fn answer_contextual(&self, question: &Question, request_id: Uuid) -> Result<Answer, CoreError> {
        let retriever = self.registry.retriever()?;
        let chunks = retriever.retrieve(&question.text, self.top_k)?;
        info!("Retrieved {} chunks", chunks.len());

        let keys = self.answer_keys.as_ref().unwrap_or(&self.keys);
        let answer = self.answerer.answer(&question.text, &chunks, keys.next_key())?;
        if let Some(usage) = &answer.usage {
            self.record_usage(request_id, usage, "contextual", self.answerer.model_name());
        }
        Ok(Answer::Contextual(answer))
    }

    fn record_usage(&self, request_id: Uuid, usage: &Usage, label: &str, model_name: &str) {
        let Some(dir) = &self.usage_dir else {
            return;
        };
        if let Err(e) = log_usage_turn(dir, request_id, usage, label, model_name) {
            warn!("Failed to record token usage: {}", e);
        }
    }
}
