//! SQL Executor with Repair Loop
//!
//! Executes one statement. On the first failure, and only when the session has
//! a remembered statement, the error and failing SQL go back to the model once
//! for a correction; the corrected statement is executed with no further
//! repair. Worst case per call: two execution attempts and one repair
//! request.

use crate::db::{Database, Row};
use crate::error::{AgentError, Result};
use crate::extract::{strip_fences, StatementExtractor};
use crate::llm::CompletionModel;
use crate::prompt::{build_repair_prompt, schema_context};
use crate::schema::SchemaSnapshot;
use crate::session::SessionState;
use serde::Serialize;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Read,
    Write,
}

/// Read/write policy point. Every statement passes through here before it
/// reaches the database.
///
/// The statement is tokenized with the Postgres dialect, so quoted strings,
/// `E'..'` escapes, dollar-quoted bodies and comments never count as
/// statement boundaries. Statements whose first token is `select` (any case)
/// are reads; everything else is a write. Empty input, input holding more
/// than one statement and input that cannot be tokenized are rejected.
pub fn classify_statement(statement: &str) -> Result<StatementKind> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, statement)
        .tokenize()
        .map_err(|e| AgentError::StatementRejected(format!("could not tokenize statement: {}", e)))?;

    let mut significant = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF));

    let first = significant.by_ref().find(|t| !matches!(t, Token::SemiColon));
    let Some(first) = first else {
        return Err(AgentError::StatementRejected("empty statement".to_string()));
    };

    let mut terminated = false;
    for token in significant {
        match token {
            Token::SemiColon => terminated = true,
            _ if terminated => {
                return Err(AgentError::StatementRejected(
                    "only one statement can be executed at a time".to_string(),
                ))
            }
            _ => {}
        }
    }

    let is_select = matches!(first, Token::Word(w) if w.value.eq_ignore_ascii_case("select"));

    Ok(if is_select {
        StatementKind::Read
    } else {
        StatementKind::Write
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum QueryResult {
    #[serde(rename = "select")]
    Rows { results: Vec<Row> },
    #[serde(rename = "action")]
    Acknowledged { rows_affected: u64 },
}

/// The statement that failed before a successful repair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairedFrom {
    pub statement: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    /// The statement that actually ran.
    pub statement: String,
    pub result: QueryResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repaired_from: Option<RepairedFrom>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// The model answered but gave no statement.
    NoStatement { reply: String },
    /// The repair request itself failed.
    UpstreamFailed { error: String },
    /// The corrected statement failed as well.
    RetryFailed { statement: String, error: String },
}

/// A final execution failure: the original error plus whatever the repair produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionFailure {
    pub statement: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairOutcome>,
}

impl ExecutionFailure {
    fn with_repair(mut self, repair: RepairOutcome) -> Self {
        self.repair = Some(repair);
        self
    }
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SQL execution failed: {}", self.error)?;
        match &self.repair {
            None => Ok(()),
            Some(RepairOutcome::NoStatement { reply }) => {
                write!(f, " (AI suggested no corrected query: {})", reply)
            }
            Some(RepairOutcome::UpstreamFailed { error }) => {
                write!(f, " (retry with AI failed: {})", error)
            }
            Some(RepairOutcome::RetryFailed { statement, error }) => {
                write!(f, " (corrected query `{}` also failed: {})", statement, error)
            }
        }
    }
}

pub struct SqlExecutor {
    db: Arc<dyn Database>,
    model: Arc<dyn CompletionModel>,
    extractor: Arc<dyn StatementExtractor>,
    schema: Arc<SchemaSnapshot>,
}

impl SqlExecutor {
    pub fn new(
        db: Arc<dyn Database>,
        model: Arc<dyn CompletionModel>,
        extractor: Arc<dyn StatementExtractor>,
        schema: Arc<SchemaSnapshot>,
    ) -> Self {
        Self {
            db,
            model,
            extractor,
            schema,
        }
    }

    /// Execute with a single repair attempt allowed.
    pub async fn execute(
        &self,
        statement: &str,
        session: &mut SessionState,
    ) -> std::result::Result<ExecutionOutcome, ExecutionFailure> {
        self.execute_with(statement, session, true).await
    }

    pub async fn execute_with(
        &self,
        statement: &str,
        session: &mut SessionState,
        retry: bool,
    ) -> std::result::Result<ExecutionOutcome, ExecutionFailure> {
        let statement = strip_fences(statement);

        let error = match self.attempt(&statement).await {
            Ok(result) => {
                return Ok(ExecutionOutcome {
                    statement,
                    result,
                    repaired_from: None,
                })
            }
            Err(e) => error_text(&e),
        };
        error!("SQL execution failed: {}", error);

        let failure = ExecutionFailure {
            statement: statement.clone(),
            error,
            repair: None,
        };
        if !retry || session.last_statement.is_none() {
            return Err(failure);
        }

        let repair_prompt = build_repair_prompt(&failure.error, &statement);
        let reply = match self
            .model
            .complete(&schema_context(&self.schema), &repair_prompt)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                error!("Retry with AI failed: {}", e);
                return Err(failure.with_repair(RepairOutcome::UpstreamFailed {
                    error: e.to_string(),
                }));
            }
        };

        let Some(fixed) = self.extractor.extract(&reply).statement else {
            warn!("Repair reply contained no SQL statement");
            return Err(failure.with_repair(RepairOutcome::NoStatement { reply }));
        };

        info!("Retrying with fixed SQL: {}", fixed);
        session.last_statement = Some(fixed.clone());

        match self.attempt(&fixed).await {
            Ok(result) => Ok(ExecutionOutcome {
                statement: fixed,
                result,
                repaired_from: Some(RepairedFrom {
                    statement: failure.statement,
                    error: failure.error,
                }),
            }),
            Err(e) => {
                let retry_error = error_text(&e);
                error!("Repaired SQL failed: {}", retry_error);
                Err(failure.with_repair(RepairOutcome::RetryFailed {
                    statement: fixed,
                    error: retry_error,
                }))
            }
        }
    }

    /// One execution attempt on its own connection.
    async fn attempt(&self, statement: &str) -> Result<QueryResult> {
        let kind = classify_statement(statement)?;

        let mut conn = self.db.connect().await?;
        let result = match kind {
            StatementKind::Read => conn
                .fetch_all(statement)
                .await
                .map(|results| QueryResult::Rows { results }),
            StatementKind::Write => conn
                .execute(statement)
                .await
                .map(|rows_affected| QueryResult::Acknowledged { rows_affected }),
        };

        if let Err(e) = conn.close().await {
            warn!("Failed to close connection: {}", e);
        }
        result
    }
}

fn error_text(e: &AgentError) -> String {
    match e {
        AgentError::SqlExecution(msg) => msg.clone(),
        other => other.to_string(),
    }
}
