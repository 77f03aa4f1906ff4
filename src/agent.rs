//! Caller-facing operations: submit, execute last, run raw SQL, clear history.

use crate::db::Database;
use crate::error::{AgentError, Result};
use crate::executor::{ExecutionOutcome, SqlExecutor};
use crate::extract::{MarkerExtractor, StatementExtractor};
use crate::llm::CompletionModel;
use crate::prompt::build_prompt;
use crate::schema::SchemaSnapshot;
use crate::session::{is_execute_command, ConversationTurn, SessionState};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A model answer to a natural-language request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResponse {
    /// The raw model reply.
    pub response: String,
    pub explanation: String,
    #[serde(rename = "sql")]
    pub statement: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Generated(SubmitResponse),
    Executed(ExecutionOutcome),
}

pub struct SqlAgent {
    schema: Arc<SchemaSnapshot>,
    model: Arc<dyn CompletionModel>,
    extractor: Arc<dyn StatementExtractor>,
    executor: SqlExecutor,
}

impl SqlAgent {
    pub fn new(
        schema: Arc<SchemaSnapshot>,
        db: Arc<dyn Database>,
        model: Arc<dyn CompletionModel>,
    ) -> Self {
        Self::with_extractor(schema, db, model, Arc::new(MarkerExtractor))
    }

    pub fn with_extractor(
        schema: Arc<SchemaSnapshot>,
        db: Arc<dyn Database>,
        model: Arc<dyn CompletionModel>,
        extractor: Arc<dyn StatementExtractor>,
    ) -> Self {
        let executor = SqlExecutor::new(
            db,
            Arc::clone(&model),
            Arc::clone(&extractor),
            Arc::clone(&schema),
        );

        Self {
            schema,
            model,
            extractor,
            executor,
        }
    }

    pub fn schema(&self) -> &SchemaSnapshot {
        &self.schema
    }

    /// Handle one line of user input. The execute command is checked before
    /// anything else and never reaches the model.
    pub async fn handle_input(&self, user_input: &str, session: &mut SessionState) -> Result<Reply> {
        if is_execute_command(user_input) {
            return self.execute_last(session).await.map(Reply::Executed);
        }
        self.submit(user_input, session).await.map(Reply::Generated)
    }

    /// Ask the model for a statement. History and the remembered statement are
    /// only updated when the model call succeeds.
    pub async fn submit(&self, user_input: &str, session: &mut SessionState) -> Result<SubmitResponse> {
        let prompt = build_prompt(&self.schema, session.history(), user_input);
        debug!("Prompt:\n{}", prompt);

        let reply = self.model.complete(&prompt, user_input).await.map_err(|e| {
            error!("Error generating SQL: {}", e);
            e
        })?;

        session.record(ConversationTurn::user(user_input));
        session.record(ConversationTurn::agent(reply.clone()));

        let extraction = self.extractor.extract(&reply);
        if let Some(statement) = &extraction.statement {
            info!("Generated SQL: {}", statement);
            session.last_statement = Some(statement.clone());
        }

        Ok(SubmitResponse {
            response: reply,
            explanation: extraction.explanation,
            statement: extraction.statement,
        })
    }

    pub async fn execute_last(&self, session: &mut SessionState) -> Result<ExecutionOutcome> {
        let Some(statement) = session.last_statement.clone() else {
            debug!("Execute requested with no statement in session");
            return Err(AgentError::NoStatementAvailable);
        };

        self.executor
            .execute(&statement, session)
            .await
            .map_err(AgentError::from)
    }

    pub async fn run_statement(&self, raw_sql: &str, session: &mut SessionState) -> Result<ExecutionOutcome> {
        self.executor
            .execute(raw_sql, session)
            .await
            .map_err(AgentError::from)
    }

    pub fn clear_history(&self, session: &mut SessionState) {
        session.clear();
    }
}
