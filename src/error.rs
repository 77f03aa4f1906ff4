use crate::executor::ExecutionFailure;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema load error: {0}")]
    SchemaLoad(String),

    #[error("Model request failed: {0}")]
    Upstream(String),

    #[error("No SQL statement to execute. Please generate one first.")]
    NoStatementAvailable,

    #[error("SQL execution failed: {0}")]
    SqlExecution(String),

    #[error("Statement rejected: {0}")]
    StatementRejected(String),

    #[error("{0}")]
    Execution(Box<ExecutionFailure>),
}

impl AgentError {
    /// True for errors caused by the caller rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(self, AgentError::NoStatementAvailable)
    }
}

impl From<ExecutionFailure> for AgentError {
    fn from(failure: ExecutionFailure) -> Self {
        AgentError::Execution(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
