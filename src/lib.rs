pub mod agent;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod extract;
pub mod llm;
pub mod logging;
pub mod prompt;
pub mod schema;
pub mod session;

pub use agent::{Reply, SqlAgent, SubmitResponse};
pub use config::AgentConfig;
pub use error::{AgentError, Result};
pub use schema::{SchemaCache, SchemaSnapshot};
pub use session::{InMemorySessionStore, SessionState, SessionStore};
