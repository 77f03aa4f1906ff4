//! Prompt Builder
//!
//! Renders the schema snapshot, conversation history and request into the
//! instruction text sent to the model. The reply shape requested here
//! (explanation, then a line starting with `SQL:`) is what the statement
//! extractor relies on.

use crate::schema::SchemaSnapshot;
use crate::session::ConversationTurn;

pub const SQL_MARKER: &str = "SQL:";

pub fn build_prompt(
    snapshot: &SchemaSnapshot,
    history: &[ConversationTurn],
    user_input: &str,
) -> String {
    format!(
        r#"You are a DB Agent connected to a PostgreSQL database.

Use ONLY the real schema below when answering queries. Never guess table or column names.

Foreign Key Relationships:
{relationships}

Table Columns:
{columns}

Conversation so far:
{history}

New User Request:
{request}

Format your reply like this:
Explanation
{marker}
<valid query>
"#,
        relationships = snapshot.render_relationships(),
        columns = snapshot.render_columns(),
        history = render_history(history),
        request = user_input,
        marker = SQL_MARKER,
    )
}

/// Each turn on its own line, prefixed by its role marker, in recorded order.
pub fn render_history(history: &[ConversationTurn]) -> String {
    history
        .iter()
        .map(|turn| format!("\n{}: {}", turn.role, turn.text))
        .collect()
}

/// System context for repair requests: the schema only, no conversation.
pub fn schema_context(snapshot: &SchemaSnapshot) -> String {
    format!(
        "Schema:\n{}\nRelationships:\n{}",
        snapshot.render_columns(),
        snapshot.render_relationships()
    )
}

pub fn build_repair_prompt(error: &str, statement: &str) -> String {
    format!(
        r#"The following SQL query failed with error: {error}

{marker}
{statement}

Please suggest a corrected version of this query based ONLY on the schema.
Reply with a short explanation followed by a line starting with {marker} and the corrected query."#,
        error = error,
        statement = statement,
        marker = SQL_MARKER,
    )
}
