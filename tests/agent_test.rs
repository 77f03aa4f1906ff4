use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sql_agent::db::{Connection, Database, Row};
use sql_agent::executor::{QueryResult, RepairOutcome};
use sql_agent::llm::CompletionModel;
use sql_agent::prompt::build_prompt;
use sql_agent::schema::{ColumnRecord, ForeignKey};
use sql_agent::{AgentError, Reply, SchemaCache, SchemaSnapshot, SessionState, SqlAgent};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// In-memory database: statements with canned rows succeed, everything else fails.
#[derive(Default)]
struct DbState {
    rows: HashMap<String, Vec<Row>>,
    fail_metadata: bool,
    connects: Mutex<usize>,
    executed: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
struct FakeDatabase(Arc<DbState>);

impl FakeDatabase {
    fn with_rows(sql: &str, rows: Vec<Row>) -> Self {
        let mut state = DbState::default();
        state.rows.insert(sql.to_string(), rows);
        Self(Arc::new(state))
    }

    fn failing_metadata() -> Self {
        Self(Arc::new(DbState {
            fail_metadata: true,
            ..Default::default()
        }))
    }

    fn connects(&self) -> usize {
        *self.0.connects.lock().unwrap()
    }

    fn executed(&self) -> Vec<String> {
        self.0.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn connect(&self) -> sql_agent::Result<Box<dyn Connection>> {
        *self.0.connects.lock().unwrap() += 1;
        Ok(Box::new(FakeConnection(Arc::clone(&self.0))))
    }
}

struct FakeConnection(Arc<DbState>);

#[async_trait]
impl Connection for FakeConnection {
    async fn fetch_all(&mut self, sql: &str) -> sql_agent::Result<Vec<Row>> {
        self.0.executed.lock().unwrap().push(sql.to_string());
        self.0
            .rows
            .get(sql)
            .cloned()
            .ok_or_else(|| AgentError::SqlExecution(format!("relation in `{}` does not exist", sql)))
    }

    async fn execute(&mut self, sql: &str) -> sql_agent::Result<u64> {
        self.0.executed.lock().unwrap().push(sql.to_string());
        if self.0.rows.contains_key(sql) {
            Ok(1)
        } else {
            Err(AgentError::SqlExecution("syntax error".to_string()))
        }
    }

    async fn foreign_keys(&mut self, _schema: &str) -> sql_agent::Result<Vec<ForeignKey>> {
        if self.0.fail_metadata {
            return Err(AgentError::SchemaLoad("permission denied".to_string()));
        }
        Ok(vec![ForeignKey {
            table: "orders".to_string(),
            column: "customer_id".to_string(),
            referenced_table: "customers".to_string(),
            referenced_column: "id".to_string(),
        }])
    }

    async fn columns(&mut self, schema: &str) -> sql_agent::Result<Vec<ColumnRecord>> {
        let col = |table: &str, name: &str, ty: &str| ColumnRecord {
            schema: schema.to_string(),
            table: table.to_string(),
            name: name.to_string(),
            data_type: ty.to_string(),
        };
        Ok(vec![
            col("customers", "id", "integer"),
            col("customers", "name", "text"),
            col("orders", "id", "integer"),
            col("orders", "customer_id", "integer"),
        ])
    }

    async fn close(self: Box<Self>) -> sql_agent::Result<()> {
        Ok(())
    }
}

/// Model double that replays scripted replies and records every call.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<sql_agent::Result<String>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    fn new(replies: Vec<sql_agent::Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> sql_agent::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((system_prompt.to_string(), user_message.to_string()));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::Upstream("no scripted reply".to_string())))
    }
}

fn order_row() -> Row {
    let mut row = Map::new();
    row.insert("id".to_string(), json!(1));
    row.insert("customer_id".to_string(), json!(7));
    row
}

fn setup(db: FakeDatabase, model: Arc<ScriptedModel>) -> (SqlAgent, FakeDatabase) {
    let agent = SqlAgent::new(
        Arc::new(SchemaSnapshot::empty()),
        Arc::new(db.clone()),
        model,
    );
    (agent, db)
}

#[tokio::test]
async fn test_schema_load_groups_columns() {
    let db = FakeDatabase::default();
    let snapshot = SchemaCache::load(&db, "shop").await;

    let tables: Vec<&String> = snapshot.columns().keys().collect();
    assert_eq!(tables, vec!["shop.customers", "shop.orders"]);
    assert_eq!(snapshot.relationships().len(), 1);
    assert_eq!(db.connects(), 1);
}

#[tokio::test]
async fn test_schema_load_failure_yields_empty_snapshot() {
    let db = FakeDatabase::failing_metadata();
    let snapshot = SchemaCache::load(&db, "shop").await;

    assert!(snapshot.is_empty());
    assert_eq!(snapshot, SchemaSnapshot::empty());
    assert!(SchemaCache::try_load(&db, "shop").await.is_err());
}

#[tokio::test]
async fn test_submit_records_history_and_statement() {
    let model = ScriptedModel::new(vec![Ok(
        "Fetches order 1.\nSQL:\n```sql\nSELECT * FROM orders WHERE id = 1\n```".to_string(),
    )]);
    let (agent, db) = setup(FakeDatabase::default(), Arc::clone(&model));
    let mut session = SessionState::new();

    let answer = agent.submit("show order 1", &mut session).await.unwrap();

    assert_eq!(answer.explanation, "Fetches order 1.");
    assert_eq!(answer.statement.as_deref(), Some("SELECT * FROM orders WHERE id = 1"));
    assert_eq!(
        session.last_statement.as_deref(),
        Some("SELECT * FROM orders WHERE id = 1")
    );
    assert_eq!(session.history().len(), 2);
    assert_eq!(db.connects(), 0);

    let (system, user) = &model.calls()[0];
    assert!(system.contains("show order 1"));
    assert_eq!(user, "show order 1");
}

#[tokio::test]
async fn test_submit_without_marker_keeps_previous_statement() {
    let model = ScriptedModel::new(vec![
        Ok("SQL: SELECT 1".to_string()),
        Ok("I need more detail about what you mean.".to_string()),
    ]);
    let (agent, _db) = setup(FakeDatabase::default(), model);
    let mut session = SessionState::new();

    agent.submit("one", &mut session).await.unwrap();
    let answer = agent.submit("something vague", &mut session).await.unwrap();

    assert_eq!(answer.statement, None);
    assert_eq!(answer.explanation, "I need more detail about what you mean.");
    assert_eq!(session.last_statement.as_deref(), Some("SELECT 1"));
}

#[tokio::test]
async fn test_submit_upstream_error_leaves_session_untouched() {
    let model = ScriptedModel::new(vec![Err(AgentError::Upstream("503".to_string()))]);
    let (agent, _db) = setup(FakeDatabase::default(), model);
    let mut session = SessionState::new();

    let err = agent.submit("count orders", &mut session).await.unwrap_err();

    assert!(matches!(err, AgentError::Upstream(_)));
    assert!(session.history().is_empty());
    assert!(session.last_statement.is_none());
}

#[tokio::test]
async fn test_history_flows_into_next_prompt() {
    let model = ScriptedModel::new(vec![
        Ok("SQL: SELECT * FROM orders".to_string()),
        Ok("SQL: SELECT count(*) FROM orders".to_string()),
    ]);
    let (agent, _db) = setup(FakeDatabase::default(), Arc::clone(&model));
    let mut session = SessionState::new();

    agent.submit("list orders", &mut session).await.unwrap();
    agent.submit("now count them", &mut session).await.unwrap();

    let second_prompt = &model.calls()[1].0;
    let first_turn = second_prompt.find("User: list orders").unwrap();
    let agent_turn = second_prompt.find("DB Agent: SQL: SELECT * FROM orders").unwrap();
    assert!(first_turn < agent_turn);
}

#[tokio::test]
async fn test_clear_history_matches_fresh_session() {
    let model = ScriptedModel::new(vec![Ok("SQL: SELECT 1".to_string())]);
    let (agent, _db) = setup(FakeDatabase::default(), model);
    let mut session = SessionState::new();

    agent.submit("anything", &mut session).await.unwrap();
    agent.clear_history(&mut session);

    let fresh = SessionState::new();
    assert_eq!(
        build_prompt(agent.schema(), session.history(), "next"),
        build_prompt(agent.schema(), fresh.history(), "next")
    );
}

#[tokio::test]
async fn test_execute_last_without_statement() {
    let model = ScriptedModel::new(vec![]);
    let (agent, db) = setup(FakeDatabase::default(), Arc::clone(&model));
    let mut session = SessionState::new();

    let err = agent.handle_input("EXECUTE LAST", &mut session).await.unwrap_err();

    assert!(matches!(err, AgentError::NoStatementAvailable));
    assert!(err.is_user_error());
    assert_eq!(db.connects(), 0);
    assert!(model.calls().is_empty());
}

#[tokio::test]
async fn test_submit_then_execute_last_twice() {
    let sql = "SELECT * FROM orders WHERE id = 1";
    let model = ScriptedModel::new(vec![Ok(format!("Order one.\nSQL: {}", sql))]);
    let (agent, db) = setup(
        FakeDatabase::with_rows(sql, vec![order_row()]),
        Arc::clone(&model),
    );
    let mut session = SessionState::new();

    agent.submit("order 1 please", &mut session).await.unwrap();
    let first = agent.execute_last(&mut session).await.unwrap();
    let second = match agent.handle_input("/execute", &mut session).await.unwrap() {
        Reply::Executed(outcome) => outcome,
        other => panic!("expected execution, got {:?}", other),
    };

    assert_eq!(first, second);
    assert_eq!(
        first.result,
        QueryResult::Rows {
            results: vec![order_row()]
        }
    );
    assert_eq!(session.last_statement.as_deref(), Some(sql));
    assert_eq!(db.connects(), 2);
    assert_eq!(model.calls().len(), 1);
}

#[tokio::test]
async fn test_always_failing_statement_is_repaired_once() {
    let model = ScriptedModel::new(vec![
        Ok("SQL: SELECT * FROM ordrs".to_string()),
        Ok("Try again.\nSQL: SELECT * FROM orderz".to_string()),
        Ok("SQL: SELECT * FROM never_called".to_string()),
    ]);
    let (agent, db) = setup(FakeDatabase::default(), Arc::clone(&model));
    let mut session = SessionState::new();

    agent.submit("orders", &mut session).await.unwrap();
    let err = agent.execute_last(&mut session).await.unwrap_err();

    assert_eq!(db.connects(), 2);
    assert_eq!(db.executed(), vec!["SELECT * FROM ordrs", "SELECT * FROM orderz"]);
    // one submit call plus exactly one repair call
    assert_eq!(model.calls().len(), 2);

    match err {
        AgentError::Execution(failure) => {
            assert_eq!(failure.statement, "SELECT * FROM ordrs");
            assert!(failure.error.contains("ordrs"));
            match failure.repair {
                Some(RepairOutcome::RetryFailed { statement, error }) => {
                    assert_eq!(statement, "SELECT * FROM orderz");
                    assert!(error.contains("orderz"));
                }
                other => panic!("unexpected repair outcome {:?}", other),
            }
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(session.last_statement.as_deref(), Some("SELECT * FROM orderz"));
}

#[tokio::test]
async fn test_repair_fixes_typo() {
    let model = ScriptedModel::new(vec![
        Ok("SQL: SELECT * FROM ordrs".to_string()),
        Ok("SQL:\nSELECT * FROM orders".to_string()),
    ]);
    let (agent, db) = setup(
        FakeDatabase::with_rows("SELECT * FROM orders", vec![order_row()]),
        Arc::clone(&model),
    );
    let mut session = SessionState::new();

    agent.submit("all orders", &mut session).await.unwrap();
    let outcome = agent.execute_last(&mut session).await.unwrap();

    assert_eq!(outcome.statement, "SELECT * FROM orders");
    let repaired = outcome.repaired_from.expect("repair recorded");
    assert_eq!(repaired.statement, "SELECT * FROM ordrs");
    assert_eq!(session.last_statement.as_deref(), Some("SELECT * FROM orders"));
    assert_eq!(db.executed(), vec!["SELECT * FROM ordrs", "SELECT * FROM orders"]);

    // repair request: schema-only system context, error and failing SQL in the message
    let (system, user) = &model.calls()[1];
    assert!(system.starts_with("Schema:"));
    assert!(!system.contains("all orders"));
    assert!(user.contains("SELECT * FROM ordrs"));
    assert!(user.contains("does not exist"));
}

#[tokio::test]
async fn test_repair_reply_without_statement() {
    let model = ScriptedModel::new(vec![
        Ok("SQL: DELETE FROM nowhere".to_string()),
        Ok("I am not sure how to fix this.".to_string()),
    ]);
    let (agent, db) = setup(FakeDatabase::default(), model);
    let mut session = SessionState::new();

    agent.submit("clean up", &mut session).await.unwrap();
    let err = agent.execute_last(&mut session).await.unwrap_err();

    assert_eq!(db.connects(), 1);
    match err {
        AgentError::Execution(failure) => {
            assert_eq!(failure.error, "syntax error");
            assert_eq!(
                failure.repair,
                Some(RepairOutcome::NoStatement {
                    reply: "I am not sure how to fix this.".to_string()
                })
            );
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(session.last_statement.as_deref(), Some("DELETE FROM nowhere"));
}

#[tokio::test]
async fn test_repair_upstream_failure_is_surfaced() {
    let model = ScriptedModel::new(vec![
        Ok("SQL: SELECT * FROM ordrs".to_string()),
        Err(AgentError::Upstream("connection reset".to_string())),
    ]);
    let (agent, db) = setup(FakeDatabase::default(), model);
    let mut session = SessionState::new();

    agent.submit("orders", &mut session).await.unwrap();
    let err = agent.execute_last(&mut session).await.unwrap_err();

    assert_eq!(db.connects(), 1);
    match err {
        AgentError::Execution(failure) => match failure.repair {
            Some(RepairOutcome::UpstreamFailed { error }) => {
                assert!(error.contains("connection reset"))
            }
            other => panic!("unexpected repair outcome {:?}", other),
        },
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_run_statement_without_remembered_statement_is_final() {
    let model = ScriptedModel::new(vec![]);
    let (agent, db) = setup(FakeDatabase::default(), Arc::clone(&model));
    let mut session = SessionState::new();

    let err = agent
        .run_statement("SELECT * FROM missing", &mut session)
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Execution(ref f) if f.repair.is_none()));
    assert_eq!(db.connects(), 1);
    assert!(model.calls().is_empty());
}

#[tokio::test]
async fn test_run_statement_write_strips_fences() {
    let sql = "UPDATE orders SET customer_id = 8 WHERE id = 1";
    let (agent, db) = setup(FakeDatabase::with_rows(sql, vec![]), ScriptedModel::new(vec![]));
    let mut session = SessionState::new();

    let outcome = agent
        .run_statement(&format!("```sql\n{}\n```", sql), &mut session)
        .await
        .unwrap();

    assert_eq!(outcome.result, QueryResult::Acknowledged { rows_affected: 1 });
    assert_eq!(db.executed(), vec![sql]);
    assert!(session.last_statement.is_none());
}

#[tokio::test]
async fn test_rejected_statement_never_reaches_database() {
    let (agent, db) = setup(FakeDatabase::default(), ScriptedModel::new(vec![]));
    let mut session = SessionState::new();

    let err = agent
        .run_statement("SELECT 1; DROP TABLE orders", &mut session)
        .await
        .unwrap_err();

    assert_eq!(db.connects(), 0);
    match err {
        AgentError::Execution(failure) => assert!(failure.error.contains("one statement")),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_outcome_serialization_shape() {
    let value: Value = serde_json::to_value(QueryResult::Acknowledged { rows_affected: 3 }).unwrap();
    assert_eq!(value, json!({"type": "action", "rows_affected": 3}));
}
