//! HTTP server for the SQL agent
//! Simple HTTP server using tokio and basic HTTP handling

use clap::Parser;
use serde_json::{json, Value};
use sql_agent::api::{
    create_response, error_response, outcome_json, read_request, HttpRequest, SESSION_HEADER,
};
use sql_agent::db::PgDatabase;
use sql_agent::llm::LlmClient;
use sql_agent::{AgentConfig, InMemorySessionStore, Reply, SchemaCache, SessionStore, SqlAgent};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "server")]
#[command(about = "HTTP API for the SQL agent")]
struct Args {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(short, long)]
    bind: Option<String>,

    /// Schema whose tables ground the prompts (overrides DB_SCHEMA)
    #[arg(short, long)]
    schema: Option<String>,
}

struct AppState {
    agent: SqlAgent,
    sessions: InMemorySessionStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    sql_agent::logging::init();

    let args = Args::parse();
    let mut config = AgentConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(schema) = args.schema {
        config.schema = schema;
    }

    let db = Arc::new(PgDatabase::new(
        &config.database_url,
        config.connect_timeout,
        config.statement_timeout,
    )?);
    let schema = Arc::new(SchemaCache::load(db.as_ref(), &config.schema).await);
    if schema.is_empty() {
        warn!("Schema snapshot is empty; prompts will carry no table information");
    }
    let llm = Arc::new(LlmClient::from_config(&config)?);

    let state = Arc::new(AppState {
        agent: SqlAgent::new(schema, db, llm),
        sessions: InMemorySessionStore::new(),
    });

    tokio::spawn(sweep_sessions(
        Arc::clone(&state),
        config.session_idle_timeout,
    ));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Server listening on {}", config.bind_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, Arc::clone(&state)));
    }
}

async fn sweep_sessions(state: Arc<AppState>, max_idle: Duration) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let evicted = state.sessions.evict_idle(max_idle);
        if evicted > 0 {
            info!(
                "Evicted {} idle sessions, {} remain",
                evicted,
                state.sessions.len()
            );
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) {
    let mut reader = BufReader::new(stream);

    let response = match read_request(&mut reader).await {
        Ok(request) => {
            // Clients without a key get a fresh one and must echo it back.
            let session_key = match request.header(SESSION_HEADER) {
                Some(key) if !key.is_empty() => key.to_string(),
                _ => {
                    let key = Uuid::new_v4().to_string();
                    debug!("Minted session key {}", key);
                    key
                }
            };
            let (status, body) = handle_request(&request, &session_key, &state).await;
            create_response(status, &body, Some(&session_key))
        }
        Err(e) => {
            warn!("Failed to read request: {}", e);
            create_response(400, &json!({"error": format!("Bad request: {}", e)}), None)
        }
    };

    if let Err(e) = reader.get_mut().write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

async fn handle_request(request: &HttpRequest, session_key: &str, state: &AppState) -> (u16, Value) {
    info!("Request: {} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/api/health") => (200, json!({"status": "ok", "service": "sql-agent"})),
        ("POST", "/api/chat") => {
            let Some(user_input) = request.body_field("user_input") else {
                return (400, json!({"error": "Missing 'user_input'"}));
            };
            let session = state.sessions.session(session_key);
            let mut session = session.lock().await;
            match state.agent.handle_input(&user_input, &mut session).await {
                Ok(Reply::Generated(answer)) => (200, json!(answer)),
                Ok(Reply::Executed(outcome)) => (200, outcome_json(&outcome)),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/execute_last") => {
            let session = state.sessions.session(session_key);
            let mut session = session.lock().await;
            match state.agent.execute_last(&mut session).await {
                Ok(outcome) => (200, outcome_json(&outcome)),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/run_sql") => {
            let Some(sql) = request.body_field("sql_query") else {
                return (400, json!({"error": "Missing 'sql_query'"}));
            };
            let session = state.sessions.session(session_key);
            let mut session = session.lock().await;
            match state.agent.run_statement(&sql, &mut session).await {
                Ok(outcome) => (200, outcome_json(&outcome)),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/api/clear_history") => {
            let session = state.sessions.session(session_key);
            state.agent.clear_history(&mut *session.lock().await);
            (200, json!({"message": "History cleared."}))
        }
        ("DELETE", "/api/session") => {
            if state.sessions.remove(session_key) {
                (200, json!({"message": "Session ended."}))
            } else {
                (404, json!({"error": "Unknown session"}))
            }
        }
        _ => (404, json!({"error": "Not Found"})),
    }
}
