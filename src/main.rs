use anyhow::Result;
use clap::Parser;
use sql_agent::db::PgDatabase;
use sql_agent::llm::LlmClient;
use sql_agent::{AgentConfig, Reply, SchemaCache, SessionState, SqlAgent};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

#[derive(Parser)]
#[command(name = "sql-agent")]
#[command(about = "Chat with your database: natural language in, SQL out")]
struct Args {
    /// Schema whose tables ground the prompts (overrides DB_SCHEMA)
    #[arg(short, long)]
    schema: Option<String>,

    /// Model identifier (overrides LLM_MODEL)
    #[arg(long)]
    model: Option<String>,
}

const HELP: &str = "Commands: /execute runs the last generated SQL, /run <sql> runs raw SQL, /clear clears history, /quit exits.";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    sql_agent::logging::init();

    let args = Args::parse();
    let mut config = AgentConfig::from_env()?;
    if let Some(schema) = args.schema {
        config.schema = schema;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let db = Arc::new(PgDatabase::new(
        &config.database_url,
        config.connect_timeout,
        config.statement_timeout,
    )?);
    let schema = Arc::new(SchemaCache::load(db.as_ref(), &config.schema).await);
    let llm = Arc::new(LlmClient::from_config(&config)?);
    info!("Using model {}", llm.model());

    let agent = SqlAgent::new(schema, db, llm);
    let mut session = SessionState::new();

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/help" => println!("{}", HELP),
            "/clear" => {
                agent.clear_history(&mut session);
                println!("History cleared.");
            }
            _ => {
                let result = match input.strip_prefix("/run ") {
                    Some(sql) => agent.run_statement(sql, &mut session).await.map(Reply::Executed),
                    None => agent.handle_input(input, &mut session).await,
                };
                match result {
                    Ok(Reply::Generated(answer)) => println!("{}", answer.response),
                    Ok(Reply::Executed(outcome)) => {
                        println!("{}", serde_json::to_string_pretty(&outcome)?)
                    }
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
        }
    }

    Ok(())
}
