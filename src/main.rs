use anyhow::Result;
use clap::{Parser, Subcommand};
use rentql::agent::{AgentSettings, AskRequest, Text2SqlAgent};
use rentql::config::Config;
use rentql::db;
use rentql::embedding::EmbeddingProvider;
use rentql::embedding::local::LocalEmbeddingProvider;
use rentql::embedding::openai::OpenAIEmbeddingProvider;
use rentql::embedding::pipeline::{backfill, EmbeddingPipeline};
use rentql::knowledge::KnowledgeStore;
use rentql::knowledge::ingest::{ingest_chunks, load_knowledge_file};
use rentql::knowledge::postgres::PostgresKnowledgeStore;
use rentql::knowledge::schema_sync::sync_schema;
use rentql::llm::LlmProvider;
use rentql::llm::ollama::OllamaLlmProvider;
use rentql::llm::openai::OpenAILlmProvider;
use rentql::logging;
use rentql::server::RentqlService;
use rentql::session::postgres::PostgresSessionStore;
use rentql::sql::executor::PostgresQueryExecutor;
use rentql::sql::{Requester, SqlPolicy};
use rmcp::ServiceExt;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rentql", version, about = "Conversational Text2SQL MCP server for a rental marketplace")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Skip automatic database migration on startup
    #[arg(long)]
    skip_migrate: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations and exit
    Migrate,
    /// Run one conversational turn and print the result as JSON
    Ask {
        question: String,
        /// Continue an existing session
        #[arg(long)]
        session: Option<String>,
        /// Id of the user asking
        #[arg(long)]
        user: Option<String>,
        /// Role of the user asking (tenant, landlord, admin)
        #[arg(long)]
        role: Option<String>,
    },
    /// Knowledge base management
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },
}

#[derive(Subcommand)]
enum KnowledgeAction {
    /// Load business rules and example questions from a TOML file
    Ingest {
        file: PathBuf,
    },
    /// Rebuild schema chunks from the live database
    SyncSchema,
    /// Queue all un-embedded or failed chunks for embedding
    Backfill,
    /// Show chunk and embedding statistics
    Stats,
}

/// Create the LLM provider based on configuration.
fn create_llm_provider(config: &Config) -> Result<Arc<dyn LlmProvider>> {
    let timeout = Duration::from_secs(config.llm.timeout_secs);
    match config.llm.provider.as_str() {
        "openai" => {
            let api_key = config.llm.openai_api_key.clone()
                .ok_or_else(|| anyhow::anyhow!(
                    "OpenAI API key required when llm provider is 'openai'. \
                     Set RENTQL_LLM__OPENAI_API_KEY or llm.openai_api_key in rentql.toml"
                ))?;
            Ok(Arc::new(OpenAILlmProvider::new(
                config.llm.openai_base_url.clone(),
                api_key,
                config.llm.openai_model.clone(),
                config.llm.temperature,
                timeout,
            )?))
        }
        "ollama" => {
            Ok(Arc::new(OllamaLlmProvider::new(
                config.llm.ollama_base_url.clone(),
                config.llm.ollama_model.clone(),
                config.llm.temperature,
                timeout,
            )?))
        }
        other => Err(anyhow::anyhow!("Unknown llm provider '{}': expected 'ollama' or 'openai'", other)),
    }
}

/// Create the embedding provider based on configuration.
async fn create_embedding_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.embedding.provider.as_str() {
        "openai" => {
            let api_key = config.embedding.openai_api_key.clone()
                .ok_or_else(|| anyhow::anyhow!(
                    "OpenAI API key required when embedding provider is 'openai'. \
                     Set RENTQL_EMBEDDING__OPENAI_API_KEY or embedding.openai_api_key in rentql.toml"
                ))?;
            Ok(Arc::new(OpenAIEmbeddingProvider::new(
                config.embedding.openai_base_url.clone(),
                api_key,
                config.embedding.openai_model.clone(),
            )?))
        }
        "local" => {
            Ok(Arc::new(LocalEmbeddingProvider::new(&config.embedding.cache_dir).await?))
        }
        other => Err(anyhow::anyhow!("Unknown embedding provider '{}': expected 'local' or 'openai'", other)),
    }
}

/// Embedding is optional at serve time: without it retrieval is full-text only.
async fn optional_embedding_provider(config: &Config) -> Option<Arc<dyn EmbeddingProvider>> {
    match create_embedding_provider(config).await {
        Ok(provider) => Some(provider),
        Err(e) => {
            tracing::warn!(error = %e, "Embedding provider unavailable, retrieval falls back to full-text search");
            None
        }
    }
}

async fn build_agent(
    config: &Config,
    pool: PgPool,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Result<Arc<Text2SqlAgent>> {
    let llm = create_llm_provider(config)?;
    let policy = SqlPolicy::from_config(&config.sql);

    let query_pool = if config.query_database_url.is_some() {
        db::connect_query_pool(config.query_database_url()).await?
    } else {
        pool.clone()
    };

    let knowledge: Arc<dyn KnowledgeStore> = Arc::new(PostgresKnowledgeStore::new(pool.clone()));
    let sessions = Arc::new(PostgresSessionStore::new(pool));
    let executor = Arc::new(PostgresQueryExecutor::new(
        query_pool,
        &policy,
        &config.sql.sensitive_columns,
    ));

    let pipeline = embedder
        .clone()
        .map(|provider| Arc::new(EmbeddingPipeline::new(provider, knowledge.clone(), 1000)));

    let settings = AgentSettings {
        retrieval: config.retrieval.clone(),
        session: config.session.clone(),
        max_generation_attempts: config.sql.max_generation_attempts,
    };

    Ok(Arc::new(Text2SqlAgent::new(
        llm,
        embedder,
        knowledge,
        sessions,
        executor,
        policy,
        settings,
        pipeline,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args
    let cli = Cli::parse();

    // 2. Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Config error (using defaults): {}", e);
        Config::default()
    });

    // 3. Initialize logging before any other output; stdout is reserved for JSON-RPC
    logging::init_logging(&config);

    let run_migrations = !cli.skip_migrate;

    match cli.command {
        Some(Commands::Migrate) => {
            tracing::info!("Running database migrations...");
            db::connect(&config.database_url, true).await?;
            println!("Migrations completed successfully.");
        }

        Some(Commands::Ask { question, session, user, role }) => {
            let pool = db::connect(&config.database_url, run_migrations).await?;
            let embedder = optional_embedding_provider(&config).await;
            let agent = build_agent(&config, pool, embedder).await?;

            let response = agent
                .ask(AskRequest {
                    question,
                    session_id: session,
                    requester: Requester::new(user, role),
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);

            if let Some(pipeline) = agent.pipeline() {
                pipeline.flush().await;
            }
        }

        Some(Commands::Knowledge { action }) => {
            let pool = db::connect(&config.database_url, run_migrations).await?;
            let store: Arc<dyn KnowledgeStore> = Arc::new(PostgresKnowledgeStore::new(pool.clone()));

            match action {
                KnowledgeAction::Ingest { file } => {
                    let chunks = load_knowledge_file(&file)?;
                    let embedder = optional_embedding_provider(&config).await;
                    let pipeline = embedder.map(|p| EmbeddingPipeline::new(p, store.clone(), 1000));
                    let report = ingest_chunks(store.as_ref(), pipeline.as_ref(), chunks, true).await?;
                    if let Some(ref pipeline) = pipeline {
                        pipeline.flush().await;
                    }
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                KnowledgeAction::SyncSchema => {
                    let policy = SqlPolicy::from_config(&config.sql);
                    let embedder = optional_embedding_provider(&config).await;
                    let pipeline = embedder.map(|p| EmbeddingPipeline::new(p, store.clone(), 1000));
                    let report = sync_schema(&pool, &policy, store.as_ref(), pipeline.as_ref()).await?;
                    if let Some(ref pipeline) = pipeline {
                        pipeline.flush().await;
                    }
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                KnowledgeAction::Backfill => {
                    println!("Starting embedding backfill...");
                    let provider = create_embedding_provider(&config).await?;
                    let pipeline = EmbeddingPipeline::new(provider, store.clone(), 1000);
                    let count = backfill(store.as_ref(), &pipeline).await;
                    println!("Processed {} chunks.", count);
                    let stats = store.stats().await?;
                    println!("Current stats: {}", serde_json::to_string_pretty(&stats)?);
                }
                KnowledgeAction::Stats => {
                    let stats = store.stats().await?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
            }
        }

        None => {
            // Default: start the MCP server
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "rentql server starting");

            let pool = db::connect(&config.database_url, run_migrations).await?;
            tracing::info!("PostgreSQL pool initialized");

            let embedder = optional_embedding_provider(&config).await;
            let agent = build_agent(&config, pool, embedder).await?;

            // Embed chunks left pending by earlier runs without delaying the handshake
            if let Some(pipeline) = agent.pipeline().cloned() {
                let store = agent.knowledge().clone();
                tokio::spawn(async move {
                    let queued = backfill(store.as_ref(), &pipeline).await;
                    if queued > 0 {
                        tracing::info!(count = queued, "Startup backfill embedded pending chunks");
                    }
                });
            }

            let service = RentqlService::new(agent);

            let (stdin, stdout) = rmcp::transport::io::stdio();
            let server = service.serve((stdin, stdout)).await?;

            tracing::info!("rentql server running, awaiting tool calls via stdio");

            server.waiting().await?;

            tracing::info!("rentql server stopped");
        }
    }

    Ok(())
}
