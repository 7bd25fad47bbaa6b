use anyhow::{Context, Result};
use clap::Parser;
use participant_nlq::config::PipelineConfig;
use participant_nlq::db::connection::init_pool;
use participant_nlq::executor::{PgDatastore, QueryExecutor};
use participant_nlq::generator::SqlGenerator;
use participant_nlq::llm::{EmbeddingProvider, OpenAiChatClient, OpenAiEmbedder};
use participant_nlq::pipeline::{NlqPipeline, QueryRequest};
use participant_nlq::schema_rag::{InMemorySchemaIndex, SchemaFragment, SchemaRetriever};
use participant_nlq::semantic_cache::SemanticSqlCache;
use participant_nlq::usage::{PgTokenLedger, TokenLedger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "participant-nlq")]
#[command(about = "Natural-language query engine for participant data")]
struct Args {
    /// The question in natural language
    query: String,

    /// Tenant (application) the query is scoped to
    #[arg(long, default_value_t = 1)]
    application_id: i32,

    /// Event scope; 0 means no event scoping
    #[arg(long, default_value_t = 0)]
    event_id: i32,

    /// Path to the schema fragments file
    #[arg(long, default_value = "schema/participant_schema.json")]
    schema_file: PathBuf,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let api_key = args
        .api_key
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .context("OpenAI API key required (--api-key or OPENAI_API_KEY)")?;
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let monthly_token_quota: i64 = std::env::var("MONTHLY_TOKEN_QUOTA")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1_000_000);

    info!("Query: {}", args.query);

    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbedder::openai(api_key.clone()));
    let chat = Arc::new(OpenAiChatClient::openai(api_key));
    let config = PipelineConfig::default();

    // Build the schema index from the fragments file.
    let raw = std::fs::read_to_string(&args.schema_file)
        .with_context(|| format!("failed to read {}", args.schema_file.display()))?;
    let fragments: Vec<SchemaFragment> = serde_json::from_str(&raw)?;

    let mut index: Option<InMemorySchemaIndex> = None;
    for fragment in fragments {
        let embedding = embedder.embed(&fragment.embedding_text()).await?;
        let index = index.get_or_insert_with(|| InMemorySchemaIndex::new(embedding.len()));
        index.add_fragment(fragment, embedding)?;
    }
    let index = index.context("schema fragments file is empty")?;
    info!("Schema index ready ({} fragments)", index.len());

    let pool = init_pool(&database_url).await?;
    let ledger: Arc<dyn TokenLedger> = Arc::new(PgTokenLedger::new(pool.clone(), monthly_token_quota));

    let pipeline = NlqPipeline::new(
        SemanticSqlCache::new(embedder),
        SchemaRetriever::new(Arc::new(index), config.schema_top_k),
        SqlGenerator::new(chat, &config),
        QueryExecutor::new(Arc::new(PgDatastore::new(pool))),
        ledger,
        config,
    );

    let result = pipeline
        .ask(QueryRequest {
            query: args.query,
            application_id: args.application_id,
            event_id: args.event_id,
            user_id: None,
            request_id: None,
        })
        .await?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
