//! HTTP server for the participant natural-language query API
//! Simple HTTP server using tokio and basic HTTP handling

use anyhow::{Context, Result};
use participant_nlq::config::PipelineConfig;
use participant_nlq::db::connection::init_pool;
use participant_nlq::error::NlqError;
use participant_nlq::executor::{PgDatastore, QueryExecutor};
use participant_nlq::generator::SqlGenerator;
use participant_nlq::llm::{EmbeddingProvider, OpenAiChatClient, OpenAiEmbedder};
use participant_nlq::pipeline::{NlqPipeline, QueryRequest};
use participant_nlq::schema_rag::{InMemorySchemaIndex, SchemaFragment, SchemaRetriever};
use participant_nlq::semantic_cache::SemanticSqlCache;
use participant_nlq::usage::{PgTokenLedger, TokenLedger};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let api_key = std::env::var("OPENAI_API_KEY")
        .context("OPENAI_API_KEY must be set")?;
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let bind_addr =
        std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let schema_file = std::env::var("SCHEMA_FILE")
        .unwrap_or_else(|_| "schema/participant_schema.json".to_string());
    let monthly_token_quota: i64 = std::env::var("MONTHLY_TOKEN_QUOTA")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1_000_000);

    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(OpenAiEmbedder::openai(api_key.clone()));
    let chat = Arc::new(OpenAiChatClient::openai(api_key));
    let config = PipelineConfig::default();

    info!("Loading schema fragments from {}", schema_file);
    let raw = std::fs::read_to_string(&schema_file)
        .with_context(|| format!("failed to read {}", schema_file))?;
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
    let ledger: Arc<dyn TokenLedger> =
        Arc::new(PgTokenLedger::new(pool.clone(), monthly_token_quota));

    let pipeline = Arc::new(NlqPipeline::new(
        SemanticSqlCache::new(embedder),
        SchemaRetriever::new(Arc::new(index), config.schema_top_k),
        SqlGenerator::new(chat, &config),
        QueryExecutor::new(Arc::new(PgDatastore::new(pool))),
        ledger,
        config,
    ));

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Server listening on {}", bind_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New connection from: {}", addr);
        let pipeline = pipeline.clone();
        tokio::spawn(handle_connection(stream, pipeline));
    }
}

async fn handle_connection(mut stream: TcpStream, pipeline: Arc<NlqPipeline>) {
    use tokio::time::{timeout, Duration};

    // Read request with timeout to prevent hanging
    let mut buffer = Vec::new();
    let mut temp_buf = [0; 8192];

    let read_result = timeout(Duration::from_secs(5), async {
        loop {
            match stream.read(&mut temp_buf).await {
                Ok(0) => break, // EOF
                Ok(n) => {
                    buffer.extend_from_slice(&temp_buf[..n]);
                    if let Ok(s) = std::str::from_utf8(&buffer) {
                        if let Some(headers_end) = s.find("\r\n\r\n") {
                            match extract_content_length(s) {
                                Some(content_length) => {
                                    if buffer.len() >= headers_end + 4 + content_length {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    if buffer.len() > 1_000_000 {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stream: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    })
    .await;

    if read_result.is_err() {
        warn!("Request read timeout");
        return;
    }

    if buffer.is_empty() {
        return;
    }

    let request = match String::from_utf8(buffer) {
        Ok(request) => request,
        Err(e) => {
            error!("Failed to parse request as UTF-8: {}", e);
            return;
        }
    };

    let response = handle_request(&request, &pipeline).await;
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

fn extract_content_length(request: &str) -> Option<usize> {
    for line in request.lines() {
        let lower = line.to_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            return value.trim().parse().ok();
        }
    }
    None
}

async fn handle_request(request: &str, pipeline: &NlqPipeline) -> String {
    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    match (method, path) {
        ("GET", "/health") => json_response(200, r#"{"status":"OK"}"#),
        ("POST", "/api/query/ask") | ("POST", "/api/Query/ask") => {
            let body = request
                .split_once("\r\n\r\n")
                .map(|(_, body)| body)
                .unwrap_or("");
            ask(body, pipeline).await
        }
        _ => json_response(404, r#"{"error":"Not found"}"#),
    }
}

async fn ask(body: &str, pipeline: &NlqPipeline) -> String {
    let query_request: QueryRequest = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            return json_response(400, &error_body(&format!("Invalid request body: {}", e)));
        }
    };

    match pipeline.ask(query_request).await {
        Ok(result) => match serde_json::to_string(&result) {
            Ok(json) => json_response(200, &json),
            Err(e) => {
                error!("Failed to serialize result: {}", e);
                json_response(500, &error_body("Internal serialization error"))
            }
        },
        Err(NlqError::Input(message)) => json_response(400, &error_body(&message)),
        Err(NlqError::Quota(message)) => json_response(406, &error_body(&message)),
        Err(err) => {
            error!("Error processing query: {}", err);
            json_response(500, &error_body(&format!("Error processing query: {}", err)))
        }
    }
}

fn error_body(message: &str) -> String {
    serde_json::json!({
        "success": false,
        "error": message,
    })
    .to_string()
}

fn json_response(status: u16, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        406 => "Not Acceptable",
        _ => "Internal Server Error",
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, status_text, body.len(), body
    )
}
