//! End-to-end pipeline tests with scripted providers and datastore.

use async_trait::async_trait;
use participant_nlq::config::{PipelineConfig, SamplingConfig};
use participant_nlq::error::{NlqError, Result};
use participant_nlq::executor::{Datastore, ExecutionError, QueryExecutor, SqlData};
use participant_nlq::generator::{SqlGenerator, SqlSource};
use participant_nlq::llm::{Completion, CompletionProvider, EmbeddingProvider};
use participant_nlq::pipeline::{NlqPipeline, QueryRequest};
use participant_nlq::schema_rag::{
    InMemorySchemaIndex, SchemaColumn, SchemaFragment, SchemaRetriever,
};
use participant_nlq::semantic_cache::SemanticSqlCache;
use participant_nlq::usage::InMemoryTokenLedger;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Embeds every query onto the same unit vector so that any two queries
/// look semantically identical to the cache.
struct ScriptedEmbedder {
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![1.0, 0.0, 0.0])
    }
}

/// Returns a fixed completion and remembers the last system prompt.
struct ScriptedCompletion {
    text: String,
    calls: AtomicUsize,
    last_system_prompt: Mutex<Option<String>>,
}

impl ScriptedCompletion {
    fn new(text: &str) -> Arc<Self> {
        Arc::new(Self {
            text: text.to_string(),
            calls: AtomicUsize::new(0),
            last_system_prompt: Mutex::new(None),
        })
    }

    fn system_prompt(&self) -> String {
        self.last_system_prompt.lock().unwrap().clone().unwrap()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedCompletion {
    async fn complete(
        &self,
        system_prompt: &str,
        _user_prompt: &str,
        _sampling: &SamplingConfig,
    ) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_system_prompt.lock().unwrap() = Some(system_prompt.to_string());
        Ok(Completion {
            text: self.text.clone(),
            usage: None,
        })
    }
}

struct ScriptedDatastore {
    fail_with: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedDatastore {
    fn rows() -> Arc<Self> {
        Arc::new(Self {
            fail_with: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(message.to_string()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Datastore for ScriptedDatastore {
    async fn execute(&self, _sql: &str) -> std::result::Result<SqlData, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(ExecutionError(message.clone()));
        }
        Ok(SqlData {
            rows: vec![serde_json::json!({
                "Id": 1,
                "FirstName": "Jane",
                "Interest": "Artificial Intelligence"
            })],
            columns: vec![
                "Id".to_string(),
                "FirstName".to_string(),
                "Interest".to_string(),
            ],
            error_message: None,
        })
    }
}

fn participant_fragment() -> SchemaFragment {
    SchemaFragment {
        table_name: "Participant".to_string(),
        description: String::new(),
        columns: vec![SchemaColumn {
            column_name: "Id".to_string(),
            data_type: "int".to_string(),
            is_primary_key: true,
            is_foreign_key: false,
            is_nullable: false,
            is_identity: true,
            description: "Unique participant identifier".to_string(),
            business_context: String::new(),
        }],
        relationships: Vec::new(),
    }
}

struct Harness {
    pipeline: NlqPipeline,
    embedder: Arc<ScriptedEmbedder>,
    completion: Arc<ScriptedCompletion>,
    datastore: Arc<ScriptedDatastore>,
    ledger: Arc<InMemoryTokenLedger>,
}

fn harness(
    sql: &str,
    datastore: Arc<ScriptedDatastore>,
    ledger: Arc<InMemoryTokenLedger>,
) -> Harness {
    let embedder = ScriptedEmbedder::new();
    let completion = ScriptedCompletion::new(sql);
    let config = PipelineConfig::default();

    let mut index = InMemorySchemaIndex::new(3);
    index
        .add_fragment(participant_fragment(), vec![1.0, 0.0, 0.0])
        .unwrap();

    let pipeline = NlqPipeline::new(
        SemanticSqlCache::new(embedder.clone()),
        SchemaRetriever::new(Arc::new(index), config.schema_top_k),
        SqlGenerator::new(completion.clone(), &config),
        QueryExecutor::new(datastore.clone()),
        ledger.clone(),
        config,
    );

    Harness {
        pipeline,
        embedder,
        completion,
        datastore,
        ledger,
    }
}

fn request(query: &str, event_id: i32) -> QueryRequest {
    QueryRequest {
        query: query.to_string(),
        application_id: 7,
        event_id,
        user_id: Some("user-1".to_string()),
        request_id: None,
    }
}

const GENERATED_SQL: &str =
    "SELECT p.Id, p.FirstName FROM Participant p WHERE p.IsDeleted = 0 AND p.ApplicationId = @ApplicationId";

#[tokio::test]
async fn unscoped_query_generates_executes_and_records_usage() {
    let h = harness(
        GENERATED_SQL,
        ScriptedDatastore::rows(),
        Arc::new(InMemoryTokenLedger::new()),
    );

    let result = h
        .pipeline
        .ask(request("Show all participants with AI interest", 0))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.source, Some(SqlSource::Generated));
    assert_eq!(result.data.len(), 1);
    assert_eq!(result.columns, vec!["Id", "FirstName", "Interest"]);
    assert!(result.generated_sql.unwrap().ends_with(';'));
    assert!(result.tokens_used > 0);

    // The event-join instruction is omitted when no event scope is given.
    let prompt = h.completion.system_prompt();
    assert!(!prompt.contains("YOU MUST join Participant"));
    assert!(prompt.contains("@ApplicationId = 7"));

    // Exactly one usage record for the terminal outcome.
    let events = h.ledger.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].tokens, result.tokens_used);
}

#[tokio::test]
async fn event_scoped_query_prompt_contains_mandatory_join() {
    let h = harness(
        GENERATED_SQL,
        ScriptedDatastore::rows(),
        Arc::new(InMemoryTokenLedger::new()),
    );

    h.pipeline
        .ask(request("Show all participants with AI interest", 42))
        .await
        .unwrap();

    let prompt = h.completion.system_prompt();
    assert!(prompt.contains("@EventId = 42"));
    assert!(prompt.contains("YOU MUST join Participant with Participant_ApplicationInstance"));
}

#[tokio::test]
async fn similar_query_hits_semantic_cache() {
    let h = harness(
        GENERATED_SQL,
        ScriptedDatastore::rows(),
        Arc::new(InMemoryTokenLedger::new()),
    );

    let first = h
        .pipeline
        .ask(request("Show all participants with AI interest", 0))
        .await
        .unwrap();
    let second = h
        .pipeline
        .ask(request("List participants interested in AI", 0))
        .await
        .unwrap();

    assert_eq!(first.source, Some(SqlSource::Generated));
    assert_eq!(second.source, Some(SqlSource::CacheHit));
    assert_eq!(second.generated_sql, first.generated_sql);
    assert_eq!(second.tokens_used, 0);

    // One completion call total; the second request reused the cached SQL.
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 1);
    // Both requests executed against the datastore.
    assert_eq!(h.datastore.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn quota_denial_short_circuits_before_any_provider_call() {
    let h = harness(
        GENERATED_SQL,
        ScriptedDatastore::rows(),
        Arc::new(InMemoryTokenLedger::denying("quota exhausted")),
    );

    let err = h
        .pipeline
        .ask(request("Show all participants", 0))
        .await
        .unwrap_err();

    assert!(matches!(err, NlqError::Quota(_)));
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 0);
    assert!(h.ledger.events().is_empty());
}

#[tokio::test]
async fn empty_query_is_rejected_without_provider_calls() {
    let h = harness(
        GENERATED_SQL,
        ScriptedDatastore::rows(),
        Arc::new(InMemoryTokenLedger::new()),
    );

    let err = h.pipeline.ask(request("   ", 0)).await.unwrap_err();

    assert!(matches!(err, NlqError::Input(_)));
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
    assert!(h.ledger.events().is_empty());
}

#[tokio::test]
async fn unsafe_sql_is_rejected_never_executed_never_cached() {
    let h = harness(
        "DROP TABLE Participant",
        ScriptedDatastore::rows(),
        Arc::new(InMemoryTokenLedger::new()),
    );

    let err = h
        .pipeline
        .ask(request("Show all participants", 0))
        .await
        .unwrap_err();

    assert!(matches!(err, NlqError::Validation(_)));
    assert_eq!(h.datastore.calls.load(Ordering::SeqCst), 0);

    // The failure is still recorded with the tokens spent so far.
    let events = h.ledger.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
    assert!(events[0].tokens > 0);

    // A repeat of the query generates again instead of hitting the cache.
    let _ = h.pipeline.ask(request("Show all participants", 0)).await;
    assert_eq!(h.completion.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn execution_failure_is_a_structured_outcome() {
    let h = harness(
        GENERATED_SQL,
        ScriptedDatastore::failing("Invalid column name 'Nope'"),
        Arc::new(InMemoryTokenLedger::new()),
    );

    let result = h
        .pipeline
        .ask(request("Show all participants", 0))
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.data.is_empty());
    assert_eq!(
        result.error.as_deref(),
        Some("Invalid column name 'Nope'")
    );

    let events = h.ledger.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].success);
}

#[tokio::test]
async fn token_estimate_matches_length_heuristic() {
    let h = harness(
        GENERATED_SQL,
        ScriptedDatastore::rows(),
        Arc::new(InMemoryTokenLedger::new()),
    );

    let query = "Show all participants with AI interest";
    let result = h.pipeline.ask(request(query, 0)).await.unwrap();

    let system_prompt = h.completion.system_prompt();
    let generation_estimate =
        ((system_prompt.len() + query.len() + 200 + GENERATED_SQL.len()) as f64 / 4.0).ceil()
            as u32;
    let embedding_estimate = (query.len() as f64 / 4.0).ceil() as u32;

    assert_eq!(result.tokens_used, generation_estimate + embedding_estimate);
}
