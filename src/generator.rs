//! SQL generation
//!
//! Sends the rendered prompts to the completion model, cleans the raw
//! response into a single executable statement, and accounts for tokens.

use crate::config::{PipelineConfig, SamplingConfig};
use crate::error::{NlqError, Result};
use crate::llm::CompletionProvider;
use crate::prompt;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Where the SQL for a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlSource {
    Generated,
    CacheHit,
}

/// A generated statement together with its token cost.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub tokens_used: u32,
    pub source: SqlSource,
}

pub struct SqlGenerator {
    provider: Arc<dyn CompletionProvider>,
    sampling: SamplingConfig,
    prompt_overhead_chars: usize,
    chars_per_token: usize,
}

impl SqlGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            sampling: config.sampling.clone(),
            prompt_overhead_chars: config.prompt_overhead_chars,
            chars_per_token: config.chars_per_token,
        }
    }

    /// Generate SQL for a natural-language question. Returns the cleaned
    /// statement and the token cost: provider-reported counts when
    /// available, otherwise a length-based estimate.
    pub async fn generate(&self, system_prompt: &str, user_query: &str) -> Result<GeneratedSql> {
        let user_prompt = prompt::build_user_prompt(user_query);

        let completion = self
            .provider
            .complete(system_prompt, &user_prompt, &self.sampling)
            .await?;

        if completion.text.trim().is_empty() {
            return Err(NlqError::EmptyGeneration);
        }

        let tokens_used = match completion.usage {
            Some(usage) => usage.total,
            None => self.estimate_tokens(system_prompt, user_query, &completion.text),
        };

        let sql = cleanup(&completion.text);
        debug!(tokens_used, %sql, "SQL generated");

        Ok(GeneratedSql {
            sql,
            tokens_used,
            source: SqlSource::Generated,
        })
    }

    fn estimate_tokens(&self, system_prompt: &str, user_query: &str, response: &str) -> u32 {
        let chars = system_prompt.len() + user_query.len() + self.prompt_overhead_chars + response.len();
        (chars as f64 / self.chars_per_token as f64).ceil() as u32
    }
}

lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

/// Clean a raw model response into a single-line executable statement:
/// strip markdown fences, unescape literal escape sequences, collapse
/// whitespace runs, trim surrounding quotes, and terminate with a
/// semicolon. Applying it twice yields the same string.
pub fn cleanup(raw: &str) -> String {
    let without_fences = raw.replace("```sql", "").replace("```", "");
    let unescaped = unescape(&without_fences);
    let collapsed = WHITESPACE_RUN.replace_all(&unescaped, " ");
    let trimmed = collapsed
        .trim()
        .trim_matches(|c| c == '"' || c == '\'')
        .trim();

    if trimmed.is_empty() {
        return String::new();
    }

    let mut sql = trimmed.to_string();
    if !sql.ends_with(';') {
        sql.push(';');
    }
    sql
}

/// Turn literal `\n`, `\t`, `\r` sequences back into whitespace. Other
/// backslashes pass through unchanged.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n') => {
                    chars.next();
                    out.push('\n');
                }
                Some('t') => {
                    chars.next();
                    out.push('\t');
                }
                Some('r') => {
                    chars.next();
                    out.push('\r');
                }
                _ => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Completion, TokenUsage};
    use async_trait::async_trait;

    struct FixedCompletion {
        text: String,
        usage: Option<TokenUsage>,
    }

    #[async_trait]
    impl CompletionProvider for FixedCompletion {
        async fn complete(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _sampling: &SamplingConfig,
        ) -> Result<Completion> {
            Ok(Completion {
                text: self.text.clone(),
                usage: self.usage,
            })
        }
    }

    fn generator(text: &str, usage: Option<TokenUsage>) -> SqlGenerator {
        SqlGenerator::new(
            Arc::new(FixedCompletion {
                text: text.to_string(),
                usage,
            }),
            &PipelineConfig::default(),
        )
    }

    #[test]
    fn cleanup_strips_markdown_fences() {
        assert_eq!(
            cleanup("```sql\nSELECT 1\n```"),
            "SELECT 1;"
        );
    }

    #[test]
    fn cleanup_trims_quotes_and_appends_semicolon() {
        assert_eq!(cleanup("\"SELECT 1\""), "SELECT 1;");
        assert_eq!(cleanup("'SELECT 1;'"), "SELECT 1;");
    }

    #[test]
    fn cleanup_collapses_whitespace_and_unescapes() {
        assert_eq!(
            cleanup("SELECT\\n  p.Id\\tFROM   Participant p"),
            "SELECT p.Id FROM Participant p;"
        );
    }

    #[test]
    fn cleanup_is_idempotent() {
        let samples = [
            "```sql\nSELECT *\nFROM Participant\n```",
            "\"SELECT 1\"",
            "SELECT\\n1",
            "  SELECT   1  ;  ",
            "SELECT '\\\\n' FROM X",
            "",
            "   ",
        ];
        for raw in samples {
            let once = cleanup(raw);
            assert_eq!(cleanup(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[tokio::test]
    async fn empty_completion_is_an_error() {
        let generator = generator("   \n  ", None);
        let result = generator.generate("system", "query").await;
        assert!(matches!(result, Err(NlqError::EmptyGeneration)));
    }

    #[tokio::test]
    async fn provider_usage_takes_precedence() {
        let generator = generator(
            "SELECT 1",
            Some(TokenUsage {
                prompt: 100,
                completion: 20,
                total: 120,
            }),
        );
        let generated = generator.generate("system", "query").await.unwrap();
        assert_eq!(generated.tokens_used, 120);
    }

    #[tokio::test]
    async fn token_estimate_uses_length_heuristic() {
        let system_prompt = "s".repeat(100);
        let response = "SELECT 1";
        let query = "count rows";

        let generator = generator(response, None);
        let generated = generator.generate(&system_prompt, query).await.unwrap();

        let expected =
            ((100 + query.len() + 200 + response.len()) as f64 / 4.0).ceil() as u32;
        assert_eq!(generated.tokens_used, expected);
    }
}
