//! Pipeline configuration
//!
//! All tunables live in one immutable struct handed to the pipeline at
//! construction time. Nothing in here is read from globals after startup.

/// Sampling parameters sent to the completion model.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub max_tokens: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        // Low temperature keeps SQL generation consistent across calls.
        Self {
            temperature: 0.1,
            top_p: 0.95,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: 500,
        }
    }
}

/// Immutable configuration for the natural-language query pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum cosine similarity for a semantic cache hit.
    pub similarity_threshold: f32,

    /// How many schema fragments to retrieve per query.
    pub schema_top_k: usize,

    /// Fixed character overhead added to the token estimate for message
    /// framing the provider does not report back.
    pub prompt_overhead_chars: usize,

    /// Characters per token used by the fallback token estimate.
    pub chars_per_token: usize,

    pub sampling: SamplingConfig,

    /// When set, generated SQL must reference the tenant filter parameter
    /// or it is rejected. Off by default: the filter is otherwise enforced
    /// through the prompt only.
    pub enforce_tenant_scope: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            schema_top_k: 5,
            prompt_overhead_chars: 200,
            chars_per_token: 4,
            sampling: SamplingConfig::default(),
            enforce_tenant_scope: false,
        }
    }
}
