use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Immutable record of one AI provider call.
///
/// Provider and model identifiers may be duplicated across the top-level
/// fields and the request/response provider-specific maps; consumers probe
/// them through [`TaggedSources`] rather than ad hoc map access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmTrace {
    pub trace_id: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub request: TraceRequest,
    pub response: Option<TraceResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceRequest {
    pub messages: Vec<TraceMessage>,
    pub parameters: TraceParameters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceMessage {
    pub role: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceParameters {
    pub provider_specific: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceResponse {
    pub message: Option<TraceMessage>,
    pub metadata: TraceMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceMetadata {
    pub token_usage: Option<TokenUsage>,
    pub provider_specific: Map<String, Value>,
}

/// Real usage metadata reported by the provider, when present.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub input_token_count: Option<i32>,
    pub output_token_count: Option<i32>,
}

impl LlmTrace {
    pub fn response_token_usage(&self) -> Option<&TokenUsage> {
        self.response.as_ref()?.metadata.token_usage.as_ref()
    }

    pub fn response_content(&self) -> Option<&str> {
        self.response.as_ref()?.message.as_ref()?.content.as_deref()
    }

    pub fn request_provider_specific(&self, key: &str) -> Option<&str> {
        self.request.parameters.provider_specific.get(key)?.as_str()
    }

    pub fn response_provider_specific(&self, key: &str) -> Option<&str> {
        self.response
            .as_ref()?
            .metadata
            .provider_specific
            .get(key)?
            .as_str()
    }
}

/// Ordered list of named value sources; the first non-blank entry wins.
///
/// Replaces loosely structured map digging with one explicit probe order.
#[derive(Debug, Default)]
pub struct TaggedSources<'a> {
    sources: Vec<(&'static str, Option<&'a str>)>,
}

impl<'a> TaggedSources<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, name: &'static str, value: Option<&'a str>) -> Self {
        self.sources.push((name, value));
        self
    }

    /// First source whose value is present and non-blank.
    pub fn resolve(&self) -> Option<(&'static str, &'a str)> {
        self.sources
            .iter()
            .find_map(|(name, value)| match value {
                Some(v) if !v.trim().is_empty() => Some((*name, *v)),
                _ => None,
            })
    }
}
