//! Environment-driven configuration for the built-in adapters. Values land in
//! `ProviderOptions::extra_options` under the keys each adapter reads.

use serde_json::{json, Map, Value};

use crate::providers::base::ProviderOptions;

/// Load `.env` if present, then fill `options.extra_options` from the
/// environment for the named provider. Explicitly set options win over the
/// environment.
pub fn load_provider_env(provider: &str, mut options: ProviderOptions) -> ProviderOptions {
    let _ = dotenv::dotenv();
    for (key, env_var) in env_keys(provider) {
        if options.extra_options.contains_key(*key) {
            continue;
        }
        if let Ok(value) = std::env::var(env_var) {
            options
                .extra_options
                .insert(key.to_string(), env_value(key, &value));
        }
    }
    options
}

fn env_keys(provider: &str) -> &'static [(&'static str, &'static str)] {
    match provider {
        "anthropic" => &[
            ("api_key", "ANTHROPIC_API_KEY"),
            ("anthropic_host", "ANTHROPIC_HOST"),
        ],
        "openai" => &[
            ("api_key", "OPENAI_API_KEY"),
            ("base_url", "OPENAI_BASE_URL"),
            ("endpoint", "OPENAI_ENDPOINT"),
            ("tool_choice", "OPENAI_TOOL_CHOICE"),
            ("timeout", "OPENAI_TIMEOUT"),
            ("response_format", "OPENAI_RESPONSE_FORMAT"),
        ],
        _ => &[],
    }
}

fn env_value(key: &str, raw: &str) -> Value {
    match key {
        "timeout" => raw
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| json!(raw)),
        "response_format" => serde_json::from_str(raw).unwrap_or_else(|_| json!(raw)),
        _ => json!(raw),
    }
}

/// Convenience for hosts that build options by hand.
pub fn extra_options_from_pairs<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value))
        .collect()
}
