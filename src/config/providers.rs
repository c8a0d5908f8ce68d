//! Provider registry: API-key environment variables and chat endpoints.

use zeroize::Zeroizing;

/// Providers with a known key variable and OpenAI-compatible endpoint.
pub const KNOWN_PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "gemini",
    "groq",
    "cerebras",
    "xai",
    "openrouter",
    "mistral",
];

/// Environment variable holding the API key for `provider`.
pub fn key_env_var(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "gemini" => Some("GEMINI_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "cerebras" => Some("CEREBRAS_API_KEY"),
        "xai" => Some("XAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        _ => None,
    }
}

/// Base URL of the provider's OpenAI-compatible chat-completions API.
pub fn provider_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "anthropic" => Some("https://api.anthropic.com/v1"),
        "gemini" => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        "cerebras" => Some("https://api.cerebras.ai/v1"),
        "xai" => Some("https://api.x.ai/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "mistral" => Some("https://api.mistral.ai/v1"),
        _ => None,
    }
}

/// Read the provider's key variable and delete it from the process
/// environment, so the secret survives only in memory.
pub fn consume_env_key(provider: &str) -> Option<Zeroizing<String>> {
    let var = key_env_var(provider)?;
    let value = std::env::var(var).ok().filter(|v| !v.is_empty())?;
    // SAFETY: called during single-threaded agent-server startup, before any
    // other thread can be reading the environment.
    unsafe { std::env::remove_var(var) };
    Some(Zeroizing::new(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_providers_have_key_vars() {
        for provider in KNOWN_PROVIDERS {
            assert!(
                key_env_var(provider).is_some(),
                "provider {provider} should map to a key variable"
            );
        }
    }

    #[test]
    fn unknown_provider_has_no_key_var() {
        assert!(key_env_var("example").is_none());
    }

    #[test]
    fn consume_env_key_removes_variable() {
        // Use a provider unlikely to be configured in the test environment.
        // SAFETY: no other test in this crate touches CEREBRAS_API_KEY.
        unsafe { std::env::set_var("CEREBRAS_API_KEY", "sk-test-123") };
        let key = consume_env_key("cerebras").unwrap();
        assert_eq!(key.as_str(), "sk-test-123");
        assert!(
            std::env::var("CEREBRAS_API_KEY").is_err(),
            "variable should be deleted after consumption"
        );
    }
}
