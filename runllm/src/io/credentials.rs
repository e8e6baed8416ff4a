//! Provider credential checks performed before any model call.

use std::collections::HashMap;

use crate::error::{ErrorCode, ErrorPayload, RunResult};

/// Credential a model identifier needs: provider name and environment variable.
pub fn required_credential(model: &str) -> Option<(&'static str, &'static str)> {
    let lowered = model.to_ascii_lowercase();
    let table: [(&[&str], &str, &str); 5] = [
        (&["openai/"], "openai", "OPENAI_API_KEY"),
        (&["anthropic/"], "anthropic", "ANTHROPIC_API_KEY"),
        (&["google/", "gemini/"], "google", "GOOGLE_API_KEY"),
        (&["mistral/"], "mistral", "MISTRAL_API_KEY"),
        (&["cohere/"], "cohere", "COHERE_API_KEY"),
    ];
    table
        .into_iter()
        .find(|(prefixes, _, _)| prefixes.iter().any(|p| lowered.starts_with(p)))
        .map(|(_, provider, key)| (provider, key))
}

/// Where credential values come from.
pub trait CredentialSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed credential set, mostly for tests.
#[derive(Debug, Default, Clone)]
pub struct StaticCredentials(pub HashMap<String, String>);

impl StaticCredentials {
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Fail with `missing-credential` when `model`'s provider key is unset or blank.
pub fn ensure_credentials(model: &str, source: &dyn CredentialSource) -> RunResult<()> {
    let Some((provider, key)) = required_credential(model) else {
        return Ok(());
    };
    if source.get(key).is_some_and(|value| !value.trim().is_empty()) {
        return Ok(());
    }
    Err(ErrorPayload::new(
        ErrorCode::MissingCredential,
        format!("{key} is required for model '{model}'"),
    )
    .with_detail("provider", provider)
    .with_detail("missing_env_var", key)
    .with_detail("model", model)
    .with_hint(format!("Export {key} in the environment, then retry."))
    .into())
}
