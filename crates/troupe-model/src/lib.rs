// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model client abstraction: one capability trait, three shapes (single
//! round, streaming round, agentic loop), two wire drivers, and scripted
//! mocks for deterministic tests.

mod anthropic;
mod client;
pub mod mock;
mod openai_compat;
mod stream;
mod types;

use std::sync::Arc;

use anyhow::bail;

pub use anthropic::AnthropicClient;
pub use client::{agentic_completion, ModelClient, AGENTIC_MAX_ROUNDS};
pub use openai_compat::OpenAiCompatClient;
pub use stream::RoundStream;
pub use types::*;

pub(crate) use types::Continuation;

/// Output-token ceiling used for implementation rounds, where agents write
/// whole files in one response.
pub const IMPLEMENTATION_MAX_TOKENS: u32 = 16_384;

/// Build a client from the team model configuration.
pub fn client_from_config(config: &troupe_config::ModelConfig) -> anyhow::Result<Arc<dyn ModelClient>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicClient::new(
            &config.base_url,
            &config.model,
            config.api_key.clone(),
        ))),
        "openai" | "ollama" => Ok(Arc::new(OpenAiCompatClient::new(
            &config.provider,
            &config.base_url,
            &config.model,
            config.api_key.clone(),
        ))),
        // Offline testing: base_url names a scripted-responses file.
        "mock" => Ok(Arc::new(mock::ScriptedClient::from_file(
            std::path::Path::new(&config.base_url),
        )?)),
        other => bail!("unknown model provider '{other}' (expected ollama, openai, or anthropic)"),
    }
}

/// Like [`client_from_config`] but with the output-token ceiling raised to
/// [`IMPLEMENTATION_MAX_TOKENS`] where the provider caps output explicitly.
pub fn implementation_client_from_config(
    config: &troupe_config::ModelConfig,
) -> anyhow::Result<Arc<dyn ModelClient>> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(
            AnthropicClient::new(&config.base_url, &config.model, config.api_key.clone())
                .with_max_tokens(IMPLEMENTATION_MAX_TOKENS),
        )),
        _ => client_from_config(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_config::ModelConfig;

    fn config(provider: &str) -> ModelConfig {
        ModelConfig {
            provider: provider.into(),
            base_url: "http://localhost:1234".into(),
            model: "m".into(),
            api_key: None,
        }
    }

    #[test]
    fn factory_builds_known_providers() {
        assert_eq!(client_from_config(&config("anthropic")).unwrap().name(), "anthropic");
        assert_eq!(client_from_config(&config("openai")).unwrap().name(), "openai");
        assert_eq!(client_from_config(&config("ollama")).unwrap().name(), "ollama");
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        assert!(client_from_config(&config("palm")).is_err());
    }
}
