//! Provider selection from the effective settings.
//!
//! Copilot variants are picked by the `provider` key; everything else is
//! selected by an endpoint substring heuristic. All failures here are
//! construction-time sentinels, raised before any HTTP traffic.

use std::path::Path;
use std::sync::Arc;

use crate::config::{self, Settings};
use crate::llm::anthropic::AnthropicProvider;
use crate::llm::copilot::CopilotProvider;
use crate::llm::copilot_auth::{self, copilot_base_url};
use crate::llm::debug::DebugRecorder;
use crate::llm::gemini::GeminiProvider;
use crate::llm::openai::OpenAiProvider;
use crate::llm::provider::{Provider, ProviderError};

/// Model used for Copilot when the settings leave it unset.
const COPILOT_DEFAULT_MODEL: &str = "gpt-5-mini";

pub fn resolve(
    settings: &Settings,
    base_dir: &Path,
    debug: Option<Arc<DebugRecorder>>,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider = settings.get("provider").map(String::as_str).unwrap_or("");

    if provider == "github-copilot" || provider == "github-copilot-enterprise" {
        return resolve_copilot(settings, base_dir, provider == "github-copilot-enterprise", debug);
    }

    let endpoint = settings
        .get("endpoint")
        .filter(|v| !v.is_empty())
        .ok_or(ProviderError::NoProvider)?;
    let api_key = config::api_key(settings).ok_or(ProviderError::AuthRequired)?;
    let model = settings
        .get("model")
        .filter(|v| !v.is_empty())
        .ok_or(ProviderError::ModelRequired)?;

    let provider: Arc<dyn Provider> = if endpoint.contains("anthropic") {
        Arc::new(AnthropicProvider::new(
            endpoint.clone(),
            api_key.to_string(),
            model.clone(),
            debug,
        ))
    } else if endpoint.contains("generativelanguage.googleapis.com") {
        Arc::new(GeminiProvider::new(
            endpoint.clone(),
            api_key.to_string(),
            model.clone(),
            debug,
        ))
    } else {
        Arc::new(OpenAiProvider::new(
            endpoint.clone(),
            api_key.to_string(),
            model.clone(),
            debug,
        ))
    };
    Ok(provider)
}

fn resolve_copilot(
    settings: &Settings,
    base_dir: &Path,
    enterprise: bool,
    debug: Option<Arc<DebugRecorder>>,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let token = config::api_key(settings)
        .map(str::to_string)
        .or_else(|| {
            settings
                .get("copilot-token")
                .filter(|v| !v.is_empty())
                .cloned()
        })
        .or_else(|| copilot_auth::load_token(base_dir))
        .ok_or_else(|| {
            ProviderError::Config(
                "GitHub Copilot token required (run `rai copilot-login`)".to_string(),
            )
        })?;

    let domain = if enterprise {
        settings
            .get("enterprise-url")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ProviderError::Config(
                    "enterprise-url required for github-copilot-enterprise".to_string(),
                )
            })?
            .clone()
    } else {
        String::new()
    };

    let model = settings
        .get("model")
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| COPILOT_DEFAULT_MODEL.to_string());

    Ok(Arc::new(CopilotProvider::new(
        copilot_base_url(&domain),
        token,
        model,
        enterprise,
        debug,
    )))
}
