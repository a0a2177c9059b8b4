//! Startup validation against the model backend.
//!
//! Fetches `/v1/models`, falls back to loopback when an auto-detected
//! or configured IP is unreachable, and fails fast when the fleet is
//! too small or a configured model is missing.

use tracing::{info, warn};

use crate::client::ChatBackend;
use crate::config::CouncilConfig;
use crate::error::{CouncilError, CouncilResult};

/// Startup exit codes.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_INVALID: i32 = 1;
pub const EXIT_BACKEND_UNREACHABLE: i32 = 2;
pub const EXIT_MODELS_MISSING: i32 = 3;

/// Minimum fleet size on the backend, independent of configuration.
const MIN_FLEET: usize = 3;

/// Successful validation outcome.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    /// Base URL that actually answered (may be the loopback fallback).
    pub base_url: String,
    /// Model ids loaded on the backend.
    pub available: Vec<String>,
}

/// Map a startup failure to its process exit code.
pub fn exit_code_for(error: &CouncilError) -> i32 {
    match error {
        CouncilError::ConfigInvalid { .. } => EXIT_CONFIG_INVALID,
        CouncilError::BackendUnreachable { .. } | CouncilError::Timeout { .. } => {
            EXIT_BACKEND_UNREACHABLE
        }
        CouncilError::ModelNotLoaded(_) => EXIT_MODELS_MISSING,
        _ => EXIT_CONFIG_INVALID,
    }
}

/// Remediation hint printed next to a startup failure.
pub fn remediation_hint(error: &CouncilError) -> &'static str {
    match error {
        CouncilError::ConfigInvalid { .. } => "fix the named key in config.json",
        CouncilError::BackendUnreachable { .. } | CouncilError::Timeout { .. } => {
            "check that the model server is running and reachable at the configured address"
        }
        CouncilError::ModelNotLoaded(_) => {
            "load the missing model in the server or correct its id in config.json"
        }
        _ => "see the error message above",
    }
}

/// Run the full startup validation.
pub async fn validate_startup(
    backend: &dyn ChatBackend,
    config: &CouncilConfig,
) -> CouncilResult<ValidationReport> {
    config.validate()?;

    let base_url = config.resolve_base_url();
    let (base_url, available) = match backend.list_models(&base_url).await {
        Ok(models) => (base_url, models),
        Err(first_error) => match loopback_fallback(config, &base_url) {
            Some(fallback) => {
                warn!(
                    "backend unreachable at {} ({}), trying loopback",
                    base_url, first_error
                );
                let models = backend.list_models(&fallback).await.map_err(|_| first_error)?;
                (fallback, models)
            }
            None => return Err(first_error),
        },
    };

    info!(count = available.len(), url = %base_url, "model list fetched");
    for model in &available {
        info!("  loaded: {}", model);
    }

    if available.len() < MIN_FLEET {
        return Err(CouncilError::ModelNotLoaded(format!(
            "only {} models loaded, need at least {}",
            available.len(),
            MIN_FLEET
        )));
    }

    let council = config.council_ids();
    if available.len() < council.len() + 1 {
        return Err(CouncilError::ModelNotLoaded(format!(
            "{} models loaded, need at least {} (council of {} plus chairman)",
            available.len(),
            council.len() + 1,
            council.len()
        )));
    }

    let mut required = council;
    required.push(config.models.chairman.id.clone());
    let missing: Vec<String> = required
        .iter()
        .filter(|id| !available.contains(id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(CouncilError::ModelNotLoaded(missing.join(", ")));
    }

    info!("all configured models are loaded");
    Ok(ValidationReport {
        base_url,
        available,
    })
}

/// Loopback fallback applies only when the base URL was built from an
/// IP (configured or auto-detected), never over an explicit
/// `api_base_url`.
fn loopback_fallback(config: &CouncilConfig, current: &str) -> Option<String> {
    if !config.server.api_base_url.trim().is_empty() {
        return None;
    }
    let fallback = format!("http://127.0.0.1:{}/v1", config.server.port);
    (fallback != current).then_some(fallback)
}
