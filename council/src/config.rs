//! Configuration document, endpoint resolution, and IP auto-detection.
//!
//! The config is a single JSON document (`config.json`). Endpoint
//! resolution precedence is per-model fields, then global server
//! fields, then built-in defaults; an empty string means "inherit".

use serde::{Deserialize, Serialize};
use std::net::UdpSocket;
use std::path::Path;

use crate::error::{CouncilError, CouncilResult};

const DEFAULT_PORT: u16 = 11434;
const DEFAULT_RATING_MAX: f32 = 5.0;

fn default_rounds() -> u32 {
    1
}

fn default_max_rounds() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

/// Default refinement trigger: 30% of the 5-point rating scale.
fn default_quality_threshold() -> f32 {
    1.5
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_concurrent() -> usize {
    2
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_thinking_hints() -> Vec<String> {
    vec![
        "thinking".to_string(),
        "reasoning".to_string(),
        "o1".to_string(),
    ]
}

/// Global backend endpoint settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Full base URL (e.g. `http://192.168.1.10:11434/v1`). When set,
    /// wins over `ip_address`/`port`.
    #[serde(default)]
    pub api_base_url: String,
    /// Empty means auto-detect the primary local IPv4.
    #[serde(default)]
    pub ip_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_key: String,
}

/// One configured model with optional endpoint overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRef {
    pub id: String,
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub api_key: String,
}

impl ModelRef {
    pub fn plain(id: &str) -> Self {
        Self {
            id: id.to_string(),
            api_endpoint: String::new(),
            api_key: String::new(),
        }
    }
}

/// Council membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub chairman: ModelRef,
    pub council_members: Vec<ModelRef>,
}

/// Deliberation protocol knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationConfig {
    #[serde(default = "default_rounds")]
    pub rounds: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_true")]
    pub enable_cross_review: bool,
    /// Mean quality score below which a refinement sub-round triggers.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            max_rounds: default_max_rounds(),
            enable_cross_review: true,
            quality_threshold: default_quality_threshold(),
        }
    }
}

/// Background title generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Case-insensitive substrings marking a model as one that emits
    /// thinking content.
    #[serde(default = "default_thinking_hints")]
    pub thinking_model_hints: Vec<String>,
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: default_max_concurrent(),
            timeout_seconds: default_timeout_seconds(),
            retry_attempts: default_retry_attempts(),
            thinking_model_hints: default_thinking_hints(),
        }
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub models: ModelsConfig,
    #[serde(default)]
    pub deliberation: DeliberationConfig,
    #[serde(default)]
    pub title_generation: TitleConfig,
}

impl CouncilConfig {
    /// Load and validate a config document from disk.
    pub fn from_file(path: &Path) -> CouncilResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| CouncilError::ConfigInvalid {
            subject: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> CouncilResult<Self> {
        let config: Self = serde_json::from_str(raw).map_err(|e| CouncilError::ConfigInvalid {
            subject: "config.json".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation, run before any network I/O.
    pub fn validate(&self) -> CouncilResult<()> {
        if self.models.chairman.id.trim().is_empty() {
            return Err(CouncilError::ConfigInvalid {
                subject: "models.chairman".to_string(),
                reason: "chairman model id must not be empty".to_string(),
            });
        }
        if self.models.council_members.len() < 2 {
            return Err(CouncilError::ConfigInvalid {
                subject: "models.council_members".to_string(),
                reason: format!(
                    "need at least 2 council members, got {}",
                    self.models.council_members.len()
                ),
            });
        }
        if self
            .models
            .council_members
            .iter()
            .any(|m| m.id.trim().is_empty())
        {
            return Err(CouncilError::ConfigInvalid {
                subject: "models.council_members".to_string(),
                reason: "council member ids must not be empty".to_string(),
            });
        }

        let d = &self.deliberation;
        if !(1..=10).contains(&d.max_rounds) {
            return Err(CouncilError::ConfigInvalid {
                subject: "deliberation.max_rounds".to_string(),
                reason: format!("must be in [1, 10], got {}", d.max_rounds),
            });
        }
        if d.rounds < 1 || d.rounds > d.max_rounds {
            return Err(CouncilError::ConfigInvalid {
                subject: "deliberation.rounds".to_string(),
                reason: format!("must be in [1, {}], got {}", d.max_rounds, d.rounds),
            });
        }
        if !(0.0..=DEFAULT_RATING_MAX).contains(&d.quality_threshold) {
            return Err(CouncilError::ConfigInvalid {
                subject: "deliberation.quality_threshold".to_string(),
                reason: format!("must be in [0, 5], got {}", d.quality_threshold),
            });
        }

        if self.title_generation.max_concurrent == 0 {
            return Err(CouncilError::ConfigInvalid {
                subject: "title_generation.max_concurrent".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Ordered council model ids.
    pub fn council_ids(&self) -> Vec<String> {
        self.models
            .council_members
            .iter()
            .map(|m| m.id.clone())
            .collect()
    }

    /// Resolve the effective global base URL, auto-detecting the local
    /// IP when `ip_address` is empty.
    pub fn resolve_base_url(&self) -> String {
        if !self.server.api_base_url.trim().is_empty() {
            return self.server.api_base_url.trim_end_matches('/').to_string();
        }
        let ip = if self.server.ip_address.trim().is_empty() {
            detect_local_ipv4()
        } else {
            self.server.ip_address.clone()
        };
        format!("http://{}:{}/v1", ip, self.server.port)
    }

    /// Build the pure endpoint resolver for this config.
    pub fn endpoint_resolver(&self) -> EndpointResolver {
        EndpointResolver::new(self)
    }
}

/// Resolved connection parameters for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEndpoint {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Pure `(model_id, config) -> ModelEndpoint` resolution. The global
/// base URL (with IP detection already applied) is captured at
/// construction so repeated lookups stay deterministic.
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    global_base_url: String,
    global_api_key: String,
    overrides: Vec<ModelRef>,
}

impl EndpointResolver {
    pub fn new(config: &CouncilConfig) -> Self {
        let mut overrides = config.models.council_members.clone();
        overrides.push(config.models.chairman.clone());
        Self {
            global_base_url: config.resolve_base_url(),
            global_api_key: config.server.api_key.clone(),
            overrides,
        }
    }

    pub fn global_base_url(&self) -> &str {
        &self.global_base_url
    }

    /// Resolve per-model fields, falling back to globals. Empty
    /// strings inherit.
    pub fn resolve(&self, model_id: &str) -> ModelEndpoint {
        let found = self.overrides.iter().find(|m| m.id == model_id);

        let base_url = found
            .map(|m| m.api_endpoint.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| self.global_base_url.clone());

        let api_key = found
            .map(|m| m.api_key.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                let key = self.global_api_key.trim();
                (!key.is_empty()).then(|| key.to_string())
            });

        ModelEndpoint {
            model: model_id.to_string(),
            base_url,
            api_key,
        }
    }
}

/// Detect the primary local IPv4 by opening a UDP socket toward a
/// public address (no packets are sent). Falls back to loopback.
pub fn detect_local_ipv4() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            tracing::warn!("IP auto-detection failed, using loopback: {}", e);
            "127.0.0.1".to_string()
        }
    }
}
