use std::path::PathBuf;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::support::non_empty_env;

pub const INSECURE_DEFAULT_API_KEY: &str = "ClavePorDefectoNoSegura";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_BUCKET: &str = "images";
pub const DEFAULT_MATTING_MODEL: &str = "u2net";
pub const DEFAULT_REMBG_URL: &str = "http://127.0.0.1:7000";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_base: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
    pub bucket: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RembgConfig {
    pub url: String,
    pub model_name: String,
    pub concurrent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub api_key_secret: String,
    pub gemini: Option<GeminiConfig>,
    pub supabase: Option<SupabaseConfig>,
    pub rembg: RembgConfig,
    pub bind_addr: String,
    pub events_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Reads `.env` (when present) and then the process environment.
    pub fn from_env() -> Self {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = %path.display(), "loaded .env"),
            Err(err) if err.not_found() => {}
            Err(err) => warn!(error = %err, "failed to read .env"),
        }
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key_secret = lookup("API_KEY_SECRET").unwrap_or_else(|| {
            warn!("API_KEY_SECRET not set; using the insecure default key");
            INSECURE_DEFAULT_API_KEY.to_string()
        });

        let gemini = lookup("GEMINI_API_KEY")
            .or_else(|| lookup("GOOGLE_API_KEY"))
            .map(|api_key| GeminiConfig {
                api_key,
                api_base: lookup("GEMINI_API_BASE")
                    .map(|value| value.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
                model: lookup("GEMINI_IMAGE_MODEL")
                    .unwrap_or_else(|| DEFAULT_GEMINI_IMAGE_MODEL.to_string()),
            });

        let supabase = match (lookup("SUPABASE_URL"), lookup("SUPABASE_SERVICE_ROLE_KEY")) {
            (Some(url), Some(service_key)) => Some(SupabaseConfig {
                url,
                service_key,
                bucket: lookup("SUPABASE_BUCKET").unwrap_or_else(|| DEFAULT_BUCKET.to_string()),
            }),
            _ => None,
        };

        let rembg = RembgConfig {
            url: lookup("REMBG_URL").unwrap_or_else(|| DEFAULT_REMBG_URL.to_string()),
            model_name: lookup("MODEL_NAME").unwrap_or_else(|| DEFAULT_MATTING_MODEL.to_string()),
            concurrent: lookup("REMBG_CONCURRENT")
                .map(|value| parse_flag(&value))
                .unwrap_or(true),
        };

        Self {
            api_key_secret,
            gemini,
            supabase,
            rembg,
            bind_addr: lookup("CARVY_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            events_path: lookup("CARVY_EVENTS_PATH").map(PathBuf::from),
        }
    }

    pub fn require_gemini(&self) -> Result<&GeminiConfig> {
        match &self.gemini {
            Some(gemini) => Ok(gemini),
            None => bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set"),
        }
    }

    pub fn require_supabase(&self) -> Result<&SupabaseConfig> {
        match &self.supabase {
            Some(supabase) => Ok(supabase),
            None => bail!("SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY must both be set"),
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    !matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
