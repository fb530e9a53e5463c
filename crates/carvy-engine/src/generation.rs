//! Text-to-image generation: studio prompt in, raw image bytes out.

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use carvy_contracts::prompts::{build_studio_prompt, STUDIO_PROMPT_TEMPLATE_VERSION};
use carvy_contracts::VehicleImageRequest;
use image::{ImageFormat, Rgba, RgbaImage};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::config::GeminiConfig;
use crate::error::GenerateError;
use crate::support::{error_chain_text, response_json_or_error, untimed_http_client};

const API_KEY_HEADER: &str = "x-goog-api-key";

pub const EMPTY_RESPONSE_MESSAGE: &str = "empty or unexpected response from generation backend";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Inline { mime_type: String, data: Vec<u8> },
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResponse {
    pub parts: Vec<ContentPart>,
    pub block_reason: Option<String>,
}

pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate_parts(&self, prompt: &str) -> Result<GenerationResponse, GenerateError>;
}

/// Builds the studio prompt and pulls the image out of the backend reply.
#[derive(Clone)]
pub struct GenerationClient {
    generator: Arc<dyn ImageGenerator>,
}

impl GenerationClient {
    pub fn new(generator: Arc<dyn ImageGenerator>) -> Self {
        Self { generator }
    }

    pub fn backend_name(&self) -> &str {
        self.generator.name()
    }

    pub fn generate(&self, request: &VehicleImageRequest) -> Result<Vec<u8>, GenerateError> {
        info!(
            make = %request.make,
            model = %request.model,
            year = request.year,
            color = request.color().unwrap_or("-"),
            body_type = request.body_type().unwrap_or("-"),
            background = request.background_color_name().unwrap_or("-"),
            template_version = STUDIO_PROMPT_TEMPLATE_VERSION,
            backend = self.generator.name(),
            "generating vehicle image"
        );
        let prompt = build_studio_prompt(request);
        debug!(%prompt, "studio prompt");

        let response = self.generator.generate_parts(&prompt)?;
        match extract_first_image(response) {
            Ok(bytes) => {
                info!(bytes = bytes.len(), "generation backend returned image");
                Ok(bytes)
            }
            Err(err) => {
                error!(error = %err, "generation backend returned no image");
                Err(err)
            }
        }
    }
}

/// First `image/*` part wins; otherwise the collected text becomes the
/// diagnostic.
pub fn extract_first_image(response: GenerationResponse) -> Result<Vec<u8>, GenerateError> {
    if response.parts.is_empty() {
        let diagnostic = match response.block_reason {
            Some(reason) => format!("{EMPTY_RESPONSE_MESSAGE} (block reason: {reason})"),
            None => EMPTY_RESPONSE_MESSAGE.to_string(),
        };
        return Err(GenerateError::NoImage { diagnostic });
    }

    let mut text: Option<String> = None;
    for part in response.parts {
        match part {
            ContentPart::Inline { mime_type, data } if mime_type.starts_with("image/") => {
                return Ok(data);
            }
            ContentPart::Inline { .. } => {}
            ContentPart::Text(chunk) => text.get_or_insert_with(String::new).push_str(&chunk),
        }
    }
    let diagnostic = text.unwrap_or_else(|| EMPTY_RESPONSE_MESSAGE.to_string());
    Err(GenerateError::NoImage { diagnostic })
}

pub struct GeminiGenerator {
    config: GeminiConfig,
    http: HttpClient,
}

impl GeminiGenerator {
    pub fn new(config: GeminiConfig) -> anyhow::Result<Self> {
        Ok(Self {
            config,
            http: untimed_http_client()?,
        })
    }

    fn endpoint(&self) -> String {
        let trimmed = self.config.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.config.api_base, model_path)
    }

    fn payload(prompt: &str) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": prompt }],
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
            },
        })
    }

    fn post(&self, prompt: &str) -> anyhow::Result<Value> {
        let endpoint = self.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .header(API_KEY_HEADER, self.config.api_key.as_str())
            .json(&Self::payload(prompt))
            .send()
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("Gemini request failed ({endpoint})"))?;
        response_json_or_error("Gemini", response)
    }
}

impl ImageGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate_parts(&self, prompt: &str) -> Result<GenerationResponse, GenerateError> {
        let payload = self
            .post(prompt)
            .map_err(|err| GenerateError::Backend(error_chain_text(&err, 512)))?;
        parse_gemini_response(&payload)
    }
}

/// Reads the first candidate's parts, stopping after the first image part.
pub fn parse_gemini_response(payload: &Value) -> Result<GenerationResponse, GenerateError> {
    let block_reason = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let parts = payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for part in parts {
        if let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        {
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if !mime_type.starts_with("image/") {
                continue;
            }
            let encoded = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            let data = BASE64.decode(encoded.as_bytes()).map_err(|err| {
                GenerateError::Backend(format!("Gemini image base64 decode failed: {err}"))
            })?;
            out.push(ContentPart::Inline { mime_type, data });
            break;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push(ContentPart::Text(text.to_string()));
        }
    }

    Ok(GenerationResponse {
        parts: out,
        block_reason,
    })
}

/// Offline generator: a flat studio backdrop with a prompt-colored body.
pub struct DryrunGenerator {
    width: u32,
    height: u32,
}

impl DryrunGenerator {
    pub const BACKDROP: [u8; 3] = [211, 211, 211];

    pub fn new() -> Self {
        Self {
            width: 256,
            height: 160,
        }
    }
}

impl Default for DryrunGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate_parts(&self, prompt: &str) -> Result<GenerationResponse, GenerateError> {
        let (r, g, b) = color_from_prompt(prompt);
        let [br, bg, bb] = Self::BACKDROP;
        let (w, h) = (self.width, self.height);
        let image = RgbaImage::from_fn(w, h, |x, y| {
            let inside = x >= w / 20 && x < w - w / 20 && y >= h / 3 && y < h - h / 6;
            if inside {
                Rgba([r, g, b, 255])
            } else {
                Rgba([br, bg, bb, 255])
            }
        });
        let mut buffer = Cursor::new(Vec::new());
        image
            .write_to(&mut buffer, ImageFormat::Png)
            .map_err(|err| GenerateError::Backend(format!("dryrun encode failed: {err}")))?;
        Ok(GenerationResponse {
            parts: vec![
                ContentPart::Text("dryrun render".to_string()),
                ContentPart::Inline {
                    mime_type: "image/png".to_string(),
                    data: buffer.into_inner(),
                },
            ],
            block_reason: None,
        })
    }
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    let digest = hasher.finalize();
    // keep the body away from the backdrop gray
    (digest[0] / 2, digest[1] / 2, digest[2] / 2)
}
