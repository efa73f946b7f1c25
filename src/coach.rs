//! VCoach chat and food analysis
//!
//! Talks to a Gemini-style `generateContent` backend. A [`CoachSession`] is
//! an owned value: the caller starts it with the patient's context, keeps
//! it for the life of the conversation and ends it by dropping or calling
//! [`CoachSession::end`]. Chat failures never surface as errors; the
//! patient gets a fallback reply and the failure is logged.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{load_or, load_url, ConfigError};
use crate::models::{MobileProfile, Session};

/// ---------------------------------------------------------------------------
/// Configuration
/// ---------------------------------------------------------------------------

const DEFAULT_COACH_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_COACH_MODEL: &str = "gemini-3-flash-preview";
const TEMPERATURE: f32 = 0.7;

const NO_REPLY: &str = "No tengo respuesta en este momento.";
const CONNECTION_FAILED: &str = "Error al conectar con VCoach.";

const FOOD_PROMPT: &str = "Analiza esta comida para una dieta antienvejecimiento. Devuelve JSON: \
productName, recommendation, reasoning, macros, inflammatoryIngredients.";

#[derive(Debug, Clone, PartialEq)]
pub struct CoachConfig {
  pub api_url: String,
  /// Without a key every chat turn gets the fallback reply
  pub api_key: Option<String>,
  pub model: String,
}

impl Default for CoachConfig {
  fn default() -> Self {
    Self {
      api_url: DEFAULT_COACH_API_URL.to_string(),
      api_key: None,
      model: DEFAULT_COACH_MODEL.to_string(),
    }
  }
}

impl CoachConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    let api_key = std::env::var("COACH_API_KEY")
      .ok()
      .filter(|k| !k.trim().is_empty());
    if api_key.is_none() {
      info!("COACH_API_KEY not set, VCoach will reply with fallbacks");
    }

    Ok(Self {
      api_url: load_url("COACH_API_URL", DEFAULT_COACH_API_URL)?,
      api_key,
      model: load_or("COACH_MODEL", DEFAULT_COACH_MODEL),
    })
  }

  fn endpoint(&self) -> String {
    format!("{}/models/{}:generateContent", self.api_url, self.model)
  }
}

/// ---------------------------------------------------------------------------
/// Error Types
/// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CoachError {
  #[error("API key not configured")]
  MissingApiKey,

  #[error("Request failed: {0}")]
  Request(#[from] reqwest::Error),

  #[error("API error: {0}")]
  Api(String),

  #[error("Parse error: {0}")]
  Parse(String),
}

/// ---------------------------------------------------------------------------
/// Wire Types
/// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  text: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  inline_data: Option<InlineData>,
}

impl Part {
  fn text(text: impl Into<String>) -> Self {
    Self {
      text: Some(text.into()),
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
  mime_type: String,
  data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  role: Option<String>,
  parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
  #[serde(skip_serializing_if = "Option::is_none")]
  system_instruction: Option<Content>,
  contents: Vec<Content>,
  generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
  #[serde(skip_serializing_if = "Option::is_none")]
  temperature: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
  #[serde(default)]
  candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
  content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
  error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
  message: String,
}

/// ---------------------------------------------------------------------------
/// Patient Context
/// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientContext {
  pub name: Option<String>,
  pub chronological_age: Option<f64>,
  pub biological_age: Option<f64>,
  pub blood_type: Option<String>,
}

impl PatientContext {
  pub fn from_profile(session: &Session, profile: &MobileProfile) -> Self {
    Self {
      name: Some(session.name.clone()).filter(|n| !n.is_empty()),
      chronological_age: profile.chronological_age,
      biological_age: profile.biological_age,
      blood_type: profile.blood_type.clone(),
    }
  }

  fn vitality_note(&self) -> String {
    let (Some(chronological), Some(biological)) = (self.chronological_age, self.biological_age) else {
      return String::new();
    };

    let years = (chronological - biological).round() as i64;
    match years {
      y if y > 0 => format!("(+{} años de vitalidad)", y),
      y if y < 0 => format!("(necesita {} años de rejuvenecimiento)", y.abs()),
      _ => String::new(),
    }
  }
}

fn format_age(age: Option<f64>) -> String {
  age.map(|a| format!("{:.0}", a)).unwrap_or_else(|| "?".to_string())
}

pub fn system_instruction(context: Option<&PatientContext>) -> String {
  let Some(ctx) = context else {
    return "Eres VCoach, asistente médico de Rejuvenate.\n\
Ayudas a pacientes a reducir su edad biológica mediante las 5A Claves y Terapias 4R.\n\
Responde de forma concisa y profesional en español."
      .to_string();
  };

  let mut ages = format!(
    "{} tiene {} años cronológicos y una edad biológica de {}",
    ctx.name.as_deref().unwrap_or("El paciente"),
    format_age(ctx.chronological_age),
    format_age(ctx.biological_age),
  );
  let note = ctx.vitality_note();
  if !note.is_empty() {
    ages.push(' ');
    ages.push_str(&note);
  }
  ages.push('.');

  let mut lines = vec![
    format!(
      "Eres VCoach, asistente médico personalizado de {}.",
      ctx.name.as_deref().unwrap_or("este paciente")
    ),
    ages,
  ];
  if let Some(blood_type) = &ctx.blood_type {
    lines.push(format!("Su grupo sanguíneo es {}.", blood_type));
  }
  lines.push(String::new());
  lines.push(format!(
    "Tu misión es guiar a {} hacia la reducción de su edad biológica mediante:",
    ctx.name.as_deref().unwrap_or("tu paciente")
  ));
  lines.push("- Las 5A Claves: Alimentación, Actividad, Actitud, Ambiente, Anti-envejecimiento".into());
  lines.push("- Las Terapias 4R: Remoción, Restauración, Regeneración, Revitalización".into());
  lines.push(String::new());
  lines.push("Responde de forma concisa, profesional y personalizada en español.".into());
  lines.join("\n")
}

/// ---------------------------------------------------------------------------
/// Chat Session
/// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
  User,
  Model,
}

impl ChatRole {
  fn as_str(self) -> &'static str {
    match self {
      ChatRole::User => "user",
      ChatRole::Model => "model",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
  pub role: ChatRole,
  pub text: String,
}

pub struct CoachSession {
  client: Client,
  config: CoachConfig,
  system_instruction: String,
  history: Vec<ChatMessage>,
}

impl CoachSession {
  pub fn start(config: CoachConfig, context: Option<PatientContext>) -> Self {
    debug!("Starting VCoach session for {:?}", context.as_ref().and_then(|c| c.name.as_deref()));
    Self {
      client: Client::new(),
      system_instruction: system_instruction(context.as_ref()),
      config,
      history: Vec::new(),
    }
  }

  pub fn history(&self) -> &[ChatMessage] {
    &self.history
  }

  /// Send one patient message with the whole conversation so far. Both
  /// turns are kept only when the backend produced a reply.
  pub async fn send(&mut self, message: &str) -> String {
    match self.complete(message).await {
      Ok(Some(reply)) => {
        self.history.push(ChatMessage {
          role: ChatRole::User,
          text: message.to_string(),
        });
        self.history.push(ChatMessage {
          role: ChatRole::Model,
          text: reply.clone(),
        });
        reply
      }
      Ok(None) => {
        warn!("VCoach returned an empty reply");
        NO_REPLY.to_string()
      }
      Err(e) => {
        warn!("VCoach request failed: {}", e);
        CONNECTION_FAILED.to_string()
      }
    }
  }

  /// Consume the session, returning the transcript
  pub fn end(self) -> Vec<ChatMessage> {
    debug!("VCoach session ended after {} messages", self.history.len());
    self.history
  }

  async fn complete(&self, message: &str) -> Result<Option<String>, CoachError> {
    let mut contents: Vec<Content> = self
      .history
      .iter()
      .map(|m| Content {
        role: Some(m.role.as_str().to_string()),
        parts: vec![Part::text(m.text.clone())],
      })
      .collect();
    contents.push(Content {
      role: Some(ChatRole::User.as_str().to_string()),
      parts: vec![Part::text(message)],
    });

    let request = GenerateRequest {
      system_instruction: Some(Content {
        role: None,
        parts: vec![Part::text(self.system_instruction.clone())],
      }),
      contents,
      generation_config: GenerationConfig {
        temperature: Some(TEMPERATURE),
        ..GenerationConfig::default()
      },
    };

    generate(&self.client, &self.config, &request).await
  }
}

/// ---------------------------------------------------------------------------
/// Food Analysis
/// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FoodRecommendation {
  Recommended,
  Moderate,
  Avoid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Macros {
  #[serde(default)]
  pub sugar: String,
  #[serde(default)]
  pub carbs: String,
  #[serde(default)]
  pub protein: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodAnalysis {
  pub product_name: String,
  pub recommendation: FoodRecommendation,
  pub reasoning: String,
  #[serde(default)]
  pub macros: Macros,
  #[serde(default)]
  pub inflammatory_ingredients: Vec<String>,
}

/// Classify a food photo. Accepts raw base64 or a `data:image/...;base64,`
/// URL. Unlike chat, failures are returned to the caller.
pub async fn analyze_food(config: &CoachConfig, image_base64: &str) -> Result<FoodAnalysis, CoachError> {
  let request = GenerateRequest {
    system_instruction: None,
    contents: vec![Content {
      role: Some(ChatRole::User.as_str().to_string()),
      parts: vec![
        Part {
          inline_data: Some(InlineData {
            mime_type: "image/jpeg".to_string(),
            data: strip_data_url(image_base64).to_string(),
          }),
          ..Part::default()
        },
        Part::text(FOOD_PROMPT),
      ],
    }],
    generation_config: GenerationConfig {
      response_mime_type: Some("application/json".to_string()),
      ..GenerationConfig::default()
    },
  };

  let text = generate(&Client::new(), config, &request)
    .await?
    .ok_or_else(|| CoachError::Parse("Empty response".to_string()))?;

  let json_str = extract_json(&text)?;
  serde_json::from_str(&json_str).map_err(|e| CoachError::Parse(format!("{}: {}", e, json_str)))
}

fn strip_data_url(image: &str) -> &str {
  const PREFIXES: [&str; 4] = ["png", "jpg", "jpeg", "webp"];
  if let Some(rest) = image.strip_prefix("data:image/") {
    for ext in PREFIXES {
      if let Some(data) = rest
        .strip_prefix(ext)
        .and_then(|r| r.strip_prefix(";base64,"))
      {
        return data;
      }
    }
  }
  image
}

/// ---------------------------------------------------------------------------
/// Transport
/// ---------------------------------------------------------------------------

/// First non-empty text part of the first candidate
async fn generate(
  client: &Client,
  config: &CoachConfig,
  request: &GenerateRequest,
) -> Result<Option<String>, CoachError> {
  let api_key = config.api_key.as_deref().ok_or(CoachError::MissingApiKey)?;

  let response = client
    .post(config.endpoint())
    .header("x-goog-api-key", api_key)
    .json(request)
    .send()
    .await?;

  let status = response.status();
  let body = response.text().await?;

  if !status.is_success() {
    if let Ok(error_resp) = serde_json::from_str::<ApiErrorResponse>(&body) {
      return Err(CoachError::Api(error_resp.error.message));
    }
    return Err(CoachError::Api(format!("HTTP {}: {}", status, body)));
  }

  let parsed: GenerateResponse =
    serde_json::from_str(&body).map_err(|e| CoachError::Parse(e.to_string()))?;

  Ok(
    parsed
      .candidates
      .into_iter()
      .filter_map(|c| c.content)
      .flat_map(|c| c.parts)
      .filter_map(|p| p.text)
      .find(|t| !t.trim().is_empty()),
  )
}

/// Extract JSON from a model reply (handles markdown code blocks)
fn extract_json(text: &str) -> Result<String, CoachError> {
  let trimmed = text.trim();
  if trimmed.starts_with('{') {
    return Ok(trimmed.to_string());
  }

  if let Some(start) = text.find("```json") {
    let start = start + 7;
    if let Some(end) = text[start..].find("```") {
      return Ok(text[start..start + end].trim().to_string());
    }
  }

  if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
    if start < end {
      return Ok(text[start..=end].to_string());
    }
  }

  Err(CoachError::Parse("Could not extract JSON from response".to_string()))
}

/// ---------------------------------------------------------------------------
/// Tests
/// ---------------------------------------------------------------------------
