//! Companion configuration
//!
//! Plain struct with pipeline defaults; [`CompanionConfig::from_env`] overlays the
//! handful of user-facing settings that are usually supplied per machine.

use crate::pcm::{CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE, PLAYBACK_SAMPLE_RATE};
use std::time::Duration;

const DEFAULT_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Invalid configuration values
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported language '{0}' (expected 'es' or 'en')")]
    Language(String),

    #[error("unknown personality '{0}'")]
    Personality(String),
}

/// Language used for nudges and persona framing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    Es,
    En,
}

impl Language {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "es" => Ok(Self::Es),
            "en" => Ok(Self::En),
            other => Err(ConfigError::Language(other.to_string())),
        }
    }

    /// Synthetic instruction sent after prolonged silence.
    pub fn nudge_text(&self) -> &'static str {
        match self {
            Self::Es => "[SISTEMA: Silencio prolongado. Di algo breve según tu personalidad.]",
            Self::En => "[SYSTEM: Prolonged silence. Say something brief based on your personality.]",
        }
    }
}

/// Companion tone
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Persona {
    #[default]
    Friendly,
    Professional,
    Gamer,
    Sarcastic,
    Zen,
    Custom(String),
}

impl Persona {
    pub fn parse(s: &str, custom_prompt: Option<String>) -> Result<Self, ConfigError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "friendly" => Ok(Self::Friendly),
            "professional" => Ok(Self::Professional),
            "gamer" => Ok(Self::Gamer),
            "sarcastic" => Ok(Self::Sarcastic),
            "zen" => Ok(Self::Zen),
            "custom" => Ok(Self::Custom(custom_prompt.unwrap_or_default())),
            other => Err(ConfigError::Personality(other.to_string())),
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Self::Friendly => "You are a warm, supportive friend. Use emojis, be encouraging, and focus on personal well-being. Keep it brief.",
            Self::Professional => "You are a highly efficient executive assistant. Be concise, clear, and focused on productivity.",
            Self::Gamer => "You are a hardcore gaming companion. Use gaming lingo and give tactical advice in short bursts.",
            Self::Sarcastic => "You are a witty, slightly sarcastic companion. Use dry humor and short, clever observations.",
            Self::Zen => "You are a calm, mindful guide. Help the user stay focused and breathe. Short, peaceful responses.",
            Self::Custom(p) if !p.trim().is_empty() => p,
            Self::Custom(_) => "You are a highly adaptable AI. Please act according to the custom neural directives. Keep it concise for voice chat.",
        }
    }
}

/// Configuration for a companion session
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    /// Websocket endpoint, without the key
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub language: Language,
    pub persona: Persona,
    pub user_name: String,
    pub ai_name: String,

    /// PulseAudio source name, default source when unset
    pub input_device: Option<String>,
    /// PulseAudio sink name, default sink when unset
    pub output_device: Option<String>,

    pub capture_sample_rate: u32,
    pub capture_frame_samples: usize,
    pub playback_sample_rate: u32,
    /// Absolute sample level above which a capture frame counts as speech
    pub vad_threshold: f32,
    /// Lead applied when re-anchoring an idle timeline (seconds)
    pub reanchor_lead: f64,
    /// Drop inbound chunks once the timeline runs further ahead than this (seconds)
    pub max_playback_ahead: Option<f64>,

    pub nudge_check_interval: Duration,
    /// Range of the first quiet threshold after going live (ms)
    pub first_nudge_threshold_ms: (u64, u64),
    /// Range re-rolled after each nudge (ms)
    pub nudge_threshold_ms: (u64, u64),

    pub loudness_tick: Duration,
    pub loudness_divisor: f32,

    pub visual_interval: Duration,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: None,
            model: "models/gemini-2.5-flash-native-audio-preview-12-2025".to_string(),
            voice: "Kore".to_string(),
            language: Language::default(),
            persona: Persona::default(),
            user_name: String::new(),
            ai_name: "D-mon".to_string(),
            input_device: None,
            output_device: None,
            capture_sample_rate: CAPTURE_SAMPLE_RATE,
            capture_frame_samples: CAPTURE_FRAME_SAMPLES,
            playback_sample_rate: PLAYBACK_SAMPLE_RATE,
            vad_threshold: 0.06,
            reanchor_lead: 0.05,
            max_playback_ahead: None,
            nudge_check_interval: Duration::from_secs(4),
            first_nudge_threshold_ms: (25_000, 40_000),
            nudge_threshold_ms: (20_000, 40_000),
            loudness_tick: Duration::from_millis(16),
            loudness_divisor: 60.0,
            visual_interval: Duration::from_millis(1500),
        }
    }
}

impl CompanionConfig {
    /// Defaults overlaid with `GEMINI_API_KEY` and the `DMON_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.api_key = lookup("GEMINI_API_KEY").filter(|k| !k.is_empty());
        if let Some(model) = lookup("DMON_MODEL") {
            config.model = model;
        }
        if let Some(voice) = lookup("DMON_VOICE") {
            config.voice = voice;
        }
        if let Some(lang) = lookup("DMON_LANG") {
            config.language = Language::parse(&lang)?;
        }
        if let Some(name) = lookup("DMON_USER_NAME") {
            config.user_name = name;
        }
        if let Some(name) = lookup("DMON_AI_NAME") {
            config.ai_name = name;
        }
        config.input_device = lookup("DMON_INPUT_DEVICE").filter(|d| !d.is_empty());
        config.output_device = lookup("DMON_OUTPUT_DEVICE").filter(|d| !d.is_empty());
        if let Some(p) = lookup("DMON_PERSONALITY") {
            config.persona = Persona::parse(&p, lookup("DMON_CUSTOM_PROMPT"))?;
        }

        Ok(config)
    }

    /// Endpoint URL with the API key attached.
    pub fn endpoint(&self) -> String {
        match &self.api_key {
            Some(key) => format!("{}?key={}", self.url, key),
            None => self.url.clone(),
        }
    }

    /// System instruction sent during setup.
    pub fn system_instruction(&self) -> String {
        format!(
            "Identity: {}. User: {}. Tone: {} \
             REAL-TIME MODE: Respond immediately. Be extremely concise. Use short sentences. \
             Priority is LOW LATENCY and SMOOTHNESS. Do not use monologues. Avoid empty filler words.",
            self.ai_name,
            self.user_name,
            self.persona.prompt()
        )
    }
}
