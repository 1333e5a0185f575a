use serde::{Deserialize, Serialize};

const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_TEMPERATURE: f32 = 0.1;
const CLAUDE_TOP_P: f32 = 0.9;

/// Model families with distinct default generation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Claude,
    Titan,
    Generic,
}

impl ModelFamily {
    /// Detect the family from a model identifier
    #[inline]
    pub fn detect(model_id: &str) -> Self {
        let id = model_id.to_ascii_lowercase();
        if id.contains("claude") {
            Self::Claude
        } else if id.contains("titan") {
            Self::Titan
        } else {
            Self::Generic
        }
    }

    #[inline]
    pub fn default_params(self) -> GenerationParams {
        match self {
            Self::Claude => GenerationParams {
                max_tokens: DEFAULT_MAX_TOKENS,
                temperature: DEFAULT_TEMPERATURE,
                top_p: Some(CLAUDE_TOP_P),
                stop: None,
            },
            Self::Titan => GenerationParams {
                max_tokens: DEFAULT_MAX_TOKENS,
                temperature: DEFAULT_TEMPERATURE,
                top_p: None,
                stop: Some(Vec::new()),
            },
            Self::Generic => GenerationParams {
                max_tokens: DEFAULT_MAX_TOKENS,
                temperature: DEFAULT_TEMPERATURE,
                top_p: None,
                stop: None,
            },
        }
    }
}

/// Fully resolved parameters for one generation call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl GenerationParams {
    /// Family defaults for `model_id` with `overrides` applied on top
    #[inline]
    pub fn resolve(model_id: &str, overrides: &GenerationOverrides) -> Self {
        ModelFamily::detect(model_id)
            .default_params()
            .with_overrides(overrides)
    }

    #[inline]
    #[must_use]
    pub fn with_overrides(mut self, overrides: &GenerationOverrides) -> Self {
        if let Some(max_tokens) = overrides.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(temperature) = overrides.temperature {
            self.temperature = temperature;
        }
        if overrides.top_p.is_some() {
            self.top_p = overrides.top_p;
        }
        if let Some(stop) = &overrides.stop {
            self.stop = Some(stop.clone());
        }
        self
    }
}

/// Caller-supplied generation settings; unset fields keep the family default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

impl GenerationOverrides {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Field-wise merge where `other` wins
    #[inline]
    #[must_use]
    pub fn merged_with(&self, other: &Self) -> Self {
        Self {
            max_tokens: other.max_tokens.or(self.max_tokens),
            temperature: other.temperature.or(self.temperature),
            top_p: other.top_p.or(self.top_p),
            stop: other.stop.clone().or_else(|| self.stop.clone()),
        }
    }
}
