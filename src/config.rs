//! Carga y gestión de la configuración del pipeline (servicios, backends,
//! rúbrica y umbrales).

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::rubric::Rubric;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    OpenAI,
    Anthropic,
    Gemini,
    Ollama,
}

impl BackendKind {
    pub fn key(self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Credenciales y modelo de un backend de generación.
#[derive(Clone, Debug)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub api_key: Option<String>,
    pub model: String,
}

impl BackendSettings {
    /// Ollama no necesita clave; el resto sólo cuenta si la tiene.
    pub fn is_configured(&self) -> bool {
        match self.kind {
            BackendKind::Ollama => true,
            _ => self
                .api_key
                .as_deref()
                .is_some_and(|k| !k.is_empty() && !k.starts_with("your-")),
        }
    }
}

/// Límites por servicio externo aplicados por `ApiClient`.
#[derive(Clone, Debug)]
pub struct ServiceLimits {
    pub max_in_flight: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub request_budget: u64,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl ServiceLimits {
    fn with(max_in_flight: usize, timeout_secs: u64, request_budget: u64) -> Self {
        Self {
            max_in_flight,
            timeout: Duration::from_secs(timeout_secs),
            max_retries: 3,
            request_budget,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
        }
    }

    fn from_env(prefix: &str, defaults: Self) -> Result<Self> {
        Ok(Self {
            max_in_flight: parse_var(&format!("{prefix}_MAX_IN_FLIGHT"), defaults.max_in_flight)?
                .max(1),
            timeout: Duration::from_secs(parse_var(
                &format!("{prefix}_TIMEOUT_SECS"),
                defaults.timeout.as_secs(),
            )?),
            max_retries: parse_var(&format!("{prefix}_MAX_RETRIES"), defaults.max_retries)?,
            request_budget: parse_var(
                &format!("{prefix}_REQUEST_BUDGET"),
                defaults.request_budget,
            )?,
            backoff_base: defaults.backoff_base,
            backoff_max: defaults.backoff_max,
        })
    }
}

/// Parámetros de la búsqueda de estado de la técnica.
#[derive(Clone, Debug)]
pub struct SearchSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub technology_area: String,
    pub since_years: u32,
    pub page_size: usize,
    pub max_results: usize,
    pub queries: usize,
}

/// Servicio de diagramas; sin clave se usan marcadores de texto.
#[derive(Clone, Debug)]
pub struct DiagramSettings {
    pub base_url: String,
    pub api_key: Option<String>,
}

/// Configuración completa del pipeline. Se pasa explícitamente al orquestador.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub target_score: f64,
    pub max_redrafts: u32,
    pub redraft_categories: usize,
    pub run_timeout: Duration,
    pub top_k_references: usize,
    pub excerpt_budget_chars: usize,
    /// Caracteres del proyecto que recibe el análisis de innovaciones.
    pub analysis_budget_chars: usize,
    pub max_tokens: u64,

    pub preferred_backend: BackendKind,
    pub fallback_backends: Vec<BackendKind>,
    pub backends: Vec<BackendSettings>,

    pub generation: ServiceLimits,
    pub search_limits: ServiceLimits,
    pub diagram_limits: ServiceLimits,

    pub search: SearchSettings,
    pub diagram: DiagramSettings,

    pub rubric: Rubric,
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_score: 90.0,
            max_redrafts: 2,
            redraft_categories: 2,
            run_timeout: Duration::from_secs(1800),
            top_k_references: 5,
            excerpt_budget_chars: 12_000,
            analysis_budget_chars: 20_000,
            max_tokens: 8_000,
            preferred_backend: BackendKind::Anthropic,
            fallback_backends: vec![BackendKind::OpenAI],
            backends: vec![
                BackendSettings {
                    kind: BackendKind::Anthropic,
                    api_key: None,
                    model: "claude-sonnet-4-20250514".to_string(),
                },
                BackendSettings {
                    kind: BackendKind::OpenAI,
                    api_key: None,
                    model: "gpt-4o".to_string(),
                },
                BackendSettings {
                    kind: BackendKind::Gemini,
                    api_key: None,
                    model: "gemini-1.5-pro".to_string(),
                },
                BackendSettings {
                    kind: BackendKind::Ollama,
                    api_key: None,
                    model: "llama3.1".to_string(),
                },
            ],
            generation: ServiceLimits::with(4, 120, 200),
            search_limits: ServiceLimits::with(3, 30, 100),
            diagram_limits: ServiceLimits::with(2, 60, 20),
            search: SearchSettings {
                base_url: "https://search.patentsview.org/api/v1/patent/".to_string(),
                api_key: None,
                technology_area: "ai".to_string(),
                since_years: 5,
                page_size: 25,
                max_results: 50,
                queries: 3,
            },
            diagram: DiagramSettings {
                base_url: "https://api.krea.ai/v1/generate".to_string(),
                api_key: None,
            },
            rubric: Rubric::standard(),
            output_dir: PathBuf::from("patent_output"),
        }
    }
}

impl PipelineConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let preferred_backend = env::var("LLM_PROVIDER")
            .ok()
            .map(|s| s.parse::<BackendKind>())
            .transpose()?
            .unwrap_or(defaults.preferred_backend);

        let fallback_backends = match env::var("LLM_FALLBACKS") {
            Ok(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse::<BackendKind>)
                .collect::<Result<Vec<_>>>()?,
            Err(_) => defaults.fallback_backends.clone(),
        };

        let backends = defaults
            .backends
            .iter()
            .map(|b| {
                let prefix = b.kind.key().to_uppercase();
                BackendSettings {
                    kind: b.kind,
                    api_key: env::var(format!("{prefix}_API_KEY")).ok(),
                    model: env::var(format!("{prefix}_MODEL"))
                        .unwrap_or_else(|_| b.model.clone()),
                }
            })
            .collect();

        let search = SearchSettings {
            base_url: parse_url("PATENT_SEARCH_URL", &defaults.search.base_url)?,
            api_key: env::var("PATENT_SEARCH_API_KEY").ok(),
            technology_area: env::var("TECHNOLOGY_AREA")
                .unwrap_or_else(|_| defaults.search.technology_area.clone()),
            since_years: parse_var("SEARCH_SINCE_YEARS", defaults.search.since_years)?,
            page_size: parse_var("SEARCH_PAGE_SIZE", defaults.search.page_size)?.max(1),
            max_results: parse_var("SEARCH_MAX_RESULTS", defaults.search.max_results)?,
            queries: parse_var("SEARCH_QUERIES", defaults.search.queries)?.max(1),
        };

        let diagram = DiagramSettings {
            base_url: parse_url("DIAGRAM_API_URL", &defaults.diagram.base_url)?,
            api_key: env::var("DIAGRAM_API_KEY").ok(),
        };

        let mut rubric = match env::var("RUBRIC_PATH") {
            Ok(path) => Rubric::from_json_file(&path)
                .with_context(|| format!("No se pudo cargar la rúbrica desde {path}"))?,
            Err(_) => defaults.rubric.clone(),
        };
        if let Ok(weights) = env::var("RUBRIC_WEIGHTS") {
            rubric = rubric.reweighted(&parse_weights(&weights)?)?;
        }

        Ok(Self {
            target_score: parse_var("TARGET_SCORE", defaults.target_score)?,
            max_redrafts: parse_var("MAX_REDRAFTS", defaults.max_redrafts)?,
            redraft_categories: parse_var("REDRAFT_CATEGORIES", defaults.redraft_categories)?
                .clamp(1, 3),
            run_timeout: Duration::from_secs(parse_var(
                "RUN_TIMEOUT_SECS",
                defaults.run_timeout.as_secs(),
            )?),
            top_k_references: parse_var("TOP_K_REFERENCES", defaults.top_k_references)?,
            excerpt_budget_chars: parse_var(
                "EXCERPT_BUDGET_CHARS",
                defaults.excerpt_budget_chars,
            )?,
            analysis_budget_chars: parse_var(
                "ANALYSIS_BUDGET_CHARS",
                defaults.analysis_budget_chars,
            )?,
            max_tokens: parse_var("LLM_MAX_TOKENS", defaults.max_tokens)?,
            preferred_backend,
            fallback_backends,
            backends,
            generation: ServiceLimits::from_env("GENERATION", defaults.generation.clone())?,
            search_limits: ServiceLimits::from_env("SEARCH", defaults.search_limits.clone())?,
            diagram_limits: ServiceLimits::from_env("DIAGRAM", defaults.diagram_limits.clone())?,
            search,
            diagram,
            rubric,
            output_dir: env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        })
    }

    /// Cadena de backends: el preferido y después los de respaldo, sin
    /// repetir y sólo los que tienen credenciales.
    pub fn backend_chain(&self) -> Vec<BackendSettings> {
        let mut chain: Vec<BackendSettings> = Vec::new();
        let order = std::iter::once(self.preferred_backend).chain(self.fallback_backends.iter().copied());
        for kind in order {
            if chain.iter().any(|b| b.kind == kind) {
                continue;
            }
            if let Some(settings) = self.backends.iter().find(|b| b.kind == kind) {
                if settings.is_configured() {
                    chain.push(settings.clone());
                }
            }
        }
        chain
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Valor inválido para {name} ('{raw}'): {e}")),
        Err(_) => Ok(default),
    }
}

/// Valida la URL con `url` y la guarda normalizada como texto.
fn parse_url(name: &str, default: &str) -> Result<String> {
    match env::var(name) {
        Ok(raw) => Url::parse(raw.trim())
            .map(String::from)
            .map_err(|e| anyhow!("URL inválida en {name}: {e}")),
        Err(_) => Ok(default.to_string()),
    }
}

/// `technical_disclosure=30,drawings_figures=20` → mapa categoría → puntos.
pub fn parse_weights(raw: &str) -> Result<BTreeMap<String, f64>> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("Peso de rúbrica mal formado: '{pair}'"))?;
            let points: f64 = value
                .trim()
                .parse()
                .map_err(|e| anyhow!("Peso inválido para '{key}': {e}"))?;
            Ok((key.trim().to_string(), points))
        })
        .collect()
}
