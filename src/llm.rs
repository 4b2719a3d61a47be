//! Abstracción sobre Rig para trabajar con distintos proveedores de LLM bajo
//! un único contrato de generación.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::ApiClient;
use crate::config::{BackendKind, BackendSettings, PipelineConfig};
use crate::error::{GenerationError, ServiceError};

/// Rol + instrucciones + contexto previo de una llamada.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationPrompt {
    pub role: String,
    pub instructions: String,
    pub context: String,
}

impl GenerationPrompt {
    /// Tamaño aproximado en caracteres.
    pub fn size(&self) -> usize {
        self.role.len() + self.instructions.len() + self.context.len()
    }
}

/// Contrato que usa el redactor. `ContextTooLarge` no se reintenta aquí.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError>;
}

/// Un backend concreto. Devuelve el mensaje de error crudo del proveedor.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    async fn complete(&self, prompt: &GenerationPrompt, max_tokens: u64) -> Result<String, String>;
}

/// Backend respaldado por un agente de Rig.
pub struct RigBackend {
    settings: BackendSettings,
}

impl RigBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

/// Construye un agente con preámbulo, documento de contexto y límite de
/// tokens, y le envía las instrucciones.
macro_rules! prompt_agent {
    ($client:expr, $model:expr, $prompt:expr, $max_tokens:expr) => {{
        let agent = $client
            .agent($model)
            .preamble(&$prompt.role)
            .context(&$prompt.context)
            .max_tokens($max_tokens)
            .build();
        agent
            .prompt($prompt.instructions.as_str())
            .await
            .map_err(|e| e.to_string())
    }};
}

#[async_trait]
impl CompletionBackend for RigBackend {
    fn kind(&self) -> BackendKind {
        self.settings.kind
    }

    async fn complete(&self, prompt: &GenerationPrompt, max_tokens: u64) -> Result<String, String> {
        use rig::client::CompletionClient as _;
        use rig::completion::Prompt;
        use rig::providers::{anthropic, gemini, ollama, openai};

        let key = self.settings.api_key.as_deref().unwrap_or_default();
        let model = self.settings.model.as_str();

        match self.settings.kind {
            BackendKind::OpenAI => prompt_agent!(openai::Client::new(key), model, prompt, max_tokens),
            BackendKind::Anthropic => {
                prompt_agent!(anthropic::Client::new(key), model, prompt, max_tokens)
            }
            BackendKind::Gemini => prompt_agent!(gemini::Client::new(key), model, prompt, max_tokens),
            BackendKind::Ollama => prompt_agent!(ollama::Client::new(), model, prompt, max_tokens),
        }
    }
}

/// Clasificación de un fallo del proveedor: o bien un rechazo definitivo
/// del contrato de generación, o bien un error de servicio reintentable.
fn classify(service: &str, message: &str) -> Result<GenerationError, ServiceError> {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&[
        "context_length",
        "maximum context",
        "context window",
        "prompt is too long",
        "too many tokens",
    ]) {
        return Ok(GenerationError::ContextTooLarge(message.to_string()));
    }
    if has(&["content_policy", "content policy", "content management", "safety"]) {
        return Ok(GenerationError::ContentPolicyRejected(message.to_string()));
    }

    let service = service.to_string();
    let message = message.to_string();
    Err(if has(&["429", "rate limit", "rate_limit", "overloaded"]) {
        ServiceError::RateLimited {
            service,
            message,
            retry_after: None,
        }
    } else if has(&["401", "403", "unauthorized", "invalid api key", "invalid x-api-key", "permission"]) {
        ServiceError::ClientError {
            service,
            status: None,
            message,
        }
    } else if has(&["timed out", "timeout"]) {
        ServiceError::Timeout {
            service,
            after: std::time::Duration::ZERO,
        }
    } else if has(&["connection", "dns", "connect"]) {
        ServiceError::NetworkError { service, message }
    } else {
        ServiceError::ServerError {
            service,
            status: None,
            message,
        }
    })
}

/// Adaptador de generación: recorre la cadena de backends configurada
/// (preferido primero) a través del cliente con límite de tasa.
pub struct GenerationAdapter {
    chain: Vec<Arc<dyn CompletionBackend>>,
    client: ApiClient,
    max_tokens: u64,
}

impl GenerationAdapter {
    pub fn new(chain: Vec<Arc<dyn CompletionBackend>>, client: ApiClient, max_tokens: u64) -> Self {
        Self {
            chain,
            client,
            max_tokens,
        }
    }

    /// La selección de backend es una consulta pura a la configuración.
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        let chain = cfg
            .backend_chain()
            .into_iter()
            .map(|settings| Arc::new(RigBackend::new(settings)) as Arc<dyn CompletionBackend>)
            .collect();
        Self::new(chain, ApiClient::new("generation", cfg.generation.clone()), cfg.max_tokens)
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        self.chain.iter().map(|b| b.kind()).collect()
    }
}

#[async_trait]
impl TextGenerator for GenerationAdapter {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        if self.chain.is_empty() {
            return Err(GenerationError::BackendUnavailable(
                "no hay ningún backend con credenciales configuradas".to_string(),
            ));
        }

        let mut last_error = String::new();
        for backend in &self.chain {
            let service = format!("generation.{}", backend.kind().key());
            debug!(backend = backend.kind().key(), size = prompt.size(), "Enviando prompt");

            let outcome = self
                .client
                .execute(&service, || {
                    let backend = backend.clone();
                    let service = service.clone();
                    async move {
                        match backend.complete(prompt, self.max_tokens).await {
                            Ok(text) if text.trim().is_empty() => Err(ServiceError::ServerError {
                                service,
                                status: None,
                                message: "respuesta vacía".to_string(),
                            }),
                            Ok(text) => Ok(Ok(text)),
                            Err(message) => classify(&service, &message).map(Err),
                        }
                    }
                })
                .await;

            match outcome {
                Ok(Ok(text)) => return Ok(text),
                Ok(Err(rejection)) => return Err(rejection),
                Err(ServiceError::BudgetExhausted { service }) => {
                    return Err(GenerationError::BudgetExhausted(service));
                }
                Err(err) => {
                    warn!(backend = backend.kind().key(), error = %err, "Backend no disponible, probando el siguiente");
                    last_error = err.to_string();
                }
            }
        }
        Err(GenerationError::BackendUnavailable(last_error))
    }
}
