//! Taxonomía de errores del pipeline.
//!
//! - `ServiceError`: lo que devuelve el cliente con límite de tasa.
//! - `GenerationError`: contrato del adaptador de generación.
//! - `PipelineError`: lo que decide el orquestador (reintentar, degradar o fallar).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::SectionKind;

/// Resultado fallido de una llamada a un servicio externo.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ServiceError {
    #[error("{service}: tiempo de espera agotado tras {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("{service}: límite de tasa alcanzado ({message})")]
    RateLimited {
        service: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("{service}: error del servidor {status:?}: {message}")]
    ServerError {
        service: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{service}: petición rechazada {status:?}: {message}")]
    ClientError {
        service: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{service}: error de red: {message}")]
    NetworkError { service: String, message: String },

    #[error("{service}: presupuesto de peticiones agotado")]
    BudgetExhausted { service: String },
}

impl ServiceError {
    /// Timeout, límite de tasa, 5xx y fallos de red se reintentan;
    /// los rechazos del cliente y el presupuesto agotado no.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::NetworkError { .. }
        )
    }

    pub fn service(&self) -> &str {
        match self {
            Self::Timeout { service, .. }
            | Self::RateLimited { service, .. }
            | Self::ServerError { service, .. }
            | Self::ClientError { service, .. }
            | Self::NetworkError { service, .. }
            | Self::BudgetExhausted { service } => service,
        }
    }

    /// Etiqueta corta para los registros de auditoría.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::RateLimited { .. } => "rate-limited",
            Self::ServerError { .. } => "server-error",
            Self::ClientError { .. } => "client-error",
            Self::NetworkError { .. } => "network-error",
            Self::BudgetExhausted { .. } => "budget-exhausted",
        }
    }

    /// Clasifica un estado HTTP no exitoso.
    pub fn from_status(
        service: &str,
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    ) -> Self {
        let service = service.to_string();
        match status {
            429 => Self::RateLimited {
                service,
                message: body,
                retry_after,
            },
            408 => Self::Timeout {
                service,
                after: Duration::ZERO,
            },
            500..=599 => Self::ServerError {
                service,
                status: Some(status),
                message: body,
            },
            _ => Self::ClientError {
                service,
                status: Some(status),
                message: body,
            },
        }
    }

    pub fn from_reqwest(service: &str, err: &reqwest::Error) -> Self {
        let service = service.to_string();
        if err.is_timeout() {
            Self::Timeout {
                service,
                after: Duration::ZERO,
            }
        } else if err.is_decode() {
            Self::ServerError {
                service,
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        } else if err.is_builder() {
            Self::ClientError {
                service,
                status: None,
                message: err.to_string(),
            }
        } else {
            Self::NetworkError {
                service,
                message: err.to_string(),
            }
        }
    }
}

/// Errores del contrato de generación de texto.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerationError {
    #[error("ningún backend de generación disponible: {0}")]
    BackendUnavailable(String),

    #[error("contenido rechazado por la política del proveedor: {0}")]
    ContentPolicyRejected(String),

    #[error("el contexto excede la ventana del modelo: {0}")]
    ContextTooLarge(String),

    #[error("presupuesto de generación agotado: {0}")]
    BudgetExhausted(String),
}

/// Fallo de una sección concreta tras agotar su adaptación.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionFailure {
    pub section: SectionKind,
    pub error: GenerationError,
}

impl fmt::Display for SectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.section, self.error)
    }
}

/// Violaciones fatales de integridad.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IntegrityViolation {
    #[error("el SourceBundle está vacío")]
    EmptySourceBundle,

    #[error("secciones fallidas: {}", join_failures(.0))]
    SectionsFailed(Vec<SectionFailure>),

    #[error("borrador incompleto, faltan: {0:?}")]
    IncompleteDraft(Vec<SectionKind>),

    #[error("transición ilegal {from} -> {to}")]
    IllegalTransition { from: String, to: String },
}

fn join_failures(failures: &[SectionFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errores de la rúbrica y del puntuador.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScoreError {
    #[error("no se puede puntuar un borrador incompleto, faltan: {0:?}")]
    IncompleteDraft(Vec<SectionKind>),

    #[error("patrón de rúbrica inválido '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("categoría de rúbrica desconocida: {0}")]
    UnknownCategory(String),

    #[error("puntuación inválida en '{key}': {points}")]
    InvalidPoints { key: String, points: f64 },

    #[error("no se pudo cargar la rúbrica: {0}")]
    Load(String),
}

/// Errores que llegan al orquestador.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("servicio transitorio sin reintentos restantes: {0}")]
    TransientService(ServiceError),

    #[error("petición rechazada: {0}")]
    RequestRejected(String),

    #[error("presupuesto agotado: {0}")]
    BudgetExhausted(String),

    #[error("backend no disponible: {0}")]
    BackendUnavailable(String),

    #[error("error de integridad: {0}")]
    Integrity(#[from] IntegrityViolation),

    #[error("la ejecución superó su límite de {0:?}")]
    RunTimeout(Duration),

    #[error("rúbrica inválida: {0}")]
    Rubric(String),

    #[error("error de ingesta: {0}")]
    Ingest(String),

    #[error("error de E/S: {0}")]
    Io(#[from] std::io::Error),

    #[error("error de serialización: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ServiceError> for PipelineError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::BudgetExhausted { service } => Self::BudgetExhausted(service),
            ServiceError::ClientError { .. } => Self::RequestRejected(err.to_string()),
            other => Self::TransientService(other),
        }
    }
}

impl From<GenerationError> for PipelineError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::BackendUnavailable(msg) => Self::BackendUnavailable(msg),
            GenerationError::BudgetExhausted(msg) => Self::BudgetExhausted(msg),
            other => Self::RequestRejected(other.to_string()),
        }
    }
}

impl From<ScoreError> for PipelineError {
    fn from(err: ScoreError) -> Self {
        match err {
            ScoreError::IncompleteDraft(missing) => {
                Self::Integrity(IntegrityViolation::IncompleteDraft(missing))
            }
            other => Self::Rubric(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            ServiceError::from_status("svc", 429, String::new(), None),
            ServiceError::RateLimited { .. }
        ));
        assert!(ServiceError::from_status("svc", 503, String::new(), None).is_transient());
        let bad = ServiceError::from_status("svc", 401, "bad key".into(), None);
        assert!(!bad.is_transient());
        assert_eq!(bad.outcome(), "client-error");
    }

    #[test]
    fn budget_exhaustion_is_not_transient() {
        let err = ServiceError::BudgetExhausted {
            service: "search".into(),
        };
        assert!(!err.is_transient());
        assert!(matches!(
            PipelineError::from(err),
            PipelineError::BudgetExhausted(_)
        ));
    }

    #[test]
    fn section_failures_are_listed() {
        let violation = IntegrityViolation::SectionsFailed(vec![SectionFailure {
            section: SectionKind::DetailedDescription,
            error: GenerationError::ContextTooLarge("128k".into()),
        }]);
        assert!(violation.to_string().contains("detailed-description"));
    }
}
