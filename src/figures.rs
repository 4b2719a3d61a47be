//! Renderizado de las figuras del plan: servicio de diagramas remoto con
//! respaldo en un marcador ASCII cuando no hay clave o la llamada falla.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::config::PipelineConfig;
use crate::error::ServiceError;
use crate::models::FigureSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FigureSource {
    DiagramService,
    Placeholder,
}

/// Figura lista para escribirse como `FIG_<n>_<Titulo>.<extension>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFigure {
    pub number: u32,
    pub stem: String,
    pub extension: String,
    pub bytes: Vec<u8>,
    pub source: FigureSource,
}

impl RenderedFigure {
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem, self.extension)
    }
}

#[async_trait]
pub trait FigureRenderer: Send + Sync {
    async fn render(&self, spec: &FigureSpec) -> Result<RenderedFigure, ServiceError>;
}

/// Texto enviado al servicio de diagramas para una figura.
pub fn diagram_prompt(spec: &FigureSpec) -> String {
    let labels: Vec<String> = spec
        .numerals
        .iter()
        .map(|(n, label)| format!("{n} {label}"))
        .collect();
    format!(
        "Create a {} for a patent application.\n\n\
         Subject: FIG. {} {}: {}\n\
         Reference numerals: {}\n\n\
         Style requirements:\n\
         - clean technical blueprint style, white background, black lines\n\
         - label every component with its reference numeral\n\
         - USPTO patent figure style, no gradients or shading\n\
         - high contrast for clear printing",
        spec.kind.prompt_hint(),
        spec.number,
        spec.title,
        spec.description,
        labels.join(", "),
    )
}

/// Cliente del servicio de diagramas (API JSON tipo Krea).
pub struct DiagramService {
    client: ApiClient,
    base_url: String,
    api_key: String,
}

impl DiagramService {
    pub fn new(client: ApiClient, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

/// Dónde viene la imagen en la respuesta del servicio.
#[derive(Debug, Clone, PartialEq)]
enum ImageRef {
    Url(String),
    Inline(String),
}

fn image_ref(body: &Value) -> Option<ImageRef> {
    let candidate = body
        .pointer("/images/0/url")
        .or_else(|| body.pointer("/images/0/base64"))
        .or_else(|| body.get("image_url"))
        .or_else(|| body.pointer("/data/0/url"))
        .or_else(|| body.pointer("/data/0/b64_json"))
        .and_then(Value::as_str)?;
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        Some(ImageRef::Url(candidate.to_string()))
    } else {
        Some(ImageRef::Inline(candidate.to_string()))
    }
}

fn extension_for(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    mime_guess::from_path(path)
        .first()
        .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .and_then(|_| path.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()))
        .unwrap_or_else(|| "png".to_string())
}

#[async_trait]
impl FigureRenderer for DiagramService {
    async fn render(&self, spec: &FigureSpec) -> Result<RenderedFigure, ServiceError> {
        let label = format!("fig-{}", spec.number);
        let payload = json!({
            "prompt": diagram_prompt(spec),
            "width": 1024,
            "height": 768,
            "num_images": 1,
            "style": "technical",
        });
        let body: Value = self
            .client
            .call_json(&label, |http| {
                http.post(self.base_url.as_str())
                    .bearer_auth(&self.api_key)
                    .json(&payload)
            })
            .await?;

        let (bytes, extension) = match image_ref(&body) {
            Some(ImageRef::Url(url)) => {
                let bytes = self
                    .client
                    .call_bytes(&format!("{label}-download"), |http| http.get(url.as_str()))
                    .await?;
                (bytes, extension_for(&url))
            }
            Some(ImageRef::Inline(data)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| ServiceError::ServerError {
                        service: self.client.service().to_string(),
                        status: Some(200),
                        message: format!("imagen base64 inválida: {e}"),
                    })?;
                (bytes, "png".to_string())
            }
            None => {
                return Err(ServiceError::ServerError {
                    service: self.client.service().to_string(),
                    status: Some(200),
                    message: "respuesta sin imagen".to_string(),
                })
            }
        };

        Ok(RenderedFigure {
            number: spec.number,
            stem: spec.file_stem(),
            extension,
            bytes,
            source: FigureSource::DiagramService,
        })
    }
}

/// Dibujo ASCII con el título y los numerales de la figura.
pub struct PlaceholderRenderer;

impl PlaceholderRenderer {
    pub fn draw(spec: &FigureSpec) -> RenderedFigure {
        let mut lines = vec![
            format!("FIG. {}", spec.number),
            spec.title.clone(),
            String::new(),
        ];
        lines.extend(spec.numerals.iter().map(|(n, label)| format!("[{n}] {label}")));
        lines.push(String::new());
        lines.push("[Placeholder - configure DIAGRAM_API_KEY for rendered diagrams]".to_string());

        let width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 2;
        let border = format!("+{}+", "-".repeat(width));
        let mut text = format!("{border}\n");
        for line in &lines {
            let pad = width - 1 - line.chars().count();
            text.push_str(&format!("| {line}{}|\n", " ".repeat(pad)));
        }
        text.push_str(&border);
        text.push('\n');

        RenderedFigure {
            number: spec.number,
            stem: spec.file_stem(),
            extension: "txt".to_string(),
            bytes: text.into_bytes(),
            source: FigureSource::Placeholder,
        }
    }
}

#[async_trait]
impl FigureRenderer for PlaceholderRenderer {
    async fn render(&self, spec: &FigureSpec) -> Result<RenderedFigure, ServiceError> {
        Ok(Self::draw(spec))
    }
}

/// Intenta el renderizador principal y, si falla, dibuja el marcador.
pub struct FallbackRenderer {
    primary: Option<Arc<dyn FigureRenderer>>,
}

impl FallbackRenderer {
    pub fn new(primary: Option<Arc<dyn FigureRenderer>>) -> Self {
        Self { primary }
    }

    /// Servicio remoto sólo si hay clave configurada.
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        let primary = cfg
            .diagram
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .map(|key| {
                let client = ApiClient::new("diagram", cfg.diagram_limits.clone());
                Arc::new(DiagramService::new(client, cfg.diagram.base_url.clone(), key))
                    as Arc<dyn FigureRenderer>
            });
        if primary.is_none() {
            info!("Sin clave del servicio de diagramas, se usarán marcadores ASCII");
        }
        Self::new(primary)
    }
}

#[async_trait]
impl FigureRenderer for FallbackRenderer {
    async fn render(&self, spec: &FigureSpec) -> Result<RenderedFigure, ServiceError> {
        if let Some(primary) = &self.primary {
            match primary.render(spec).await {
                Ok(figure) => return Ok(figure),
                Err(err) => {
                    warn!(figure = spec.number, error = %err, "Fallo al renderizar la figura, usando marcador");
                }
            }
        }
        Ok(PlaceholderRenderer::draw(spec))
    }
}

/// Renderiza todas las figuras a la vez. Una figura que falla se sustituye
/// por su marcador para que la numeración quede completa.
pub async fn render_all(renderer: &dyn FigureRenderer, plan: &[FigureSpec]) -> Vec<RenderedFigure> {
    let results = futures::future::join_all(plan.iter().map(|spec| renderer.render(spec))).await;
    results
        .into_iter()
        .zip(plan)
        .map(|(result, spec)| {
            result.unwrap_or_else(|err| {
                warn!(figure = spec.number, error = %err, "Figura sustituida por marcador");
                PlaceholderRenderer::draw(spec)
            })
        })
        .collect()
}
