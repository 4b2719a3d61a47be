//! Pipeline que convierte un proyecto de software en un borrador de patente
//! provisional puntuado, coordinando búsqueda de estado de la técnica,
//! backends de generación de texto y un servicio de diagramas.

pub mod analysis;
pub mod client;
pub mod config;
pub mod drafter;
pub mod error;
pub mod export;
pub mod figures;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod prior_art;
pub mod rubric;
pub mod run_state;
pub mod scorer;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{Orchestrator, PipelineRun, RunOutcome, RunStatus, Stage, StopReason};
