use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use disclosure_pipeline::models::InventorInfo;
use disclosure_pipeline::{Orchestrator, PipelineConfig, RunOutcome};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Genera un borrador de patente provisional a partir de un proyecto.
#[derive(Debug, Parser)]
#[command(name = "disclosure-pipeline", version, about)]
struct Args {
    /// Directorio del proyecto a analizar.
    #[arg(long)]
    source: PathBuf,

    /// Directorio de salida (por defecto OUTPUT_DIR o ./patent_output).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Nombre del inventor para la portada.
    #[arg(long, env = "INVENTOR_NAME")]
    inventor: Option<String>,

    /// Título propuesto para la invención.
    #[arg(long)]
    title: Option<String>,

    /// Campo técnico de la invención.
    #[arg(long)]
    field: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    // 2. Cargar configuración
    let mut cfg = PipelineConfig::from_env().context("Error al cargar la configuración")?;
    if let Some(output) = args.output {
        cfg.output_dir = output;
    }

    let mut inventor = InventorInfo::default();
    if let Some(name) = args.inventor {
        inventor.name = name;
    }

    // 3. Construir el orquestador con los servicios reales
    let orchestrator = Orchestrator::from_config(cfg)
        .context("Error inicializando el orquestador")?
        .with_inventor(inventor)
        .with_hints(args.title, args.field);

    // 4. Ejecutar
    info!("🚀 Procesando {}", args.source.display());
    match orchestrator.run_directory(&args.source).await {
        RunOutcome::Done { run, report, artifact } => {
            info!(
                "✅ {} | {:.1}/{:.0} ({}) tras {} reescrituras. Documento: {}",
                run.status().key(),
                report.total,
                report.max,
                report.grade,
                run.redrafts_used,
                artifact.document.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::Failed { run, failure } => {
            error!("❌ Ejecución {} fallida: {failure}", run.id);
            Ok(ExitCode::FAILURE)
        }
    }
}
