//! Escritura del artefacto final: documento Markdown, informe de puntuación
//! en JSON y ficheros de figuras.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::figures::RenderedFigure;
use crate::models::{Draft, SectionKind};
use crate::scorer::ScoreReport;

pub const DOCUMENT_FILE: &str = "provisional_patent.md";
pub const REPORT_FILE: &str = "score_report.json";
pub const FIGURES_DIR: &str = "figures";

/// Rutas de lo que se ha escrito en disco.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub document: PathBuf,
    pub report: PathBuf,
    pub figures: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ReportFile<'a> {
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    status: &'a str,
    stop_reason: &'a str,
    score: f64,
    max: f64,
    grade: &'a str,
    redrafts: u32,
    score_history: &'a [f64],
    section_attempts: Vec<(SectionKind, u32)>,
    report: &'a ScoreReport,
}

/// Metadatos de la ejecución que acompañan al informe.
pub struct RunSummary<'a> {
    pub run_id: Uuid,
    pub status: &'a str,
    pub stop_reason: &'a str,
    pub redrafts: u32,
    pub score_history: &'a [f64],
}

/// Documento con las nueve secciones en orden y la lista de figuras.
pub fn render_markdown(draft: &Draft, figures: &[RenderedFigure]) -> String {
    let title = draft
        .text(SectionKind::Title)
        .lines()
        .next()
        .unwrap_or("Provisional Patent Application")
        .trim_matches(|c: char| c == '#' || c.is_whitespace());

    let mut out = format!("# {title}\n\n");
    for section in draft.sections() {
        out.push_str(&format!("## {}\n\n{}\n\n", section.kind.heading(), section.text().trim()));
    }
    if !figures.is_empty() {
        out.push_str("## FIGURES\n\n");
        for figure in figures {
            out.push_str(&format!(
                "- FIG. {}: [{}]({}/{})\n",
                figure.number,
                figure.file_name(),
                FIGURES_DIR,
                figure.file_name()
            ));
        }
    }
    out
}

/// Escribe el artefacto completo bajo `dir`, creando los directorios.
pub async fn write_artifact(
    dir: &Path,
    draft: &Draft,
    report: &ScoreReport,
    figures: &[RenderedFigure],
    summary: &RunSummary<'_>,
) -> Result<Artifact, PipelineError> {
    let figures_dir = dir.join(FIGURES_DIR);
    tokio::fs::create_dir_all(&figures_dir).await?;

    let mut figure_paths = Vec::with_capacity(figures.len());
    for figure in figures {
        let path = figures_dir.join(figure.file_name());
        tokio::fs::write(&path, &figure.bytes).await?;
        figure_paths.push(path);
    }

    let document = dir.join(DOCUMENT_FILE);
    tokio::fs::write(&document, render_markdown(draft, figures)).await?;

    let report_file = ReportFile {
        run_id: summary.run_id,
        generated_at: Utc::now(),
        status: summary.status,
        stop_reason: summary.stop_reason,
        score: report.total,
        max: report.max,
        grade: &report.grade,
        redrafts: summary.redrafts,
        score_history: summary.score_history,
        section_attempts: draft.sections().map(|s| (s.kind, s.attempts())).collect(),
        report,
    };
    let report_path = dir.join(REPORT_FILE);
    tokio::fs::write(&report_path, serde_json::to_vec_pretty(&report_file)?).await?;

    info!(
        dir = %dir.display(),
        figures = figure_paths.len(),
        score = report.total,
        "Artefacto escrito"
    );
    Ok(Artifact {
        document,
        report: report_path,
        figures: figure_paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::figures::PlaceholderRenderer;
    use crate::models::FigureSpec;

    fn complete_draft() -> Draft {
        let mut draft = Draft::new(FigureSpec::standard_plan());
        for kind in SectionKind::ALL {
            draft
                .section_mut(kind)
                .finalize(format!("{} text", kind.key()), vec![]);
        }
        draft
            .section_mut(SectionKind::Title)
            .finalize("Adaptive Sensor Fusion Router\n".into(), vec![]);
        draft
    }

    fn report() -> ScoreReport {
        ScoreReport {
            categories: Vec::new(),
            deductions: Vec::new(),
            bonuses: Vec::new(),
            base: 80.0,
            bonus_total: 0.0,
            total: 80.0,
            max: 100.0,
            grade: "Good".into(),
            recommendations: vec!["Add benchmarks".into()],
        }
    }

    #[test]
    fn markdown_keeps_section_order() {
        let draft = complete_draft();
        let markdown = render_markdown(&draft, &[]);
        assert!(markdown.starts_with("# Adaptive Sensor Fusion Router\n"));
        let positions: Vec<usize> = SectionKind::ALL
            .iter()
            .map(|k| markdown.find(&format!("## {}", k.heading())).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(!markdown.contains("## FIGURES"));
    }

    #[tokio::test]
    async fn writes_document_report_and_figures() {
        let dir = tempfile::tempdir().unwrap();
        let draft = complete_draft();
        let figures: Vec<_> = draft.figures().iter().map(PlaceholderRenderer::draw).collect();
        let history = [72.0, 80.0];
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            status: "succeeded",
            stop_reason: "target-reached",
            redrafts: 1,
            score_history: &history,
        };

        let artifact = write_artifact(dir.path(), &draft, &report(), &figures, &summary)
            .await
            .unwrap();
        assert_eq!(artifact.figures.len(), 5);
        assert!(artifact.figures[0].ends_with("figures/FIG_1_System_Architecture.txt"));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&artifact.report).unwrap()).unwrap();
        assert_eq!(json["score"], 80.0);
        assert_eq!(json["stop_reason"], "target-reached");
        assert_eq!(json["score_history"], serde_json::json!([72.0, 80.0]));
        assert_eq!(json["report"]["recommendations"][0], "Add benchmarks");

        let markdown = std::fs::read_to_string(&artifact.document).unwrap();
        assert!(markdown.contains("(figures/FIG_3_Method_Flowchart.txt)"));
    }
}
