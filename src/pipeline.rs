//! Orquestador: máquina de estados de una ejecución completa, desde la
//! ingesta hasta el artefacto puntuado.
//!
//! `Ingesting → Searching → Drafting → Scoring → (Redrafting ⟲ Scoring) →
//! Assembling → Done`, con `Failed` alcanzable desde cualquier etapa no
//! terminal. La ejecución entera corre bajo un único límite de tiempo.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::{Analyst, InnovationAnalysis};
use crate::client::ApiClient;
use crate::config::PipelineConfig;
use crate::drafter::{DraftInputs, SectionDrafter};
use crate::error::{GenerationError, IntegrityViolation, PipelineError, SectionFailure};
use crate::export::{self, Artifact, RunSummary};
use crate::figures::{self, FallbackRenderer, FigureRenderer};
use crate::ingest::ingest_directory;
use crate::llm::{GenerationAdapter, TextGenerator};
use crate::models::{Draft, FigureSpec, InventorInfo, SectionKind, SourceBundle};
use crate::prior_art::{derive_queries, key_terms, PatentIndex, PatentsView, PriorArtSearcher, ReferenceSet};
use crate::run_state::StatusHandle;
use crate::scorer::{ScoreReport, Scorer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Ingesting,
    Searching,
    Drafting,
    Scoring,
    Redrafting,
    Assembling,
    Done,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Transiciones permitidas; las etapas terminales no tienen salida.
    pub fn allows(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Ingesting, Searching)
            | (Searching, Drafting)
            | (Drafting, Scoring)
            | (Scoring, Redrafting)
            | (Scoring, Assembling)
            | (Redrafting, Scoring)
            | (Assembling, Done) => true,
            _ => false,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Ingesting => "ingesting",
            Self::Searching => "searching",
            Self::Drafting => "drafting",
            Self::Scoring => "scoring",
            Self::Redrafting => "redrafting",
            Self::Assembling => "assembling",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn progress(self) -> (&'static str, f32) {
        match self {
            Self::Ingesting => ("Ingiriendo fuentes del proyecto...", 0.05),
            Self::Searching => ("Buscando estado de la técnica...", 0.15),
            Self::Drafting => ("Redactando secciones...", 0.30),
            Self::Scoring => ("Puntuando el borrador...", 0.70),
            Self::Redrafting => ("Reescribiendo las secciones más débiles...", 0.75),
            Self::Assembling => ("Ensamblando el artefacto final...", 0.90),
            Self::Done => ("Ejecución completada.", 1.0),
            Self::Failed => ("Ejecución fallida.", 1.0),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Estado final de una ejecución. Sólo sale de `InProgress` una vez.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    InProgress,
    Succeeded,
    BudgetExhausted,
    Failed,
}

impl RunStatus {
    pub fn key(self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::BudgetExhausted => "budget-exhausted",
            Self::Failed => "failed",
        }
    }
}

/// Por qué terminó el bucle de puntuación y reescritura.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    TargetReached,
    RedraftLimit,
    RequestBudget,
    /// Las categorías más débiles no implican ninguna sección reescribible.
    NothingToRedraft,
}

impl StopReason {
    pub fn key(self) -> &'static str {
        match self {
            Self::TargetReached => "target-reached",
            Self::RedraftLimit => "redraft-limit",
            Self::RequestBudget => "request-budget",
            Self::NothingToRedraft => "nothing-to-redraft",
        }
    }
}

/// Todo lo que una ejecución produce. Pertenece en exclusiva al orquestador.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    stage: Stage,
    status: RunStatus,
    pub bundle: SourceBundle,
    pub analysis: InnovationAnalysis,
    pub references: ReferenceSet,
    pub draft: Draft,
    /// Informes de cada pase de puntuación, el más antiguo primero.
    pub reports: Vec<ScoreReport>,
    pub redrafts_used: u32,
    stop_reason: Option<StopReason>,
}

impl PipelineRun {
    pub fn new(bundle: SourceBundle) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            stage: Stage::Ingesting,
            status: RunStatus::InProgress,
            bundle,
            analysis: InnovationAnalysis::default(),
            references: ReferenceSet::default(),
            draft: Draft::new(FigureSpec::standard_plan()),
            reports: Vec::new(),
            redrafts_used: 0,
            stop_reason: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    pub fn advance(&mut self, next: Stage) -> Result<(), IntegrityViolation> {
        if !self.stage.allows(next) {
            return Err(IntegrityViolation::IllegalTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        self.stage = next;
        Ok(())
    }

    fn conclude(&mut self, status: RunStatus) -> Result<(), IntegrityViolation> {
        if self.status != RunStatus::InProgress || status == RunStatus::InProgress {
            return Err(IntegrityViolation::IllegalTransition {
                from: self.status.key().to_string(),
                to: status.key().to_string(),
            });
        }
        self.status = status;
        Ok(())
    }

    /// Sin efecto si la ejecución ya tiene estado final.
    fn fail(&mut self) {
        if self.status != RunStatus::InProgress {
            return;
        }
        if !self.stage.is_terminal() {
            self.stage = Stage::Failed;
        }
        self.status = RunStatus::Failed;
    }

    pub fn section_attempts(&self) -> BTreeMap<SectionKind, u32> {
        self.draft.sections().map(|s| (s.kind, s.attempts())).collect()
    }

    pub fn score_history(&self) -> Vec<f64> {
        self.reports.iter().map(|r| r.total).collect()
    }
}

/// Etapa en la que falló la ejecución y el motivo.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: PipelineError,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fallo en la etapa {}: {}", self.stage, self.error)
    }
}

/// Toda ejecución termina exactamente en una de estas dos variantes. La
/// variante fallida conserva el estado parcial de la ejecución.
#[derive(Debug)]
pub enum RunOutcome {
    Done {
        run: PipelineRun,
        report: ScoreReport,
        artifact: Artifact,
    },
    Failed {
        run: PipelineRun,
        failure: StageFailure,
    },
}

impl RunOutcome {
    pub fn run(&self) -> &PipelineRun {
        match self {
            Self::Done { run, .. } | Self::Failed { run, .. } => run,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

pub struct Orchestrator {
    config: PipelineConfig,
    searcher: PriorArtSearcher,
    analyst: Analyst,
    drafter: SectionDrafter,
    scorer: Scorer,
    renderer: Arc<dyn FigureRenderer>,
    status: StatusHandle,
    inventor: InventorInfo,
    title_hint: Option<String>,
    field_hint: Option<String>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        generator: Arc<dyn TextGenerator>,
        index: Arc<dyn PatentIndex>,
        renderer: Arc<dyn FigureRenderer>,
    ) -> Result<Self, PipelineError> {
        let scorer = Scorer::new(config.rubric.clone())?;
        let searcher = PriorArtSearcher::new(index, config.search.max_results);
        let analyst = Analyst::new(generator.clone(), config.analysis_budget_chars);
        let drafter = SectionDrafter::new(generator, config.top_k_references, config.excerpt_budget_chars);
        Ok(Self {
            config,
            searcher,
            analyst,
            drafter,
            scorer,
            renderer,
            status: StatusHandle::new("Listo."),
            inventor: InventorInfo::default(),
            title_hint: None,
            field_hint: None,
        })
    }

    /// Colaboradores reales: backends rig, PatentsView y servicio de diagramas.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let generator = Arc::new(GenerationAdapter::from_config(&config));
        let index = Arc::new(PatentsView::new(
            ApiClient::new("patent-search", config.search_limits.clone()),
            &config.search,
        ));
        let renderer = Arc::new(FallbackRenderer::from_config(&config));
        Self::new(config, generator, index, renderer)
    }

    pub fn with_inventor(mut self, inventor: InventorInfo) -> Self {
        self.inventor = inventor;
        self
    }

    pub fn with_hints(mut self, title: Option<String>, field: Option<String>) -> Self {
        self.title_hint = title;
        self.field_hint = field;
        self
    }

    pub fn with_status(mut self, status: StatusHandle) -> Self {
        self.status = status;
        self
    }

    pub fn status(&self) -> &StatusHandle {
        &self.status
    }

    /// Ejecuta el pipeline sobre un bundle ya construido.
    pub async fn run(&self, bundle: SourceBundle) -> RunOutcome {
        self.execute(PipelineRun::new(bundle), None).await
    }

    /// Ingiere `source` dentro de la propia ejecución y continúa.
    pub async fn run_directory(&self, source: &Path) -> RunOutcome {
        self.execute(PipelineRun::new(SourceBundle::default()), Some(source.to_path_buf()))
            .await
    }

    async fn execute(&self, mut run: PipelineRun, source: Option<PathBuf>) -> RunOutcome {
        info!(run_id = %run.id, "Iniciando ejecución del pipeline");
        self.status.begin("Iniciando ejecución...");

        let limit = self.config.run_timeout;
        let result = match tokio::time::timeout(limit, self.drive(&mut run, source)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::RunTimeout(limit)),
        };

        match result {
            Ok((report, artifact)) => {
                info!(
                    run_id = %run.id,
                    status = run.status().key(),
                    score = report.total,
                    grade = %report.grade,
                    redrafts = run.redrafts_used,
                    "Ejecución completada"
                );
                self.status
                    .finish(format!("Completado: {:.1}/{:.0} ({})", report.total, report.max, report.grade));
                RunOutcome::Done {
                    run,
                    report,
                    artifact,
                }
            }
            Err(error) => {
                let stage = run.stage();
                error!(run_id = %run.id, stage = %stage, error = %error, "La ejecución ha fallado");
                run.fail();
                self.status.finish(format!("Error en {stage}: {error}"));
                RunOutcome::Failed {
                    run,
                    failure: StageFailure { stage, error },
                }
            }
        }
    }

    async fn drive(
        &self,
        run: &mut PipelineRun,
        source: Option<PathBuf>,
    ) -> Result<(ScoreReport, Artifact), PipelineError> {
        // --- Ingesting ---
        self.report_progress(Stage::Ingesting);
        if let Some(source) = source {
            let status = self.status.within(0.05, 0.15);
            let (bundle, summary) =
                tokio::task::spawn_blocking(move || ingest_directory(&source, &status))
                    .await
                    .map_err(|e| PipelineError::Ingest(e.to_string()))??;
            info!(run_id = %run.id, "{summary}");
            run.bundle = bundle;
        }
        if run.bundle.is_empty() {
            return Err(IntegrityViolation::EmptySourceBundle.into());
        }

        // --- Searching (con el análisis de innovaciones alrededor) ---
        self.enter(run, Stage::Searching)?;
        let window = self.status.within(0.15, 0.30);
        window.progress("Analizando innovaciones del proyecto...", 0.0);
        self.analyze(run).await;
        window.progress("Buscando estado de la técnica...", 0.3);
        self.search(run).await;
        window.progress("Analizando la diferenciación frente al estado de la técnica...", 0.8);
        self.differentiate(run).await;

        // --- Drafting ---
        self.enter(run, Stage::Drafting)?;
        let inputs = self.inputs(&run.bundle, &run.references, &run.analysis);
        let failures = self.drafter.draft_all(&inputs, &mut run.draft).await;
        drafting_outcome(failures)?;

        // --- Scoring / Redrafting ---
        let best = self.refine(run).await?;

        // --- Assembling ---
        self.enter(run, Stage::Assembling)?;
        let (best_index, snapshot) = best;
        if best_index + 1 != run.reports.len() {
            info!(
                run_id = %run.id,
                pass = best_index + 1,
                score = run.reports[best_index].total,
                "Restaurando el borrador del mejor pase"
            );
            run.draft.restore(&snapshot);
        }
        if !run.draft.is_complete() {
            return Err(IntegrityViolation::IncompleteDraft(run.draft.missing()).into());
        }
        let report = run.reports[best_index].clone();
        let status = if report.total >= self.config.target_score {
            RunStatus::Succeeded
        } else {
            RunStatus::BudgetExhausted
        };

        let figures = figures::render_all(self.renderer.as_ref(), run.draft.figures()).await;
        let history = run.score_history();
        let summary = RunSummary {
            run_id: run.id,
            status: status.key(),
            stop_reason: run.stop_reason.map_or("", StopReason::key),
            redrafts: run.redrafts_used,
            score_history: &history,
        };
        let artifact =
            export::write_artifact(&self.config.output_dir, &run.draft, &report, &figures, &summary).await?;

        self.enter(run, Stage::Done)?;
        run.conclude(status)?;
        Ok((report, artifact))
    }

    /// Bucle de puntuación y reescritura. Devuelve el índice del mejor pase
    /// y una copia de su texto.
    async fn refine(
        &self,
        run: &mut PipelineRun,
    ) -> Result<(usize, BTreeMap<SectionKind, (String, Vec<String>)>), PipelineError> {
        let mut best: Option<(usize, BTreeMap<SectionKind, (String, Vec<String>)>)> = None;
        let mut budget_hit = false;

        loop {
            self.enter(run, Stage::Scoring)?;
            let report = self.scorer.score(&run.draft)?;
            let pass = run.reports.len();
            info!(
                run_id = %run.id,
                pass = pass + 1,
                score = report.total,
                grade = %report.grade,
                "Borrador puntuado"
            );

            let improved = best
                .as_ref()
                .map_or(true, |(index, _)| report.total > run.reports[*index].total);
            if improved {
                best = Some((pass, run.draft.snapshot()));
            }

            let total = report.total;
            let targets = self
                .scorer
                .implicated_sections(&report, self.config.redraft_categories);
            let guidance = redraft_guidance(&report, self.config.redraft_categories);
            run.reports.push(report);

            let stop = if total >= self.config.target_score {
                Some(StopReason::TargetReached)
            } else if budget_hit {
                Some(StopReason::RequestBudget)
            } else if run.redrafts_used >= self.config.max_redrafts {
                Some(StopReason::RedraftLimit)
            } else if targets.is_empty() {
                Some(StopReason::NothingToRedraft)
            } else {
                None
            };
            if let Some(reason) = stop {
                match reason {
                    StopReason::TargetReached => {}
                    StopReason::NothingToRedraft => info!(
                        run_id = %run.id,
                        score = total,
                        target = self.config.target_score,
                        "Las categorías más débiles no implican secciones, no hay nada que reescribir"
                    ),
                    _ => info!(
                        run_id = %run.id,
                        score = total,
                        target = self.config.target_score,
                        redrafts = run.redrafts_used,
                        reason = reason.key(),
                        "Sin presupuesto de reescritura, se ensambla el mejor borrador"
                    ),
                }
                run.stop_reason = Some(reason);
                break;
            }

            self.enter(run, Stage::Redrafting)?;
            run.redrafts_used += 1;
            let sections: Vec<&str> = targets.iter().map(|s| s.key()).collect();
            info!(run_id = %run.id, redraft = run.redrafts_used, sections = ?sections, "Reescribiendo secciones");

            let inputs = self.inputs(&run.bundle, &run.references, &run.analysis);
            let failures = self
                .drafter
                .redraft(&inputs, &mut run.draft, &targets, &guidance)
                .await;
            for failure in failures {
                match failure.error {
                    GenerationError::BackendUnavailable(_) => return Err(failure.error.into()),
                    GenerationError::BudgetExhausted(_) => budget_hit = true,
                    _ => warn!(
                        section = %failure.section,
                        error = %failure.error,
                        "Se conserva la versión anterior de la sección"
                    ),
                }
            }
        }

        best.ok_or_else(|| IntegrityViolation::IncompleteDraft(run.draft.missing()).into())
    }

    /// Un análisis fallido no detiene la ejecución: se redacta sin él.
    async fn analyze(&self, run: &mut PipelineRun) {
        match self.analyst.innovations(&run.bundle).await {
            Ok(innovations) => run.analysis.innovations = innovations,
            Err(err) => warn!(run_id = %run.id, error = %err, "Análisis de innovaciones fallido, se continúa sin él"),
        }
    }

    async fn differentiate(&self, run: &mut PipelineRun) {
        if run.analysis.innovations.is_empty() || run.references.is_empty() {
            return;
        }
        let references = run.references.top_k(self.config.top_k_references);
        match self.analyst.differentiators(&run.analysis.innovations, &references).await {
            Ok(points) => run.analysis.differentiators = points,
            Err(err) => warn!(run_id = %run.id, error = %err, "Análisis de diferenciación fallido"),
        }
    }

    /// Una búsqueda fallida no detiene la ejecución: se sigue sin referencias.
    async fn search(&self, run: &mut PipelineRun) {
        let today = Utc::now().date_naive();
        let queries = derive_queries(&run.bundle, &self.config.search, today);
        if queries.is_empty() {
            info!(run_id = %run.id, "Sin términos clave, se continúa sin estado de la técnica");
            return;
        }

        let (mut references, failures) = self.searcher.gather(&queries).await;
        if !failures.is_empty() {
            warn!(
                run_id = %run.id,
                failed = failures.len(),
                queries = queries.len(),
                "Consultas de estado de la técnica fallidas"
            );
        }
        references.score_relevance(&key_terms(&run.bundle, 20));
        info!(run_id = %run.id, references = references.len(), "Estado de la técnica recopilado");
        run.references = references;
    }

    fn inputs<'a>(
        &'a self,
        bundle: &'a SourceBundle,
        references: &'a ReferenceSet,
        analysis: &'a InnovationAnalysis,
    ) -> DraftInputs<'a> {
        DraftInputs {
            bundle,
            references,
            analysis,
            inventor: &self.inventor,
            title_hint: self.title_hint.as_deref(),
            field_hint: self.field_hint.as_deref(),
        }
    }

    fn enter(&self, run: &mut PipelineRun, stage: Stage) -> Result<(), PipelineError> {
        run.advance(stage)?;
        info!(run_id = %run.id, stage = %stage, "Cambio de etapa");
        self.report_progress(stage);
        Ok(())
    }

    fn report_progress(&self, stage: Stage) {
        let (message, fraction) = stage.progress();
        self.status.progress(message, fraction);
    }
}

/// Un backend caído falla la ejecución; un presupuesto agotado deja el
/// borrador incompleto; cualquier otra sección fallida es de integridad.
fn drafting_outcome(failures: Vec<SectionFailure>) -> Result<(), PipelineError> {
    if failures.is_empty() {
        return Ok(());
    }
    if let Some(failure) = failures.iter().find(|f| {
        matches!(
            f.error,
            GenerationError::BackendUnavailable(_) | GenerationError::BudgetExhausted(_)
        )
    }) {
        return Err(failure.error.clone().into());
    }
    Err(IntegrityViolation::SectionsFailed(failures).into())
}

/// Indicaciones para la reescritura a partir de las categorías más débiles.
fn redraft_guidance(report: &ScoreReport, categories: usize) -> String {
    let mut lines = Vec::new();
    for category in report.lowest_categories(categories) {
        let mut line = format!(
            "- {}: {:.1}/{:.1} points",
            category.label, category.awarded, category.max
        );
        if let Some(weakest) = &category.weakest {
            line.push_str(&format!(
                "; weakest item '{}' ({:.1}/{:.1})",
                weakest.item, weakest.awarded, weakest.max
            ));
        }
        lines.push(line);
    }
    lines.extend(report.recommendations.iter().take(5).map(|r| format!("- {r}")));
    lines.join("\n")
}
