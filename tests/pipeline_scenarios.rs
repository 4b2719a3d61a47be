//! Ejecuciones completas del orquestador con colaboradores en memoria.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use disclosure_pipeline::error::{GenerationError, IntegrityViolation, ServiceError};
use disclosure_pipeline::figures::PlaceholderRenderer;
use disclosure_pipeline::llm::{GenerationPrompt, TextGenerator};
use disclosure_pipeline::models::{
    PriorArtReference, Relevance, SectionKind, SignalKind, SourceBundle, SourceFragment,
};
use disclosure_pipeline::prior_art::{PatentIndex, SearchPage, SearchQuery};
use disclosure_pipeline::rubric::{Category, GradeBand, LineItem, Measure, Rubric, Tier};
use disclosure_pipeline::{
    Orchestrator, PipelineConfig, PipelineError, RunOutcome, RunStatus, Stage, StopReason,
};

type Script = dyn Fn(SectionKind, u32) -> Result<String, GenerationError> + Send + Sync;

const ANALYSIS_REPLY: &str = "1. Sensor readings are fused before batching\n2. Batches follow the edge node load";

/// Generador que identifica la sección por la primera línea de las
/// instrucciones y responde según `script(sección, número de llamada)`.
/// Las tareas de análisis reciben siempre `ANALYSIS_REPLY`.
struct ScriptedGenerator {
    calls: Mutex<HashMap<SectionKind, u32>>,
    analysis_calls: Mutex<u32>,
    script: Box<Script>,
}

impl ScriptedGenerator {
    fn new(
        script: impl Fn(SectionKind, u32) -> Result<String, GenerationError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(HashMap::new()),
            analysis_calls: Mutex::new(0),
            script: Box::new(script),
        })
    }

    fn calls(&self, kind: SectionKind) -> u32 {
        self.calls.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        if prompt.instructions.starts_with("Task: ") {
            *self.analysis_calls.lock().unwrap() += 1;
            return Ok(ANALYSIS_REPLY.to_string());
        }
        let heading = prompt
            .instructions
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("Section: "))
            .unwrap_or_default();
        let kind = SectionKind::ALL
            .into_iter()
            .find(|k| k.heading() == heading)
            .expect("prompt sin sección reconocible");
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let entry = calls.entry(kind).or_insert(0);
            *entry += 1;
            *entry
        };
        (self.script)(kind, call)
    }
}

/// Índice que devuelve siempre la misma página.
struct FixedIndex {
    records: Vec<PriorArtReference>,
}

#[async_trait]
impl PatentIndex for FixedIndex {
    async fn fetch_page(&self, _query: &SearchQuery, _cursor: Option<&str>) -> Result<SearchPage, ServiceError> {
        Ok(SearchPage {
            records: self.records.clone(),
            next_cursor: None,
        })
    }
}

fn empty_index() -> Arc<FixedIndex> {
    Arc::new(FixedIndex { records: Vec::new() })
}

fn one_fragment() -> SourceBundle {
    SourceBundle::new(
        "router",
        vec![SourceFragment {
            path: "README.md".into(),
            excerpt: "The router fuses sensor readings and schedules inference batches on the edge node."
                .into(),
            signal: SignalKind::Architecture,
            language: Some("Markdown".into()),
        }],
    )
}

fn config(dir: &tempfile::TempDir) -> PipelineConfig {
    PipelineConfig {
        output_dir: dir.path().to_path_buf(),
        run_timeout: Duration::from_secs(30),
        ..PipelineConfig::default()
    }
}

fn filler(kind: SectionKind, call: u32) -> Result<String, GenerationError> {
    Ok(format!("{} text, version {call}.", kind.key()))
}

fn orchestrator(
    cfg: PipelineConfig,
    generator: Arc<ScriptedGenerator>,
    index: Arc<FixedIndex>,
) -> Orchestrator {
    Orchestrator::new(cfg, generator, index, Arc::new(PlaceholderRenderer)).unwrap()
}

#[tokio::test]
async fn single_fragment_without_prior_art_completes() {
    let dir = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::new(filler);
    let outcome = orchestrator(config(&dir), generator.clone(), empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Done { run, report, artifact } = outcome else {
        panic!("la ejecución debía terminar en Done");
    };
    assert_eq!(run.stage(), Stage::Done);
    assert!(run.references.is_empty());
    assert!(run.draft.is_complete());
    assert!(!run.reports.is_empty());
    assert!(run.redrafts_used <= 2);
    assert!(report.total >= 0.0 && report.total <= report.max);
    assert!(artifact.document.exists());
    assert_eq!(artifact.figures.len(), 5);
    // La rúbrica estándar no alcanza 90 con texto de relleno.
    assert_eq!(run.status(), RunStatus::BudgetExhausted);
    assert_eq!(run.stop_reason(), Some(StopReason::RedraftLimit));
    // Sin estado de la técnica sólo se analiza la innovación.
    assert_eq!(run.analysis.innovations, ANALYSIS_REPLY);
    assert!(run.analysis.differentiators.is_empty());
    assert_eq!(*generator.analysis_calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn detailed_description_too_large_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::new(|kind, call| {
        if kind == SectionKind::DetailedDescription {
            Err(GenerationError::ContextTooLarge("prompt is too long".into()))
        } else {
            filler(kind, call)
        }
    });
    let outcome = orchestrator(config(&dir), generator.clone(), empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Failed { run, failure } = outcome else {
        panic!("la ejecución debía fallar");
    };
    assert_eq!(failure.stage, Stage::Drafting);
    assert_eq!(run.stage(), Stage::Failed);
    assert_eq!(run.status(), RunStatus::Failed);
    match failure.error {
        PipelineError::Integrity(IntegrityViolation::SectionsFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].section, SectionKind::DetailedDescription);
        }
        other => panic!("error inesperado: {other:?}"),
    }
    assert_eq!(run.draft.missing(), vec![SectionKind::DetailedDescription]);
    assert_eq!(generator.calls(SectionKind::DetailedDescription), 2);
    assert!(run.reports.is_empty());
}

/// Rúbrica de tres categorías: "alpha" en el resumen vale 72, "beta" en la
/// descripción detallada 18 y "gamma" en las reivindicaciones 10.
fn three_word_rubric() -> Rubric {
    let category = |key: &str, points: f64, section: SectionKind| Category {
        key: key.to_string(),
        label: key.to_uppercase(),
        max_points: points,
        sections: vec![section],
        items: vec![LineItem {
            key: format!("{key}_mentioned"),
            max_points: points,
            measure: Measure::Keywords {
                keywords: vec![key.to_string()],
            },
            scope: vec![section],
            tiers: vec![Tier {
                at_least: 1.0,
                points,
            }],
            floor: 0.0,
            recommendation: Some(format!("Mention {key}")),
        }],
    };
    Rubric {
        categories: vec![
            category("alpha", 72.0, SectionKind::Summary),
            category("beta", 18.0, SectionKind::DetailedDescription),
            category("gamma", 10.0, SectionKind::Claims),
        ],
        red_flags: Vec::new(),
        bonuses: Vec::new(),
        bonus_cap: 0.0,
        grades: vec![
            GradeBand {
                at_least: 90.0,
                label: "Pass".into(),
            },
            GradeBand {
                at_least: 0.0,
                label: "Fail".into(),
            },
        ],
        max_recommendations: 10,
    }
}

#[tokio::test]
async fn one_redraft_of_the_two_weakest_categories_reaches_target() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        rubric: three_word_rubric(),
        target_score: 90.0,
        max_redrafts: 2,
        redraft_categories: 2,
        ..config(&dir)
    };
    let generator = ScriptedGenerator::new(|kind, call| match (kind, call) {
        (SectionKind::Summary, _) => Ok("An alpha summary.".into()),
        (SectionKind::DetailedDescription, 2..) => Ok("Detailed beta description.".into()),
        (SectionKind::Claims, 2..) => Ok("1. A gamma method.".into()),
        _ => filler(kind, call),
    });
    let outcome = orchestrator(cfg, generator.clone(), empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Done { run, report, .. } = outcome else {
        panic!("la ejecución debía terminar en Done");
    };
    assert_eq!(run.score_history(), vec![72.0, 100.0]);
    assert_eq!(run.redrafts_used, 1);
    assert_eq!(report.total, 100.0);
    assert_eq!(report.grade, "Pass");
    assert_eq!(run.status(), RunStatus::Succeeded);

    let attempts = run.section_attempts();
    let redrafted: BTreeSet<SectionKind> = attempts
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(k, _)| *k)
        .collect();
    assert_eq!(
        redrafted,
        BTreeSet::from([SectionKind::DetailedDescription, SectionKind::Claims])
    );
    assert_eq!(attempts[&SectionKind::Summary], 1);
    assert_eq!(run.draft.text(SectionKind::Summary), "An alpha summary.");
}

#[tokio::test]
async fn worse_redraft_restores_the_best_pass() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        rubric: three_word_rubric(),
        target_score: 95.0,
        max_redrafts: 1,
        ..config(&dir)
    };
    // Las dos categorías más débiles tras el primer pase son gamma y alpha;
    // la reescritura pierde "alpha" en el resumen.
    let generator = ScriptedGenerator::new(|kind, call| match (kind, call) {
        (SectionKind::Summary, 1) => Ok("An alpha summary.".into()),
        (SectionKind::DetailedDescription, _) => Ok("Detailed beta description.".into()),
        _ => filler(kind, call),
    });
    let outcome = orchestrator(cfg, generator, empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Done { run, report, .. } = outcome else {
        panic!("la ejecución debía terminar en Done");
    };
    assert_eq!(run.score_history(), vec![90.0, 18.0]);
    assert_eq!(report.total, 90.0);
    assert_eq!(run.status(), RunStatus::BudgetExhausted);
    assert_eq!(run.draft.text(SectionKind::Summary), "An alpha summary.");
    assert_eq!(run.section_attempts()[&SectionKind::Summary], 2);
    assert_eq!(run.section_attempts()[&SectionKind::DetailedDescription], 1);
}

/// Primer pase a 72 con la rúbrica de tres palabras: se reescriben la
/// descripción detallada y las reivindicaciones, y la segunda llamada a la
/// descripción detallada devuelve `error`.
fn failing_detailed_redraft(
    error: fn() -> GenerationError,
) -> Arc<ScriptedGenerator> {
    ScriptedGenerator::new(move |kind, call| match (kind, call) {
        (SectionKind::Summary, _) => Ok("An alpha summary.".into()),
        (SectionKind::DetailedDescription, 2) => Err(error()),
        (SectionKind::Claims, 2..) => Ok("1. A gamma method.".into()),
        _ => filler(kind, call),
    })
}

#[tokio::test]
async fn failed_redraft_section_keeps_its_previous_text() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        rubric: three_word_rubric(),
        max_redrafts: 1,
        ..config(&dir)
    };
    let generator =
        failing_detailed_redraft(|| GenerationError::ContentPolicyRejected("rechazado".into()));
    let outcome = orchestrator(cfg, generator.clone(), empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Done { run, report, .. } = outcome else {
        panic!("la ejecución debía terminar en Done");
    };
    assert_eq!(
        run.draft.text(SectionKind::DetailedDescription),
        "detailed_description text, version 1."
    );
    assert_eq!(run.draft.text(SectionKind::Claims), "1. A gamma method.");
    assert_eq!(generator.calls(SectionKind::DetailedDescription), 2);
    assert_eq!(run.section_attempts()[&SectionKind::DetailedDescription], 2);
    assert_eq!(run.score_history(), vec![72.0, 82.0]);
    assert_eq!(report.total, 82.0);
    assert_eq!(run.status(), RunStatus::BudgetExhausted);
    assert_eq!(run.stop_reason(), Some(StopReason::RedraftLimit));
}

#[tokio::test]
async fn backend_loss_during_redraft_fails_at_redrafting() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        rubric: three_word_rubric(),
        ..config(&dir)
    };
    let generator =
        failing_detailed_redraft(|| GenerationError::BackendUnavailable("todos caídos".into()));
    let outcome = orchestrator(cfg, generator, empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Failed { run, failure } = outcome else {
        panic!("la ejecución debía fallar");
    };
    assert_eq!(failure.stage, Stage::Redrafting);
    assert!(matches!(failure.error, PipelineError::BackendUnavailable(_)));
    assert_eq!(run.stage(), Stage::Failed);
    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.score_history(), vec![72.0]);
    assert_eq!(run.redrafts_used, 1);
}

#[tokio::test]
async fn exhausted_request_budget_stops_redrafting_early() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        rubric: three_word_rubric(),
        max_redrafts: 2,
        ..config(&dir)
    };
    let generator =
        failing_detailed_redraft(|| GenerationError::BudgetExhausted("generation".into()));
    let outcome = orchestrator(cfg, generator.clone(), empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Done { run, .. } = outcome else {
        panic!("la ejecución debía terminar en Done");
    };
    // El pase en curso se puntúa, pero no se intenta una segunda reescritura.
    assert_eq!(run.score_history(), vec![72.0, 82.0]);
    assert_eq!(run.redrafts_used, 1);
    assert_eq!(generator.calls(SectionKind::DetailedDescription), 2);
    assert_eq!(
        run.draft.text(SectionKind::DetailedDescription),
        "detailed_description text, version 1."
    );
    assert_eq!(run.status(), RunStatus::BudgetExhausted);
    assert_eq!(run.stop_reason(), Some(StopReason::RequestBudget));
}

#[tokio::test]
async fn categories_without_sections_end_refinement() {
    let dir = tempfile::tempdir().unwrap();
    let mut rubric = three_word_rubric();
    for category in &mut rubric.categories {
        category.sections.clear();
    }
    let cfg = PipelineConfig {
        rubric,
        max_redrafts: 2,
        ..config(&dir)
    };
    let generator = ScriptedGenerator::new(|kind, call| match kind {
        SectionKind::Summary => Ok("An alpha summary.".into()),
        _ => filler(kind, call),
    });
    let outcome = orchestrator(cfg, generator, empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Done { run, artifact, .. } = outcome else {
        panic!("la ejecución debía terminar en Done");
    };
    assert_eq!(run.score_history(), vec![72.0]);
    assert_eq!(run.redrafts_used, 0);
    assert_eq!(run.status(), RunStatus::BudgetExhausted);
    assert_eq!(run.stop_reason(), Some(StopReason::NothingToRedraft));

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&artifact.report).unwrap()).unwrap();
    assert_eq!(json["stop_reason"], "nothing-to-redraft");
}

#[tokio::test]
async fn duplicate_search_hits_are_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let reference = |id: &str| PriorArtReference {
        id: id.into(),
        title: format!("Sensor router {id}"),
        abstract_text: "Routing sensor readings to inference batches.".into(),
        published: None,
        assignee: "Individual".into(),
        relevance: Relevance::Unscored,
    };
    let index = Arc::new(FixedIndex {
        records: vec![reference("US1"), reference("US2"), reference("US1")],
    });
    let bundle = SourceBundle::new(
        "router",
        vec![
            SourceFragment {
                path: "README.md".into(),
                excerpt: "The router fuses sensor readings on the edge node.".into(),
                signal: SignalKind::Architecture,
                language: None,
            },
            SourceFragment {
                path: "benches/batch.rs".into(),
                excerpt: "Benchmark: batching latency throughput measurements.".into(),
                signal: SignalKind::Benchmark,
                language: Some("Rust".into()),
            },
        ],
    );
    let outcome = orchestrator(config(&dir), ScriptedGenerator::new(filler), index)
        .run(bundle)
        .await;

    let run = outcome.run();
    let ids: Vec<&str> = run.references.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["US1", "US2"]);
    assert_eq!(
        run.analysis.differentiators,
        vec![
            "Sensor readings are fused before batching".to_string(),
            "Batches follow the edge node load".to_string(),
        ]
    );
    assert!(run
        .references
        .iter()
        .all(|r| matches!(r.relevance, Relevance::Scored(_))));
}

#[tokio::test]
async fn unavailable_backends_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let generator = ScriptedGenerator::new(|_, _| {
        Err(GenerationError::BackendUnavailable("todos caídos".into()))
    });
    let outcome = orchestrator(config(&dir), generator, empty_index())
        .run(one_fragment())
        .await;

    let RunOutcome::Failed { failure, .. } = outcome else {
        panic!("la ejecución debía fallar");
    };
    assert_eq!(failure.stage, Stage::Drafting);
    assert!(matches!(failure.error, PipelineError::BackendUnavailable(_)));
}

#[tokio::test]
async fn empty_bundle_fails_while_ingesting() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = orchestrator(config(&dir), ScriptedGenerator::new(filler), empty_index())
        .run(SourceBundle::default())
        .await;

    let RunOutcome::Failed { run, failure } = outcome else {
        panic!("la ejecución debía fallar");
    };
    assert_eq!(failure.stage, Stage::Ingesting);
    assert!(matches!(
        failure.error,
        PipelineError::Integrity(IntegrityViolation::EmptySourceBundle)
    ));
    assert_eq!(run.status(), RunStatus::Failed);
}

/// Generador que analiza al instante pero nunca termina una sección.
struct Stalled;

#[async_trait]
impl TextGenerator for Stalled {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
        if prompt.instructions.starts_with("Task: ") {
            return Ok(ANALYSIS_REPLY.to_string());
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(String::new())
    }
}

#[tokio::test]
async fn run_timeout_keeps_partial_state() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        run_timeout: Duration::from_millis(100),
        ..config(&dir)
    };
    let orchestrator =
        Orchestrator::new(cfg, Arc::new(Stalled), empty_index(), Arc::new(PlaceholderRenderer)).unwrap();
    let outcome = orchestrator.run(one_fragment()).await;

    let RunOutcome::Failed { run, failure } = outcome else {
        panic!("la ejecución debía agotar su tiempo");
    };
    assert_eq!(failure.stage, Stage::Drafting);
    assert!(matches!(failure.error, PipelineError::RunTimeout(_)));
    assert_eq!(run.bundle.len(), 1);
    assert!(!orchestrator.status().snapshot().is_busy);
}

#[tokio::test]
async fn runs_from_a_project_directory() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(
        source.path().join("README.md"),
        "The architecture routes sensor readings through a fusion module.",
    )
    .unwrap();
    let out = tempfile::tempdir().unwrap();
    let outcome = orchestrator(config(&out), ScriptedGenerator::new(filler), empty_index())
        .run_directory(source.path())
        .await;

    assert!(outcome.is_done());
    assert_eq!(outcome.run().bundle.fragments()[0].path, "README.md");
    assert!(out.path().join("score_report.json").exists());
}
