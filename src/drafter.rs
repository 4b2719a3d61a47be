//! Redactor de secciones: construye el contexto de cada ranura (extractos
//! del proyecto, referencias más relevantes y secciones ya finalizadas) y la
//! genera respetando el grafo de dependencias.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{info, warn};

use crate::analysis::InnovationAnalysis;
use crate::error::{GenerationError, SectionFailure};
use crate::llm::{GenerationPrompt, TextGenerator};
use crate::models::{Draft, InventorInfo, PriorArtReference, SectionKind, SourceBundle};
use crate::prior_art::ReferenceSet;

const DRAFTER_ROLE: &str = r#"You are an expert patent drafter specializing in AI and software patents.

CRITICAL REQUIREMENTS:
1. Focus on HOW the invention works, not just WHAT it does
2. Include specific hardware context (CPU, memory, storage)
3. Describe method steps in detail with data flows
4. Include multiple embodiments and variations
5. Write in plain engineering language, not legal jargon
6. Reference figure numbers (FIG. 1, FIG. 2, etc.)
7. Use reference numerals (101, 102, 103) for components

AVOID:
- Marketing language
- Absolute statements (always, never, must)
- Vague "uses AI/ML" without specifics
- Pure functional claims without implementation

Output only the text of the requested section, without headings or commentary."#;

/// Entradas de solo lectura compartidas por todas las secciones de un pase.
pub struct DraftInputs<'a> {
    pub bundle: &'a SourceBundle,
    pub references: &'a ReferenceSet,
    pub inventor: &'a InventorInfo,
    pub analysis: &'a InnovationAnalysis,
    pub title_hint: Option<&'a str>,
    pub field_hint: Option<&'a str>,
}

/// La parte recortable del contexto de una sección: análisis, secciones
/// precedentes, extractos y referencias.
#[derive(Debug, Clone, Default)]
struct Material {
    analysis: String,
    preceding: Vec<(SectionKind, String)>,
    excerpts: Vec<(String, String)>,
    references: Vec<PriorArtReference>,
}

impl Material {
    fn len(&self) -> usize {
        self.render().chars().count()
    }

    /// Reduce el material a `target` caracteres. Primero descarta las
    /// referencias menos relevantes, después trunca los extractos y, si aún
    /// no cabe, recorta análisis y secciones precedentes en proporción.
    fn shrink_to(&mut self, target: usize) {
        while self.len() > target && self.references.pop().is_some() {}

        let excess = self.len().saturating_sub(target);
        if excess > 0 {
            trim_proportionally(self.excerpts.iter_mut().map(|(_, text)| text), excess);
        }

        let excess = self.len().saturating_sub(target);
        if excess > 0 {
            let texts = std::iter::once(&mut self.analysis)
                .chain(self.preceding.iter_mut().map(|(_, text)| text));
            trim_proportionally(texts, excess);
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if !self.analysis.is_empty() {
            out.push_str(&self.analysis);
        }
        if !self.preceding.is_empty() {
            out.push_str("PRECEDING SECTIONS:\n");
            for (kind, text) in &self.preceding {
                out.push_str(&format!("## {}\n{}\n\n", kind.heading(), text));
            }
        }
        if !self.excerpts.is_empty() {
            out.push_str("RELEVANT SOURCE EXCERPTS:\n");
            for (path, excerpt) in &self.excerpts {
                out.push_str(&format!("--- {path}\n{excerpt}\n"));
            }
            out.push('\n');
        }
        if !self.references.is_empty() {
            out.push_str("PRIOR ART (most relevant first):\n");
            for r in &self.references {
                out.push_str(&format!(
                    "- {} | {} | {} | {}\n",
                    r.id, r.title, r.assignee, r.abstract_text
                ));
            }
            out.push('\n');
        }
        out
    }

    fn reference_ids(&self) -> Vec<String> {
        self.references.iter().map(|r| r.id.clone()).collect()
    }
}

/// Quita `excess` caracteres repartidos en proporción a la longitud de cada
/// texto.
fn trim_proportionally<'a>(texts: impl Iterator<Item = &'a mut String>, excess: usize) {
    let mut texts: Vec<&mut String> = texts.collect();
    let total: usize = texts.iter().map(|t| t.chars().count()).sum();
    if total == 0 {
        return;
    }
    let keep = total.saturating_sub(excess);
    for text in texts.iter_mut() {
        let allowed = text.chars().count() * keep / total;
        **text = text.chars().take(allowed).collect();
    }
}

struct SectionJob {
    kind: SectionKind,
    instructions: String,
    fixed_context: String,
    material: Material,
}

struct SectionOutcome {
    kind: SectionKind,
    calls: u32,
    result: Result<(String, Vec<String>), GenerationError>,
}

pub struct SectionDrafter {
    generator: Arc<dyn TextGenerator>,
    top_k: usize,
    excerpt_budget: usize,
}

impl SectionDrafter {
    pub fn new(generator: Arc<dyn TextGenerator>, top_k: usize, excerpt_budget: usize) -> Self {
        Self {
            generator,
            top_k,
            excerpt_budget,
        }
    }

    /// Redacta las nueve secciones.
    pub async fn draft_all(&self, inputs: &DraftInputs<'_>, draft: &mut Draft) -> Vec<SectionFailure> {
        let all: BTreeSet<SectionKind> = SectionKind::ALL.into_iter().collect();
        self.draft_sections(inputs, draft, &all, None).await
    }

    /// Reescribe sólo `sections`, el resto del borrador queda intacto.
    pub async fn redraft(
        &self,
        inputs: &DraftInputs<'_>,
        draft: &mut Draft,
        sections: &BTreeSet<SectionKind>,
        guidance: &str,
    ) -> Vec<SectionFailure> {
        self.draft_sections(inputs, draft, sections, Some(guidance)).await
    }

    /// Genera `targets` por oleadas: una sección entra en la oleada cuando
    /// todas sus dependencias dentro de `targets` ya se han resuelto en este
    /// pase. Las de una misma oleada se generan a la vez.
    async fn draft_sections(
        &self,
        inputs: &DraftInputs<'_>,
        draft: &mut Draft,
        targets: &BTreeSet<SectionKind>,
        guidance: Option<&str>,
    ) -> Vec<SectionFailure> {
        let references = inputs.references.top_k(self.top_k);
        let mut settled: BTreeSet<SectionKind> = BTreeSet::new();
        let mut failures = Vec::new();

        while settled.len() < targets.len() {
            let wave: Vec<SectionKind> = targets
                .iter()
                .copied()
                .filter(|kind| !settled.contains(kind))
                .filter(|kind| {
                    kind.dependencies()
                        .iter()
                        .all(|dep| !targets.contains(dep) || settled.contains(dep))
                })
                .collect();
            if wave.is_empty() {
                // El grafo es acíclico; esto sólo ocurre con dependencias mal formadas.
                break;
            }

            let current: &Draft = draft;
            let jobs: Vec<SectionJob> = wave
                .iter()
                .map(|kind| self.job(*kind, inputs, current, &references, guidance))
                .collect();
            let outcomes = futures::future::join_all(jobs.into_iter().map(|job| self.run(job))).await;

            for outcome in outcomes {
                let section = draft.section_mut(outcome.kind);
                for _ in 0..outcome.calls {
                    section.record_attempt();
                }
                match outcome.result {
                    Ok((text, refs)) => {
                        info!(section = %outcome.kind, attempts = section.attempts(), chars = text.len(), "Sección redactada");
                        section.finalize(text, refs);
                    }
                    Err(error) => {
                        warn!(section = %outcome.kind, error = %error, "La sección no pudo redactarse");
                        failures.push(SectionFailure {
                            section: outcome.kind,
                            error,
                        });
                    }
                }
                settled.insert(outcome.kind);
            }
        }
        failures
    }

    async fn run(&self, mut job: SectionJob) -> SectionOutcome {
        let mut calls = 0;
        let mut shrunk = false;
        loop {
            let prompt = GenerationPrompt {
                role: DRAFTER_ROLE.to_string(),
                instructions: job.instructions.clone(),
                context: format!("{}{}", job.fixed_context, job.material.render()),
            };
            calls += 1;
            match self.generator.generate(&prompt).await {
                Ok(text) => {
                    return SectionOutcome {
                        kind: job.kind,
                        calls,
                        result: Ok((text.trim().to_string(), job.material.reference_ids())),
                    };
                }
                Err(GenerationError::ContextTooLarge(msg)) if !shrunk => {
                    let before = job.material.len();
                    job.material.shrink_to(before / 2);
                    warn!(
                        section = %job.kind,
                        before,
                        after = job.material.len(),
                        "Contexto demasiado grande, recortando y reintentando: {msg}"
                    );
                    shrunk = true;
                }
                Err(err) => {
                    return SectionOutcome {
                        kind: job.kind,
                        calls,
                        result: Err(err),
                    };
                }
            }
        }
    }

    fn job(
        &self,
        kind: SectionKind,
        inputs: &DraftInputs<'_>,
        draft: &Draft,
        references: &[PriorArtReference],
        guidance: Option<&str>,
    ) -> SectionJob {
        let mut instructions = section_instructions(kind, inputs);
        if let Some(guidance) = guidance {
            instructions.push_str("\n\nREVISION GUIDANCE (the previous version scored low on these points):\n");
            instructions.push_str(guidance);
            if !draft.text(kind).is_empty() {
                instructions.push_str("\n\nPREVIOUS VERSION OF THIS SECTION:\n");
                instructions.push_str(draft.text(kind));
            }
        }

        let mut fixed_context = format!("PROJECT: {}\n\n", inputs.bundle.name());
        if matches!(kind, SectionKind::Cover) {
            let inventor = inputs.inventor;
            fixed_context.push_str(&format!(
                "INVENTOR:\nName: {}\nResidence: {}\nEntity status: {}\nAssignee: {}\n\n",
                inventor.name,
                inventor.address,
                inventor.entity_type,
                inventor.assignee.as_deref().unwrap_or("None"),
            ));
        }
        if matches!(kind, SectionKind::DrawingsIndex | SectionKind::DetailedDescription) {
            fixed_context.push_str("FIGURES:\n");
            for figure in draft.figures() {
                fixed_context.push_str(&format!("{} ({})\n", figure.brief(), figure.title));
                for (numeral, label) in &figure.numerals {
                    fixed_context.push_str(&format!("  {numeral}: {label}\n"));
                }
            }
            fixed_context.push('\n');
        }
        let preceding = kind
            .dependencies()
            .iter()
            .copied()
            .filter(|dep| !draft.text(*dep).is_empty())
            .map(|dep| (dep, draft.text(dep).to_string()))
            .collect();
        let analysis = if matches!(
            kind,
            SectionKind::Summary | SectionKind::DetailedDescription | SectionKind::Claims
        ) {
            inputs.analysis.render()
        } else {
            String::new()
        };

        SectionJob {
            kind,
            instructions,
            fixed_context,
            material: Material {
                analysis,
                preceding,
                excerpts: self.excerpts_for(kind, inputs.bundle),
                references: references.to_vec(),
            },
        }
    }

    /// Extractos de las señales del tema de la sección, hasta el presupuesto
    /// de caracteres. Sin coincidencias se usan los primeros fragmentos.
    fn excerpts_for(&self, kind: SectionKind, bundle: &SourceBundle) -> Vec<(String, String)> {
        let mut chosen: Vec<_> = bundle.with_signals(kind.signals()).collect();
        if chosen.is_empty() {
            chosen = bundle.fragments().iter().collect();
        }

        let mut used = 0;
        let mut out = Vec::new();
        for fragment in chosen {
            if used >= self.excerpt_budget {
                break;
            }
            let room = self.excerpt_budget - used;
            let excerpt: String = fragment.excerpt.chars().take(room).collect();
            used += excerpt.chars().count();
            out.push((fragment.path.clone(), excerpt));
        }
        out
    }
}

fn section_instructions(kind: SectionKind, inputs: &DraftInputs<'_>) -> String {
    let base = match kind {
        SectionKind::Cover => {
            "Write the provisional application cover sheet: invention title, inventor name and \
             residence, entity status, assignee and correspondence address. Use the inventor data given."
                .to_string()
        }
        SectionKind::Title => match inputs.title_hint {
            Some(title) => format!("Use exactly this title, corrected only for capitalization: {title}"),
            None => "Write a descriptive technical title of at most 100 characters. Output only the title."
                .to_string(),
        },
        SectionKind::Field => {
            let mut text = "Write the field of the invention in one or two sentences: \"The present \
                            invention relates generally to ..., and more particularly to ...\"."
                .to_string();
            if let Some(field) = inputs.field_hint {
                text.push_str(&format!(" The technical field is: {field}."));
            }
            text
        }
        SectionKind::Background => "Write the background in under 200 words. Describe conventional \
             approaches and their technical limitations without citing specific patents."
            .to_string(),
        SectionKind::Summary => "Write the summary: the high-level solution, one method embodiment \
             and one system embodiment with processor and memory, and the technical advantages."
            .to_string(),
        SectionKind::DrawingsIndex => "Write the brief description of the drawings: one paragraph per \
             figure starting with \"FIG. n\", following the figure plan."
            .to_string(),
        SectionKind::DetailedDescription => "Write the detailed description (2000+ words). Walk through \
             every figure (FIG. 1 to FIG. 5) using its reference numerals, describe the method as \
             numbered steps (step 302, step 304, ...), the hardware context, deployment, and several \
             alternative embodiments and variations."
            .to_string(),
        SectionKind::Claims => "Write informal claims numbered \"1.\", \"2.\", ...: one independent \
             method claim, one system claim and one non-transitory computer-readable medium claim, \
             each followed by dependent claims."
            .to_string(),
        SectionKind::Abstract => "Write the abstract in at most 150 words.".to_string(),
    };
    format!("Section: {}\n\n{}", kind.heading(), base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FigureSpec, Relevance, SignalKind, SourceFragment};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Generador que anota el orden de llamada y responde con el encabezado.
    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<String>>,
        contexts: Mutex<Vec<(String, String)>>,
        too_large_for: Option<&'static str>,
    }

    #[async_trait]
    impl TextGenerator for Recording {
        async fn generate(&self, prompt: &GenerationPrompt) -> Result<String, GenerationError> {
            let heading = prompt
                .instructions
                .lines()
                .next()
                .unwrap_or_default()
                .trim_start_matches("Section: ")
                .to_string();
            self.calls.lock().unwrap().push(heading.clone());
            self.contexts
                .lock()
                .unwrap()
                .push((heading.clone(), prompt.context.clone()));
            if self.too_large_for == Some(heading.as_str()) {
                return Err(GenerationError::ContextTooLarge("ventana excedida".into()));
            }
            Ok(format!("{heading} body with {} context chars", prompt.context.len()))
        }
    }

    fn bundle() -> SourceBundle {
        SourceBundle::new(
            "demo",
            vec![SourceFragment {
                path: "README.md".into(),
                excerpt: "The architecture routes sensor data through a fusion stage.".into(),
                signal: SignalKind::Architecture,
                language: Some("Markdown".into()),
            }],
        )
    }

    fn references() -> ReferenceSet {
        let mut set = ReferenceSet::default();
        for (id, score) in [("A", 0.9), ("B", 0.1), ("C", 0.5)] {
            set.insert(PriorArtReference {
                id: id.into(),
                title: format!("ref {id}"),
                abstract_text: String::new(),
                published: None,
                assignee: "Individual".into(),
                relevance: Relevance::Scored(score),
            });
        }
        set
    }

    #[tokio::test]
    async fn dependencies_are_finalized_before_dependents() {
        let generator = Arc::new(Recording::default());
        let drafter = SectionDrafter::new(generator.clone(), 2, 1000);
        let (bundle, refs, inventor) = (bundle(), references(), InventorInfo::default());
        let analysis = InnovationAnalysis::default();
        let inputs = DraftInputs {
            bundle: &bundle,
            references: &refs,
            inventor: &inventor,
            analysis: &analysis,
            title_hint: None,
            field_hint: None,
        };
        let mut draft = Draft::new(FigureSpec::standard_plan());

        let failures = drafter.draft_all(&inputs, &mut draft).await;
        assert!(failures.is_empty());
        assert!(draft.is_complete());

        let order = generator.calls.lock().unwrap().clone();
        let pos = |kind: SectionKind| order.iter().position(|h| h == kind.heading()).unwrap();
        assert_eq!(pos(SectionKind::Title), 0);
        for kind in SectionKind::ALL {
            for dep in kind.dependencies() {
                assert!(pos(*dep) < pos(kind), "{dep} antes que {kind}");
            }
        }
        assert_eq!(
            draft.section(SectionKind::Summary).references(),
            &["A".to_string(), "C".to_string()]
        );
        assert!(draft.sections().all(|s| s.attempts() == 1));
    }

    #[tokio::test]
    async fn context_too_large_shrinks_once_then_fails() {
        let generator = Arc::new(Recording {
            too_large_for: Some("DETAILED DESCRIPTION"),
            ..Default::default()
        });
        let drafter = SectionDrafter::new(generator.clone(), 5, 1000);
        let (bundle, refs, inventor) = (bundle(), references(), InventorInfo::default());
        let analysis = InnovationAnalysis::default();
        let inputs = DraftInputs {
            bundle: &bundle,
            references: &refs,
            inventor: &inventor,
            analysis: &analysis,
            title_hint: None,
            field_hint: None,
        };
        let mut draft = Draft::new(FigureSpec::standard_plan());

        let failures = drafter.draft_all(&inputs, &mut draft).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].section, SectionKind::DetailedDescription);
        assert_eq!(draft.section(SectionKind::DetailedDescription).attempts(), 2);
        assert_eq!(draft.missing(), vec![SectionKind::DetailedDescription]);

        let sizes: Vec<usize> = generator
            .contexts
            .lock()
            .unwrap()
            .iter()
            .filter(|(heading, _)| heading == "DETAILED DESCRIPTION")
            .map(|(_, context)| context.chars().count())
            .collect();
        assert_eq!(sizes.len(), 2);
        assert!(sizes[1] < sizes[0], "{sizes:?}");
    }

    #[tokio::test]
    async fn analysis_reaches_only_the_inventive_sections() {
        let generator = Arc::new(Recording::default());
        let drafter = SectionDrafter::new(generator.clone(), 5, 1000);
        let (bundle, refs, inventor) = (bundle(), references(), InventorInfo::default());
        let analysis = InnovationAnalysis {
            innovations: "Jitter-aware batching".into(),
            differentiators: vec!["Batches follow sensor jitter".into()],
        };
        let inputs = DraftInputs {
            bundle: &bundle,
            references: &refs,
            inventor: &inventor,
            analysis: &analysis,
            title_hint: None,
            field_hint: None,
        };
        let mut draft = Draft::new(FigureSpec::standard_plan());
        drafter.draft_all(&inputs, &mut draft).await;

        let contexts = generator.contexts.lock().unwrap().clone();
        assert_eq!(contexts.len(), 9);
        for (heading, context) in contexts {
            let inventive = ["SUMMARY", "DETAILED DESCRIPTION", "CLAIMS"]
                .iter()
                .any(|h| heading.starts_with(h));
            assert_eq!(context.contains("TECHNICAL INNOVATIONS:\nJitter-aware batching"), inventive, "{heading}");
            assert_eq!(context.contains("- Batches follow sensor jitter"), inventive, "{heading}");
        }
    }

    #[tokio::test]
    async fn redraft_touches_only_requested_sections() {
        let generator = Arc::new(Recording::default());
        let drafter = SectionDrafter::new(generator.clone(), 5, 1000);
        let (bundle, refs, inventor) = (bundle(), references(), InventorInfo::default());
        let analysis = InnovationAnalysis::default();
        let inputs = DraftInputs {
            bundle: &bundle,
            references: &refs,
            inventor: &inventor,
            analysis: &analysis,
            title_hint: Some("Sensor Fusion Router"),
            field_hint: None,
        };
        let mut draft = Draft::new(FigureSpec::standard_plan());
        drafter.draft_all(&inputs, &mut draft).await;
        let before = draft.clone();

        let targets: BTreeSet<_> = [SectionKind::Claims].into_iter().collect();
        let failures = drafter.redraft(&inputs, &mut draft, &targets, "Add more claims").await;
        assert!(failures.is_empty());
        for kind in SectionKind::ALL {
            let expected = if kind == SectionKind::Claims { 2 } else { 1 };
            assert_eq!(draft.section(kind).attempts(), expected, "{kind}");
            if kind != SectionKind::Claims {
                assert_eq!(draft.text(kind), before.text(kind));
            }
        }
    }

    #[test]
    fn shrinking_drops_references_before_touching_excerpts() {
        let mut material = Material {
            excerpts: vec![("a.rs".into(), "abcdefgh".into())],
            references: references().top_k(3),
            ..Default::default()
        };
        let target = material.len() - 10;
        material.shrink_to(target);
        assert_eq!(material.reference_ids(), vec!["A".to_string(), "C".to_string()]);
        assert_eq!(material.excerpts[0].1, "abcdefgh");
        assert!(material.len() <= target);
    }

    #[test]
    fn shrinking_reaches_preceding_sections_last() {
        let mut material = Material {
            preceding: vec![(SectionKind::Summary, "s".repeat(400))],
            excerpts: vec![("a.rs".into(), "e".repeat(100))],
            references: references().top_k(3),
            ..Default::default()
        };
        let before = material.len();
        material.shrink_to(before / 2);

        assert!(material.references.is_empty());
        assert!(material.excerpts[0].1.is_empty());
        let summary = &material.preceding[0].1;
        assert!(!summary.is_empty() && summary.len() < 400);
        assert!(material.len() <= before / 2);
    }
}
