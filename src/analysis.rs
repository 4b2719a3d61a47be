//! Análisis previo a la redacción: qué innovaciones técnicas contiene el
//! proyecto y en qué se diferencian del estado de la técnica encontrado.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::info;

use crate::error::GenerationError;
use crate::llm::{GenerationPrompt, TextGenerator};
use crate::models::{PriorArtReference, SourceBundle};

const MAX_DIFFERENTIATORS: usize = 8;
const INNOVATIONS_IN_PROMPT: usize = 6000;

/// Elementos de lista numerada o con viñeta.
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:\d+[.)]|[-*•])\s+(.+)$").expect("patrón de lista válido")
});

const ANALYST_ROLE: &str = "You are a patent analyst identifying patentable innovations in \
software and AI systems. Focus on technical implementation details, not business value.";

/// Resultado del análisis; vacío si el generador no respondió.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InnovationAnalysis {
    pub innovations: String,
    pub differentiators: Vec<String>,
}

impl InnovationAnalysis {
    pub fn is_empty(&self) -> bool {
        self.innovations.is_empty() && self.differentiators.is_empty()
    }

    /// Bloque de contexto para las secciones que describen la invención.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.innovations.is_empty() {
            out.push_str("TECHNICAL INNOVATIONS:\n");
            out.push_str(&self.innovations);
            out.push_str("\n\n");
        }
        if !self.differentiators.is_empty() {
            out.push_str("DIFFERENTIATION FROM PRIOR ART:\n");
            for point in &self.differentiators {
                out.push_str(&format!("- {point}\n"));
            }
            out.push('\n');
        }
        out
    }
}

pub struct Analyst {
    generator: Arc<dyn TextGenerator>,
    context_budget: usize,
}

impl Analyst {
    pub fn new(generator: Arc<dyn TextGenerator>, context_budget: usize) -> Self {
        Self {
            generator,
            context_budget,
        }
    }

    /// Innovaciones patentables del proyecto: título técnico, funcionamiento
    /// paso a paso, novedad y reivindicaciones posibles.
    pub async fn innovations(&self, bundle: &SourceBundle) -> Result<String, GenerationError> {
        let mut context = format!("PROJECT: {}\n\n", bundle.name());
        for fragment in bundle.fragments() {
            if context.len() >= self.context_budget {
                break;
            }
            context.push_str(&format!("--- {}\n{}\n", fragment.path, fragment.excerpt));
        }
        let context: String = context.chars().take(self.context_budget).collect();

        let prompt = GenerationPrompt {
            role: ANALYST_ROLE.to_string(),
            instructions: "Task: innovation analysis\n\n\
                Identify every potentially patentable element of this project: novel algorithms \
                or methods, system architectures, technical improvements (performance, efficiency, \
                resource usage) and AI/ML innovations. For each one give a technical title, HOW it \
                works step by step, what makes it novel, and potential method or system claims."
                .to_string(),
            context,
        };
        let text = self.generator.generate(&prompt).await?;
        info!(chars = text.len(), "Análisis de innovaciones completado");
        Ok(text.trim().to_string())
    }

    /// Puntos que distinguen la invención de `references`.
    pub async fn differentiators(
        &self,
        innovations: &str,
        references: &[PriorArtReference],
    ) -> Result<Vec<String>, GenerationError> {
        let mut context = String::from("INVENTION:\n");
        context.extend(innovations.chars().take(INNOVATIONS_IN_PROMPT));
        context.push_str("\n\nPRIOR ART FOUND:\n");
        for r in references {
            context.push_str(&format!("- {} | {} | {}\n", r.id, r.title, r.abstract_text));
        }

        let prompt = GenerationPrompt {
            role: ANALYST_ROLE.to_string(),
            instructions: "Task: novelty analysis\n\n\
                Compare the invention with the prior art. Assess novelty and non-obviousness, then \
                list 5 to 8 key technical differentiators as a numbered list, one per line."
                .to_string(),
            context,
        };
        let text = self.generator.generate(&prompt).await?;
        let points = differentiation_points(&text);
        info!(points = points.len(), "Puntos de diferenciación extraídos");
        Ok(points)
    }
}

/// Elementos de lista de entre 10 y 100 caracteres, sin repetir y en orden
/// de aparición. Los más largos se cortan a 100.
pub fn differentiation_points(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut points = Vec::new();
    for caps in LIST_ITEM.captures_iter(text) {
        let item = caps[1].trim().trim_matches('*').trim();
        if item.chars().count() < 10 {
            continue;
        }
        let item: String = item.chars().take(100).collect();
        if seen.insert(item.clone()) {
            points.push(item);
        }
        if points.len() == MAX_DIFFERENTIATORS {
            break;
        }
    }
    points
}
