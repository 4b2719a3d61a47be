//! Modelos de dominio: fragmentos de código fuente, referencias de estado de
//! la técnica, secciones del borrador y el plan de figuras.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// FUENTES
// ---------------------------------------------------------------------------

/// Tipo de señal detectada en un fragmento del proyecto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Architecture,
    Algorithm,
    Benchmark,
    Interface,
    Configuration,
    Documentation,
    Code,
}

impl SignalKind {
    pub const ALL: [SignalKind; 7] = [
        SignalKind::Architecture,
        SignalKind::Algorithm,
        SignalKind::Benchmark,
        SignalKind::Interface,
        SignalKind::Configuration,
        SignalKind::Documentation,
        SignalKind::Code,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Architecture => "architecture",
            Self::Algorithm => "algorithm",
            Self::Benchmark => "benchmark",
            Self::Interface => "interface",
            Self::Configuration => "configuration",
            Self::Documentation => "documentation",
            Self::Code => "code",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Un trozo de texto extraído de un fichero del proyecto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFragment {
    pub path: String,
    pub excerpt: String,
    pub signal: SignalKind,
    pub language: Option<String>,
}

/// Colección ordenada e inmutable de fragmentos. Se construye una vez por
/// ejecución y sólo se expone en lectura.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceBundle {
    name: String,
    fragments: Vec<SourceFragment>,
}

impl SourceBundle {
    pub fn new(name: impl Into<String>, fragments: Vec<SourceFragment>) -> Self {
        Self {
            name: name.into(),
            fragments,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fragments(&self) -> &[SourceFragment] {
        &self.fragments
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Fragmentos cuyo tipo de señal está en `signals`, en el orden original.
    pub fn with_signals<'a>(
        &'a self,
        signals: &'a [SignalKind],
    ) -> impl Iterator<Item = &'a SourceFragment> + 'a {
        self.fragments
            .iter()
            .filter(move |f| signals.contains(&f.signal))
    }

    /// Número de fragmentos por tipo de señal.
    pub fn signal_counts(&self) -> BTreeMap<SignalKind, usize> {
        let mut counts = BTreeMap::new();
        for fragment in &self.fragments {
            *counts.entry(fragment.signal).or_insert(0) += 1;
        }
        counts
    }
}

// ---------------------------------------------------------------------------
// ESTADO DE LA TÉCNICA
// ---------------------------------------------------------------------------

/// Etiqueta de relevancia: nace sin puntuar y se puntúa tras la búsqueda.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "kebab-case")]
pub enum Relevance {
    #[default]
    Unscored,
    Scored(f64),
}

impl Relevance {
    /// Valor comparable; las referencias sin puntuar quedan al final.
    pub fn rank(self) -> f64 {
        match self {
            Self::Unscored => -1.0,
            Self::Scored(v) => v,
        }
    }
}

/// Registro normalizado de una divulgación existente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorArtReference {
    pub id: String,
    pub title: String,
    pub abstract_text: String,
    pub published: Option<NaiveDate>,
    pub assignee: String,
    pub relevance: Relevance,
}

// ---------------------------------------------------------------------------
// BORRADOR
// ---------------------------------------------------------------------------

/// Las nueve ranuras fijas del documento, en orden de salida.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectionKind {
    Cover,
    Title,
    Field,
    Background,
    Summary,
    DrawingsIndex,
    DetailedDescription,
    Claims,
    Abstract,
}

impl SectionKind {
    pub const ALL: [SectionKind; 9] = [
        SectionKind::Cover,
        SectionKind::Title,
        SectionKind::Field,
        SectionKind::Background,
        SectionKind::Summary,
        SectionKind::DrawingsIndex,
        SectionKind::DetailedDescription,
        SectionKind::Claims,
        SectionKind::Abstract,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Cover => "cover",
            Self::Title => "title",
            Self::Field => "field",
            Self::Background => "background",
            Self::Summary => "summary",
            Self::DrawingsIndex => "drawings-index",
            Self::DetailedDescription => "detailed-description",
            Self::Claims => "claims",
            Self::Abstract => "abstract",
        }
    }

    /// Encabezado usado en el documento final.
    pub fn heading(self) -> &'static str {
        match self {
            Self::Cover => "PROVISIONAL APPLICATION COVER SHEET",
            Self::Title => "TITLE OF THE INVENTION",
            Self::Field => "FIELD OF THE INVENTION",
            Self::Background => "BACKGROUND",
            Self::Summary => "SUMMARY",
            Self::DrawingsIndex => "BRIEF DESCRIPTION OF THE DRAWINGS",
            Self::DetailedDescription => "DETAILED DESCRIPTION",
            Self::Claims => "CLAIMS",
            Self::Abstract => "ABSTRACT",
        }
    }

    /// Secciones que deben estar finalizadas antes de redactar ésta.
    /// La descripción detallada es la única narrativa que ve todas las demás.
    pub fn dependencies(self) -> &'static [SectionKind] {
        use SectionKind::*;
        match self {
            Title => &[],
            Cover => &[Title],
            Field => &[Title],
            DrawingsIndex => &[Title],
            Background => &[Title, Field],
            Summary => &[Title, Field, Background],
            DetailedDescription => &[Title, Field, Background, Summary, DrawingsIndex],
            Claims => &[Title, Summary, DetailedDescription],
            Abstract => &[Title, Summary, Claims],
        }
    }

    /// Señales del proyecto relevantes para el tema de la sección.
    pub fn signals(self) -> &'static [SignalKind] {
        use SignalKind::*;
        match self {
            Self::Cover | Self::Title => &[Documentation, Architecture],
            Self::Field => &[Documentation, Architecture, Configuration],
            Self::Background => &[Documentation, Benchmark],
            Self::Summary => &[Architecture, Algorithm, Documentation],
            Self::DrawingsIndex => &[Architecture, Interface],
            Self::DetailedDescription => {
                &[Architecture, Algorithm, Benchmark, Interface, Configuration, Code]
            }
            Self::Claims => &[Algorithm, Architecture, Code],
            Self::Abstract => &[Architecture, Documentation],
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.key() == key)
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Una ranura del borrador. Se reescribe en sitio al redactarla de nuevo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftSection {
    pub kind: SectionKind,
    text: String,
    attempts: u32,
    references: Vec<String>,
}

impl DraftSection {
    pub fn new(kind: SectionKind) -> Self {
        Self {
            kind,
            text: String::new(),
            attempts: 0,
            references: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Identificadores de las referencias usadas en la última generación.
    pub fn references(&self) -> &[String] {
        &self.references
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Cuenta una llamada de generación; nunca decrece.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn finalize(&mut self, text: String, references: Vec<String>) {
        self.text = text;
        self.references = references;
    }
}

/// Mapa ordenado sección → contenido, vivo durante una ejecución.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Draft {
    sections: BTreeMap<SectionKind, DraftSection>,
    figures: Vec<FigureSpec>,
}

impl Draft {
    pub fn new(figures: Vec<FigureSpec>) -> Self {
        let sections = SectionKind::ALL
            .into_iter()
            .map(|kind| (kind, DraftSection::new(kind)))
            .collect();
        Self { sections, figures }
    }

    pub fn section(&self, kind: SectionKind) -> &DraftSection {
        // Las nueve ranuras se crean en `new` y nunca se eliminan.
        &self.sections[&kind]
    }

    pub fn section_mut(&mut self, kind: SectionKind) -> &mut DraftSection {
        self.sections
            .entry(kind)
            .or_insert_with(|| DraftSection::new(kind))
    }

    pub fn text(&self, kind: SectionKind) -> &str {
        self.section(kind).text()
    }

    pub fn sections(&self) -> impl Iterator<Item = &DraftSection> {
        self.sections.values()
    }

    pub fn figures(&self) -> &[FigureSpec] {
        &self.figures
    }

    /// Ranuras aún vacías, en orden de documento.
    pub fn missing(&self) -> Vec<SectionKind> {
        self.sections
            .values()
            .filter(|s| s.is_empty())
            .map(|s| s.kind)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// Copia de los textos actuales, usada para restaurar el mejor pase.
    pub fn snapshot(&self) -> BTreeMap<SectionKind, (String, Vec<String>)> {
        self.sections
            .iter()
            .map(|(k, s)| (*k, (s.text.clone(), s.references.clone())))
            .collect()
    }

    /// Restaura textos de un `snapshot` sin tocar los contadores de intentos.
    pub fn restore(&mut self, snapshot: &BTreeMap<SectionKind, (String, Vec<String>)>) {
        for (kind, (text, refs)) in snapshot {
            self.section_mut(*kind).finalize(text.clone(), refs.clone());
        }
    }

    /// Número de reivindicaciones numeradas ("1.", "2.", ...).
    pub fn claim_count(&self) -> usize {
        self.text(SectionKind::Claims)
            .lines()
            .filter(|line| {
                let trimmed = line.trim_start();
                let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
                digits > 0 && trimmed[digits..].starts_with('.')
            })
            .count()
    }
}

// ---------------------------------------------------------------------------
// FIGURAS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagramKind {
    SystemArchitecture,
    BlockDiagram,
    Flowchart,
    DataFlow,
}

impl DiagramKind {
    pub fn prompt_hint(self) -> &'static str {
        match self {
            Self::SystemArchitecture => {
                "technical system architecture diagram showing components and connections"
            }
            Self::BlockDiagram => "hardware block diagram with labeled components and signal flows",
            Self::Flowchart => {
                "detailed flowchart with decision diamonds, process rectangles, and directional arrows"
            }
            Self::DataFlow => "data flow diagram showing data transformations and storage",
        }
    }
}

/// Figura planificada, referenciada por número secuencial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FigureSpec {
    pub number: u32,
    pub title: String,
    pub description: String,
    pub kind: DiagramKind,
    pub numerals: Vec<(u32, String)>,
}

impl FigureSpec {
    /// Plan fijo de cinco figuras con sus numerales de referencia.
    pub fn standard_plan() -> Vec<FigureSpec> {
        fn spec(
            number: u32,
            title: &str,
            description: &str,
            kind: DiagramKind,
            numerals: &[(u32, &str)],
        ) -> FigureSpec {
            FigureSpec {
                number,
                title: title.to_string(),
                description: description.to_string(),
                kind,
                numerals: numerals.iter().map(|(n, l)| (*n, l.to_string())).collect(),
            }
        }

        vec![
            spec(
                1,
                "System Architecture",
                "illustrates a system 100 according to various embodiments.",
                DiagramKind::SystemArchitecture,
                &[
                    (100, "System"),
                    (101, "Client Interface"),
                    (102, "Processing Engine"),
                    (103, "Data Store"),
                    (104, "Network Interface"),
                ],
            ),
            spec(
                2,
                "Hardware Block Diagram",
                "illustrates a computing device 200 suitable for implementing aspects of the invention.",
                DiagramKind::BlockDiagram,
                &[
                    (200, "Computing Device"),
                    (201, "Processor"),
                    (202, "Memory"),
                    (203, "Storage"),
                    (204, "Network Interface"),
                    (205, "I/O Controller"),
                ],
            ),
            spec(
                3,
                "Method Flowchart",
                "is a flowchart illustrating a method 300 according to various embodiments.",
                DiagramKind::Flowchart,
                &[
                    (300, "Method"),
                    (302, "Receive Input"),
                    (304, "Process Data"),
                    (306, "Generate Output"),
                    (308, "End"),
                ],
            ),
            spec(
                4,
                "Data Flow Diagram",
                "illustrates data flow 400 through the system according to various embodiments.",
                DiagramKind::DataFlow,
                &[
                    (400, "Data Flow"),
                    (401, "Raw Input"),
                    (402, "Preprocessing"),
                    (403, "Core Processing"),
                    (404, "Output Generation"),
                ],
            ),
            spec(
                5,
                "Alternative Embodiment",
                "illustrates an alternative implementation 500 according to various embodiments.",
                DiagramKind::SystemArchitecture,
                &[
                    (500, "Alternative System"),
                    (501, "Distributed Nodes"),
                    (502, "Central Coordinator"),
                    (503, "Results Aggregation"),
                ],
            ),
        ]
    }

    /// Nombre de fichero `FIG_<n>_<Titulo>`, sin extensión.
    pub fn file_stem(&self) -> String {
        let title: String = self
            .title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("FIG_{}_{}", self.number, title)
    }

    /// Línea "FIG. n ..." usada en el índice de dibujos.
    pub fn brief(&self) -> String {
        format!("FIG. {} {}", self.number, self.description)
    }
}

// ---------------------------------------------------------------------------
// INVENTOR
// ---------------------------------------------------------------------------

/// Metadatos del inventor recogidos fuera del pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventorInfo {
    pub name: String,
    pub address: String,
    pub entity_type: String,
    pub assignee: Option<String>,
}

impl Default for InventorInfo {
    fn default() -> Self {
        Self {
            name: "Inventor Name".to_string(),
            address: "123 Main St, City, ST 12345, United States".to_string(),
            entity_type: "Micro Entity".to_string(),
            assignee: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_draft_has_nine_empty_slots_in_order() {
        let draft = Draft::new(FigureSpec::standard_plan());
        let kinds: Vec<_> = draft.sections().map(|s| s.kind).collect();
        assert_eq!(kinds, SectionKind::ALL.to_vec());
        assert_eq!(draft.missing().len(), 9);
        assert!(!draft.is_complete());
    }

    #[test]
    fn dependency_graph_is_acyclic() {
        let mut done: Vec<SectionKind> = Vec::new();
        while done.len() < SectionKind::ALL.len() {
            let ready: Vec<_> = SectionKind::ALL
                .into_iter()
                .filter(|k| !done.contains(k))
                .filter(|k| k.dependencies().iter().all(|d| done.contains(d)))
                .collect();
            assert!(!ready.is_empty(), "ciclo en las dependencias: {done:?}");
            done.extend(ready);
        }
        let detailed = done
            .iter()
            .position(|k| *k == SectionKind::DetailedDescription);
        let summary = done.iter().position(|k| *k == SectionKind::Summary);
        assert!(summary < detailed);
    }

    #[test]
    fn restore_keeps_attempt_counters() {
        let mut draft = Draft::new(Vec::new());
        let section = draft.section_mut(SectionKind::Summary);
        section.record_attempt();
        section.finalize("primera".into(), vec![]);
        let snap = draft.snapshot();

        let section = draft.section_mut(SectionKind::Summary);
        section.record_attempt();
        section.finalize("segunda".into(), vec![]);

        draft.restore(&snap);
        assert_eq!(draft.text(SectionKind::Summary), "primera");
        assert_eq!(draft.section(SectionKind::Summary).attempts(), 2);
    }

    #[test]
    fn claim_count_reads_numbered_lines() {
        let mut draft = Draft::new(Vec::new());
        draft.section_mut(SectionKind::Claims).finalize(
            "1. A method comprising:\n   receiving data.\n2. The method of claim 1.\n10. A system.".into(),
            vec![],
        );
        assert_eq!(draft.claim_count(), 3);
    }

    #[test]
    fn figure_stem_replaces_spaces() {
        let plan = FigureSpec::standard_plan();
        assert_eq!(plan[1].file_stem(), "FIG_2_Hardware_Block_Diagram");
        assert_eq!(plan.len(), 5);
        assert_eq!(plan[4].file_stem(), "FIG_5_Alternative_Embodiment");
        let numerals: Vec<u32> = plan[4].numerals.iter().map(|(n, _)| *n).collect();
        assert_eq!(numerals, vec![500, 501, 502, 503]);
    }

    #[test]
    fn unscored_references_rank_last() {
        assert!(Relevance::Unscored.rank() < Relevance::Scored(0.0).rank());
    }
}
