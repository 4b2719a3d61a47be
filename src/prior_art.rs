//! Búsqueda de estado de la técnica: consultas estructuradas contra un índice
//! de patentes, paginación perezosa y normalización a `PriorArtReference`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::config::SearchSettings;
use crate::error::ServiceError;
use crate::models::{PriorArtReference, Relevance, SignalKind, SourceBundle};

const ABSTRACT_MAX_CHARS: usize = 500;

/// Prefijos CPC por área tecnológica.
const CPC_PREFIXES: &[(&str, &str)] = &[
    ("ai", "G06N"),
    ("machine_learning", "G06N20"),
    ("neural_networks", "G06N3"),
    ("nlp", "G06F40"),
    ("computer_vision", "G06V"),
    ("software", "G06F"),
    ("networking", "H04L"),
    ("security", "G06F21"),
    ("blockchain", "G06Q20"),
    ("robotics", "B25J"),
    ("iot", "H04W4"),
    ("cloud", "G06F9"),
    ("database", "G06F16"),
];

const STOP_WORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "will", "which", "their", "there", "these",
    "those", "into", "when", "where", "what", "been", "were", "they", "them", "then",
    "than", "also", "each", "such", "only", "other", "some", "more", "most", "about",
    "would", "could", "should", "using", "used", "uses", "self", "none", "true", "false",
    "return", "import", "function", "const", "class", "public", "private", "string",
    "value", "data", "file", "files", "type", "http", "https", "www", "todo", "pass",
];

/// Prefijo de clasificación para un área; las desconocidas caen en G06N.
pub fn classification_prefix(area: &str) -> &'static str {
    let key = area.trim().to_lowercase();
    CPC_PREFIXES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, code)| *code)
        .unwrap_or("G06N")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub since: NaiveDate,
    pub until: Option<NaiveDate>,
}

impl DateRange {
    /// Los últimos `years` años hasta `today`.
    /// Si el año resultante no es representable se usa `NaiveDate::MIN`.
    pub fn last_years(years: u32, today: NaiveDate) -> Self {
        let year = i32::try_from(years)
            .ok()
            .and_then(|years| today.year().checked_sub(years));
        let since = year
            .and_then(|year| {
                today
                    .with_year(year)
                    // 29 de febrero en un año no bisiesto.
                    .or_else(|| NaiveDate::from_ymd_opt(year, today.month(), 28))
            })
            .unwrap_or(NaiveDate::MIN);
        Self { since, until: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub terms: Vec<String>,
    pub classification_prefix: Option<String>,
    pub date_range: Option<DateRange>,
    pub page_size: usize,
}

/// Una página normalizada devuelta por el índice.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub records: Vec<PriorArtReference>,
    pub next_cursor: Option<String>,
}

/// Índice de patentes consultable página a página.
#[async_trait]
pub trait PatentIndex: Send + Sync {
    async fn fetch_page(
        &self,
        query: &SearchQuery,
        cursor: Option<&str>,
    ) -> Result<SearchPage, ServiceError>;
}

// ---------------------------------------------------------------------------
// PATENTSVIEW
// ---------------------------------------------------------------------------

/// Adaptador para la API de búsqueda de PatentsView.
pub struct PatentsView {
    client: ApiClient,
    base_url: String,
    api_key: Option<String>,
}

impl PatentsView {
    pub fn new(client: ApiClient, settings: &SearchSettings) -> Self {
        Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
        }
    }

    /// Parámetros `q`, `f`, `o` y `s` serializados como JSON.
    pub fn query_params(query: &SearchQuery, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut conditions = vec![json!({ "_text_any": { "patent_abstract": query.terms.join(" ") } })];
        if let Some(prefix) = &query.classification_prefix {
            conditions.push(json!({ "cpc_current.cpc_group_id": { "_begins": prefix } }));
        }
        if let Some(range) = &query.date_range {
            conditions.push(json!({ "_gte": { "patent_date": range.since.to_string() } }));
            if let Some(until) = range.until {
                conditions.push(json!({ "_lte": { "patent_date": until.to_string() } }));
            }
        }

        let fields = json!([
            "patent_id",
            "patent_title",
            "patent_abstract",
            "patent_date",
            "assignees.assignee_organization"
        ]);
        let mut options = json!({ "size": query.page_size });
        if let Some(after) = cursor {
            options["after"] = json!(after);
        }
        let sort = json!([{ "patent_id": "asc" }]);

        vec![
            ("q", json!({ "_and": conditions }).to_string()),
            ("f", fields.to_string()),
            ("o", options.to_string()),
            ("s", sort.to_string()),
        ]
    }
}

#[derive(Debug, Deserialize)]
struct PvResponse {
    #[serde(default)]
    patents: Option<Vec<PvPatent>>,
}

#[derive(Debug, Deserialize)]
struct PvPatent {
    patent_id: Option<String>,
    patent_title: Option<String>,
    patent_abstract: Option<String>,
    patent_date: Option<String>,
    #[serde(default)]
    assignees: Option<Vec<PvAssignee>>,
}

#[derive(Debug, Deserialize)]
struct PvAssignee {
    assignee_organization: Option<String>,
}

impl PvPatent {
    fn normalize(self) -> Option<PriorArtReference> {
        let id = self.patent_id.filter(|id| !id.trim().is_empty())?;
        let assignee = self
            .assignees
            .unwrap_or_default()
            .into_iter()
            .find_map(|a| a.assignee_organization)
            .unwrap_or_else(|| "Individual".to_string());
        Some(PriorArtReference {
            id,
            title: self.patent_title.unwrap_or_default(),
            abstract_text: self
                .patent_abstract
                .unwrap_or_default()
                .chars()
                .take(ABSTRACT_MAX_CHARS)
                .collect(),
            published: self
                .patent_date
                .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            assignee,
            relevance: Relevance::Unscored,
        })
    }
}

#[async_trait]
impl PatentIndex for PatentsView {
    async fn fetch_page(
        &self,
        query: &SearchQuery,
        cursor: Option<&str>,
    ) -> Result<SearchPage, ServiceError> {
        let params = Self::query_params(query, cursor);
        let response: PvResponse = self
            .client
            .call_json("patentsview.search", |http| {
                let mut request = http.get(self.base_url.as_str()).query(&params);
                if let Some(key) = &self.api_key {
                    request = request.header("X-Api-Key", key);
                }
                request
            })
            .await?;

        let raw = response.patents.unwrap_or_default();
        let full_page = raw.len() >= query.page_size;
        let records: Vec<PriorArtReference> = raw.into_iter().filter_map(PvPatent::normalize).collect();
        let next_cursor = if full_page {
            records.last().map(|r| r.id.clone())
        } else {
            None
        };
        Ok(SearchPage {
            records,
            next_cursor,
        })
    }
}

// ---------------------------------------------------------------------------
// BÚSQUEDA PEREZOSA
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PriorArtSearcher {
    index: Arc<dyn PatentIndex>,
    max_results: usize,
}

impl PriorArtSearcher {
    pub fn new(index: Arc<dyn PatentIndex>, max_results: usize) -> Self {
        Self { index, max_results }
    }

    /// Secuencia de resultados para `query`. No se pide nada hasta consumirla.
    pub fn search(&self, query: SearchQuery) -> PriorArtSearch {
        PriorArtSearch {
            index: self.index.clone(),
            query,
            max_results: self.max_results,
        }
    }

    /// Ejecuta todas las consultas a la vez y las funde en un único registro.
    /// Las consultas que fallan se registran y se omiten.
    pub async fn gather(&self, queries: &[SearchQuery]) -> (ReferenceSet, Vec<ServiceError>) {
        let results = futures::future::join_all(queries.iter().map(|q| {
            let search = self.search(q.clone());
            async move { search.collect().await }
        }))
        .await;

        let mut references = ReferenceSet::default();
        let mut failures = Vec::new();
        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(found) => {
                    info!(terms = %query.terms.join(" "), found = found.len(), "Consulta de estado de la técnica completada");
                    references.extend(found);
                }
                Err(err) => {
                    warn!(terms = %query.terms.join(" "), error = %err, "Consulta de estado de la técnica fallida");
                    failures.push(err);
                }
            }
        }
        (references, failures)
    }
}

/// Secuencia finita y reiniciable: cada llamada a `stream` vuelve a empezar
/// desde la primera página. Si una página posterior repite un identificador,
/// la secuencia lo emite de nuevo y la versión más reciente prevalece.
pub struct PriorArtSearch {
    index: Arc<dyn PatentIndex>,
    query: SearchQuery,
    max_results: usize,
}

struct Cursor {
    next: Option<String>,
    buffer: VecDeque<PriorArtReference>,
    seen: HashSet<String>,
    yielded: usize,
    exhausted: bool,
    failed: bool,
}

impl PriorArtSearch {
    pub fn stream(&self) -> impl Stream<Item = Result<PriorArtReference, ServiceError>> + Send + '_ {
        let start = Cursor {
            next: None,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
            yielded: 0,
            exhausted: false,
            failed: false,
        };
        let index = &*self.index;
        let query = &self.query;
        let max_results = self.max_results;

        stream::unfold(start, move |mut cur| async move {
            loop {
                if cur.failed || cur.yielded >= max_results {
                    return None;
                }
                if let Some(record) = cur.buffer.pop_front() {
                    // Un identificador repetido se vuelve a emitir como
                    // actualización, pero no cuenta contra `max_results`.
                    if cur.seen.insert(record.id.clone()) {
                        cur.yielded += 1;
                    }
                    return Some((Ok(record), cur));
                }
                if cur.exhausted {
                    return None;
                }
                match index.fetch_page(query, cur.next.as_deref()).await {
                    Ok(page) => {
                        let stalled = page.next_cursor.is_some() && page.next_cursor == cur.next;
                        cur.exhausted = page.records.is_empty() || page.next_cursor.is_none() || stalled;
                        cur.next = page.next_cursor;
                        cur.buffer.extend(page.records);
                    }
                    Err(err) => {
                        cur.failed = true;
                        return Some((Err(err), cur));
                    }
                }
            }
        })
    }

    /// Consume la secuencia completa, un registro por identificador en orden
    /// de primera aparición. Cero resultados es un resultado válido.
    pub async fn collect(&self) -> Result<Vec<PriorArtReference>, ServiceError> {
        let mut out = ReferenceSet::default();
        let mut results = Box::pin(self.stream());
        while let Some(item) = results.next().await {
            out.insert(item?);
        }
        Ok(out.order)
    }
}

// ---------------------------------------------------------------------------
// REGISTRO DE LA EJECUCIÓN
// ---------------------------------------------------------------------------

/// Referencias únicas por identificador; la última escritura gana.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSet {
    order: Vec<PriorArtReference>,
    positions: HashMap<String, usize>,
}

impl ReferenceSet {
    pub fn insert(&mut self, reference: PriorArtReference) {
        match self.positions.get(&reference.id) {
            Some(&pos) => self.order[pos] = reference,
            None => {
                self.positions.insert(reference.id.clone(), self.order.len());
                self.order.push(reference);
            }
        }
    }

    pub fn extend(&mut self, references: impl IntoIterator<Item = PriorArtReference>) {
        for reference in references {
            self.insert(reference);
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PriorArtReference> {
        self.positions.get(id).map(|&pos| &self.order[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &PriorArtReference> {
        self.order.iter()
    }

    /// Puntúa cada referencia por solapamiento con los términos clave.
    pub fn score_relevance(&mut self, key_terms: &[String]) {
        for reference in &mut self.order {
            reference.relevance = Relevance::Scored(term_overlap(reference, key_terms));
        }
    }

    /// Las `k` más relevantes; a igualdad se respeta el orden de llegada.
    pub fn top_k(&self, k: usize) -> Vec<PriorArtReference> {
        let mut ranked: Vec<&PriorArtReference> = self.order.iter().collect();
        ranked.sort_by(|a, b| b.relevance.rank().total_cmp(&a.relevance.rank()));
        ranked.into_iter().take(k).cloned().collect()
    }
}

fn term_overlap(reference: &PriorArtReference, key_terms: &[String]) -> f64 {
    if key_terms.is_empty() {
        return 0.0;
    }
    let words: HashSet<String> = tokenize(&format!("{} {}", reference.title, reference.abstract_text)).collect();
    let hits = key_terms.iter().filter(|t| words.contains(t.as_str())).count();
    hits as f64 / key_terms.len() as f64
}

// ---------------------------------------------------------------------------
// DERIVACIÓN DE CONSULTAS
// ---------------------------------------------------------------------------

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4 && w.chars().all(|c| c.is_alphabetic()))
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
}

/// Términos más frecuentes de un conjunto de textos, desempatando alfabéticamente.
fn frequent_terms<'a>(texts: impl Iterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for word in tokenize(text) {
            *counts.entry(word).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(w, _)| w).collect()
}

/// Términos clave de todo el proyecto.
pub fn key_terms(bundle: &SourceBundle, limit: usize) -> Vec<String> {
    frequent_terms(bundle.fragments().iter().map(|f| f.excerpt.as_str()), limit)
}

/// Una consulta general y, hasta completar `settings.queries`, una por cada
/// tipo de señal con más fragmentos.
pub fn derive_queries(bundle: &SourceBundle, settings: &SearchSettings, today: NaiveDate) -> Vec<SearchQuery> {
    let base = SearchQuery {
        terms: Vec::new(),
        classification_prefix: Some(classification_prefix(&settings.technology_area).to_string()),
        date_range: Some(DateRange::last_years(settings.since_years, today)),
        page_size: settings.page_size,
    };

    let mut queries = Vec::new();
    let overall = key_terms(bundle, 6);
    if !overall.is_empty() {
        queries.push(SearchQuery {
            terms: overall,
            ..base.clone()
        });
    }

    let mut signals: Vec<(SignalKind, usize)> = bundle.signal_counts().into_iter().collect();
    signals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (signal, _) in signals {
        if queries.len() >= settings.queries {
            break;
        }
        let kinds = [signal];
        let terms = frequent_terms(bundle.with_signals(&kinds).map(|f| f.excerpt.as_str()), 4);
        if terms.is_empty() || queries.iter().any(|q| q.terms == terms) {
            continue;
        }
        queries.push(SearchQuery {
            terms,
            ..base.clone()
        });
    }
    queries
}
