//! Puntuador determinista: aplica una `Rubric` a un borrador completo y
//! devuelve un `ScoreReport` nuevo en cada pase.

use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use serde::Serialize;

use crate::error::ScoreError;
use crate::models::{Draft, SectionKind};
use crate::rubric::{Adjustment, Category, Condition, LineItem, Measure, Rubric};

/// Resultado de una partida.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub item: String,
    pub awarded: f64,
    pub max: f64,
    pub measured: f64,
}

impl Finding {
    fn ratio(&self) -> f64 {
        if self.max > 0.0 {
            self.awarded / self.max
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryScore {
    pub key: String,
    pub label: String,
    pub awarded: f64,
    pub max: f64,
    pub findings: Vec<Finding>,
    /// La partida con menor proporción de puntos obtenidos.
    pub weakest: Option<Finding>,
}

impl CategoryScore {
    pub fn ratio(&self) -> f64 {
        if self.max > 0.0 {
            self.awarded / self.max
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedAdjustment {
    pub key: String,
    pub points: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreReport {
    pub categories: Vec<CategoryScore>,
    pub deductions: Vec<AppliedAdjustment>,
    pub bonuses: Vec<AppliedAdjustment>,
    pub base: f64,
    /// Suma de bonificaciones ya limitada por el tope.
    pub bonus_total: f64,
    pub total: f64,
    pub max: f64,
    pub grade: String,
    pub recommendations: Vec<String>,
}

impl ScoreReport {
    pub fn category(&self, key: &str) -> Option<&CategoryScore> {
        self.categories.iter().find(|c| c.key == key)
    }

    /// Las `n` categorías con menor proporción; a igualdad, el orden de la rúbrica.
    pub fn lowest_categories(&self, n: usize) -> Vec<&CategoryScore> {
        let mut ranked: Vec<&CategoryScore> = self.categories.iter().collect();
        ranked.sort_by(|a, b| a.ratio().total_cmp(&b.ratio()));
        ranked.truncate(n);
        ranked
    }
}

pub struct Scorer {
    rubric: Rubric,
    patterns: HashMap<String, Regex>,
}

impl Scorer {
    /// Valida los puntos y compila de antemano todas las expresiones de la
    /// rúbrica.
    pub fn new(rubric: Rubric) -> Result<Self, ScoreError> {
        rubric.validate()?;
        let mut sources: Vec<&str> = Vec::new();
        for item in rubric.categories.iter().flat_map(|c| &c.items) {
            if let Measure::Patterns { patterns } = &item.measure {
                sources.extend(patterns.iter().map(String::as_str));
            }
        }
        for adjustment in rubric.red_flags.iter().chain(&rubric.bonuses) {
            if let Condition::Matches { pattern } | Condition::Lacks { pattern } = &adjustment.condition {
                sources.push(pattern.as_str());
            }
        }

        let mut patterns = HashMap::new();
        for source in sources {
            let regex = Regex::new(source).map_err(|e| ScoreError::InvalidPattern {
                pattern: source.to_string(),
                message: e.to_string(),
            })?;
            patterns.insert(source.to_string(), regex);
        }
        Ok(Self { rubric, patterns })
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    /// Sólo se puntúan borradores con las nueve secciones redactadas.
    pub fn score(&self, draft: &Draft) -> Result<ScoreReport, ScoreError> {
        let missing = draft.missing();
        if !missing.is_empty() {
            return Err(ScoreError::IncompleteDraft(missing));
        }

        let mut recommendations = Vec::new();
        let mut deductions = Vec::new();
        for flag in &self.rubric.red_flags {
            if self.holds(&flag.condition, draft, &flag.scope) {
                deductions.push(applied(flag));
                recommendations.extend(flag.recommendation.clone());
            }
        }

        let categories: Vec<CategoryScore> = self
            .rubric
            .categories
            .iter()
            .map(|category| self.score_category(category, draft, &mut recommendations))
            .collect();

        let bonuses: Vec<AppliedAdjustment> = self
            .rubric
            .bonuses
            .iter()
            .filter(|bonus| self.holds(&bonus.condition, draft, &bonus.scope))
            .map(applied)
            .collect();

        let max = self.rubric.max_points();
        let base: f64 = categories.iter().map(|c| c.awarded).sum();
        let deduction_total: f64 = deductions.iter().map(|d| d.points).sum();
        let bonus_total = bonuses
            .iter()
            .map(|b| b.points)
            .sum::<f64>()
            .min(self.rubric.bonus_cap);
        let total = (base + deduction_total + bonus_total).clamp(0.0, max);

        recommendations.truncate(self.rubric.max_recommendations);
        Ok(ScoreReport {
            grade: self.rubric.grade(total),
            categories,
            deductions,
            bonuses,
            base,
            bonus_total,
            total,
            max,
            recommendations,
        })
    }

    /// Secciones implicadas por las `n` categorías más débiles de `report`.
    pub fn implicated_sections(&self, report: &ScoreReport, n: usize) -> BTreeSet<SectionKind> {
        report
            .lowest_categories(n)
            .into_iter()
            .filter_map(|score| self.rubric.category(&score.key))
            .flat_map(|category| category.sections.iter().copied())
            .collect()
    }

    fn score_category(
        &self,
        category: &Category,
        draft: &Draft,
        recommendations: &mut Vec<String>,
    ) -> CategoryScore {
        let mut findings = Vec::with_capacity(category.items.len());
        for item in &category.items {
            let (finding, reached_tier) = self.score_item(item, draft);
            if !reached_tier {
                recommendations.extend(item.recommendation.clone());
            }
            findings.push(finding);
        }

        let awarded = findings
            .iter()
            .map(|f| f.awarded)
            .sum::<f64>()
            .min(category.max_points);
        let weakest = findings
            .iter()
            .filter(|f| f.max > 0.0)
            .min_by(|a, b| a.ratio().total_cmp(&b.ratio()))
            .cloned();

        CategoryScore {
            key: category.key.clone(),
            label: category.label.clone(),
            awarded,
            max: category.max_points,
            findings,
            weakest,
        }
    }

    fn score_item(&self, item: &LineItem, draft: &Draft) -> (Finding, bool) {
        let measured = self.measure(&item.measure, draft, &item.scope);
        let tier = item.tiers.iter().find(|t| measured >= t.at_least);
        let no_figures =
            matches!(item.measure, Measure::FigureTitles { .. }) && draft.figures().is_empty();

        let awarded = match tier {
            _ if no_figures => 0.0,
            Some(t) => t.points,
            None => item.floor,
        }
        .min(item.max_points);

        let finding = Finding {
            item: item.key.clone(),
            awarded,
            max: item.max_points,
            measured,
        };
        (finding, tier.is_some() && !no_figures)
    }

    fn measure(&self, measure: &Measure, draft: &Draft, scope: &[SectionKind]) -> f64 {
        let text = scoped_text(draft, scope);
        let value = match measure {
            Measure::Keywords { keywords } => count_keywords(&text, keywords),
            Measure::Patterns { patterns } => patterns
                .iter()
                .filter_map(|p| self.patterns.get(p))
                .map(|re| re.find_iter(&text).count())
                .sum(),
            Measure::Words => text.split_whitespace().count(),
            Measure::FigureTitles { keywords } => draft
                .figures()
                .iter()
                .filter(|fig| {
                    let title = fig.title.to_lowercase();
                    keywords.iter().any(|k| title.contains(k.as_str()))
                })
                .count(),
            Measure::KeywordGroups { groups } => groups
                .iter()
                .filter(|group| group.iter().any(|k| text.contains(k.as_str())))
                .count(),
        };
        value as f64
    }

    fn holds(&self, condition: &Condition, draft: &Draft, scope: &[SectionKind]) -> bool {
        let text = scoped_text(draft, scope);
        let any = |keywords: &[String]| keywords.iter().any(|k| text.contains(k.as_str()));
        let matches = |pattern: &str| self.patterns.get(pattern).is_some_and(|re| re.is_match(&text));

        match condition {
            Condition::AnyOf { keywords } => any(keywords),
            Condition::NoneOf { keywords } => !any(keywords),
            Condition::AtLeast { keywords, count } => count_keywords(&text, keywords) >= *count,
            Condition::Matches { pattern } => matches(pattern),
            Condition::Lacks { pattern } => !matches(pattern),
            Condition::NoFigures => draft.figures().is_empty(),
            Condition::MinClaims { count } => draft.claim_count() >= *count,
            Condition::VagueWithout { vague, specific } => any(vague) && !any(specific),
        }
    }
}

fn applied(adjustment: &Adjustment) -> AppliedAdjustment {
    AppliedAdjustment {
        key: adjustment.key.clone(),
        points: adjustment.points,
    }
}

/// Texto en minúsculas de las secciones del ámbito.
fn scoped_text(draft: &Draft, scope: &[SectionKind]) -> String {
    scope
        .iter()
        .map(|kind| draft.text(*kind).to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn count_keywords(text: &str, keywords: &[String]) -> usize {
    keywords.iter().map(|k| text.matches(k.as_str()).count()).sum()
}
