//! Rúbrica de puntuación como datos: categorías ponderadas con sus partidas,
//! banderas rojas, bonificaciones con tope y bandas de calificación.
//!
//! La rúbrica estándar suma 100 puntos. Puede sustituirse por un JSON
//! (`RUBRIC_PATH`) o reponderarse por categoría (`RUBRIC_WEIGHTS`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ScoreError;
use crate::models::SectionKind;

/// Qué se mide sobre el texto (o las figuras) de una partida.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Measure {
    /// Apariciones de cualquiera de las palabras clave.
    Keywords { keywords: Vec<String> },
    /// Coincidencias de expresiones regulares.
    Patterns { patterns: Vec<String> },
    /// Número de palabras.
    Words,
    /// Figuras cuyo título contiene alguna palabra clave.
    FigureTitles { keywords: Vec<String> },
    /// Grupos con al menos una palabra clave presente.
    KeywordGroups { groups: Vec<Vec<String>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub at_least: f64,
    pub points: f64,
}

/// Partida de una categoría. Los tramos van de mayor a menor; se concede el
/// primero alcanzado y, si ninguno, `floor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub key: String,
    pub max_points: f64,
    pub measure: Measure,
    pub scope: Vec<SectionKind>,
    pub tiers: Vec<Tier>,
    #[serde(default)]
    pub floor: f64,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub key: String,
    pub label: String,
    pub max_points: f64,
    /// Secciones que se reescriben cuando esta categoría es de las más débiles.
    pub sections: Vec<SectionKind>,
    pub items: Vec<LineItem>,
}

/// Condición de una bandera roja o de una bonificación.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    AnyOf { keywords: Vec<String> },
    NoneOf { keywords: Vec<String> },
    AtLeast { keywords: Vec<String>, count: usize },
    Matches { pattern: String },
    Lacks { pattern: String },
    NoFigures,
    MinClaims { count: usize },
    /// Lenguaje vago presente sin ningún término concreto que lo respalde.
    VagueWithout { vague: Vec<String>, specific: Vec<String> },
}

/// Ajuste al total: negativo para banderas rojas, positivo para bonificaciones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adjustment {
    pub key: String,
    pub points: f64,
    pub condition: Condition,
    pub scope: Vec<SectionKind>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeBand {
    pub at_least: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub categories: Vec<Category>,
    pub red_flags: Vec<Adjustment>,
    pub bonuses: Vec<Adjustment>,
    pub bonus_cap: f64,
    pub grades: Vec<GradeBand>,
    pub max_recommendations: usize,
}

impl Rubric {
    pub fn max_points(&self) -> f64 {
        self.categories.iter().map(|c| c.max_points).sum()
    }

    pub fn category(&self, key: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.key == key)
    }

    pub fn grade(&self, total: f64) -> String {
        self.grades
            .iter()
            .find(|band| total >= band.at_least)
            .or_else(|| self.grades.last())
            .map(|band| band.label.clone())
            .unwrap_or_default()
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ScoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ScoreError::Load(e.to_string()))?;
        let rubric: Self = serde_json::from_str(&raw).map_err(|e| ScoreError::Load(e.to_string()))?;
        rubric.validate()?;
        Ok(rubric)
    }

    /// Máximos, tramos, suelos y tope de bonificación deben ser finitos y no
    /// negativos. Las banderas rojas sólo tienen que ser finitas.
    pub fn validate(&self) -> Result<(), ScoreError> {
        let non_negative = |key: &str, points: f64| {
            if points.is_finite() && points >= 0.0 {
                Ok(())
            } else {
                Err(ScoreError::InvalidPoints {
                    key: key.to_string(),
                    points,
                })
            }
        };
        for category in &self.categories {
            non_negative(&category.key, category.max_points)?;
            for item in &category.items {
                non_negative(&item.key, item.max_points)?;
                non_negative(&item.key, item.floor)?;
                for tier in &item.tiers {
                    non_negative(&item.key, tier.points)?;
                }
            }
        }
        for bonus in &self.bonuses {
            non_negative(&bonus.key, bonus.points)?;
        }
        if let Some(flag) = self.red_flags.iter().find(|f| !f.points.is_finite()) {
            return Err(ScoreError::InvalidPoints {
                key: flag.key.clone(),
                points: flag.points,
            });
        }
        non_negative("bonus_cap", self.bonus_cap)
    }

    /// Nueva rúbrica con los máximos de categoría indicados; las partidas y
    /// sus tramos se escalan en proporción.
    pub fn reweighted(&self, weights: &BTreeMap<String, f64>) -> Result<Self, ScoreError> {
        let mut rubric = self.clone();
        for (key, &points) in weights {
            if !points.is_finite() || points < 0.0 {
                return Err(ScoreError::InvalidPoints {
                    key: key.clone(),
                    points,
                });
            }
            let category = rubric
                .categories
                .iter_mut()
                .find(|c| &c.key == key)
                .ok_or_else(|| ScoreError::UnknownCategory(key.clone()))?;
            let factor = if category.max_points > 0.0 {
                points / category.max_points
            } else {
                0.0
            };
            category.max_points = points;
            for item in &mut category.items {
                item.max_points *= factor;
                item.floor *= factor;
                for tier in &mut item.tiers {
                    tier.points *= factor;
                }
            }
        }
        rubric.validate()?;
        Ok(rubric)
    }

    /// Rúbrica de 100 puntos para divulgaciones de software e IA.
    pub fn standard() -> Self {
        use SectionKind::*;

        let narrative = vec![DetailedDescription, Summary, Background];
        let detailed = vec![DetailedDescription];

        let technical = Category {
            key: "technical_disclosure".into(),
            label: "Technical Disclosure Quality".into(),
            max_points: 30.0,
            sections: vec![DetailedDescription],
            items: vec![
                item(
                    "how_not_what",
                    8.0,
                    keywords(&[
                        "step", "process", "method", "comprise", "perform", "execute", "receive",
                        "transmit", "generate", "transform", "calculate",
                    ]),
                    &detailed,
                    &[(25.0, 8.0), (15.0, 6.0), (8.0, 4.0)],
                    2.0,
                    Some("Add more HOW details - describe step-by-step processes, not just outcomes"),
                ),
                item(
                    "hardware_context",
                    6.0,
                    keywords(&[
                        "processor", "memory", "cpu", "gpu", "tpu", "storage", "network interface",
                        "computing device", "server", "client",
                    ]),
                    &detailed,
                    &[(15.0, 6.0), (8.0, 4.0), (3.0, 2.0)],
                    0.0,
                    Some("Add hardware context - mention processor, memory, storage, network"),
                ),
                item(
                    "algorithm_disclosure",
                    8.0,
                    Measure::Patterns {
                        patterns: strings(&[
                            r"step \d+", r"at step", r"block \d+", r"at block", r"algorithm",
                            r"pseudocode", r"input.*output",
                        ]),
                    },
                    &detailed,
                    &[(12.0, 8.0), (6.0, 6.0), (3.0, 4.0)],
                    2.0,
                    Some("Add step-by-step algorithm descriptions with numbered steps"),
                ),
                item(
                    "enablement_length",
                    4.0,
                    Measure::Words,
                    &detailed,
                    &[(3000.0, 4.0), (2000.0, 3.0), (1000.0, 2.0)],
                    1.0,
                    Some("Expand detailed description to 2000+ words"),
                ),
                item(
                    "enablement_examples",
                    2.0,
                    keywords(&["example", "embodiment"]),
                    &detailed,
                    &[(1.0, 2.0)],
                    0.0,
                    Some("Add concrete examples to aid enablement"),
                ),
                item(
                    "enablement_figures",
                    2.0,
                    keywords(&["fig.", "figure"]),
                    &detailed,
                    &[(1.0, 2.0)],
                    0.0,
                    Some("Reference figures throughout detailed description"),
                ),
            ],
        };

        let drawings = Category {
            key: "drawings_figures".into(),
            label: "Drawings & Figures".into(),
            max_points: 20.0,
            sections: vec![DrawingsIndex, DetailedDescription],
            items: vec![
                item(
                    "system_diagram",
                    5.0,
                    figure_titles(&["system", "architecture", "network"]),
                    &[],
                    &[(1.0, 5.0)],
                    0.0,
                    Some("Add system architecture diagram (FIG. 1)"),
                ),
                item(
                    "hardware_block_diagram",
                    4.0,
                    figure_titles(&["hardware", "block", "computing"]),
                    &[],
                    &[(1.0, 4.0)],
                    0.0,
                    Some("Add hardware block diagram showing processor, memory, etc."),
                ),
                item(
                    "method_flowcharts",
                    6.0,
                    figure_titles(&["flowchart", "method", "process"]),
                    &[],
                    &[(2.0, 6.0), (1.0, 4.0)],
                    0.0,
                    Some("Add method flowchart(s) showing process steps"),
                ),
                item(
                    "interface_mockups",
                    3.0,
                    figure_titles(&["interface", "screen", "mockup", "display"]),
                    &[],
                    &[(1.0, 3.0)],
                    1.0,
                    None,
                ),
                item(
                    "data_flow_diagram",
                    2.0,
                    figure_titles(&["data flow", "data", "pipeline"]),
                    &[],
                    &[(1.0, 2.0)],
                    0.0,
                    Some("Consider adding data flow diagram"),
                ),
            ],
        };

        let novelty = Category {
            key: "novelty_differentiation".into(),
            label: "Novelty & Differentiation".into(),
            max_points: 15.0,
            sections: vec![Background, Summary],
            items: vec![
                item(
                    "prior_art_awareness",
                    5.0,
                    keywords(&[
                        "conventional", "existing", "prior", "traditional", "known", "previous",
                        "current systems",
                    ]),
                    &narrative,
                    &[(5.0, 5.0), (2.0, 3.0)],
                    1.0,
                    Some("Acknowledge prior art and existing approaches"),
                ),
                item(
                    "point_of_difference",
                    5.0,
                    keywords(&[
                        "improvement", "novel", "unique", "different", "unlike", "advantage",
                        "better", "superior", "overcome",
                    ]),
                    &narrative,
                    &[(8.0, 5.0), (4.0, 3.0)],
                    1.0,
                    Some("Clearly state what makes this invention different/better"),
                ),
                item(
                    "problem_solution",
                    5.0,
                    Measure::KeywordGroups {
                        groups: vec![
                            strings(&["problem", "challenge", "limitation", "need", "issue"]),
                            strings(&["solution", "address", "overcome", "provide", "solve"]),
                        ],
                    },
                    &narrative,
                    &[(2.0, 5.0), (1.0, 3.0)],
                    1.0,
                    Some("Clearly frame the technical problem and how invention solves it"),
                ),
            ],
        };

        let scope = Category {
            key: "scope_protection".into(),
            label: "Scope & Protection".into(),
            max_points: 15.0,
            sections: vec![DetailedDescription, Claims],
            items: vec![
                item(
                    "workarounds_variations",
                    8.0,
                    keywords(&[
                        "embodiment", "alternative", "variation", "optionally", "in some",
                        "in various", "in another", "additionally",
                    ]),
                    &detailed,
                    &[(20.0, 8.0), (12.0, 6.0), (6.0, 4.0)],
                    2.0,
                    Some("Add more alternative embodiments and variations"),
                ),
                item(
                    "future_variations",
                    4.0,
                    keywords(&[
                        "future", "extension", "enhancement", "further", "additionally", "moreover",
                        "second generation",
                    ]),
                    &detailed,
                    &[(4.0, 4.0), (2.0, 2.0)],
                    0.0,
                    Some("Describe future improvements and extensions"),
                ),
                item(
                    "broad_to_narrow",
                    3.0,
                    Measure::KeywordGroups {
                        groups: vec![
                            strings(&["various embodiments", "in general", "some embodiments"]),
                            strings(&["specific embodiment", "in particular"]),
                        ],
                    },
                    &detailed,
                    &[(2.0, 3.0), (1.0, 2.0)],
                    0.0,
                    Some("Use broad-to-narrow language pattern"),
                ),
            ],
        };

        let implementation = Category {
            key: "implementation_details".into(),
            label: "Implementation Details".into(),
            max_points: 10.0,
            sections: vec![DetailedDescription],
            items: vec![
                item(
                    "deployment_architecture",
                    5.0,
                    keywords(&[
                        "deploy", "server", "cloud", "infrastructure", "architecture", "distributed",
                        "hosted", "cluster",
                    ]),
                    &detailed,
                    &[(6.0, 5.0), (3.0, 3.0)],
                    1.0,
                    Some("Describe deployment architecture and infrastructure"),
                ),
                item(
                    "technology_stack",
                    3.0,
                    keywords(&[
                        "api", "database", "framework", "protocol", "json", "http", "rest", "queue",
                        "cache",
                    ]),
                    &detailed,
                    &[(5.0, 3.0), (2.0, 2.0)],
                    0.0,
                    Some("Mention technology stack components"),
                ),
                item(
                    "real_world_use",
                    2.0,
                    keywords(&["example", "use case", "walkthrough", "scenario", "user"]),
                    &detailed,
                    &[(1.0, 2.0)],
                    1.0,
                    None,
                ),
            ],
        };

        let ai = Category {
            key: "ai_specific".into(),
            label: "AI-Specific Requirements".into(),
            max_points: 10.0,
            sections: vec![DetailedDescription, Summary],
            items: vec![
                item(
                    "practical_application",
                    4.0,
                    keywords(&[
                        "improvement", "reduce", "increase", "optimize", "enhance", "faster",
                        "more efficient", "less memory",
                    ]),
                    &detailed,
                    &[(6.0, 4.0), (3.0, 2.0)],
                    0.0,
                    Some("Emphasize practical technical improvements"),
                ),
                item(
                    "not_abstract",
                    3.0,
                    Measure::KeywordGroups {
                        groups: vec![strings(&["processor"]), strings(&["memory"])],
                    },
                    &detailed,
                    &[(2.0, 3.0), (1.0, 2.0)],
                    0.0,
                    Some("Tie software to hardware (processor, memory) to avoid abstract idea issues"),
                ),
                item(
                    "inventorship_documentation",
                    3.0,
                    keywords(&["inventor"]),
                    &[Cover],
                    &[(1.0, 3.0)],
                    0.0,
                    Some("Document inventorship on the cover sheet"),
                ),
            ],
        };

        let red_flags = vec![
            adjustment(
                "marketing_language",
                -10.0,
                Condition::AnyOf {
                    keywords: strings(&[
                        "revolutionary", "best", "amazing", "groundbreaking", "world-class",
                        "cutting-edge", "game-changing",
                    ]),
                },
                &narrative,
                Some("Remove marketing language (revolutionary, best, cutting-edge, ...)"),
            ),
            adjustment(
                "no_drawings",
                -10.0,
                Condition::NoFigures,
                &[],
                Some("CRITICAL: Add at least 3-5 figures (system, hardware, flowchart)"),
            ),
            adjustment(
                "vague_ai_ml",
                -8.0,
                Condition::VagueWithout {
                    vague: strings(&["uses ai", "uses machine learning", "leverages ai"]),
                    specific: strings(&["neural network", "transformer", "model", "training", "inference"]),
                },
                &narrative,
                Some("Replace vague AI/ML wording with the concrete model and training details"),
            ),
            adjustment(
                "no_hardware_context",
                -10.0,
                Condition::NoneOf {
                    keywords: strings(&["processor", "memory", "cpu", "gpu", "computing device"]),
                },
                &detailed,
                None,
            ),
            adjustment(
                "missing_reference_numerals",
                -3.0,
                Condition::Lacks {
                    pattern: r"\b[1-9]\d{2}\b".into(),
                },
                &detailed,
                Some("Use reference numerals (100, 102, ...) when describing components"),
            ),
        ];

        let bonuses = vec![
            adjustment("informal_claims", 3.0, Condition::MinClaims { count: 5 }, &[Claims], None),
            adjustment(
                "multiple_embodiments",
                3.0,
                Condition::AtLeast {
                    keywords: strings(&["embodiment"]),
                    count: 5,
                },
                &detailed,
                None,
            ),
            adjustment(
                "performance_benchmarks",
                2.0,
                Condition::Matches {
                    pattern: r"%|\d+x faster".into(),
                },
                &detailed,
                None,
            ),
            adjustment(
                "competitive_workaround",
                2.0,
                Condition::AnyOf {
                    keywords: strings(&["workaround", "design around"]),
                },
                &detailed,
                None,
            ),
        ];

        let grades = [
            (95.0, "Transaction Ready (95th Percentile)"),
            (85.0, "Excellent"),
            (75.0, "Good (Passing)"),
            (65.0, "Needs Improvement"),
            (50.0, "Insufficient"),
            (0.0, "Major Rework Required"),
        ]
        .iter()
        .map(|(at_least, label)| GradeBand {
            at_least: *at_least,
            label: label.to_string(),
        })
        .collect();

        Rubric {
            categories: vec![technical, drawings, novelty, scope, implementation, ai],
            red_flags,
            bonuses,
            bonus_cap: 10.0,
            grades,
            max_recommendations: 10,
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn keywords(values: &[&str]) -> Measure {
    Measure::Keywords {
        keywords: strings(values),
    }
}

fn figure_titles(values: &[&str]) -> Measure {
    Measure::FigureTitles {
        keywords: strings(values),
    }
}

fn item(
    key: &str,
    max_points: f64,
    measure: Measure,
    scope: &[SectionKind],
    tiers: &[(f64, f64)],
    floor: f64,
    recommendation: Option<&str>,
) -> LineItem {
    LineItem {
        key: key.to_string(),
        max_points,
        measure,
        scope: scope.to_vec(),
        tiers: tiers
            .iter()
            .map(|&(at_least, points)| Tier { at_least, points })
            .collect(),
        floor,
        recommendation: recommendation.map(str::to_string),
    }
}

fn adjustment(
    key: &str,
    points: f64,
    condition: Condition,
    scope: &[SectionKind],
    recommendation: Option<&str>,
) -> Adjustment {
    Adjustment {
        key: key.to_string(),
        points,
        condition,
        scope: scope.to_vec(),
        recommendation: recommendation.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_rubric_totals_one_hundred() {
        let rubric = Rubric::standard();
        assert_eq!(rubric.max_points(), 100.0);
        for category in &rubric.categories {
            let items: f64 = category.items.iter().map(|i| i.max_points).sum();
            assert_eq!(items, category.max_points, "{}", category.key);
            assert!(!category.sections.is_empty());
        }
    }

    #[test]
    fn grade_bands() {
        let rubric = Rubric::standard();
        assert_eq!(rubric.grade(96.0), "Transaction Ready (95th Percentile)");
        assert_eq!(rubric.grade(75.0), "Good (Passing)");
        assert_eq!(rubric.grade(12.0), "Major Rework Required");
    }

    #[test]
    fn reweighting_scales_items() {
        let mut weights = BTreeMap::new();
        weights.insert("drawings_figures".to_string(), 10.0);
        let rubric = Rubric::standard().reweighted(&weights).unwrap();
        let drawings = rubric.category("drawings_figures").unwrap();
        assert_eq!(drawings.max_points, 10.0);
        assert_eq!(drawings.items[0].max_points, 2.5);
        assert_eq!(rubric.max_points(), 90.0);

        weights.insert("style".to_string(), 5.0);
        assert_eq!(
            Rubric::standard().reweighted(&weights),
            Err(ScoreError::UnknownCategory("style".into()))
        );
    }

    #[test]
    fn negative_or_nan_weights_are_rejected() {
        let mut weights = BTreeMap::new();
        weights.insert("technical_disclosure".to_string(), -200.0);
        assert!(matches!(
            Rubric::standard().reweighted(&weights),
            Err(ScoreError::InvalidPoints { key, .. }) if key == "technical_disclosure"
        ));

        weights.insert("technical_disclosure".to_string(), f64::NAN);
        assert!(matches!(
            Rubric::standard().reweighted(&weights),
            Err(ScoreError::InvalidPoints { .. })
        ));

        weights.insert("technical_disclosure".to_string(), 0.0);
        let zeroed = Rubric::standard().reweighted(&weights).unwrap();
        assert_eq!(zeroed.max_points(), 70.0);
    }

    #[test]
    fn json_rubric_with_negative_category_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rubric.json");
        let mut rubric = Rubric::standard();
        rubric.categories[1].max_points = -5.0;
        std::fs::write(&path, serde_json::to_string(&rubric).unwrap()).unwrap();
        assert!(matches!(
            Rubric::from_json_file(&path),
            Err(ScoreError::InvalidPoints { key, points }) if key == "drawings_figures" && points == -5.0
        ));
    }

    #[test]
    fn loads_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rubric.json");
        std::fs::write(&path, serde_json::to_string(&Rubric::standard()).unwrap()).unwrap();
        assert_eq!(Rubric::from_json_file(&path).unwrap(), Rubric::standard());
        assert!(matches!(
            Rubric::from_json_file(dir.path().join("missing.json")),
            Err(ScoreError::Load(_))
        ));
    }
}
