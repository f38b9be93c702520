//! Task template catalog and per-house template selection.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConfigError, ScheduleError};
use crate::schedule::preferences::WindowSlot;

/// How a practice is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Breath,
    Movement,
    Focus,
    Reflection,
    Creative,
}

/// Immutable catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub key: String,
    pub title: String,
    pub min_duration_minutes: u32,
    pub modality: Modality,
    /// Houses this template suits. Empty means any house.
    #[serde(default)]
    pub houses: Vec<String>,
}

/// Class-level overrides inside a house.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRule {
    /// Preferred template for every window.
    #[serde(default)]
    pub default: Option<String>,
    /// Preferred template per window, wins over `default`.
    #[serde(default)]
    pub windows: BTreeMap<WindowSlot, String>,
}

/// Template selection rules for one house (archetype).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseRule {
    /// Ordered fallback list; the head is used when nothing more specific matches.
    #[serde(default)]
    pub defaults: Vec<String>,
    #[serde(default)]
    pub window_defaults: BTreeMap<WindowSlot, String>,
    #[serde(default)]
    pub classes: BTreeMap<String, ClassRule>,
}

/// On-disk catalog format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub templates: Vec<TaskTemplate>,
    pub houses: BTreeMap<String, HouseRule>,
}

/// Lookup table of templates and house rules.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, TaskTemplate>,
    houses: BTreeMap<String, HouseRule>,
}

impl TemplateCatalog {
    pub fn from_document(doc: CatalogDocument) -> Self {
        Self {
            templates: doc
                .templates
                .into_iter()
                .map(|t| (t.key.clone(), t))
                .collect(),
            houses: doc
                .houses
                .into_iter()
                .map(|(house, rule)| {
                    let classes = rule
                        .classes
                        .into_iter()
                        .map(|(class, c)| (class.to_lowercase(), c))
                        .collect();
                    (house.to_uppercase(), HouseRule { classes, ..rule })
                })
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let doc: CatalogDocument = serde_json::from_str(json)
            .map_err(|e| ConfigError::ParseError(format!("template catalog: {e}")))?;
        Ok(Self::from_document(doc))
    }

    /// Load a catalog file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let catalog = Self::from_json(&json)?;
        info!(
            path = %path.display(),
            templates = catalog.templates.len(),
            houses = catalog.houses.len(),
            "Loaded template catalog"
        );
        Ok(catalog)
    }

    pub fn template(&self, key: &str) -> Option<&TaskTemplate> {
        self.templates.get(key)
    }

    pub fn has_house(&self, house: &str) -> bool {
        self.houses.contains_key(&house.trim().to_uppercase())
    }

    /// Pick the template key for a house/class/window, without checking
    /// that the key exists in the template table.
    ///
    /// Order: class rule for the window, class default, house rule for the
    /// window, head of the house default list.
    pub fn select_key(
        &self,
        house: &str,
        class: Option<&str>,
        slot: WindowSlot,
    ) -> Result<&str, ScheduleError> {
        let house_key = house.trim().to_uppercase();
        let rule = self
            .houses
            .get(&house_key)
            .ok_or_else(|| ScheduleError::NoTemplateForArchetype {
                house: house_key.clone(),
            })?;

        let class_rule = class
            .map(|c| c.trim().to_lowercase())
            .and_then(|c| rule.classes.get(&c));

        class_rule
            .and_then(|c| c.windows.get(&slot).or(c.default.as_ref()))
            .or_else(|| rule.window_defaults.get(&slot))
            .or_else(|| rule.defaults.first())
            .map(String::as_str)
            .ok_or(ScheduleError::NoTemplateForArchetype { house: house_key })
    }

    /// Select and resolve the template for a house/class/window.
    pub fn select(
        &self,
        house: &str,
        class: Option<&str>,
        slot: WindowSlot,
    ) -> Result<&TaskTemplate, ScheduleError> {
        let key = self.select_key(house, class, slot)?;
        self.templates
            .get(key)
            .ok_or_else(|| ScheduleError::UnknownTemplate {
                house: house.trim().to_uppercase(),
                key: key.to_string(),
            })
    }

    /// The built-in catalog.
    pub fn builtin() -> Self {
        fn tpl(key: &str, title: &str, minutes: u32, modality: Modality, houses: &[&str]) -> TaskTemplate {
            TaskTemplate {
                key: key.to_string(),
                title: title.to_string(),
                min_duration_minutes: minutes,
                modality,
                houses: houses.iter().map(|h| h.to_string()).collect(),
            }
        }

        fn windows(pairs: &[(WindowSlot, &str)]) -> BTreeMap<WindowSlot, String> {
            pairs.iter().map(|(s, k)| (*s, k.to_string())).collect()
        }

        use Modality::*;
        use WindowSlot::*;

        let templates = vec![
            tpl("first_breath", "First Breath", 5, Breath, &["MONK"]),
            tpl("box_breathing", "Box Breathing", 4, Breath, &[]),
            tpl("sun_salutation", "Sun Salutation", 10, Movement, &["WARRIOR"]),
            tpl("midday_reset", "Midday Reset", 3, Breath, &[]),
            tpl("walking_meditation", "Walking Meditation", 15, Movement, &["MONK", "WARRIOR"]),
            tpl("focus_sprint", "Focus Sprint", 25, Focus, &["SAGE"]),
            tpl("evening_reflection", "Evening Reflection", 10, Reflection, &[]),
            tpl("gratitude_journal", "Gratitude Journal", 5, Reflection, &["BARD", "MONK"]),
            tpl("creative_warmup", "Creative Warm-up", 10, Creative, &["BARD"]),
            tpl("body_scan", "Body Scan", 8, Breath, &["MONK", "SAGE"]),
        ];

        let mut houses = BTreeMap::new();
        houses.insert(
            "MONK".to_string(),
            HouseRule {
                defaults: vec!["first_breath".into(), "body_scan".into()],
                window_defaults: windows(&[
                    (Morning, "first_breath"),
                    (Midday, "walking_meditation"),
                    (Evening, "evening_reflection"),
                ]),
                classes: BTreeMap::from([(
                    "hermit".to_string(),
                    ClassRule {
                        default: Some("body_scan".into()),
                        windows: windows(&[(Morning, "first_breath")]),
                    },
                )]),
            },
        );
        houses.insert(
            "WARRIOR".to_string(),
            HouseRule {
                defaults: vec!["sun_salutation".into()],
                window_defaults: windows(&[(Midday, "box_breathing"), (Evening, "walking_meditation")]),
                classes: BTreeMap::new(),
            },
        );
        houses.insert(
            "SAGE".to_string(),
            HouseRule {
                defaults: vec!["focus_sprint".into(), "body_scan".into()],
                window_defaults: windows(&[(Midday, "midday_reset"), (Evening, "evening_reflection")]),
                classes: BTreeMap::from([(
                    "scholar".to_string(),
                    ClassRule {
                        default: Some("focus_sprint".into()),
                        windows: BTreeMap::new(),
                    },
                )]),
            },
        );
        houses.insert(
            "BARD".to_string(),
            HouseRule {
                defaults: vec!["creative_warmup".into()],
                window_defaults: windows(&[(Evening, "gratitude_journal")]),
                classes: BTreeMap::new(),
            },
        );

        Self::from_document(CatalogDocument { templates, houses })
    }
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
