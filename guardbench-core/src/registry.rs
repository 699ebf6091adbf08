//! Criteria registry.
//!
//! Loads the criteria manifest (YAML) and the per-criterion rubric files it
//! points at, once, at run start. The registry is read-only afterwards and
//! all lookups are pure, including selection-expression resolution.

use crate::error::AssetError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sections of a criterion rubric, in prompt order.
#[derive(Debug, Clone, Deserialize)]
pub struct Rubric {
    pub role: String,
    pub task: String,
    /// Template containing an `{age_group}` placeholder.
    pub age_context: String,
    /// The 0-5 scoring guide.
    pub scoring_guide: String,
    #[serde(default)]
    pub examples: String,
    /// The output contract shown to judges (JSON shape).
    pub output_format: String,
}

/// A single scored dimension: the atomic unit of judging.
#[derive(Debug, Clone)]
pub struct Criterion {
    /// Stable id, e.g. `safety.sexual.sexual_content__v1_0`.
    pub id: String,
    pub category: String,
    pub subcategory: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Registry-defined canonical guardrail rule, if any.
    pub canonical_rule: Option<String>,
    pub rubric: Rubric,
}

impl Criterion {
    /// Id without the version suffix (`safety.sexual.sexual_content`).
    pub fn base_id(&self) -> &str {
        base_of(&self.id)
    }

    /// Human-readable label (`safety / sexual / sexual content`).
    pub fn label(&self) -> String {
        self.base_id()
            .split('.')
            .map(|part| part.replace('_', " "))
            .collect::<Vec<_>>()
            .join(" / ")
    }

    /// The rubric text shown to the guardrail model: everything except the
    /// judge-facing output contract.
    pub fn spec_text(&self) -> String {
        let mut sections = vec![
            self.rubric.role.trim(),
            self.rubric.task.trim(),
            self.rubric.age_context.trim(),
            self.rubric.scoring_guide.trim(),
        ];
        if !self.rubric.examples.trim().is_empty() {
            sections.push(self.rubric.examples.trim());
        }
        sections.join("\n\n")
    }
}

/// Strip a `__vX_Y` version suffix.
fn base_of(id: &str) -> &str {
    match id.split_once("__") {
        Some((base, _)) => base,
        None => id,
    }
}

/// Split a base id into (category, subcategory, name); short ids fill with
/// "default" like the hierarchy grouping expects.
pub fn id_parts(id: &str) -> (String, String, String) {
    let base = base_of(id);
    let mut parts = base.split('.');
    let category = parts.next().unwrap_or("default").to_string();
    let subcategory = parts.next().unwrap_or("default").to_string();
    let name = parts.next().unwrap_or("default").to_string();
    (category, subcategory, name)
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    category: String,
    subcategory: String,
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    file: PathBuf,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    canonical_rule: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestPreset {
    #[serde(default)]
    #[allow(dead_code)]
    description: String,
    criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    /// Criterion id -> metadata. YAML mapping order is the declared order.
    criteria: serde_yaml::Mapping,
    #[serde(default)]
    presets: HashMap<String, ManifestPreset>,
}

/// The loaded, immutable criteria registry.
pub struct CriteriaRegistry {
    criteria: Vec<Criterion>,
    index: HashMap<String, usize>,
    presets: HashMap<String, ManifestPreset>,
}

impl CriteriaRegistry {
    /// Load the manifest and every rubric file it references.
    pub fn load(manifest_path: &Path, rubric_root: &Path) -> Result<Self, AssetError> {
        if !manifest_path.exists() {
            return Err(AssetError::ManifestNotFound {
                path: manifest_path.into(),
            });
        }
        let raw = std::fs::read_to_string(manifest_path).map_err(|e| AssetError::Invalid {
            message: format!("failed to read manifest: {e}"),
        })?;
        let manifest: Manifest = serde_yaml::from_str(&raw).map_err(|e| AssetError::Invalid {
            message: format!("invalid manifest YAML: {e}"),
        })?;

        let mut criteria = Vec::with_capacity(manifest.criteria.len());
        let mut index = HashMap::new();

        for (key, value) in manifest.criteria {
            let id = key.as_str().ok_or_else(|| AssetError::Invalid {
                message: "criterion ids must be strings".to_string(),
            })?;
            let entry: ManifestEntry =
                serde_yaml::from_value(value).map_err(|e| AssetError::Invalid {
                    message: format!("invalid manifest entry for '{id}': {e}"),
                })?;

            let rubric_path = rubric_root.join(&entry.file);
            if !rubric_path.exists() {
                return Err(AssetError::RubricNotFound {
                    criterion_id: id.to_string(),
                    path: rubric_path,
                });
            }
            let rubric_raw =
                std::fs::read_to_string(&rubric_path).map_err(|e| AssetError::Invalid {
                    message: format!("failed to read rubric for '{id}': {e}"),
                })?;
            let rubric: Rubric =
                serde_yaml::from_str(&rubric_raw).map_err(|e| AssetError::Invalid {
                    message: format!("invalid rubric for '{id}': {e}"),
                })?;

            debug!(criterion = id, "Loaded criterion rubric");
            index.insert(id.to_string(), criteria.len());
            criteria.push(Criterion {
                id: id.to_string(),
                category: entry.category,
                subcategory: entry.subcategory,
                name: entry.name,
                version: entry.version,
                description: entry.description,
                tags: entry.tags,
                canonical_rule: entry.canonical_rule,
                rubric,
            });
        }

        // Presets may only reference registered criteria.
        for (name, preset) in &manifest.presets {
            for id in &preset.criteria {
                if !index.contains_key(id) {
                    return Err(AssetError::Invalid {
                        message: format!("preset '{name}' references unknown criterion '{id}'"),
                    });
                }
            }
        }

        info!(
            criteria = criteria.len(),
            presets = manifest.presets.len(),
            "Criteria registry loaded"
        );

        Ok(Self {
            criteria,
            index,
            presets: manifest.presets,
        })
    }

    pub fn get(&self, id: &str) -> Option<&Criterion> {
        self.index.get(id).map(|&i| &self.criteria[i])
    }

    /// All criteria in declared order.
    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    pub fn preset_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.presets.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve a selection expression into an ordered, duplicate-free list
    /// of criterion ids.
    ///
    /// A preset name returns the preset's list in declared order. Anything
    /// else is split on commas; each token matches as an exact id, then a
    /// `category.subcategory` prefix, then a `category` prefix, against the
    /// registry in declaration order. First occurrence wins on duplicates.
    pub fn resolve_selection(&self, expression: &str) -> Result<Vec<String>, AssetError> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(AssetError::EmptySelection {
                expression: expression.to_string(),
            });
        }

        if let Some(preset) = self.presets.get(expression) {
            return Ok(preset.criteria.clone());
        }

        let mut resolved = Vec::new();
        for token in expression.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            for id in self.match_token(token) {
                if !resolved.contains(&id) {
                    resolved.push(id);
                }
            }
        }

        if resolved.is_empty() {
            return Err(AssetError::EmptySelection {
                expression: expression.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Ids matching one selection token, in registry declaration order.
    fn match_token(&self, token: &str) -> Vec<String> {
        let token_base = base_of(token);

        // Exact id (with or without version suffix) takes priority. Only a
        // three-segment token can address a criterion directly.
        if token_base.matches('.').count() == 2 {
            let exact: Vec<String> = self
                .criteria
                .iter()
                .filter(|c| c.id == token || c.base_id() == token_base)
                .map(|c| c.id.clone())
                .collect();
            if !exact.is_empty() {
                return exact;
            }
        }

        // Prefix match covers both category.subcategory and bare category.
        let prefix = format!("{token_base}.");
        self.criteria
            .iter()
            .filter(|c| c.base_id().starts_with(&prefix))
            .map(|c| c.id.clone())
            .collect()
    }
}
