//! Persona assets.
//!
//! Personas parameterise the prompt framing for each age band: a display
//! name, the maturity band shown to judges, tone hints, and the safety
//! policy text used by the defensive mode.

use crate::error::AssetError;
use crate::types::AgeBand;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// One persona, keyed by age band in the asset file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    /// Age range string interpolated into rubric templates ("9-12").
    pub maturity_band: String,
    #[serde(default)]
    pub tone: Vec<String>,
    #[serde(default)]
    pub safety_policy: String,
}

/// The loaded persona set. Immutable after load.
pub struct PersonaSet {
    personas: HashMap<String, Persona>,
}

impl PersonaSet {
    /// Load personas from a JSON file keyed by band name
    /// (`Child`, `Teen`, `YoungAdult`, `Emerging`).
    pub fn load(path: &Path) -> Result<Self, AssetError> {
        if !path.exists() {
            return Err(AssetError::PersonaFileNotFound { path: path.into() });
        }
        let raw = std::fs::read_to_string(path).map_err(|e| AssetError::Invalid {
            message: format!("failed to read personas: {e}"),
        })?;
        let personas: HashMap<String, Persona> =
            serde_json::from_str(&raw).map_err(|e| AssetError::Invalid {
                message: format!("invalid persona JSON: {e}"),
            })?;

        // Teen is the fallback band; a set without it cannot serve lookups.
        if !personas.contains_key("Teen") {
            return Err(AssetError::Invalid {
                message: "persona file must define a 'Teen' persona".to_string(),
            });
        }

        info!(personas = personas.len(), "Personas loaded");
        Ok(Self { personas })
    }

    /// Build a persona set directly, for tests and embedders.
    pub fn from_map(personas: HashMap<String, Persona>) -> Result<Self, AssetError> {
        if !personas.contains_key("Teen") {
            return Err(AssetError::Invalid {
                message: "persona set must define a 'Teen' persona".to_string(),
            });
        }
        Ok(Self { personas })
    }

    /// Look up the persona for an age band, falling back to Teen.
    pub fn for_age_band(&self, band: AgeBand) -> &Persona {
        let key = band.to_string();
        match self.personas.get(&key) {
            Some(persona) => persona,
            None => {
                warn!(band = %band, "No persona for age band, using Teen");
                &self.personas["Teen"]
            }
        }
    }
}

/// A minimal default persona set covering all four bands.
pub fn default_personas() -> PersonaSet {
    let mk = |name: &str, band: &str, tone: &[&str]| Persona {
        name: name.to_string(),
        maturity_band: band.to_string(),
        tone: tone.iter().map(|s| s.to_string()).collect(),
        safety_policy: String::new(),
    };
    let mut personas = HashMap::new();
    personas.insert("Child".to_string(), mk("Child", "6-8", &["warm", "simple"]));
    personas.insert(
        "Teen".to_string(),
        mk("Teen", "9-12", &["friendly", "clear"]),
    );
    personas.insert(
        "YoungAdult".to_string(),
        mk("YoungAdult", "13-17", &["respectful", "direct"]),
    );
    personas.insert(
        "Emerging".to_string(),
        mk("Emerging", "18-25", &["direct", "informative"]),
    );
    PersonaSet::from_map(personas).expect("default set defines Teen")
}
