//! MITRE ATT&CK reference data.
//!
//! Backends that emit threat metadata look tactics and techniques up through
//! the [`AttackData`] trait. The default source is [`EmptyAttackData`], which
//! knows nothing and keeps conversion fully offline; callers with a copy of the
//! ATT&CK dataset load it into a [`StaticAttackData`].

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// An ATT&CK tactic, e.g. `TA0002` / `execution`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tactic {
    pub id: String,
    pub name: String,
    /// Lower-case tag form, as used in rule tags (`attack.<shortname>`).
    pub shortname: String,
}

/// An ATT&CK technique or sub-technique, e.g. `T1059.001`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Technique {
    pub id: String,
    pub name: String,
    /// Short names of the tactics this technique belongs to.
    #[serde(default)]
    pub tactics: Vec<String>,
}

/// A source of ATT&CK tactics and techniques.
pub trait AttackData: Send + Sync + fmt::Debug {
    /// Look up a technique by id, case-insensitively.
    fn technique(&self, id: &str) -> Option<&Technique>;

    /// Look up a tactic by short name or id, case-insensitively.
    fn tactic(&self, name: &str) -> Option<&Tactic>;
}

/// Data source without any entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyAttackData;

impl AttackData for EmptyAttackData {
    fn technique(&self, _id: &str) -> Option<&Technique> {
        None
    }

    fn tactic(&self, _name: &str) -> Option<&Tactic> {
        None
    }
}

#[derive(Deserialize)]
struct Dataset {
    #[serde(default)]
    tactics: Vec<Tactic>,
    #[serde(default)]
    techniques: Vec<Technique>,
}

/// In-memory data source.
#[derive(Debug, Clone, Default)]
pub struct StaticAttackData {
    tactics: BTreeMap<String, Tactic>,
    techniques: BTreeMap<String, Technique>,
}

impl StaticAttackData {
    pub fn new(tactics: Vec<Tactic>, techniques: Vec<Technique>) -> Self {
        let mut data = Self::default();
        for tactic in tactics {
            data.tactics.insert(tactic.shortname.to_ascii_lowercase(), tactic);
        }
        for technique in techniques {
            data.techniques.insert(technique.id.to_ascii_uppercase(), technique);
        }
        data
    }

    /// Load a dataset of the form
    /// `{"tactics": [{"id", "name", "shortname"}], "techniques": [{"id", "name", "tactics"}]}`.
    ///
    /// # Errors
    /// Returns an error if the JSON does not match that shape.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let dataset: Dataset = serde_json::from_str(text)?;
        Ok(Self::new(dataset.tactics, dataset.techniques))
    }

    pub fn is_empty(&self) -> bool {
        self.tactics.is_empty() && self.techniques.is_empty()
    }
}

impl AttackData for StaticAttackData {
    fn technique(&self, id: &str) -> Option<&Technique> {
        self.techniques.get(&id.to_ascii_uppercase())
    }

    fn tactic(&self, name: &str) -> Option<&Tactic> {
        self.tactics.get(&name.to_ascii_lowercase()).or_else(|| {
            self.tactics
                .values()
                .find(|tactic| tactic.id.eq_ignore_ascii_case(name))
        })
    }
}
