//! # Decision Engine
//!
//! Computes what a unit is from its typed inventory: a dominant type,
//! a mixed bundle, empty, or ambiguous. Pure functions over the inventory;
//! type labels come from the external detector.
//!
//! ## Rules
//!
//! - Meaningful files are inventory entries that are neither archive
//!   containers nor zero bytes. Archives stay in the inventory until
//!   extraction consumes them, but never count towards a majority.
//! - A known type holding a strict majority of meaningful files (unknowns
//!   included in the denominator) is dominant. Ties are never broken.
//! - Without a majority the unit is mixed when at least one file has a
//!   known type, counting unknown files as one more distinct type. A unit
//!   where no file got a known type is ambiguous.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::config::TypeCatalogConfig;
use crate::manifest::InventoryEntry;
use crate::routing::RouteOutcome;

/// Type labels with pipeline meaning
#[derive(Debug, Clone)]
pub struct TypeCatalog {
    unknown_label: String,
    archive_types: HashSet<String>,
    conversion_targets: HashMap<String, String>,
    extension_aliases: HashMap<String, String>,
}

impl TypeCatalog {
    pub fn from_config(config: &TypeCatalogConfig) -> Self {
        let lower = |label: &String| label.to_ascii_lowercase();
        Self {
            unknown_label: config.unknown_label.to_ascii_lowercase(),
            archive_types: config.archive_types.iter().map(lower).collect(),
            conversion_targets: config
                .conversion_targets
                .iter()
                .map(|(from, to)| (lower(from), lower(to)))
                .collect(),
            extension_aliases: config
                .extension_aliases
                .iter()
                .map(|(from, to)| (lower(from), lower(to)))
                .collect(),
        }
    }

    pub fn unknown_label(&self) -> &str {
        &self.unknown_label
    }

    pub fn is_archive(&self, label: &str) -> bool {
        self.archive_types.contains(&label.to_ascii_lowercase())
    }

    /// Missing labels and the configured unknown label are both unknown
    pub fn is_unknown(&self, label: Option<&str>) -> bool {
        match label {
            None => true,
            Some(label) => label.trim().is_empty() || label.eq_ignore_ascii_case(&self.unknown_label),
        }
    }

    /// Format a legacy type converts to
    pub fn conversion_target(&self, label: &str) -> Option<&str> {
        self.conversion_targets
            .get(&label.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_convertible(&self, label: &str) -> bool {
        self.conversion_target(label).is_some()
    }

    /// Canonical spelling of an extension
    pub fn canonical_extension(&self, extension: &str) -> String {
        let lower = extension.to_ascii_lowercase();
        self.extension_aliases.get(&lower).cloned().unwrap_or(lower)
    }
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::from_config(&TypeCatalogConfig::default())
    }
}

/// What a unit's inventory amounts to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Dominant(String),
    Mixed,
    Empty,
    Ambiguous,
}

impl Classification {
    pub fn outcome(&self) -> RouteOutcome {
        match self {
            Self::Dominant(_) => RouteOutcome::Dominant,
            Self::Mixed => RouteOutcome::Mixed,
            Self::Empty => RouteOutcome::Empty,
            Self::Ambiguous => RouteOutcome::Ambiguous,
        }
    }

    pub fn dominant_type(&self) -> Option<&str> {
        match self {
            Self::Dominant(label) => Some(label),
            _ => None,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dominant(label) => write!(f, "dominant:{label}"),
            Self::Mixed => f.write_str("mixed"),
            Self::Empty => f.write_str("empty"),
            Self::Ambiguous => f.write_str("ambiguous"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    catalog: TypeCatalog,
}

impl DecisionEngine {
    pub fn new(catalog: TypeCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    fn is_archive_entry(&self, entry: &InventoryEntry) -> bool {
        entry
            .detected_type
            .as_deref()
            .is_some_and(|label| self.catalog.is_archive(label))
    }

    fn meaningful<'a>(
        &'a self,
        inventory: &'a [InventoryEntry],
    ) -> impl Iterator<Item = &'a InventoryEntry> + 'a {
        inventory
            .iter()
            .filter(move |entry| entry.size > 0 && !self.is_archive_entry(entry))
    }

    /// Classify a unit from its current typed inventory
    pub fn classify_unit(&self, inventory: &[InventoryEntry]) -> Classification {
        let mut total = 0usize;
        let mut unknown = 0usize;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();

        for entry in self.meaningful(inventory) {
            total += 1;
            match entry.detected_type.as_deref() {
                Some(label) if !self.catalog.is_unknown(Some(label)) => {
                    *counts.entry(label.to_ascii_lowercase()).or_default() += 1;
                }
                _ => unknown += 1,
            }
        }

        if total == 0 {
            return Classification::Empty;
        }

        if let Some((label, count)) = counts.iter().max_by_key(|(_, count)| **count) {
            if count * 2 > total {
                return Classification::Dominant(label.clone());
            }
        }

        // Unknown files form one more distinct type alongside the known ones
        let distinct = counts.len() + usize::from(unknown > 0);
        if counts.is_empty() || distinct < 2 {
            Classification::Ambiguous
        } else {
            Classification::Mixed
        }
    }

    /// Routing label for a classified unit
    ///
    /// Pending archives come first, then empty/ambiguous, then pending
    /// conversions, then the final dominant/mixed verdict.
    pub fn route_outcome(&self, inventory: &[InventoryEntry]) -> RouteOutcome {
        if inventory.iter().any(|entry| self.is_archive_entry(entry)) {
            return RouteOutcome::ArchivesPresent;
        }

        let classification = self.classify_unit(inventory);
        if matches!(classification, Classification::Empty | Classification::Ambiguous) {
            return classification.outcome();
        }

        if self.needs_conversion(inventory) {
            return RouteOutcome::ConversionRequired;
        }

        classification.outcome()
    }

    /// Meaningful files whose type still has a conversion target
    pub fn needs_conversion(&self, inventory: &[InventoryEntry]) -> bool {
        self.meaningful(inventory).any(|entry| {
            entry
                .detected_type
                .as_deref()
                .is_some_and(|label| self.catalog.is_convertible(label))
        })
    }
}
