//! Column-to-label mappings used to feed data rows into recorded steps.
//!
//! Every helper here returns entries that satisfy the pairing rule: a mapped
//! entry always carries a non-empty target label and an unmapped entry never
//! carries one.

use crate::errors::ReplayError;
use crate::types::Step;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field_name: String,
    pub mapped: bool,
    #[serde(default)]
    pub inputvarfields: String,
}

impl FieldMapping {
    pub fn unmapped(field_name: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            mapped: false,
            inputvarfields: String::new(),
        }
    }

    pub fn mapped_to(field_name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            mapped: true,
            inputvarfields: label.into(),
        }
        .normalized()
    }

    pub fn target_label(&self) -> Option<&str> {
        if self.mapped {
            Some(self.inputvarfields.as_str())
        } else {
            None
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.mapped == !self.inputvarfields.trim().is_empty()
    }

    /// Re-establishes the pairing rule, trusting the label over the flag.
    pub fn normalized(mut self) -> Self {
        if self.inputvarfields.trim().is_empty() {
            self.mapped = false;
            self.inputvarfields.clear();
        } else if !self.mapped {
            self.inputvarfields.clear();
        }
        self
    }
}

pub fn map_field(entry: &FieldMapping, label: &str) -> FieldMapping {
    FieldMapping {
        field_name: entry.field_name.clone(),
        mapped: true,
        inputvarfields: label.to_string(),
    }
    .normalized()
}

pub fn unmap_field(entry: &FieldMapping) -> FieldMapping {
    FieldMapping::unmapped(entry.field_name.clone())
}

pub fn toggle_mapping(entry: &FieldMapping, label: &str) -> FieldMapping {
    if entry.mapped {
        unmap_field(entry)
    } else {
        map_field(entry, label)
    }
}

/// Applies `update` to the entry named `field_name`; other entries pass through normalised.
pub fn update_in_array(
    set: &[FieldMapping],
    field_name: &str,
    update: impl FnOnce(&FieldMapping) -> FieldMapping,
) -> Vec<FieldMapping> {
    let mut update = Some(update);
    set.iter()
        .map(|entry| {
            if entry.field_name == field_name {
                if let Some(apply) = update.take() {
                    let mut next = apply(entry);
                    next.field_name = entry.field_name.clone();
                    return next.normalized();
                }
            }
            entry.clone().normalized()
        })
        .collect()
}

pub fn validate_mapping_set(set: &[FieldMapping], case_sensitive: bool) -> Result<(), ReplayError> {
    let mut columns = HashSet::new();
    let mut labels = HashSet::new();
    for entry in set {
        if entry.field_name.trim().is_empty() {
            return Err(ReplayError::Validation(
                "field mapping requires a non-empty field_name".to_string(),
            ));
        }
        if !entry.is_consistent() {
            return Err(ReplayError::Validation(format!(
                "field mapping '{}' has mapped={} with label '{}'",
                entry.field_name, entry.mapped, entry.inputvarfields
            )));
        }
        if !columns.insert(fold(&entry.field_name, case_sensitive)) {
            return Err(ReplayError::Validation(format!(
                "duplicate field mapping for column '{}'",
                entry.field_name
            )));
        }
        if let Some(label) = entry.target_label() {
            if !labels.insert(fold(label, case_sensitive)) {
                return Err(ReplayError::Validation(format!(
                    "step label '{label}' is targeted by more than one mapping"
                )));
            }
        }
    }
    Ok(())
}

/// Maps each column onto the first step label with the same name.
pub fn auto_map(columns: &[String], steps: &[Step], case_sensitive: bool) -> Vec<FieldMapping> {
    let mut taken = HashSet::new();
    columns
        .iter()
        .map(|column| {
            let wanted = fold(column, case_sensitive);
            let hit = steps
                .iter()
                .filter_map(|step| step.label.as_deref())
                .find(|label| fold(label, case_sensitive) == wanted && !taken.contains(&wanted));
            match hit {
                Some(label) => {
                    taken.insert(wanted);
                    FieldMapping::mapped_to(column.clone(), label)
                }
                None => FieldMapping::unmapped(column.clone()),
            }
        })
        .collect()
}

pub(crate) fn fold(value: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        value.to_string()
    } else {
        value.to_lowercase()
    }
}
