//! Substitutes per-row data values into recorded steps.
//!
//! Resolution order for an eligible step (`input` or `click`):
//! 1. a row column whose name equals the step label,
//! 2. the column mapped onto the step label,
//! 3. the value recorded with the step.
//!
//! Empty cells count as absent and fall through to the next rule.

use crate::field_mapping::{fold, FieldMapping};
use crate::types::{DataRow, Step, StepEvent};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    Direct,
    Mapped,
    Original,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InjectedStep {
    pub step_index: usize,
    pub injected_step: Step,
    pub source: ValueSource,
    pub column: Option<String>,
    pub skipped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InjectorOptions {
    pub case_sensitive: bool,
    pub skip_empty_inputs: bool,
}

impl Default for InjectorOptions {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            skip_empty_inputs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValueInjector {
    options: InjectorOptions,
    column_to_label: HashMap<String, String>,
    label_to_column: HashMap<String, String>,
}

impl ValueInjector {
    pub fn new(mappings: &[FieldMapping], options: InjectorOptions) -> Self {
        let mut column_to_label = HashMap::with_capacity(mappings.len());
        let mut label_to_column = HashMap::with_capacity(mappings.len());
        for entry in mappings.iter().filter(|entry| entry.is_consistent()) {
            let Some(label) = entry.target_label() else {
                continue;
            };
            column_to_label.insert(
                fold(&entry.field_name, options.case_sensitive),
                label.to_string(),
            );
            label_to_column.insert(
                fold(label, options.case_sensitive),
                entry.field_name.clone(),
            );
        }
        Self {
            options,
            column_to_label,
            label_to_column,
        }
    }

    pub fn options(&self) -> InjectorOptions {
        self.options
    }

    pub fn label_for_column(&self, column: &str) -> Option<&str> {
        self.column_to_label
            .get(&fold(column, self.options.case_sensitive))
            .map(String::as_str)
    }

    pub fn column_for_label(&self, label: &str) -> Option<&str> {
        self.label_to_column
            .get(&fold(label, self.options.case_sensitive))
            .map(String::as_str)
    }

    pub fn inject_step(&self, row: &DataRow, step: &Step) -> InjectedStep {
        self.inject_at(0, row, step)
    }

    pub fn inject_row(&self, row: &DataRow, steps: &[Step]) -> Vec<InjectedStep> {
        steps
            .iter()
            .enumerate()
            .map(|(index, step)| self.inject_positioned(index, row, step))
            .collect()
    }

    /// Single-step form of `inject_row`, including the empty-input skip policy.
    pub fn inject_positioned(&self, step_index: usize, row: &DataRow, step: &Step) -> InjectedStep {
        let mut injected = self.inject_at(step_index, row, step);
        injected.skipped = self.options.skip_empty_inputs
            && injected.injected_step.event == StepEvent::Input
            && !injected.injected_step.has_value();
        injected
    }

    fn inject_at(&self, step_index: usize, row: &DataRow, step: &Step) -> InjectedStep {
        let original = |step: &Step| InjectedStep {
            step_index,
            injected_step: step.clone(),
            source: ValueSource::Original,
            column: None,
            skipped: false,
        };

        if !step.event.accepts_injection() {
            return original(step);
        }
        let Some(label) = step.label.as_deref().filter(|label| !label.is_empty()) else {
            return original(step);
        };

        if let Some((column, value)) = self.read_cell(row, label) {
            return InjectedStep {
                step_index,
                injected_step: Step {
                    value: Some(value.to_string()),
                    ..step.clone()
                },
                source: ValueSource::Direct,
                column: Some(column.to_string()),
                skipped: false,
            };
        }

        if let Some(mapped_column) = self.column_for_label(label) {
            if let Some((column, value)) = self.read_cell(row, mapped_column) {
                return InjectedStep {
                    step_index,
                    injected_step: Step {
                        value: Some(value.to_string()),
                        ..step.clone()
                    },
                    source: ValueSource::Mapped,
                    column: Some(column.to_string()),
                    skipped: false,
                };
            }
        }

        original(step)
    }

    fn read_cell<'r>(&self, row: &'r DataRow, column: &str) -> Option<(&'r str, &'r str)> {
        let hit = if self.options.case_sensitive {
            row.get_key_value(column)
        } else {
            let wanted = column.to_lowercase();
            row.iter().find(|(key, _)| key.to_lowercase() == wanted)
        };
        hit.filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}
