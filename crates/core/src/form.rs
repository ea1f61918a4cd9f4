//! Multi-step extraction form: steps, fields, the active field, and focus order.

use crate::security::{validate_input, ValidationResult};
use doc_model::FieldKind;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use viewer_core::{ActiveField, StateStore};

static NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-?\d+(\.\d+)?").expect("valid number regex"));

/// First signed decimal number in `text`, if any.
pub fn first_number(text: &str) -> Option<&str> {
    NUMBER.find(text).map(|found| found.as_str())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormError {
    #[error("unknown field {0:?}")]
    UnknownField(String),
    #[error("field {0:?} is disabled")]
    DisabledField(String),
    #[error("Please fill required fields: {}", .0.join(", "))]
    MissingRequired(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormField {
    pub name: String,
    pub label: String,
    pub kind: FieldKind,
    /// Comma-separated rule list understood by [`validate_input`].
    pub rules: String,
    pub disabled: bool,
    pub value: String,
    pub has_extraction: bool,
}

impl FormField {
    pub fn text(name: &str, label: &str) -> Self {
        Self {
            name: name.to_owned(),
            label: label.to_owned(),
            kind: FieldKind::Text,
            rules: String::new(),
            disabled: false,
            value: String::new(),
            has_extraction: false,
        }
    }

    pub fn number(name: &str, label: &str) -> Self {
        Self { kind: FieldKind::Number, ..Self::text(name, label) }
    }

    pub fn with_rules(mut self, rules: &str) -> Self {
        self.rules = rules.to_owned();
        self
    }

    pub fn is_required(&self) -> bool {
        self.rules.split(',').any(|rule| rule.trim() == "required")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FormStep {
    pub title: String,
    pub fields: Vec<FormField>,
}

impl FormStep {
    pub fn new(title: &str, fields: Vec<FormField>) -> Self {
        Self { title: title.to_owned(), fields }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

pub struct ExtractionForm {
    state: Arc<StateStore>,
    steps: Vec<FormStep>,
}

impl std::fmt::Debug for ExtractionForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionForm").field("steps", &self.steps.len()).finish_non_exhaustive()
    }
}

impl ExtractionForm {
    /// Publishes the step count and resets the current step to the first one.
    pub fn new(state: Arc<StateStore>, steps: Vec<FormStep>) -> Self {
        let total = steps.len().max(1);
        state.update(|snapshot| {
            snapshot.total_steps = total;
            snapshot.current_step = 0;
        });

        Self { state, steps }
    }

    /// The eight-step clinical study form.
    pub fn clinical_default(state: Arc<StateStore>) -> Self {
        let steps = vec![
            FormStep::new(
                "Study identification",
                vec![
                    FormField::text("citation", "Citation").with_rules("required,minLength:10"),
                    FormField::text("study_id", "Study ID"),
                    FormField::text("doi", "DOI").with_rules("doi"),
                    FormField::text("pmid", "PMID").with_rules("pmid"),
                    FormField::text("journal", "Journal"),
                    FormField::number("year", "Publication year").with_rules("year"),
                ],
            ),
            FormStep::new(
                "Eligibility",
                vec![
                    FormField::text("inclusion_met", "Inclusion criteria met"),
                    FormField::text("population_description", "Population"),
                    FormField::text("exclusion_notes", "Exclusion notes"),
                ],
            ),
            FormStep::new(
                "Baseline characteristics",
                vec![
                    FormField::number("totalN", "Total N").with_rules("required"),
                    FormField::number("age_mean", "Mean age"),
                    FormField::number("male_percent", "Male (%)"),
                    FormField::number("gcs_mean", "Mean admission GCS"),
                ],
            ),
            FormStep::new(
                "Imaging",
                vec![
                    FormField::text("vascular_territory", "Vascular territory"),
                    FormField::number("infarct_volume", "Infarct volume (mL)"),
                    FormField::number("midline_shift", "Midline shift (mm)"),
                ],
            ),
            FormStep::new(
                "Interventions",
                vec![
                    FormField::text("intervention_type", "Surgical type"),
                    FormField::number("time_to_surgery", "Time to surgery (h)"),
                    FormField::text("comparator", "Comparator"),
                ],
            ),
            FormStep::new(
                "Study arms",
                vec![
                    FormField::text("arm_label", "Arm label"),
                    FormField::number("arm_n", "Arm N"),
                ],
            ),
            FormStep::new(
                "Outcomes",
                vec![
                    FormField::number("mortality_rate", "Mortality (%)"),
                    FormField::text("mortality_timepoint", "Mortality timepoint"),
                    FormField::number("mrs_favorable", "Favorable mRS (%)"),
                    FormField::text("mrs_timepoint", "mRS timepoint"),
                ],
            ),
            FormStep::new(
                "Complications and predictors",
                vec![
                    FormField::text("complication_type", "Complication"),
                    FormField::number("complication_count", "Complication count"),
                    FormField::text("predictors", "Outcome predictors"),
                ],
            ),
        ];

        Self::new(state, steps)
    }

    pub fn steps(&self) -> &[FormStep] {
        &self.steps
    }

    pub fn current_step(&self) -> usize {
        self.state.snapshot().current_step
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.steps.iter().flat_map(|step| &step.fields).find(|field| field.name == name)
    }

    fn field_mut(&mut self, name: &str) -> Result<&mut FormField, FormError> {
        self.steps
            .iter_mut()
            .flat_map(|step| &mut step.fields)
            .find(|field| field.name == name)
            .ok_or_else(|| FormError::UnknownField(name.to_owned()))
    }

    /// Makes `name` the field that the next selection is extracted into.
    pub fn activate(&self, name: &str) -> Result<(), FormError> {
        let field = self.field(name).ok_or_else(|| FormError::UnknownField(name.to_owned()))?;
        if field.disabled {
            return Err(FormError::DisabledField(name.to_owned()));
        }

        let active = ActiveField { name: field.name.clone(), kind: field.kind };
        self.state.update(move |state| state.active_field = Some(active));
        Ok(())
    }

    pub fn set_value(&mut self, name: &str, value: &str) -> Result<(), FormError> {
        self.field_mut(name)?.value = value.to_owned();
        Ok(())
    }

    pub fn set_disabled(&mut self, name: &str, disabled: bool) -> Result<(), FormError> {
        self.field_mut(name)?.disabled = disabled;
        Ok(())
    }

    /// Writes extracted text into a field and returns the value it now holds.
    ///
    /// Number fields take the first number in the text and keep their old value when
    /// there is none.
    pub fn apply_extraction(&mut self, name: &str, text: &str) -> Result<String, FormError> {
        let field = self.field_mut(name)?;
        match field.kind {
            FieldKind::Number => {
                if let Some(number) = first_number(text) {
                    field.value = number.to_owned();
                }
            }
            FieldKind::Text => field.value = text.to_owned(),
        }
        field.has_extraction = true;
        Ok(field.value.clone())
    }

    /// Reapplies previously extracted values, skipping fields this form lacks.
    pub fn restore(&mut self, values: &BTreeMap<String, String>) {
        for (name, text) in values {
            if self.apply_extraction(name, text).is_err() {
                tracing::debug!(field = %name, "skipping extraction for unknown field");
            }
        }
    }

    /// Moves the active field to the next enabled field of the current step.
    ///
    /// Returns the newly active field, or `None` when the active field is last,
    /// disabled, or not on the current step.
    pub fn advance_focus(&self) -> Option<String> {
        let snapshot = self.state.snapshot();
        let active = snapshot.active_field_name()?;
        let step = self.steps.get(snapshot.current_step)?;
        let enabled: Vec<&FormField> = step.fields.iter().filter(|field| !field.disabled).collect();

        let position = enabled.iter().position(|field| field.name == active)?;
        let next = enabled.get(position + 1)?;
        self.activate(&next.name).ok()?;
        Some(next.name.clone())
    }

    /// Non-empty values keyed by field name.
    pub fn collect_values(&self) -> BTreeMap<String, String> {
        self.steps
            .iter()
            .flat_map(|step| &step.fields)
            .filter(|field| !field.value.trim().is_empty())
            .map(|field| (field.name.clone(), field.value.clone()))
            .collect()
    }

    /// Applies every field's rules in step `index`.
    pub fn validate_step(&self, index: usize) -> Vec<FieldIssue> {
        let Some(step) = self.steps.get(index) else {
            return Vec::new();
        };

        step.fields
            .iter()
            .filter(|field| !field.disabled)
            .filter_map(|field| match validate_input(&field.value, &field.rules) {
                ValidationResult { valid: false, message } => Some(FieldIssue {
                    field: field.name.clone(),
                    message: message.unwrap_or_else(|| "Invalid input".to_owned()),
                }),
                ValidationResult { valid: true, .. } => None,
            })
            .collect()
    }

    /// Advances one step unless a required field on the current step is empty.
    pub fn next_step(&self) -> Result<usize, FormError> {
        let current = self.current_step();
        let missing: Vec<String> = self
            .steps
            .get(current)
            .map(|step| {
                step.fields
                    .iter()
                    .filter(|field| !field.disabled && field.is_required())
                    .filter(|field| field.value.trim().is_empty())
                    .map(|field| field.name.clone())
                    .collect()
            })
            .unwrap_or_default();

        if !missing.is_empty() {
            return Err(FormError::MissingRequired(missing));
        }

        let last = self.steps.len().saturating_sub(1);
        let next = (current + 1).min(last);
        self.state.update(|state| state.current_step = next);
        Ok(next)
    }

    pub fn previous_step(&self) -> usize {
        let previous = self.current_step().saturating_sub(1);
        self.state.update(|state| state.current_step = previous);
        previous
    }
}
