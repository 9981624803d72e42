//! Declarative extraction schemas.
//!
//! A [`ParsingSchema`] is one immutable version of the extraction rules for a
//! source. Authors submit a [`NewSchema`] (or a [`SchemaDefinition`] for a
//! new version); stores assign `version` and `created_at`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;
use crate::models::Mode;
use crate::resolver::CompiledSchema;
use crate::transform::Transformation;
use crate::util::derive_schema_id;

/// Deepest allowed `nested_fields` chain, counting the top level as 1.
pub const MAX_NESTING_DEPTH: usize = 8;

/// Upper bound accepted for `PaginationRule::max_pages`.
pub const MAX_PAGES_CAP: u32 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorType {
    #[default]
    Css,
    Xpath,
    Regex,
}

/// Target type a field value is coerced to after its transformations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
    Url,
    Datetime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub selector: String,
    #[serde(default)]
    pub selector_type: SelectorType,
    /// Attribute to read instead of the text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default, alias = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformations: Vec<Transformation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested_fields: Vec<FieldDefinition>,
    /// Tried in order when `selector` matches nothing.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_regex: Option<String>,
}

impl FieldDefinition {
    /// A required single-valued text field.
    pub fn new(name: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            selector: selector.into(),
            selector_type: SelectorType::Css,
            attribute: None,
            required: true,
            multiple: false,
            field_type: FieldType::String,
            transformations: Vec::new(),
            nested_fields: Vec::new(),
            fallback_selectors: Vec::new(),
            default: None,
            validation_regex: None,
        }
    }

    pub fn with_selector_type(mut self, selector_type: SelectorType) -> Self {
        self.selector_type = selector_type;
        self
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn with_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    pub fn with_transformations(mut self, transformations: Vec<Transformation>) -> Self {
        self.transformations = transformations;
        self
    }

    pub fn with_nested(mut self, nested: Vec<FieldDefinition>) -> Self {
        self.nested_fields = nested;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationAction {
    Click,
    Scroll,
    Wait,
    Input,
    Hover,
    Select,
}

impl NavigationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NavigationAction::Click => "click",
            NavigationAction::Scroll => "scroll",
            NavigationAction::Wait => "wait",
            NavigationAction::Input => "input",
            NavigationAction::Hover => "hover",
            NavigationAction::Select => "select",
        }
    }

    pub fn requires_selector(&self) -> bool {
        matches!(
            self,
            NavigationAction::Click
                | NavigationAction::Input
                | NavigationAction::Hover
                | NavigationAction::Select
        )
    }

    pub fn requires_value(&self) -> bool {
        matches!(self, NavigationAction::Input | NavigationAction::Select)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NavigationStep {
    pub action: NavigationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Settle time after the action.
    #[serde(default)]
    pub wait_after_ms: u64,
    /// Selector to await after the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    /// A failing optional step is logged and skipped.
    #[serde(default)]
    pub optional: bool,
}

impl NavigationStep {
    pub fn new(action: NavigationAction) -> Self {
        Self {
            action,
            selector: None,
            value: None,
            wait_after_ms: 0,
            wait_for: None,
            optional: false,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_wait_after(mut self, ms: u64) -> Self {
        self.wait_after_ms = ms;
        self
    }

    pub fn wait_after(&self) -> Duration {
        Duration::from_millis(self.wait_after_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationKind {
    NextButton,
    InfiniteScroll,
    PageNumber,
    LoadMore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaginationRule {
    #[serde(rename = "type")]
    pub kind: PaginationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub wait_between_ms: u64,
    /// Query parameter rewritten by `page_number` pagination.
    #[serde(default = "default_param_name")]
    pub param_name: String,
    #[serde(default = "default_one")]
    pub param_start: u32,
    #[serde(default = "default_one")]
    pub param_step: u32,
    /// Presence of this selector on a page means there is no next page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_selector: Option<String>,
}

impl PaginationRule {
    pub fn new(kind: PaginationKind) -> Self {
        Self {
            kind,
            selector: None,
            max_pages: default_max_pages(),
            wait_between_ms: 0,
            param_name: default_param_name(),
            param_start: 1,
            param_step: 1,
            stop_selector: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    pub fn wait_between(&self) -> Duration {
        Duration::from_millis(self.wait_between_ms)
    }

    /// Value of the page parameter for the 1-based page `page`.
    pub fn param_value(&self, page: u32) -> u32 {
        self.param_start
            .saturating_add(page.saturating_sub(1).saturating_mul(self.param_step))
    }
}

/// The authorable part of a schema version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Regexes a task's target URL must match (any), when non-empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub url_patterns: Vec<String>,
    /// CSS selector scoping one record per match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_selector: Option<String>,
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub navigation: Vec<NavigationStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationRule>,
    #[serde(default)]
    pub requires_javascript: bool,
    #[serde(default)]
    pub rate_limit_delay_ms: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub min_fields_required: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dedup_keys: Vec<String>,
}

impl SchemaDefinition {
    pub fn new(fields: Vec<FieldDefinition>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    /// Mode a task actually runs in; JavaScript-dependent schemas force the browser.
    pub fn effective_mode(&self, requested: Mode) -> Mode {
        if self.requires_javascript {
            Mode::Browser
        } else {
            requested
        }
    }

    /// Whether `url` satisfies `url_patterns` (vacuously true when empty).
    pub fn matches_url(&self, url: &str) -> Result<bool, AppError> {
        if self.url_patterns.is_empty() {
            return Ok(true);
        }
        for pattern in &self.url_patterns {
            let re = Regex::new(pattern).map_err(|e| {
                AppError::SchemaError(format!("Invalid url pattern '{pattern}': {e}"))
            })?;
            if re.is_match(url) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Structural checks plus a full compilation of every selector,
    /// regex and transformation.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.fields.is_empty() {
            return Err(AppError::SchemaError(
                "Schema must define at least one field".into(),
            ));
        }
        if let Some(base) = &self.base_url {
            Url::parse(base)
                .map_err(|e| AppError::SchemaError(format!("Invalid base_url '{base}': {e}")))?;
        }
        for pattern in &self.url_patterns {
            Regex::new(pattern).map_err(|e| {
                AppError::SchemaError(format!("Invalid url pattern '{pattern}': {e}"))
            })?;
        }
        validate_fields(&self.fields, 1, "")?;

        for (i, step) in self.navigation.iter().enumerate() {
            if step.action.requires_selector() && step.selector.is_none() {
                return Err(AppError::SchemaError(format!(
                    "Navigation step {i} ({}) requires a selector",
                    step.action.as_str()
                )));
            }
            if step.action.requires_value() && step.value.is_none() {
                return Err(AppError::SchemaError(format!(
                    "Navigation step {i} ({}) requires a value",
                    step.action.as_str()
                )));
            }
        }

        if let Some(rule) = &self.pagination {
            if rule.max_pages == 0 || rule.max_pages > MAX_PAGES_CAP {
                return Err(AppError::SchemaError(format!(
                    "pagination.max_pages must be between 1 and {MAX_PAGES_CAP}"
                )));
            }
            let needs_selector = matches!(
                rule.kind,
                PaginationKind::NextButton | PaginationKind::LoadMore
            );
            if needs_selector && rule.selector.is_none() {
                return Err(AppError::SchemaError(
                    "next_button and load_more pagination require a selector".into(),
                ));
            }
            if rule.kind == PaginationKind::PageNumber
                && (rule.param_name.is_empty() || rule.param_step == 0)
            {
                return Err(AppError::SchemaError(
                    "page_number pagination requires param_name and a positive param_step".into(),
                ));
            }
        }

        let top_level: HashSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        if let Some(key) = self
            .dedup_keys
            .iter()
            .find(|k| !top_level.contains(k.as_str()))
        {
            return Err(AppError::SchemaError(format!(
                "dedup key '{key}' is not a top-level field"
            )));
        }
        if self.min_fields_required > self.fields.len() {
            return Err(AppError::SchemaError(format!(
                "min_fields_required ({}) exceeds the number of fields ({})",
                self.min_fields_required,
                self.fields.len()
            )));
        }

        CompiledSchema::compile(self)?;
        Ok(())
    }
}

fn validate_fields(fields: &[FieldDefinition], depth: usize, prefix: &str) -> Result<(), AppError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(AppError::SchemaError(format!(
            "Nested fields under '{prefix}' exceed the maximum depth of {MAX_NESTING_DEPTH}"
        )));
    }
    let mut seen = HashSet::new();
    for field in fields {
        let path = if prefix.is_empty() {
            field.name.clone()
        } else {
            format!("{prefix}.{}", field.name)
        };
        if field.name.trim().is_empty() {
            return Err(AppError::SchemaError("Field names must not be empty".into()));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(AppError::SchemaError(format!("Duplicate field name '{path}'")));
        }
        if field.selector.trim().is_empty() {
            return Err(AppError::SchemaError(format!("Field '{path}' has an empty selector")));
        }
        if !field.nested_fields.is_empty() {
            if field.selector_type == SelectorType::Regex {
                return Err(AppError::SchemaError(format!(
                    "Field '{path}' uses a regex selector and cannot have nested fields"
                )));
            }
            if !field.transformations.is_empty() {
                return Err(AppError::SchemaError(format!(
                    "Field '{path}' has nested fields; transformations do not apply to objects"
                )));
            }
            validate_fields(&field.nested_fields, depth + 1, &path)?;
        }
    }
    Ok(())
}

/// A published, immutable schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsingSchema {
    pub schema_id: String,
    pub source_id: String,
    pub version: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub definition: SchemaDefinition,
}

/// Request to register a new schema (published as version 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSchema {
    #[serde(default)]
    pub schema_id: String,
    pub source_id: String,
    #[serde(flatten)]
    pub definition: SchemaDefinition,
}

impl NewSchema {
    pub fn new(
        schema_id: impl Into<String>,
        source_id: impl Into<String>,
        definition: SchemaDefinition,
    ) -> Self {
        Self {
            schema_id: schema_id.into(),
            source_id: source_id.into(),
            definition,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        validate_identifier("schema_id", &self.schema_id)?;
        if self.source_id.trim().is_empty() {
            return Err(AppError::SchemaError("source_id must not be empty".into()));
        }
        self.definition.validate()
    }

    /// An unpublished version 0, for local one-shot runs.
    pub fn into_local(self) -> ParsingSchema {
        ParsingSchema {
            schema_id: self.schema_id,
            source_id: self.source_id,
            version: 0,
            is_active: true,
            created_at: Utc::now(),
            definition: self.definition,
        }
    }
}

fn validate_identifier(label: &str, value: &str) -> Result<(), AppError> {
    let valid = !value.is_empty()
        && value.len() <= 100
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AppError::SchemaError(format!(
            "{label} must be 1-100 characters of [A-Za-z0-9_.-], got '{value}'"
        )))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaFilter {
    pub source_id: Option<String>,
    pub active_only: bool,
}

/// Load a schema file; a missing `schema_id` is derived from the file name.
pub fn load_schema_file(path: &Path) -> Result<NewSchema, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AppError::SchemaError(format!("Failed to read schema file {}: {e}", path.display()))
    })?;
    let mut schema: NewSchema = serde_json::from_str(&raw).map_err(|e| {
        AppError::SchemaError(format!("Invalid schema file {}: {e}", path.display()))
    })?;
    if schema.schema_id.is_empty() {
        schema.schema_id = derive_schema_id(path);
    }
    schema.validate()?;
    Ok(schema)
}

fn default_true() -> bool {
    true
}

fn default_max_pages() -> u32 {
    10
}

fn default_param_name() -> String {
    "page".to_string()
}

fn default_one() -> u32 {
    1
}
