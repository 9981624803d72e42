//! Schema compilation and field resolution.
//!
//! Everything here is synchronous and side-effect free: a page is parsed,
//! resolved and dropped within [`extract_page`], so no parsed document is
//! ever held across an await point.

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use url::Url;

use crate::error::AppError;
use crate::models::ErrorKind;
use crate::schema::{FieldDefinition, FieldType, SchemaDefinition};
use crate::selector::{CompiledSelector, Match, Scope, compile_css};
use crate::transform::{CompiledTransform, TransformContext};

/// A field-level problem found while resolving one record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub kind: ErrorKind,
    /// Dotted path, e.g. `author.name`.
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct CompiledField {
    pub name: String,
    pub path: String,
    selectors: Vec<CompiledSelector>,
    selector_source: String,
    attribute: Option<String>,
    required: bool,
    multiple: bool,
    field_type: FieldType,
    transforms: Vec<CompiledTransform>,
    validation: Option<Regex>,
    nested: Vec<CompiledField>,
    default: Option<Value>,
}

impl CompiledField {
    fn compile(def: &FieldDefinition, prefix: &str) -> Result<Self, AppError> {
        let path = if prefix.is_empty() {
            def.name.clone()
        } else {
            format!("{prefix}.{}", def.name)
        };
        let selectors = std::iter::once(&def.selector)
            .chain(&def.fallback_selectors)
            .map(|raw| {
                CompiledSelector::compile(def.selector_type, raw).map_err(|e| match e {
                    AppError::SelectorError(msg) => {
                        AppError::SelectorError(format!("field '{path}': {msg}"))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let transforms = def
            .transformations
            .iter()
            .map(CompiledTransform::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let validation = def
            .validation_regex
            .as_deref()
            .map(|raw| {
                Regex::new(raw).map_err(|e| {
                    AppError::SelectorError(format!("field '{path}': invalid validation_regex: {e}"))
                })
            })
            .transpose()?;
        let nested = def
            .nested_fields
            .iter()
            .map(|child| CompiledField::compile(child, &path))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: def.name.clone(),
            path,
            selectors,
            selector_source: def.selector.clone(),
            attribute: def.attribute.clone(),
            required: def.required,
            multiple: def.multiple,
            field_type: def.field_type,
            transforms,
            validation,
            nested,
            default: def.default.clone(),
        })
    }

    /// Matches of the first selector (primary, then fallbacks) that hits.
    fn matches<'a>(&self, scope: &Scope<'a>) -> Vec<Match<'a>> {
        for selector in &self.selectors {
            let found = selector.select(scope);
            if !found.is_empty() {
                return found;
            }
        }
        Vec::new()
    }

    /// Resolve this field against `scope`.
    ///
    /// With `multiple == false` only the first document-order match is
    /// considered. A value whose transformations or coercion fail is
    /// dropped and reported; the remaining values survive.
    pub fn resolve(
        &self,
        scope: &Scope<'_>,
        ctx: &TransformContext<'_>,
        errors: &mut Vec<FieldError>,
    ) -> Vec<Value> {
        let mut found = self.matches(scope);
        let matched_any = !found.is_empty();
        if !self.multiple {
            found.truncate(1);
        }

        let mut values = Vec::with_capacity(found.len());
        let mut raw_found = false;
        for m in found {
            if !self.nested.is_empty() {
                let Some(el) = m.element() else {
                    errors.push(self.error(
                        ErrorKind::TransformationFailed,
                        "nested fields need an element match, not text",
                    ));
                    continue;
                };
                raw_found = true;
                if let Some(obj) = resolve_object(&self.nested, &Scope::Element(el), ctx, errors) {
                    values.push(Value::Object(obj));
                }
                continue;
            }

            let raw = match (&self.attribute, &m) {
                (Some(attr), Match::Element(el)) => match el.value().attr(attr) {
                    Some(v) => v.to_string(),
                    None => continue,
                },
                _ => m.text(),
            };
            raw_found = true;
            match self.convert(Value::String(raw), ctx) {
                Ok(value) => values.push(value),
                Err(message) => errors.push(self.error(ErrorKind::TransformationFailed, message)),
            }
        }

        if values.is_empty() {
            if let Some(default) = &self.default {
                values.push(default.clone());
            } else if self.required && !raw_found {
                let message = match (&self.attribute, matched_any) {
                    (Some(attr), true) => format!(
                        "attribute '{attr}' missing on matches of selector '{}'",
                        self.selector_source
                    ),
                    _ => format!("no match for selector '{}'", self.selector_source),
                };
                errors.push(self.error(ErrorKind::SelectorNoMatch, message));
            }
        }
        values
    }

    /// The field's value in a record, `None` when it has none.
    fn resolve_value(
        &self,
        scope: &Scope<'_>,
        ctx: &TransformContext<'_>,
        errors: &mut Vec<FieldError>,
    ) -> Option<Value> {
        let values = self.resolve(scope, ctx, errors);
        if self.multiple {
            if values.is_empty() && self.required {
                None
            } else {
                Some(Value::Array(values))
            }
        } else {
            values.into_iter().next()
        }
    }

    fn convert(&self, mut value: Value, ctx: &TransformContext<'_>) -> Result<Value, String> {
        for transform in &self.transforms {
            value = transform.apply(value, ctx)?;
        }
        let value = self.field_type.coerce(value, ctx)?;
        if let Some(re) = &self.validation {
            let text = match &value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !re.is_match(&text) {
                return Err(format!("'{text}' does not match {}", re.as_str()));
            }
        }
        Ok(value)
    }

    fn error(&self, kind: ErrorKind, message: impl Into<String>) -> FieldError {
        FieldError {
            kind,
            field: self.path.clone(),
            message: message.into(),
        }
    }
}

/// Resolve a set of sibling fields into one object.
///
/// Returns `None` when a required field has no value; optional fields
/// without a value are present as `null`.
pub fn resolve_object(
    fields: &[CompiledField],
    scope: &Scope<'_>,
    ctx: &TransformContext<'_>,
    errors: &mut Vec<FieldError>,
) -> Option<Map<String, Value>> {
    let mut obj = Map::new();
    let mut complete = true;
    for field in fields {
        match field.resolve_value(scope, ctx, errors) {
            Some(value) => {
                obj.insert(field.name.clone(), value);
            }
            None if field.required => complete = false,
            None => {
                obj.insert(field.name.clone(), Value::Null);
            }
        }
    }
    complete.then_some(obj)
}

/// A schema definition with every selector, regex and transformation compiled.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    container: Option<Selector>,
    container_source: Option<String>,
    stop_selector: Option<Selector>,
    fields: Vec<CompiledField>,
    min_fields_required: usize,
    base_url: Option<Url>,
}

impl CompiledSchema {
    pub fn compile(def: &SchemaDefinition) -> Result<Self, AppError> {
        let container = def.container_selector.as_deref().map(compile_css).transpose()?;
        let stop_selector = def
            .pagination
            .as_ref()
            .and_then(|p| p.stop_selector.as_deref())
            .map(compile_css)
            .transpose()?;
        if let Some(sel) = def.pagination.as_ref().and_then(|p| p.selector.as_deref()) {
            compile_css(sel)?;
        }
        for step in &def.navigation {
            for sel in [&step.selector, &step.wait_for].into_iter().flatten() {
                compile_css(sel)?;
            }
        }
        let fields = def
            .fields
            .iter()
            .map(|f| CompiledField::compile(f, ""))
            .collect::<Result<Vec<_>, _>>()?;
        let base_url = def
            .base_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| AppError::SchemaError(format!("Invalid base_url: {e}")))?;

        Ok(Self {
            container,
            container_source: def.container_selector.clone(),
            stop_selector,
            fields,
            min_fields_required: def.min_fields_required,
            base_url,
        })
    }

    pub fn container_selector(&self) -> Option<&str> {
        self.container_source.as_deref()
    }

    pub fn fields(&self) -> &[CompiledField] {
        &self.fields
    }
}

/// Everything learned from one page.
#[derive(Debug, Clone, Default)]
pub struct PageExtraction {
    pub records: Vec<Value>,
    /// Records dropped for a missing required field or too few fields.
    pub rejected: u32,
    pub errors: Vec<FieldError>,
    /// Container matches (1 when the schema has no container).
    pub containers: usize,
    /// The pagination stop selector is present.
    pub stop_marker: bool,
}

/// Parse `html` and resolve every record on it.
pub fn extract_page(schema: &CompiledSchema, html: &str, page_url: &str) -> PageExtraction {
    let doc = Html::parse_document(html);
    let base = Url::parse(page_url).ok().or_else(|| schema.base_url.clone());
    let ctx = TransformContext {
        base_url: base.as_ref(),
    };

    let scopes: Vec<Scope<'_>> = match &schema.container {
        Some(container) => doc.select(container).map(Scope::Element).collect(),
        None => vec![Scope::Document {
            html: &doc,
            source: html,
        }],
    };

    let mut page = PageExtraction {
        containers: scopes.len(),
        stop_marker: schema
            .stop_selector
            .as_ref()
            .is_some_and(|sel| doc.select(sel).next().is_some()),
        ..PageExtraction::default()
    };

    for scope in &scopes {
        match resolve_object(&schema.fields, scope, &ctx, &mut page.errors) {
            Some(record) => {
                let present = record.values().filter(|v| !is_empty_value(v)).count();
                if present < schema.min_fields_required {
                    page.rejected += 1;
                    page.errors.push(FieldError {
                        kind: ErrorKind::SelectorNoMatch,
                        field: "(record)".into(),
                        message: format!(
                            "record has {present} populated fields, {} required",
                            schema.min_fields_required
                        ),
                    });
                } else {
                    page.records.push(Value::Object(record));
                }
            }
            None => page.rejected += 1,
        }
    }
    page
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDefinition;
    use crate::transform::Transformation;
    use serde_json::json;

    const LISTING: &str = r#"
        <html><body>
          <div class="product" data-sku="A1">
            <h2>Red Shoe</h2><span class="price">€ 49,90</span>
            <a href="/shoes/red">view</a>
            <ul><li>leather</li><li>red</li></ul>
            <div class="seller"><span class="name">Acme</span><span class="rating">4.5</span></div>
          </div>
          <div class="product" data-sku="B2">
            <h2>Blue Shoe</h2><span class="price">call us</span>
            <a href="/shoes/blue">view</a>
            <div class="seller"><span class="rating">3.9</span></div>
          </div>
          <div class="product" data-sku="C3">
            <span class="price">€ 10,00</span>
          </div>
        </body></html>
    "#;

    fn t(spec: &str) -> Transformation {
        spec.parse().unwrap()
    }

    fn schema(fields: Vec<FieldDefinition>) -> SchemaDefinition {
        let mut def = SchemaDefinition::new(fields);
        def.container_selector = Some("div.product".into());
        def
    }

    fn run(def: &SchemaDefinition) -> PageExtraction {
        let compiled = CompiledSchema::compile(def).unwrap();
        extract_page(&compiled, LISTING, "https://shop.example.com/list")
    }

    #[test]
    fn single_valued_field_takes_first_match() {
        let def = SchemaDefinition::new(vec![FieldDefinition::new("name", "h2")]);
        let page = run(&def);
        assert_eq!(page.records, vec![json!({"name": "Red Shoe"})]);
    }

    #[test]
    fn multiple_collects_all_matches() {
        let def = SchemaDefinition::new(vec![FieldDefinition::new("names", "h2").multiple()]);
        let page = run(&def);
        assert_eq!(page.records, vec![json!({"names": ["Red Shoe", "Blue Shoe"]})]);
    }

    #[test]
    fn container_scopes_records_and_rejects_missing_required() {
        let def = schema(vec![
            FieldDefinition::new("name", "h2"),
            FieldDefinition::new("url", "a")
                .with_attribute("href")
                .with_type(FieldType::Url),
        ]);
        let page = run(&def);
        assert_eq!(page.containers, 3);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0]["url"], "https://shop.example.com/shoes/red");
        assert_eq!(page.rejected, 1);
        assert!(
            page.errors
                .iter()
                .any(|e| e.kind == ErrorKind::SelectorNoMatch && e.field == "name")
        );
    }

    #[test]
    fn failed_transformation_drops_only_that_value() {
        let def = schema(vec![
            FieldDefinition::new("name", "h2").optional(),
            FieldDefinition::new("price", "span.price")
                .optional()
                .with_transformations(vec![t("extract_number")])
                .with_type(FieldType::Float),
        ]);
        let page = run(&def);
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.records[0]["price"], json!(49.9));
        assert_eq!(page.records[1]["price"], Value::Null);
        assert_eq!(page.records[1]["name"], "Blue Shoe");
        let err = page
            .errors
            .iter()
            .find(|e| e.kind == ErrorKind::TransformationFailed)
            .unwrap();
        assert_eq!(err.field, "price");
    }

    #[test]
    fn required_coercion_failure_marks_field_missing() {
        let def = schema(vec![
            FieldDefinition::new("price", "span.price").with_transformations(vec![t("extract_number")]),
        ]);
        let page = run(&def);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.rejected, 1);
        // the selector matched, so only the transformation error is recorded
        assert!(page.errors.iter().all(|e| e.kind == ErrorKind::TransformationFailed));
    }

    #[test]
    fn nested_fields_resolve_against_the_match() {
        let def = schema(vec![
            FieldDefinition::new("name", "h2").optional(),
            FieldDefinition::new("seller", "div.seller").optional().with_nested(vec![
                FieldDefinition::new("name", "span.name"),
                FieldDefinition::new("rating", "span.rating").with_type(FieldType::Float),
            ]),
        ]);
        let page = run(&def);
        assert_eq!(page.records[0]["seller"], json!({"name": "Acme", "rating": 4.5}));
        // second seller lacks a required name: the nested object is dropped
        assert_eq!(page.records[1]["seller"], Value::Null);
        assert!(page.errors.iter().any(|e| e.field == "seller.name"));
    }

    #[test]
    fn fallback_selectors_and_defaults() {
        let mut title = FieldDefinition::new("title", "h1.missing");
        title.fallback_selectors = vec!["h2".into()];
        let mut currency = FieldDefinition::new("currency", "span.currency");
        currency.default = Some(json!("EUR"));
        let page = run(&schema(vec![title.optional(), currency]));
        assert_eq!(page.records[0], json!({"title": "Red Shoe", "currency": "EUR"}));
        assert!(page.errors.is_empty());
    }

    #[test]
    fn validation_regex_rejects_values() {
        let mut sku = FieldDefinition::new("sku", "div.product").with_attribute("data-sku");
        sku.validation_regex = Some(r"^[AB]\d$".into());
        let def = SchemaDefinition::new(vec![sku.multiple()]);
        let page = run(&def);
        assert_eq!(page.records[0]["sku"], json!(["A1", "B2"]));
        assert_eq!(page.errors.len(), 1);
    }

    #[test]
    fn min_fields_required_rejects_sparse_records() {
        let mut def = schema(vec![
            FieldDefinition::new("name", "h2").optional(),
            FieldDefinition::new("features", "li").multiple().optional(),
            FieldDefinition::new("price", "span.price").optional(),
        ]);
        def.min_fields_required = 3;
        let page = run(&def);
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.rejected, 2);
    }

    #[test]
    fn missing_title_yields_no_records_and_no_match_error() {
        let def = SchemaDefinition::new(vec![FieldDefinition::new("title", "h1")]);
        let page = run(&def);
        assert!(page.records.is_empty());
        assert_eq!(page.rejected, 1);
        assert_eq!(page.errors[0].kind, ErrorKind::SelectorNoMatch);
        assert_eq!(page.errors[0].field, "title");
    }

    #[test]
    fn required_attribute_missing_on_match_rejects_with_diagnostic() {
        let mut def = SchemaDefinition::new(vec![
            FieldDefinition::new("name", "h2"),
            FieldDefinition::new("url", "a").with_attribute("href"),
        ]);
        def.container_selector = Some("div.item".into());
        let compiled = CompiledSchema::compile(&def).unwrap();
        let html = r#"<div class="item"><h2>Lamp</h2><a>no link</a></div>"#;
        let page = extract_page(&compiled, html, "https://shop.example.com/");
        assert!(page.records.is_empty());
        assert_eq!(page.rejected, 1);
        assert_eq!(page.errors.len(), 1);
        assert_eq!(page.errors[0].kind, ErrorKind::SelectorNoMatch);
        assert_eq!(page.errors[0].field, "url");
        assert!(page.errors[0].message.contains("attribute 'href'"));
    }

    #[test]
    fn compile_reports_field_path() {
        let def = SchemaDefinition::new(vec![
            FieldDefinition::new("outer", "div")
                .with_nested(vec![FieldDefinition::new("inner", "span[")]),
        ]);
        let err = CompiledSchema::compile(&def).unwrap_err();
        assert!(err.to_string().contains("outer.inner"));
    }
}
