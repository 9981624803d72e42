//! Value transformations and final type coercion for extracted fields.
//!
//! Transformations are written as strings in schemas (`"trim"`,
//! `"regex:(\d+):1"`, `"replace:,:"`) and parsed when the schema is
//! deserialized, so an unknown name is rejected at authoring time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value, json};
use url::Url;

use crate::error::AppError;
use crate::schema::FieldType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Transformation {
    Trim,
    Lowercase,
    Uppercase,
    Capitalize,
    Title,
    NormalizeWhitespace,
    RemoveNewlines,
    StripHtml,
    DecodeEntities,
    ExtractNumber,
    ExtractInt,
    ExtractFloat,
    ExtractPrice,
    ToBool,
    ParseJson,
    AbsoluteUrl,
    ExtractDomain,
    ParseDate,
    ParseDatetime,
    Regex { pattern: String, group: Option<usize> },
    Replace { from: String, to: String },
    Substr { start: usize, end: Option<usize> },
}

impl FromStr for Transformation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("regex:") {
            let (pattern, group) = match rest
                .rsplit_once(':')
                .and_then(|(p, g)| g.parse::<usize>().ok().map(|g| (p, g)))
            {
                Some((pattern, group)) => (pattern, Some(group)),
                None => (rest, None),
            };
            if pattern.is_empty() {
                return Err("regex transformation needs a pattern".into());
            }
            return Ok(Transformation::Regex {
                pattern: pattern.to_string(),
                group,
            });
        }
        if let Some(rest) = s.strip_prefix("replace:") {
            let (from, to) = rest
                .split_once(':')
                .ok_or_else(|| format!("replace transformation must be replace:<from>:<to>, got '{s}'"))?;
            if from.is_empty() {
                return Err("replace transformation needs a non-empty search string".into());
            }
            return Ok(Transformation::Replace {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if let Some(rest) = s.strip_prefix("substr:") {
            let bad = || format!("substr transformation must be substr:<start>[:<end>], got '{s}'");
            let (start, end) = match rest.split_once(':') {
                Some((a, b)) => (
                    a.parse::<usize>().map_err(|_| bad())?,
                    Some(b.parse::<usize>().map_err(|_| bad())?),
                ),
                None => (rest.parse::<usize>().map_err(|_| bad())?, None),
            };
            if end.is_some_and(|end| end < start) {
                return Err(bad());
            }
            return Ok(Transformation::Substr { start, end });
        }

        match s.trim() {
            "trim" | "strip" => Ok(Transformation::Trim),
            "lowercase" | "lower" => Ok(Transformation::Lowercase),
            "uppercase" | "upper" => Ok(Transformation::Uppercase),
            "capitalize" => Ok(Transformation::Capitalize),
            "title" => Ok(Transformation::Title),
            "normalize_whitespace" => Ok(Transformation::NormalizeWhitespace),
            "remove_newlines" => Ok(Transformation::RemoveNewlines),
            "strip_html" => Ok(Transformation::StripHtml),
            "decode_entities" => Ok(Transformation::DecodeEntities),
            "extract_number" | "parse_number" => Ok(Transformation::ExtractNumber),
            "extract_int" => Ok(Transformation::ExtractInt),
            "extract_float" => Ok(Transformation::ExtractFloat),
            "extract_price" => Ok(Transformation::ExtractPrice),
            "to_bool" => Ok(Transformation::ToBool),
            "parse_json" => Ok(Transformation::ParseJson),
            "absolute_url" => Ok(Transformation::AbsoluteUrl),
            "extract_domain" => Ok(Transformation::ExtractDomain),
            "parse_date" => Ok(Transformation::ParseDate),
            "parse_datetime" => Ok(Transformation::ParseDatetime),
            other => Err(format!("Unknown transformation '{other}'")),
        }
    }
}

impl TryFrom<String> for Transformation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Transformation> for String {
    fn from(value: Transformation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Transformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transformation::Trim => f.write_str("trim"),
            Transformation::Lowercase => f.write_str("lowercase"),
            Transformation::Uppercase => f.write_str("uppercase"),
            Transformation::Capitalize => f.write_str("capitalize"),
            Transformation::Title => f.write_str("title"),
            Transformation::NormalizeWhitespace => f.write_str("normalize_whitespace"),
            Transformation::RemoveNewlines => f.write_str("remove_newlines"),
            Transformation::StripHtml => f.write_str("strip_html"),
            Transformation::DecodeEntities => f.write_str("decode_entities"),
            Transformation::ExtractNumber => f.write_str("extract_number"),
            Transformation::ExtractInt => f.write_str("extract_int"),
            Transformation::ExtractFloat => f.write_str("extract_float"),
            Transformation::ExtractPrice => f.write_str("extract_price"),
            Transformation::ToBool => f.write_str("to_bool"),
            Transformation::ParseJson => f.write_str("parse_json"),
            Transformation::AbsoluteUrl => f.write_str("absolute_url"),
            Transformation::ExtractDomain => f.write_str("extract_domain"),
            Transformation::ParseDate => f.write_str("parse_date"),
            Transformation::ParseDatetime => f.write_str("parse_datetime"),
            Transformation::Regex {
                pattern,
                group: Some(group),
            } => write!(f, "regex:{pattern}:{group}"),
            Transformation::Regex {
                pattern,
                group: None,
            } => write!(f, "regex:{pattern}"),
            Transformation::Replace { from, to } => write!(f, "replace:{from}:{to}"),
            Transformation::Substr {
                start,
                end: Some(end),
            } => write!(f, "substr:{start}:{end}"),
            Transformation::Substr { start, end: None } => write!(f, "substr:{start}"),
        }
    }
}

/// Page-level inputs some transformations depend on.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformContext<'a> {
    /// Base for resolving relative URLs: the page URL, else the schema `base_url`.
    pub base_url: Option<&'a Url>,
}

/// A transformation with its regex (if any) compiled once per schema.
#[derive(Debug, Clone)]
pub struct CompiledTransform {
    kind: Transformation,
    regex: Option<Regex>,
}

impl CompiledTransform {
    pub fn compile(kind: &Transformation) -> Result<Self, AppError> {
        let regex = match kind {
            Transformation::Regex { pattern, .. } => Some(Regex::new(pattern).map_err(|e| {
                AppError::SelectorError(format!("Invalid regex transformation '{pattern}': {e}"))
            })?),
            _ => None,
        };
        Ok(Self {
            kind: kind.clone(),
            regex,
        })
    }

    pub fn apply(&self, value: Value, ctx: &TransformContext<'_>) -> Result<Value, String> {
        let text = as_text(&value);
        let out = match &self.kind {
            Transformation::Trim => Value::String(text.trim().to_string()),
            Transformation::Lowercase => Value::String(text.to_lowercase()),
            Transformation::Uppercase => Value::String(text.to_uppercase()),
            Transformation::Capitalize => Value::String(capitalize(&text)),
            Transformation::Title => Value::String(
                text.split_whitespace()
                    .map(capitalize)
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            Transformation::NormalizeWhitespace => {
                Value::String(text.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            Transformation::RemoveNewlines => Value::String(
                text.replace("\r\n", " ")
                    .replace(['\n', '\r'], " ")
                    .trim()
                    .to_string(),
            ),
            Transformation::StripHtml => Value::String(strip_tags(&text).trim().to_string()),
            Transformation::DecodeEntities => Value::String(decode_entities(&text)),
            Transformation::ExtractNumber => {
                number_value(parse_number(&text).ok_or_else(|| no_number(&text))?)?
            }
            Transformation::ExtractInt => {
                let n = parse_number(&text).ok_or_else(|| no_number(&text))?;
                json!(n.trunc() as i64)
            }
            Transformation::ExtractFloat => {
                float_value(parse_number(&text).ok_or_else(|| no_number(&text))?)?
            }
            Transformation::ExtractPrice => {
                let amount = parse_number(&text).ok_or_else(|| no_number(&text))?;
                json!({
                    "amount": float_value(amount)?,
                    "currency": detect_currency(&text),
                })
            }
            Transformation::ToBool => Value::Bool(
                parse_bool(&text).ok_or_else(|| format!("'{text}' is not a boolean"))?,
            ),
            Transformation::ParseJson => serde_json::from_str(&text)
                .map_err(|e| format!("invalid JSON: {e}"))?,
            Transformation::AbsoluteUrl => Value::String(absolutize(&text, ctx)?.to_string()),
            Transformation::ExtractDomain => {
                let url = absolutize(&text, ctx)?;
                Value::String(
                    url.host_str()
                        .ok_or_else(|| format!("'{text}' has no host"))?
                        .to_string(),
                )
            }
            Transformation::ParseDate => Value::String(
                parse_naive_date(&text)
                    .ok_or_else(|| format!("'{text}' is not a recognised date"))?
                    .format("%Y-%m-%d")
                    .to_string(),
            ),
            Transformation::ParseDatetime => Value::String(
                parse_datetime_utc(&text)
                    .ok_or_else(|| format!("'{text}' is not a recognised datetime"))?
                    .to_rfc3339(),
            ),
            Transformation::Regex { group, .. } => {
                let re = self
                    .regex
                    .as_ref()
                    .ok_or_else(|| "regex transformation was not compiled".to_string())?;
                let caps = re
                    .captures(&text)
                    .ok_or_else(|| format!("pattern '{}' did not match", re.as_str()))?;
                let index = group.unwrap_or(if re.captures_len() > 1 { 1 } else { 0 });
                let m = caps
                    .get(index)
                    .ok_or_else(|| format!("pattern '{}' has no group {index}", re.as_str()))?;
                Value::String(m.as_str().to_string())
            }
            Transformation::Replace { from, to } => Value::String(text.replace(from, to)),
            Transformation::Substr { start, end } => {
                let chars = text.chars().skip(*start);
                let taken: String = match end {
                    Some(end) => chars.take(end - start).collect(),
                    None => chars.collect(),
                };
                Value::String(taken)
            }
        };
        Ok(out)
    }
}

impl FieldType {
    /// Final coercion of a transformed value into the declared type.
    pub fn coerce(&self, value: Value, ctx: &TransformContext<'_>) -> Result<Value, String> {
        if value.is_null() {
            return Err("value is null".into());
        }
        match self {
            FieldType::String => match value {
                Value::Number(_) | Value::Bool(_) => Ok(Value::String(as_text(&value))),
                other => Ok(other),
            },
            FieldType::Integer => match &value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(Value::from)
                    .ok_or_else(|| format!("{n} is not an integer")),
                Value::String(s) => {
                    let cleaned: String = s
                        .trim()
                        .chars()
                        .filter(|c| !matches!(c, ',' | '_' | ' '))
                        .collect();
                    cleaned
                        .parse::<i64>()
                        .ok()
                        .or_else(|| {
                            cleaned
                                .parse::<f64>()
                                .ok()
                                .filter(|f| f.fract() == 0.0)
                                .map(|f| f as i64)
                        })
                        .map(Value::from)
                        .ok_or_else(|| format!("'{s}' is not an integer"))
                }
                other => Err(format!("{other} is not an integer")),
            },
            FieldType::Float => match &value {
                Value::Number(n) => n
                    .as_f64()
                    .ok_or_else(|| format!("{n} is not a float"))
                    .and_then(float_value),
                Value::String(s) => {
                    let mut cleaned: String = s.trim().chars().filter(|c| *c != ' ').collect();
                    if cleaned.contains(',') && !cleaned.contains('.') {
                        cleaned = cleaned.replace(',', ".");
                    } else {
                        cleaned = cleaned.replace(',', "");
                    }
                    cleaned
                        .parse::<f64>()
                        .map_err(|_| format!("'{s}' is not a float"))
                        .and_then(float_value)
                }
                other => Err(format!("{other} is not a float")),
            },
            FieldType::Boolean => match &value {
                Value::Bool(_) => Ok(value),
                Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
                Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
                Value::String(s) => parse_bool(s)
                    .map(Value::Bool)
                    .ok_or_else(|| format!("'{s}' is not a boolean")),
                other => Err(format!("{other} is not a boolean")),
            },
            FieldType::Url => {
                let url = absolutize(&as_text(&value), ctx)?;
                match url.scheme() {
                    "http" | "https" => Ok(Value::String(url.to_string())),
                    scheme => Err(format!("URL scheme '{scheme}' is not http(s)")),
                }
            }
            FieldType::Datetime => {
                let text = as_text(&value);
                parse_datetime_utc(&text)
                    .map(|dt| Value::String(dt.to_rfc3339()))
                    .ok_or_else(|| format!("'{text}' is not a recognised datetime"))
            }
        }
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn no_number(text: &str) -> String {
    format!("no number found in '{text}'")
}

fn number_value(n: f64) -> Result<Value, String> {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Ok(json!(n as i64))
    } else {
        float_value(n)
    }
}

fn float_value(n: f64) -> Result<Value, String> {
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| format!("{n} is not a finite number"))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Some(true),
        "false" | "no" | "n" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn absolutize(text: &str, ctx: &TransformContext<'_>) -> Result<Url, String> {
    let text = text.trim();
    match ctx.base_url {
        Some(base) => base
            .join(text)
            .map_err(|e| format!("cannot resolve '{text}' against {base}: {e}")),
        None => Url::parse(text).map_err(|e| format!("'{text}' is not an absolute URL: {e}")),
    }
}

/// First number in `text`, understanding both `1,234.56` and `1.234,56`.
pub(crate) fn parse_number(text: &str) -> Option<f64> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|c| c.is_ascii_digit())?;
    let negative = start > 0 && chars[start - 1] == '-';

    let mut raw = String::new();
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        let next_is_digit = chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());
        if c.is_ascii_digit() || ((c == ',' || c == '.') && next_is_digit) {
            raw.push(c);
        } else if matches!(c, ' ' | '\u{a0}' | '\'') && next_is_digit && !raw.is_empty() {
            // thousands separator, dropped
        } else {
            break;
        }
        i += 1;
    }

    let commas = raw.matches(',').count();
    let dots = raw.matches('.').count();
    let normalized = match (raw.rfind(','), raw.rfind('.')) {
        (Some(c), Some(d)) if c > d => raw.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => raw.replace(',', ""),
        (Some(c), None) => {
            if commas == 1 && raw.len() - c - 1 != 3 {
                raw.replace(',', ".")
            } else {
                raw.replace(',', "")
            }
        }
        (None, Some(_)) if dots > 1 => raw.replace('.', ""),
        _ => raw,
    };

    let value: f64 = normalized.parse().ok()?;
    Some(if negative { -value } else { value })
}

fn detect_currency(text: &str) -> Option<&'static str> {
    const SYMBOLS: &[(char, &str)] = &[
        ('$', "USD"),
        ('€', "EUR"),
        ('£', "GBP"),
        ('¥', "JPY"),
        ('₹', "INR"),
    ];
    const CODES: &[&str] = &[
        "USD", "EUR", "GBP", "JPY", "CHF", "CAD", "AUD", "INR", "SEK", "NOK", "DKK", "PLN",
    ];
    let upper = text.to_uppercase();
    if let Some(code) = CODES.iter().find(|code| upper.contains(*code)) {
        return Some(code);
    }
    SYMBOLS
        .iter()
        .find(|(symbol, _)| text.contains(*symbol))
        .map(|(_, code)| *code)
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let decoded = tail
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| decode_entity(&tail[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}

pub(crate) fn parse_naive_date(text: &str) -> Option<NaiveDate> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%d",
        "%d/%m/%Y",
        "%m/%d/%Y",
        "%d.%m.%Y",
        "%Y/%m/%d",
        "%d-%m-%Y",
        "%B %d, %Y",
        "%b %d, %Y",
        "%d %B %Y",
        "%d %b %Y",
    ];
    let text = text.trim();
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| parse_datetime_only(text).map(|dt| dt.date_naive()))
}

pub(crate) fn parse_datetime_utc(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    parse_datetime_only(text).or_else(|| {
        parse_naive_date(text)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    })
}

fn parse_datetime_only(text: &str) -> Option<DateTime<Utc>> {
    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M",
    ];
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(spec: &str, input: &str) -> Result<Value, String> {
        let t: Transformation = spec.parse().unwrap();
        CompiledTransform::compile(&t)
            .unwrap()
            .apply(Value::String(input.to_string()), &TransformContext::default())
    }

    #[test]
    fn parse_and_display_are_inverse() {
        for spec in [
            "trim",
            "extract_number",
            "regex:(\\d+)-(\\d+):2",
            "regex:price",
            "replace:,:",
            "substr:0:5",
            "substr:3",
        ] {
            let t: Transformation = spec.parse().unwrap();
            assert_eq!(t.to_string(), spec);
        }
    }

    #[test]
    fn unknown_transformation_rejected() {
        assert!("shout".parse::<Transformation>().is_err());
        assert!("replace:nocolon".parse::<Transformation>().is_err());
        assert!("substr:5:2".parse::<Transformation>().is_err());
        let err = serde_json::from_value::<Transformation>(json!("bogus")).unwrap_err();
        assert!(err.to_string().contains("Unknown transformation"));
    }

    #[test]
    fn string_transformations() {
        assert_eq!(apply("trim", "  hi  ").unwrap(), json!("hi"));
        assert_eq!(apply("capitalize", "hELLO").unwrap(), json!("Hello"));
        assert_eq!(apply("title", "the grand hotel").unwrap(), json!("The Grand Hotel"));
        assert_eq!(
            apply("normalize_whitespace", " a \n\t b  c ").unwrap(),
            json!("a b c")
        );
        assert_eq!(apply("remove_newlines", "a\r\nb\nc").unwrap(), json!("a b c"));
        assert_eq!(apply("strip_html", "<b>bold</b> text").unwrap(), json!("bold text"));
        assert_eq!(
            apply("decode_entities", "Tom &amp; Jerry &#39;s &#x41; &bogus").unwrap(),
            json!("Tom & Jerry 's A &bogus")
        );
    }

    #[test]
    fn number_extraction_handles_locales() {
        assert_eq!(apply("extract_number", "Price: 1,234.56 USD").unwrap(), json!(1234.56));
        assert_eq!(apply("extract_number", "1.234,56 €").unwrap(), json!(1234.56));
        assert_eq!(apply("extract_number", "12,5 kg").unwrap(), json!(12.5));
        assert_eq!(apply("extract_number", "1,234 items").unwrap(), json!(1234));
        assert_eq!(apply("extract_number", "1.234.567").unwrap(), json!(1234567));
        assert_eq!(apply("extract_number", "temp -4 C").unwrap(), json!(-4));
        assert_eq!(apply("extract_int", "4.7 stars").unwrap(), json!(4));
        assert!(apply("extract_number", "no digits").is_err());
    }

    #[test]
    fn price_extraction() {
        assert_eq!(
            apply("extract_price", "€ 19,99").unwrap(),
            json!({"amount": 19.99, "currency": "EUR"})
        );
        assert_eq!(
            apply("extract_price", "USD 1,200.00").unwrap(),
            json!({"amount": 1200.0, "currency": "USD"})
        );
        assert_eq!(
            apply("extract_price", "42").unwrap(),
            json!({"amount": 42.0, "currency": null})
        );
    }

    #[test]
    fn regex_group_defaults() {
        assert_eq!(apply("regex:id=(\\d+)", "item id=42 x").unwrap(), json!("42"));
        assert_eq!(apply("regex:\\d+", "abc 77").unwrap(), json!("77"));
        assert_eq!(apply("regex:(\\w+)@(\\w+):2", "me@host").unwrap(), json!("host"));
        assert!(apply("regex:zzz", "abc").is_err());
    }

    #[test]
    fn replace_and_substr() {
        assert_eq!(apply("replace:,:", "1,000").unwrap(), json!("1000"));
        assert_eq!(apply("substr:0:3", "abcdef").unwrap(), json!("abc"));
        assert_eq!(apply("substr:4", "abcdef").unwrap(), json!("ef"));
    }

    #[test]
    fn dates() {
        assert_eq!(apply("parse_date", "March 5, 2024").unwrap(), json!("2024-03-05"));
        assert_eq!(apply("parse_date", "05/03/2024").unwrap(), json!("2024-03-05"));
        assert_eq!(
            apply("parse_datetime", "2024-03-05 10:30:00").unwrap(),
            json!("2024-03-05T10:30:00+00:00")
        );
        assert!(apply("parse_date", "someday").is_err());
    }

    #[test]
    fn urls_resolve_against_base() {
        let base = Url::parse("https://shop.example.com/list/page").unwrap();
        let ctx = TransformContext {
            base_url: Some(&base),
        };
        let t = CompiledTransform::compile(&Transformation::AbsoluteUrl).unwrap();
        assert_eq!(
            t.apply(json!("/item/1"), &ctx).unwrap(),
            json!("https://shop.example.com/item/1")
        );
        let t = CompiledTransform::compile(&Transformation::ExtractDomain).unwrap();
        assert_eq!(t.apply(json!("item/2"), &ctx).unwrap(), json!("shop.example.com"));
        assert!(apply("absolute_url", "/relative").is_err());
    }

    #[test]
    fn bool_and_json() {
        assert_eq!(apply("to_bool", "Yes").unwrap(), json!(true));
        assert_eq!(apply("to_bool", "off").unwrap(), json!(false));
        assert!(apply("to_bool", "maybe").is_err());
        assert_eq!(apply("parse_json", r#"{"a":1}"#).unwrap(), json!({"a": 1}));
        assert!(apply("parse_json", "{oops").is_err());
    }

    #[test]
    fn coercion() {
        let ctx = TransformContext::default();
        assert_eq!(FieldType::Integer.coerce(json!("1,234"), &ctx).unwrap(), json!(1234));
        assert_eq!(FieldType::Integer.coerce(json!(3.0), &ctx).unwrap(), json!(3));
        assert!(FieldType::Integer.coerce(json!("3.5"), &ctx).is_err());
        assert_eq!(FieldType::Float.coerce(json!("12,5"), &ctx).unwrap(), json!(12.5));
        assert_eq!(FieldType::Boolean.coerce(json!("yes"), &ctx).unwrap(), json!(true));
        assert_eq!(FieldType::String.coerce(json!(7), &ctx).unwrap(), json!("7"));
        assert_eq!(
            FieldType::String.coerce(json!({"amount": 1.0}), &ctx).unwrap(),
            json!({"amount": 1.0})
        );
        assert_eq!(
            FieldType::Datetime.coerce(json!("2024-01-02"), &ctx).unwrap(),
            json!("2024-01-02T00:00:00+00:00")
        );
        assert!(FieldType::Url.coerce(json!("mailto:a@b.c"), &ctx).is_err());
        assert!(FieldType::String.coerce(Value::Null, &ctx).is_err());
    }
}
