//! Selector strategies over a parsed document.
//!
//! CSS goes straight to `scraper`. XPath is a location-path subset
//! (child and descendant axes, attribute/position/text predicates,
//! trailing `@attr` or `text()`) lowered to per-step CSS compounds.
//! Regex runs over the raw markup of the scope.

use std::collections::HashSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::error::AppError;
use crate::schema::SelectorType;

/// Where a selector is evaluated.
#[derive(Clone, Copy)]
pub enum Scope<'a> {
    Document { html: &'a Html, source: &'a str },
    Element(ElementRef<'a>),
}

/// One selector hit: an element, or text already pulled out of the page.
#[derive(Debug, Clone)]
pub enum Match<'a> {
    Element(ElementRef<'a>),
    Text(String),
}

impl<'a> Match<'a> {
    pub fn element(&self) -> Option<ElementRef<'a>> {
        match self {
            Match::Element(el) => Some(*el),
            Match::Text(_) => None,
        }
    }

    /// Trimmed text content, or the captured text itself.
    pub fn text(&self) -> String {
        match self {
            Match::Element(el) => el.text().collect::<String>().trim().to_string(),
            Match::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CompiledSelector {
    Css {
        selector: Selector,
        attribute: Option<String>,
    },
    Xpath(XPathExpr),
    Regex(Regex),
}

impl CompiledSelector {
    pub fn compile(kind: SelectorType, raw: &str) -> Result<Self, AppError> {
        match kind {
            SelectorType::Css => {
                let (css, attribute) = split_attribute_shorthand(raw);
                Ok(CompiledSelector::Css {
                    selector: compile_css(css)?,
                    attribute,
                })
            }
            SelectorType::Xpath => Ok(CompiledSelector::Xpath(XPathExpr::parse(raw)?)),
            SelectorType::Regex => Regex::new(raw)
                .map(CompiledSelector::Regex)
                .map_err(|e| AppError::SelectorError(format!("Invalid regex selector '{raw}': {e}"))),
        }
    }

    /// All matches in document order.
    pub fn select<'a>(&self, scope: &Scope<'a>) -> Vec<Match<'a>> {
        match self {
            CompiledSelector::Css {
                selector,
                attribute,
            } => {
                let elements: Vec<ElementRef<'a>> = match scope {
                    Scope::Document { html, .. } => html.select(selector).collect(),
                    Scope::Element(el) => el.select(selector).collect(),
                };
                match attribute {
                    Some(attr) => elements
                        .into_iter()
                        .filter_map(|el| el.value().attr(attr).map(|v| Match::Text(v.to_string())))
                        .collect(),
                    None => elements.into_iter().map(Match::Element).collect(),
                }
            }
            CompiledSelector::Xpath(expr) => expr.evaluate(scope),
            CompiledSelector::Regex(re) => {
                let haystack = match scope {
                    Scope::Document { source, .. } => (*source).to_string(),
                    Scope::Element(el) => el.html(),
                };
                let group = if re.captures_len() > 1 { 1 } else { 0 };
                re.captures_iter(&haystack)
                    .filter_map(|caps| caps.get(group))
                    .map(|m| Match::Text(m.as_str().to_string()))
                    .collect()
            }
        }
    }
}

pub fn compile_css(raw: &str) -> Result<Selector, AppError> {
    Selector::parse(raw)
        .map_err(|e| AppError::SelectorError(format!("Invalid CSS selector '{raw}': {e}")))
}

/// `a.link@href` reads the `href` attribute of `a.link`.
fn split_attribute_shorthand(raw: &str) -> (&str, Option<String>) {
    let Some(at) = raw.rfind('@') else {
        return (raw, None);
    };
    let (css, attr) = (&raw[..at], &raw[at + 1..]);
    let opened = css.matches('[').count();
    let closed = css.matches(']').count();
    let in_quotes = css.matches('"').count() % 2 == 1 || css.matches('\'').count() % 2 == 1;
    if css.trim().is_empty() || opened != closed || in_quotes || !is_name(attr) {
        return (raw, None);
    }
    (css.trim_end(), Some(attr.to_string()))
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.'))
}

#[derive(Debug, Clone)]
enum TextFilter {
    Equals(String),
    Contains(String),
}

#[derive(Debug, Clone)]
struct XStep {
    descendant: bool,
    selector: Selector,
    text_filters: Vec<TextFilter>,
}

#[derive(Debug, Clone)]
enum XTail {
    Element,
    Text,
    Attr(String),
}

#[derive(Debug, Clone)]
pub struct XPathExpr {
    steps: Vec<XStep>,
    tail: XTail,
}

impl XPathExpr {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let bad = |why: &str| AppError::SelectorError(format!("Unsupported XPath '{raw}': {why}"));
        let expr = raw.trim();
        let expr = expr.strip_prefix('.').filter(|rest| rest.starts_with('/')).unwrap_or(expr);
        let segments = split_top_level(expr, '/');
        if segments.iter().all(|s| s.is_empty()) {
            return Err(bad("empty path"));
        }

        let mut steps = Vec::new();
        let mut tail = XTail::Element;
        let mut descendant = false;
        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            let segment = segment.trim();
            if segment.is_empty() {
                if i > 0 {
                    descendant = true;
                }
                continue;
            }
            if segment == "." {
                continue;
            }
            if segment == ".." {
                return Err(bad("parent axis"));
            }
            if segment == "text()" || segment.starts_with('@') {
                if i != last {
                    return Err(bad("text() and @attr must end the path"));
                }
                tail = match segment.strip_prefix('@') {
                    Some(attr) if is_name(attr) => XTail::Attr(attr.to_string()),
                    Some(_) => return Err(bad("bad attribute name")),
                    None => XTail::Text,
                };
                if descendant {
                    return Err(bad("descendant text()/@attr"));
                }
                continue;
            }
            steps.push(parse_step(segment, descendant).map_err(|why| bad(&why))?);
            descendant = false;
        }
        if steps.is_empty() {
            return Err(bad("no element steps"));
        }
        Ok(Self { steps, tail })
    }

    fn evaluate<'a>(&self, scope: &Scope<'a>) -> Vec<Match<'a>> {
        let mut current: Vec<ElementRef<'a>> = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            let mut next = Vec::new();
            let mut seen = HashSet::new();
            let mut push = |el: ElementRef<'a>| {
                if step.accepts(&el) && seen.insert(el.id()) {
                    next.push(el);
                }
            };
            match (i, scope) {
                (0, Scope::Document { html, .. }) => {
                    if step.descendant {
                        html.select(&step.selector).for_each(&mut push);
                    } else {
                        let root = html.root_element();
                        if step.selector.matches(&root) {
                            push(root);
                        }
                    }
                }
                _ => {
                    let contexts = if i == 0 {
                        match scope {
                            Scope::Element(el) => vec![*el],
                            Scope::Document { .. } => Vec::new(),
                        }
                    } else {
                        std::mem::take(&mut current)
                    };
                    for ctx in contexts {
                        if step.descendant {
                            ctx.select(&step.selector).for_each(&mut push);
                        } else {
                            ctx.children()
                                .filter_map(ElementRef::wrap)
                                .filter(|child| step.selector.matches(child))
                                .for_each(&mut push);
                        }
                    }
                }
            }
            current = next;
        }

        match &self.tail {
            XTail::Element => current.into_iter().map(Match::Element).collect(),
            XTail::Attr(attr) => current
                .into_iter()
                .filter_map(|el| el.value().attr(attr).map(|v| Match::Text(v.to_string())))
                .collect(),
            XTail::Text => current
                .into_iter()
                .filter_map(|el| {
                    let own: String = el
                        .children()
                        .filter_map(|n| n.value().as_text().map(|t| t.to_string()))
                        .collect();
                    let own = own.trim();
                    (!own.is_empty()).then(|| Match::Text(own.to_string()))
                })
                .collect(),
        }
    }
}

impl XStep {
    fn accepts(&self, el: &ElementRef<'_>) -> bool {
        if self.text_filters.is_empty() {
            return true;
        }
        let text: String = el.text().collect();
        let text = text.trim();
        self.text_filters.iter().all(|f| match f {
            TextFilter::Equals(v) => text == v,
            TextFilter::Contains(v) => text.contains(v.as_str()),
        })
    }
}

fn parse_step(segment: &str, descendant: bool) -> Result<XStep, String> {
    let (name, mut rest) = match segment.find('[') {
        Some(pos) => (&segment[..pos], &segment[pos..]),
        None => (segment, ""),
    };
    if name != "*" && !is_name(name) {
        return Err(format!("bad step '{segment}'"));
    }

    let mut css = name.to_string();
    let mut text_filters = Vec::new();
    let mut filtered = false;
    while !rest.is_empty() {
        let close = closing_bracket(rest).ok_or_else(|| format!("unbalanced predicate in '{segment}'"))?;
        let predicate = rest[1..close].trim();
        rest = &rest[close + 1..];

        // Positions lower to sibling-of-type counts, which cannot count
        // within an already filtered set.
        let positional = predicate == "last()" || predicate.parse::<usize>().is_ok();
        if positional && filtered {
            return Err(format!(
                "positional predicate '[{predicate}]' must come before other predicates in '{segment}'"
            ));
        }
        filtered |= !positional;

        if let Ok(n) = predicate.parse::<usize>() {
            if n == 0 {
                return Err("positions start at 1".into());
            }
            css.push_str(&format!(":nth-of-type({n})"));
        } else if predicate == "last()" {
            css.push_str(":last-of-type");
        } else if let Some(attr) = predicate.strip_prefix('@') {
            match attr.split_once('=') {
                Some((name, value)) => {
                    let name = name.trim();
                    if !is_name(name) {
                        return Err(format!("bad attribute in '{predicate}'"));
                    }
                    css.push_str(&format!("[{name}=\"{}\"]", unquote(value)?));
                }
                None if is_name(attr.trim()) => css.push_str(&format!("[{}]", attr.trim())),
                None => return Err(format!("bad attribute in '{predicate}'")),
            }
        } else if let Some(args) = function_args(predicate, "contains") {
            match args {
                (target, value) if target == "text()" || target == "." => {
                    text_filters.push(TextFilter::Contains(unquote(value)?));
                }
                (target, value) => {
                    let attr = target.strip_prefix('@').filter(|a| is_name(a));
                    let attr = attr.ok_or_else(|| format!("bad contains() target '{target}'"))?;
                    css.push_str(&format!("[{attr}*=\"{}\"]", unquote(value)?));
                }
            }
        } else if let Some((target, value)) = function_args(predicate, "starts-with") {
            let attr = target.strip_prefix('@').filter(|a| is_name(a));
            let attr = attr.ok_or_else(|| format!("bad starts-with() target '{target}'"))?;
            css.push_str(&format!("[{attr}^=\"{}\"]", unquote(value)?));
        } else if let Some(value) = predicate
            .strip_prefix("text()")
            .or_else(|| predicate.strip_prefix('.'))
            .and_then(|r| r.trim_start().strip_prefix('='))
        {
            text_filters.push(TextFilter::Equals(unquote(value)?));
        } else {
            return Err(format!("unsupported predicate '[{predicate}]'"));
        }
    }

    let selector = Selector::parse(&css).map_err(|e| format!("cannot lower step '{segment}': {e}"))?;
    Ok(XStep {
        descendant,
        selector,
        text_filters,
    })
}

/// Index of the `]` closing the predicate that opens `s`.
fn closing_bracket(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn function_args<'p>(predicate: &'p str, name: &str) -> Option<(&'p str, &'p str)> {
    let inner = predicate.strip_prefix(name)?.trim_start().strip_prefix('(')?.strip_suffix(')')?;
    let (a, b) = inner.split_once(',')?;
    Some((a.trim(), b.trim()))
}

fn unquote(value: &str) -> Result<String, String> {
    let value = value.trim();
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
        .map(|v| v.replace('"', "\\\""))
        .ok_or_else(|| format!("expected a quoted literal, got {value}"))
}

/// Split on `sep` outside brackets and quotes.
fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, c) if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}
