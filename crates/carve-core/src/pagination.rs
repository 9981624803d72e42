//! Multi-page extraction.
//!
//! [`paginate`] extracts the current page, stores its records, then asks
//! the page to advance until the rule says stop, `max_pages` is reached or
//! the attempt is cancelled. Everything that happens is accumulated in an
//! [`ExtractionRun`], which outlives the loop so a timed-out attempt still
//! reports the pages it finished.

use std::collections::HashSet;

use scraper::Html;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::LoadedSchema;
use crate::error::AppError;
use crate::models::{ErrorKind, NewRecord, TaskError, record_fingerprint};
use crate::resolver::{FieldError, PageExtraction, extract_page};
use crate::schema::{PaginationKind, PaginationRule};
use crate::selector::compile_css;
use crate::task::{AttemptReport, Outcome, Task};
use crate::throttle::SourceRateLimiter;
use crate::traits::{PageHandle, RecordStore};
use crate::util::sleep_cancellable;

/// URL of page `page` for `page_number` pagination.
///
/// The rule's parameter is replaced (or appended); other query
/// parameters are kept in order.
pub fn page_number_url(first_page: &str, rule: &PaginationRule, page: u32) -> Result<String, AppError> {
    let mut url = Url::parse(first_page)
        .map_err(|e| AppError::FetchError(format!("Invalid page URL '{first_page}': {e}")))?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != rule.param_name.as_str())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(&rule.param_name, &rule.param_value(page).to_string());
    Ok(url.to_string())
}

/// Absolute `href` of the first element matching `selector` that links somewhere.
pub fn find_next_link(html: &str, selector: &str, current_url: &str) -> Result<Option<String>, AppError> {
    let selector = compile_css(selector)?;
    let doc = Html::parse_document(html);
    let base = Url::parse(current_url).ok();
    let href = doc
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .find(|href| !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:"));
    Ok(href.and_then(|href| match &base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(href).ok().map(String::from),
    }))
}

/// Everything one attempt produced so far.
#[derive(Debug, Default)]
pub struct ExtractionRun {
    pub attempt: u32,
    pub pages: u32,
    /// Distinct records found by this attempt.
    pub records_found: u64,
    /// Records the store reported as new.
    pub records_saved: u64,
    pub records_rejected: u64,
    pub errors: Vec<TaskError>,
    failure: Option<(TaskError, bool)>,
    cancelled: bool,
    seen: HashSet<String>,
}

impl ExtractionRun {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            ..Self::default()
        }
    }

    /// Fold one page in; returns its records not seen earlier in the run.
    pub fn record_page(&mut self, page: u32, extraction: PageExtraction, dedup_keys: &[String]) -> Vec<NewRecord> {
        self.pages += 1;
        self.records_rejected += u64::from(extraction.rejected);
        self.push_field_errors(page, extraction.errors);

        let mut fresh = Vec::new();
        for data in extraction.records {
            let record_hash = record_fingerprint(&data, dedup_keys);
            if self.seen.insert(record_hash.clone()) {
                fresh.push(NewRecord {
                    record_hash,
                    page,
                    data,
                });
            }
        }
        self.records_found += fresh.len() as u64;
        fresh
    }

    /// One entry per `(kind, field)` per page.
    fn push_field_errors(&mut self, page: u32, errors: Vec<FieldError>) {
        let mut grouped: Vec<(FieldError, usize)> = Vec::new();
        for error in errors {
            match grouped
                .iter_mut()
                .find(|(g, _)| g.kind == error.kind && g.field == error.field)
            {
                Some((_, count)) => *count += 1,
                None => grouped.push((error, 1)),
            }
        }
        for (error, count) in grouped {
            let message = if count > 1 {
                format!("{} ({count} records)", error.message)
            } else {
                error.message
            };
            self.errors.push(
                TaskError::new(error.kind, message, self.attempt)
                    .with_field(error.field)
                    .with_page(page),
            );
        }
    }

    pub fn push_error(&mut self, kind: ErrorKind, message: impl Into<String>, page: Option<u32>) {
        let mut error = TaskError::new(kind, message, self.attempt);
        error.page = page;
        self.errors.push(error);
    }

    /// The attempt cannot continue.
    pub fn fail(&mut self, error: &AppError, page: Option<u32>) {
        let mut entry = TaskError::new(error.error_kind(), error.to_string(), self.attempt);
        entry.page = page;
        self.failure = Some((entry, error.is_retryable()));
    }

    /// Page `page` could not be fetched or parsed. Before any page was
    /// processed this fails the attempt; afterwards it only ends pagination.
    pub fn page_failed(&mut self, page: u32, error: &AppError) {
        if self.pages == 0 {
            self.fail(error, Some(page));
        } else {
            self.push_error(
                ErrorKind::PaginationFailed,
                format!("page {page}: {error}"),
                Some(page),
            );
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// The wall-clock limit hit; overrides whatever the attempt got to.
    pub fn timed_out(&mut self, limit_secs: u64) {
        self.cancelled = false;
        self.fail(&AppError::Timeout(limit_secs), None);
        if let Some((entry, _)) = &mut self.failure {
            entry.kind = ErrorKind::Timeout;
        }
    }

    pub fn outcome(&self) -> Outcome {
        if let Some((_, retryable)) = &self.failure {
            return Outcome::Failed {
                retryable: *retryable,
            };
        }
        if self.cancelled {
            return Outcome::Cancelled;
        }
        let degraded = !self.errors.is_empty() || self.records_rejected > 0;
        if self.records_found == 0 && degraded {
            let retryable = self.errors.iter().any(|e| {
                matches!(
                    e.kind,
                    ErrorKind::PaginationFailed | ErrorKind::FetchFailed | ErrorKind::RenderTimeout
                )
            });
            Outcome::Failed { retryable }
        } else if degraded {
            Outcome::Partial
        } else {
            Outcome::Success
        }
    }

    pub fn into_report(self) -> AttemptReport {
        let outcome = self.outcome();
        let mut errors = self.errors;
        if let Some((entry, _)) = self.failure {
            errors.push(entry);
        }
        AttemptReport {
            outcome,
            records_saved: self.records_saved,
            records_rejected: self.records_rejected,
            pages: self.pages,
            errors,
        }
    }
}

/// What the page loop needs besides the page itself.
pub struct PageContext<'a, R: RecordStore> {
    pub task: &'a Task,
    pub schema: &'a LoadedSchema,
    pub records: &'a R,
    pub limiter: &'a SourceRateLimiter,
    pub cancel: &'a CancellationToken,
}

/// Extract the current page and follow the pagination rule.
///
/// Never fails: problems are recorded on `run`. Records are stored page
/// by page, so whatever was stored survives a later failure or cancel.
pub async fn paginate<P: PageHandle, R: RecordStore>(
    page: &mut P,
    ctx: &PageContext<'_, R>,
    run: &mut ExtractionRun,
) {
    let def = &ctx.schema.schema.definition;
    let compiled = &ctx.schema.compiled;
    let rule = def.pagination.as_ref();
    let max_pages = rule.map_or(1, |r| r.max_pages.max(1));
    let mut page_no = 1u32;

    loop {
        let html = match page.content().await {
            Ok(html) => html,
            Err(e) => {
                run.page_failed(page_no, &e);
                return;
            }
        };
        let extraction = extract_page(compiled, &html, page.current_url());
        drop(html);

        let empty = extraction.containers == 0
            || (extraction.records.is_empty() && extraction.rejected == 0);
        if extraction.containers == 0 && page_no == 1 {
            if let Some(container) = compiled.container_selector() {
                run.push_error(
                    ErrorKind::SelectorNoMatch,
                    format!("container selector '{container}' matched nothing"),
                    Some(page_no),
                );
            }
        }
        let stop_marker = extraction.stop_marker;

        let fresh = run.record_page(page_no, extraction, &def.dedup_keys);
        tracing::debug!(
            task_id = %ctx.task.id,
            page = page_no,
            records = fresh.len(),
            "Page extracted"
        );
        if !fresh.is_empty() {
            match ctx.records.save_page(ctx.task.id, &fresh).await {
                Ok(saved) => run.records_saved += saved,
                Err(e) => {
                    run.fail(&e, Some(page_no));
                    return;
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            run.cancel();
            return;
        }
        let Some(rule) = rule else {
            return;
        };
        if page_no >= max_pages {
            tracing::debug!(task_id = %ctx.task.id, max_pages, "Page cap reached");
            return;
        }
        if stop_marker || (empty && rule.kind == PaginationKind::PageNumber) {
            return;
        }

        if sleep_cancellable(rule.wait_between(), ctx.cancel).await.is_err()
            || ctx
                .limiter
                .acquire(&ctx.task.source_id, def.rate_limit_delay(), ctx.cancel)
                .await
                .is_err()
        {
            run.cancel();
            return;
        }

        match page.advance(rule, page_no + 1).await {
            Ok(true) => page_no += 1,
            Ok(false) => return,
            Err(AppError::Cancelled) => {
                run.cancel();
                return;
            }
            Err(e) => {
                run.page_failed(page_no + 1, &e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rule() -> PaginationRule {
        PaginationRule::new(PaginationKind::PageNumber)
    }

    #[test]
    fn page_number_url_replaces_param() {
        let url = page_number_url("https://shop.example.com/list?sort=asc&page=1", &rule(), 3).unwrap();
        assert_eq!(url, "https://shop.example.com/list?sort=asc&page=3");

        let mut offset = rule();
        offset.param_name = "start".into();
        offset.param_start = 0;
        offset.param_step = 20;
        let url = page_number_url("https://shop.example.com/list", &offset, 3).unwrap();
        assert_eq!(url, "https://shop.example.com/list?start=40");
    }

    #[test]
    fn next_link_resolves_relative_href() {
        let html = r##"<a class="next" href="#">x</a><a class="next" href="?page=2">Next</a>"##;
        let next = find_next_link(html, "a.next", "https://shop.example.com/list?page=1").unwrap();
        assert_eq!(next.as_deref(), Some("https://shop.example.com/list?page=2"));
        assert_eq!(find_next_link(html, "a.prev", "https://shop.example.com/").unwrap(), None);
    }

    fn page(records: Vec<serde_json::Value>, errors: Vec<FieldError>) -> PageExtraction {
        PageExtraction {
            containers: records.len(),
            records,
            errors,
            ..PageExtraction::default()
        }
    }

    #[test]
    fn duplicate_records_across_pages_counted_once() {
        let mut run = ExtractionRun::new(1);
        let first = run.record_page(1, page(vec![json!({"a": 1}), json!({"a": 2})], vec![]), &[]);
        let second = run.record_page(2, page(vec![json!({"a": 2}), json!({"a": 3})], vec![]), &[]);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(run.records_found, 3);
        assert_eq!(run.outcome(), Outcome::Success);
    }

    #[test]
    fn field_errors_are_grouped_per_page() {
        let mut run = ExtractionRun::new(2);
        let err = |field: &str| FieldError {
            kind: ErrorKind::TransformationFailed,
            field: field.into(),
            message: "no number found in 'n/a'".into(),
        };
        run.record_page(1, page(vec![json!({"a": 1})], vec![err("price"), err("price"), err("stock")]), &[]);
        assert_eq!(run.errors.len(), 2);
        assert_eq!(run.errors[0].message, "no number found in 'n/a' (2 records)");
        assert_eq!(run.errors[0].field.as_deref(), Some("price"));
        assert_eq!(run.errors[0].page, Some(1));
        assert_eq!(run.errors[0].attempt, 2);
        assert_eq!(run.outcome(), Outcome::Partial);
    }

    #[test]
    fn first_page_failure_fails_attempt_later_page_is_partial() {
        let mut run = ExtractionRun::new(1);
        run.page_failed(1, &AppError::NetworkError("reset".into()));
        assert_eq!(run.outcome(), Outcome::Failed { retryable: true });

        let mut run = ExtractionRun::new(1);
        run.record_page(1, page(vec![json!({"a": 1})], vec![]), &[]);
        run.page_failed(2, &AppError::NetworkError("reset".into()));
        assert_eq!(run.outcome(), Outcome::Partial);
        assert_eq!(run.errors[0].kind, ErrorKind::PaginationFailed);
    }

    #[test]
    fn zero_records_with_errors_fails() {
        let mut run = ExtractionRun::new(1);
        let mut p = page(vec![], vec![FieldError {
            kind: ErrorKind::SelectorNoMatch,
            field: "title".into(),
            message: "no match for selector 'h1'".into(),
        }]);
        p.rejected = 1;
        run.record_page(1, p, &[]);
        assert_eq!(run.outcome(), Outcome::Failed { retryable: false });
    }

    #[test]
    fn timeout_overrides_cancel_and_progress() {
        let mut run = ExtractionRun::new(1);
        run.record_page(1, page(vec![json!({"a": 1})], vec![]), &[]);
        run.cancel();
        run.timed_out(30);
        let report = run.into_report();
        assert_eq!(report.outcome, Outcome::Failed { retryable: true });
        assert_eq!(report.errors.last().unwrap().kind, ErrorKind::Timeout);
        assert_eq!(report.pages, 1);
    }
}
