//! Test utilities: mock implementations of the fetch and notify traits,
//! plus fixtures.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use crate::callback::CallbackPayload;
use crate::error::AppError;
use crate::models::Mode;
use crate::schema::{NavigationStep, PaginationRule};
use crate::task::{NewTask, Task};
use crate::traits::{FetchRequest, Fetcher, Notifier, PageHandle, PageSource};

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MockResponse {
    Html(String),
    Status(u16),
    Network(String),
}

impl MockResponse {
    fn into_result(self, url: &str) -> Result<String, AppError> {
        match self {
            MockResponse::Html(html) => Ok(html),
            MockResponse::Status(status) => Err(AppError::HttpError {
                status,
                url: url.to_string(),
            }),
            MockResponse::Network(message) => Err(AppError::NetworkError(message)),
        }
    }
}

/// Mock fetcher with per-URL scripted responses.
///
/// Each URL holds a queue; calls pop from it until one response is left,
/// which then repeats. Unknown URLs answer 404.
#[derive(Clone, Default)]
pub struct MockFetcher {
    responses: Arc<Mutex<HashMap<String, VecDeque<MockResponse>>>>,
    calls: Arc<Mutex<Vec<(FetchRequest, Instant)>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(self, url: &str, responses: Vec<MockResponse>) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), responses.into());
        self
    }

    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.with_responses(url, vec![MockResponse::Html(html.to_string())])
    }

    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.with_responses(url, vec![MockResponse::Status(status)])
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.clone(), Instant::now()));
        let next = {
            let mut responses = self.responses.lock().unwrap();
            match responses.get_mut(&request.url) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };
        next.unwrap_or(MockResponse::Status(404))
            .into_result(&request.url)
    }
}

// ---------------------------------------------------------------------------
// MockPageSource
// ---------------------------------------------------------------------------

/// Scripted "browser": a fixed sequence of page contents.
///
/// `advance` moves to the next content regardless of the rule, so any
/// pagination kind can be exercised. Performed navigation steps are
/// logged as `"<action> <selector>=<value>"`.
#[derive(Clone, Default)]
pub struct MockPageSource {
    pages: Arc<Vec<String>>,
    missing: Arc<HashSet<String>>,
    content_delay: Duration,
    performed: Arc<Mutex<Vec<String>>>,
}

impl MockPageSource {
    pub fn new(pages: Vec<String>) -> Self {
        Self {
            pages: Arc::new(pages),
            ..Self::default()
        }
    }

    /// Steps targeting `selector` fail as if the element were absent.
    pub fn with_missing(mut self, selector: &str) -> Self {
        let mut missing = (*self.missing).clone();
        missing.insert(selector.to_string());
        self.missing = Arc::new(missing);
        self
    }

    /// Every `content()` call takes this long.
    pub fn with_content_delay(mut self, delay: Duration) -> Self {
        self.content_delay = delay;
        self
    }

    pub fn performed(&self) -> Vec<String> {
        self.performed.lock().unwrap().clone()
    }
}

impl PageSource for MockPageSource {
    type Page = MockPage;

    fn mode(&self) -> Mode {
        Mode::Browser
    }

    async fn acquire(&self, request: &FetchRequest) -> Result<MockPage, AppError> {
        Ok(MockPage {
            source: self.clone(),
            url: request.url.clone(),
            index: 0,
        })
    }
}

pub struct MockPage {
    source: MockPageSource,
    url: String,
    index: usize,
}

impl PageHandle for MockPage {
    fn current_url(&self) -> &str {
        &self.url
    }

    async fn content(&mut self) -> Result<String, AppError> {
        if !self.source.content_delay.is_zero() {
            tokio::time::sleep(self.source.content_delay).await;
        }
        self.source
            .pages
            .get(self.index)
            .cloned()
            .ok_or_else(|| AppError::BrowserError("page closed".into()))
    }

    async fn perform(&mut self, step: &NavigationStep) -> Result<(), AppError> {
        if let Some(selector) = &step.selector {
            if self.source.missing.contains(selector) {
                return Err(AppError::BrowserError(format!(
                    "no element matches '{selector}'"
                )));
            }
        }
        let mut entry = step.action.as_str().to_string();
        if let Some(selector) = &step.selector {
            entry.push(' ');
            entry.push_str(selector);
        }
        if let Some(value) = &step.value {
            entry.push('=');
            entry.push_str(value);
        }
        self.source.performed.lock().unwrap().push(entry);
        Ok(())
    }

    async fn advance(&mut self, _rule: &PaginationRule, _next_page: u32) -> Result<bool, AppError> {
        if self.index + 1 < self.source.pages.len() {
            self.index += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn close(self) {}
}

// ---------------------------------------------------------------------------
// MockNotifier
// ---------------------------------------------------------------------------

/// Records callbacks; the first `failures` calls fail.
#[derive(Clone, Default)]
pub struct MockNotifier {
    failures: Arc<Mutex<u32>>,
    calls: Arc<Mutex<Vec<(String, CallbackPayload)>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failures(failures: u32) -> Self {
        Self {
            failures: Arc::new(Mutex::new(failures)),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, CallbackPayload)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Notifier for MockNotifier {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<(), AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), payload.clone()));
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(AppError::HttpError {
                status: 502,
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn sample_new_task() -> NewTask {
    NewTask {
        source_id: "shop".into(),
        schema_id: "listing".into(),
        schema_version: 1,
        target_url: "https://shop.test/list".into(),
        mode: Mode::Http,
        priority: 3,
        max_attempts: 3,
        callback_url: None,
        scheduled_for: None,
    }
}

/// A fresh, pending task.
pub fn sample_task() -> Task {
    Task::new(sample_new_task(), Utc::now())
}

/// A listing page of `items` products, `div.item > h2 + a`, unique per page.
pub fn listing_page(page: u32, items: usize) -> String {
    let body: String = (1..=items)
        .map(|i| {
            format!(
                r#"<div class="item"><h2>Product {page}-{i}</h2><a href="/p/{page}/{i}">view</a><span class="price">{i},99 €</span></div>"#
            )
        })
        .collect();
    format!("<html><body><main>{body}</main></body></html>")
}
