use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use carve_core::error::AppError;
use carve_core::models::Mode;
use carve_core::pagination::page_number_url;
use carve_core::schema::{NavigationAction, NavigationStep, PaginationKind, PaginationRule};
use carve_core::traits::{FetchRequest, PageHandle, PageSource};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, Headers, SetExtraHttpHeadersParams};
use chromiumoxide::element::Element;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;

use crate::fetcher::validate_url;

const POLL: Duration = Duration::from_millis(100);
const GROWTH_CHECKS: u32 = 20;

/// Headless Chromium driven over the DevTools protocol.
///
/// One browser process is shared by all clones; every task attempt gets
/// its own tab, which lives until the attempt closes it. Navigation
/// targets get the fetcher's SSRF check unless
/// [`allow_private_urls`](Self::allow_private_urls) is set.
///
/// # Example
///
/// ```rust,no_run
/// use carve_client::BrowserPageSource;
/// use carve_core::traits::{FetchRequest, PageHandle, PageSource};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let source = BrowserPageSource::launch().await?;
/// let mut page = source.acquire(&FetchRequest::new("https://example.com")).await?;
/// let html = page.content().await?;
/// println!("{}", &html[..200]);
/// page.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserPageSource {
    browser: Arc<Browser>,
    render_timeout: Duration,
    ssrf_protection: bool,
}

impl BrowserPageSource {
    /// Launches headless Chromium with a **30 s** render timeout.
    pub async fn launch() -> Result<Self, AppError> {
        Self::with_render_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_render_timeout(render_timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();
        if let Some(bin) = find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::BrowserError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::BrowserError(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            render_timeout,
            ssrf_protection: true,
        })
    }

    /// Allow navigation to private/reserved addresses.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

async fn check_navigation(url: &str, ssrf_protection: bool) -> Result<(), AppError> {
    if ssrf_protection {
        validate_url(url).await?;
    }
    Ok(())
}

/// Locate a real Chrome/Chromium binary.
///
/// The snap wrapper at `/snap/bin/chromium` strips unknown flags and breaks
/// headless mode, so the binary inside the snap is preferred. `CHROME_BIN`
/// overrides everything; `None` lets chromiumoxide search itself.
fn find_chrome_binary() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    [
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

impl PageSource for BrowserPageSource {
    type Page = BrowserPage;

    fn mode(&self) -> Mode {
        Mode::Browser
    }

    async fn acquire(&self, request: &FetchRequest) -> Result<BrowserPage, AppError> {
        check_navigation(&request.url, self.ssrf_protection).await?;
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| AppError::BrowserError(format!("Failed to open tab: {e}")))?;
        let mut handle = BrowserPage {
            page,
            first_url: request.url.clone(),
            current_url: request.url.clone(),
            render_timeout: self.render_timeout,
            ssrf_protection: self.ssrf_protection,
        };

        if let Err(e) = handle.prepare(request).await {
            handle.close().await;
            return Err(e);
        }
        if let Err(e) = handle.goto(&request.url).await {
            handle.close().await;
            return Err(e);
        }
        Ok(handle)
    }
}

pub struct BrowserPage {
    page: Page,
    first_url: String,
    current_url: String,
    render_timeout: Duration,
    ssrf_protection: bool,
}

impl BrowserPage {
    async fn prepare(&self, request: &FetchRequest) -> Result<(), AppError> {
        if !request.headers.is_empty() {
            let headers = serde_json::to_value(&request.headers)?;
            self.page
                .execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
                .await
                .map_err(|e| AppError::BrowserError(format!("Failed to set headers: {e}")))?;
        }
        if !request.cookies.is_empty() {
            let cookies = request
                .cookies
                .iter()
                .map(|(name, value)| {
                    let mut cookie = CookieParam::new(name.clone(), value.clone());
                    cookie.url = Some(request.url.clone());
                    cookie
                })
                .collect();
            self.page
                .set_cookies(cookies)
                .await
                .map_err(|e| AppError::BrowserError(format!("Failed to set cookies: {e}")))?;
        }
        Ok(())
    }

    async fn goto(&mut self, url: &str) -> Result<(), AppError> {
        check_navigation(url, self.ssrf_protection).await?;
        self.bounded(async {
            self.page
                .goto(url)
                .await
                .map_err(|e| AppError::FetchError(format!("Failed to navigate to {url}: {e}")))?;
            Ok(())
        })
        .await?;
        self.refresh_url().await;
        Ok(())
    }

    async fn refresh_url(&mut self) {
        if let Ok(Some(url)) = self.page.url().await {
            self.current_url = url;
        }
    }

    /// Run `fut` under the render timeout.
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T, AppError>>) -> Result<T, AppError> {
        tokio::time::timeout(self.render_timeout, fut)
            .await
            .map_err(|_| AppError::RenderTimeout(self.render_timeout.as_secs()))?
    }

    async fn element(&self, selector: &str) -> Result<Element, AppError> {
        self.page
            .find_element(selector)
            .await
            .map_err(|e| AppError::BrowserError(format!("no element matches '{selector}': {e}")))
    }

    async fn wait_for(&self, selector: &str) -> Result<(), AppError> {
        self.bounded(async {
            loop {
                if self.page.find_element(selector).await.is_ok() {
                    return Ok(());
                }
                tokio::time::sleep(POLL).await;
            }
        })
        .await
    }

    async fn eval_json(&self, script: String) -> Result<serde_json::Value, AppError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| AppError::BrowserError(format!("Script failed: {e}")))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn document_height(&self) -> Result<u64, AppError> {
        let value = self.eval_json("document.body.scrollHeight".to_string()).await?;
        Ok(value.as_u64().unwrap_or(0))
    }

    /// Wait until the document grows beyond `before`; false if it never does.
    async fn grew_since(&self, before: u64) -> Result<bool, AppError> {
        for _ in 0..GROWTH_CHECKS {
            tokio::time::sleep(POLL * 3).await;
            if self.document_height().await? > before {
                return Ok(true);
            }
        }
        Ok(false)
    }

}

fn require_selector(step: &NavigationStep) -> Result<&str, AppError> {
    step.selector
        .as_deref()
        .ok_or_else(|| AppError::BrowserError(format!("'{}' needs a selector", step.action.as_str())))
}

impl PageHandle for BrowserPage {
    fn current_url(&self) -> &str {
        &self.current_url
    }

    async fn content(&mut self) -> Result<String, AppError> {
        self.bounded(async {
            self.page
                .content()
                .await
                .map_err(|e| AppError::BrowserError(format!("Failed to read page content: {e}")))
        })
        .await
    }

    async fn perform(&mut self, step: &NavigationStep) -> Result<(), AppError> {
        match step.action {
            NavigationAction::Click => {
                let selector = require_selector(step)?;
                self.element(selector)
                    .await?
                    .click()
                    .await
                    .map_err(|e| AppError::BrowserError(format!("click failed: {e}")))?;
            }
            NavigationAction::Hover => {
                let selector = require_selector(step)?;
                self.element(selector)
                    .await?
                    .hover()
                    .await
                    .map_err(|e| AppError::BrowserError(format!("hover failed: {e}")))?;
            }
            NavigationAction::Input => {
                let selector = require_selector(step)?;
                let element = self.element(selector).await?;
                element
                    .click()
                    .await
                    .map_err(|e| AppError::BrowserError(format!("focus failed: {e}")))?;
                element
                    .type_str(step.value.as_deref().unwrap_or(""))
                    .await
                    .map_err(|e| AppError::BrowserError(format!("typing failed: {e}")))?;
            }
            NavigationAction::Select => {
                let selector = require_selector(step)?;
                self.element(selector).await?;
                let script = format!(
                    "(() => {{ const el = document.querySelector({sel}); el.value = {val}; \
                     el.dispatchEvent(new Event('change', {{ bubbles: true }})); }})()",
                    sel = serde_json::to_string(selector)?,
                    val = serde_json::to_string(step.value.as_deref().unwrap_or(""))?,
                );
                self.eval_json(script).await?;
            }
            NavigationAction::Scroll => match step.selector.as_deref() {
                Some(selector) => {
                    self.element(selector)
                        .await?
                        .scroll_into_view()
                        .await
                        .map_err(|e| AppError::BrowserError(format!("scroll failed: {e}")))?;
                }
                None => {
                    self.eval_json("window.scrollTo(0, document.body.scrollHeight)".to_string())
                        .await?;
                }
            },
            NavigationAction::Wait => match step.selector.as_deref() {
                Some(selector) => self.wait_for(selector).await?,
                None => {
                    let ms = step.value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
            },
        }

        if let Some(selector) = step.wait_for.as_deref() {
            self.wait_for(selector).await?;
        }
        self.refresh_url().await;
        Ok(())
    }

    async fn advance(&mut self, rule: &PaginationRule, next_page: u32) -> Result<bool, AppError> {
        match rule.kind {
            PaginationKind::PageNumber => {
                let url = page_number_url(&self.first_url, rule, next_page)?;
                if url == self.current_url {
                    return Ok(false);
                }
                self.goto(&url).await?;
                Ok(true)
            }
            PaginationKind::NextButton => {
                let Some(selector) = rule.selector.as_deref() else {
                    return Ok(false);
                };
                let Ok(button) = self.page.find_element(selector).await else {
                    return Ok(false);
                };
                let before = self.current_url.clone();
                button
                    .click()
                    .await
                    .map_err(|e| AppError::BrowserError(format!("next click failed: {e}")))?;
                self.bounded(async {
                    self.page
                        .wait_for_navigation()
                        .await
                        .map_err(|e| AppError::BrowserError(format!("navigation failed: {e}")))?;
                    Ok(())
                })
                .await?;
                self.refresh_url().await;
                Ok(self.current_url != before)
            }
            PaginationKind::InfiniteScroll => {
                let before = self.document_height().await?;
                self.eval_json("window.scrollTo(0, document.body.scrollHeight)".to_string())
                    .await?;
                self.grew_since(before).await
            }
            PaginationKind::LoadMore => {
                let Some(selector) = rule.selector.as_deref() else {
                    return Ok(false);
                };
                let Ok(button) = self.page.find_element(selector).await else {
                    return Ok(false);
                };
                let before = self.document_height().await?;
                button
                    .click()
                    .await
                    .map_err(|e| AppError::BrowserError(format!("load-more click failed: {e}")))?;
                self.grew_since(before).await
            }
        }
    }

    async fn close(self) {
        if let Err(e) = self.page.close().await {
            tracing::debug!(error = %e, "Failed to close tab");
        }
    }
}
