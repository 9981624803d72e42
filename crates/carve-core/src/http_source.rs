//! Plain-HTTP page acquisition.
//!
//! Each page is one fetch. There is no script execution, so navigation
//! actions are unavailable and only link-following pagination works:
//! `next_button` follows the button's `href`, `page_number` rewrites the
//! query string. `infinite_scroll` and `load_more` end after the first page.

use crate::error::AppError;
use crate::models::Mode;
use crate::pagination::{find_next_link, page_number_url};
use crate::schema::{NavigationStep, PaginationKind, PaginationRule};
use crate::traits::{FetchRequest, Fetcher, PageHandle, PageSource};

#[derive(Clone)]
pub struct HttpPageSource<F: Fetcher> {
    fetcher: F,
}

impl<F: Fetcher> HttpPageSource<F> {
    pub fn new(fetcher: F) -> Self {
        Self { fetcher }
    }
}

impl<F: Fetcher> PageSource for HttpPageSource<F> {
    type Page = HttpPage<F>;

    fn mode(&self) -> Mode {
        Mode::Http
    }

    async fn acquire(&self, request: &FetchRequest) -> Result<HttpPage<F>, AppError> {
        let html = self.fetcher.fetch(request).await?;
        Ok(HttpPage {
            fetcher: self.fetcher.clone(),
            request: request.clone(),
            current_url: request.url.clone(),
            html,
        })
    }
}

pub struct HttpPage<F: Fetcher> {
    fetcher: F,
    /// The first page's request; later pages reuse its overrides.
    request: FetchRequest,
    current_url: String,
    html: String,
}

impl<F: Fetcher> PageHandle for HttpPage<F> {
    fn current_url(&self) -> &str {
        &self.current_url
    }

    async fn content(&mut self) -> Result<String, AppError> {
        Ok(self.html.clone())
    }

    async fn perform(&mut self, step: &NavigationStep) -> Result<(), AppError> {
        Err(AppError::BrowserError(format!(
            "'{}' needs a rendered page; run the task in browser mode",
            step.action.as_str()
        )))
    }

    async fn advance(&mut self, rule: &PaginationRule, next_page: u32) -> Result<bool, AppError> {
        let next_url = match rule.kind {
            PaginationKind::NextButton => {
                let Some(selector) = rule.selector.as_deref() else {
                    return Ok(false);
                };
                match find_next_link(&self.html, selector, &self.current_url)? {
                    Some(url) => url,
                    None => return Ok(false),
                }
            }
            PaginationKind::PageNumber => page_number_url(&self.request.url, rule, next_page)?,
            PaginationKind::InfiniteScroll | PaginationKind::LoadMore => {
                tracing::debug!(url = %self.current_url, kind = ?rule.kind, "No next page over plain HTTP");
                return Ok(false);
            }
        };
        if next_url == self.current_url {
            return Ok(false);
        }

        self.html = self.fetcher.fetch(&self.request.with_url(next_url.as_str())).await?;
        self.current_url = next_url;
        Ok(true)
    }

    async fn close(self) {}
}
