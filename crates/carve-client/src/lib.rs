#[cfg(feature = "browser")]
pub mod browser;
pub mod fetcher;
pub mod notifier;

#[cfg(feature = "browser")]
pub use browser::{BrowserPage, BrowserPageSource};
pub use fetcher::ReqwestFetcher;
pub use notifier::ReqwestNotifier;
