use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::FetcherConfig;
use crate::utils::error::{AppError, Result};

/// Page-fetch collaborator: URL in, rendered page content out. The rest of
/// the pipeline does not care how the content was produced.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Fetcher backed by a small pool of headless Chrome instances, handed out
/// round-robin. Script-generated prices need a real renderer.
pub struct BrowserFetcher {
    browsers: Vec<Arc<Browser>>,
    next: AtomicUsize,
    config: FetcherConfig,
}

impl BrowserFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        let mut browsers = Vec::new();

        // Pool size is validated to 1..=3 at config load.
        for _ in 0..config.browser_pool_size {
            let mut launch_options = LaunchOptions::default_builder()
                .headless(true)
                .sandbox(false) // Often needed in containerized environments
                .args(vec![
                    std::ffi::OsStr::new("--no-sandbox"),
                    std::ffi::OsStr::new("--disable-dev-shm-usage"),
                    std::ffi::OsStr::new("--disable-gpu"),
                    std::ffi::OsStr::new("--disable-extensions"),
                ])
                .build()
                .map_err(|e| AppError::Fetch(format!("failed to create launch options: {}", e)))?;

            if let Some(chrome_path) = &config.chrome_path {
                launch_options.path = Some(std::path::PathBuf::from(chrome_path));
            }

            let browser = Browser::new(launch_options)
                .map_err(|e| AppError::Fetch(format!("failed to launch browser: {}", e)))?;

            browsers.push(Arc::new(browser));
        }

        Ok(Self {
            browsers,
            next: AtomicUsize::new(0),
            config,
        })
    }

    fn get_browser(&self) -> Arc<Browser> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.browsers.len();
        self.browsers[index].clone()
    }

    fn fetch_blocking(browser: Arc<Browser>, url: String, user_agent: String) -> Result<String> {
        let tab = browser
            .new_tab()
            .map_err(|e| AppError::Fetch(format!("failed to create tab: {}", e)))?;

        tab.set_user_agent(&user_agent, None, None)
            .map_err(|e| AppError::Fetch(format!("failed to set user agent: {}", e)))?;

        tab.navigate_to(&url)
            .map_err(|e| AppError::Fetch(format!("navigation failed: {}", e)))?;

        tab.wait_until_navigated()
            .map_err(|e| AppError::Fetch(format!("page load failed: {}", e)))?;

        let content = tab
            .get_content()
            .map_err(|e| AppError::Fetch(format!("failed to get page content: {}", e)));

        // Close tab to free resources
        let _ = tab.close(true);

        content
    }
}

#[async_trait]
impl PageFetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let browser = self.get_browser();
        let url_owned = url.to_string();
        let user_agent = self.config.user_agent.clone();
        let timeout = Duration::from_secs(self.config.request_timeout);

        let handle = tokio::task::spawn_blocking(move || {
            Self::fetch_blocking(browser, url_owned, user_agent)
        });

        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => {
                joined.map_err(|e| AppError::Fetch(format!("fetch task panicked: {}", e)))?
            }
            Err(_) => Err(AppError::Fetch(format!(
                "timed out after {}s fetching {}",
                self.config.request_timeout, url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> FetcherConfig {
        FetcherConfig {
            browser_pool_size: 2,
            request_timeout: 10,
            user_agent: "TestAgent/1.0".to_string(),
            chrome_path: None,
        }
    }

    #[test]
    fn test_fetcher_creation() {
        // Chrome is not available in most CI environments; either outcome
        // is acceptable, the error just has to be the typed fetch error.
        match BrowserFetcher::new(test_config()) {
            Ok(fetcher) => assert_eq!(fetcher.browsers.len(), 2),
            Err(e) => assert!(matches!(e, AppError::Fetch(_))),
        }
    }

    #[tokio::test]
    async fn test_mock_fetcher() {
        let mut mock = MockPageFetcher::new();
        mock.expect_fetch()
            .returning(|_| Ok("<html><body>$9.99</body></html>".to_string()));

        let content = mock.fetch("https://example.com").await.unwrap();
        assert!(content.contains("$9.99"));
    }
}
