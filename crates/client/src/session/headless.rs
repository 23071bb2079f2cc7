//! Local headless browser backend.
//!
//! Each session is a page in one shared chromiumoxide browser.

use super::{AutomationControl, NavigateResponse};
use async_trait::async_trait;
use bastion_core::Error;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfig};
use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct HeadlessAutomation {
    browser: Browser,
    pages: DashMap<String, Page>,
    next_id: AtomicU64,
    handler: JoinHandle<()>,
}

impl HeadlessAutomation {
    /// Launch a headless browser and drive its DevTools event stream in the
    /// background.
    pub async fn launch() -> Result<Self, Error> {
        let config = BrowserConfig::builder()
            .build()
            .map_err(|e| Error::InfraFault(format!("browser config: {e}")))?;
        let (browser, mut events) = Browser::launch(config)
            .await
            .map_err(|e| Error::InfraFault(format!("browser launch failed: {e}")))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let Err(e) = event {
                    tracing::debug!("browser handler event error: {e}");
                    break;
                }
            }
        });

        Ok(Self { browser, pages: DashMap::new(), next_id: AtomicU64::new(1), handler })
    }

    fn page(&self, session_id: &str) -> Result<Page, Error> {
        self.pages
            .get(session_id)
            .map(|p| p.value().clone())
            .ok_or_else(|| Error::InfraFault(format!("unknown headless session {session_id}")))
    }
}

impl Drop for HeadlessAutomation {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[async_trait]
impl AutomationControl for HeadlessAutomation {
    async fn create_session(&self) -> Result<String, Error> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::InfraFault(format!("new page: {e}")))?;
        let session_id = format!("headless-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pages.insert(session_id.clone(), page);
        Ok(session_id)
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), Error> {
        let Some((_, page)) = self.pages.remove(session_id) else {
            return Ok(());
        };
        page.close()
            .await
            .map_err(|e| Error::InfraFault(format!("close page {session_id}: {e}")))
    }

    async fn navigate(&self, session_id: &str, url: &str, timeout: Duration) -> Result<NavigateResponse, Error> {
        let page = self.page(session_id)?;

        let load = async {
            page.goto(url).await?;
            let html = page.content().await?;
            let final_url = page.url().await?;
            Ok::<_, chromiumoxide::error::CdpError>((html, final_url))
        };

        match tokio::time::timeout(timeout, load).await {
            Ok(Ok((html, final_url))) => Ok(NavigateResponse { html, status: None, url: final_url }),
            Ok(Err(e)) => Err(Error::UpstreamFetch(format!("navigate {url}: {e}"))),
            Err(_) => Err(Error::Timeout(format!("navigate {url} exceeded {}ms", timeout.as_millis()))),
        }
    }
}
