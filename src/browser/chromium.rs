//! chromiumoxide-backed sessions.
//!
//! One browser process per `open_many` call, launched with the identity's
//! proxy, user agent, and window size. Every session is its own page.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::auth::Credentials;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide::page::Page;
use futures::StreamExt;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::browser::script;
use crate::config::BrowserSettings;
use crate::error::SessionError;
use crate::identity::{Cookie, Identity};
use crate::session::{Session, SessionFactory, WaitCondition};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Where cookies saved without a domain are scoped.
const COOKIE_FALLBACK_URL: &str = "https://www.ebay.com/";

fn browser_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::Browser(e.to_string())
}

fn cookie_param(cookie: &Cookie) -> CookieParam {
    let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
    param.domain = cookie.domain.clone();
    if param.domain.is_none() {
        param.url = Some(COOKIE_FALLBACK_URL.to_string());
    }
    param.path = cookie.path.clone();
    param.http_only = cookie.http_only;
    param.secure = cookie.secure;
    // Session cookies are saved with a negative expiry.
    param.expires = cookie
        .expires
        .filter(|expires| *expires > 0.0)
        .map(TimeSinceEpoch::new);
    param
}

// ── Browser process ─────────────────────────────────────────────────

/// A launched browser and its CDP event loop. Shared by the pages it
/// opened; the process goes away with the last of them.
struct BrowserProcess {
    browser: Browser,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        self.handler.abort();
        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!(
                path = %self.user_data_dir.display(),
                error = %e,
                "Failed to remove browser profile"
            );
        }
    }
}

/// Opens Chromium pages configured per identity.
#[derive(Debug, Clone, Default)]
pub struct ChromiumSessions {
    settings: BrowserSettings,
}

impl ChromiumSessions {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    async fn launch(&self, identity: &Identity) -> Result<Arc<BrowserProcess>, SessionError> {
        let user_data_dir =
            std::env::temp_dir().join(format!("harvester_chrome_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&user_data_dir)
            .map_err(|e| SessionError::Launch(format!("profile dir: {e}")))?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(REQUEST_TIMEOUT)
            .window_size(identity.viewport.width, identity.viewport.height)
            .user_data_dir(user_data_dir.clone())
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-notifications")
            .arg("--no-sandbox");
        if let Some(path) = &self.settings.executable {
            builder = builder.chrome_executable(path.clone());
        }
        if self.settings.headful {
            builder = builder.with_head();
        }
        if let Some(agent) = &identity.user_agent {
            builder = builder.arg(format!("--user-agent={agent}"));
        }
        if let Some(proxy) = &identity.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy.server));
        }
        let config = builder.build().map_err(SessionError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;
        let identity_id = identity.id.clone();
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(identity = %identity_id, error = ?e, "Browser handler error");
                }
            }
        });

        info!(identity = %identity.id, "Browser launched");
        Ok(Arc::new(BrowserProcess {
            browser,
            handler,
            user_data_dir,
        }))
    }

    async fn new_page(
        process: &Arc<BrowserProcess>,
        identity: &Identity,
    ) -> Result<ChromiumSession, SessionError> {
        let page = process
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        if let Some(proxy) = &identity.proxy
            && let (Some(username), Some(password)) = (&proxy.username, &proxy.password)
        {
            page.authenticate(Credentials {
                username: username.clone(),
                password: password.expose_secret().to_string(),
            })
            .await
            .map_err(|e| SessionError::Launch(format!("proxy auth: {e}")))?;
        }

        let mut session = ChromiumSession {
            page: Some(page),
            _process: Arc::clone(process),
            mark: None,
        };
        if !identity.cookies.is_empty() {
            session.set_cookies(&identity.cookies).await?;
        }
        Ok(session)
    }
}

#[async_trait]
impl SessionFactory for ChromiumSessions {
    async fn open(&self, identity: &Identity) -> Result<Box<dyn Session>, SessionError> {
        let process = self.launch(identity).await?;
        Ok(Box::new(Self::new_page(&process, identity).await?))
    }

    async fn open_many(
        &self,
        identity: &Identity,
        count: usize,
    ) -> Result<Vec<Box<dyn Session>>, SessionError> {
        let process = self.launch(identity).await?;
        let mut sessions: Vec<Box<dyn Session>> = Vec::with_capacity(count);
        for _ in 0..count {
            match Self::new_page(&process, identity).await {
                Ok(session) => sessions.push(Box::new(session)),
                Err(e) => {
                    error!(identity = %identity.id, error = %e, "Failed to open page");
                    crate::session::close_all(&mut sessions).await;
                    return Err(e);
                }
            }
        }
        Ok(sessions)
    }
}

// ── Session ─────────────────────────────────────────────────────────

struct ChromiumSession {
    page: Option<Page>,
    _process: Arc<BrowserProcess>,
    /// URL before the last click or key press, for `wait_for_navigation`.
    mark: Option<String>,
}

impl ChromiumSession {
    fn page(&self) -> Result<&Page, SessionError> {
        self.page
            .as_ref()
            .ok_or_else(|| SessionError::Browser("session is closed".into()))
    }

    async fn eval<T: DeserializeOwned>(&self, js: String) -> Result<T, SessionError> {
        self.page()?
            .evaluate(js)
            .await
            .map_err(browser_err)?
            .into_value::<T>()
            .map_err(browser_err)
    }

    async fn url(&self) -> Result<String, SessionError> {
        Ok(self.page()?.url().await.map_err(browser_err)?.unwrap_or_default())
    }

    async fn mark(&mut self) {
        self.mark = self.url().await.ok();
    }

    async fn bounded<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T, SessionError>
    where
        F: std::future::Future<Output = Result<T, SessionError>>,
    {
        tokio::time::timeout(timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(SessionError::Timeout {
                    operation: operation.to_string(),
                    after: timeout,
                })
            })
    }

    /// Resolves once the URL moves off `before` and the new page has loaded.
    async fn url_change(&self, before: &str) -> Result<(), SessionError> {
        while self.url().await? == before {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.page()?
            .wait_for_navigation()
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Navigation(e.to_string()))
    }

    async fn appearance(&self, selector: &str) {
        while !self.eval::<bool>(script::exists(selector)).await.unwrap_or(false) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn navigation_start(&mut self) -> Result<String, SessionError> {
        match self.mark.take() {
            Some(url) => Ok(url),
            None => self.url().await,
        }
    }

    async fn load(&self, url: &str, wait: WaitCondition) -> Result<(), SessionError> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| SessionError::Navigation(e.to_string()))?;
        if wait == WaitCondition::NetworkIdle {
            page.wait_for_navigation()
                .await
                .map_err(|e| SessionError::Navigation(e.to_string()))?;
        }
        match self.eval::<Option<u16>>(script::response_status()).await {
            Ok(Some(status)) if status >= 400 => Err(SessionError::HttpStatus(status)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Session for ChromiumSession {
    async fn navigate(
        &mut self,
        url: &str,
        wait: WaitCondition,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        Self::bounded("navigate", timeout, self.load(url, wait)).await
    }

    async fn reload(&mut self, wait: WaitCondition, timeout: Duration) -> Result<(), SessionError> {
        let url = self.url().await?;
        Self::bounded("reload", timeout, self.load(&url, wait)).await
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.wait_for_any(&[selector], timeout).await.map(|_| ())
    }

    async fn wait_for_any(
        &mut self,
        selectors: &[&str],
        timeout: Duration,
    ) -> Result<usize, SessionError> {
        let start = Instant::now();
        loop {
            for (index, selector) in selectors.iter().enumerate() {
                if self.eval::<bool>(script::exists(selector)).await.unwrap_or(false) {
                    return Ok(index);
                }
            }
            if start.elapsed() >= timeout {
                return Err(SessionError::Timeout {
                    operation: format!("wait for {}", selectors.join(" | ")),
                    after: timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_navigation(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let before = self.navigation_start().await?;
        Self::bounded("navigation", timeout, self.url_change(&before)).await
    }

    async fn wait_for_navigation_or(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, SessionError> {
        let before = self.navigation_start().await?;
        let this = &*self;
        let race = async {
            tokio::select! {
                moved = this.url_change(&before) => moved.map(|()| false),
                () = this.appearance(selector) => Ok(true),
            }
        };
        Self::bounded(&format!("navigation or {selector}"), timeout, race).await
    }

    async fn click(&mut self, selector: &str) -> Result<(), SessionError> {
        self.mark().await;
        if self.eval::<bool>(script::click(selector)).await? {
            Ok(())
        } else {
            Err(SessionError::SelectorNotFound(selector.to_string()))
        }
    }

    async fn type_text(&mut self, selector: &str, text: &str) -> Result<(), SessionError> {
        if !self.eval::<bool>(script::clear(selector)).await? {
            return Err(SessionError::SelectorNotFound(selector.to_string()));
        }
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|_| SessionError::SelectorNotFound(selector.to_string()))?;
        element.click().await.map_err(browser_err)?;
        element.type_str(text).await.map_err(browser_err)?;
        Ok(())
    }

    async fn press_enter(&mut self, selector: &str) -> Result<(), SessionError> {
        self.mark().await;
        let element = self
            .page()?
            .find_element(selector)
            .await
            .map_err(|_| SessionError::SelectorNotFound(selector.to_string()))?;
        element.press_key("Enter").await.map_err(browser_err)?;
        Ok(())
    }

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, SessionError> {
        self.eval(script::read_text(selector)).await
    }

    async fn read_attributes(
        &mut self,
        selector: &str,
        attribute: &str,
    ) -> Result<Vec<String>, SessionError> {
        self.eval(script::read_attributes(selector, attribute)).await
    }

    async fn read_fields(
        &mut self,
        container: &str,
        parts: &[&str],
    ) -> Result<Vec<Vec<String>>, SessionError> {
        self.eval(script::read_fields(container, parts)).await
    }

    async fn attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<Option<String>>, SessionError> {
        let found: Option<Vec<Option<String>>> =
            self.eval(script::attribute(selector, name)).await?;
        Ok(found.map(|values| values.into_iter().next().flatten()))
    }

    async fn current_url(&mut self) -> Result<String, SessionError> {
        self.url().await
    }

    async fn cookies(&mut self) -> Result<Vec<Cookie>, SessionError> {
        let cookies = self.page()?.get_cookies().await.map_err(browser_err)?;
        Ok(cookies
            .into_iter()
            .map(|c| Cookie {
                name: c.name,
                value: c.value,
                domain: Some(c.domain),
                path: Some(c.path),
                expires: Some(c.expires),
                http_only: Some(c.http_only),
                secure: Some(c.secure),
            })
            .collect())
    }

    async fn set_cookies(&mut self, cookies: &[Cookie]) -> Result<(), SessionError> {
        let params: Vec<CookieParam> = cookies.iter().map(cookie_param).collect();
        self.page()?.set_cookies(params).await.map_err(browser_err)?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if let Some(page) = self.page.take()
            && let Err(e) = page.close().await
        {
            warn!(error = %e, "Failed to close page");
        }
        Ok(())
    }
}
