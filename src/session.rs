use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

const LOGIN_URL: &str = "https://www.superdelivery.com/p/do/clickMemberLogin";

/// Cookie shape persisted in the authentication artifact. Expiry is dropped:
/// the artifact is written and consumed within a single run.
#[derive(Debug, Serialize, Deserialize)]
struct StoredCookie {
    name: String,
    value: String,
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
}

/// One authenticated browsing session: browser process, CDP handler task and
/// a single reused page. Consuming `close` makes double-close unrepresentable.
pub struct SessionDriver {
    browser: Browser,
    handler_task: JoinHandle<()>,
    page: Page,
}

impl SessionDriver {
    /// Launch a browser and open the session page, restoring cookies from the
    /// authentication artifact when one is given. Launch failure is fatal for
    /// the whole run; the caller aborts.
    pub async fn open(auth_state: Option<&Path>, headless: bool) -> Result<Self> {
        info!("Initializing browser");

        let mut config = BrowserConfig::builder();
        if !headless {
            config = config.with_head();
        }
        config = config
            .window_size(1920, 1080)
            .viewport(None)
            .arg("--disable-blink-features=AutomationControlled");

        let browser_config = config
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build browser config: {}", e))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    error!("Browser handler error: {:?}", e);
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open session page")?;

        let stealth = AddScriptToEvaluateOnNewDocumentParams::builder()
            .source("Object.defineProperty(navigator, 'webdriver', {get: () => false});")
            .build()
            .map_err(|e| anyhow::anyhow!("invalid init script: {}", e))?;
        page.execute(stealth)
            .await
            .context("Failed to install init script")?;

        let driver = Self {
            browser,
            handler_task,
            page,
        };

        if let Some(path) = auth_state {
            if path.exists() {
                info!("Restoring auth state from {}", path.display());
                if let Err(e) = driver.restore_auth(path).await {
                    driver.close().await;
                    return Err(e);
                }
            }
        }

        Ok(driver)
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Run the login flow. Succeeds iff the post-navigation URL no longer
    /// contains the login-path marker. Errors are reported as failure, never
    /// propagated.
    pub async fn login(&self, user_id: &str, password: &str) -> bool {
        match self.try_login(user_id, password).await {
            Ok(ok) => ok,
            Err(e) => {
                error!("An error occurred during login: {:#}", e);
                false
            }
        }
    }

    async fn try_login(&self, user_id: &str, password: &str) -> Result<bool> {
        info!("Attempting login");
        self.page.goto(LOGIN_URL).await?;

        let id_field = self.page.find_element("input[name='identification']").await?;
        id_field.click().await?;
        id_field.type_str(user_id).await?;

        let pw_field = self.page.find_element("input[name='password']").await?;
        pw_field.click().await?;
        pw_field.type_str(password).await?;

        self.page
            .evaluate(
                r#"
                (() => {
                    const controls = Array.from(document.querySelectorAll('button, input[type="submit"]'));
                    const btn = controls.find(el => ((el.innerText || el.value) || '').includes('ログイン'));
                    if (btn) btn.click();
                })()
                "#,
            )
            .await?;

        self.page.wait_for_navigation().await?;

        let url = self.page.url().await?.unwrap_or_default();
        Ok(!url.contains("login"))
    }

    /// Serialize the session cookies to the artifact path. Written to a temp
    /// file first and renamed so workers never observe a partial artifact.
    pub async fn persist_auth(&self, path: &Path) -> Result<()> {
        let cookies = self.page.get_cookies().await?;
        let stored: Vec<StoredCookie> = cookies
            .into_iter()
            .map(|c| StoredCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
                secure: c.secure,
                http_only: c.http_only,
            })
            .collect();

        let json = serde_json::to_string_pretty(&stored)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("failed to write auth state to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to move auth state into {}", path.display()))?;
        info!("Auth state saved to {}", path.display());
        Ok(())
    }

    async fn restore_auth(&self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read auth state {}", path.display()))?;
        let stored: Vec<StoredCookie> =
            serde_json::from_str(&raw).context("auth state is not valid JSON")?;

        let mut params = Vec::with_capacity(stored.len());
        for c in stored {
            let param = CookieParam::builder()
                .name(c.name)
                .value(c.value)
                .domain(c.domain)
                .path(c.path)
                .secure(c.secure)
                .http_only(c.http_only)
                .build()
                .map_err(|e| anyhow::anyhow!("invalid stored cookie: {}", e))?;
            params.push(param);
        }

        self.page.set_cookies(params).await?;
        Ok(())
    }

    /// Release the browser and its handler task. Never fails; close errors
    /// are logged and the process moves on.
    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {:?}", e);
        }
        self.handler_task.abort();
    }
}

/// Poll for a selector until it appears or the timeout elapses. chromiumoxide
/// has no built-in element wait, so this stands in for one.
pub async fn wait_for_selector(page: &Page, selector: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if page.find_element(selector).await.is_ok() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
