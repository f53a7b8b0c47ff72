//! `BrowserDriver` implementation backed by `headless_chrome`.
//!
//! One Chrome process hosts every context as an isolated CDP BrowserContext
//! (separate cookies/storage, incognito-style). Blocking CDP calls run in
//! `spawn_blocking` so scrapes do not stall the runtime.
//!
//! Proxy handling follows Chrome's constraints: credentials never go into
//! `--proxy-server`; they are applied per tab through the Fetch
//! authentication API. A per-context proxy *server* cannot be changed inside
//! a running Chrome process, so the first context proxy seen at launch time
//! should match the process-level configuration.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use headless_chrome::protocol::cdp::Network;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use scraper_pool_common::{BrowserConfig, ProxyEndpoint, ScrapeRequest, WaitFor};

use crate::driver::{BrowserDriver, ContextSpec, DriverError, DriverHandle, PageResult};

/// Keep the CDP WebSocket alive through long idle stretches; the pool owns
/// restart decisions, not the transport.
const IDLE_BROWSER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Poll interval for readiness and network-idle JS polling.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// URL patterns dropped when a request asks for resource blocking.
const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.css", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.mp4", "*.webm",
];

/// Error substrings that mean the browser process (or its CDP connection)
/// is gone, as opposed to an ordinary navigation failure.
const DEAD_BROWSER_PATTERNS: &[&str] = &[
    "connection is closed",
    "No such process",
    "Unable to make method calls",
    "websocket",
];

struct ChromeContext {
    tab: Arc<Tab>,
    storage_path: Option<PathBuf>,
}

struct DriverState {
    browser: Option<Browser>,
    display: Option<Child>,
    contexts: HashMap<u64, ChromeContext>,
    next_handle: u64,
}

pub struct ChromeDriver {
    config: BrowserConfig,
    state: Mutex<DriverState>,
}

impl ChromeDriver {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DriverState {
                browser: None,
                display: None,
                contexts: HashMap::new(),
                next_handle: 1,
            }),
        }
    }

    fn classify(msg: String) -> DriverError {
        if DEAD_BROWSER_PATTERNS
            .iter()
            .any(|p| msg.to_lowercase().contains(&p.to_lowercase()))
        {
            DriverError::TargetClosed(msg)
        } else {
            DriverError::Failed(msg)
        }
    }

    fn spawn_display(config: &BrowserConfig) -> Option<Child> {
        let (width, height) = config.virtual_display_size;
        let screen = format!("{width}x{height}x24");

        match Command::new("Xvfb")
            .args([":99", "-screen", "0", screen.as_str()])
            .spawn()
        {
            Ok(child) => {
                std::env::set_var("DISPLAY", ":99");
                info!("started virtual display :99 ({screen})");
                Some(child)
            }
            Err(e) => {
                warn!("failed to start Xvfb, continuing without virtual display: {e}");
                None
            }
        }
    }

    fn launch_browser(config: &BrowserConfig) -> Result<Browser, DriverError> {
        let chrome_args: Vec<&OsStr> = vec![
            OsStr::new("--no-sandbox"),
            OsStr::new("--disable-dev-shm-usage"),
            OsStr::new("--disable-gpu"),
        ];

        let mut builder = LaunchOptions::default_builder();
        builder
            .headless(config.headless)
            .idle_browser_timeout(IDLE_BROWSER_TIMEOUT)
            .args(chrome_args);

        if let Some(path) = &config.browser_path {
            builder.path(Some(path.clone()));
        }

        let options = builder
            .build()
            .map_err(|e| DriverError::failed(format!("invalid launch options: {e}")))?;

        Browser::new(options).map_err(|e| DriverError::failed(format!("browser launch failed: {e}")))
    }

    /// Apply proxy credentials to a tab via the Fetch API.
    fn apply_proxy_auth(tab: &Arc<Tab>, proxy: &str) -> Result<(), DriverError> {
        let endpoint = ProxyEndpoint::parse(proxy)
            .map_err(|e| DriverError::failed(format!("bad proxy url: {e}")))?;

        if let Some((username, password)) = endpoint.credentials() {
            tab.enable_fetch(None, Some(true))
                .map_err(|e| Self::classify(format!("enable_fetch failed: {e}")))?;
            tab.authenticate(Some(username.to_string()), Some(password.to_string()))
                .map_err(|e| Self::classify(format!("proxy authentication failed: {e}")))?;
            debug!(server = %endpoint.server, "proxy credentials installed on tab");
        }

        Ok(())
    }

    fn set_blocked_urls(tab: &Arc<Tab>) {
        let enable = Network::Enable {
            max_total_buffer_size: None,
            max_resource_buffer_size: None,
            max_post_data_size: None,
            enable_durable_messages: None,
            report_direct_socket_traffic: None,
        };
        if let Err(e) = tab.call_method(enable) {
            warn!("failed to enable network domain for resource blocking: {e}");
            return;
        }

        let blocked = Network::SetBlockedURLs {
            urls: BLOCKED_RESOURCE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        };
        if let Err(e) = tab.call_method(blocked) {
            warn!("failed to install resource block list: {e}");
        }
    }

    /// Restore cookies captured by an earlier incarnation of this context.
    fn restore_cookies(tab: &Arc<Tab>, storage_path: &Path) {
        let state_file = storage_path.join("state.json");
        let Ok(bytes) = fs::read(&state_file) else { return };

        match serde_json::from_slice::<Vec<Network::CookieParam>>(&bytes) {
            Ok(cookies) if !cookies.is_empty() => {
                let count = cookies.len();
                if let Err(e) = tab.set_cookies(cookies) {
                    warn!("failed to restore cookies from {}: {e}", state_file.display());
                } else {
                    debug!(count, "restored cookies from {}", state_file.display());
                }
            }
            Ok(_) => {}
            Err(e) => warn!("unreadable cookie state {}: {e}", state_file.display()),
        }
    }

    /// Snapshot cookies to the context's storage directory.
    fn save_cookies(tab: &Arc<Tab>, storage_path: &Path) {
        let cookies = match tab.get_cookies() {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!("failed to read cookies for persistence: {e}");
                return;
            }
        };

        // Cookie and CookieParam share their wire representation, so a JSON
        // round-trip is the conversion.
        let value = match serde_json::to_value(&cookies) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to serialize cookies: {e}");
                return;
            }
        };

        let state_file = storage_path.join("state.json");
        if let Err(e) = fs::create_dir_all(storage_path)
            .and_then(|_| fs::write(&state_file, value.to_string()))
        {
            warn!("failed to write cookie state {}: {e}", state_file.display());
        }
    }

    async fn tab_for(&self, handle: DriverHandle) -> Result<(Arc<Tab>, Option<PathBuf>), DriverError> {
        let state = self.state.lock().await;
        if state.browser.is_none() {
            return Err(DriverError::target_closed("browser is not running"));
        }
        state
            .contexts
            .get(&handle.0)
            .map(|c| (c.tab.clone(), c.storage_path.clone()))
            .ok_or_else(|| DriverError::target_closed(format!("unknown context handle {}", handle.0)))
    }

    /// Wait for the page to reach the requested lifecycle point.
    fn wait_for_navigation(
        tab: &Arc<Tab>,
        wait_for: WaitFor,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        match wait_for {
            WaitFor::Load => {
                tab.wait_until_navigated()
                    .map_err(|e| Self::classify(format!("navigation wait failed: {e}")))?;
            }
            WaitFor::Domcontentloaded => {
                Self::poll_js(
                    tab,
                    "document.readyState === 'interactive' || document.readyState === 'complete'",
                    timeout,
                )?;
            }
            WaitFor::Networkidle => {
                tab.wait_until_navigated()
                    .map_err(|e| Self::classify(format!("navigation wait failed: {e}")))?;
                Self::wait_network_idle(tab, timeout)?;
            }
        }
        Ok(())
    }

    /// Poll a boolean JS expression until it holds or the timeout elapses.
    fn poll_js(tab: &Arc<Tab>, expr: &str, timeout: Duration) -> Result<(), DriverError> {
        let start = std::time::Instant::now();
        loop {
            let done = tab
                .evaluate(expr, false)
                .ok()
                .and_then(|r| r.value)
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if done {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(DriverError::failed(format!(
                    "timed out waiting for page readiness after {}ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Consider the network idle once the resource entry count stops growing
    /// across two consecutive polls.
    fn wait_network_idle(tab: &Arc<Tab>, timeout: Duration) -> Result<(), DriverError> {
        let start = std::time::Instant::now();
        let mut last_count: Option<u64> = None;
        let mut stable_polls = 0u32;

        while start.elapsed() < timeout {
            let count = tab
                .evaluate("performance.getEntriesByType('resource').length", false)
                .ok()
                .and_then(|r| r.value)
                .and_then(|v| v.as_u64());

            if count.is_some() && count == last_count {
                stable_polls += 1;
                if stable_polls >= 2 {
                    return Ok(());
                }
            } else {
                stable_polls = 0;
                last_count = count;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        // Idle never settled; the page is still usable, so proceed.
        debug!("network never settled within {}ms; proceeding", timeout.as_millis());
        Ok(())
    }

    fn navigation_status(tab: &Arc<Tab>) -> Option<u16> {
        let status = tab
            .evaluate(
                "performance.getEntriesByType('navigation')[0]?.responseStatus || 0",
                false,
            )
            .ok()?
            .value?
            .as_u64()?;
        (status > 0).then_some(status as u16)
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn launch(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;

        if state.display.is_none() && self.config.use_virtual_display && !self.config.headless {
            state.display = Self::spawn_display(&self.config);
        }

        let config = self.config.clone();
        let browser = tokio::task::spawn_blocking(move || Self::launch_browser(&config))
            .await
            .map_err(|e| DriverError::failed(format!("launch task failed: {e}")))??;

        info!(headless = self.config.headless, "browser process launched");
        state.contexts.clear();
        state.browser = Some(browser);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;

        for (_, ctx) in state.contexts.drain() {
            if let Some(storage) = &ctx.storage_path {
                Self::save_cookies(&ctx.tab, storage);
            }
            let _ = ctx.tab.close(false);
        }

        // Dropping the Browser tears the Chrome process down.
        state.browser = None;

        if let Some(mut display) = state.display.take() {
            let _ = display.kill();
        }

        info!("browser process shut down");
        Ok(())
    }

    async fn new_context(&self, spec: &ContextSpec) -> Result<DriverHandle, DriverError> {
        let mut state = self.state.lock().await;

        // The CDP context wrapper borrows the browser; only the tab outlives
        // this block. Chrome keeps the isolated context alive with its tab.
        let tab = {
            let browser = state
                .browser
                .as_ref()
                .ok_or_else(|| DriverError::target_closed("browser is not running"))?;
            let cdp_context = browser
                .new_context()
                .map_err(|e| Self::classify(format!("failed to create browser context: {e}")))?;
            cdp_context
                .new_tab()
                .map_err(|e| Self::classify(format!("failed to create tab: {e}")))?
        };

        if let Some(proxy) = &spec.proxy {
            Self::apply_proxy_auth(&tab, proxy)?;
        }

        if let Some(storage) = &spec.storage_path {
            Self::restore_cookies(&tab, storage);
        }

        let handle = DriverHandle(state.next_handle);
        state.next_handle += 1;
        state.contexts.insert(
            handle.0,
            ChromeContext {
                tab,
                storage_path: spec.storage_path.clone(),
            },
        );

        debug!(context_id = %spec.id, handle = handle.0, "created browser context");
        Ok(handle)
    }

    async fn close_context(&self, handle: DriverHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        let Some(ctx) = state.contexts.remove(&handle.0) else {
            return Ok(());
        };

        if let Some(storage) = &ctx.storage_path {
            Self::save_cookies(&ctx.tab, storage);
        }

        // Chrome disposes the CDP BrowserContext once its last tab closes.
        let _ = ctx.tab.close(false);
        debug!(handle = handle.0, "closed browser context");
        Ok(())
    }

    async fn execute(
        &self,
        handle: DriverHandle,
        request: &ScrapeRequest,
    ) -> Result<PageResult, DriverError> {
        let (tab, storage_path) = self.tab_for(handle).await?;

        let url = request.url.clone();
        let wait_for = request.wait_for;
        let timeout = request.timeout();
        let get_content = request.get_content;
        let script = request.script.clone();
        let screenshot = request.screenshot;
        let block_resources = request.block_resources;

        let worker_tab = tab.clone();
        let page = tokio::task::spawn_blocking(move || -> Result<PageResult, DriverError> {
            if block_resources {
                Self::set_blocked_urls(&worker_tab);
            }

            worker_tab
                .navigate_to(&url)
                .map_err(|e| Self::classify(format!("navigation failed: {e}")))?;
            Self::wait_for_navigation(&worker_tab, wait_for, timeout)?;

            let status = Self::navigation_status(&worker_tab);
            let final_url = worker_tab.get_url();

            let content = if get_content {
                Some(
                    worker_tab
                        .get_content()
                        .map_err(|e| Self::classify(format!("content retrieval failed: {e}")))?,
                )
            } else {
                None
            };

            // Script failures do not fail the scrape; the result is just
            // absent.
            let script_result = script.and_then(|code| match worker_tab.evaluate(&code, true) {
                Ok(result) => result.value,
                Err(e) => {
                    warn!("script evaluation failed: {e}");
                    None
                }
            });

            let screenshot = if screenshot {
                let bytes = worker_tab
                    .capture_screenshot(
                        Page::CaptureScreenshotFormatOption::Png,
                        None,
                        None,
                        true,
                    )
                    .map_err(|e| Self::classify(format!("screenshot failed: {e}")))?;
                Some(base64::engine::general_purpose::STANDARD.encode(bytes))
            } else {
                None
            };

            Ok(PageResult {
                url: final_url,
                status,
                content,
                script_result,
                screenshot,
            })
        })
        .await
        .map_err(|e| DriverError::failed(format!("scrape task failed: {e}")))??;

        if let Some(storage) = &storage_path {
            Self::save_cookies(&tab, storage);
        }

        Ok(page)
    }
}
