use anyhow::{Context, Result, anyhow, bail};
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::json;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const VIEWPORT: (u32, u32) = (1920, 1080);
const SCREENSHOT_QUALITY: u32 = 80;

/// One open tab. All calls block on the DevTools connection, so callers on
/// the async side go through `spawn_blocking`.
pub trait BrowserPage: Send + Sync {
    fn goto(&self, url: &str) -> Result<()>;
    fn click(&self, selector: &str) -> Result<()>;
    /// Focus the element and type `value` into it.
    fn type_text(&self, selector: &str, value: &str) -> Result<()>;
    /// Choose the `<option>` of a `<select>` whose value is `value`.
    fn select_option(&self, selector: &str, value: &str) -> Result<()>;
    /// Wait for any navigation started by the last action to finish.
    fn wait_for_settle(&self) -> Result<()>;
    fn body_html(&self) -> Result<String>;
    fn screenshot_jpeg(&self) -> Result<Vec<u8>>;
    fn close(&self) -> Result<()>;
}

/// A live browser process (or remote connection).
pub trait BrowserHandle: Send + Sync {
    fn is_connected(&self) -> bool;
    fn new_page(&self) -> Result<Arc<dyn BrowserPage>>;
    fn close(&self) -> Result<()>;
}

pub trait BrowserLauncher: Send + Sync {
    fn launch(&self) -> Result<Arc<dyn BrowserHandle>>;
}

#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// Attach to an already running Chrome at this DevTools URL instead of launching.
    pub connect_url: Option<String>,
    /// Extra settle time after navigation finishes, for client-side rendering.
    pub settle_delay: Duration,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: None,
            connect_url: None,
            settle_delay: Duration::from_millis(500),
        }
    }
}

pub struct ChromeLauncher {
    options: ChromeOptions,
}

impl ChromeLauncher {
    pub fn new(options: ChromeOptions) -> Self {
        Self { options }
    }
}

impl BrowserLauncher for ChromeLauncher {
    fn launch(&self) -> Result<Arc<dyn BrowserHandle>> {
        if let Some(url) = &self.options.connect_url {
            tracing::info!(%url, "attaching to existing Chrome");
            let browser = Browser::connect(url.clone())
                .with_context(|| format!("Failed to attach to Chrome at {url}"))?;
            return Ok(Arc::new(ChromeBrowser::new(browser, self.options.settle_delay)));
        }

        let options = LaunchOptions {
            headless: self.options.headless,
            path: self.options.chrome_path.clone(),
            window_size: Some(VIEWPORT),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
            ],
            // The session registry decides when to tear the browser down.
            idle_browser_timeout: Duration::from_secs(60 * 60),
            ..Default::default()
        };

        tracing::info!(headless = self.options.headless, "launching Chrome");
        let browser = Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {e}"))?;
        Ok(Arc::new(ChromeBrowser::new(browser, self.options.settle_delay)))
    }
}

pub struct ChromeBrowser {
    browser: Mutex<Option<Browser>>,
    settle_delay: Duration,
}

impl ChromeBrowser {
    fn new(browser: Browser, settle_delay: Duration) -> Self {
        Self {
            browser: Mutex::new(Some(browser)),
            settle_delay,
        }
    }
}

impl BrowserHandle for ChromeBrowser {
    fn is_connected(&self) -> bool {
        match self.browser.lock() {
            Ok(guard) => guard
                .as_ref()
                .is_some_and(|browser| browser.get_version().is_ok()),
            Err(_) => false,
        }
    }

    fn new_page(&self) -> Result<Arc<dyn BrowserPage>> {
        let guard = self
            .browser
            .lock()
            .map_err(|_| anyhow!("browser lock poisoned"))?;
        let browser = guard.as_ref().ok_or_else(|| anyhow!("browser is closed"))?;
        let tab = browser.new_tab().context("Failed to open a new tab")?;
        Ok(Arc::new(ChromePage {
            tab,
            settle_delay: self.settle_delay,
        }))
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .browser
            .lock()
            .map_err(|_| anyhow!("browser lock poisoned"))?;
        // Dropping the handle kills the launched process and its websocket.
        drop(guard.take());
        Ok(())
    }
}

pub struct ChromePage {
    tab: Arc<Tab>,
    settle_delay: Duration,
}

const SELECT_OPTION_JS: &str = r#"function (value) {
  if (this.tagName !== 'SELECT') { return 'not a select element'; }
  const option = [...this.options].find(o => o.value === value || o.text.trim() === value);
  if (!option) { return 'no option matching ' + JSON.stringify(value); }
  this.value = option.value;
  this.dispatchEvent(new Event('input', { bubbles: true }));
  this.dispatchEvent(new Event('change', { bubbles: true }));
  return '';
}"#;

impl BrowserPage for ChromePage {
    fn goto(&self, url: &str) -> Result<()> {
        self.tab
            .navigate_to(url)
            .with_context(|| format!("Failed to open URL: {url}"))?;
        self.tab
            .wait_until_navigated()
            .context("Navigation did not complete")?;
        Ok(())
    }

    fn click(&self, selector: &str) -> Result<()> {
        self.tab.find_element(selector)?.click()?;
        Ok(())
    }

    fn type_text(&self, selector: &str, value: &str) -> Result<()> {
        self.tab.find_element(selector)?.type_into(value)?;
        Ok(())
    }

    fn select_option(&self, selector: &str, value: &str) -> Result<()> {
        let element = self.tab.find_element(selector)?;
        let result = element.call_js_fn(SELECT_OPTION_JS, vec![json!(value)], false)?;
        match result.value.as_ref().and_then(|v| v.as_str()) {
            Some("") => Ok(()),
            Some(problem) => bail!("{problem}"),
            None => bail!("select returned no result"),
        }
    }

    fn wait_for_settle(&self) -> Result<()> {
        self.tab
            .wait_until_navigated()
            .context("Navigation did not complete")?;
        std::thread::sleep(self.settle_delay);
        Ok(())
    }

    fn body_html(&self) -> Result<String> {
        let result = self.tab.evaluate("document.body.innerHTML", false)?;
        Ok(result
            .value
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_default())
    }

    fn screenshot_jpeg(&self) -> Result<Vec<u8>> {
        self.tab.capture_screenshot(
            CaptureScreenshotFormatOption::Jpeg,
            Some(SCREENSHOT_QUALITY),
            None,
            true,
        )
    }

    fn close(&self) -> Result<()> {
        self.tab.close(true)?;
        Ok(())
    }
}
