//! Long-lived browser sessions, addressed by a logical name.
//!
//! A session is reused across requests while its connection is alive. After
//! each request a keep-alive tick is armed (unless one is already running);
//! every tick adds to the idle counter and the browser is closed once the
//! counter reaches the ceiling. Any request resets the counter.

use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::hands::{BrowserHandle, BrowserLauncher};

pub const DEFAULT_SESSION_KEY: &str = "browser";
pub const KEEP_ALIVE_CEILING: Duration = Duration::from_secs(180);
pub const KEEP_ALIVE_TICK: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub ceiling: Duration,
    pub tick: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            ceiling: KEEP_ALIVE_CEILING,
            tick: KEEP_ALIVE_TICK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Rearm,
    Expire,
}

/// Idle-time bookkeeping, advanced one tick at a time.
#[derive(Debug, Clone)]
pub struct IdleClock {
    idle: Duration,
    reset_at: Instant,
    keep_alive: KeepAlive,
}

impl IdleClock {
    pub fn new(keep_alive: KeepAlive) -> Self {
        Self {
            idle: Duration::ZERO,
            reset_at: Instant::now(),
            keep_alive,
        }
    }

    pub fn reset(&mut self) {
        self.idle = Duration::ZERO;
        self.reset_at = Instant::now();
    }

    /// Whether the clock was reset after `instant`.
    pub fn reset_since(&self, instant: Instant) -> bool {
        self.reset_at > instant
    }

    pub fn tick(&mut self) -> TickOutcome {
        self.idle += self.keep_alive.tick;
        if self.idle < self.keep_alive.ceiling {
            TickOutcome::Rearm
        } else {
            TickOutcome::Expire
        }
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Closing,
}

struct SessionInner {
    browser: Option<Arc<dyn BrowserHandle>>,
    state: SessionState,
    idle: IdleClock,
    ticker: Option<JoinHandle<()>>,
}

type Slot = Arc<AsyncMutex<SessionInner>>;

/// Exclusive hold on a session for the duration of one request.
pub struct SessionLease {
    name: String,
    slot: Slot,
    guard: OwnedMutexGuard<SessionInner>,
}

impl SessionLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn browser(&self) -> Result<Arc<dyn BrowserHandle>> {
        self.guard
            .browser
            .clone()
            .ok_or_else(|| anyhow!("session '{}' has no browser", self.name))
    }
}

pub struct SessionRegistry {
    launcher: Arc<dyn BrowserLauncher>,
    keep_alive: KeepAlive,
    sessions: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, keep_alive: KeepAlive) -> Self {
        Self {
            launcher,
            keep_alive,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, name: &str) -> Slot {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        sessions
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(SessionInner {
                    browser: None,
                    state: SessionState::Disconnected,
                    idle: IdleClock::new(self.keep_alive),
                    ticker: None,
                }))
            })
            .clone()
    }

    /// Wait for exclusive use of the session `name`, launching a browser if
    /// there is no live one. A failed launch is returned as an error; the
    /// session stays disconnected.
    pub async fn acquire(&self, name: &str) -> Result<SessionLease> {
        let slot = self.slot(name);
        let mut guard = slot.clone().lock_owned().await;
        guard.idle.reset();

        let live = match guard.browser.clone() {
            Some(browser) => tokio::task::spawn_blocking(move || browser.is_connected())
                .await
                .unwrap_or(false),
            None => false,
        };

        if !live {
            if let Some(stale) = guard.browser.take() {
                tracing::info!(session = name, "browser connection is dead, relaunching");
                if let Err(e) = stale.close() {
                    tracing::warn!(session = name, "error while closing dead browser: {e:#}");
                }
            }
            guard.state = SessionState::Disconnected;

            tracing::info!(session = name, "starting new browser instance");
            let launcher = self.launcher.clone();
            let browser = tokio::task::spawn_blocking(move || launcher.launch())
                .await
                .map_err(|e| anyhow!("browser launch panicked: {e}"))?
                .with_context(|| format!("Could not start browser instance for '{name}'"))?;
            guard.browser = Some(browser);
            guard.state = SessionState::Connected;
        }

        Ok(SessionLease {
            name: name.to_string(),
            slot,
            guard,
        })
    }

    /// Hand the session back and keep it warm.
    pub fn release(&self, lease: SessionLease) {
        let SessionLease {
            name,
            slot,
            mut guard,
        } = lease;
        guard.idle.reset();

        let armed = guard.ticker.as_ref().is_some_and(|t| !t.is_finished());
        if !armed && guard.browser.is_some() {
            tracing::debug!(session = %name, "arming keep-alive");
            guard.ticker = Some(spawn_keep_alive(name, slot, self.keep_alive));
        }
    }

    pub async fn state(&self, name: &str) -> SessionState {
        self.slot(name).lock().await.state
    }

    pub async fn idle(&self, name: &str) -> Duration {
        self.slot(name).lock().await.idle.idle()
    }

    /// Close every browser and cancel pending keep-alive ticks.
    pub async fn shutdown(&self) {
        let slots: Vec<(String, Slot)> = {
            let sessions = self
                .sessions
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sessions
                .iter()
                .map(|(name, slot)| (name.clone(), slot.clone()))
                .collect()
        };

        for (name, slot) in slots {
            let mut inner = slot.lock().await;
            if let Some(ticker) = inner.ticker.take() {
                ticker.abort();
            }
            close_browser(&name, &mut inner);
        }
    }
}

fn close_browser(name: &str, inner: &mut SessionInner) {
    if let Some(browser) = inner.browser.take() {
        inner.state = SessionState::Closing;
        tracing::info!(session = name, "closing browser");
        if let Err(e) = browser.close() {
            tracing::warn!(session = name, "error while closing browser: {e:#}");
        }
    }
    inner.state = SessionState::Disconnected;
}

fn spawn_keep_alive(name: String, slot: Slot, keep_alive: KeepAlive) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let slept_from = Instant::now();
            tokio::time::sleep(keep_alive.tick).await;
            let mut inner = slot.lock().await;
            if inner.idle.reset_since(slept_from) {
                // A request used the session during this tick; count from its release.
                continue;
            }
            match inner.idle.tick() {
                TickOutcome::Rearm => {
                    tracing::debug!(
                        session = %name,
                        idle_secs = inner.idle.idle().as_secs(),
                        "kept alive, extending lifespan"
                    );
                }
                TickOutcome::Expire => {
                    tracing::info!(
                        session = %name,
                        ceiling_secs = keep_alive.ceiling.as_secs(),
                        "exceeded keep-alive ceiling"
                    );
                    close_browser(&name, &mut inner);
                    inner.ticker = None;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hands::BrowserPage;
    use anyhow::bail;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBrowser {
        connected: AtomicBool,
        closed: AtomicBool,
    }

    impl BrowserHandle for FakeBrowser {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn new_page(&self) -> Result<Arc<dyn BrowserPage>> {
            bail!("no pages in this test")
        }
        fn close(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        fail: AtomicBool,
        launched: Mutex<Vec<Arc<FakeBrowser>>>,
        attempts: AtomicUsize,
    }

    impl FakeLauncher {
        fn launches(&self) -> usize {
            self.launched.lock().unwrap().len()
        }

        fn last(&self) -> Arc<FakeBrowser> {
            self.launched.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl BrowserLauncher for FakeLauncher {
        fn launch(&self) -> Result<Arc<dyn BrowserHandle>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                bail!("chrome not found");
            }
            let browser = Arc::new(FakeBrowser::default());
            browser.connected.store(true, Ordering::SeqCst);
            self.launched.lock().unwrap().push(browser.clone());
            Ok(browser)
        }
    }

    fn registry() -> (Arc<FakeLauncher>, SessionRegistry) {
        let launcher = Arc::new(FakeLauncher::default());
        let registry = SessionRegistry::new(launcher.clone(), KeepAlive::default());
        (launcher, registry)
    }

    #[test]
    fn idle_clock_expires_on_eighteenth_tick() {
        let mut clock = IdleClock::new(KeepAlive::default());
        for tick in 1..18 {
            assert_eq!(clock.tick(), TickOutcome::Rearm, "tick {tick}");
        }
        assert_eq!(clock.idle(), Duration::from_secs(170));
        assert_eq!(clock.tick(), TickOutcome::Expire);
        assert_eq!(clock.idle(), Duration::from_secs(180));

        clock.reset();
        assert_eq!(clock.idle(), Duration::ZERO);
        assert_eq!(clock.tick(), TickOutcome::Rearm);
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_is_reused() {
        let (launcher, registry) = registry();

        let lease = registry.acquire(DEFAULT_SESSION_KEY).await.unwrap();
        assert_eq!(lease.name(), DEFAULT_SESSION_KEY);
        assert!(lease.browser().is_ok());
        registry.release(lease);

        let lease = registry.acquire(DEFAULT_SESSION_KEY).await.unwrap();
        registry.release(lease);

        assert_eq!(launcher.launches(), 1);
        assert_eq!(
            registry.state(DEFAULT_SESSION_KEY).await,
            SessionState::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dead_connection_is_relaunched() {
        let (launcher, registry) = registry();

        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);
        let first = launcher.last();
        first.connected.store(false, Ordering::SeqCst);

        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);

        assert_eq!(launcher.launches(), 2);
        assert!(first.closed.load(Ordering::SeqCst));
        assert!(launcher.last().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_is_an_error() {
        let (launcher, registry) = registry();
        launcher.fail.store(true, Ordering::SeqCst);

        let err = registry.acquire("browser").await.err().unwrap();
        assert!(format!("{err:#}").contains("chrome not found"));
        assert_eq!(registry.state("browser").await, SessionState::Disconnected);

        launcher.fail.store(false, Ordering::SeqCst);
        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);
        assert_eq!(launcher.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn browser_closes_when_idle_reaches_ceiling() {
        let (launcher, registry) = registry();
        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);
        let browser = launcher.last();

        tokio::time::sleep(Duration::from_secs(175)).await;
        assert!(!browser.closed.load(Ordering::SeqCst));
        assert_eq!(registry.idle("browser").await, Duration::from_secs(170));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(browser.closed.load(Ordering::SeqCst));
        assert_eq!(registry.state("browser").await, SessionState::Disconnected);

        // A later request starts over with a fresh browser.
        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_reset_idle_without_stacking_timers() {
        let (launcher, registry) = registry();
        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);

        tokio::time::sleep(Duration::from_secs(105)).await;
        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);

        // The tick due at 110 started before the request and is skipped;
        // counting resumes at 120 and the 18th tick lands at 290.
        tokio::time::sleep(Duration::from_secs(180)).await;
        assert!(!launcher.last().closed.load(Ordering::SeqCst));
        assert_eq!(registry.idle("browser").await, Duration::from_secs(170));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(launcher.last().closed.load(Ordering::SeqCst));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_request_does_not_shorten_the_idle_window() {
        let (launcher, registry) = registry();
        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);

        // Hold the session across the tick due at 10 s.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let lease = registry.acquire("browser").await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        registry.release(lease);

        assert_eq!(registry.idle("browser").await, Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(175)).await;
        assert!(!launcher.last().closed.load(Ordering::SeqCst));
        assert_eq!(registry.idle("browser").await, Duration::from_secs(170));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(launcher.last().closed.load(Ordering::SeqCst));
    }

    #[test]
    fn reset_is_timestamped() {
        let mut clock = IdleClock::new(KeepAlive::default());
        let before = Instant::now();
        assert!(!clock.reset_since(before + Duration::from_secs(1)));
        clock.tick();
        std::thread::sleep(Duration::from_millis(2));
        clock.reset();
        assert!(clock.reset_since(before));
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_requests_are_serialized() {
        let (_launcher, registry) = registry();
        let lease = registry.acquire("browser").await.unwrap();

        let blocked =
            tokio::time::timeout(Duration::from_secs(1), registry.acquire("browser")).await;
        assert!(blocked.is_err());

        let other = registry.acquire("other").await.unwrap();
        registry.release(other);

        registry.release(lease);
        let lease = tokio::time::timeout(Duration::from_secs(1), registry.acquire("browser"))
            .await
            .expect("lease released")
            .unwrap();
        registry.release(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_everything() {
        let (launcher, registry) = registry();
        let lease = registry.acquire("browser").await.unwrap();
        registry.release(lease);

        registry.shutdown().await;
        assert!(launcher.last().closed.load(Ordering::SeqCst));
        assert_eq!(registry.state("browser").await, SessionState::Disconnected);
    }
}
