use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::brain::{DEFAULT_API_URL, DEFAULT_MODEL, ModelConfig};
use crate::hands::ChromeOptions;
use crate::policy::{DEFAULT_MAX_TURNS, TurnPolicy};
use crate::session::{DEFAULT_SESSION_KEY, KeepAlive};

const APP_DIR: &str = "web-extract-agent";

/// Web extraction agent: a language model drives a real browser to answer a goal.
#[derive(Debug, Clone, Parser)]
#[command(name = "agent", version, about)]
pub struct Config {
    /// Address the HTTP endpoint listens on.
    #[arg(long, env = "AGENT_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,

    /// SQLite file holding job records. Defaults to the local data directory.
    #[arg(long, env = "AGENT_DATABASE")]
    pub database: Option<PathBuf>,

    /// Directory screenshots are written to. Defaults to the local data directory.
    #[arg(long, env = "AGENT_SCREENSHOT_DIR")]
    pub screenshot_dir: Option<PathBuf>,

    /// Skip screenshots entirely.
    #[arg(long, env = "AGENT_NO_SCREENSHOTS")]
    pub no_screenshots: bool,

    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Base URL of an OpenAI-compatible API.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, default_value = "")]
    pub api_key: String,

    /// Model calls allowed per job before it is failed.
    #[arg(long, env = "AGENT_MAX_TURNS", default_value_t = DEFAULT_MAX_TURNS)]
    pub max_turns: usize,

    /// Seconds an idle browser is kept alive.
    #[arg(long, env = "AGENT_KEEP_ALIVE_SECS", default_value_t = 180)]
    pub keep_alive_secs: u64,

    /// Seconds between keep-alive ticks.
    #[arg(long, env = "AGENT_KEEP_ALIVE_TICK_SECS", default_value_t = 10)]
    pub tick_secs: u64,

    /// Show the browser window.
    #[arg(long, env = "AGENT_HEADFUL")]
    pub headful: bool,

    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<PathBuf>,

    /// Attach to a running Chrome (DevTools websocket URL) instead of launching one.
    #[arg(long, env = "CHROME_CONNECT_URL")]
    pub connect_url: Option<String>,

    /// Requests allowed per minute before answering 429.
    #[arg(long, env = "AGENT_RATE_LIMIT", default_value_t = 60)]
    pub rate_limit: u32,

    #[arg(long, env = "AGENT_SESSION_KEY", default_value = DEFAULT_SESSION_KEY)]
    pub session_key: String,
}

impl Config {
    fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("jobs.db"))
    }

    pub fn screenshot_root(&self) -> PathBuf {
        self.screenshot_dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("screenshots"))
    }

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            ..ModelConfig::default()
        }
    }

    pub fn chrome_options(&self) -> ChromeOptions {
        ChromeOptions {
            headless: !self.headful,
            chrome_path: self.chrome_path.clone(),
            connect_url: self.connect_url.clone(),
            ..ChromeOptions::default()
        }
    }

    pub fn keep_alive(&self) -> KeepAlive {
        KeepAlive {
            ceiling: Duration::from_secs(self.keep_alive_secs),
            tick: Duration::from_secs(self.tick_secs.max(1)),
        }
    }

    pub fn turn_policy(&self) -> TurnPolicy {
        TurnPolicy::with_max_turns(self.max_turns)
    }
}
