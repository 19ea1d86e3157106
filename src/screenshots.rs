use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use reqwest::Url;
use std::path::PathBuf;

const BUCKET_SECONDS: i64 = 5 * 60;

/// Where per-turn screenshots go. Write-only; the loop never reads them back.
pub trait ScreenshotSink: Send + Sync {
    fn put(&self, key: &str, jpeg: &[u8]) -> Result<()>;
}

/// Stores screenshots as files below `root`, using the key as a relative path.
/// Colons in the key become `-` so the path is valid on Windows too.
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ScreenshotSink for DirectorySink {
    fn put(&self, key: &str, jpeg: &[u8]) -> Result<()> {
        let path = self.root.join(key.replace(':', "-"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, jpeg)
            .with_context(|| format!("Failed to write screenshot {}", path.display()))
    }
}

/// Discards screenshots.
pub struct NullSink;

impl ScreenshotSink for NullSink {
    fn put(&self, _key: &str, _jpeg: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Folder shared by all screenshots of one job: the creation time rounded to
/// the nearest five minutes, then the host of the starting URL.
pub fn screenshot_folder(created_at: DateTime<Utc>, starting_url: &str) -> String {
    let secs = created_at.timestamp();
    let rounded = (secs as f64 / BUCKET_SECONDS as f64).round() as i64 * BUCKET_SECONDS;
    let bucket = Utc
        .timestamp_opt(rounded, 0)
        .single()
        .unwrap_or(created_at)
        .format("%a %b %d %Y %H:%M:%S");
    format!("{bucket}_{}", url_host(starting_url))
}

pub fn screenshot_key(folder: &str, taken_at: DateTime<Utc>) -> String {
    format!(
        "{folder}/screenshot_{}.jpg",
        taken_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

fn url_host(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => parsed.host_str().unwrap_or_default().to_string(),
        Err(_) => url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, s).unwrap()
    }

    #[test]
    fn folder_rounds_to_nearest_five_minutes() {
        assert_eq!(
            screenshot_folder(at(12, 2, 29), "https://example.com/pricing"),
            "Tue Mar 05 2024 12:00:00_example.com"
        );
        assert_eq!(
            screenshot_folder(at(12, 2, 31), "http://example.com"),
            "Tue Mar 05 2024 12:05:00_example.com"
        );
    }

    #[test]
    fn key_uses_iso_timestamp() {
        let key = screenshot_key("folder", at(8, 30, 0));
        assert_eq!(key, "folder/screenshot_2024-03-05T08:30:00.000Z.jpg");
    }

    #[test]
    fn host_falls_back_for_unparseable_urls() {
        assert_eq!(url_host("https://bubble.io/pricing"), "bubble.io");
        assert_eq!(url_host("example.org/path"), "example.org");
    }

    #[test]
    fn directory_sink_writes_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(dir.path());
        let key = screenshot_key(&screenshot_folder(at(9, 0, 0), "https://a.test"), at(9, 0, 1));
        sink.put(&key, b"jpeg").unwrap();

        let stored = dir
            .path()
            .join("Tue Mar 05 2024 09-00-00_a.test")
            .join("screenshot_2024-03-05T09-00-01.000Z.jpg");
        assert_eq!(std::fs::read(stored).unwrap(), b"jpeg");
    }
}
