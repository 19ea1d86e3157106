use std::time::Instant;

/// Per-job log. Every line is stamped with the time since the job started,
/// mirrored to `tracing`, and persisted with each checkpoint.
#[derive(Debug)]
pub struct RunLog {
    job_id: Option<i64>,
    started: Instant,
    lines: Vec<String>,
}

impl RunLog {
    pub fn start() -> Self {
        Self {
            job_id: None,
            started: Instant::now(),
            lines: Vec::new(),
        }
    }

    pub fn attach_job(&mut self, job_id: i64) {
        self.job_id = Some(job_id);
    }

    pub fn log(&mut self, msg: impl AsRef<str>) {
        let elapsed = self.started.elapsed().as_millis();
        let line = format!("[{elapsed}ms]: {}", msg.as_ref());
        match self.job_id {
            Some(job_id) => tracing::info!(job_id, "{line}"),
            None => tracing::info!("{line}"),
        }
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_stamped_and_ordered() {
        let mut log = RunLog::start();
        log.log("Loading page https://example.com");
        log.attach_job(7);
        log.log("Final Answer: done");

        let lines = log.lines();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("ms]: Loading page https://example.com"));
        assert!(lines[1].ends_with("ms]: Final Answer: done"));
    }
}
