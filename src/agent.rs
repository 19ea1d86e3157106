use anyhow::anyhow;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::brain::{ModelService, SYSTEM_PROMPT};
use crate::context::prune_observations;
use crate::dispatch::dispatch;
use crate::dom::observe;
use crate::hands::BrowserPage;
use crate::journal::RunLog;
use crate::policy::TurnPolicy;
use crate::screenshots::{ScreenshotSink, screenshot_folder, screenshot_key};
use crate::session::{DEFAULT_SESSION_KEY, SessionRegistry};
use crate::store::JobStore;
use crate::types::Message;

pub const DEFAULT_GOAL: &str = "Extract pricing model for this company";
pub const DEFAULT_STARTING_URL: &str = "https://bubble.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionRequest {
    pub goal: String,
    pub starting_url: String,
}

impl ExtractionRequest {
    pub fn new(goal: Option<String>, starting_url: Option<String>) -> Self {
        Self {
            goal: goal.unwrap_or_else(|| DEFAULT_GOAL.to_string()),
            starting_url: starting_url.unwrap_or_else(|| DEFAULT_STARTING_URL.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: i64,
    pub answer: String,
    pub turns: usize,
}

/// Why a job ended in `failed`.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("could not start browser session: {0:#}")]
    SessionLaunch(anyhow::Error),
    #[error("browser error: {0:#}")]
    Browser(anyhow::Error),
    #[error("model service error: {0:#}")]
    Model(anyhow::Error),
    #[error("job store error: {0:#}")]
    Store(anyhow::Error),
    #[error("turn limit exceeded after {0} turns")]
    TurnLimitExceeded(usize),
}

#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct JobFailure {
    /// Absent when the job record could not even be created.
    pub job_id: Option<i64>,
    #[source]
    pub error: RunError,
}

/// Where the conversation state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Init,
    AwaitingModel,
    DispatchingTools,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub session_key: String,
    pub system_prompt: String,
    pub policy: TurnPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            session_key: DEFAULT_SESSION_KEY.to_string(),
            system_prompt: SYSTEM_PROMPT.to_string(),
            policy: TurnPolicy::default(),
        }
    }
}

/// Drives one extraction job from request to final answer.
pub struct Agent {
    model: Arc<dyn ModelService>,
    store: Arc<dyn JobStore>,
    screenshots: Arc<dyn ScreenshotSink>,
    sessions: Arc<SessionRegistry>,
    settings: AgentSettings,
}

/// Mutable state of one run, owned by the loop.
struct Run {
    job_id: i64,
    folder: String,
    transcript: Vec<Message>,
    log: RunLog,
    state: TurnState,
    turns: usize,
}

impl Run {
    fn transition(&mut self, next: TurnState) {
        tracing::debug!(job_id = self.job_id, from = ?self.state, to = ?next, "turn state");
        self.state = next;
    }
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelService>,
        store: Arc<dyn JobStore>,
        screenshots: Arc<dyn ScreenshotSink>,
        sessions: Arc<SessionRegistry>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            model,
            store,
            screenshots,
            sessions,
            settings,
        }
    }

    /// Run the job on its own task. Dropping the handle leaves the job running
    /// to completion, so it always ends in a terminal status.
    pub fn spawn(
        self: &Arc<Self>,
        request: ExtractionRequest,
    ) -> JoinHandle<Result<JobOutcome, JobFailure>> {
        let agent = self.clone();
        tokio::spawn(async move { agent.run(request).await })
    }

    pub async fn run(&self, request: ExtractionRequest) -> Result<JobOutcome, JobFailure> {
        let mut log = RunLog::start();

        let job = self
            .store
            .create_job(&request.goal, &request.starting_url)
            .and_then(|job| self.store.mark_running(job.id).map(|()| job))
            .map_err(|e| JobFailure {
                job_id: None,
                error: RunError::Store(e),
            })?;
        log.attach_job(job.id);

        let mut run = Run {
            job_id: job.id,
            folder: screenshot_folder(job.created_at, &request.starting_url),
            transcript: Vec::new(),
            log,
            state: TurnState::Init,
            turns: 0,
        };

        let result = self.run_in_session(&request, &mut run).await;

        match result {
            Ok(answer) => {
                run.log.log(format!("Final Answer: {answer}"));
                self.store
                    .finalize_job(
                        run.job_id,
                        &answer,
                        &run.transcript,
                        run.log.lines(),
                        Utc::now(),
                    )
                    .map_err(|e| self.fail(&mut run, RunError::Store(e)))?;
                Ok(JobOutcome {
                    job_id: run.job_id,
                    answer,
                    turns: run.turns,
                })
            }
            Err(error) => Err(self.fail(&mut run, error)),
        }
    }

    /// Record the failure (best effort) and build the error returned to the caller.
    fn fail(&self, run: &mut Run, error: RunError) -> JobFailure {
        let reason = error.to_string();
        run.log.log(format!("Job failed: {reason}"));
        if let Err(e) = self.store.fail_job(
            run.job_id,
            &reason,
            &run.transcript,
            run.log.lines(),
            Utc::now(),
        ) {
            tracing::error!(job_id = run.job_id, "could not mark job as failed: {e:#}");
        }
        JobFailure {
            job_id: Some(run.job_id),
            error,
        }
    }

    async fn run_in_session(
        &self,
        request: &ExtractionRequest,
        run: &mut Run,
    ) -> Result<String, RunError> {
        let lease = self
            .sessions
            .acquire(&self.settings.session_key)
            .await
            .map_err(RunError::SessionLaunch)?;

        let result = async {
            let browser = lease.browser().map_err(RunError::SessionLaunch)?;
            let url = request.starting_url.clone();
            let page = blocking(move || {
                let page = browser.new_page()?;
                page.goto(&url)?;
                Ok(page)
            })
            .await
            .map_err(RunError::Browser)?;
            run.log.log(format!("Loading page {}", request.starting_url));

            let result = self.converse(&request.goal, page.clone(), run).await;

            // Close the tab once there is no more work to do on it.
            if let Err(e) = blocking(move || page.close()).await {
                tracing::warn!(job_id = run.job_id, "could not close tab: {e:#}");
            }
            result
        }
        .await;

        self.sessions.release(lease);
        result
    }

    async fn converse(
        &self,
        goal: &str,
        page: Arc<dyn BrowserPage>,
        run: &mut Run,
    ) -> Result<String, RunError> {
        let observer = page.clone();
        let observation = blocking(move || observe(observer.as_ref()))
            .await
            .map_err(RunError::Browser)?;

        run.transcript
            .push(Message::system(self.settings.system_prompt.clone()));
        run.transcript
            .push(Message::user_observation(format!("Goal: {goal}\n{observation}")));

        let policy = self.settings.policy;
        loop {
            if !policy.turn_allowed(run.turns) {
                return Err(RunError::TurnLimitExceeded(run.turns));
            }
            run.transition(TurnState::AwaitingModel);

            let pruned = prune_observations(&run.transcript);
            self.store_screenshot(page.clone(), run).await;

            let mut reply = self
                .model
                .complete(&pruned)
                .await
                .map_err(RunError::Model)?;
            run.turns += 1;

            let dropped = policy.enforce(&mut reply.tool_calls);
            if dropped > 0 {
                run.log
                    .log(format!("Model requested {} extra tool calls, ignoring them", dropped));
            }

            let call = reply.tool_calls.first().cloned();
            run.transcript
                .push(Message::assistant(reply.content.clone(), reply.tool_calls));

            let Some(call) = call else {
                run.transition(TurnState::Terminated);
                return Ok(reply.content);
            };

            run.transition(TurnState::DispatchingTools);
            run.log.log(format!(
                "{} {}: {}",
                call.name.as_str(),
                call.arguments.selector,
                call.arguments.reasoning
            ));

            let target = page.clone();
            let tool_message = blocking(move || Ok(dispatch(target.as_ref(), &call)))
                .await
                .map_err(RunError::Browser)?;
            if tool_message.content.starts_with("Error:") {
                run.log.log("Tool call failed, reporting error to the model");
            }
            run.transcript.push(tool_message);

            self.store
                .update_job(run.job_id, &run.transcript, run.log.lines(), Utc::now())
                .map_err(RunError::Store)?;
        }
    }

    /// Screenshots are an observability artifact: failures are logged, never fatal.
    async fn store_screenshot(&self, page: Arc<dyn BrowserPage>, run: &mut Run) {
        let key = screenshot_key(&run.folder, Utc::now());
        let sink = self.screenshots.clone();
        let target = key.clone();
        let stored = blocking(move || {
            let jpeg = page.screenshot_jpeg()?;
            sink.put(&target, &jpeg)
        })
        .await;

        match stored {
            Ok(()) => run.log.log(format!("Stored screenshot at {key}")),
            Err(e) => {
                tracing::warn!(job_id = run.job_id, "could not store screenshot: {e:#}");
            }
        }
    }
}

/// Run blocking browser work off the async executor.
async fn blocking<T, F>(work: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow!("browser task panicked: {e}"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_fill_missing_fields() {
        let request = ExtractionRequest::new(None, None);
        assert_eq!(request.goal, DEFAULT_GOAL);
        assert_eq!(request.starting_url, DEFAULT_STARTING_URL);

        let request = ExtractionRequest::new(Some("Extract pricing".into()), None);
        assert_eq!(request.goal, "Extract pricing");
        assert_eq!(request.starting_url, DEFAULT_STARTING_URL);
    }

    #[test]
    fn failure_message_names_the_cause() {
        let failure = JobFailure {
            job_id: Some(3),
            error: RunError::TurnLimitExceeded(25),
        };
        assert_eq!(failure.to_string(), "turn limit exceeded after 25 turns");

        let failure = JobFailure {
            job_id: Some(4),
            error: RunError::Model(anyhow!("429 Too Many Requests")),
        };
        assert_eq!(failure.to_string(), "model service error: 429 Too Many Requests");
    }
}
