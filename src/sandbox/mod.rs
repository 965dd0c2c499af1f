//! Sandbox sessions: one isolated place to run interpreter code
//!
//! A session owns the lifetime of one provisioned interpreter environment.
//! It installs the context payload and delegation preamble, runs programs to
//! completion with full output capture, and must be closed on every exit
//! path. Environments come from an [`InterpreterHost`], which is either a
//! direct provider or the checkout/checkin pool in [`crate::pool`].

mod python;

pub use python::PythonInterpreterProvider;

use crate::protocol;
use crate::SandboxConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Errors from sandbox provisioning and execution
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Sandbox provisioning failed: {0}")]
    Provisioning(String),

    #[error("Sandbox crashed: {0}")]
    Crashed(String),

    #[error("Program exited with status {code}: {detail}")]
    Program { code: i32, detail: String },
}

/// Raw result of one interpreter invocation
#[derive(Debug, Clone)]
pub struct RawRun {
    pub stdout: String,
    pub stderr: String,
    /// None when the environment died without reporting a status
    pub exit_code: Option<i32>,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure(i32),
    /// Environment died mid-run, or the wall-clock timeout fired
    Crashed,
}

/// Captured result of one session run
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Primary-channel output; markers are only ever read from here
    pub stdout: String,
    /// Primary output plus diagnostic-channel lines tagged `[stderr]`
    pub merged: String,
    pub status: ExitStatus,
}

impl RunOutput {
    fn from_raw(raw: RawRun) -> Self {
        let mut merged = raw.stdout.clone();
        for line in raw.stderr.lines() {
            merged.push_str("[stderr] ");
            merged.push_str(line);
            merged.push('\n');
        }
        let status = match raw.exit_code {
            Some(0) => ExitStatus::Success,
            Some(code) => ExitStatus::Failure(code),
            None => ExitStatus::Crashed,
        };
        Self {
            stdout: raw.stdout,
            merged,
            status,
        }
    }
}

/// One provisioned interpreter environment.
///
/// Each `exec` is a clean interpreter invocation: programs must be
/// self-contained, and nothing is assumed to survive between runs beyond
/// what the protocol preamble re-injects.
#[async_trait]
pub trait Interpreter: Send {
    async fn exec(&mut self, program: &str) -> Result<RawRun, SessionError>;

    /// Tear the environment down. Called at most once.
    async fn shutdown(&mut self);
}

/// Provisions interpreter environments (the sandboxed-interpreter provider).
#[async_trait]
pub trait InterpreterProvider: Send + Sync {
    async fn provision(&self) -> Result<Box<dyn Interpreter>, SessionError>;
}

/// Source sessions draw environments from: acquire on open, release on
/// close. The pool implementation parks released environments for reuse; the
/// direct implementation shuts them down.
#[async_trait]
pub trait InterpreterHost: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Interpreter>, SessionError>;
    async fn release(&self, interpreter: Box<dyn Interpreter>);
}

/// Host that provisions fresh and destroys on release.
pub struct DirectHost {
    provider: Arc<dyn InterpreterProvider>,
}

impl DirectHost {
    pub fn new(provider: Arc<dyn InterpreterProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl InterpreterHost for DirectHost {
    async fn acquire(&self) -> Result<Box<dyn Interpreter>, SessionError> {
        self.provider.provision().await
    }

    async fn release(&self, mut interpreter: Box<dyn Interpreter>) {
        interpreter.shutdown().await;
    }
}

/// One isolated execution session
pub struct SandboxSession {
    host: Arc<dyn InterpreterHost>,
    interpreter: Option<Box<dyn Interpreter>>,
    context_binding: String,
    /// Keeps the side-channel context file alive for the session's lifetime
    _context_file: Option<NamedTempFile>,
    run_timeout: Duration,
    /// Set after a crashed or timed-out run; a tainted environment is
    /// destroyed on close instead of released for reuse.
    tainted: bool,
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("context_binding", &self.context_binding)
            .field("run_timeout", &self.run_timeout)
            .field("tainted", &self.tainted)
            .finish_non_exhaustive()
    }
}

impl SandboxSession {
    /// Provision an environment and install the context payload.
    ///
    /// Acquisition is retried with exponential backoff up to the configured
    /// attempt budget. Payloads above the inline limit are written to a
    /// side-channel file and read back by the preamble, to avoid
    /// embedding-size failures.
    pub async fn open(
        host: Arc<dyn InterpreterHost>,
        context: &str,
        config: &SandboxConfig,
    ) -> Result<Self, SessionError> {
        let mut last_err = None;
        let mut interpreter = None;
        for attempt in 0..config.provision_attempts {
            match host.acquire().await {
                Ok(i) => {
                    interpreter = Some(i);
                    break;
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Sandbox acquisition failed");
                    last_err = Some(e);
                    if attempt + 1 < config.provision_attempts {
                        let backoff = config.provision_backoff_ms << attempt;
                        sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }
        let interpreter = match interpreter {
            Some(i) => i,
            None => {
                return Err(SessionError::Provisioning(format!(
                    "gave up after {} attempts: {}",
                    config.provision_attempts,
                    last_err
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no attempts configured".to_string())
                )))
            }
        };

        let (context_binding, context_file) = if context.len() > config.inline_context_limit {
            let file = NamedTempFile::new()
                .map_err(|e| SessionError::Provisioning(format!("context file: {}", e)))?;
            std::fs::write(file.path(), context)
                .map_err(|e| SessionError::Provisioning(format!("context file: {}", e)))?;
            let binding = protocol::file_context_binding(&file.path().to_string_lossy());
            (binding, Some(file))
        } else {
            (protocol::inline_context_binding(context), None)
        };

        Ok(Self {
            host,
            interpreter: Some(interpreter),
            context_binding,
            _context_file: context_file,
            run_timeout: Duration::from_secs(config.run_timeout_secs),
            tainted: false,
        })
    }

    /// Execute `body` with the current preamble (context binding plus the
    /// given resolution cache) prepended. All primary-channel output is
    /// captured even when the run errors; a run that exceeds the wall-clock
    /// timeout is reported as a crash.
    pub async fn run(
        &mut self,
        body: &str,
        cache: &BTreeMap<String, String>,
    ) -> Result<RunOutput, SessionError> {
        let interpreter = self
            .interpreter
            .as_mut()
            .ok_or_else(|| SessionError::Crashed("session already closed".to_string()))?;

        let program = format!(
            "{}\n{}",
            protocol::build_preamble(&self.context_binding, cache),
            body
        );

        debug!(program_len = program.len(), cache_entries = cache.len(), "Running program");

        let outcome = match timeout(self.run_timeout, interpreter.exec(&program)).await {
            Ok(result) => result.map(RunOutput::from_raw),
            Err(_) => Ok(RunOutput {
                stdout: String::new(),
                merged: format!(
                    "run exceeded the {}s wall-clock timeout and was killed",
                    self.run_timeout.as_secs()
                ),
                status: ExitStatus::Crashed,
            }),
        };

        // An environment that died mid-run must not be parked for reuse.
        match &outcome {
            Ok(out) if out.status == ExitStatus::Crashed => self.tainted = true,
            Err(_) => self.tainted = true,
            _ => {}
        }

        outcome
    }

    /// Release the environment, or destroy it when a run crashed. Idempotent;
    /// every caller that opened a session must reach this on normal
    /// completion, error, and cancellation paths alike.
    pub async fn close(&mut self) {
        if let Some(mut interpreter) = self.interpreter.take() {
            if self.tainted {
                interpreter.shutdown().await;
            } else {
                self.host.release(interpreter).await;
            }
        }
    }

    /// Whether the session still holds an environment.
    pub fn is_open(&self) -> bool {
        self.interpreter.is_some()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted interpreter: each expected run optionally asserts on the
    /// program text and returns a canned outcome.
    pub struct ScriptedRun {
        pub expect_contains: Option<String>,
        pub result: Result<RawRun, SessionError>,
    }

    pub struct ScriptedInterpreter {
        runs: Mutex<Vec<ScriptedRun>>,
    }

    impl ScriptedInterpreter {
        pub fn new(runs: Vec<ScriptedRun>) -> Self {
            Self {
                runs: Mutex::new(runs),
            }
        }
    }

    #[async_trait]
    impl Interpreter for ScriptedInterpreter {
        async fn exec(&mut self, program: &str) -> Result<RawRun, SessionError> {
            let mut runs = self.runs.lock().expect("script lock");
            assert!(!runs.is_empty(), "interpreter ran more times than scripted");
            let run = runs.remove(0);
            if let Some(needle) = &run.expect_contains {
                assert!(
                    program.contains(needle.as_str()),
                    "program missing expected text {:?}",
                    needle
                );
            }
            run.result
        }

        async fn shutdown(&mut self) {}
    }

    /// Provider handing out scripted interpreters, with failure injection
    /// and provision counting.
    pub struct ScriptedProvider {
        scripts: Mutex<Vec<Vec<ScriptedRun>>>,
        pub provisions: AtomicUsize,
        pub failures_before_success: AtomicUsize,
    }

    impl ScriptedProvider {
        pub fn new(scripts: Vec<Vec<ScriptedRun>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                provisions: AtomicUsize::new(0),
                failures_before_success: AtomicUsize::new(0),
            }
        }

        pub fn failing_first(self, failures: usize) -> Self {
            self.failures_before_success.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl InterpreterProvider for ScriptedProvider {
        async fn provision(&self) -> Result<Box<dyn Interpreter>, SessionError> {
            self.provisions.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_before_success.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
                return Err(SessionError::Provisioning("injected failure".to_string()));
            }
            let mut scripts = self.scripts.lock().expect("script lock");
            assert!(!scripts.is_empty(), "provisioned more sessions than scripted");
            Ok(Box::new(ScriptedInterpreter::new(scripts.remove(0))))
        }
    }

    pub fn ok_run(stdout: &str) -> Result<RawRun, SessionError> {
        Ok(RawRun {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    pub fn halted_run(stdout: &str) -> Result<RawRun, SessionError> {
        Ok(RawRun {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(crate::protocol::HALT_EXIT_CODE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ok_run, ScriptedProvider, ScriptedRun};
    use super::*;
    use std::sync::atomic::Ordering;

    fn config() -> SandboxConfig {
        SandboxConfig {
            provision_backoff_ms: 1,
            ..SandboxConfig::default()
        }
    }

    fn host_of(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, Arc<dyn InterpreterHost>) {
        let provider = Arc::new(provider);
        let host = Arc::new(DirectHost::new(provider.clone() as Arc<dyn InterpreterProvider>));
        (provider, host)
    }

    #[tokio::test]
    async fn open_retries_provisioning_with_backoff() {
        let (provider, host) = host_of(
            ScriptedProvider::new(vec![vec![ScriptedRun {
                expect_contains: None,
                result: ok_run("hi\n"),
            }]])
            .failing_first(2),
        );

        let mut session = SandboxSession::open(host, "ctx", &config()).await.unwrap();
        assert_eq!(provider.provisions.load(Ordering::SeqCst), 3);

        let out = session.run("print('hi')", &BTreeMap::new()).await.unwrap();
        assert_eq!(out.status, ExitStatus::Success);
        session.close().await;
    }

    #[tokio::test]
    async fn open_gives_up_after_attempt_budget() {
        let (_, host) = host_of(ScriptedProvider::new(vec![]).failing_first(5));
        let err = SandboxSession::open(host, "ctx", &config()).await.unwrap_err();
        assert!(matches!(err, SessionError::Provisioning(_)));
    }

    #[tokio::test]
    async fn run_prepends_context_and_cache() {
        let (_, host) = host_of(ScriptedProvider::new(vec![vec![ScriptedRun {
            expect_contains: Some("the needle".to_string()),
            result: ok_run(""),
        }]]));

        let mut session = SandboxSession::open(host, "the needle", &config())
            .await
            .unwrap();
        let mut cache = BTreeMap::new();
        cache.insert("p".to_string(), "r".to_string());
        session.run("pass", &cache).await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn large_context_goes_through_side_channel_file() {
        let (_, host) = host_of(ScriptedProvider::new(vec![vec![ScriptedRun {
            expect_contains: Some("context = open(".to_string()),
            result: ok_run(""),
        }]]));

        let cfg = SandboxConfig {
            inline_context_limit: 8,
            ..config()
        };
        let mut session = SandboxSession::open(host, "a context well past eight bytes", &cfg)
            .await
            .unwrap();
        session.run("pass", &BTreeMap::new()).await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn missing_exit_status_classifies_as_crash() {
        let (_, host) = host_of(ScriptedProvider::new(vec![vec![ScriptedRun {
            expect_contains: None,
            result: Ok(RawRun {
                stdout: "partial output before death\n".to_string(),
                stderr: String::new(),
                exit_code: None,
            }),
        }]]));

        let mut session = SandboxSession::open(host, "", &config()).await.unwrap();
        let out = session.run("pass", &BTreeMap::new()).await.unwrap();
        assert_eq!(out.status, ExitStatus::Crashed);
        assert!(out.stdout.contains("partial output"));
        session.close().await;
    }

    #[tokio::test]
    async fn stderr_is_tagged_in_merged_capture() {
        let (_, host) = host_of(ScriptedProvider::new(vec![vec![ScriptedRun {
            expect_contains: None,
            result: Ok(RawRun {
                stdout: "primary\n".to_string(),
                stderr: "diagnostic\n".to_string(),
                exit_code: Some(0),
            }),
        }]]));

        let mut session = SandboxSession::open(host, "", &config()).await.unwrap();
        let out = session.run("pass", &BTreeMap::new()).await.unwrap();
        assert!(out.merged.contains("[stderr] diagnostic"));
        assert!(!out.stdout.contains("[stderr]"));
        session.close().await;
    }

    #[tokio::test]
    async fn crashed_run_is_not_released_for_reuse() {
        use crate::pool::SandboxPool;

        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![ScriptedRun {
                expect_contains: None,
                result: Ok(RawRun {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                }),
            }],
            vec![ScriptedRun {
                expect_contains: None,
                result: ok_run(""),
            }],
        ]));
        let pool = Arc::new(SandboxPool::new(
            provider.clone() as Arc<dyn InterpreterProvider>,
            4,
        ));

        let mut session = SandboxSession::open(pool.clone(), "", &config())
            .await
            .unwrap();
        let out = session.run("pass", &BTreeMap::new()).await.unwrap();
        assert_eq!(out.status, ExitStatus::Crashed);
        session.close().await;
        assert_eq!(pool.idle_count().await, 0);

        // A clean run still parks the environment.
        let mut session = SandboxSession::open(pool.clone(), "", &config())
            .await
            .unwrap();
        session.run("pass", &BTreeMap::new()).await.unwrap();
        session.close().await;
        assert_eq!(pool.idle_count().await, 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_, host) = host_of(ScriptedProvider::new(vec![vec![]]));
        let mut session = SandboxSession::open(host, "", &config()).await.unwrap();
        session.close().await;
        assert!(!session.is_open());
        session.close().await;

        let err = session.run("pass", &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, SessionError::Crashed(_)));
    }
}
