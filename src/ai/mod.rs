//! AI-subprocess driver: spawn the backend CLI with resource caps, capture
//! bounded output, enforce a two-stage timeout on the child's process group,
//! parse the structured response, and retry transient failures with backoff.

pub mod backend;
pub mod retry;

use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::config::AiConfig;
use crate::error::{EngineError, Result};
use crate::observe::trace::{TraceEvent, Tracer};
use crate::telemetry::{now_rfc3339, FileRef, TelemetryEntry, TelemetrySink};

use self::backend::{AiResponse, Backend, ChildCaps, PromptPair};
use self::retry::{is_transient, BackoffPolicy};

/// Grace period between the polite signal and the kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Stderr capture bound; enough for any diagnostic worth keeping.
const STDERR_CAP: usize = 256 * 1024;

pub struct AiDriver {
    backend: Arc<dyn Backend>,
    config: AiConfig,
    policy: BackoffPolicy,
    telemetry: Arc<TelemetrySink>,
    tracer: Arc<dyn Tracer>,
}

impl AiDriver {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: AiConfig,
        telemetry: Arc<TelemetrySink>,
        tracer: Arc<dyn Tracer>,
    ) -> Self {
        let policy = BackoffPolicy {
            max_retries: config.max_retries,
            ..Default::default()
        };
        Self {
            backend,
            config,
            policy,
            telemetry,
            tracer,
        }
    }

    /// One logical AI call: spawn + parse wrapped in retry. The pool sees
    /// every attempt as a single atomic call. Timeouts are never retried;
    /// other failures retry iff the stderr matches a transient marker.
    pub fn call(
        &self,
        prompts: &PromptPair,
        label: &str,
        files: Vec<FileRef>,
    ) -> Result<AiResponse> {
        let started = now_rfc3339();
        let begin = Instant::now();
        let prompt_bytes =
            (prompts.system.len() + self.backend.stdin_payload(prompts).len()) as u64;

        let mut attempt: u32 = 0;
        let outcome = loop {
            match self.spawn_once(prompts, label) {
                Ok(response) => break Ok(response),
                Err(e @ EngineError::Timeout { .. }) => break Err(e),
                Err(e) => {
                    let transient = match &e {
                        EngineError::SubprocessError { stderr, .. } => is_transient(stderr),
                        _ => false,
                    };
                    if transient && attempt < self.policy.max_retries {
                        let delay = self.policy.delay(attempt);
                        attempt += 1;
                        self.tracer.emit(TraceEvent::Retry {
                            label: label.to_string(),
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        });
                        warn!(
                            "transient AI failure for {} (attempt {}), retrying in {:?}",
                            label, attempt, delay
                        );
                        std::thread::sleep(delay);
                        continue;
                    }
                    if transient {
                        break Err(EngineError::RateLimitExhausted {
                            attempts: attempt + 1,
                        });
                    }
                    break Err(e);
                }
            }
        };

        let ended = now_rfc3339();
        let duration_ms = begin.elapsed().as_millis() as u64;
        let entry = match &outcome {
            Ok(response) => TelemetryEntry {
                label: label.to_string(),
                started,
                ended,
                prompt_bytes,
                response_bytes: response.raw.len() as u64,
                model: response.model.clone(),
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
                cache_read_tokens: response.cache_read_tokens,
                cache_creation_tokens: response.cache_creation_tokens,
                duration_ms,
                exit_code: response.exit_code,
                retries: attempt,
                reasoning: None,
                files,
            },
            Err(e) => TelemetryEntry {
                label: label.to_string(),
                started,
                ended,
                prompt_bytes,
                response_bytes: 0,
                model: "unknown".to_string(),
                input_tokens: 0,
                output_tokens: 0,
                cache_read_tokens: 0,
                cache_creation_tokens: 0,
                duration_ms,
                exit_code: match e {
                    EngineError::SubprocessError { exit_code, .. } => *exit_code,
                    EngineError::Timeout { .. } => 124,
                    _ => -1,
                },
                retries: attempt,
                reasoning: None,
                files,
            },
        };
        self.telemetry.record(entry);
        outcome
    }

    /// One spawn + capture + parse. The child runs in its own process group
    /// so both timeout signals reach every descendant.
    fn spawn_once(&self, prompts: &PromptPair, label: &str) -> Result<AiResponse> {
        let program = self.backend.program();
        let args = self.backend.build_args(prompts);
        let caps = ChildCaps {
            memory_cap_mb: self.config.memory_cap_mb,
            thread_cap: self.config.thread_cap,
        };

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in self.backend.env_overrides(&caps) {
            cmd.env(key, value);
        }
        unsafe {
            cmd.pre_exec(|| {
                // Own process group so the two-stage kill reaches children.
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let begin = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::CliNotFound {
                    hints: format!("  {}", self.backend.install_hint()),
                }
            } else {
                EngineError::IoError(e)
            }
        })?;
        let pid = child.id();
        self.tracer.emit(TraceEvent::SubprocessSpawn {
            label: label.to_string(),
            pid,
        });

        // Readers must be up before stdin is fed, or a chatty child can
        // fill its stdout pipe and deadlock against our stdin write.
        let stdout_pipe = child.stdout.take().expect("stdout piped");
        let stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_cap = self.config.stdout_cap_bytes;
        let stdout_handle =
            std::thread::spawn(move || read_bounded(stdout_pipe, stdout_cap));
        let stderr_handle =
            std::thread::spawn(move || read_bounded(stderr_pipe, STDERR_CAP));

        if let Some(mut stdin) = child.stdin.take() {
            let payload = self.backend.stdin_payload(prompts);
            if let Err(e) = stdin.write_all(payload.as_bytes()) {
                debug!("stdin write to {} interrupted: {}", program, e);
            }
            // Dropping closes the pipe and signals end-of-prompt.
        }

        let (done, timed_out) = spawn_kill_escalation(
            pid,
            Duration::from_millis(self.config.timeout_ms),
            label.to_string(),
        );

        let status = child.wait();
        done.store(true, Ordering::Release);

        let (stdout_bytes, stdout_truncated) = stdout_handle.join().unwrap_or_default();
        let (stderr_bytes, _) = stderr_handle.join().unwrap_or_default();
        let duration_ms = begin.elapsed().as_millis() as u64;

        let status = status?;
        let exit_code = status.code().unwrap_or(-1);
        self.tracer.emit(TraceEvent::SubprocessExit {
            label: label.to_string(),
            exit_code,
            duration_ms,
            timed_out: timed_out.load(Ordering::Acquire),
        });

        if timed_out.load(Ordering::Acquire) {
            return Err(EngineError::Timeout {
                label: label.to_string(),
                timeout_ms: self.config.timeout_ms,
            });
        }
        if stdout_truncated {
            return Err(EngineError::ParseError(format!(
                "stdout exceeded {} byte cap",
                self.config.stdout_cap_bytes
            )));
        }
        if !status.success() {
            return Err(EngineError::SubprocessError {
                exit_code,
                stderr: String::from_utf8_lossy(&stderr_bytes).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&stdout_bytes);
        let mut response = self.backend.parse_response(&stdout)?;
        response.exit_code = exit_code;
        if response.duration_ms == 0 {
            response.duration_ms = duration_ms;
        }
        Ok(response)
    }
}

/// Read a pipe to EOF, keeping at most `cap` bytes. The remainder is drained
/// and discarded so the child never blocks on a full pipe.
fn read_bounded<R: Read>(mut pipe: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() + n <= cap {
                    buf.extend_from_slice(&chunk[..n]);
                } else {
                    if buf.len() < cap {
                        buf.extend_from_slice(&chunk[..cap - buf.len()]);
                    }
                    truncated = true;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (buf, truncated)
}

/// Two-stage kill watchdog for a child's process group: SIGTERM at the
/// deadline, SIGKILL after the grace period. The `done` flag cancels both
/// stages once the child has exited normally (and guards against a recycled
/// PID receiving a stray signal).
fn spawn_kill_escalation(
    pid: u32,
    timeout: Duration,
    label: String,
) -> (Arc<AtomicBool>, Arc<AtomicBool>) {
    let done = Arc::new(AtomicBool::new(false));
    let timed_out = Arc::new(AtomicBool::new(false));
    let done_flag = done.clone();
    let timed_out_flag = timed_out.clone();
    std::thread::spawn(move || {
        std::thread::sleep(timeout);
        if done_flag.load(Ordering::Acquire) {
            return;
        }
        timed_out_flag.store(true, Ordering::Release);
        warn!(
            "AI call {} exceeded {:?}, terminating process group {}",
            label, timeout, pid
        );
        let group = Pid::from_raw(-(pid as i32));
        let _ = kill(group, Signal::SIGTERM);
        std::thread::sleep(KILL_GRACE);
        if !done_flag.load(Ordering::Acquire) {
            warn!("process group {} ignored SIGTERM, killing", pid);
            let _ = kill(group, Signal::SIGKILL);
        }
    });
    (done, timed_out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observe::trace::NullTracer;

    /// Test-only adapter that shells out to /bin/sh so driver behavior can
    /// be exercised without any real AI CLI installed.
    struct ShBackend {
        script: String,
    }

    impl Backend for ShBackend {
        fn name(&self) -> &'static str {
            "sh"
        }
        fn program(&self) -> String {
            "/bin/sh".to_string()
        }
        fn build_args(&self, _prompts: &PromptPair) -> Vec<String> {
            vec!["-c".to_string(), self.script.clone()]
        }
        fn env_overrides(&self, _caps: &ChildCaps) -> Vec<(String, String)> {
            Vec::new()
        }
        fn parse_response(&self, stdout: &str) -> Result<AiResponse> {
            backend::ClaudeBackend.parse_response(stdout)
        }
        fn install_hint(&self) -> &'static str {
            "sh: install a POSIX shell"
        }
    }

    fn driver_for(script: &str, timeout_ms: u64) -> AiDriver {
        let config = AiConfig {
            timeout_ms,
            max_retries: 3,
            ..Default::default()
        };
        AiDriver::new(
            Arc::new(ShBackend {
                script: script.to_string(),
            }),
            config,
            Arc::new(TelemetrySink::new()),
            Arc::new(NullTracer),
        )
    }

    fn prompts() -> PromptPair {
        PromptPair {
            system: "sys".to_string(),
            user: "user".to_string(),
        }
    }

    #[test]
    fn successful_call_parses_and_records_telemetry() {
        let driver = driver_for(
            r#"cat >/dev/null; echo '{"result":"ok","usage":{"input_tokens":5,"output_tokens":2},"modelUsage":{"m1":{}}}'"#,
            10_000,
        );
        let response = driver.call(&prompts(), "t1", vec![]).unwrap();
        assert_eq!(response.text, "ok");
        let entries = driver.telemetry.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retries, 0);
        assert_eq!(entries[0].input_tokens, 5);
    }

    #[test]
    fn nonzero_exit_is_subprocess_error() {
        let driver = driver_for("cat >/dev/null; echo 'boom' >&2; exit 3", 10_000);
        let err = driver.call(&prompts(), "t1", vec![]).unwrap_err();
        match err {
            EngineError::SubprocessError { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn timeout_kills_and_is_not_retried() {
        let driver = driver_for("cat >/dev/null; sleep 60", 300);
        let begin = Instant::now();
        let err = driver.call(&prompts(), "slow", vec![]).unwrap_err();
        assert_eq!(err.kind(), "ai-timeout");
        // Well under the 60s the child wanted, and exactly one attempt.
        assert!(begin.elapsed() < Duration::from_secs(30));
        assert_eq!(driver.telemetry.snapshot()[0].retries, 0);
    }

    #[test]
    fn rate_limited_stderr_retries_then_succeeds() {
        // Fails with a 429 marker until the witness file exists, then
        // answers properly: three transient failures, success on the fourth.
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        let script = format!(
            r#"cat >/dev/null
n=$(cat {c} 2>/dev/null || echo 0)
n=$((n+1))
echo $n > {c}
if [ $n -le 3 ]; then echo 'HTTP 429 too many requests' >&2; exit 1; fi
echo '{{"result":"ok","usage":{{}},"modelUsage":{{"m":{{}}}}}}'"#,
            c = counter.display()
        );
        let mut driver = driver_for(&script, 10_000);
        driver.policy.base_ms = 10;
        driver.policy.cap_ms = 20;
        driver.policy.jitter_ms = 0;

        let response = driver.call(&prompts(), "flaky", vec![]).unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(driver.telemetry.snapshot()[0].retries, 3);
    }

    #[test]
    fn rate_limit_exhaustion_is_tagged() {
        let driver = {
            let mut d = driver_for("cat >/dev/null; echo 'rate limit' >&2; exit 1", 10_000);
            d.policy.base_ms = 1;
            d.policy.cap_ms = 2;
            d.policy.jitter_ms = 0;
            d
        };
        let err = driver.call(&prompts(), "t", vec![]).unwrap_err();
        assert_eq!(err.kind(), "rate-limit-exhausted");
    }

    #[test]
    fn oversized_stdout_is_a_parse_error() {
        let mut driver = driver_for(
            "cat >/dev/null; head -c 200000 /dev/zero | tr '\\0' 'x'",
            10_000,
        );
        driver.config.stdout_cap_bytes = 1024;
        let err = driver.call(&prompts(), "big", vec![]).unwrap_err();
        assert_eq!(err.kind(), "ai-parse");
    }
}
