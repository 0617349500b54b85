//! External tool adapter for chiron.
//!
//! Every external command the engine runs (`uv`, `syft`, `grype`,
//! `cosign`, wheel build drivers) goes through this single choke point.
//! Each invocation carries a closed command tag, gets a PATH probe with
//! an explicit override hook, a per-tag timeout enforced with a hard
//! process-group kill, and full output capture. Only network-class
//! failures are retried, and never for `sign` or `build_wheel`.
//!
//! # Example
//!
//! ```no_run
//! use chiron_tools::{ToolAdapter, ToolInvocation, ToolTag};
//!
//! let adapter = ToolAdapter::from_env();
//! let record = adapter
//!     .run(ToolInvocation::new(ToolTag::Resolve).args(["--version"]))
//!     .expect("resolver available");
//! assert_eq!(record.exit, 0);
//! ```

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

use chiron_retry::{BackoffConfig, RetryDecision, run_with_backoff};
use chiron_types::ErrorCategory;

/// The closed set of commands the engine may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTag {
    Resolve,
    BuildWheel,
    Sbom,
    Scan,
    Sign,
    VerifySignature,
}

impl ToolTag {
    pub const ALL: [ToolTag; 6] = [
        ToolTag::Resolve,
        ToolTag::BuildWheel,
        ToolTag::Sbom,
        ToolTag::Scan,
        ToolTag::Sign,
        ToolTag::VerifySignature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolTag::Resolve => "resolve",
            ToolTag::BuildWheel => "build_wheel",
            ToolTag::Sbom => "sbom",
            ToolTag::Scan => "scan",
            ToolTag::Sign => "sign",
            ToolTag::VerifySignature => "verify_signature",
        }
    }

    /// Default executable probed on PATH for this tag.
    pub fn default_binary(&self) -> &'static str {
        match self {
            ToolTag::Resolve | ToolTag::BuildWheel => "uv",
            ToolTag::Sbom => "syft",
            ToolTag::Scan => "grype",
            ToolTag::Sign | ToolTag::VerifySignature => "cosign",
        }
    }

    /// Shown in `tool_missing` errors.
    pub fn install_hint(&self) -> &'static str {
        match self {
            ToolTag::Resolve | ToolTag::BuildWheel => {
                "install uv (https://docs.astral.sh/uv/getting-started/installation/)"
            }
            ToolTag::Sbom => "install syft (https://github.com/anchore/syft)",
            ToolTag::Scan => "install grype (https://github.com/anchore/grype)",
            ToolTag::Sign | ToolTag::VerifySignature => {
                "install cosign (https://docs.sigstore.dev/cosign/system_config/installation/)"
            }
        }
    }

    pub fn default_timeout(&self) -> Duration {
        match self {
            ToolTag::Resolve => Duration::from_secs(300),
            ToolTag::BuildWheel => Duration::from_secs(1800),
            ToolTag::Sbom | ToolTag::Scan => Duration::from_secs(180),
            ToolTag::Sign | ToolTag::VerifySignature => Duration::from_secs(60),
        }
    }

    /// Signing and wheel builds are never retried; a half-applied
    /// attempt would not be idempotent.
    pub fn retryable(&self) -> bool {
        !matches!(self, ToolTag::Sign | ToolTag::BuildWheel)
    }

    /// Environment variable that overrides this tag's timeout, seconds.
    pub fn timeout_env_var(&self) -> String {
        format!("CHIRON_TOOL_TIMEOUT_{}", self.as_str().to_ascii_uppercase())
    }
}

impl std::fmt::Display for ToolTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One request to run an external command.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tag: ToolTag,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Caller timeout; only honored upward of the tag default.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(tag: ToolTag) -> Self {
        Self {
            tag,
            args: Vec::new(),
            working_dir: PathBuf::from("."),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Structured record of one completed invocation.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub tag: ToolTag,
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    pub killed_by_timeout: bool,
}

impl ToolRecord {
    /// Last lines of stderr for operator-facing error summaries.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Failure classification for tool invocations, one variant per
/// surfaced error kind.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tag}: executable `{binary}` not found on PATH; {hint}")]
    Missing {
        tag: ToolTag,
        binary: String,
        hint: String,
    },
    #[error("{tag}: timed out after {}s", .timeout.as_secs())]
    Timeout {
        tag: ToolTag,
        timeout: Duration,
        record: Box<ToolRecord>,
    },
    #[error("{tag}: exited with status {}", .record.exit)]
    NonZeroExit { tag: ToolTag, record: Box<ToolRecord> },
    #[error("{tag}: transient failure (network class), retries exhausted")]
    Transient { tag: ToolTag, record: Box<ToolRecord> },
    #[error("{tag}: failed to execute: {source}")]
    Spawn {
        tag: ToolTag,
        #[source]
        source: std::io::Error,
    },
    #[error("{tag}: cancelled by the pipeline run")]
    Cancelled { tag: ToolTag },
}

impl ToolError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ToolError::Missing { .. } => ErrorCategory::ToolMissing,
            ToolError::Timeout { .. } => ErrorCategory::ToolTimeout,
            ToolError::NonZeroExit { .. } | ToolError::Spawn { .. } => ErrorCategory::ToolFailed,
            ToolError::Transient { .. } => ErrorCategory::ToolFailed,
            ToolError::Cancelled { .. } => ErrorCategory::InternalError,
        }
    }

    /// The captured record, when execution got far enough to have one.
    pub fn record(&self) -> Option<&ToolRecord> {
        match self {
            ToolError::Timeout { record, .. }
            | ToolError::NonZeroExit { record, .. }
            | ToolError::Transient { record, .. } => Some(record),
            _ => None,
        }
    }
}

/// Stderr markers that classify a non-zero exit as network-class.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection timed out",
    "temporary failure in name resolution",
    "tls handshake",
    "network is unreachable",
    "operation timed out",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway timeout",
];

fn looks_transient(record: &ToolRecord) -> bool {
    let haystack = format!(
        "{}\n{}",
        record.stderr.to_ascii_lowercase(),
        record.stdout.to_ascii_lowercase()
    );
    TRANSIENT_MARKERS.iter().any(|m| haystack.contains(m))
}

/// Cooperative cancellation signal shared between a pipeline run and
/// its in-flight tool invocations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Grace between SIGTERM and SIGKILL when a run is cancelled.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// The single choke point all external commands run through.
#[derive(Debug, Clone, Default)]
pub struct ToolAdapter {
    /// Explicit per-tag binary overrides, checked before PATH.
    overrides: BTreeMap<ToolTag, PathBuf>,
    /// Per-tag timeout overrides from the environment, seconds.
    env_timeouts: BTreeMap<ToolTag, Duration>,
    backoff: Option<BackoffConfig>,
    cancel: Option<CancelFlag>,
}

impl ToolAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `CHIRON_TOOL_TIMEOUT_<TAG>` overrides once at construction;
    /// the adapter is frozen for the run afterwards.
    pub fn from_env() -> Self {
        let mut adapter = Self::new();
        for tag in ToolTag::ALL {
            if let Ok(raw) = std::env::var(tag.timeout_env_var())
                && let Ok(secs) = raw.trim().parse::<u64>()
            {
                adapter
                    .env_timeouts
                    .insert(tag, Duration::from_secs(secs));
            }
        }
        adapter
    }

    pub fn with_override(mut self, tag: ToolTag, binary: impl Into<PathBuf>) -> Self {
        self.overrides.insert(tag, binary.into());
        self
    }

    /// Replace the transient-failure schedule (tests shrink the delays).
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Attach a run's cancel signal; in-flight invocations get a
    /// process-group SIGTERM, then SIGKILL after the grace period.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Resolve the executable for a tag: explicit override first, then
    /// PATH search.
    pub fn resolve_binary(&self, tag: ToolTag) -> Result<PathBuf, ToolError> {
        if let Some(path) = self.overrides.get(&tag) {
            if path.is_file() {
                return Ok(path.clone());
            }
            return Err(ToolError::Missing {
                tag,
                binary: path.display().to_string(),
                hint: tag.install_hint().to_string(),
            });
        }

        which::which(tag.default_binary()).map_err(|_| ToolError::Missing {
            tag,
            binary: tag.default_binary().to_string(),
            hint: tag.install_hint().to_string(),
        })
    }

    /// Effective timeout: tag default, raised (never lowered) by the
    /// environment knob and the caller's request.
    pub fn effective_timeout(&self, invocation: &ToolInvocation) -> Duration {
        let mut timeout = invocation.tag.default_timeout();
        if let Some(env) = self.env_timeouts.get(&invocation.tag) {
            timeout = timeout.max(*env);
        }
        if let Some(requested) = invocation.timeout {
            timeout = timeout.max(requested);
        }
        timeout
    }

    /// Run an invocation, retrying transient failures for retryable
    /// tags on the 1 s / 4 s / 16 s schedule.
    pub fn run(&self, invocation: ToolInvocation) -> Result<ToolRecord, ToolError> {
        let binary = self.resolve_binary(invocation.tag)?;
        let backoff = if invocation.tag.retryable() {
            self.backoff
                .clone()
                .unwrap_or_else(BackoffConfig::tool_transient)
        } else {
            BackoffConfig::no_retry()
        };

        let timeout = self.effective_timeout(&invocation);
        run_with_backoff(&backoff, |_attempt| {
            match execute_once(&binary, &invocation, timeout, self.cancel.as_ref()) {
                Ok(record) => Ok(record),
                Err(err @ ToolError::Transient { .. }) if invocation.tag.retryable() => {
                    Err(RetryDecision::Retry(err))
                }
                Err(err) => Err(RetryDecision::Stop(err)),
            }
        })
    }
}

fn execute_once(
    binary: &Path,
    invocation: &ToolInvocation,
    timeout: Duration,
    cancel: Option<&CancelFlag>,
) -> Result<ToolRecord, ToolError> {
    let tag = invocation.tag;
    let start = Instant::now();

    let mut command = Command::new(binary);
    command
        .args(&invocation.args)
        .current_dir(&invocation.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &invocation.env {
        command.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so a timeout kill reaches descendants.
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|source| ToolError::Spawn { tag, source })?;

    let deadline = start + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let record = ToolRecord {
                    tag,
                    exit: status.code().unwrap_or(-1),
                    stdout: read_pipe(child.stdout.take()),
                    stderr: read_pipe(child.stderr.take()),
                    duration: start.elapsed(),
                    killed_by_timeout: false,
                };
                return classify(record);
            }
            Ok(None) => {
                if cancel.is_some_and(|c| c.is_cancelled()) {
                    terminate_process_group(&mut child);
                    let grace_deadline = Instant::now() + CANCEL_GRACE;
                    while Instant::now() < grace_deadline {
                        if matches!(child.try_wait(), Ok(Some(_))) {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(25));
                    }
                    kill_process_group(&mut child);
                    let _ = child.wait();
                    return Err(ToolError::Cancelled { tag });
                }
                if Instant::now() >= deadline {
                    kill_process_group(&mut child);
                    let _ = child.wait();
                    let record = ToolRecord {
                        tag,
                        exit: -1,
                        stdout: read_pipe(child.stdout.take()),
                        stderr: read_pipe(child.stderr.take()),
                        duration: start.elapsed(),
                        killed_by_timeout: true,
                    };
                    return Err(ToolError::Timeout {
                        tag,
                        timeout,
                        record: Box::new(record),
                    });
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(source) => {
                let _ = child.kill();
                return Err(ToolError::Spawn { tag, source });
            }
        }
    }
}

fn classify(record: ToolRecord) -> Result<ToolRecord, ToolError> {
    if record.exit == 0 {
        return Ok(record);
    }
    let tag = record.tag;
    if looks_transient(&record) {
        Err(ToolError::Transient {
            tag,
            record: Box::new(record),
        })
    } else {
        Err(ToolError::NonZeroExit {
            tag,
            record: Box::new(record),
        })
    }
}

#[cfg(unix)]
fn kill_process_group(child: &mut std::process::Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if killpg(pgid, Signal::SIGKILL).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut std::process::Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn terminate_process_group(child: &mut std::process::Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(child.id() as i32);
    if killpg(pgid, Signal::SIGTERM).is_err() {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn terminate_process_group(child: &mut std::process::Child) {
    let _ = child.kill();
}

fn read_pipe<R: Read>(stream: Option<R>) -> String {
    let mut buffer = Vec::new();
    if let Some(mut s) = stream {
        let _ = s.read_to_end(&mut buffer);
    }
    String::from_utf8_lossy(&buffer).to_string()
}

/// Probe every tag's binary; used by `doctor` diagnostics.
pub fn probe_all(adapter: &ToolAdapter) -> Vec<(ToolTag, Result<PathBuf, String>)> {
    ToolTag::ALL
        .iter()
        .map(|tag| {
            let outcome = adapter
                .resolve_binary(*tag)
                .map_err(|e| e.to_string());
            (*tag, outcome)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_adapter(tag: ToolTag) -> ToolAdapter {
        // /bin/sh stands in for the real tool in adapter tests.
        ToolAdapter::new().with_override(tag, "/bin/sh")
    }

    fn sh(tag: ToolTag, script: &str) -> ToolInvocation {
        ToolInvocation::new(tag).args(["-c", script])
    }

    #[test]
    fn tags_have_expected_defaults() {
        assert_eq!(ToolTag::Resolve.default_timeout(), Duration::from_secs(300));
        assert_eq!(
            ToolTag::BuildWheel.default_timeout(),
            Duration::from_secs(1800)
        );
        assert_eq!(ToolTag::Sign.default_timeout(), Duration::from_secs(60));
        assert_eq!(ToolTag::Scan.default_timeout(), Duration::from_secs(180));
    }

    #[test]
    fn sign_and_build_are_not_retryable() {
        assert!(!ToolTag::Sign.retryable());
        assert!(!ToolTag::BuildWheel.retryable());
        assert!(ToolTag::Resolve.retryable());
        assert!(ToolTag::Scan.retryable());
    }

    #[test]
    fn timeout_env_var_names() {
        assert_eq!(
            ToolTag::Resolve.timeout_env_var(),
            "CHIRON_TOOL_TIMEOUT_RESOLVE"
        );
        assert_eq!(
            ToolTag::BuildWheel.timeout_env_var(),
            "CHIRON_TOOL_TIMEOUT_BUILD_WHEEL"
        );
    }

    #[test]
    fn missing_tool_error_names_binary_and_hint() {
        let adapter = ToolAdapter::new().with_override(
            ToolTag::Sbom,
            "/nonexistent/path/to/syft-binary",
        );
        let err = adapter
            .run(ToolInvocation::new(ToolTag::Sbom))
            .expect_err("must fail");
        match &err {
            ToolError::Missing { binary, hint, .. } => {
                assert!(binary.contains("syft-binary"));
                assert!(hint.contains("syft"));
            }
            other => panic!("expected Missing, got {other:?}"),
        }
        assert_eq!(err.category(), ErrorCategory::ToolMissing);
    }

    #[test]
    fn successful_run_captures_output() {
        let adapter = sh_adapter(ToolTag::Resolve);
        let record = adapter
            .run(sh(ToolTag::Resolve, "echo out; echo err >&2"))
            .expect("run");
        assert_eq!(record.exit, 0);
        assert_eq!(record.stdout.trim(), "out");
        assert_eq!(record.stderr.trim(), "err");
        assert!(!record.killed_by_timeout);
    }

    #[test]
    fn nonzero_exit_is_classified() {
        let adapter = sh_adapter(ToolTag::Resolve);
        let err = adapter
            .run(sh(ToolTag::Resolve, "echo broken >&2; exit 7"))
            .expect_err("must fail");
        match &err {
            ToolError::NonZeroExit { record, .. } => {
                assert_eq!(record.exit, 7);
                assert!(record.stderr.contains("broken"));
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
        assert_eq!(err.category(), ErrorCategory::ToolFailed);
    }

    #[test]
    fn transient_markers_trigger_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counter = dir.path().join("attempts");
        let script = format!(
            "echo x >> {c}; echo 'connection reset by peer' >&2; exit 1",
            c = counter.display()
        );

        let adapter = sh_adapter(ToolTag::Resolve).with_backoff(BackoffConfig {
            base_delay: Duration::from_millis(1),
            ..BackoffConfig::tool_transient().without_jitter()
        });
        let err = adapter
            .run(sh(ToolTag::Resolve, &script))
            .expect_err("must exhaust retries");
        assert!(matches!(err, ToolError::Transient { .. }));

        let attempts = std::fs::read_to_string(&counter).expect("attempt log");
        assert_eq!(attempts.lines().count(), 3, "expected 3 attempts");
    }

    #[test]
    fn sign_never_retries_even_when_transient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let counter = dir.path().join("attempts");
        let script = format!(
            "echo x >> {c}; echo '503 service unavailable' >&2; exit 1",
            c = counter.display()
        );

        let adapter = sh_adapter(ToolTag::Sign);
        let err = adapter.run(sh(ToolTag::Sign, &script)).expect_err("fails");
        // Non-retryable tags surface the transient classification as-is.
        assert!(matches!(err, ToolError::Transient { .. }));

        let attempts = std::fs::read_to_string(&counter).expect("attempt log");
        assert_eq!(attempts.lines().count(), 1, "sign must run exactly once");
    }

    #[test]
    fn timeout_kills_and_flags_record() {
        // Public timeouts only raise above the tag defaults, so the
        // single-execution path is exercised directly with a short
        // deadline.
        let adapter = sh_adapter(ToolTag::Sign);
        let binary = adapter.resolve_binary(ToolTag::Sign).expect("binary");
        let invocation = sh(ToolTag::Sign, "sleep 30");
        let err = execute_once(&binary, &invocation, Duration::from_millis(200), None);
        match err.expect_err("must time out") {
            ToolError::Timeout { record, .. } => {
                assert!(record.killed_by_timeout);
                assert_eq!(record.exit, -1);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn pre_cancelled_run_terminates_the_child() {
        let flag = CancelFlag::new();
        flag.cancel();
        let adapter = sh_adapter(ToolTag::Resolve).with_cancel(flag);

        let started = std::time::Instant::now();
        let err = adapter
            .run(sh(ToolTag::Resolve, "sleep 30"))
            .expect_err("cancelled");
        assert!(matches!(err, ToolError::Cancelled { .. }));
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "cancel must not wait out the sleep"
        );
    }

    #[test]
    fn effective_timeout_never_lowers_default() {
        let adapter = ToolAdapter::new();
        let invocation =
            ToolInvocation::new(ToolTag::Resolve).timeout(Duration::from_secs(10));
        assert_eq!(
            adapter.effective_timeout(&invocation),
            Duration::from_secs(300)
        );

        let raised = ToolInvocation::new(ToolTag::Resolve).timeout(Duration::from_secs(900));
        assert_eq!(adapter.effective_timeout(&raised), Duration::from_secs(900));
    }

    #[test]
    fn env_timeout_override_raises() {
        temp_env::with_var("CHIRON_TOOL_TIMEOUT_SCAN", Some("600"), || {
            let adapter = ToolAdapter::from_env();
            let invocation = ToolInvocation::new(ToolTag::Scan);
            assert_eq!(
                adapter.effective_timeout(&invocation),
                Duration::from_secs(600)
            );
        });
    }

    #[test]
    fn tool_record_serializes_with_millis_duration() {
        let record = ToolRecord {
            tag: ToolTag::Scan,
            exit: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1500),
            killed_by_timeout: false,
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains("\"tag\":\"scan\""));
        assert!(json.contains("\"duration\":1500"));
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let record = ToolRecord {
            tag: ToolTag::Resolve,
            exit: 1,
            stdout: String::new(),
            stderr: "one\ntwo\nthree\nfour".to_string(),
            duration: Duration::ZERO,
            killed_by_timeout: false,
        };
        assert_eq!(record.stderr_tail(2), "three\nfour");
    }

    #[test]
    fn probe_all_reports_each_tag() {
        let adapter = ToolAdapter::new()
            .with_override(ToolTag::Resolve, "/bin/sh")
            .with_override(ToolTag::Sbom, "/definitely/not/here");
        let probes = probe_all(&adapter);
        assert_eq!(probes.len(), ToolTag::ALL.len());
        let resolve = probes.iter().find(|(t, _)| *t == ToolTag::Resolve).unwrap();
        assert!(resolve.1.is_ok());
        let sbom = probes.iter().find(|(t, _)| *t == ToolTag::Sbom).unwrap();
        assert!(sbom.1.is_err());
    }
}
