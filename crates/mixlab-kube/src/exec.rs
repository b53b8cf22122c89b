//! Streaming command execution inside a running container.
//!
//! The exec API does not report the remote exit status, so commands are
//! wrapped to print a marker with `$?` last; the marker is parsed off the
//! end of stdout once the stream closes.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, AttachedProcess};
use kube::Client;
use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

pub const EXIT_MARKER_PATTERN: &str = r"__EXIT_CODE:(\d+)__\s*\z";
const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command still running; exit code not available")]
    Incomplete,
    #[error("exit code marker missing from end of output (tail: {tail:?})")]
    ParseError { tail: String },
    #[error("command did not finish within {0:?}")]
    Timeout(Duration),
    #[error("exit marker pattern: {0}")]
    Pattern(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Draining,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub container: Option<String>,
    pub capture_exit_code: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            container: None,
            capture_exit_code: true,
        }
    }
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// `sh -c "<cmd>; echo __EXIT_CODE:$?__"`
pub fn wrap_command(command: &[String]) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("{}; echo __EXIT_CODE:$?__", shell_join(command)),
    ]
}

fn exit_marker() -> Result<&'static Regex, ExecError> {
    static MARKER: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    MARKER
        .get_or_init(|| Regex::new(EXIT_MARKER_PATTERN))
        .as_ref()
        .map_err(|e| ExecError::Pattern(e.to_string()))
}

/// Splits a trailing exit marker off `text`. Only the final occurrence
/// counts; earlier markers are ordinary output.
pub fn split_exit_marker(text: &str) -> Result<Option<(&str, i32)>, ExecError> {
    let Some(caps) = exit_marker()?.captures(text) else {
        return Ok(None);
    };
    let (Some(whole), Some(code)) = (caps.get(0), caps.get(1)) else {
        return Ok(None);
    };
    match code.as_str().parse::<i32>() {
        Ok(code) => Ok(Some((&text[..whole.start()], code))),
        Err(_) => Ok(None),
    }
}

type Stream = Box<dyn AsyncRead + Send + Unpin>;

enum Chunk {
    Stdout(usize),
    Stderr(usize),
    Exhausted,
}

async fn read_chunk(stream: Option<&mut Stream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stream {
        Some(s) => s.read(buf).await,
        None => Ok(0),
    }
}

/// One command running in a pod. Output accumulates as the channel is
/// polled; the exit code is known once the channel is closed.
pub struct PodChannel {
    label: String,
    stdout: Option<Stream>,
    stderr: Option<Stream>,
    process: Option<AttachedProcess>,
    capture: bool,
    state: ChannelState,
    raw_stdout: Vec<u8>,
    raw_stderr: Vec<u8>,
    output: String,
    exit: Option<i32>,
    marker_missing: bool,
}

impl PodChannel {
    pub fn from_streams<O, E>(label: impl Into<String>, stdout: O, stderr: E, capture: bool) -> Self
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        Self::new(
            label.into(),
            Some(Box::new(stdout)),
            Some(Box::new(stderr)),
            None,
            capture,
        )
    }

    fn new(
        label: String,
        stdout: Option<Stream>,
        stderr: Option<Stream>,
        process: Option<AttachedProcess>,
        capture: bool,
    ) -> Self {
        Self {
            label,
            stdout,
            stderr,
            process,
            capture,
            state: ChannelState::Open,
            raw_stdout: Vec::new(),
            raw_stderr: Vec::new(),
            output: String::new(),
            exit: None,
            marker_missing: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    /// Stdout with the exit marker removed. Complete only once closed.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.raw_stderr).into_owned()
    }

    /// `None` when the channel was closed before the command reported.
    pub fn exit_code(&self) -> Result<Option<i32>, ExecError> {
        if self.state != ChannelState::Closed {
            return Err(ExecError::Incomplete);
        }
        if self.marker_missing {
            let tail: String = self
                .output
                .chars()
                .rev()
                .take(80)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            return Err(ExecError::ParseError { tail });
        }
        Ok(self.exit)
    }

    pub fn ok(&self) -> Result<bool, ExecError> {
        Ok(self.exit_code()? == Some(0))
    }

    /// Reads the next chunk from either stream. The channel is draining once
    /// one stream has reached EOF and closed once both have.
    pub async fn update_output(&mut self) -> Result<(), ExecError> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        let mut out_buf = [0u8; READ_CHUNK];
        let mut err_buf = [0u8; READ_CHUNK];
        let has_out = self.stdout.is_some();
        let has_err = self.stderr.is_some();
        let chunk = tokio::select! {
            read = read_chunk(self.stdout.as_mut(), &mut out_buf), if has_out => Chunk::Stdout(read?),
            read = read_chunk(self.stderr.as_mut(), &mut err_buf), if has_err => Chunk::Stderr(read?),
            else => Chunk::Exhausted,
        };
        match chunk {
            Chunk::Stdout(0) => self.stdout = None,
            Chunk::Stdout(n) => self.raw_stdout.extend_from_slice(&out_buf[..n]),
            Chunk::Stderr(0) => self.stderr = None,
            Chunk::Stderr(n) => self.raw_stderr.extend_from_slice(&err_buf[..n]),
            Chunk::Exhausted => {}
        }
        match (self.stdout.is_some(), self.stderr.is_some()) {
            (false, false) => self.finish()?,
            (true, true) => {}
            _ => self.state = ChannelState::Draining,
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ExecError> {
        let text = String::from_utf8_lossy(&self.raw_stdout).into_owned();
        if self.capture {
            match split_exit_marker(&text)? {
                Some((body, code)) => {
                    self.output = body.to_string();
                    self.exit = Some(code);
                }
                None => {
                    self.output = text;
                    self.marker_missing = true;
                }
            }
        } else {
            self.output = text;
            self.exit = Some(0);
        }
        self.process = None;
        self.state = ChannelState::Closed;
        debug!(channel = %self.label, exit = ?self.exit, "channel closed");
        Ok(())
    }

    /// Reads until the remote side closes or `timeout` elapses. On timeout
    /// the channel is closed and [`ExecError::Timeout`] returned.
    pub async fn collect_output(&mut self, timeout: Duration) -> Result<String, ExecError> {
        let deadline = Instant::now() + timeout;
        while self.state != ChannelState::Closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.update_output()).await {
                Ok(read) => read?,
                Err(_) => {
                    self.close();
                    return Err(ExecError::Timeout(timeout));
                }
            }
        }
        Ok(self.output.clone())
    }

    /// Like [`collect_output`](Self::collect_output) without a deadline,
    /// giving the scheduler a turn every `polling_interval` of silence.
    pub async fn collect_output_async(
        &mut self,
        polling_interval: Duration,
    ) -> Result<String, ExecError> {
        while self.state != ChannelState::Closed {
            match tokio::time::timeout(polling_interval, self.update_output()).await {
                Ok(read) => read?,
                Err(_) => tokio::task::yield_now().await,
            }
        }
        Ok(self.output.clone())
    }

    /// Idempotent. Keeps whatever exit code was already observed.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        if let Some(process) = self.process.take() {
            process.abort();
        }
        self.stdout = None;
        self.stderr = None;
        let text = String::from_utf8_lossy(&self.raw_stdout).into_owned();
        match split_exit_marker(&text) {
            Ok(Some((body, code))) if self.capture => {
                self.output = body.to_string();
                self.exit = Some(code);
            }
            _ => self.output = text,
        }
        self.state = ChannelState::Closed;
        debug!(channel = %self.label, "channel cancelled");
    }
}

impl Drop for PodChannel {
    fn drop(&mut self) {
        if let Some(process) = self.process.take() {
            process.abort();
        }
    }
}

/// Starts `command` in `pod` and returns the open channel.
pub async fn exec_in_pod(
    client: Client,
    namespace: &str,
    pod: &str,
    command: &[String],
    options: &ExecOptions,
) -> Result<PodChannel, ExecError> {
    let argv = if options.capture_exit_code {
        wrap_command(command)
    } else {
        command.to_vec()
    };
    let mut params = AttachParams::default()
        .stdin(false)
        .stdout(true)
        .stderr(true);
    if let Some(container) = &options.container {
        params = params.container(container.clone());
    }
    info!(namespace, pod, command = %shell_join(command), "exec in pod");
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let mut process = api.exec(pod, argv, &params).await?;
    let stdout = process.stdout().map(|s| Box::new(s) as Stream);
    let stderr = process.stderr().map(|s| Box::new(s) as Stream);
    Ok(PodChannel::new(
        format!("{}/{}", namespace, pod),
        stdout,
        stderr,
        Some(process),
        options.capture_exit_code,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(stdout: &'static [u8], capture: bool) -> PodChannel {
        PodChannel::from_streams("test", stdout, &b""[..], capture)
    }

    #[test]
    fn wraps_with_exit_marker() {
        let argv = wrap_command(&["/bin/sh".into(), "-c".into(), "false".into()]);
        assert_eq!(argv[0], "sh");
        assert_eq!(argv[1], "-c");
        assert_eq!(argv[2], "/bin/sh -c false; echo __EXIT_CODE:$?__");
        let quoted = wrap_command(&["echo".into(), "it's here".into()]);
        assert_eq!(quoted[2], "echo 'it'\"'\"'s here'; echo __EXIT_CODE:$?__");
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let mut ch = channel(b"__EXIT_CODE:1__\n", true);
        let out = ch.collect_output(Duration::from_secs(5)).await.expect("collect");
        assert_eq!(out, "");
        assert_eq!(ch.exit_code().expect("exit"), Some(1));
        assert!(!ch.ok().expect("ok"));
    }

    #[tokio::test]
    async fn only_trailing_marker_counts() {
        let mut ch = channel(b"line __EXIT_CODE:7__ inside\n__EXIT_CODE:0__\n", true);
        let out = ch
            .collect_output_async(Duration::from_millis(10))
            .await
            .expect("collect");
        assert_eq!(out, "line __EXIT_CODE:7__ inside\n");
        assert!(ch.ok().expect("ok"));
    }

    #[tokio::test]
    async fn missing_marker_is_a_parse_error() {
        let mut ch = channel(b"no marker here\n", true);
        ch.collect_output(Duration::from_secs(5)).await.expect("collect");
        assert!(matches!(ch.exit_code(), Err(ExecError::ParseError { .. })));
        assert!(ch.ok().is_err());
    }

    #[tokio::test]
    async fn uncaptured_exit_defaults_to_zero() {
        let mut ch = channel(b"plain\n", false);
        let out = ch.collect_output(Duration::from_secs(5)).await.expect("collect");
        assert_eq!(out, "plain\n");
        assert_eq!(ch.exit_code().expect("exit"), Some(0));
    }

    #[tokio::test]
    async fn exit_code_is_unavailable_while_open() {
        let ch = channel(b"__EXIT_CODE:0__\n", true);
        assert_eq!(ch.state(), ChannelState::Open);
        assert!(matches!(ch.exit_code(), Err(ExecError::Incomplete)));
    }

    #[tokio::test]
    async fn stderr_is_collected_separately() {
        let mut ch = PodChannel::from_streams(
            "test",
            &b"out\n__EXIT_CODE:2__\n"[..],
            &b"warning: something\n"[..],
            true,
        );
        ch.collect_output(Duration::from_secs(5)).await.expect("collect");
        assert_eq!(ch.output(), "out\n");
        assert_eq!(ch.stderr(), "warning: something\n");
        assert_eq!(ch.exit_code().expect("exit"), Some(2));
    }

    #[tokio::test]
    async fn drains_remaining_stream_after_first_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut ch = PodChannel::from_streams("drain", &b"__EXIT_CODE:0__\n"[..], reader, true);
        while ch.state() == ChannelState::Open {
            ch.update_output().await.expect("update");
        }
        assert_eq!(ch.state(), ChannelState::Draining);
        assert!(matches!(ch.exit_code(), Err(ExecError::Incomplete)));

        tokio::io::AsyncWriteExt::write_all(&mut writer, b"late\n")
            .await
            .expect("write");
        drop(writer);
        ch.collect_output(Duration::from_secs(5)).await.expect("collect");
        assert!(ch.is_closed());
        assert_eq!(ch.stderr(), "late\n");
        assert!(ch.ok().expect("ok"));
    }

    #[tokio::test]
    async fn timeout_closes_channel_without_exit_code() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut ch = PodChannel::from_streams("stuck", reader, &b""[..], true);
        let err = ch
            .collect_output(Duration::from_millis(50))
            .await
            .expect_err("should time out");
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(ch.is_closed());
        assert_eq!(ch.exit_code().expect("exit"), None);
        ch.close();
        assert!(ch.is_closed());
    }
}
