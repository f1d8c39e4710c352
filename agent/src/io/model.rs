//! Chat-completion transports and the retrying call wrapper.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::Command;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::backoff::retry_delay;
use crate::core::conversation::ChatMessage;
use crate::core::types::CancelToken;
use crate::io::config::{AgentConfig, ProviderKind, RetryConfig};
use crate::io::process::run_command_with_timeout;

const COMMAND_OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// One chat-completion call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A chat-completion backend.
///
/// Implementations return the full reply text. They should stop early (and
/// may return partial text) once `cancel` trips; callers discard replies
/// produced under cancellation.
pub trait ChatModel: Send + Sync {
    fn complete(&self, request: &ChatRequest, cancel: &CancelToken) -> Result<String>;

    /// True when the transport already prints reply text to stdout while streaming.
    fn echoes(&self) -> bool {
        false
    }
}

/// OpenAI-compatible streaming chat completions.
pub struct OpenAiChatModel {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    /// Longest silence tolerated on an open stream.
    idle_timeout: Duration,
    echo: bool,
}

#[derive(Debug, Serialize)]
struct StreamingBody<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChatModel {
    /// `timeout` bounds connecting and each gap between streamed lines, not
    /// the length of the whole reply.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(None::<Duration>)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            idle_timeout: timeout,
            echo: true,
        })
    }

    /// Disable echoing streamed deltas to stdout.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }
}

impl ChatModel for OpenAiChatModel {
    fn echoes(&self) -> bool {
        self.echo
    }

    #[instrument(skip_all, fields(model = %request.model, messages = request.messages.len()))]
    fn complete(&self, request: &ChatRequest, cancel: &CancelToken) -> Result<String> {
        let mut builder = self.client.post(&self.endpoint).json(&StreamingBody {
            request,
            stream: true,
        });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .context("send chat request")?
            .error_for_status()
            .context("chat request rejected")?;

        read_stream(response, cancel, self.idle_timeout, |delta| {
            if self.echo {
                let mut stdout = std::io::stdout();
                let _ = write!(stdout, "{delta}");
                let _ = stdout.flush();
            }
        })
        .inspect(|_| {
            if self.echo {
                println!();
            }
        })
    }
}

/// Collect the content deltas of an SSE body.
///
/// Lines are read on a helper thread so a cancel is noticed within
/// [`SLEEP_SLICE`] even while the server is silent. A gap longer than
/// `idle_timeout` is an error.
fn read_stream<R, F>(body: R, cancel: &CancelToken, idle_timeout: Duration, mut on_delta: F) -> Result<String>
where
    R: Read + Send + 'static,
    F: FnMut(&str),
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(body).lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                return;
            }
        }
    });

    let mut reply = String::new();
    let mut last_line = Instant::now();
    loop {
        if cancel.is_cancelled() {
            debug!("model stream cancelled");
            break;
        }
        let line = match rx.recv_timeout(SLEEP_SLICE) {
            Ok(line) => line.context("read chat stream")?,
            Err(RecvTimeoutError::Timeout) => {
                if last_line.elapsed() >= idle_timeout {
                    return Err(anyhow!(
                        "chat stream idle for {} sec",
                        idle_timeout.as_secs_f64()
                    ));
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        last_line = Instant::now();
        if let Some(delta) = parse_sse_line(&line)? {
            on_delta(&delta);
            reply.push_str(&delta);
        } else if line.trim() == "data: [DONE]" {
            break;
        }
    }
    Ok(reply)
}

/// Content delta carried by one SSE line, if any.
fn parse_sse_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(None);
    };
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let chunk: StreamChunk = serde_json::from_str(data).context("parse chat stream chunk")?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

/// A local command that reads the request JSON on stdin and prints the reply.
pub struct CommandChatModel {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandChatModel {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("chat model command must be non-empty"));
        }
        Ok(Self { argv, timeout })
    }
}

impl ChatModel for CommandChatModel {
    #[instrument(skip_all, fields(model = %request.model, program = %self.argv[0]))]
    fn complete(&self, request: &ChatRequest, _cancel: &CancelToken) -> Result<String> {
        let input = serde_json::to_vec(request).context("serialize chat request")?;
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        let output = run_command_with_timeout(
            cmd,
            Some(&input),
            self.timeout,
            COMMAND_OUTPUT_LIMIT_BYTES,
        )?;
        if output.timed_out {
            return Err(anyhow!(
                "chat model command timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "chat model command failed ({}): {}",
                output.status,
                output.stderr_text().trim()
            ));
        }
        Ok(output.stdout_text())
    }
}

/// Build the configured transport. `echo` streams reply text to stdout as it arrives.
pub fn build_chat_model(config: &AgentConfig, echo: bool) -> Result<Box<dyn ChatModel>> {
    let provider = &config.provider;
    let timeout = Duration::from_secs(provider.request_timeout_secs);
    Ok(match provider.kind {
        ProviderKind::Openai => {
            let api_key = env::var(&provider.api_key_env).ok();
            if api_key.is_none() {
                warn!(env = %provider.api_key_env, "api key not set, sending unauthenticated requests");
            }
            let model = OpenAiChatModel::new(&provider.base_url, api_key, timeout)?;
            Box::new(if echo { model } else { model.quiet() })
        }
        ProviderKind::Command => Box::new(CommandChatModel::new(provider.command.clone(), timeout)?),
    })
}

/// Sleep for `duration` in short slices, returning early once `cancel` trips.
pub fn cancellable_sleep(duration: Duration, cancel: &CancelToken) {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// Call `model` until it succeeds, backing off exponentially between failures.
///
/// Returns `None` if `cancel` trips before a reply is obtained; a reply that
/// completes under cancellation is discarded too.
pub fn call_with_retry(
    model: &dyn ChatModel,
    request: &ChatRequest,
    cancel: &CancelToken,
    retry: &RetryConfig,
) -> Option<String> {
    call_with_retry_using(model, request, cancel, retry, |delay| {
        cancellable_sleep(delay, cancel);
    })
}

/// [`call_with_retry`] with an injectable sleep.
pub fn call_with_retry_using<S: FnMut(Duration)>(
    model: &dyn ChatModel,
    request: &ChatRequest,
    cancel: &CancelToken,
    retry: &RetryConfig,
    mut sleep: S,
) -> Option<String> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        attempt = attempt.saturating_add(1);
        match model.complete(request, cancel) {
            Ok(reply) => {
                if cancel.is_cancelled() {
                    debug!("discarding reply completed under cancellation");
                    return None;
                }
                return Some(reply);
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return None;
                }
                let delay = retry_delay(attempt, retry.base_delay(), retry.max_delay());
                warn!(
                    attempt,
                    delay_secs = delay.as_secs_f64(),
                    err = %err,
                    "model call failed, retrying"
                );
                sleep(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::core::conversation::{Message, Role};

    struct FlakyModel {
        failures: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl ChatModel for FlakyModel {
        fn complete(&self, _request: &ChatRequest, _cancel: &CancelToken) -> Result<String> {
            let mut calls = self.calls.lock().expect("lock");
            *calls += 1;
            let mut failures = self.failures.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(anyhow!("connection reset"));
            }
            Ok(format!("reply from attempt {calls}"))
        }
    }

    /// Yields `head` once, then blocks on every read.
    struct StalledBody {
        head: Option<Vec<u8>>,
    }

    impl Read for StalledBody {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if let Some(head) = self.head.take() {
                buf[..head.len()].copy_from_slice(&head);
                return Ok(head.len());
            }
            thread::sleep(Duration::from_secs(5));
            Ok(0)
        }
    }

    fn stalled(head: &str) -> StalledBody {
        StalledBody {
            head: Some(head.as_bytes().to_vec()),
        }
    }

    #[test]
    fn stream_collects_deltas_until_done() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                    data: [DONE]\n";
        let mut seen = Vec::new();
        let reply = read_stream(
            std::io::Cursor::new(body.as_bytes().to_vec()),
            &CancelToken::new(),
            Duration::from_secs(5),
            |delta| seen.push(delta.to_string()),
        )
        .expect("stream");
        assert_eq!(reply, "Hello");
        assert_eq!(seen, vec!["Hel", "lo"]);
    }

    #[test]
    fn long_streams_are_not_cut_off_while_lines_keep_arriving() {
        let lines: String = (0..5)
            .map(|_| "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n")
            .collect();
        struct Trickle(std::io::Cursor<Vec<u8>>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                thread::sleep(Duration::from_millis(60));
                let n = buf.len().min(20);
                self.0.read(&mut buf[..n])
            }
        }
        let body = Trickle(std::io::Cursor::new(lines.into_bytes()));
        let reply = read_stream(body, &CancelToken::new(), Duration::from_millis(500), |_| {})
            .expect("stream");
        assert_eq!(reply, "xxxxx");
    }

    #[test]
    fn cancel_interrupts_a_silent_stream() {
        let cancel = CancelToken::new();
        let trip = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trip.cancel();
        });
        let started = Instant::now();
        let reply = read_stream(
            stalled("data: {\"choices\":[{\"delta\":{\"content\":\"partial\"}}]}\n"),
            &cancel,
            Duration::from_secs(30),
            |_| {},
        )
        .expect("stream");
        handle.join().expect("join");
        assert_eq!(reply, "partial");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn silent_stream_fails_after_idle_timeout() {
        let err = read_stream(
            stalled("data: {\"choices\":[]}\n"),
            &CancelToken::new(),
            Duration::from_millis(200),
            |_| {},
        )
        .expect_err("idle stream");
        assert!(err.to_string().contains("chat stream idle"));
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::user("hi").to_chat()],
            temperature: 0.0,
            stop: vec!["[[OBSERVE]]".to_string()],
        }
    }

    #[test]
    fn retries_until_success_with_doubling_delays() {
        let model = FlakyModel {
            failures: Mutex::new(2),
            calls: Mutex::new(0),
        };
        let mut waits = Vec::new();
        let reply = call_with_retry_using(
            &model,
            &request(),
            &CancelToken::new(),
            &RetryConfig::default(),
            |delay| waits.push(delay),
        );
        assert_eq!(reply.as_deref(), Some("reply from attempt 3"));
        assert_eq!(waits, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert_eq!(waits.iter().sum::<Duration>(), Duration::from_secs(3));
    }

    #[test]
    fn cancellation_during_backoff_returns_none() {
        let model = FlakyModel {
            failures: Mutex::new(u32::MAX),
            calls: Mutex::new(0),
        };
        let cancel = CancelToken::new();
        let reply = call_with_retry_using(
            &model,
            &request(),
            &cancel,
            &RetryConfig::default(),
            |_| cancel.cancel(),
        );
        assert!(reply.is_none());
        assert_eq!(*model.calls.lock().expect("lock"), 1);
    }

    #[test]
    fn cancellable_sleep_returns_early() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let started = Instant::now();
        cancellable_sleep(Duration::from_secs(5), &cancel);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sse_lines_yield_content_deltas() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(parse_sse_line(line).expect("parse").as_deref(), Some("Hel"));
        assert_eq!(parse_sse_line("data: [DONE]").expect("parse"), None);
        assert_eq!(parse_sse_line(": keep-alive").expect("parse"), None);
        let role_only = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(role_only).expect("parse"), None);
    }

    #[test]
    fn request_serializes_with_stream_flag() {
        let body = serde_json::to_value(StreamingBody {
            request: &request(),
            stream: true,
        })
        .expect("serialize");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stop"][0], "[[OBSERVE]]");
        assert_eq!(body["messages"][0]["role"], Role::User.as_str());
    }

    #[cfg(unix)]
    #[test]
    fn command_model_reads_reply_from_stdout() {
        let model = CommandChatModel::new(
            vec!["sh".to_string(), "-c".to_string(), "cat >/dev/null; printf done".to_string()],
            Duration::from_secs(5),
        )
        .expect("model");
        let reply = model.complete(&request(), &CancelToken::new()).expect("reply");
        assert_eq!(reply, "done");
    }
}
