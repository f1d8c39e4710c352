//! Interactive execution sessions keyed by language.
//!
//! Each language key owns at most one live [`Session`]: a child process whose
//! stdin receives wrapped code and whose stdout/stderr lines are forwarded by
//! reader threads into a single channel. A call resolves on the first of:
//! the end-of-execution sentinel, stream close, the abort flag (polled), or
//! the timeout (which interrupts the child and waits a short grace period).
//! Neither abort nor timeout kills the process.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::CancelToken;
use crate::io::config::AgentConfig;

pub const SESSION_ERROR_NOTICE: &str =
    "[[Error while executing code. Resetting code session. Make sure to rerun the code.]]";
pub const TERMINATED_BY_USER_NOTICE: &str = "[[Execution terminated by user]]";
pub const NON_ZERO_EXIT_NOTICE: &str = "[[Execution terminated with non-zero exit code]]";
pub const ABORTED_NOTICE: &str = "[[Waiting for the command execution was aborted by user. The command is still running in the background.]]";

const SENTINEL_PREFIX: &str = "##end_of_execution";
const SKIP_MARKER: &str = "##skip##";

/// Supported execution languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Shell,
    Cmd,
    Python,
}

impl Language {
    pub const AVAILABLE: [&'static str; 5] = ["sh", "shell", "cmd", "python", "py"];

    pub fn parse(key: &str) -> Option<Self> {
        match key.trim().to_ascii_lowercase().as_str() {
            "sh" | "shell" => Some(Self::Shell),
            "cmd" => Some(Self::Cmd),
            "python" | "py" => Some(Self::Python),
            _ => None,
        }
    }

    /// The language `RUN_SHELL_COMMAND` targets on this host.
    pub fn host_shell() -> Self {
        if cfg!(windows) { Self::Cmd } else { Self::Shell }
    }

    /// Registry key shared by every alias of the language.
    pub fn key(self) -> &'static str {
        match self {
            Self::Shell => "sh",
            Self::Cmd => "cmd",
            Self::Python => "python",
        }
    }

    /// Shell-class sessions are replaced on every call.
    pub fn recreated_per_call(self) -> bool {
        matches!(self, Self::Shell | Self::Cmd)
    }

    fn command(self) -> Command {
        match self {
            Self::Shell => Command::new("sh"),
            Self::Cmd => {
                let mut cmd = Command::new("cmd");
                cmd.args(["/Q", "/K"]);
                cmd
            }
            Self::Python => {
                let mut cmd = Command::new("python3");
                cmd.args(["-u", "-i", "-q"]);
                cmd
            }
        }
    }

    fn wrap(self, code: &str, workdir: &Path, sentinel: &str) -> Result<String> {
        let dir = workdir.display();
        Ok(match self {
            Self::Shell => format!("cd \"{dir}\"\n{code}\necho \"{sentinel}\"\n"),
            Self::Cmd => format!("@echo off\ncd /d \"{dir}\"\n{code}\necho {sentinel}\n"),
            Self::Python => {
                let dir = serde_json::to_string(&workdir.to_string_lossy())
                    .context("encode working directory")?;
                let code = serde_json::to_string(code).context("encode python code")?;
                format!(
                    "import os as _agent_os; _agent_os.chdir({dir})\nexec({code})\nprint(\"{sentinel}\")\n"
                )
            }
        })
    }
}

fn unsupported_language(key: &str) -> anyhow::Error {
    anyhow!(
        "Unsupported language: {key}. Available languages: {}. Use the WRITE_FILE and MERGE_FILE commands to save your code to a file, then use RUN_SHELL_COMMAND to run the file.",
        Language::AVAILABLE.join(", ")
    )
}

enum OutputEvent {
    Line(String),
    Closed,
}

/// A live interactive process bound to one language.
struct Session {
    language: Language,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    events: Mutex<Receiver<OutputEvent>>,
    abort: CancelToken,
    exited: AtomicBool,
}

impl Session {
    fn spawn(language: Language) -> Result<Self> {
        let mut cmd = language.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {} session", language.key()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, rx) = mpsc::channel();
        let strip_prompts = language == Language::Python;
        forward_lines(stdout, tx.clone(), false);
        forward_lines(stderr, tx, strip_prompts);

        debug!(language = language.key(), pid = child.id(), "spawned session");
        Ok(Self {
            language,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            events: Mutex::new(rx),
            abort: CancelToken::new(),
            exited: AtomicBool::new(false),
        })
    }

    /// True once the process has closed its output streams and been reaped.
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn run(&self, code: &str, sentinel: &str, limits: &Limits) -> Result<String> {
        self.abort.take();
        let events = lock(&self.events)?;
        // Output left over from an earlier aborted or timed-out call.
        while events.try_recv().is_ok() {}

        {
            let mut stdin = lock(&self.stdin)?;
            stdin
                .write_all(code.as_bytes())
                .context("write code to session")?;
            stdin.flush().context("flush session stdin")?;
        }

        let deadline = Instant::now() + limits.timeout;
        let mut output = String::new();
        let mut open_streams = 2;
        loop {
            if self.abort.is_cancelled() {
                debug!(language = self.language.key(), "execution wait aborted");
                return Ok(format!("{output}\n\n{ABORTED_NOTICE}"));
            }
            let now = Instant::now();
            if now >= deadline {
                self.interrupt();
                thread::sleep(limits.grace);
                while let Ok(OutputEvent::Line(line)) = events.try_recv() {
                    if push_line(&mut output, &line, sentinel) {
                        return Ok(output);
                    }
                }
                warn!(
                    language = self.language.key(),
                    timeout_secs = limits.timeout.as_secs_f64(),
                    "execution timed out"
                );
                return Ok(format!(
                    "{output}\n\n[[Execution timed out after {} sec. The command is still running in the background.]]\n",
                    limits.timeout.as_secs_f64()
                ));
            }

            match events.recv_timeout(limits.poll.min(deadline - now)) {
                Ok(OutputEvent::Line(line)) => {
                    if push_line(&mut output, &line, sentinel) {
                        return Ok(output);
                    }
                }
                Ok(OutputEvent::Closed) => {
                    open_streams -= 1;
                    if open_streams == 0 {
                        return self.finish_closed(output);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.finish_closed(output),
            }
        }
    }

    fn finish_closed(&self, output: String) -> Result<String> {
        let status = lock(&self.child)?.wait().context("wait for session exit")?;
        self.exited.store(true, Ordering::SeqCst);
        debug!(language = self.language.key(), status = ?status.code(), "session exited");
        Ok(annotate_exit(output, status, self.abort.is_cancelled()))
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Ok(child) = self.child.lock() else {
            return;
        };
        let Ok(pid) = i32::try_from(child.id()) else {
            return;
        };
        if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGINT) {
            warn!(err = %err, pid, "failed to interrupt session");
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {
        if let Ok(mut child) = self.child.lock()
            && let Err(err) = child.kill()
        {
            warn!(err = %err, "failed to interrupt session");
        }
    }
}

fn annotate_exit(output: String, status: ExitStatus, aborted: bool) -> String {
    if aborted {
        format!("{output}\n\n{TERMINATED_BY_USER_NOTICE}")
    } else if !status.success() {
        format!("{output}\n\n{NON_ZERO_EXIT_NOTICE}")
    } else {
        output
    }
}

/// Append one output line. Returns true when the line carries the sentinel;
/// text printed before it without a trailing newline is kept.
fn push_line(output: &mut String, line: &str, sentinel: &str) -> bool {
    if let Some(pos) = line.find(sentinel) {
        let before = &line[..pos];
        if !before.contains(SKIP_MARKER) {
            output.push_str(before);
        }
        return true;
    }
    if !line.contains(SKIP_MARKER) {
        output.push_str(line);
        output.push('\n');
    }
    false
}

fn forward_lines<R: Read + Send + 'static>(reader: R, tx: Sender<OutputEvent>, strip_prompts: bool) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let mut line = text.trim_end_matches(['\n', '\r']);
                    if strip_prompts {
                        line = strip_repl_prompts(line);
                    }
                    if tx.send(OutputEvent::Line(line.to_string())).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(OutputEvent::Closed);
    });
}

fn strip_repl_prompts(mut line: &str) -> &str {
    while let Some(rest) = line
        .strip_prefix(">>> ")
        .or_else(|| line.strip_prefix("... "))
    {
        line = rest;
    }
    line
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("session lock poisoned"))
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    timeout: Duration,
    poll: Duration,
    grace: Duration,
}

/// Registry of live sessions, one per language key.
pub struct ExecutionEngine {
    workdir: Mutex<PathBuf>,
    limits: Limits,
    sessions: Mutex<HashMap<&'static str, Arc<Session>>>,
    calls: AtomicU64,
}

impl ExecutionEngine {
    pub fn new(workdir: impl Into<PathBuf>, config: &AgentConfig) -> Self {
        Self {
            workdir: Mutex::new(workdir.into()),
            limits: Limits {
                timeout: config.execution_timeout(),
                poll: config.abort_poll_interval(),
                grace: config.interrupt_grace(),
            },
            sessions: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn workdir(&self) -> PathBuf {
        self.workdir
            .lock()
            .map(|dir| dir.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn set_workdir(&self, workdir: impl Into<PathBuf>) {
        let workdir = workdir.into();
        match self.workdir.lock() {
            Ok(mut dir) => *dir = workdir,
            Err(poisoned) => *poisoned.into_inner() = workdir,
        }
    }

    /// Run `code` with the configured timeout.
    pub fn execute(&self, language_key: &str, code: &str) -> String {
        self.execute_with_timeout(language_key, code, self.limits.timeout)
    }

    /// Run `code` in the session for `language_key`.
    ///
    /// Never fails: faults discard the session and return a diagnostic.
    #[instrument(skip(self, code), fields(code_len = code.len()))]
    pub fn execute_with_timeout(&self, language_key: &str, code: &str, timeout: Duration) -> String {
        let result = Language::parse(language_key)
            .ok_or_else(|| unsupported_language(language_key))
            .and_then(|language| {
                let session = self.session_for(language)?;
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                let sentinel = format!("{SENTINEL_PREFIX}_{call}##");
                let wrapped = language.wrap(code, &self.workdir(), &sentinel)?;
                let limits = Limits {
                    timeout,
                    ..self.limits
                };
                let result = session.run(&wrapped, &sentinel, &limits);
                if result.is_err() || session.has_exited() {
                    self.discard(language);
                }
                result
            });
        match result {
            Ok(output) => output,
            Err(err) => {
                warn!(language = language_key, err = %err, "session fault");
                format!("{SESSION_ERROR_NOTICE} \n\n{err:#}")
            }
        }
    }

    /// Stop waiting on the current call for `language_key`. The process keeps running.
    pub fn abort(&self, language_key: &str) {
        let Some(language) = Language::parse(language_key) else {
            return;
        };
        if let Ok(sessions) = self.sessions.lock()
            && let Some(session) = sessions.get(language.key())
        {
            session.abort.cancel();
        }
    }

    pub fn abort_all(&self) {
        if let Ok(sessions) = self.sessions.lock() {
            for session in sessions.values() {
                session.abort.cancel();
            }
        }
    }

    /// Drop every session; their processes see stdin close.
    pub fn reset(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.clear();
        }
    }

    fn session_for(&self, language: Language) -> Result<Arc<Session>> {
        let mut sessions = lock(&self.sessions)?;
        if !language.recreated_per_call()
            && let Some(existing) = sessions.get(language.key())
        {
            return Ok(Arc::clone(existing));
        }
        sessions.remove(language.key());
        let session = Arc::new(Session::spawn(language)?);
        sessions.insert(language.key(), Arc::clone(&session));
        Ok(session)
    }

    fn discard(&self, language: Language) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(language.key());
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn engine(dir: &Path) -> ExecutionEngine {
        ExecutionEngine::new(dir, &AgentConfig::default())
    }

    fn python_available() -> bool {
        Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[test]
    fn shell_output_excludes_the_sentinel() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = engine(temp.path()).execute("sh", "echo hello");
        assert_eq!(output, "hello\n");
    }

    #[test]
    fn shell_runs_in_the_working_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        engine(temp.path()).execute("shell", "touch marker.txt");
        assert!(temp.path().join("marker.txt").exists());
    }

    #[test]
    fn stderr_is_interleaved_into_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = engine(temp.path()).execute("sh", "echo oops 1>&2");
        assert!(output.contains("oops"));
    }

    #[test]
    fn early_exit_is_annotated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = engine(temp.path()).execute("sh", "echo partial\nexit 3");
        assert!(output.starts_with("partial\n"));
        assert!(output.ends_with(NON_ZERO_EXIT_NOTICE));
    }

    #[test]
    fn timeout_returns_partial_output_with_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = engine(temp.path()).execute_with_timeout(
            "sh",
            "echo started\nsleep 5",
            Duration::from_millis(300),
        );
        assert!(output.starts_with("started\n"));
        assert!(output.contains("[[Execution timed out after 0.3 sec."));
    }

    #[test]
    fn abort_resolves_without_waiting_for_completion() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(engine(temp.path()));
        let aborter = Arc::clone(&engine);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            aborter.abort("sh");
        });
        let started = Instant::now();
        let output = engine.execute("sh", "sleep 5");
        handle.join().expect("join");
        assert!(output.ends_with(ABORTED_NOTICE));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn unsupported_language_returns_diagnostic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = engine(temp.path()).execute("cobol", "DISPLAY 'HI'");
        assert!(output.starts_with(SESSION_ERROR_NOTICE));
        assert!(output.contains("Unsupported language: cobol"));
        assert!(output.contains("sh, shell, cmd, python, py"));
    }

    #[test]
    fn python_session_keeps_state_between_calls() {
        if !python_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine(temp.path());
        engine.execute("python", "x = 41\ndef bump(v):\n    return v + 1\n");
        let output = engine.execute("py", "print(bump(x))");
        assert_eq!(output.trim(), "42");
    }

    #[test]
    fn output_without_trailing_newline_is_kept() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("a.txt"), "hello").expect("write");
        let engine = engine(temp.path());
        assert_eq!(engine.execute("sh", "cat a.txt"), "hello");
        assert_eq!(engine.execute("sh", "echo first\nprintf second"), "first\nsecond");
    }

    #[test]
    fn sentinel_line_keeps_the_text_before_it() {
        let mut output = String::new();
        assert!(!push_line(&mut output, "one", "##end##"));
        assert!(push_line(&mut output, "two##end##", "##end##"));
        assert_eq!(output, "one\ntwo");
    }

    #[test]
    fn exited_python_session_is_replaced_on_the_next_call() {
        if !python_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = engine(temp.path());
        engine.execute("python", "import sys\nsys.exit(0)");
        let output = engine.execute("python", "print(6 * 7)");
        assert_eq!(output.trim(), "42");
    }

    #[test]
    fn python_prompts_are_stripped() {
        assert_eq!(strip_repl_prompts(">>> >>> Traceback"), "Traceback");
        assert_eq!(strip_repl_prompts("... x"), "x");
        assert_eq!(strip_repl_prompts("plain"), "plain");
    }

    #[test]
    fn language_aliases_share_a_key() {
        assert_eq!(Language::parse("SH"), Some(Language::Shell));
        assert_eq!(Language::parse("shell").map(Language::key), Some("sh"));
        assert_eq!(Language::parse("py").map(Language::key), Some("python"));
        assert!(Language::parse("ruby").is_none());
    }
}
