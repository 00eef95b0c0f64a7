//! Execution options and the plan log sink.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Line-oriented log sink for the human-readable plan log.
///
/// Remediation and note lines carry fixed prefixes that post-mortem tools
/// parse; they are part of the external contract.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Sink writing to process stdout.
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// In-memory sink plus a capture handle, for tests and post-mortems.
    pub fn capture() -> (Self, LogCapture) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let capture = LogCapture { buf: buf.clone() };
        (Self::new(Box::new(SharedBuf { buf })), capture)
    }

    /// Write one log line.
    pub fn line(&self, msg: &str) {
        if let Ok(mut w) = self.inner.lock() {
            let _ = writeln!(w, "{msg}");
            let _ = w.flush();
        }
    }

    /// Contract line: a remediation arm took an action.
    pub fn remediation(&self, msg: &str) {
        self.line(&format!("[maker] remediation attempted: {msg}"));
    }

    /// Contract line: non-fatal diagnostic.
    pub fn note(&self, msg: &str) {
        self.line(&format!("[maker] note: {msg}"));
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::stdout()
    }
}

impl std::fmt::Debug for LogSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LogSink")
    }
}

struct SharedBuf {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().expect("log buffer").extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Read side of [`LogSink::capture`].
#[derive(Clone)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Everything written so far, lossily decoded.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().expect("log buffer")).into_owned()
    }
}

/// Configuration passed through the whole engine.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// AWS CLI profile; empty means the CLI default chain.
    pub profile: String,

    /// AWS region; empty means the CLI default chain.
    pub region: String,

    /// Permits destructive verbs and destructive remediations.
    /// When false, validation fails closed on any destructive token.
    pub destroyer: bool,

    /// LLM provider selector (e.g. "openai").
    pub ai_provider: String,

    /// API key for the LLM provider.
    pub ai_api_key: String,

    /// Model identifier for the LLM provider.
    pub ai_profile: String,

    /// Verbose engine diagnostics.
    pub debug: bool,

    /// GCP project for the gcloud path.
    pub gcp_project: String,

    /// When false, sensitive-looking bindings are forwarded to the LLM
    /// (opt-out via CLANKER_SAFE_LLM_BINDINGS, read once at startup).
    pub safe_llm_bindings: bool,

    /// Human-readable plan log.
    pub log: LogSink,

    /// Cancellation for subprocesses and sleeps.
    pub cancel: CancellationToken,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            profile: String::new(),
            region: String::new(),
            destroyer: false,
            ai_provider: String::new(),
            ai_api_key: String::new(),
            ai_profile: String::new(),
            debug: false,
            gcp_project: String::new(),
            safe_llm_bindings: true,
            log: LogSink::stdout(),
            cancel: CancellationToken::new(),
        }
    }
}

impl ExecOptions {
    /// Read the one process-wide LLM-binding safety flag.
    ///
    /// Called once while constructing options; deep call sites only ever see
    /// the `safe_llm_bindings` field. Values `0`, `false`, `off` disable the
    /// redaction.
    pub fn detect_safe_llm_bindings() -> bool {
        match std::env::var("CLANKER_SAFE_LLM_BINDINGS") {
            Ok(v) => {
                let v = v.trim().to_lowercase();
                !(v == "0" || v == "false" || v == "off")
            }
            Err(_) => true,
        }
    }
}
