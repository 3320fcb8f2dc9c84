//! Output sink: fans event records to the console and the session log.
//!
//! Two producers (the stream consumer and the tool executor) may emit
//! concurrently; everything serializes through one mutex so console lines
//! never interleave mid-line. The console applies the verbosity filter,
//! the log gets every record with a millisecond timestamp.

use chrono::Local;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::STATE_DIR;

/// Record kinds carried by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Ai,
    Reason,
    Cmd,
    Out,
    Err,
}

impl RecordKind {
    fn label(self) -> &'static str {
        match self {
            RecordKind::Ai => "AI",
            RecordKind::Reason => "REASON",
            RecordKind::Cmd => "CMD",
            RecordKind::Out => "OUT",
            RecordKind::Err => "ERR",
        }
    }
}

struct SinkInner {
    silent: bool,
    log: Option<File>,
    log_path: Option<PathBuf>,
    closed: bool,
    /// Mid-stream flag for the AI streaming helpers
    streaming: bool,
}

/// Concurrent-safe event multiplexer. See module docs.
pub struct OutputSink {
    inner: Mutex<SinkInner>,
}

impl OutputSink {
    /// Console-only sink.
    pub fn new(silent: bool) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                silent,
                log: None,
                log_path: None,
                closed: false,
                streaming: false,
            }),
        }
    }

    /// Sink with a session log under `<basedir>/.rai/log/`. The file name
    /// encodes the session start time.
    pub fn with_log(silent: bool, base_dir: &Path) -> io::Result<Self> {
        let dir = base_dir.join(STATE_DIR).join("log");
        fs::create_dir_all(&dir)?;
        let name = format!("rai-log-{}.log", Local::now().format("%Y%m%d.%H%M%S"));
        let path = dir.join(name);
        let file = File::create(&path)?;

        Ok(Self {
            inner: Mutex::new(SinkInner {
                silent,
                log: Some(file),
                log_path: Some(path),
                closed: false,
                streaming: false,
            }),
        })
    }

    /// Path of the active log file, when logging is enabled.
    pub fn log_path(&self) -> Option<PathBuf> {
        self.lock().log_path.clone()
    }

    /// Write the session header block. Called once, before any records.
    pub fn write_header(&self, args: &[String], agent_content: Option<&str>, prompt: &str) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        let mut sorted = args.to_vec();
        sorted.sort();

        let mut header = String::new();
        header.push_str("=== RAI Session Log ===\n");
        header.push_str(&format!(
            "started: {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        ));
        header.push_str(&format!("args: {}\n", sorted.join(" ")));
        if let Some(agent) = agent_content {
            header.push_str("agent:\n");
            header.push_str(agent);
            if !agent.ends_with('\n') {
                header.push('\n');
            }
        }
        header.push_str(&format!("prompt: {prompt}\n"));
        header.push_str("--- Session Log ---\n");

        if let Some(log) = inner.log.as_mut() {
            let _ = log.write_all(header.as_bytes());
        }
    }

    /// Emit one record of the given kind.
    pub fn emit(&self, kind: RecordKind, text: &str) {
        let mut inner = self.lock();
        if !inner.silent || kind == RecordKind::Err {
            Self::console_line(kind, text);
        }
        Self::log_record(&mut inner, kind, text);
    }

    /// Emit the final answer. Reaches the console even in silent mode and
    /// is logged as an `AI` record.
    pub fn emit_final(&self, text: &str) {
        let mut inner = self.lock();
        Self::console_line(RecordKind::Ai, text);
        Self::log_record(&mut inner, RecordKind::Ai, text);
    }

    /// Start an in-line AI text stream: prints the `[AI] ` prefix once.
    /// No-op on console when silent.
    pub fn begin_ai_stream(&self) {
        let mut inner = self.lock();
        inner.streaming = true;
        if !inner.silent {
            print!("[AI] ");
            let _ = io::stdout().flush();
        }
    }

    /// Append one text delta to the in-flight AI stream. The console gets
    /// the raw chunk in-line; the log gets it as its own `AI` record.
    pub fn emit_ai_chunk(&self, chunk: &str) {
        let mut inner = self.lock();
        if !inner.silent && inner.streaming {
            print!("{chunk}");
            let _ = io::stdout().flush();
        }
        Self::log_record(&mut inner, RecordKind::Ai, chunk);
    }

    /// Finish the AI stream. Ensures the console line ends with a newline
    /// and logs the accumulated text as a single `AI` record.
    pub fn end_ai_stream(&self, final_text: &str) {
        let mut inner = self.lock();
        if !inner.silent && inner.streaming {
            if !final_text.ends_with('\n') {
                println!();
            }
            let _ = io::stdout().flush();
        }
        inner.streaming = false;
        Self::log_record(&mut inner, RecordKind::Ai, final_text);
    }

    /// Append a raw `DEBUG` line to the log only. Used by the HTTP debug
    /// recorder when `--log DEBUG` is active.
    pub fn append_debug(&self, text: &str) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        if let Some(log) = inner.log.as_mut() {
            let ts = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(log, "{ts} [DEBUG] {text}");
        }
    }

    /// Close the log. Idempotent; later emits still print to console but
    /// drop their log writes.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        if let Some(log) = inner.log.as_mut() {
            let _ = log.flush();
        }
        inner.log = None;
        inner.closed = true;
    }

    fn console_line(kind: RecordKind, text: &str) {
        match kind {
            RecordKind::Err => eprintln!("[{}] {}", kind.label(), text),
            _ => println!("[{}] {}", kind.label(), text),
        }
    }

    fn log_record(inner: &mut SinkInner, kind: RecordKind, text: &str) {
        if inner.closed {
            return;
        }
        if let Some(log) = inner.log.as_mut() {
            let ts = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(log, "{ts} [{}] {}", kind.label(), text);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn read_log(sink: &OutputSink) -> String {
        let path = sink.log_path().unwrap();
        sink.close();
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_log_records_have_kind_and_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::with_log(true, dir.path()).unwrap();
        sink.emit(RecordKind::Cmd, "echo hi");
        sink.emit(RecordKind::Out, "hi");

        let text = read_log(&sink);
        assert!(text.contains("[CMD] echo hi"));
        assert!(text.contains("[OUT] hi"));
        // Millisecond timestamp prefix, e.g. `2026-08-01 10:00:00.123`
        let first = text.lines().next().unwrap();
        assert_eq!(first.as_bytes()[4], b'-');
        assert!(first.contains('.'));
    }

    #[test]
    fn test_header_block() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::with_log(false, dir.path()).unwrap();
        sink.write_header(
            &["--log".to_string(), "--agent".to_string(), "a.md".to_string()],
            Some("agent body"),
            "what time is it",
        );
        sink.emit(RecordKind::Ai, "noon");

        let text = read_log(&sink);
        assert!(text.starts_with("=== RAI Session Log ===\n"));
        assert!(text.contains("args: --agent --log a.md\n"));
        assert!(text.contains("agent body"));
        assert!(text.contains("prompt: what time is it\n"));
        let header_end = text.find("--- Session Log ---").unwrap();
        let record = text.find("[AI] noon").unwrap();
        assert!(header_end < record);
    }

    #[test]
    fn test_silent_logs_chunks_and_final() {
        // Silent mode still logs every chunk; only the console is muted.
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::with_log(true, dir.path()).unwrap();
        sink.begin_ai_stream();
        sink.emit_ai_chunk("Hello");
        sink.emit_ai_chunk(" world");
        sink.emit_final("Hello world");

        let text = read_log(&sink);
        assert_eq!(text.matches("[AI]").count(), 3);
        assert!(text.contains("[AI] Hello world"));
    }

    #[test]
    fn test_close_is_idempotent_and_drops_log_writes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::with_log(true, dir.path()).unwrap();
        let path = sink.log_path().unwrap();
        sink.emit(RecordKind::Err, "first");
        sink.close();
        sink.close();
        sink.emit(RecordKind::Err, "after close");

        let text = fs::read_to_string(path).unwrap();
        assert!(text.contains("first"));
        assert!(!text.contains("after close"));
    }

    #[test]
    fn test_concurrent_emits_keep_line_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(OutputSink::with_log(true, dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        sink.emit(RecordKind::Out, &format!("worker-{i}-line-{j}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let text = read_log(&sink);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 8 * 50);
        for line in lines {
            assert!(line.contains("[OUT] worker-"), "mangled line: {line}");
            assert!(line.ends_with(|c: char| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_ai_stream_logs_chunks_then_final() {
        let dir = tempfile::tempdir().unwrap();
        let sink = OutputSink::with_log(true, dir.path()).unwrap();
        sink.begin_ai_stream();
        sink.emit_ai_chunk("Hello");
        sink.emit_ai_chunk(" world");
        sink.end_ai_stream("Hello world");

        let text = read_log(&sink);
        // Two chunk records plus the accumulated final
        assert_eq!(text.matches("[AI]").count(), 3);
        assert!(text.contains("[AI] Hello world"));
    }
}
