use std::{
    future::Future,
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncSeekExt as _, BufReader},
};

use crate::flow::{FlowRecord, decode_line};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// What to do with a capture line that does not decode into a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedLinePolicy {
    /// Log the line number and decode error, then keep tailing.
    #[default]
    Skip,
    /// Stop with the decode error.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    pub poll_interval: Duration,
    pub malformed_lines: MalformedLinePolicy,
    /// Longest accepted line, newline excluded. Longer lines are discarded as they stream in
    /// and then handled like malformed ones.
    pub max_line_bytes: usize,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            malformed_lines: MalformedLinePolicy::default(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// A stream of decoded flows.
pub trait RecordSource {
    /// Waits for the next decoded record. `Ok(None)` means the source has nothing more to give.
    ///
    /// Dropping the returned future before it resolves must not lose data, so callers can race it
    /// against cancellation.
    fn next_record(&mut self) -> impl Future<Output = anyhow::Result<Option<FlowRecord>>> + Send;
}

enum Line {
    Complete(Vec<u8>),
    Oversized,
}

/// Follows a growing capture file from its end-of-file at open time.
///
/// Only complete, newline-terminated lines are decoded. Bytes of a line that is still being
/// written stay buffered until the rest of it arrives. Line numbers count appended lines, so
/// line 1 is the first line written after the reader attached.
pub struct TailReader {
    path: PathBuf,
    reader: BufReader<File>,
    pending: Vec<u8>,
    discarding: bool,
    line_number: u64,
    malformed_total: u64,
    options: TailOptions,
    signal: ChangeSignal,
}

impl TailReader {
    pub async fn open(path: impl AsRef<Path>, options: TailOptions) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("open capture file {}", path.display()))?;
        let offset = file
            .seek(SeekFrom::End(0))
            .await
            .with_context(|| format!("seek to end of capture file {}", path.display()))?;
        let signal = ChangeSignal::new(&path);

        tracing::info!(
            path = %path.display(),
            offset,
            poll_interval_ms = options.poll_interval.as_millis(),
            max_line_bytes = options.max_line_bytes,
            "tailing capture file"
        );

        Ok(Self {
            path,
            reader: BufReader::new(file),
            pending: Vec::new(),
            discarding: false,
            line_number: 0,
            malformed_total: 0,
            options,
            signal,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of lines skipped because they did not decode or were too long.
    pub fn malformed_total(&self) -> u64 {
        self.malformed_total
    }

    /// Waits for the next complete line and returns it without its newline.
    ///
    /// `pending` never holds more than `max_line_bytes + 1` bytes.
    async fn next_line(&mut self) -> anyhow::Result<Line> {
        loop {
            let budget = self.options.max_line_bytes + 1 - self.pending.len();
            (&mut self.reader)
                .take(budget as u64)
                .read_until(b'\n', &mut self.pending)
                .await
                .with_context(|| format!("read capture file {}", self.path.display()))?;

            if self.pending.last() == Some(&b'\n') {
                self.line_number += 1;
                let mut line = std::mem::take(&mut self.pending);
                if std::mem::take(&mut self.discarding) {
                    return Ok(Line::Oversized);
                }
                line.pop();
                return Ok(Line::Complete(line));
            }

            if self.pending.len() > self.options.max_line_bytes {
                self.discarding = true;
                self.pending.clear();
                continue;
            }

            self.signal.wait(self.options.poll_interval).await;
        }
    }

    /// Applies the malformed line policy to the current line.
    fn reject_line(&mut self, error_kind: &'static str, err: anyhow::Error) -> anyhow::Result<()> {
        match self.options.malformed_lines {
            MalformedLinePolicy::Skip => {
                self.malformed_total += 1;
                tracing::warn!(
                    appended_line = self.line_number,
                    error_kind,
                    malformed_total = self.malformed_total,
                    "skipping malformed capture line: {err:#}"
                );
                Ok(())
            }
            MalformedLinePolicy::Fail => Err(err.context(format!(
                "decode appended line {} of capture file {}",
                self.line_number,
                self.path.display()
            ))),
        }
    }
}

impl RecordSource for TailReader {
    async fn next_record(&mut self) -> anyhow::Result<Option<FlowRecord>> {
        loop {
            let line = match self.next_line().await? {
                Line::Complete(line) => line,
                Line::Oversized => {
                    let limit = self.options.max_line_bytes;
                    self.reject_line(
                        "line_too_long",
                        anyhow!("capture line exceeds {limit} bytes"),
                    )?;
                    continue;
                }
            };
            if line.trim_ascii().is_empty() {
                continue;
            }

            match decode_line(&line) {
                Ok(record) => return Ok(Some(record)),
                Err(err) => {
                    let error_kind = err.kind();
                    self.reject_line(error_kind, anyhow::Error::new(err))?;
                }
            }
        }
    }
}

/// How the reader waits for the capture file to grow.
enum ChangeSignal {
    Poll,
    #[cfg(feature = "watch")]
    Watch {
        _watcher: notify::RecommendedWatcher,
        events: tokio::sync::mpsc::UnboundedReceiver<()>,
    },
}

impl ChangeSignal {
    #[cfg(not(feature = "watch"))]
    fn new(_path: &Path) -> Self {
        Self::Poll
    }

    #[cfg(feature = "watch")]
    fn new(path: &Path) -> Self {
        use notify::{RecursiveMode, Watcher as _};

        let (event_tx, events) = tokio::sync::mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if event.is_ok_and(|event| event.kind.is_modify() || event.kind.is_create()) {
                let _ = event_tx.send(());
            }
        });
        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(err) => {
                tracing::warn!(path = %path.display(), "file watcher unavailable, polling: {err}");
                return Self::Poll;
            }
        };
        if let Err(err) = watcher.watch(path, RecursiveMode::NonRecursive) {
            tracing::warn!(path = %path.display(), "cannot watch capture file, polling: {err}");
            return Self::Poll;
        }

        Self::Watch {
            _watcher: watcher,
            events,
        }
    }

    /// Returns after `interval`, or earlier when a change notification arrives.
    async fn wait(&mut self, interval: Duration) {
        match self {
            Self::Poll => tokio::time::sleep(interval).await,
            #[cfg(feature = "watch")]
            Self::Watch { events, .. } => {
                tokio::select! {
                    event = events.recv() => {
                        if event.is_none() {
                            tokio::time::sleep(interval).await;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs::OpenOptions,
        io::Write as _,
        path::Path,
        time::Duration,
    };

    use super::{MalformedLinePolicy, RecordSource as _, TailOptions, TailReader};

    const LINE_A: &str = r#"{"request":{"method":"GET","scheme":"http","host":"a.com","port":80,"path":"/a","headers":[],"content":"","timestamp_start":1.0},"response":{"status_code":200,"reason":"OK","headers":[],"content":""}}"#;
    const LINE_B: &str = r#"{"request":{"method":"GET","scheme":"http","host":"b.com","port":80,"path":"/b","headers":[],"content":"","timestamp_start":2.0},"response":{"status_code":404,"reason":"Not Found","headers":[],"content":""}}"#;

    fn options(malformed_lines: MalformedLinePolicy) -> TailOptions {
        TailOptions {
            poll_interval: Duration::from_millis(5),
            malformed_lines,
            ..TailOptions::default()
        }
    }

    fn short_lines(malformed_lines: MalformedLinePolicy) -> TailOptions {
        TailOptions {
            max_line_bytes: LINE_B.len(),
            ..options(malformed_lines)
        }
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.flush().unwrap();
    }

    async fn next_host(reader: &mut TailReader) -> String {
        tokio::time::timeout(Duration::from_secs(5), reader.next_record())
            .await
            .expect("record should arrive")
            .unwrap()
            .expect("tail reader never ends")
            .request
            .host
    }

    #[tokio::test]
    async fn starts_at_end_of_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("proxy.mitm");
        std::fs::write(&path, format!("{LINE_A}\n")).unwrap();

        let mut reader = TailReader::open(&path, options(MalformedLinePolicy::Skip))
            .await
            .unwrap();
        append(&path, &format!("{LINE_B}\n"));

        assert_eq!(next_host(&mut reader).await, "b.com");
    }

    #[tokio::test]
    async fn yields_appended_lines_in_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("proxy.mitm");
        std::fs::write(&path, "").unwrap();

        let mut reader = TailReader::open(&path, options(MalformedLinePolicy::Skip))
            .await
            .unwrap();
        append(&path, &format!("{LINE_A}\n{LINE_B}\n{LINE_A}\n"));

        assert_eq!(next_host(&mut reader).await, "a.com");
        assert_eq!(next_host(&mut reader).await, "b.com");
        assert_eq!(next_host(&mut reader).await, "a.com");
    }

    #[tokio::test]
    async fn waits_for_the_rest_of_a_partial_line() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("proxy.mitm");
        std::fs::write(&path, "").unwrap();

        let mut reader = TailReader::open(&path, options(MalformedLinePolicy::Fail))
            .await
            .unwrap();
        let (head, tail) = LINE_B.split_at(40);
        append(&path, head);

        let early = tokio::time::timeout(Duration::from_millis(50), reader.next_record()).await;
        assert!(early.is_err(), "partial line must not be decoded");

        append(&path, &format!("{tail}\n"));
        assert_eq!(next_host(&mut reader).await, "b.com");
    }

    #[tokio::test]
    async fn skips_blank_and_malformed_lines() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("proxy.mitm");
        std::fs::write(&path, "").unwrap();

        let mut reader = TailReader::open(&path, options(MalformedLinePolicy::Skip))
            .await
            .unwrap();
        append(&path, &format!("\n   \n{{\"request\": 1}}\nnot json\n{LINE_A}\n"));

        assert_eq!(next_host(&mut reader).await, "a.com");
        assert_eq!(reader.malformed_total(), 2);
    }

    #[tokio::test]
    async fn fail_policy_reports_line_number_counted_from_attach() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("proxy.mitm");
        std::fs::write(&path, format!("{LINE_B}\n{LINE_B}\n{LINE_B}\n")).unwrap();

        let mut reader = TailReader::open(&path, options(MalformedLinePolicy::Fail))
            .await
            .unwrap();
        append(&path, &format!("{LINE_A}\nnot json\n"));

        assert_eq!(next_host(&mut reader).await, "a.com");
        let err = reader.next_record().await.unwrap_err();
        assert!(
            format!("{err:#}").contains("decode appended line 2 of capture file"),
            "error: {err:#}"
        );
    }

    #[tokio::test]
    async fn missing_capture_file_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let Err(err) =
            TailReader::open(temp_dir.path().join("missing.mitm"), TailOptions::default()).await
        else {
            panic!("opening a missing capture file should fail");
        };
        assert!(err.to_string().contains("open capture file"), "error: {err}");
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_without_buffering_it() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("proxy.mitm");
        std::fs::write(&path, "").unwrap();

        let mut reader = TailReader::open(&path, short_lines(MalformedLinePolicy::Skip))
            .await
            .unwrap();
        let oversized = "x".repeat(LINE_B.len() * 4);
        append(&path, &oversized[..LINE_B.len() * 2]);

        let early = tokio::time::timeout(Duration::from_millis(50), reader.next_record()).await;
        assert!(early.is_err(), "unterminated line must not be returned");
        assert!(reader.pending.len() <= LINE_B.len() + 1);

        append(&path, &format!("{}\n{LINE_B}\n{LINE_A}\n", &oversized[LINE_B.len() * 2..]));

        assert_eq!(next_host(&mut reader).await, "b.com");
        assert_eq!(next_host(&mut reader).await, "a.com");
        assert_eq!(reader.malformed_total(), 1);
    }

    #[tokio::test]
    async fn oversized_line_fails_under_fail_policy() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("proxy.mitm");
        std::fs::write(&path, "").unwrap();

        let mut reader = TailReader::open(&path, short_lines(MalformedLinePolicy::Fail))
            .await
            .unwrap();
        append(&path, &format!("{LINE_B}\n{}\n", "y".repeat(LINE_B.len() + 1)));

        assert_eq!(next_host(&mut reader).await, "b.com");
        let err = reader.next_record().await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("decode appended line 2"), "error: {message}");
        assert!(
            message.contains(&format!("exceeds {} bytes", LINE_B.len())),
            "error: {message}"
        );
    }
}
