//! Side-channel watcher over the agent's own log files.
//!
//! The agent writes `*.log` files into one directory and rotates to a new,
//! lexicographically later file from time to time. The watcher tails the
//! newest file from the moment `start()` is called, classifies `ERROR` lines
//! with [`crate::log_rules`] and publishes them on its event bus. Each
//! distinct `(error, status, session)` is reported once per watch session.
//!
//! Rotation is picked up two ways: a directory notification from `notify`
//! when the OS delivers one, and a rescan on every poll tick for when it
//! doesn't.

use std::collections::HashSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use relay_types::config::LogWatchConfig;
use relay_types::log_error::DetectedError;

use crate::events::{EventBus, BUS_CAPACITY};
use crate::log_rules;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Longest unterminated line kept between polls (1 MB).
const MAX_PARTIAL_LINE: usize = 1_048_576;

const LOG_EXTENSION: &str = "log";

/// Most `LogLine` events published from one poll. `Error` events are not
/// counted, so a flood of lines cannot push them out of the bus.
const MAX_LINES_PER_POLL: usize = BUS_CAPACITY / 4;

#[derive(Debug, Clone, PartialEq)]
pub enum LogWatchEvent {
    /// First sighting of an error condition in this watch session.
    Error(DetectedError),
    /// Every line carrying the error marker, duplicates included, up to a
    /// per-poll limit.
    LogLine(String),
}

/// Publishes events for one watch session. Emission and `stop()` both go
/// through `gate`, so once `stop()` has bumped the generation nothing from
/// the old session reaches subscribers.
#[derive(Clone)]
struct Emitter {
    bus: EventBus<LogWatchEvent>,
    gate: Arc<Mutex<u64>>,
    generation: u64,
}

impl Emitter {
    fn emit(&self, event: LogWatchEvent) -> bool {
        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if *gate != self.generation {
            return false;
        }
        self.bus.send(event);
        true
    }

    fn is_current(&self) -> bool {
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) == self.generation
    }
}

struct WatchSession {
    task: JoinHandle<()>,
    // Kept alive for the session; dropping it ends directory notifications.
    _notifier: Option<RecommendedWatcher>,
}

pub struct LogWatcher {
    log_dir: PathBuf,
    poll_interval: Duration,
    bus: EventBus<LogWatchEvent>,
    gate: Arc<Mutex<u64>>,
    session: Option<WatchSession>,
}

impl LogWatcher {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            bus: EventBus::new(),
            gate: Arc::new(Mutex::new(0)),
            session: None,
        }
    }

    pub fn from_config(log_dir: impl Into<PathBuf>, config: &LogWatchConfig) -> Self {
        Self::new(log_dir).with_poll_interval(Duration::from_millis(config.poll_interval_ms))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Subscribe to detected errors and raw error lines.
    pub fn subscribe(&self) -> broadcast::Receiver<LogWatchEvent> {
        self.bus.subscribe()
    }

    pub fn is_watching(&self) -> bool {
        self.session.is_some()
    }

    /// Begin a watch session. Only lines written after this call are
    /// reported. A missing directory or an empty one is not an error; the
    /// watcher picks up the first log file that appears.
    ///
    /// Calling `start()` on a running watcher restarts it.
    pub async fn start(&mut self) -> Result<()> {
        self.stop();

        let generation = {
            let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            *gate += 1;
            *gate
        };

        let mut tail = LogTail::new(self.log_dir.clone());
        tail.rescan()
            .await
            .with_context(|| format!("Failed to scan log directory {}", self.log_dir.display()))?;

        let (rotation_tx, rotation_rx) = mpsc::unbounded_channel();
        let notifier = watch_directory(&self.log_dir, rotation_tx);

        let emitter = Emitter {
            bus: self.bus.clone(),
            gate: Arc::clone(&self.gate),
            generation,
        };
        let task = tokio::spawn(run_session(tail, emitter, rotation_rx, self.poll_interval));

        info!(dir = %self.log_dir.display(), "Log watcher started");
        self.session = Some(WatchSession {
            task,
            _notifier: notifier,
        });
        Ok(())
    }

    /// End the watch session. Safe to call when not watching. No event is
    /// published after this returns.
    pub fn stop(&mut self) {
        {
            let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            *gate += 1;
        }
        if let Some(session) = self.session.take() {
            session.task.abort();
            info!(dir = %self.log_dir.display(), "Log watcher stopped");
        }
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_session(
    mut tail: LogTail,
    emitter: Emitter,
    mut rotations: mpsc::UnboundedReceiver<()>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = rotations.recv() => {
                // Coalesce a burst of notifications into one rescan.
                while rotations.try_recv().is_ok() {}
            }
        }

        if !emitter.is_current() {
            break;
        }
        if let Err(e) = tail.rescan().await {
            debug!("Log directory scan failed: {e:#}");
        }
        if !tail.poll(&emitter).await {
            break;
        }
    }
}

/// The file currently being tailed.
struct OpenLog {
    path: PathBuf,
    file: File,
    offset: u64,
}

/// Per-session tail state: the open file, how far it has been read, an
/// unterminated trailing line, and the errors already reported.
struct LogTail {
    dir: PathBuf,
    current: Option<OpenLog>,
    partial: Vec<u8>,
    seen: HashSet<String>,
}

impl LogTail {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            current: None,
            partial: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Switch to the newest log file if it is not the one being tailed.
    async fn rescan(&mut self) -> Result<()> {
        let Some(latest) = latest_log_file(&self.dir).await? else {
            return Ok(());
        };
        if self.current.as_ref().map(|log| &log.path) == Some(&latest) {
            return Ok(());
        }
        self.adopt(latest).await;
        Ok(())
    }

    /// Start tailing `path` from its current end.
    async fn adopt(&mut self, path: PathBuf) {
        // Close the previous handle before opening the next one.
        if let Some(old) = self.current.take() {
            info!(from = %old.path.display(), to = %path.display(), "Log file rotated");
        }
        self.partial.clear();

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "Failed to open log file: {e}");
                return;
            }
        };
        let offset = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %path.display(), "Failed to stat log file: {e}");
                return;
            }
        };
        debug!(path = %path.display(), offset, "Tailing log file");
        self.current = Some(OpenLog { path, file, offset });
    }

    /// Read whatever was appended since the last poll and publish it.
    /// Returns `false` once the session has been stopped.
    async fn poll(&mut self, emitter: &Emitter) -> bool {
        let Some(log) = self.current.as_mut() else {
            return emitter.is_current();
        };

        let size = match tokio::fs::metadata(&log.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %log.path.display(), "Log file disappeared");
                self.current = None;
                self.partial.clear();
                if let Err(e) = self.rescan().await {
                    debug!("Log directory scan failed: {e:#}");
                }
                return emitter.is_current();
            }
            Err(e) => {
                debug!(path = %log.path.display(), "Failed to stat log file: {e}");
                return emitter.is_current();
            }
        };
        if size <= log.offset {
            return emitter.is_current();
        }

        let mut chunk = Vec::new();
        let read = async {
            log.file.seek(SeekFrom::Start(log.offset)).await?;
            (&mut log.file).take(size - log.offset).read_to_end(&mut chunk).await
        };
        let read = read.await;
        match read {
            Ok(n) => log.offset += n as u64,
            Err(e) => {
                debug!(path = %log.path.display(), "Failed to read log file: {e}");
                return emitter.is_current();
            }
        }

        // A stop() that raced with the read wins; drop what was read.
        if !emitter.is_current() {
            return false;
        }
        self.process(&chunk, emitter)
    }

    fn process(&mut self, chunk: &[u8], emitter: &Emitter) -> bool {
        self.partial.extend_from_slice(chunk);
        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            if self.partial.len() > MAX_PARTIAL_LINE {
                debug!(len = self.partial.len(), "Discarding overlong log line");
                self.partial.clear();
            }
            return true;
        };
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();

        let mut published = 0;
        let mut skipped = 0;
        for raw in complete.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.is_empty() || !log_rules::is_error_line(line) {
                continue;
            }
            if published < MAX_LINES_PER_POLL {
                if !emitter.emit(LogWatchEvent::LogLine(line.to_string())) {
                    return false;
                }
                published += 1;
            } else {
                skipped += 1;
            }
            let Some(error) = log_rules::parse_line(line) else {
                continue;
            };
            if !self.seen.insert(error.dedup_key()) {
                debug!(key = %error.dedup_key(), "Suppressing repeated log error");
                continue;
            }
            info!(kind = %error.kind, status = ?error.status_code, "Detected error in agent log");
            if !emitter.emit(LogWatchEvent::Error(error)) {
                return false;
            }
        }
        if skipped > 0 {
            warn!(skipped, "Error line flood, raw lines not published for this poll");
        }
        true
    }
}

fn is_log_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == LOG_EXTENSION)
}

/// The lexicographically greatest `*.log` file in `dir`, if any. A missing
/// directory has no log files.
async fn latest_log_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut latest: Option<PathBuf> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_log_file(&path) || !entry.file_type().await?.is_file() {
            continue;
        }
        if latest.as_ref().map_or(true, |best| path.file_name() > best.file_name()) {
            latest = Some(path);
        }
    }
    Ok(latest)
}

fn is_rotation(event: &notify::Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    ) && event.paths.iter().any(|p| is_log_file(p))
}

/// Best-effort directory notifications. Returns `None` if the platform
/// watcher cannot be set up (polling still covers rotation).
fn watch_directory(dir: &Path, rotations: mpsc::UnboundedSender<()>) -> Option<RecommendedWatcher> {
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if is_rotation(&event) {
                let _ = rotations.send(());
            }
        }
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            warn!("Log directory notifications unavailable: {e}");
            return None;
        }
    };

    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        debug!(dir = %dir.display(), "Not watching log directory for rotation: {e}");
        return None;
    }
    Some(watcher)
}
