//! Dump Pipelines and Worker Threads

use crate::{DumpError, DumpMode, DumpRecord, DumpStatus};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use irrv_protocol::CodecType;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Records buffered per pipeline before the producer starts dropping
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineKind {
    Input,
    Output,
}

impl PipelineKind {
    fn name(self) -> &'static str {
        match self {
            PipelineKind::Input => "input",
            PipelineKind::Output => "output",
        }
    }
}

enum QueueItem {
    Record(DumpRecord),
    /// Poison: flush, close and exit
    Shutdown,
}

struct Worker {
    tx: Sender<QueueItem>,
    handle: JoinHandle<u64>,
}

struct Pipeline {
    kind: PipelineKind,
    started: Arc<AtomicBool>,
    dropped: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl Pipeline {
    fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            started: Arc::new(AtomicBool::new(false)),
            dropped: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn start(&self, path: PathBuf, frame_limit: u64, depth: usize) -> Result<(), DumpError> {
        let mut worker = self.lock_worker();

        if self.is_started() {
            warn!("{} dump already started", self.kind.name());
            return Ok(());
        }

        // A worker that hit its frame limit is still draining; reap it first
        if let Some(stale) = worker.take() {
            Self::shutdown(self.kind, stale);
        }

        let file = File::create(&path).map_err(|source| {
            error!("Failed to open {} dump file {}: {}", self.kind.name(), path.display(), source);
            DumpError::Open {
                path: path.clone(),
                source,
            }
        })?;

        let (tx, rx) = bounded(depth);
        let consumer = Consumer {
            kind: self.kind,
            path: path.clone(),
            started: Arc::clone(&self.started),
            frame_limit,
        };
        let handle = thread::Builder::new()
            .name(format!("dump-{}", self.kind.name()))
            .spawn(move || consumer.run(BufWriter::new(file), rx))
            .map_err(DumpError::Spawn)?;

        self.started.store(true, Ordering::Release);
        *worker = Some(Worker { tx, handle });

        info!(
            "Started {} dump to {} (frame limit {})",
            self.kind.name(),
            path.display(),
            frame_limit
        );
        Ok(())
    }

    fn stop(&self) {
        let mut worker = self.lock_worker();
        self.started.store(false, Ordering::Release);

        if let Some(active) = worker.take() {
            Self::shutdown(self.kind, active);
        }
    }

    fn shutdown(kind: PipelineKind, worker: Worker) {
        // The consumer drains until it sees the poison, so this cannot block
        // forever; it only fails if the consumer already exited.
        let _ = worker.tx.send(QueueItem::Shutdown);
        match worker.handle.join() {
            Ok(written) => info!("Stopped {} dump after {} records", kind.name(), written),
            Err(_) => error!("{} dump worker panicked", kind.name()),
        }
    }

    fn submit(&self, record: DumpRecord) {
        if !self.is_started() {
            return;
        }

        let worker = self.lock_worker();
        let Some(active) = worker.as_ref() else {
            return;
        };

        match active.tx.try_send(QueueItem::Record(record)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("{} dump queue full, dropped record ({} total)", self.kind.name(), dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("{} dump worker gone, record discarded", self.kind.name());
            }
        }
    }
}

struct Consumer {
    kind: PipelineKind,
    path: PathBuf,
    started: Arc<AtomicBool>,
    frame_limit: u64,
}

impl Consumer {
    fn run(self, file: BufWriter<File>, rx: Receiver<QueueItem>) -> u64 {
        let mut out = Some(file);
        let mut written = 0u64;
        let mut seen_key_frame = self.kind == PipelineKind::Input;

        while let Ok(item) = rx.recv() {
            let record = match item {
                QueueItem::Shutdown => break,
                QueueItem::Record(record) => record,
            };

            // After self-stop, keep draining until the poison arrives
            let Some(writer) = out.as_mut() else {
                continue;
            };

            if !seen_key_frame {
                if !record.key_frame {
                    debug!("Skipping non-key frame before first key frame");
                    continue;
                }
                seen_key_frame = true;
            }

            if let Err(e) = writer.write_all(&record.data) {
                error!("Write to {} failed: {}", self.path.display(), e);
                self.close(&mut out);
                continue;
            }
            written += 1;

            if self.frame_limit > 0 && written >= self.frame_limit {
                info!(
                    "{} dump reached frame limit {}",
                    self.kind.name(),
                    self.frame_limit
                );
                self.close(&mut out);
            }
        }

        self.close(&mut out);
        written
    }

    fn close(&self, out: &mut Option<BufWriter<File>>) {
        if let Some(mut writer) = out.take() {
            if let Err(e) = writer.flush() {
                error!("Flush of {} failed: {}", self.path.display(), e);
            }
            self.started.store(false, Ordering::Release);
        }
    }
}

/// Dual-pipeline dump writer
pub struct RuntimeDumpWriter {
    dir: PathBuf,
    codec: Mutex<CodecType>,
    queue_depth: usize,
    input: Pipeline,
    output: Pipeline,
}

impl RuntimeDumpWriter {
    /// Create a writer placing dump files under `dir`
    pub fn new(dir: impl AsRef<Path>, codec: CodecType) -> Self {
        Self::with_queue_depth(dir, codec, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(dir: impl AsRef<Path>, codec: CodecType, queue_depth: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            codec: Mutex::new(codec),
            queue_depth: queue_depth.max(1),
            input: Pipeline::new(PipelineKind::Input),
            output: Pipeline::new(PipelineKind::Output),
        }
    }

    /// Start the selected pipelines; `frame_limit` 0 means unlimited
    ///
    /// With [`DumpMode::Both`] the input pipeline is started first; if it
    /// fails the output pipeline is left untouched.
    pub fn start(&self, mode: DumpMode, frame_limit: u64) -> Result<(), DumpError> {
        if mode.includes_input() {
            let path = self.file_path(PipelineKind::Input);
            self.input.start(path, frame_limit, self.queue_depth)?;
        }
        if mode.includes_output() {
            let path = self.file_path(PipelineKind::Output);
            self.output.start(path, frame_limit, self.queue_depth)?;
        }
        Ok(())
    }

    /// Stop the selected pipelines; stopping a stopped pipeline is a no-op
    pub fn stop(&self, mode: DumpMode) {
        if mode.includes_input() {
            self.input.stop();
        }
        if mode.includes_output() {
            self.output.stop();
        }
    }

    /// Queue a record; does nothing for pipelines that are not writing
    pub fn submit(&self, mode: DumpMode, record: DumpRecord) {
        match mode {
            DumpMode::Input => self.input.submit(record),
            DumpMode::Output => self.output.submit(record),
            DumpMode::Both => {
                if self.input.is_started() {
                    self.input.submit(record.clone());
                }
                self.output.submit(record);
            }
        }
    }

    pub fn status(&self) -> DumpStatus {
        DumpStatus {
            input: self.input.is_started(),
            output: self.output.is_started(),
        }
    }

    /// Codec used for the extension of the next output dump file
    pub fn change_codec(&self, codec: CodecType) {
        *self.codec.lock().unwrap_or_else(PoisonError::into_inner) = codec;
    }

    /// Records dropped because a pipeline queue was full
    pub fn dropped(&self) -> u64 {
        self.input.dropped.load(Ordering::Relaxed) + self.output.dropped.load(Ordering::Relaxed)
    }

    fn file_path(&self, kind: PipelineKind) -> PathBuf {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let name = match kind {
            PipelineKind::Input => format!("input_{}.rgba", timestamp),
            PipelineKind::Output => {
                let codec = *self.codec.lock().unwrap_or_else(PoisonError::into_inner);
                format!("output_{}{}", timestamp, codec.file_extension())
            }
        };
        self.dir.join(name)
    }
}

impl Drop for RuntimeDumpWriter {
    fn drop(&mut self) {
        self.stop(DumpMode::Both);
    }
}
