/// Bounded stdout/stderr collection
///
/// Reader threads start as soon as the child is spawned and forward chunks
/// over a channel. Bytes past a stream's limit are drained and discarded so the
/// child never blocks on a full pipe.
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Per-stream byte limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputLimits {
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    /// How long to wait for pipes to close after the process is gone
    pub collection_timeout_ms: u64,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            stdout_limit: 8 * 1024 * 1024,
            stderr_limit: 2 * 1024 * 1024,
            collection_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

enum Chunk {
    Data(Stream, Vec<u8>),
    Closed(Stream),
}

/// Collected output
#[derive(Debug, Clone, Default)]
pub struct OutputResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Live collector attached to a child's pipes
pub struct OutputCollector {
    limits: OutputLimits,
    rx: Receiver<Chunk>,
    open_streams: usize,
    handles: Vec<JoinHandle<()>>,
    result: OutputResult,
}

impl OutputCollector {
    /// Start reader threads for whichever pipes are present
    pub fn start<O, E>(limits: OutputLimits, stdout: Option<O>, stderr: Option<E>) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (tx, rx) = unbounded();
        let mut handles = Vec::new();

        if let Some(stream) = stdout {
            let tx = tx.clone();
            handles.push(thread::spawn(move || pump(stream, Stream::Stdout, tx)));
        }
        if let Some(stream) = stderr {
            let tx = tx.clone();
            handles.push(thread::spawn(move || pump(stream, Stream::Stderr, tx)));
        }

        OutputCollector {
            limits,
            rx,
            open_streams: handles.len(),
            handles,
            result: OutputResult::default(),
        }
    }

    /// Absorb whatever has arrived so far without blocking
    pub fn poll(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.absorb(chunk);
        }
    }

    /// Wait for both pipes to close, bounded by the collection timeout.
    /// Output gathered before the deadline is kept either way.
    pub fn finish(mut self) -> OutputResult {
        let deadline = Instant::now() + Duration::from_millis(self.limits.collection_timeout_ms);
        while self.open_streams > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.absorb(chunk),
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "Output pipes still open after {}ms, detaching readers",
                        self.limits.collection_timeout_ms
                    );
                    return self.result;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.result
    }

    fn absorb(&mut self, chunk: Chunk) {
        match chunk {
            Chunk::Data(stream, data) => {
                let (buffer, truncated, limit) = match stream {
                    Stream::Stdout => (
                        &mut self.result.stdout,
                        &mut self.result.stdout_truncated,
                        self.limits.stdout_limit,
                    ),
                    Stream::Stderr => (
                        &mut self.result.stderr,
                        &mut self.result.stderr_truncated,
                        self.limits.stderr_limit,
                    ),
                };
                let room = limit.saturating_sub(buffer.len());
                if data.len() > room {
                    buffer.extend_from_slice(&data[..room]);
                    *truncated = true;
                } else {
                    buffer.extend_from_slice(&data);
                }
            }
            Chunk::Closed(_) => {
                self.open_streams = self.open_streams.saturating_sub(1);
            }
        }
    }
}

fn pump<R: Read>(mut stream: R, which: Stream, tx: Sender<Chunk>) {
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Chunk::Data(which, chunk[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("{:?} reader stopped: {}", which, e);
                break;
            }
        }
    }
    let _ = tx.send(Chunk::Closed(which));
}
