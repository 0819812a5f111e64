/// Background resource sampling for a running process group
///
/// The sampler thread owns no shared counters: each tick it pushes a batch of
/// per-process readings onto a bounded channel, and the execution loop merges
/// them into an [`UsageAccumulator`].
use crate::config::types::ResourceUsage;
use crate::kernel::procfs::{self, ProcStat};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Peak/cumulative merge of sample batches
#[derive(Debug, Default, Clone)]
pub struct UsageAccumulator {
    /// Highest cumulative counters seen per pid
    per_pid: HashMap<i32, ProcStat>,
    /// Largest simultaneous group RSS, or largest single-process HWM
    peak_rss_kb: u64,
    batches: u64,
}

impl UsageAccumulator {
    pub fn absorb(&mut self, batch: &[ProcStat]) {
        self.batches += 1;
        let mut group_rss = 0;
        for sample in batch {
            group_rss += sample.rss_kb;
            self.peak_rss_kb = self.peak_rss_kb.max(sample.hwm_kb);
            let entry = self.per_pid.entry(sample.pid).or_insert(*sample);
            entry.cpu_ms = entry.cpu_ms.max(sample.cpu_ms);
            entry.read_bytes = entry.read_bytes.max(sample.read_bytes);
            entry.write_bytes = entry.write_bytes.max(sample.write_bytes);
        }
        self.peak_rss_kb = self.peak_rss_kb.max(group_rss);
    }

    pub fn batches(&self) -> u64 {
        self.batches
    }

    pub fn usage(&self) -> ResourceUsage {
        let mut usage = ResourceUsage {
            rss_max_kb: self.peak_rss_kb,
            ..ResourceUsage::default()
        };
        for stat in self.per_pid.values() {
            usage.cpu_ms += stat.cpu_ms;
            usage.io_read_kb += stat.read_bytes / 1024;
            usage.io_write_kb += stat.write_bytes / 1024;
        }
        usage
    }
}

/// Handle to a running sampler thread
pub struct Sampler {
    samples: Receiver<Vec<ProcStat>>,
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sampler {
    /// Start sampling process group `pgid` every `interval`
    pub fn spawn(pgid: i32, interval: Duration) -> Self {
        let (sample_tx, sample_rx) = bounded(SAMPLE_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticks = procfs::clock_ticks_per_sec();

        let handle = thread::spawn(move || loop {
            let batch = procfs::group_members(pgid, ticks);
            if !batch.is_empty() && sample_tx.send(batch).is_err() {
                break;
            }
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        });

        Sampler {
            samples: sample_rx,
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    /// Merge whatever batches are waiting
    pub fn drain_into(&self, acc: &mut UsageAccumulator) {
        while let Ok(batch) = self.samples.try_recv() {
            acc.absorb(&batch);
        }
    }

    /// Stop the thread and merge every remaining batch
    pub fn stop(mut self, acc: &mut UsageAccumulator) {
        let _ = self.stop.try_send(());
        // Draining until disconnect unblocks a sampler stuck on a full channel
        for batch in self.samples.iter() {
            acc.absorb(&batch);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
