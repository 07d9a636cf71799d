use crate::error::Error;
use crate::media::IoOpcode;
use crate::mempool::{Mempool, PoolMode, PoolType};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam::queue::SegQueue;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Lifetime I/O counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatType {
    ReadBytes = 0,
    AppendBytes,
    ReadMcmd,
    AppendMcmd,
    ResetMcmd,
    ReadBytesUser,
    AppendBytesUser,
    ReadUcmd,
    AppendUcmd,
    RecycledBytes,
    RecycledZones,
    WriteSubmitFail,
    ReadSubmitFail,
    WriteCallbackFail,
    ReadCallbackFail,
    MgmtFail,
}

const STAT_COUNT: usize = 16;

/// Interval counters drained by the telemetry flusher once per second.
pub(crate) struct Interval {
    pub written_bytes: u64,
    pub read_bytes: u64,
    pub io_count: u64,
    pub user_write_bytes: u64,
    pub zns_write_bytes: u64,
}

/// Atomic statistics shared by every thread of the instance.
pub struct Stats {
    totals: [AtomicU64; STAT_COUNT],
    written_bytes: AtomicU64,
    read_bytes: AtomicU64,
    io_count: AtomicU64,
    user_write_bytes: AtomicU64,
    zns_write_bytes: AtomicU64,
    /// Pool slots carrying one latency sample each, consumed by the flusher.
    lat_samples: SegQueue<usize>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            totals: core::array::from_fn(|_| AtomicU64::new(0)),
            written_bytes: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            io_count: AtomicU64::new(0),
            user_write_bytes: AtomicU64::new(0),
            zns_write_bytes: AtomicU64::new(0),
            lat_samples: SegQueue::new(),
        }
    }

    pub fn inc(&self, ty: StatType, val: u64) {
        self.totals[ty as usize].fetch_add(val, Ordering::Relaxed);
    }

    pub fn get(&self, ty: StatType) -> u64 {
        self.totals[ty as usize].load(Ordering::Relaxed)
    }

    /// Account one completed media command.
    pub fn record_io(&self, opcode: IoOpcode, bytes: u64, status: i32) {
        if status != 0 {
            return;
        }
        match opcode {
            IoOpcode::Append => {
                self.inc(StatType::AppendMcmd, 1);
                self.inc(StatType::AppendBytes, bytes);
                self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
                self.zns_write_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            IoOpcode::Read => {
                self.inc(StatType::ReadMcmd, 1);
                self.inc(StatType::ReadBytes, bytes);
                self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
        self.io_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Account bytes as the application handed them in.
    pub fn record_user_write(&self, bytes: u64) {
        self.inc(StatType::AppendBytesUser, bytes);
        self.user_write_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_user_read(&self, bytes: u64) {
        self.inc(StatType::ReadBytesUser, bytes);
        self.inc(StatType::ReadUcmd, 1);
    }

    /// Push one read latency sample through the sample pool; dropped when
    /// the pool is inactive.
    pub fn record_read_latency(&self, mempool: &Mempool, usec: u64) {
        if !mempool.is_active(PoolType::LatencySample, 0) {
            return;
        }
        if let Ok(ent) = mempool.get(PoolType::LatencySample, 0) {
            unsafe { *(ent.as_ref().opaque() as *mut u64) = usec };
            self.lat_samples.push(ent.as_ptr() as usize);
        }
    }

    /// Swap the interval counters out, resetting them.
    pub(crate) fn take_interval(&self) -> Interval {
        Interval {
            written_bytes: self.written_bytes.swap(0, Ordering::Relaxed),
            read_bytes: self.read_bytes.swap(0, Ordering::Relaxed),
            io_count: self.io_count.swap(0, Ordering::Relaxed),
            // Amplification counters accumulate over the instance lifetime.
            user_write_bytes: self.user_write_bytes.load(Ordering::Relaxed),
            zns_write_bytes: self.zns_write_bytes.load(Ordering::Relaxed),
        }
    }
}

const MIB: f64 = 1048576.0;
const FLUSH_PERIOD: Duration = Duration::from_secs(1);
const FLUSH_POLL: Duration = Duration::from_millis(50);
const LAT_SAMPLE_SLOTS: u32 = 128;

fn write_file(dir: &Path, name: &str, value: &str) {
    let path = dir.join(name);
    if let Err(err) = fs::write(&path, value) {
        debug!("telemetry: writing {} failed: {}", path.display(), err);
    }
}

/// Emit one round of gauges and reclaim queued latency samples.
pub(crate) fn flush_once(stats: &Stats, mempool: &Mempool, dir: &Path) {
    let interval = stats.take_interval();
    let thput_w = interval.written_bytes as f64 / MIB;
    let thput_r = interval.read_bytes as f64 / MIB;
    let wamp = if interval.user_write_bytes != 0 {
        interval.zns_write_bytes as f64 / interval.user_write_bytes as f64
    } else {
        1.0
    };

    write_file(dir, "ztl_prometheus_thput_w", &format!("{thput_w:.6}"));
    write_file(dir, "ztl_prometheus_thput_r", &format!("{thput_r:.6}"));
    write_file(dir, "ztl_prometheus_thput", &format!("{:.6}", thput_w + thput_r));
    write_file(dir, "ztl_prometheus_iops", &interval.io_count.to_string());
    write_file(dir, "ztl_prometheus_wamp_ztl", &format!("{wamp:.6}"));

    let mut samples = 0u64;
    let mut total_usec = 0u64;
    while let Some(raw) = stats.lat_samples.pop() {
        let ent = unsafe { NonNull::new_unchecked(raw as *mut crate::mempool::MpEntry) };
        total_usec += unsafe { *(ent.as_ref().opaque() as *const u64) };
        mempool.put(ent, PoolType::LatencySample, 0);
        samples += 1;
    }
    if samples != 0 {
        debug!(
            "telemetry: {} read samples, {} usec average",
            samples,
            total_usec / samples
        );
    }
}

/// The once-per-second gauge flusher.
pub struct Telemetry {
    running: Arc<AtomicBool>,
    flusher: Option<JoinHandle<()>>,
    dir: PathBuf,
}

impl Telemetry {
    pub fn init(stats: Arc<Stats>, mempool: Arc<Mempool>, dir: PathBuf) -> Result<Telemetry, Error> {
        mempool.create(
            PoolType::LatencySample,
            0,
            LAT_SAMPLE_SLOTS,
            core::mem::size_of::<u64>() as u32,
            // Samples arrive from any reader thread.
            PoolMode::Locked,
            None,
        )?;
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let thread_dir = dir.clone();
        let flusher = thread::Builder::new()
            .name("ztl-telemetry".into())
            .spawn(move || {
                let mut last = Instant::now();
                while thread_running.load(Ordering::Acquire) {
                    thread::sleep(FLUSH_POLL);
                    if last.elapsed() >= FLUSH_PERIOD {
                        flush_once(&stats, &mempool, &thread_dir);
                        last = Instant::now();
                    }
                }
                // Close out with one final interval, then zeroed gauges.
                flush_once(&stats, &mempool, &thread_dir);
                write_file(&thread_dir, "ztl_prometheus_thput_w", "0.000000");
                write_file(&thread_dir, "ztl_prometheus_thput_r", "0.000000");
                write_file(&thread_dir, "ztl_prometheus_thput", "0.000000");
                write_file(&thread_dir, "ztl_prometheus_iops", "0");
                write_file(&thread_dir, "ztl_prometheus_wamp_ztl", "1.000000");
            })
            .map_err(|_| Error::MempoolAsynchError)?;
        Ok(Telemetry {
            running,
            flusher: Some(flusher),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exit(mut self, mempool: &Mempool) {
        self.running.store(false, Ordering::Release);
        if let Some(flusher) = self.flusher.take() {
            if flusher.join().is_err() {
                warn!("telemetry: flusher thread panicked");
            }
        }
        let _ = mempool.destroy(PoolType::LatencySample, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ztl-stats-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn io_accounting_feeds_totals_and_interval() {
        let stats = Stats::new();
        stats.record_io(IoOpcode::Append, 4096, 0);
        stats.record_io(IoOpcode::Read, 8192, 0);
        stats.record_io(IoOpcode::Read, 8192, 1);
        stats.record_user_write(4096);

        assert_eq!(stats.get(StatType::AppendBytes), 4096);
        assert_eq!(stats.get(StatType::ReadBytes), 8192);
        assert_eq!(stats.get(StatType::AppendMcmd), 1);
        assert_eq!(stats.get(StatType::ReadMcmd), 1);

        let interval = stats.take_interval();
        assert_eq!(interval.written_bytes, 4096);
        assert_eq!(interval.read_bytes, 8192);
        assert_eq!(interval.io_count, 2);
        assert_eq!(interval.user_write_bytes, 4096);
        assert_eq!(interval.zns_write_bytes, 4096);

        // The throughput window resets, amplification does not.
        let interval = stats.take_interval();
        assert_eq!(interval.written_bytes, 0);
        assert_eq!(interval.io_count, 0);
        assert_eq!(interval.user_write_bytes, 4096);
    }

    #[test]
    fn flush_writes_every_gauge_file() {
        let stats = Stats::new();
        let mempool = Mempool::new();
        let dir = temp_dir("flush");
        stats.record_io(IoOpcode::Append, 2 * 1048576, 0);
        stats.record_user_write(1048576);
        flush_once(&stats, &mempool, &dir);

        let thput_w = fs::read_to_string(dir.join("ztl_prometheus_thput_w")).unwrap();
        assert_eq!(thput_w, "2.000000");
        let iops = fs::read_to_string(dir.join("ztl_prometheus_iops")).unwrap();
        assert_eq!(iops, "1");
        let wamp = fs::read_to_string(dir.join("ztl_prometheus_wamp_ztl")).unwrap();
        assert_eq!(wamp, "2.000000");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn latency_samples_cycle_through_the_pool() {
        let stats = Stats::new();
        let mempool = Mempool::new();
        mempool
            .create(PoolType::LatencySample, 0, 8, 8, PoolMode::Locked, None)
            .unwrap();
        let dir = temp_dir("lat");
        stats.record_read_latency(&mempool, 120);
        stats.record_read_latency(&mempool, 80);
        assert_eq!(mempool.left(PoolType::LatencySample, 0), 6);
        flush_once(&stats, &mempool, &dir);
        assert_eq!(mempool.left(PoolType::LatencySample, 0), 8);
        fs::remove_dir_all(&dir).unwrap();
    }
}
