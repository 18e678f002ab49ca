use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock-free bridge counters
#[derive(Debug, Default)]
pub struct Stats {
    pub frames_in: AtomicU64,
    pub bytes_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub bytes_out: AtomicU64,
    pub parse_errors: AtomicU64,
    pub frame_drops: AtomicU64,
    pub barge_ins: AtomicU64,
    pub function_calls: AtomicU64,
    pub bridges_opened: AtomicU64,
    pub bridges_closed: AtomicU64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline(always)]
    pub fn record_frame_in(&self, bytes: usize) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_frame_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_frame_drop(&self) {
        self.frame_drops.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_barge_in(&self) {
        self.barge_ins.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_function_call(&self) {
        self.function_calls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_bridge_opened(&self) {
        self.bridges_opened.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_bridge_closed(&self) {
        self.bridges_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot and reset counters, return rates
    pub fn snapshot_and_reset(&self, elapsed: Duration) -> StatsSnapshot {
        let secs = elapsed.as_secs_f64().max(0.001);

        let frames_in = self.frames_in.swap(0, Ordering::Relaxed);
        let bytes_in = self.bytes_in.swap(0, Ordering::Relaxed);
        let frames_out = self.frames_out.swap(0, Ordering::Relaxed);
        let bytes_out = self.bytes_out.swap(0, Ordering::Relaxed);
        let parse_err = self.parse_errors.swap(0, Ordering::Relaxed);
        let drops = self.frame_drops.swap(0, Ordering::Relaxed);
        let barge_ins = self.barge_ins.swap(0, Ordering::Relaxed);
        let functions = self.function_calls.swap(0, Ordering::Relaxed);

        StatsSnapshot {
            in_fps: (frames_in as f64) / secs,
            in_kbps: ((bytes_in as f64) * 8.0) / (secs * 1_000.0),
            out_fps: (frames_out as f64) / secs,
            out_kbps: ((bytes_out as f64) * 8.0) / (secs * 1_000.0),
            parse_errors: parse_err,
            frame_drops: drops,
            barge_ins,
            function_calls: functions,
        }
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub in_fps: f64,
    pub in_kbps: f64,
    pub out_fps: f64,
    pub out_kbps: f64,
    pub parse_errors: u64,
    pub frame_drops: u64,
    pub barge_ins: u64,
    pub function_calls: u64,
}

/// Background stats reporter task
pub async fn stats_reporter(stats: Arc<Stats>, interval_secs: u64) {
    if interval_secs == 0 {
        // Stats disabled — park forever
        std::future::pending::<()>().await;
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    let mut last = Instant::now();

    loop {
        tokio::time::sleep(interval).await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let snap = stats.snapshot_and_reset(elapsed);
        println!(
            "[STATS] ingress: {:.0} fps, {:.1} kbps | egress: {:.0} fps, {:.1} kbps | functions: {} | errors: parse={} drops={} barge_ins={}",
            snap.in_fps,
            snap.in_kbps,
            snap.out_fps,
            snap.out_kbps,
            snap.function_calls,
            snap.parse_errors,
            snap.frame_drops,
            snap.barge_ins
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = Stats::new();
        stats.record_frame_in(320);
        stats.record_frame_in(320);
        stats.record_frame_out(480);
        stats.record_barge_in();

        let snap = stats.snapshot_and_reset(Duration::from_secs(1));
        assert!((snap.in_fps - 2.0).abs() < 0.01);
        assert!((snap.out_fps - 1.0).abs() < 0.01);
        assert_eq!(snap.barge_ins, 1);

        let snap2 = stats.snapshot_and_reset(Duration::from_secs(1));
        assert_eq!(snap2.barge_ins, 0);
        assert!(snap2.in_fps.abs() < 0.01);
    }
}
