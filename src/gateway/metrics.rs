//! Per-peer voice counters and the periodic `metrics` report. One peer task
//! owns its `PeerMetrics`; there is no cross-peer aggregation state.

use std::time::Instant;

use crate::gateway::peer::MetricsReport;
use crate::mumble::crypt::CryptStats;

#[derive(Clone, Copy, Debug, Default)]
struct Totals {
    uplink_frames: u64,
    uplink_bytes: u64,
    downlink_frames: u64,
    downlink_bytes: u64,
}

/// Counter state for one peer connection. Totals survive reconnects within
/// the same WebSocket; rates are deltas between reports.
#[derive(Debug)]
pub struct PeerMetrics {
    totals: Totals,
    downlink_dropped_frames: u64,
    server_rtt_ms: Option<u64>,
    udp_rtt_ms: Option<u64>,
    udp_ready: bool,
    crypt: Option<CryptStats>,
    last_report: (Instant, Totals),
}

impl PeerMetrics {
    pub fn new(now: Instant) -> Self {
        Self {
            totals: Totals::default(),
            downlink_dropped_frames: 0,
            server_rtt_ms: None,
            udp_rtt_ms: None,
            udp_ready: false,
            crypt: None,
            last_report: (now, Totals::default()),
        }
    }

    pub fn record_uplink_frame(&mut self, bytes: usize) {
        self.totals.uplink_frames += 1;
        self.totals.uplink_bytes += bytes as u64;
    }

    pub fn record_downlink_frame(&mut self, bytes: usize) {
        self.totals.downlink_frames += 1;
        self.totals.downlink_bytes += bytes as u64;
    }

    pub fn record_downlink_drop(&mut self) {
        self.downlink_dropped_frames += 1;
    }

    pub fn set_server_rtt(&mut self, ms: u64) {
        self.server_rtt_ms = Some(ms);
    }

    pub fn set_udp_rtt(&mut self, ms: u64, stats: CryptStats) {
        self.udp_rtt_ms = Some(ms);
        self.crypt = Some(stats);
    }

    pub fn set_udp_ready(&mut self, ready: bool) {
        self.udp_ready = ready;
    }

    /// Resets the link-state gauges when a session goes away; totals keep
    /// accumulating.
    pub fn session_closed(&mut self) {
        self.server_rtt_ms = None;
        self.udp_rtt_ms = None;
        self.udp_ready = false;
        self.crypt = None;
    }

    /// Builds one report: running totals plus rates over the interval since
    /// the previous report.
    pub fn report(&mut self, pacer_dropped_total: u64, now: Instant) -> MetricsReport {
        let (since, previous) = self.last_report;
        let elapsed = now.duration_since(since).as_secs_f64();
        let rate = |delta: u64| {
            if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            }
        };
        let kbps = |delta_bytes: u64| {
            if elapsed > 0.0 {
                (delta_bytes as f64 * 8.0) / elapsed / 1000.0
            } else {
                0.0
            }
        };

        let report = MetricsReport {
            voice_uplink_frames: self.totals.uplink_frames,
            voice_uplink_fps: rate(self.totals.uplink_frames - previous.uplink_frames),
            voice_uplink_kbps: kbps(self.totals.uplink_bytes - previous.uplink_bytes),
            voice_uplink_pacer_dropped_frames_total: pacer_dropped_total,
            voice_downlink_frames: self.totals.downlink_frames,
            voice_downlink_fps: rate(self.totals.downlink_frames - previous.downlink_frames),
            voice_downlink_kbps: kbps(self.totals.downlink_bytes - previous.downlink_bytes),
            voice_downlink_dropped_frames: self.downlink_dropped_frames,
            server_rtt_ms: self.server_rtt_ms,
            udp_rtt_ms: self.udp_rtt_ms,
            udp_ready: self.udp_ready,
            crypt_good: self.crypt.map(|stats| stats.good),
            crypt_late: self.crypt.map(|stats| stats.late),
            crypt_lost: self.crypt.map(|stats| stats.lost),
            crypt_resyncs: self.crypt.map(|stats| stats.resync),
        };
        self.last_report = (now, self.totals);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::PeerMetrics;
    use crate::mumble::crypt::CryptStats;
    use std::time::{Duration, Instant};

    /// Rates are deltas over the report interval; totals keep running.
    #[test]
    fn report_computes_interval_rates() {
        // Arrange
        let start = Instant::now();
        let mut metrics = PeerMetrics::new(start);
        for _ in 0..100 {
            metrics.record_uplink_frame(100);
        }
        // Act: first report after two seconds.
        let first = metrics.report(0, start + Duration::from_secs(2));
        // Another fifty frames over the next second.
        for _ in 0..50 {
            metrics.record_uplink_frame(100);
        }
        let second = metrics.report(3, start + Duration::from_secs(3));
        // Assert
        assert_eq!(first.voice_uplink_frames, 100);
        assert!((first.voice_uplink_fps - 50.0).abs() < 1e-6);
        assert!((first.voice_uplink_kbps - 40.0).abs() < 1e-6);
        assert_eq!(second.voice_uplink_frames, 150);
        assert!((second.voice_uplink_fps - 50.0).abs() < 1e-6);
        assert_eq!(second.voice_uplink_pacer_dropped_frames_total, 3);
    }

    /// Session teardown clears the gauges but not the totals.
    #[test]
    fn session_close_resets_gauges() {
        // Arrange
        let start = Instant::now();
        let mut metrics = PeerMetrics::new(start);
        metrics.record_downlink_frame(64);
        metrics.set_server_rtt(23);
        metrics.set_udp_rtt(11, CryptStats::default());
        metrics.set_udp_ready(true);
        // Act
        metrics.session_closed();
        let report = metrics.report(0, start + Duration::from_secs(1));
        // Assert
        assert_eq!(report.voice_downlink_frames, 1);
        assert_eq!(report.server_rtt_ms, None);
        assert_eq!(report.udp_rtt_ms, None);
        assert!(!report.udp_ready);
        assert_eq!(report.crypt_good, None);
    }

    /// Downlink drops accumulate separately from delivered frames.
    #[test]
    fn downlink_drops_are_counted() {
        // Arrange
        let start = Instant::now();
        let mut metrics = PeerMetrics::new(start);
        metrics.record_downlink_frame(64);
        metrics.record_downlink_drop();
        metrics.record_downlink_drop();
        // Act
        let report = metrics.report(0, start + Duration::from_secs(1));
        // Assert
        assert_eq!(report.voice_downlink_frames, 1);
        assert_eq!(report.voice_downlink_dropped_frames, 2);
    }
}
