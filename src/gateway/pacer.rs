//! Uplink pacer: voice frames leave for the Mumble server one per tick so a
//! bursty peer cannot flood the control channel. Under congestion only the
//! newest frame survives; end-of-talk markers jump the queue when it is
//! empty because talk-spurt tail latency is what users notice.
//!
//! The pacer is a pure state machine driven by explicit timestamps; the
//! supervisor owns the actual interval timer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

const DEFAULT_INTERVAL_MS: u64 = 20;
const DEFAULT_MAX_QUEUE_FRAMES: u64 = 200;
const DEFAULT_IDLE_TIMEOUT_MS: u64 = 250;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacerConfig {
    pub interval: Duration,
    pub max_queue_frames: usize,
    pub idle_timeout: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
            max_queue_frames: DEFAULT_MAX_QUEUE_FRAMES as usize,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
        }
    }
}

fn env_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

impl PacerConfig {
    /// Reads the `VOICE_UPLINK_PACING_*` environment knobs with their
    /// documented defaults and clamps.
    pub fn from_env() -> Self {
        Self {
            interval: Duration::from_millis(env_u64(
                "VOICE_UPLINK_PACING_INTERVAL_MS",
                DEFAULT_INTERVAL_MS,
                1,
                1000,
            )),
            max_queue_frames: env_u64(
                "VOICE_UPLINK_PACING_MAX_QUEUE_FRAMES",
                DEFAULT_MAX_QUEUE_FRAMES,
                1,
                2000,
            ) as usize,
            idle_timeout: Duration::from_millis(env_u64(
                "VOICE_UPLINK_PACING_IDLE_TIMEOUT_MS",
                DEFAULT_IDLE_TIMEOUT_MS,
                50,
                5000,
            )),
        }
    }
}

/// One queued uplink item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacerItem {
    Opus { target: u8, payload: Bytes },
    End { target: u8 },
}

impl PacerItem {
    fn is_opus(&self) -> bool {
        matches!(self, PacerItem::Opus { .. })
    }
}

#[derive(Debug)]
pub struct UplinkPacer {
    config: PacerConfig,
    queue: VecDeque<PacerItem>,
    active: bool,
    last_activity: Option<Instant>,
    dropped: u64,
}

impl UplinkPacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            active: false,
            last_activity: None,
            dropped: 0,
        }
    }

    /// Total frames dropped by queue policy since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped
    }

    /// Records a drop that happened past the pacer (a saturated session
    /// channel), so the counter covers the whole uplink path.
    pub fn note_external_drop(&mut self) {
        self.dropped += 1;
    }

    /// Whether the tick timer needs to run.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Offers one Opus frame. Returns the item to send immediately when the
    /// idle fast path applies; otherwise the frame is queued for a tick.
    pub fn push_opus(
        &mut self,
        target: u8,
        payload: Bytes,
        congested: bool,
        now: Instant,
    ) -> Option<PacerItem> {
        self.last_activity = Some(now);
        let item = PacerItem::Opus { target, payload };

        if !self.active && self.queue.is_empty() && !congested {
            return Some(item);
        }

        self.active = true;
        if congested {
            // Newest-only: everything older than this frame is stale audio.
            self.drop_all_opus();
        }
        self.queue.push_back(item);
        while self.queue.len() > self.config.max_queue_frames {
            self.queue.pop_front();
            self.dropped += 1;
        }
        None
    }

    /// Offers an end-of-talk marker. Sent immediately when nothing is
    /// queued; otherwise it replaces any earlier pending end marker at the
    /// tail.
    pub fn push_end(&mut self, target: u8, now: Instant) -> Option<PacerItem> {
        self.last_activity = Some(now);
        if self.queue.is_empty() {
            return Some(PacerItem::End { target });
        }
        self.queue.retain(|item| item.is_opus());
        self.queue.push_back(PacerItem::End { target });
        None
    }

    /// One pacer tick. Under congestion nothing is sent and stale frames are
    /// trimmed; otherwise the oldest item leaves. When the queue has been
    /// empty past the idle timeout the pacer switches itself off.
    pub fn tick(&mut self, congested: bool, now: Instant) -> Option<PacerItem> {
        if !self.active {
            return None;
        }
        if congested {
            self.trim_to_newest();
            return None;
        }
        if let Some(item) = self.queue.pop_front() {
            self.last_activity = Some(now);
            return Some(item);
        }
        if let Some(last) = self.last_activity {
            if now.duration_since(last) >= self.config.idle_timeout {
                self.active = false;
            }
        }
        None
    }

    /// Forgets everything; used when the session goes away mid-spurt.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.active = false;
        self.last_activity = None;
    }

    fn drop_all_opus(&mut self) {
        let before = self.queue.len();
        self.queue.retain(|item| !item.is_opus());
        self.dropped += (before - self.queue.len()) as u64;
    }

    fn trim_to_newest(&mut self) {
        let opus_count = self.queue.iter().filter(|item| item.is_opus()).count();
        if opus_count <= 1 {
            return;
        }
        let mut to_drop = opus_count - 1;
        let queue = &mut self.queue;
        queue.retain(|item| {
            if item.is_opus() && to_drop > 0 {
                to_drop -= 1;
                false
            } else {
                true
            }
        });
        self.dropped += (opus_count - 1) as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::{PacerConfig, PacerItem, UplinkPacer};
    use bytes::Bytes;
    use std::time::{Duration, Instant};

    fn frame(tag: u8) -> Bytes {
        Bytes::from(vec![tag; 4])
    }

    fn opus_tag(item: &PacerItem) -> u8 {
        match item {
            PacerItem::Opus { payload, .. } => payload[0],
            PacerItem::End { .. } => panic!("expected opus"),
        }
    }

    /// With an idle pacer and a clear buffer, frames bypass the queue.
    #[test]
    fn idle_fast_path_sends_directly() {
        // Arrange
        let mut pacer = UplinkPacer::new(PacerConfig::default());
        let now = Instant::now();
        // Act
        let sent = pacer.push_opus(0, frame(1), false, now);
        // Assert
        assert!(sent.is_some());
        assert!(!pacer.is_active());
        assert_eq!(pacer.queue_len(), 0);
    }

    /// Congestion on an idle pacer starts queueing instead of sending.
    #[test]
    fn congestion_disables_fast_path() {
        // Arrange
        let mut pacer = UplinkPacer::new(PacerConfig::default());
        let now = Instant::now();
        // Act
        let sent = pacer.push_opus(0, frame(1), true, now);
        // Assert
        assert!(sent.is_none());
        assert!(pacer.is_active());
        assert_eq!(pacer.queue_len(), 1);
    }

    /// A burst under sustained congestion collapses to the newest frame plus
    /// one end marker; the rest are counted as drops.
    #[test]
    fn congested_burst_keeps_newest_only() {
        // Arrange
        let mut pacer = UplinkPacer::new(PacerConfig::default());
        let now = Instant::now();
        // Act: thirty frames inside one tick while the buffer is full.
        for tag in 1..=30u8 {
            pacer.push_opus(0, frame(tag), true, now);
        }
        pacer.push_end(0, now);
        // Congested ticks send nothing.
        assert!(pacer.tick(true, now).is_none());
        // Once the buffer flushes, the newest frame and the end come out.
        let first = pacer.tick(false, now + Duration::from_millis(20));
        let second = pacer.tick(false, now + Duration::from_millis(40));
        let third = pacer.tick(false, now + Duration::from_millis(60));
        // Assert
        assert_eq!(opus_tag(&first.expect("missing frame")), 30);
        assert_eq!(second, Some(PacerItem::End { target: 0 }));
        assert!(third.is_none());
        assert!(pacer.dropped_total() >= 28);
    }

    /// The hard cap drops oldest-first when the queue overflows without
    /// congestion.
    #[test]
    fn hard_cap_drops_oldest() {
        // Arrange
        let config = PacerConfig {
            max_queue_frames: 3,
            ..Default::default()
        };
        let mut pacer = UplinkPacer::new(config);
        let now = Instant::now();
        // Prime the pacer so pushes queue instead of bypassing.
        pacer.push_opus(0, frame(0), true, now);
        // Act
        for tag in 1..=4u8 {
            pacer.push_opus(0, frame(tag), false, now);
        }
        // Assert: 0 and 1 fell off the front.
        assert_eq!(pacer.queue_len(), 3);
        assert_eq!(pacer.dropped_total(), 2);
        let first = pacer.tick(false, now).expect("missing frame");
        assert_eq!(opus_tag(&first), 2);
    }

    /// An end marker with an empty queue is sent immediately, even under
    /// congestion.
    #[test]
    fn end_marker_bypasses_empty_queue() {
        // Arrange
        let mut pacer = UplinkPacer::new(PacerConfig::default());
        let now = Instant::now();
        // Act
        let sent = pacer.push_end(0, now);
        // Assert
        assert_eq!(sent, Some(PacerItem::End { target: 0 }));
    }

    /// Only one end marker is ever pending: a newer one replaces the older.
    #[test]
    fn single_pending_end_marker() {
        // Arrange
        let mut pacer = UplinkPacer::new(PacerConfig::default());
        let now = Instant::now();
        pacer.push_opus(0, frame(1), true, now);
        // Act
        pacer.push_end(0, now);
        pacer.push_opus(0, frame(2), false, now);
        pacer.push_end(1, now);
        // Assert: opus, opus, single end with the newer target.
        let items: Vec<PacerItem> = std::iter::from_fn(|| pacer.tick(false, now)).collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_opus());
        assert!(items[1].is_opus());
        assert_eq!(items[2], PacerItem::End { target: 1 });
    }

    /// After the idle timeout with nothing queued the pacer deactivates.
    #[test]
    fn idle_timeout_stops_pacer() {
        // Arrange
        let mut pacer = UplinkPacer::new(PacerConfig::default());
        let start = Instant::now();
        pacer.push_opus(0, frame(1), true, start);
        assert!(pacer.tick(false, start).is_some());
        assert!(pacer.is_active());
        // Act: empty ticks before the timeout keep it armed.
        assert!(pacer.tick(false, start + Duration::from_millis(100)).is_none());
        assert!(pacer.is_active());
        // One past the timeout switches it off.
        assert!(pacer.tick(false, start + Duration::from_millis(400)).is_none());
        // Assert
        assert!(!pacer.is_active());
        // The next frame takes the fast path again.
        assert!(pacer
            .push_opus(0, frame(2), false, start + Duration::from_millis(500))
            .is_some());
    }

    /// At steady state every enqueued frame leaves: no spurious drops.
    #[test]
    fn steady_state_is_lossless() {
        // Arrange
        let mut pacer = UplinkPacer::new(PacerConfig::default());
        let mut now = Instant::now();
        pacer.push_opus(0, frame(1), true, now);
        // Act: one push per tick for a hundred ticks.
        let mut delivered = 0u64;
        for tag in 2..=100u8 {
            now += Duration::from_millis(20);
            pacer.push_opus(0, frame(tag), false, now);
            if pacer.tick(false, now).is_some() {
                delivered += 1;
            }
        }
        // Drain the tail.
        loop {
            now += Duration::from_millis(20);
            match pacer.tick(false, now) {
                Some(_) => delivered += 1,
                None => break,
            }
        }
        // Assert
        assert_eq!(delivered, 100);
        assert_eq!(pacer.dropped_total(), 0);
    }
}
