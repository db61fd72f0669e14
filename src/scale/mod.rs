//! Serial scale support (WLC protocol).
//!
//! The scale streams ASCII frames continuously; one frame carries a sign
//! character at byte 5 and a 9-character weight field in grams at bytes
//! 6..15. [`parse_weight`] decodes one frame. [`ScaleMonitor`] polls a
//! [`ScaleReader`] in the background, smooths the rate of change over a
//! sliding window and broadcasts [`ScaleEvent`]s, reconnecting when the
//! port drops.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ScaleSettings;
use crate::error::{AppResult, RigError};

#[cfg(feature = "scale_serial")]
pub mod serial;

const EVENT_CAPACITY: usize = 64;
const SHUTDOWN_JOIN_WAIT: Duration = Duration::from_secs(1);

/// Offset of the sign character in a WLC frame.
const SIGN_OFFSET: usize = 5;
/// Byte range of the weight field, grams.
const WEIGHT_FIELD: std::ops::Range<usize> = 6..15;

/// Decode one WLC frame into grams.
pub fn parse_weight(line: &str) -> AppResult<f64> {
    let bytes = line.as_bytes();
    if bytes.len() < WEIGHT_FIELD.end {
        return Err(RigError::Scale(format!(
            "frame too short ({} bytes): {line:?}",
            bytes.len()
        )));
    }
    let sign = if bytes[SIGN_OFFSET] == b'-' { -1.0 } else { 1.0 };
    let field = line
        .get(WEIGHT_FIELD)
        .ok_or_else(|| RigError::Scale(format!("weight field not ASCII: {line:?}")))?;
    let magnitude: f64 = field
        .trim()
        .parse()
        .map_err(|_| RigError::Scale(format!("bad weight field {field:?} in {line:?}")))?;
    Ok(sign * magnitude)
}

/// Events published by the scale monitor.
#[derive(Clone, Debug)]
pub enum ScaleEvent {
    /// New reading, in grams.
    WeightChanged { grams: f64, at: DateTime<Utc> },
    /// Smoothed rate of change, in grams per minute.
    RateChanged { grams_per_min: f64 },
    ConnectionChanged(bool),
}

/// A source of weight readings.
#[async_trait]
pub trait ScaleReader: Send {
    /// Take a fresh reading, in grams. An error means the connection is
    /// suspect; the monitor will attempt a reconnect.
    async fn read_weight(&mut self) -> AppResult<f64>;

    /// Re-establish the connection after a failed read.
    async fn reconnect(&mut self) -> AppResult<()>;
}

/// Random-walk scale for builds without hardware.
pub struct MockScale {
    grams: f64,
}

impl MockScale {
    pub fn new() -> Self {
        Self {
            grams: rand::thread_rng().gen_range(2.0..95.0),
        }
    }
}

impl Default for MockScale {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScaleReader for MockScale {
    async fn read_weight(&mut self) -> AppResult<f64> {
        let mut rng = rand::thread_rng();
        let step = rng.gen_range(2.0..5.0);
        let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        self.grams = (self.grams + sign * step).max(0.0);
        Ok(self.grams)
    }

    async fn reconnect(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Sliding-window smoothing of d(weight)/dt.
struct RateTracker {
    window: VecDeque<f64>,
    capacity: usize,
    last: Option<(Instant, f64)>,
}

impl RateTracker {
    fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            last: None,
        }
    }

    /// Fold in a reading; returns the smoothed rate in grams per minute.
    /// Zero readings are skipped, they usually mean the scale is not
    /// actually reporting.
    fn update(&mut self, at: Instant, grams: f64) -> Option<f64> {
        if grams == 0.0 {
            return None;
        }
        let (prev_at, prev_grams) = match self.last.replace((at, grams)) {
            Some(prev) => prev,
            None => return None,
        };
        let dt = at.duration_since(prev_at).as_secs_f64();
        if dt <= 0.0 {
            return None;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back((grams - prev_grams) / dt);
        let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
        Some(mean * 60.0)
    }

    fn reset(&mut self) {
        self.window.clear();
        self.last = None;
    }
}

/// Background poller publishing [`ScaleEvent`]s.
pub struct ScaleMonitor {
    events: broadcast::Sender<ScaleEvent>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ScaleMonitor {
    /// Spawn the poll task over `reader`.
    pub fn start(reader: Box<dyn ScaleReader>, settings: &ScaleSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(poll_loop(
            reader,
            settings.poll_interval,
            settings.rate_window,
            events.clone(),
            stop_rx,
        ));
        Self {
            events,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScaleEvent> {
        self.events.subscribe()
    }

    /// Stop the poll task and join it, with a bounded wait.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_JOIN_WAIT, task).await.is_err() {
                warn!("scale poll task did not stop in time");
            } else {
                debug!("scale poll task stopped");
            }
        }
    }
}

async fn poll_loop(
    mut reader: Box<dyn ScaleReader>,
    poll_interval: Duration,
    rate_window: usize,
    events: broadcast::Sender<ScaleEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut rate = RateTracker::new(rate_window);
    let mut connected = true;

    info!(?poll_interval, "scale monitor started");
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = interval.tick() => {}
        }

        match reader.read_weight().await {
            Ok(grams) => {
                if !connected {
                    connected = true;
                    let _ = events.send(ScaleEvent::ConnectionChanged(true));
                }
                let _ = events.send(ScaleEvent::WeightChanged {
                    grams,
                    at: Utc::now(),
                });
                if let Some(grams_per_min) = rate.update(Instant::now(), grams) {
                    let _ = events.send(ScaleEvent::RateChanged { grams_per_min });
                }
            }
            Err(err) => {
                if connected {
                    warn!(%err, "scale read failed, reconnecting");
                    connected = false;
                    rate.reset();
                    let _ = events.send(ScaleEvent::ConnectionChanged(false));
                }
                if let Err(err) = reader.reconnect().await {
                    debug!(%err, "scale reconnect attempt failed");
                }
            }
        }
    }
    info!("scale monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_weight_positive() {
        //            0123456789
        let line = "ws    000012.5 g";
        assert_eq!(parse_weight(line).unwrap(), 12.5);
    }

    #[test]
    fn test_parse_weight_negative() {
        let line = "ws   -000003.0 g";
        assert_eq!(parse_weight(line).unwrap(), -3.0);
    }

    #[test]
    fn test_parse_weight_integer_field() {
        let line = "ws    00000450 g";
        assert_eq!(parse_weight(line).unwrap(), 450.0);
    }

    #[test]
    fn test_parse_weight_short_frame() {
        assert!(matches!(parse_weight("ws 1"), Err(RigError::Scale(_))));
    }

    #[test]
    fn test_parse_weight_garbage_field() {
        assert!(matches!(
            parse_weight("ws    garbage!! g"),
            Err(RigError::Scale(_))
        ));
    }

    #[test]
    fn test_rate_tracker_constant_slope() {
        let mut rate = RateTracker::new(10);
        let t0 = Instant::now();
        assert!(rate.update(t0, 100.0).is_none());
        // 1 g/s for three seconds.
        let mut last = None;
        for i in 1..=3u64 {
            last = rate.update(t0 + Duration::from_secs(i), 100.0 + i as f64);
        }
        let per_min = last.unwrap();
        assert!((per_min - 60.0).abs() < 1e-9, "got {per_min}");
    }

    #[test]
    fn test_rate_tracker_skips_zero_readings() {
        let mut rate = RateTracker::new(10);
        let t0 = Instant::now();
        rate.update(t0, 50.0);
        assert!(rate.update(t0 + Duration::from_secs(1), 0.0).is_none());
        // The zero sample must not poison the baseline.
        let per_min = rate.update(t0 + Duration::from_secs(2), 52.0).unwrap();
        assert!((per_min - 60.0).abs() < 1e-9, "got {per_min}");
    }

    #[test]
    fn test_rate_tracker_window_bounds_history() {
        let mut rate = RateTracker::new(2);
        let t0 = Instant::now();
        rate.update(t0, 0.0);
        rate.update(t0, 10.0);
        for i in 1..=5u64 {
            rate.update(t0 + Duration::from_secs(i), 10.0 + i as f64);
        }
        assert_eq!(rate.window.len(), 2);
    }

    #[tokio::test]
    async fn test_mock_scale_never_negative() {
        let mut scale = MockScale::new();
        for _ in 0..100 {
            assert!(scale.read_weight().await.unwrap() >= 0.0);
        }
    }

    #[tokio::test]
    async fn test_monitor_publishes_weight() {
        let settings = ScaleSettings {
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let monitor = ScaleMonitor::start(Box::new(MockScale::new()), &settings);
        let mut events = monitor.subscribe();

        let event = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(event) = events.recv().await {
                    if matches!(event, ScaleEvent::WeightChanged { .. }) {
                        break event;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(event, ScaleEvent::WeightChanged { .. }));
        monitor.shutdown().await;
    }
}
