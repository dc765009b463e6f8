//! Clock synchronisation: two-way offset measurement, smoothing, drift estimation and
//! time correction per node.
//!
//! Round: coordinator records `t1` and sends a sync request; the node answers with its
//! receipt time `t2`; the coordinator records `t3` on reply.
//! `rtt = t3 - t1`, `offset = ((t2 - t1) + (t2 - t3)) / 2` (node clock minus coordinator clock).

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::config::CoordinatorConfig;
use crate::protocol::SyncPayload;

/// Largest node clock skew accepted from a sync reply. Anything further out is a bogus
/// timestamp rather than a clock to correct.
pub const MAX_CLOCK_SKEW_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Round trip and offset for one exchange. Offset is exact: no rounding before the halving.
/// `None` when the timestamps are too far apart to be a real exchange.
pub fn round_trip_offset(t1: i64, t2: i64, t3: i64) -> Option<(i64, f64)> {
    let rtt = t3.checked_sub(t1)?;
    let up = t2.checked_sub(t1)?;
    let down = t2.checked_sub(t3)?;
    if up.checked_abs()? > MAX_CLOCK_SKEW_MS || down.checked_abs()? > MAX_CLOCK_SKEW_MS {
        return None;
    }
    let offset = (up + down) as f64 / 2.0;
    Some((rtt, offset))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncSample {
    pub sequence: u64,
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
    pub rtt_ms: i64,
    pub offset_ms: f64,
    /// False for samples kept only for diagnostics (RTT at or above the ceiling).
    pub accepted: bool,
}

/// Per-node synchronisation state.
#[derive(Debug, Clone, Serialize)]
pub struct ClockOffsetEstimate {
    pub device_id: String,
    /// Smoothed offset, node time minus coordinator time.
    pub offset_ms: f64,
    pub drift_ppm: f64,
    pub last_rtt_ms: i64,
    pub history: VecDeque<SyncSample>,
    pub quality: f64,
    /// Coordinator time (`t3`) of the last accepted sample.
    pub last_sync_at: i64,
    /// Consecutive intervals without an accepted sample.
    pub missed_intervals: u32,
    pub accepted_samples: u64,
    /// Most recent measurement was below the RTT ceiling.
    pub trusted: bool,
}

impl ClockOffsetEstimate {
    fn accepted(&self) -> impl Iterator<Item = &SyncSample> {
        self.history.iter().filter(|s| s.accepted)
    }
}

/// Node-local time mapped onto the coordinator clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectedTime {
    pub time_ms: f64,
    /// False when the estimate is untrusted or quality is zero; data stays, flagged unaligned.
    pub synchronised: bool,
}

impl CorrectedTime {
    pub fn as_millis(&self) -> i64 {
        self.time_ms.round() as i64
    }
}

/// What a completed round changed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub sample: SyncSample,
    pub offset_ms: f64,
    pub quality: f64,
    /// The node went from synchronised to unsynchronised with this round.
    pub lost_sync: bool,
    /// The node went from unsynchronised to synchronised with this round.
    pub regained_sync: bool,
}

/// A sync request that got no reply in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MissedRound {
    pub device_id: String,
    pub sequence: u64,
    /// Quality reached zero with this miss.
    pub quality_lost: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("unexpected sync reply from {device_id} (sequence {sequence})")]
    UnexpectedReply { device_id: String, sequence: u64 },
    #[error("sync reply from {0} has no node_timestamp")]
    MissingNodeTimestamp(String),
    #[error("implausible sync timestamps from {device_id}: t1 {t1}, t2 {t2}, t3 {t3}")]
    ImplausibleTimestamp {
        device_id: String,
        t1: i64,
        t2: i64,
        t3: i64,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingRound {
    sequence: u64,
    t1: i64,
}

#[derive(Debug, Clone)]
struct ClockSyncConfig {
    interval_ms: i64,
    reply_timeout_ms: i64,
    rtt_ceiling_ms: i64,
    window: usize,
    history_len: usize,
    tolerance_ms: f64,
    max_missed: u32,
}

impl From<&CoordinatorConfig> for ClockSyncConfig {
    fn from(c: &CoordinatorConfig) -> Self {
        Self {
            interval_ms: c.sync_interval_ms,
            reply_timeout_ms: c.sync_reply_timeout_ms,
            rtt_ceiling_ms: c.rtt_ceiling_ms.max(1),
            window: c.smoothing_window.max(1),
            history_len: c.history_len.max(c.smoothing_window).max(3),
            tolerance_ms: if c.sync_tolerance_ms > 0.0 {
                c.sync_tolerance_ms
            } else {
                1.0
            },
            max_missed: c.max_missed_sync_intervals.max(1),
        }
    }
}

/// Clock synchronisation engine. Single-writer: owned by the coordinator.
pub struct ClockSync {
    config: ClockSyncConfig,
    estimates: HashMap<String, ClockOffsetEstimate>,
    pending: HashMap<String, PendingRound>,
    next_due: HashMap<String, i64>,
    next_sequence: u64,
}

impl ClockSync {
    pub fn new(config: &CoordinatorConfig) -> Self {
        Self {
            config: ClockSyncConfig::from(config),
            estimates: HashMap::new(),
            pending: HashMap::new(),
            next_due: HashMap::new(),
            next_sequence: 1,
        }
    }

    /// Start a round: records `t1 = now` and returns the request payload.
    pub fn begin_round(&mut self, device_id: &str, now: i64) -> SyncPayload {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending
            .insert(device_id.to_string(), PendingRound { sequence, t1: now });
        self.next_due
            .insert(device_id.to_string(), now + self.config.interval_ms);
        SyncPayload {
            master_timestamp: Some(now),
            node_timestamp: None,
            sync_sequence: sequence,
        }
    }

    /// Begin rounds for every candidate that is due and has nothing in flight.
    pub fn due_rounds(&mut self, candidates: &[String], now: i64) -> Vec<(String, SyncPayload)> {
        let due: Vec<String> = candidates
            .iter()
            .filter(|id| !self.pending.contains_key(id.as_str()))
            .filter(|id| self.next_due.get(id.as_str()).map_or(true, |&t| now >= t))
            .cloned()
            .collect();
        due.into_iter()
            .map(|id| {
                let req = self.begin_round(&id, now);
                (id, req)
            })
            .collect()
    }

    /// Force a round on the next `due_rounds` call (fresh hello, session arming).
    pub fn schedule_now(&mut self, device_id: &str) {
        self.next_due.remove(device_id);
    }

    /// Complete a round with the node's reply received at `now` (`t3`).
    pub fn on_reply(
        &mut self,
        device_id: &str,
        reply: &SyncPayload,
        now: i64,
    ) -> Result<SyncOutcome, SyncError> {
        let t2 = reply
            .node_timestamp
            .ok_or_else(|| SyncError::MissingNodeTimestamp(device_id.to_string()))?;
        let round = match self.pending.get(device_id) {
            Some(p) if p.sequence == reply.sync_sequence => *p,
            _ => {
                return Err(SyncError::UnexpectedReply {
                    device_id: device_id.to_string(),
                    sequence: reply.sync_sequence,
                })
            }
        };
        self.pending.remove(device_id);
        self.record_sample(device_id, round.sequence, round.t1, t2, now)
    }

    /// Record a measured exchange. Exposed for hosts that run the exchange themselves.
    /// Implausible timestamps are rejected and leave the estimate untouched.
    pub fn record_sample(
        &mut self,
        device_id: &str,
        sequence: u64,
        t1: i64,
        t2: i64,
        t3: i64,
    ) -> Result<SyncOutcome, SyncError> {
        let cfg = self.config.clone();
        let (rtt_ms, offset_ms) =
            round_trip_offset(t1, t2, t3).ok_or_else(|| SyncError::ImplausibleTimestamp {
                device_id: device_id.to_string(),
                t1,
                t2,
                t3,
            })?;
        let accepted = rtt_ms >= 0 && rtt_ms < cfg.rtt_ceiling_ms;
        let sample = SyncSample {
            sequence,
            t1,
            t2,
            t3,
            rtt_ms,
            offset_ms,
            accepted,
        };

        let est = self
            .estimates
            .entry(device_id.to_string())
            .or_insert_with(|| ClockOffsetEstimate {
                device_id: device_id.to_string(),
                offset_ms: 0.0,
                drift_ppm: 0.0,
                last_rtt_ms: rtt_ms,
                history: VecDeque::with_capacity(cfg.history_len),
                quality: 0.0,
                last_sync_at: t3,
                missed_intervals: 0,
                accepted_samples: 0,
                trusted: false,
            });
        let was_synchronised = is_synchronised(est);

        est.history.push_back(sample.clone());
        while est.history.len() > cfg.history_len {
            est.history.pop_front();
        }
        est.last_rtt_ms = rtt_ms;
        if accepted {
            est.accepted_samples += 1;
            est.missed_intervals = 0;
            est.trusted = true;
            est.last_sync_at = t3;
            est.offset_ms = smoothed_offset(est, cfg.window);
            est.drift_ppm = drift_ppm(est);
        } else {
            est.trusted = false;
            est.missed_intervals = est.missed_intervals.saturating_add(1);
        }
        est.quality = quality_score(est, &cfg);
        let now_synchronised = is_synchronised(est);

        Ok(SyncOutcome {
            offset_ms: est.offset_ms,
            quality: est.quality,
            sample,
            lost_sync: was_synchronised && !now_synchronised,
            regained_sync: !was_synchronised && now_synchronised,
        })
    }

    /// Drop requests that outlived the reply timeout; each counts as a missed interval.
    pub fn expire_pending(&mut self, now: i64) -> Vec<MissedRound> {
        let timeout = self.config.reply_timeout_ms;
        let mut expired: Vec<(String, PendingRound)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.t1) > timeout)
            .map(|(id, p)| (id.clone(), *p))
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        let cfg = self.config.clone();
        let mut out = Vec::with_capacity(expired.len());
        for (device_id, round) in expired {
            self.pending.remove(&device_id);
            let quality_lost = match self.estimates.get_mut(&device_id) {
                Some(est) => {
                    let before = est.quality;
                    est.missed_intervals = est.missed_intervals.saturating_add(1);
                    est.quality = quality_score(est, &cfg);
                    before > 0.0 && est.quality == 0.0
                }
                None => false,
            };
            out.push(MissedRound {
                device_id,
                sequence: round.sequence,
                quality_lost,
            });
        }
        out
    }

    /// `node_local_time - offset - drift * elapsed_since_last_sync`.
    pub fn corrected_time(&self, device_id: &str, node_local_time: i64) -> Option<CorrectedTime> {
        let est = self.estimates.get(device_id)?;
        if est.accepted_samples == 0 {
            return None;
        }
        let local = node_local_time as f64;
        let elapsed = (local - est.offset_ms) - est.last_sync_at as f64;
        let time_ms = local - est.offset_ms - est.drift_ppm / 1e6 * elapsed;
        Some(CorrectedTime {
            time_ms,
            synchronised: is_synchronised(est),
        })
    }

    /// Inverse of [`Self::corrected_time`]: the node-local reading at coordinator time `t`.
    pub fn to_node_time(&self, device_id: &str, coordinator_time: i64) -> Option<i64> {
        let est = self.estimates.get(device_id)?;
        if est.accepted_samples == 0 {
            return None;
        }
        let elapsed = coordinator_time.saturating_sub(est.last_sync_at) as f64;
        let local = coordinator_time as f64 + est.offset_ms + est.drift_ppm / 1e6 * elapsed;
        Some(local.round() as i64)
    }

    pub fn estimate(&self, device_id: &str) -> Option<&ClockOffsetEstimate> {
        self.estimates.get(device_id)
    }

    pub fn has_valid_sample(&self, device_id: &str) -> bool {
        self.estimates
            .get(device_id)
            .is_some_and(|e| e.accepted_samples > 0)
    }

    pub fn is_synchronised(&self, device_id: &str) -> bool {
        self.estimates.get(device_id).is_some_and(is_synchronised)
    }

    pub fn quality(&self, device_id: &str) -> f64 {
        self.estimates.get(device_id).map_or(0.0, |e| e.quality)
    }

    /// Channel closed: abandon the in-flight round; keep the estimate for resume.
    pub fn forget_pending(&mut self, device_id: &str) {
        self.pending.remove(device_id);
        self.next_due.remove(device_id);
    }

    /// Node removed from the registry.
    pub fn remove(&mut self, device_id: &str) -> Option<ClockOffsetEstimate> {
        self.forget_pending(device_id);
        self.estimates.remove(device_id)
    }

    pub fn clear(&mut self) {
        self.estimates.clear();
        self.pending.clear();
        self.next_due.clear();
    }
}

fn is_synchronised(est: &ClockOffsetEstimate) -> bool {
    est.trusted && est.accepted_samples > 0 && est.quality > 0.0
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn window_offsets(est: &ClockOffsetEstimate, window: usize) -> Vec<f64> {
    let accepted: Vec<f64> = est.accepted().map(|s| s.offset_ms).collect();
    let skip = accepted.len().saturating_sub(window);
    accepted[skip..].to_vec()
}

fn smoothed_offset(est: &ClockOffsetEstimate, window: usize) -> f64 {
    median(&mut window_offsets(est, window))
}

/// Least-squares slope of offset over measurement time, in ppm. Needs 3 accepted samples.
fn drift_ppm(est: &ClockOffsetEstimate) -> f64 {
    let points: Vec<(f64, f64)> = est
        .accepted()
        .map(|s| ((s.t1 + s.t3) as f64 / 2.0, s.offset_ms))
        .collect();
    if points.len() < 3 {
        return 0.0;
    }
    let x0 = points[0].0;
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x - x0).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var = 0.0;
    for (x, y) in &points {
        let dx = x - x0 - mean_x;
        cov += dx * (y - mean_y);
        var += dx * dx;
    }
    if var == 0.0 {
        return 0.0;
    }
    cov / var * 1e6
}

/// 0 with no accepted sample or after `max_missed` consecutive misses; otherwise the product of
/// an RTT factor, an offset-stability factor and a miss penalty.
fn quality_score(est: &ClockOffsetEstimate, cfg: &ClockSyncConfig) -> f64 {
    if est.accepted_samples == 0 || est.missed_intervals >= cfg.max_missed {
        return 0.0;
    }
    let last_good_rtt = est
        .accepted()
        .last()
        .map(|s| s.rtt_ms)
        .unwrap_or(cfg.rtt_ceiling_ms);
    let rtt_factor = (1.0 - last_good_rtt as f64 / cfg.rtt_ceiling_ms as f64).clamp(0.05, 1.0);

    let offsets = window_offsets(est, cfg.window);
    let n = offsets.len() as f64;
    let mean = offsets.iter().sum::<f64>() / n;
    let stddev = (offsets.iter().map(|o| (o - mean).powi(2)).sum::<f64>() / n).sqrt();
    let stability = 1.0 / (1.0 + stddev / cfg.tolerance_ms);

    let miss_factor = 1.0 - est.missed_intervals as f64 / cfg.max_missed as f64;
    rtt_factor * stability * miss_factor
}
