//! Stream statistics scoped to the active preset.
//!
//! Counters cover exactly one preset activation: [`RtkStatistics::activate`]
//! clears them and returns a guard, and dropping the guard (when the
//! supervision tree unwinds) clears them again and marks the stream
//! inactive. Packets seen outside an activation are ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::packet::{PacketKind, RtkPacket};

#[derive(Debug, Default)]
struct StatsInner {
    active: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    last_packet_at: Mutex<Option<Instant>>,
    packets: AtomicU64,
    bytes: AtomicU64,
    forwarded_packets: AtomicU64,
    forwarded_bytes: AtomicU64,
    rtcm: AtomicU64,
    ubx: AtomicU64,
    nmea: AtomicU64,
    unknown: AtomicU64,
}

/// Cheap-to-clone handle to the shared counters.
#[derive(Debug, Clone, Default)]
pub struct RtkStatistics {
    inner: Arc<StatsInner>,
}

impl RtkStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a counting scope for a preset activation.
    ///
    /// Any previous counts are discarded. The returned guard must live as
    /// long as the activation; dropping it deactivates and clears.
    pub fn activate(&self) -> StatisticsScope {
        self.reset();
        *self.inner.started_at.lock().unwrap() = Some(Instant::now());
        self.inner.active.store(true, Ordering::SeqCst);
        StatisticsScope {
            stats: self.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Records a parsed packet.
    pub fn notify(&self, packet: &RtkPacket) {
        if !self.is_active() {
            return;
        }
        let inner = &self.inner;
        inner.packets.fetch_add(1, Ordering::Relaxed);
        inner.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
        let by_kind = match packet.kind {
            PacketKind::Rtcm => &inner.rtcm,
            PacketKind::Ubx => &inner.ubx,
            PacketKind::Nmea => &inner.nmea,
            PacketKind::Unknown => &inner.unknown,
        };
        by_kind.fetch_add(1, Ordering::Relaxed);
        *inner.last_packet_at.lock().unwrap() = Some(Instant::now());
    }

    /// Records a packet that was forwarded to subscribers.
    pub fn notify_forwarded(&self, packet: &RtkPacket) {
        if !self.is_active() {
            return;
        }
        self.inner.forwarded_packets.fetch_add(1, Ordering::Relaxed);
        self.inner
            .forwarded_bytes
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let inner = &self.inner;
        let now = Instant::now();
        let uptime_secs = inner
            .started_at
            .lock()
            .unwrap()
            .map(|t| now.duration_since(t).as_secs_f64());
        let secs_since_last_packet = inner
            .last_packet_at
            .lock()
            .unwrap()
            .map(|t| now.duration_since(t).as_secs_f64());
        StatisticsSnapshot {
            active: self.is_active(),
            uptime_secs,
            secs_since_last_packet,
            packets: inner.packets.load(Ordering::Relaxed),
            bytes: inner.bytes.load(Ordering::Relaxed),
            forwarded_packets: inner.forwarded_packets.load(Ordering::Relaxed),
            forwarded_bytes: inner.forwarded_bytes.load(Ordering::Relaxed),
            rtcm_packets: inner.rtcm.load(Ordering::Relaxed),
            ubx_packets: inner.ubx.load(Ordering::Relaxed),
            nmea_packets: inner.nmea.load(Ordering::Relaxed),
            unknown_packets: inner.unknown.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        let inner = &self.inner;
        inner.packets.store(0, Ordering::Relaxed);
        inner.bytes.store(0, Ordering::Relaxed);
        inner.forwarded_packets.store(0, Ordering::Relaxed);
        inner.forwarded_bytes.store(0, Ordering::Relaxed);
        inner.rtcm.store(0, Ordering::Relaxed);
        inner.ubx.store(0, Ordering::Relaxed);
        inner.nmea.store(0, Ordering::Relaxed);
        inner.unknown.store(0, Ordering::Relaxed);
        *inner.started_at.lock().unwrap() = None;
        *inner.last_packet_at.lock().unwrap() = None;
    }
}

/// Guard tying the counters to one preset activation.
#[derive(Debug)]
pub struct StatisticsScope {
    stats: RtkStatistics,
}

impl Drop for StatisticsScope {
    fn drop(&mut self) {
        self.stats.inner.active.store(false, Ordering::SeqCst);
        self.stats.reset();
    }
}

/// Serializable view of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub active: bool,
    pub uptime_secs: Option<f64>,
    pub secs_since_last_packet: Option<f64>,
    pub packets: u64,
    pub bytes: u64,
    pub forwarded_packets: u64,
    pub forwarded_bytes: u64,
    pub rtcm_packets: u64,
    pub ubx_packets: u64,
    pub nmea_packets: u64,
    pub unknown_packets: u64,
}
