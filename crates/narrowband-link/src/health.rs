//! Connection-Health Tracker.
//!
//! Remembers, per channel and direction, when the last send or receive
//! succeeded and when one last failed. The records feed a status text
//! for the "why hasn't my move arrived" dialog and a small icon state
//! (two arrows that go green or red, flashing briefly on success).
//!
//! Records are created on first use and never deleted. Every read and
//! write goes through one mutex; this is a status surface, not a hot
//! path.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use narrowband_transport::{ChannelType, Direction};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A success younger than this makes its arrow flash.
pub const FLASH_WINDOW: Duration = Duration::from_secs(1);

/// How many stall samples are kept per channel.
const MAX_STALL_SAMPLES: usize = 100;

/// Outcome history of one `(channel, direction)` pair. Times are
/// milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub last_success: Option<u64>,
    pub last_failure: Option<u64>,
    /// Whether the most recent outcome was a success.
    pub success_newer: bool,
}

impl ConnectionRecord {
    fn update(&mut self, success: bool, now_ms: u64) {
        if success {
            self.last_success = Some(now_ms);
        } else {
            self.last_failure = Some(now_ms);
        }
        self.success_newer = success;
    }

    fn is_empty(&self) -> bool {
        self.last_success.is_none() && self.last_failure.is_none()
    }

    fn newer(&self) -> Option<u64> {
        if self.success_newer {
            self.last_success
        } else {
            self.last_failure
        }
    }

    fn older(&self) -> Option<u64> {
        if self.success_newer {
            self.last_failure
        } else {
            self.last_success
        }
    }
}

/// Colour of one arrow in the status icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    /// Nothing recorded yet.
    Unknown,
    /// At least one channel's latest outcome was a success.
    Healthy,
    Failing,
}

/// Projection of the records onto the two-arrow status icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IconState {
    pub outbound: LinkHealth,
    pub inbound: LinkHealth,
    pub flash_outbound: bool,
    pub flash_inbound: bool,
}

/// Serializable copy of every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub records: Vec<HealthEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthEntry {
    pub channel: ChannelType,
    pub direction: Direction,
    pub record: ConnectionRecord,
}

#[derive(Default)]
struct ChannelRecords {
    inbound: ConnectionRecord,
    outbound: ConnectionRecord,
    /// Delays between a packet being queued by the platform and handled,
    /// oldest first.
    stalls: Vec<Duration>,
}

impl ChannelRecords {
    fn get(&self, direction: Direction) -> &ConnectionRecord {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    fn get_mut(&mut self, direction: Direction) -> &mut ConnectionRecord {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

/// Thread-safe tracker of per-channel send/receive outcomes.
#[derive(Default)]
pub struct ConnectionHealth {
    records: Mutex<HashMap<ChannelType, ChannelRecords>>,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one outcome, timestamped now.
    pub fn update(&self, channel: ChannelType, direction: Direction, success: bool) {
        self.update_at(channel, direction, success, now_ms());
    }

    fn update_at(&self, channel: ChannelType, direction: Direction, success: bool, now_ms: u64) {
        tracing::trace!(%channel, ?direction, success, "health update");
        self.records
            .lock()
            .entry(channel)
            .or_default()
            .get_mut(direction)
            .update(success, now_ms);
    }

    /// Copy of one record, if it was ever touched.
    pub fn record(&self, channel: ChannelType, direction: Direction) -> Option<ConnectionRecord> {
        let records = self.records.lock();
        let record = *records.get(&channel)?.get(direction);
        (!record.is_empty()).then_some(record)
    }

    /// Status text for one channel: latest send outcome, the older
    /// opposite outcome in parentheses if there is one, then the latest
    /// receipt.
    pub fn summarize(&self, channel: ChannelType) -> String {
        self.summarize_at(channel, now_ms())
    }

    fn summarize_at(&self, channel: ChannelType, now_ms: u64) -> String {
        let (outbound, inbound) = {
            let records = self.records.lock();
            match records.get(&channel) {
                Some(r) => (r.outbound, r.inbound),
                None => Default::default(),
            }
        };

        let mut text = String::new();
        match outbound.newer() {
            Some(when) => {
                let outcome = if outbound.success_newer {
                    "successful"
                } else {
                    "unsuccessful"
                };
                let _ = writeln!(text, "Last send was {outcome} ({})", format_age(now_ms, when));
                if let Some(older) = outbound.older() {
                    let other = if outbound.success_newer {
                        "failure"
                    } else {
                        "success"
                    };
                    let _ = writeln!(text, "(Last {other} was {})", format_age(now_ms, older));
                }
            }
            None => text.push_str("No sends\n"),
        }
        text.push('\n');
        match inbound.last_success {
            Some(when) => {
                let _ = write!(text, "Last receipt was {}", format_age(now_ms, when));
            }
            None => text.push_str("No receipts"),
        }
        text
    }

    /// Summaries of every listed channel, in display order. Channels
    /// users don't pick themselves only appear once they've been used.
    pub fn status_text(&self, channels: &[ChannelType]) -> String {
        let now = now_ms();
        let mut text = String::new();
        for channel in ChannelType::DISPLAY_ORDER {
            if !channels.contains(&channel) {
                continue;
            }
            if !channel.is_selectable()
                && self.record(channel, Direction::Inbound).is_none()
                && self.record(channel, Direction::Outbound).is_none()
            {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            let _ = writeln!(text, "*** {} ***", channel.long_name());
            text.push_str(&self.summarize_at(channel, now));
            if let Some(stalls) = self.stall_summary(channel) {
                text.push('\n');
                text.push_str(&stalls);
            }
        }
        text
    }

    /// Arrow colours and flashes for a game using `channels`.
    pub fn icon_state(&self, channels: &[ChannelType]) -> IconState {
        self.icon_state_at(channels, now_ms())
    }

    fn icon_state_at(&self, channels: &[ChannelType], now_ms: u64) -> IconState {
        let records = self.records.lock();
        let project = |direction: Direction| {
            let mut health = LinkHealth::Unknown;
            let mut flash = false;
            for record in channels
                .iter()
                .filter_map(|c| records.get(c))
                .map(|r| r.get(direction))
                .filter(|r| !r.is_empty())
            {
                if record.success_newer {
                    health = LinkHealth::Healthy;
                } else if health == LinkHealth::Unknown {
                    health = LinkHealth::Failing;
                }
                if let Some(success) = record.last_success {
                    flash |= now_ms.saturating_sub(success) < FLASH_WINDOW.as_millis() as u64;
                }
            }
            (health, flash)
        };
        let (outbound, flash_outbound) = project(Direction::Outbound);
        let (inbound, flash_inbound) = project(Direction::Inbound);
        IconState {
            outbound,
            inbound,
            flash_outbound,
            flash_inbound,
        }
    }

    /// Records how long the platform sat on a packet before handing it
    /// over. Only the most recent samples are kept.
    pub fn note_stall(&self, channel: ChannelType, delay: Duration) {
        let mut records = self.records.lock();
        let stalls = &mut records.entry(channel).or_default().stalls;
        if stalls.len() == MAX_STALL_SAMPLES {
            stalls.remove(0);
        }
        stalls.push(delay);
    }

    /// Average stall over the last 10 samples and over all kept samples.
    pub fn stall_summary(&self, channel: ChannelType) -> Option<String> {
        let records = self.records.lock();
        let stalls = &records.get(&channel)?.stalls;
        if stalls.is_empty() {
            return None;
        }
        let avg_ms = |s: &[Duration]| s.iter().sum::<Duration>().as_millis() / s.len() as u128;
        let recent = &stalls[stalls.len().saturating_sub(10)..];
        Some(format!(
            "Delivery delay: last {}: {}ms avg; last {}: {}ms avg",
            recent.len(),
            avg_ms(recent),
            stalls.len(),
            avg_ms(stalls)
        ))
    }

    /// Copies every non-empty record out for persistence.
    pub fn snapshot(&self) -> HealthSnapshot {
        let records = self.records.lock();
        let mut out = Vec::new();
        for channel in ChannelType::DISPLAY_ORDER {
            let Some(r) = records.get(&channel) else {
                continue;
            };
            for direction in [Direction::Inbound, Direction::Outbound] {
                let record = *r.get(direction);
                if !record.is_empty() {
                    out.push(HealthEntry {
                        channel,
                        direction,
                        record,
                    });
                }
            }
        }
        HealthSnapshot { records: out }
    }

    /// Loads records saved by [`snapshot`](Self::snapshot), replacing any
    /// with the same key.
    pub fn restore(&self, snapshot: HealthSnapshot) {
        let mut records = self.records.lock();
        for entry in snapshot.records {
            *records.entry(entry.channel).or_default().get_mut(entry.direction) = entry.record;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// "5 seconds ago", "1 minute ago", "just now".
fn format_age(now_ms: u64, then_ms: u64) -> String {
    let secs = now_ms.saturating_sub(then_ms) / 1000;
    let (n, unit) = match secs {
        0 => return "just now".to_string(),
        s if s < 60 => (s, "second"),
        s if s < 3600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3600, "hour"),
        s => (s / 86_400, "day"),
    };
    let plural = if n == 1 { "" } else { "s" };
    format!("{n} {unit}{plural} ago")
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    // =====================================================================
    // summarize()
    // =====================================================================

    #[test]
    fn test_summarize_failure_after_success_mentions_both() {
        let h = ConnectionHealth::new();
        h.update_at(ChannelType::Relay, Direction::Outbound, true, T0);
        h.update_at(ChannelType::Relay, Direction::Outbound, false, T0 + 60_000);

        let text = h.summarize_at(ChannelType::Relay, T0 + 65_000);

        assert!(text.starts_with("Last send was unsuccessful (5 seconds ago)\n"), "{text}");
        assert!(text.contains("(Last success was 1 minute ago)"), "{text}");
        assert!(text.ends_with("No receipts"), "{text}");
    }

    #[test]
    fn test_summarize_without_other_outcome_has_no_parenthetical() {
        let h = ConnectionHealth::new();
        h.update_at(ChannelType::Sms, Direction::Outbound, true, T0);
        h.update_at(ChannelType::Sms, Direction::Inbound, true, T0 - 7_200_000);

        let text = h.summarize_at(ChannelType::Sms, T0 + 1_000);

        assert_eq!(
            text,
            "Last send was successful (1 second ago)\n\nLast receipt was 2 hours ago"
        );
    }

    #[test]
    fn test_summarize_untouched_channel() {
        let h = ConnectionHealth::new();
        assert_eq!(h.summarize(ChannelType::Mqtt), "No sends\n\nNo receipts");
        assert!(h.record(ChannelType::Mqtt, Direction::Outbound).is_none());
    }

    #[test]
    fn test_status_text_hides_unused_nfc() {
        let h = ConnectionHealth::new();
        h.update(ChannelType::Sms, Direction::Outbound, true);

        let text = h.status_text(&[ChannelType::Nfc, ChannelType::Sms]);

        assert!(text.starts_with("*** Data SMS ***\n"), "{text}");
        assert!(!text.contains("NFC"));
    }

    // =====================================================================
    // icon_state()
    // =====================================================================

    #[test]
    fn test_icon_state_healthy_if_any_channel_succeeds_last() {
        let h = ConnectionHealth::new();
        h.update_at(ChannelType::Relay, Direction::Outbound, false, T0);
        h.update_at(ChannelType::Sms, Direction::Outbound, true, T0);
        h.update_at(ChannelType::Sms, Direction::Inbound, false, T0);

        let icon = h.icon_state_at(&[ChannelType::Relay, ChannelType::Sms], T0 + 500);

        assert_eq!(icon.outbound, LinkHealth::Healthy);
        assert_eq!(icon.inbound, LinkHealth::Failing);
        assert!(icon.flash_outbound);
        assert!(!icon.flash_inbound);

        let later = h.icon_state_at(&[ChannelType::Relay, ChannelType::Sms], T0 + 1_500);
        assert!(!later.flash_outbound);
    }

    #[test]
    fn test_icon_state_ignores_unlisted_channels() {
        let h = ConnectionHealth::new();
        h.update_at(ChannelType::Sms, Direction::Outbound, true, T0);

        let icon = h.icon_state_at(&[ChannelType::Relay], T0);

        assert_eq!(icon.outbound, LinkHealth::Unknown);
    }

    // =====================================================================
    // stalls and snapshots
    // =====================================================================

    #[test]
    fn test_stall_summary_averages_recent_and_all() {
        let h = ConnectionHealth::new();
        for ms in [100u64, 100, 400, 400, 400, 400, 400, 400, 400, 400, 400, 400] {
            h.note_stall(ChannelType::Sms, Duration::from_millis(ms));
        }

        let text = h.stall_summary(ChannelType::Sms).unwrap();

        assert_eq!(text, "Delivery delay: last 10: 400ms avg; last 12: 350ms avg");
        assert!(h.stall_summary(ChannelType::Relay).is_none());
    }

    #[test]
    fn test_snapshot_restore_round_trips_through_json() {
        let h = ConnectionHealth::new();
        h.update_at(ChannelType::Relay, Direction::Outbound, true, T0);
        h.update_at(ChannelType::Relay, Direction::Outbound, false, T0 + 1);
        h.update_at(ChannelType::P2p, Direction::Inbound, true, T0 + 2);

        let json = serde_json::to_string(&h.snapshot()).unwrap();
        let restored = ConnectionHealth::new();
        restored.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.snapshot(), h.snapshot());
        assert_eq!(
            restored.record(ChannelType::Relay, Direction::Outbound),
            Some(ConnectionRecord {
                last_success: Some(T0),
                last_failure: Some(T0 + 1),
                success_newer: false,
            })
        );
    }

    #[test]
    fn test_format_age_units() {
        assert_eq!(format_age(T0, T0), "just now");
        assert_eq!(format_age(T0 + 59_000, T0), "59 seconds ago");
        assert_eq!(format_age(T0 + 3 * 86_400_000, T0), "3 days ago");
    }
}
