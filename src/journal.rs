// =============================================================================
// Trade Journal — append-only event log with restart replay
// =============================================================================
//
// Every observable event (setup admitted, entry filled, stop replaced, exit,
// force-close) is emitted as one JSONL record. The engine never reads the
// log back except at startup, where today's records rebuild the two tallies
// the risk gate needs: realized PnL and the filled-trade count.
//
// A bounded in-memory ring of recent events backs the dashboard's trade
// list.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Side;

/// Maximum number of events retained in memory for the dashboard.
const MAX_RECENT_EVENTS: usize = 200;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SetupAdmitted,
    EntryFilled,
    StopReplaced,
    Exit,
    ForceClose,
}

/// One observable event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub ts: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub size: u32,
    pub price: f64,
    #[serde(default)]
    pub fees: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl: Option<f64>,
    pub event_kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_order_id: Option<String>,
}

/// Outbound event log. The store behind it is opaque to the core.
pub trait EventSink: Send + Sync {
    fn record(&self, event: TradeEvent);

    /// Most recent events, newest last.
    fn recent(&self, count: usize) -> Vec<TradeEvent>;
}

// =============================================================================
// JSONL journal
// =============================================================================

/// File-backed journal, one JSON object per line.
pub struct JsonlJournal {
    path: PathBuf,
    file: Mutex<File>,
    recent: Mutex<Vec<TradeEvent>>,
}

impl JsonlJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal at {}", path.display()))?;

        info!(path = %path.display(), "journal opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
            recent: Mutex::new(Vec::new()),
        })
    }

    /// Rebuild today's tallies from the log: (realized_pnl,
    /// filled_trade_count). `today` is the market-local trading date; event
    /// timestamps are UTC and mapped through `to_local_date`.
    pub fn replay_today(
        &self,
        today: NaiveDate,
        to_local_date: impl Fn(DateTime<Utc>) -> NaiveDate,
    ) -> Result<(f64, u32)> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to reopen journal at {}", self.path.display()))?;

        let mut realized_pnl = 0.0;
        let mut filled_trade_count = 0u32;

        for line in BufReader::new(file).lines() {
            let line = line.context("failed to read journal line")?;
            if line.trim().is_empty() {
                continue;
            }
            let event: TradeEvent = match serde_json::from_str(&line) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping malformed journal line");
                    continue;
                }
            };
            if to_local_date(event.ts) != today {
                continue;
            }
            match event.event_kind {
                EventKind::EntryFilled => filled_trade_count += 1,
                EventKind::Exit | EventKind::ForceClose => {
                    realized_pnl += event.realized_pnl.unwrap_or(0.0);
                }
                _ => {}
            }
        }

        info!(realized_pnl, filled_trade_count, "journal replay complete");
        Ok((realized_pnl, filled_trade_count))
    }
}

impl EventSink for JsonlJournal {
    fn record(&self, event: TradeEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => {
                let mut file = self.file.lock();
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "failed to append journal event");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialise journal event"),
        }

        let mut recent = self.recent.lock();
        recent.push(event);
        while recent.len() > MAX_RECENT_EVENTS {
            recent.remove(0);
        }
    }

    fn recent(&self, count: usize) -> Vec<TradeEvent> {
        let recent = self.recent.lock();
        let start = recent.len().saturating_sub(count);
        recent[start..].to_vec()
    }
}

// =============================================================================
// In-memory journal (tests, and Demo runs that want no file)
// =============================================================================

#[derive(Default)]
pub struct MemoryJournal {
    events: Mutex<Vec<TradeEvent>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TradeEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for MemoryJournal {
    fn record(&self, event: TradeEvent) {
        self.events.lock().push(event);
    }

    fn recent(&self, count: usize) -> Vec<TradeEvent> {
        let events = self.events.lock();
        let start = events.len().saturating_sub(count);
        events[start..].to_vec()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(kind: EventKind, ts: DateTime<Utc>, pnl: Option<f64>) -> TradeEvent {
        TradeEvent {
            ts,
            symbol: "AAPL".to_string(),
            side: Side::Long,
            size: 50,
            price: 100.0,
            fees: 0.0,
            realized_pnl: pnl,
            event_kind: kind,
            parent_order_id: None,
        }
    }

    #[test]
    fn replay_rebuilds_today_only() {
        let dir = std::env::temp_dir().join(format!("meridian-journal-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("journal.jsonl");

        let journal = JsonlJournal::open(&path).unwrap();
        let today_ts = Utc.with_ymd_and_hms(2026, 7, 1, 15, 0, 0).unwrap();
        let yesterday_ts = Utc.with_ymd_and_hms(2026, 6, 30, 15, 0, 0).unwrap();

        journal.record(event(EventKind::EntryFilled, yesterday_ts, None));
        journal.record(event(EventKind::Exit, yesterday_ts, Some(500.0)));
        journal.record(event(EventKind::SetupAdmitted, today_ts, None));
        journal.record(event(EventKind::EntryFilled, today_ts, None));
        journal.record(event(EventKind::EntryFilled, today_ts, None));
        journal.record(event(EventKind::Exit, today_ts, Some(-120.0)));
        journal.record(event(EventKind::ForceClose, today_ts, Some(35.0)));

        let today = chrono::NaiveDate::from_ymd_opt(2026, 7, 1).unwrap();
        let (pnl, count) = journal.replay_today(today, |ts| ts.date_naive()).unwrap();
        assert_eq!(count, 2);
        assert!((pnl + 85.0).abs() < 1e-10);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn recent_ring_is_bounded() {
        let journal = MemoryJournal::new();
        let ts = Utc.with_ymd_and_hms(2026, 7, 1, 15, 0, 0).unwrap();
        for _ in 0..10 {
            journal.record(event(EventKind::StopReplaced, ts, None));
        }
        assert_eq!(journal.recent(3).len(), 3);
        assert_eq!(journal.recent(100).len(), 10);
    }

    #[test]
    fn event_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2026, 7, 1, 15, 0, 0).unwrap();
        let e = event(EventKind::Exit, ts, Some(42.0));
        let json = serde_json::to_string(&e).unwrap();
        let back: TradeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_kind, EventKind::Exit);
        assert!((back.realized_pnl.unwrap() - 42.0).abs() < f64::EPSILON);
    }
}
