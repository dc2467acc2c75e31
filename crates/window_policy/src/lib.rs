use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use core_types::{Clock, LedgerError, Phase};
use serde::Serialize;

/// Weekly betting cycle. Tue-Thu accept predictions for the next day, Friday
/// waits on settlement, the weekend and Monday are closed.
pub fn phase(now: DateTime<Utc>) -> Phase {
    match now.weekday() {
        Weekday::Tue | Weekday::Wed | Weekday::Thu => Phase::Open,
        Weekday::Fri => Phase::ResultsPending,
        Weekday::Sat | Weekday::Sun | Weekday::Mon => Phase::Closed,
    }
}

/// Day a bet placed at `now` is about.
pub fn target_date(now: DateTime<Utc>) -> NaiveDate {
    let today = now.date_naive();
    today.succ_opt().unwrap_or(today)
}

/// Day whose outcome is being settled at `now`.
pub fn resolved_date(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// Returns the target date when betting is open, `PhaseClosed` otherwise.
pub fn ensure_open(now: DateTime<Utc>) -> Result<NaiveDate, LedgerError> {
    match phase(now) {
        Phase::Open => Ok(target_date(now)),
        other => Err(LedgerError::PhaseClosed(other)),
    }
}

/// Price in micro-USDC (6 decimals) of entering the pot for tomorrow. The
/// fee climbs through the week; Saturday falls back to the Sunday price.
pub fn entry_fee_micros(now: DateTime<Utc>) -> u64 {
    match target_date(now).weekday() {
        Weekday::Sun | Weekday::Sat => 10_000,
        Weekday::Mon => 20_000,
        Weekday::Tue => 30_000,
        Weekday::Wed => 40_000,
        Weekday::Thu => 50_000,
        Weekday::Fri => 60_000,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WindowSnapshot {
    pub now: DateTime<Utc>,
    pub phase: Phase,
    pub resolved_date: NaiveDate,
    pub target_date: Option<NaiveDate>,
    pub entry_fee_micros: u64,
}

pub fn snapshot(now: DateTime<Utc>) -> WindowSnapshot {
    let phase = phase(now);
    WindowSnapshot {
        now,
        phase,
        resolved_date: resolved_date(now),
        target_date: (phase == Phase::Open).then(|| target_date(now)),
        entry_fee_micros: entry_fee_micros(now),
    }
}

/// Window evaluated against an injected clock.
#[derive(Clone)]
pub struct WindowPolicy {
    clock: Arc<dyn Clock>,
}

impl WindowPolicy {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn current_phase(&self) -> Phase {
        phase(self.clock.now())
    }

    pub fn current(&self) -> WindowSnapshot {
        snapshot(self.clock.now())
    }
}
