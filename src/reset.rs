// =============================================================================
// Reset Scheduler — daily reset at a configured wall-clock time and timezone
// =============================================================================
//
// The trading day is the interval between two consecutive reset firings in
// the configured timezone. `TradingCalendar` turns any UTC instant into a
// trading-day key and computes the next fire time; the scheduler task sleeps
// until that instant, performs the reset, and reschedules.
//
// Daylight-saving rules: the next fire time is computed in the configured
// zone; an ambiguous local time (fall-back hour) resolves to the LATER UTC
// instant, and a nonexistent local time (spring-forward gap) shifts one hour
// forward.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::DailyResetCfg;
use crate::domain::{EventType, RiskEvent};
use crate::engine::EngineMsg;
use crate::errors::RiskError;
use crate::lockout::LockoutManager;
use crate::pnl::PnlTracker;

// ---------------------------------------------------------------------------
// Trading calendar
// ---------------------------------------------------------------------------

/// Maps instants to trading-day keys and reset fire times.
#[derive(Debug, Clone, Copy)]
pub struct TradingCalendar {
    tz: Tz,
    reset_time: NaiveTime,
}

impl TradingCalendar {
    pub fn new(cfg: &DailyResetCfg) -> Result<Self, RiskError> {
        Ok(Self { tz: cfg.timezone, reset_time: cfg.reset_time()? })
    }

    /// Trading-day key (`YYYY-MM-DD`) for an instant. A trading day is named
    /// by the local calendar date on which it ends: at or after the reset
    /// time, the key advances to the next date.
    pub fn trading_day(&self, now: DateTime<Utc>) -> String {
        let local = now.with_timezone(&self.tz);
        let date = if local.time() >= self.reset_time {
            local.date_naive() + Duration::days(1)
        } else {
            local.date_naive()
        };
        date.format("%Y-%m-%d").to_string()
    }

    /// The next reset instant strictly after `now`.
    pub fn next_fire(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.tz);
        let mut date = local_now.date_naive();
        if local_now.time() >= self.reset_time {
            date += Duration::days(1);
        }

        loop {
            let naive = date.and_time(self.reset_time);
            match self.tz.from_local_datetime(&naive) {
                // Ambiguous (clocks fell back): take the later instant.
                LocalResult::Ambiguous(_, later) => return later.with_timezone(&Utc),
                LocalResult::Single(instant) => return instant.with_timezone(&Utc),
                // Nonexistent (clocks sprang forward): shift one hour.
                LocalResult::None => {
                    let shifted = naive + Duration::hours(1);
                    if let Some(instant) = self.tz.from_local_datetime(&shifted).earliest() {
                        return instant.with_timezone(&Utc);
                    }
                    // Still unrepresentable; try the next day.
                    date += Duration::days(1);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler task
// ---------------------------------------------------------------------------

/// Fires the daily reset: P&L rows roll over, expired and daily-rule lockouts
/// clear, and a DAILY_RESET event reaches the engine so rules can reset
/// per-day counters.
pub struct ResetScheduler {
    calendar: TradingCalendar,
    pnl: Arc<PnlTracker>,
    lockouts: Arc<LockoutManager>,
    engine_tx: mpsc::UnboundedSender<EngineMsg>,
}

impl ResetScheduler {
    pub fn new(
        calendar: TradingCalendar,
        pnl: Arc<PnlTracker>,
        lockouts: Arc<LockoutManager>,
        engine_tx: mpsc::UnboundedSender<EngineMsg>,
    ) -> Self {
        Self { calendar, pnl, lockouts, engine_tx }
    }

    /// Run forever: sleep until the next fire time, reset, reschedule.
    pub async fn run(self) {
        loop {
            let now = Utc::now();
            let fire_at = self.calendar.next_fire(now);
            let sleep_for = (fire_at - now).to_std().unwrap_or_default();
            info!(fire_at = %fire_at, "daily reset scheduled");
            tokio::time::sleep(sleep_for).await;
            self.fire(Utc::now());
        }
    }

    /// Perform one reset. Public so tests can fire it synchronously.
    pub fn fire(&self, now: DateTime<Utc>) {
        info!(at = %now, "daily reset firing");

        for account in self.pnl.accounts() {
            if let Err(e) = self.pnl.reset_daily_pnl(&account) {
                error!(account = %account, error = %e, "daily pnl reset failed");
            }
            self.lockouts.clear_expired_and_daily(&account, now);

            let event = RiskEvent::new(EventType::DailyReset, account.clone());
            if self.engine_tx.send(EngineMsg::Event(event)).is_err() {
                warn!("engine queue closed during daily reset");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DailyResetCfg;

    fn calendar(time: &str, tz: &str) -> TradingCalendar {
        TradingCalendar::new(&DailyResetCfg {
            time: time.to_string(),
            timezone: tz.parse().unwrap(),
        })
        .unwrap()
    }

    #[test]
    fn trading_day_rolls_at_reset_time() {
        let cal = calendar("17:00", "America/Chicago");
        // 2025-11-03 16:59 CT (= 22:59 UTC, CST) is still trading day 11-03.
        let before: DateTime<Utc> = "2025-11-03T22:59:00Z".parse().unwrap();
        assert_eq!(cal.trading_day(before), "2025-11-03");
        // 17:00 CT exactly belongs to the next trading day.
        let at: DateTime<Utc> = "2025-11-03T23:00:00Z".parse().unwrap();
        assert_eq!(cal.trading_day(at), "2025-11-04");
    }

    #[test]
    fn next_fire_is_same_day_before_reset() {
        let cal = calendar("17:00", "America/Chicago");
        let now: DateTime<Utc> = "2025-11-03T15:00:00Z".parse().unwrap(); // 09:00 CT
        let fire = cal.next_fire(now);
        assert_eq!(fire.to_rfc3339(), "2025-11-03T23:00:00+00:00"); // 17:00 CST
    }

    #[test]
    fn next_fire_rolls_to_tomorrow_after_reset() {
        let cal = calendar("17:00", "America/Chicago");
        let now: DateTime<Utc> = "2025-11-03T23:30:00Z".parse().unwrap(); // 17:30 CT
        let fire = cal.next_fire(now);
        assert_eq!(fire.to_rfc3339(), "2025-11-04T23:00:00+00:00");
    }

    #[test]
    fn dst_fall_back_ambiguous_time_uses_later_instant() {
        // 2025-11-02 01:30 happens twice in America/Chicago (CDT then CST).
        let cal = calendar("01:30", "America/Chicago");
        let now: DateTime<Utc> = "2025-11-02T05:00:00Z".parse().unwrap(); // 00:00 CDT
        let fire = cal.next_fire(now);
        // Later instant = 01:30 CST = 07:30 UTC.
        assert_eq!(fire.to_rfc3339(), "2025-11-02T07:30:00+00:00");
    }

    #[test]
    fn dst_spring_forward_gap_shifts_one_hour() {
        // 2025-03-09 02:30 does not exist in America/Chicago.
        let cal = calendar("02:30", "America/Chicago");
        let now: DateTime<Utc> = "2025-03-09T07:00:00Z".parse().unwrap(); // 01:00 CST
        let fire = cal.next_fire(now);
        // 03:30 CDT = 08:30 UTC.
        assert_eq!(fire.to_rfc3339(), "2025-03-09T08:30:00+00:00");
    }

    #[test]
    fn next_fire_is_strictly_in_the_future() {
        let cal = calendar("17:00", "America/Chicago");
        let exactly: DateTime<Utc> = "2025-11-03T23:00:00Z".parse().unwrap();
        let fire = cal.next_fire(exactly);
        assert!(fire > exactly);
        assert_eq!(fire.to_rfc3339(), "2025-11-04T23:00:00+00:00");
    }

    #[test]
    fn fire_resets_pnl_releases_daily_lockouts_and_emits_reset_event() {
        use crate::domain::Money;
        use crate::persistence::Store;
        use crate::timers::TimerManager;
        use rust_decimal_macros::dec;

        let store = Arc::new(Store::open_in_memory().unwrap());
        let cal = TradingCalendar::new(&DailyResetCfg::default()).unwrap();
        let pnl = Arc::new(PnlTracker::new(store.clone(), cal));
        let timers = Arc::new(TimerManager::new());
        let lockouts = Arc::new(LockoutManager::new(store, timers));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // A losing day that ended in a hard-until-reset lockout.
        pnl.add_trade_pnl("ACC-1", Money::new(dec!(-156.50))).unwrap();
        lockouts.set_hard("ACC-1", "daily loss limit", None, "daily_realized_loss");
        assert!(lockouts.is_locked("ACC-1"));

        let scheduler = ResetScheduler::new(cal, pnl.clone(), lockouts.clone(), tx);
        scheduler.fire(Utc::now());

        assert_eq!(pnl.get_daily_pnl("ACC-1"), Money::ZERO);
        assert!(!lockouts.is_locked("ACC-1"), "daily lockout must be released");

        match rx.try_recv().expect("a reset event must be emitted") {
            EngineMsg::Event(event) => {
                assert_eq!(event.event_type, EventType::DailyReset);
                assert_eq!(event.account_id, "ACC-1");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
