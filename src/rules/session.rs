// =============================================================================
// Session window rule: no trading outside configured hours and days
// =============================================================================

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde_json::json;

use crate::config::{RuleAction, SessionBlockCfg, SessionHoursCfg};
use crate::domain::{EventType, RiskEvent};
use crate::errors::RiskError;
use crate::rules::{ActionRequest, EngineView, LockoutRequest, RiskRule, Severity, Violation};

/// Event kinds that count as trading activity for the session gate.
const TRADING_EVENTS: &[EventType] = &[
    EventType::OrderFilled,
    EventType::OrderPlaced,
    EventType::PositionOpened,
    EventType::PositionUpdated,
];

/// A trading event outside `[start, end)` on an allowed day (in the
/// session timezone) flattens the account and hard-locks until the next
/// session open.
pub struct SessionBlockOutside {
    cfg: SessionBlockCfg,
    tz: Tz,
    start: NaiveTime,
    end: NaiveTime,
    days: Vec<Weekday>,
}

impl SessionBlockOutside {
    pub fn new(cfg: SessionBlockCfg, hours: SessionHoursCfg) -> Result<Self, RiskError> {
        Ok(Self {
            cfg,
            tz: hours.timezone,
            start: hours.start_time()?,
            end: hours.end_time()?,
            days: hours.weekdays()?,
        })
    }

    fn in_session(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        if !self.days.contains(&local.weekday()) {
            return false;
        }
        let t = local.time();
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // Overnight window (e.g. 18:00 -> 08:00).
            t >= self.start || t < self.end
        }
    }

    /// The next instant the session opens, strictly after `now`.
    fn next_session_open(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.tz);
        for day_offset in 0..8 {
            let date = local_now.date_naive() + Duration::days(day_offset);
            let naive = date.and_time(self.start);
            let Some(candidate) = self
                .tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
            else {
                continue;
            };
            if candidate <= now {
                continue;
            }
            let weekday = candidate.with_timezone(&self.tz).weekday();
            if self.days.contains(&weekday) {
                return candidate;
            }
        }
        // Unreachable with a sane config; fall back to one day out.
        now + Duration::days(1)
    }
}

impl RiskRule for SessionBlockOutside {
    fn id(&self) -> &'static str {
        "session_block_outside"
    }

    fn evaluate(
        &mut self,
        event: &RiskEvent,
        view: &EngineView<'_>,
    ) -> Result<Option<Violation>, RiskError> {
        if !TRADING_EVENTS.contains(&event.event_type) {
            return Ok(None);
        }
        if self.in_session(view.now) {
            return Ok(None);
        }

        let next_open = self.next_session_open(view.now);
        let message = format!(
            "trading event {} outside session hours; next open {next_open}",
            event.event_type
        );
        let action = if self.cfg.action == RuleAction::Alert {
            ActionRequest::Alert
        } else {
            ActionRequest::FlattenAndLockout(LockoutRequest::Hard {
                reason: message.clone(),
                until: Some(next_open),
            })
        };

        Ok(Some(Violation {
            rule_id: self.id(),
            severity: if self.cfg.action == RuleAction::Alert {
                Severity::Warning
            } else {
                Severity::Critical
            },
            message,
            action,
            payload: json!({
                "event": event.event_type.to_string(),
                "next_session_open": next_open.to_rfc3339(),
            }),
        }))
    }
}
