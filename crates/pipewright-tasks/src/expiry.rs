//! Expiry policies for cached task results
//!
//! A policy answers one question at lookup time: is this entry still valid?
//! Wall-clock policies compare instants, `Session` compares the process
//! session that wrote the entry, and `OnPipelineComplete` compares the run.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Local, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the current process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// The session of this process; stable for its whole lifetime
    pub fn current() -> Self {
        static CURRENT: OnceLock<SessionId> = OnceLock::new();
        *CURRENT.get_or_init(Self::fresh)
    }

    /// A session distinct from every other, as a new process would see
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A calendar-aware span of time.
///
/// Years and months are added on the calendar and clamp to the last day of
/// the target month; the remaining fields are fixed durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirySpan {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl ExpirySpan {
    pub fn years(years: u32) -> Self {
        Self { years, ..Self::default() }
    }

    pub fn months(months: u32) -> Self {
        Self { months, ..Self::default() }
    }

    pub fn weeks(weeks: u32) -> Self {
        Self { weeks, ..Self::default() }
    }

    pub fn days(days: u32) -> Self {
        Self { days, ..Self::default() }
    }

    pub fn hours(hours: u32) -> Self {
        Self { hours, ..Self::default() }
    }

    pub fn minutes(minutes: u32) -> Self {
        Self { minutes, ..Self::default() }
    }

    pub fn seconds(seconds: u32) -> Self {
        Self { seconds, ..Self::default() }
    }

    /// Add this span to an instant; `None` on overflow
    pub fn add_to<Tz: TimeZone>(&self, start: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        let fixed = Duration::try_weeks(i64::from(self.weeks))?
            .checked_add(&Duration::try_days(i64::from(self.days))?)?
            .checked_add(&Duration::try_hours(i64::from(self.hours))?)?
            .checked_add(&Duration::try_minutes(i64::from(self.minutes))?)?
            .checked_add(&Duration::try_seconds(i64::from(self.seconds))?)?;

        start
            .checked_add_months(Months::new(months))?
            .checked_add_signed(fixed)
    }
}

/// Rule deciding when a cached result stops being valid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExpiryPolicy {
    /// Valid until the process that wrote it exits
    #[default]
    Session,
    /// Always valid
    Never,
    /// Valid until a fixed instant
    AtDatetime(DateTime<Utc>),
    /// Valid for a span after creation
    FromNow(ExpirySpan),
    /// Valid for a span after the local midnight that began the creation day
    FromToday(ExpirySpan),
    /// Valid until the first local midnight after creation
    AtMidnight,
    /// Valid for the rest of the run that wrote it
    OnPipelineComplete(String),
}

/// When an entry stops being valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Never,
    At(DateTime<Utc>),
    EndOfSession,
    EndOfRun,
}

/// Who wrote an entry, and when
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStamp {
    pub created_at: DateTime<Utc>,
    pub session: SessionId,
    pub run: RunId,
}

/// The moment an entry is judged at
#[derive(Debug, Clone, Copy)]
pub struct ExpiryContext {
    pub now: DateTime<Utc>,
    pub session: SessionId,
    pub run: RunId,
    /// The run that wrote the entry has finished
    pub pipeline_completed: bool,
}

impl ExpiryContext {
    /// Context for lookups during a run in this process
    pub fn during_run(run: RunId) -> Self {
        Self {
            now: Utc::now(),
            session: SessionId::current(),
            run,
            pipeline_completed: false,
        }
    }

    /// Context for maintenance outside of any run
    pub fn detached() -> Self {
        Self {
            now: Utc::now(),
            session: SessionId::current(),
            run: RunId::new(),
            pipeline_completed: true,
        }
    }

    pub fn completed(mut self) -> Self {
        self.pipeline_completed = true;
        self
    }
}

impl ExpiryPolicy {
    /// The effective expiration of an entry created at `created_at`
    pub fn expiration(&self, created_at: DateTime<Utc>) -> Expiration {
        let at = |instant: Option<DateTime<Utc>>| instant.map_or(Expiration::Never, Expiration::At);

        match self {
            Self::Session => Expiration::EndOfSession,
            Self::Never => Expiration::Never,
            Self::AtDatetime(t) => Expiration::At(*t),
            Self::FromNow(span) => at(span.add_to(created_at)),
            Self::FromToday(span) => {
                let day = created_at.with_timezone(&Local).date_naive();
                at(local_midnight(day).and_then(|midnight| span.add_to(midnight)))
            }
            Self::AtMidnight => {
                let day = created_at.with_timezone(&Local).date_naive();
                at(day.succ_opt().and_then(local_midnight))
            }
            Self::OnPipelineComplete(_) => Expiration::EndOfRun,
        }
    }

    /// Whether an entry with the given stamp is expired in `ctx`
    pub fn is_expired(&self, stamp: &EntryStamp, ctx: &ExpiryContext) -> bool {
        match self.expiration(stamp.created_at) {
            Expiration::Never => false,
            Expiration::At(t) => ctx.now >= t,
            Expiration::EndOfSession => stamp.session != ctx.session,
            Expiration::EndOfRun => ctx.pipeline_completed || stamp.run != ctx.run,
        }
    }

    /// Remaining lifetime for instant-based policies, handed to the store
    pub fn ttl_hint(
        &self,
        created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<std::time::Duration> {
        match self.expiration(created_at) {
            Expiration::At(t) => Some((t - now).to_std().unwrap_or_default()),
            _ => None,
        }
    }
}

impl fmt::Display for ExpiryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => f.write_str("session"),
            Self::Never => f.write_str("never"),
            Self::AtDatetime(t) => write!(f, "at {}", t.to_rfc3339()),
            Self::FromNow(span) => write!(f, "from now {:?}", span),
            Self::FromToday(span) => write!(f, "from today {:?}", span),
            Self::AtMidnight => f.write_str("at midnight"),
            Self::OnPipelineComplete(task) => write!(f, "on pipeline complete ({})", task),
        }
    }
}

/// Start of `day` in local time, as UTC.
///
/// When midnight does not exist locally (a DST gap), the first instant of
/// the day an hour later is used.
fn local_midnight(day: NaiveDate) -> Option<DateTime<Utc>> {
    let midnight = day.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            Local
                .from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
        })
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn stamp(created_at: DateTime<Utc>) -> EntryStamp {
        EntryStamp {
            created_at,
            session: SessionId::current(),
            run: RunId::new(),
        }
    }

    fn ctx_at(now: DateTime<Utc>, run: RunId) -> ExpiryContext {
        ExpiryContext {
            now,
            session: SessionId::current(),
            run,
            pipeline_completed: false,
        }
    }

    #[test]
    fn test_month_addition_clamps() {
        let cases = [
            (utc(2025, 10, 31, 0), 4, utc(2026, 2, 28, 0)),
            (utc(2025, 10, 1, 0), 2, utc(2025, 12, 1, 0)),
            (utc(2025, 10, 1, 0), 0, utc(2025, 10, 1, 0)),
            (utc(2025, 10, 1, 0), 13, utc(2026, 11, 1, 0)),
        ];
        for (start, months, expected) in cases {
            assert_eq!(ExpirySpan::months(months).add_to(start), Some(expected));
        }
    }

    #[test]
    fn test_span_fixed_fields() {
        let span = ExpirySpan {
            weeks: 1,
            days: 1,
            hours: 1,
            minutes: 1,
            seconds: 1,
            ..ExpirySpan::default()
        };
        let start = utc(2025, 1, 1, 0);
        let expected = start + Duration::seconds(8 * 86_400 + 3_600 + 60 + 1);
        assert_eq!(span.add_to(start), Some(expected));
    }

    #[test]
    fn test_never() {
        let s = stamp(utc(2000, 1, 1, 0));
        let ctx = ctx_at(utc(2100, 1, 1, 0), s.run).completed();
        assert!(!ExpiryPolicy::Never.is_expired(&s, &ctx));
        assert_eq!(ExpiryPolicy::Never.expiration(s.created_at), Expiration::Never);
    }

    #[test]
    fn test_at_datetime() {
        let deadline = utc(2025, 6, 1, 12);
        let policy = ExpiryPolicy::AtDatetime(deadline);
        let s = stamp(utc(2025, 6, 1, 0));

        assert!(!policy.is_expired(&s, &ctx_at(utc(2025, 6, 1, 11), s.run)));
        assert!(policy.is_expired(&s, &ctx_at(deadline, s.run)));
    }

    #[test]
    fn test_from_now() {
        let policy = ExpiryPolicy::FromNow(ExpirySpan::hours(1));
        let s = stamp(utc(2025, 6, 1, 0));

        assert!(!policy.is_expired(&s, &ctx_at(s.created_at + Duration::minutes(59), s.run)));
        assert!(policy.is_expired(&s, &ctx_at(s.created_at + Duration::hours(1), s.run)));
    }

    #[test]
    fn test_at_midnight() {
        let policy = ExpiryPolicy::AtMidnight;
        let s = stamp(local(2025, 6, 10, 22, 0));

        assert!(!policy.is_expired(&s, &ctx_at(local(2025, 6, 10, 23, 59), s.run)));
        assert!(policy.is_expired(&s, &ctx_at(local(2025, 6, 11, 0, 0), s.run)));
        assert_eq!(
            policy.expiration(s.created_at),
            Expiration::At(local(2025, 6, 11, 0, 0))
        );
    }

    #[test]
    fn test_from_today() {
        let policy = ExpiryPolicy::FromToday(ExpirySpan::hours(6));
        let s = stamp(local(2025, 6, 10, 3, 0));

        assert_eq!(policy.expiration(s.created_at), Expiration::At(local(2025, 6, 10, 6, 0)));
        assert!(!policy.is_expired(&s, &ctx_at(local(2025, 6, 10, 5, 0), s.run)));
        assert!(policy.is_expired(&s, &ctx_at(local(2025, 6, 10, 6, 0), s.run)));
    }

    #[test]
    fn test_session() {
        let policy = ExpiryPolicy::Session;
        let s = stamp(utc(2025, 6, 1, 0));
        let same_session = ctx_at(utc(2099, 1, 1, 0), RunId::new());
        assert!(!policy.is_expired(&s, &same_session));

        let new_session = ExpiryContext {
            session: SessionId::fresh(),
            ..ctx_at(s.created_at, s.run)
        };
        assert!(policy.is_expired(&s, &new_session));
    }

    #[test]
    fn test_on_pipeline_complete() {
        let policy = ExpiryPolicy::OnPipelineComplete("load".to_string());
        let s = stamp(utc(2025, 6, 1, 0));

        assert!(!policy.is_expired(&s, &ctx_at(s.created_at, s.run)));
        assert!(policy.is_expired(&s, &ctx_at(s.created_at, s.run).completed()));
        assert!(policy.is_expired(&s, &ctx_at(s.created_at, RunId::new())));
    }

    #[test]
    fn test_ttl_hint() {
        let created = utc(2025, 6, 1, 0);
        let policy = ExpiryPolicy::FromNow(ExpirySpan::minutes(10));
        let hint = policy.ttl_hint(created, created + Duration::minutes(4));
        assert_eq!(hint, Some(std::time::Duration::from_secs(360)));

        let past = policy.ttl_hint(created, created + Duration::hours(1));
        assert_eq!(past, Some(std::time::Duration::ZERO));

        assert_eq!(ExpiryPolicy::Session.ttl_hint(created, created), None);
    }

    #[test]
    fn test_session_current_is_stable() {
        assert_eq!(SessionId::current(), SessionId::current());
        assert_ne!(SessionId::current(), SessionId::fresh());
    }

    #[test]
    fn test_policy_serde() {
        let policy = ExpiryPolicy::OnPipelineComplete("sum".to_string());
        let json = serde_json::to_string(&policy).unwrap();
        let back: ExpiryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);

        let json = serde_json::to_string(&ExpiryPolicy::Session).unwrap();
        assert_eq!(json, r#"{"kind":"session"}"#);
    }
}
