//! Alarm log
//!
//! Alarms are open while `end_time` is NULL. A partial unique index on
//! `(type, location) WHERE end_time IS NULL` keeps at most one open alarm per
//! pair, so raising is a single `INSERT OR IGNORE` with no check-then-act race.

use crate::db::{format_timestamp, last_insert_id, Database};
use crate::error::{Error, Result};
use crate::schema::alarms;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

/// Alarm type emitted when a component crosses its lifetime threshold.
pub const LIFETIME_WARNING: &str = "Lifetime Warning";

pub const LIFETIME_WARNING_DETAILS: &str = "Exceeded lifetime threshold";

pub const DEFAULT_LIST_LIMIT: i64 = 100;

#[derive(Insertable)]
#[diesel(table_name = alarms)]
struct NewAlarm<'a> {
    alarm_type: &'a str,
    location: &'a str,
    start_time: &'a str,
    end_time: Option<&'a str>,
    details: Option<&'a str>,
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = alarms)]
pub struct Alarm {
    pub id: i32,
    #[serde(rename = "type")]
    pub alarm_type: String,
    pub location: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub details: Option<String>,
}

impl Alarm {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaiseOutcome {
    Raised(i32),
    /// An alarm with the same type and location is still open.
    Suppressed,
}

/// Raise on an existing connection, inside the caller's transaction.
pub(crate) fn raise_on(
    conn: &mut SqliteConnection,
    alarm_type: &str,
    location: &str,
    details: Option<&str>,
    now: DateTime<Utc>,
) -> Result<RaiseOutcome> {
    let start_time = format_timestamp(now);
    let inserted = diesel::insert_or_ignore_into(alarms::table)
        .values(&NewAlarm {
            alarm_type,
            location,
            start_time: &start_time,
            end_time: None,
            details,
        })
        .execute(conn)?;

    if inserted == 0 {
        tracing::debug!(alarm_type, location, "alarm already open, not raised again");
        return Ok(RaiseOutcome::Suppressed);
    }

    let id = last_insert_id(conn)?;
    tracing::info!(id, alarm_type, location, "alarm raised");
    Ok(RaiseOutcome::Raised(id))
}

/// Close every open alarm of `alarm_type` at `location`. Returns how many closed.
pub(crate) fn close_open_on(
    conn: &mut SqliteConnection,
    alarm_type: &str,
    location: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let end_time = format_timestamp(now);
    let closed = diesel::update(
        alarms::table
            .filter(alarms::alarm_type.eq(alarm_type))
            .filter(alarms::location.eq(location))
            .filter(alarms::end_time.is_null()),
    )
    .set(alarms::end_time.eq(Some(&end_time)))
    .execute(conn)?;
    Ok(closed)
}

impl Database {
    /// Record an alarm unless the same (type, location) is already open
    pub fn raise(
        &self,
        alarm_type: &str,
        location: &str,
        details: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<RaiseOutcome> {
        if alarm_type.trim().is_empty() {
            return Err(Error::Validation("alarm type is required".into()));
        }
        let mut conn = self.get_conn()?;
        conn.immediate_transaction(|conn| raise_on(conn, alarm_type, location, details, now))
    }

    /// Close an open alarm.
    ///
    /// Returns `Ok(false)` when the alarm exists but was already closed, and
    /// [`Error::NotFound`] when there is no such alarm.
    pub fn acknowledge(&self, alarm_id: i32, now: DateTime<Utc>) -> Result<bool> {
        let end_time = format_timestamp(now);
        let mut conn = self.get_conn()?;

        conn.immediate_transaction(|conn| {
            let changed = diesel::update(
                alarms::table
                    .filter(alarms::id.eq(alarm_id))
                    .filter(alarms::end_time.is_null()),
            )
            .set(alarms::end_time.eq(Some(&end_time)))
            .execute(conn)?;

            if changed > 0 {
                tracing::info!(alarm_id, "alarm acknowledged");
                return Ok(true);
            }

            let exists = alarms::table
                .find(alarm_id)
                .select(alarms::id)
                .first::<i32>(conn)
                .optional()?;
            match exists {
                Some(_) => Ok(false),
                None => Err(Error::NotFound(format!("alarm {}", alarm_id))),
            }
        })
    }

    /// Most recent alarms first
    pub fn list_alarms(&self, limit: i64) -> Result<Vec<Alarm>> {
        let mut conn = self.get_conn()?;
        let rows = alarms::table
            .order((alarms::start_time.desc(), alarms::id.desc()))
            .limit(limit)
            .select(Alarm::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Alarms that have not been acknowledged, oldest first
    pub fn open_alarms(&self) -> Result<Vec<Alarm>> {
        let mut conn = self.get_conn()?;
        let rows = alarms::table
            .filter(alarms::end_time.is_null())
            .order(alarms::id.asc())
            .select(Alarm::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }
}
