//! Audit-safe batch ledger
//!
//! Measurements land in `batches_raw` and are never touched again. Corrections
//! are layered on top:
//!
//! - a **tombstone** removes a measurement from every effective read
//! - an **override** replaces individual sensor fields; the override with the
//!   highest id for a measurement is the current one
//!
//! Every reader goes through [`Database::query_effective`], which reads the
//! `batches_effective` view. The merge rule lives in that view and nowhere else.

use crate::db::{format_timestamp, last_insert_id, Database};
use crate::error::{Error, Result};
use crate::schema::*;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

// ============================================================================
// Public Types
// ============================================================================

/// Sensor values carried by a measurement. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Readings {
    pub steel_ball_type: Option<String>,
    pub power_kw: Option<f64>,
    pub steel_ball_kg: Option<f64>,
    pub voltage_ps: Option<f64>,
    pub impeller1_rpm: Option<f64>,
    pub impeller2_rpm: Option<f64>,
    pub current_ps: Option<f64>,
    pub current_impeller1: Option<f64>,
    pub current_impeller2: Option<f64>,
    pub current_dust: Option<f64>,
    pub current_main: Option<f64>,
    pub power_ps: Option<f64>,
    pub power_impeller1_kw: Option<f64>,
    pub power_impeller2_kw: Option<f64>,
    pub power_dust_kw: Option<f64>,
}

impl Readings {
    /// True when no field is set. An empty patch corrects nothing.
    pub fn is_empty(&self) -> bool {
        *self == Readings::default()
    }

    /// Parse a correction patch from a JSON object. Keys that are not sensor
    /// fields (typos, or identity fields like `batch_code`) are rejected.
    pub fn from_patch_json(json: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| Error::Validation(format!("invalid patch JSON: {}", e)))?;
        let serde_json::Value::Object(fields) = &value else {
            return Err(Error::Validation("patch must be a JSON object".into()));
        };

        let known = serde_json::to_value(Readings::default())
            .map_err(|e| Error::Validation(format!("invalid patch: {}", e)))?;
        if let Some(key) = fields.keys().find(|k| known.get(k.as_str()).is_none()) {
            return Err(Error::Validation(format!("'{}' is not a correctable field", key)));
        }

        serde_json::from_value(value).map_err(|e| Error::Validation(format!("invalid patch: {}", e)))
    }
}

/// A measurement as submitted by ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMeasurement {
    pub batch_code: String,
    pub date: String,
    pub time: String,
    pub shift: i32,
    #[serde(flatten)]
    pub readings: Readings,
}

/// Filter for [`Database::query_effective`]. `date` is required.
#[derive(Debug, Clone, Default)]
pub struct EffectiveFilter {
    pub date: String,
    pub batch_code: Option<String>,
    pub shift: Option<i32>,
    /// Inclusive `HH:MM:SS` upper bound on `time`.
    pub time_max: Option<String>,
}

impl EffectiveFilter {
    pub fn for_date(date: impl Into<String>) -> Self {
        Self { date: date.into(), ..Default::default() }
    }

    pub fn with_batch(mut self, batch_code: impl Into<String>) -> Self {
        self.batch_code = Some(batch_code.into());
        self
    }

    pub fn with_shift(mut self, shift: i32) -> Self {
        self.shift = Some(shift);
        self
    }

    pub fn with_time_max(mut self, time_max: impl Into<String>) -> Self {
        self.time_max = Some(time_max.into());
        self
    }

    /// Bound `time` to the end of the given hour (clamped to 0..=23).
    pub fn up_to_hour(self, hour: i32) -> Self {
        self.with_time_max(hour_upper_bound(hour))
    }
}

/// `19` becomes `"19:59:59"`. Hours outside 0..=23 are clamped.
pub fn hour_upper_bound(hour: i32) -> String {
    format!("{:02}:59:59", hour.clamp(0, 23))
}

// ============================================================================
// Diesel Models
// ============================================================================

#[derive(Insertable)]
#[diesel(table_name = batches_raw)]
struct NewRawRow<'a> {
    batch_code: &'a str,
    date: &'a str,
    time: &'a str,
    shift: i32,
    steel_ball_type: Option<&'a str>,
    power_kw: Option<f64>,
    steel_ball_kg: Option<f64>,
    voltage_ps: Option<f64>,
    impeller1_rpm: Option<f64>,
    impeller2_rpm: Option<f64>,
    current_ps: Option<f64>,
    current_impeller1: Option<f64>,
    current_impeller2: Option<f64>,
    current_dust: Option<f64>,
    current_main: Option<f64>,
    power_ps: Option<f64>,
    power_impeller1_kw: Option<f64>,
    power_impeller2_kw: Option<f64>,
    power_dust_kw: Option<f64>,
}

/// Queryable raw measurement (never mutated)
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = batches_raw)]
pub struct RawMeasurement {
    pub id: i32,
    pub batch_code: String,
    pub date: String,
    pub time: String,
    pub shift: i32,
    pub steel_ball_type: Option<String>,
    pub power_kw: Option<f64>,
    pub steel_ball_kg: Option<f64>,
    pub voltage_ps: Option<f64>,
    pub impeller1_rpm: Option<f64>,
    pub impeller2_rpm: Option<f64>,
    pub current_ps: Option<f64>,
    pub current_impeller1: Option<f64>,
    pub current_impeller2: Option<f64>,
    pub current_dust: Option<f64>,
    pub current_main: Option<f64>,
    pub power_ps: Option<f64>,
    pub power_impeller1_kw: Option<f64>,
    pub power_impeller2_kw: Option<f64>,
    pub power_dust_kw: Option<f64>,
}

#[derive(Insertable)]
#[diesel(table_name = batches_tombstone)]
struct NewTombstone<'a> {
    raw_id: i32,
    deleted_at: &'a str,
    deleted_by: Option<&'a str>,
    reason: Option<&'a str>,
}

#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = batches_tombstone)]
pub struct Tombstone {
    pub id: i32,
    pub raw_id: i32,
    pub deleted_at: String,
    pub deleted_by: Option<String>,
    pub reason: Option<String>,
}

#[derive(Insertable)]
#[diesel(table_name = batches_override)]
struct NewOverride<'a> {
    raw_id: i32,
    updated_at: &'a str,
    updated_by: Option<&'a str>,
    reason: Option<&'a str>,
    steel_ball_type: Option<&'a str>,
    power_kw: Option<f64>,
    steel_ball_kg: Option<f64>,
    voltage_ps: Option<f64>,
    impeller1_rpm: Option<f64>,
    impeller2_rpm: Option<f64>,
    current_ps: Option<f64>,
    current_impeller1: Option<f64>,
    current_impeller2: Option<f64>,
    current_dust: Option<f64>,
    current_main: Option<f64>,
    power_ps: Option<f64>,
    power_impeller1_kw: Option<f64>,
    power_impeller2_kw: Option<f64>,
    power_dust_kw: Option<f64>,
}

/// One correction record; `None` fields leave the raw value in place.
#[derive(Queryable, Selectable, Debug, Clone, Serialize)]
#[diesel(table_name = batches_override)]
pub struct Override {
    pub id: i32,
    pub raw_id: i32,
    pub updated_at: String,
    pub updated_by: Option<String>,
    pub reason: Option<String>,
    pub steel_ball_type: Option<String>,
    pub power_kw: Option<f64>,
    pub steel_ball_kg: Option<f64>,
    pub voltage_ps: Option<f64>,
    pub impeller1_rpm: Option<f64>,
    pub impeller2_rpm: Option<f64>,
    pub current_ps: Option<f64>,
    pub current_impeller1: Option<f64>,
    pub current_impeller2: Option<f64>,
    pub current_dust: Option<f64>,
    pub current_main: Option<f64>,
    pub power_ps: Option<f64>,
    pub power_impeller1_kw: Option<f64>,
    pub power_impeller2_kw: Option<f64>,
    pub power_dust_kw: Option<f64>,
}

/// A measurement as every report and dashboard sees it.
#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = batches_effective)]
pub struct EffectiveRow {
    pub id: i32,
    pub batch_code: String,
    pub date: String,
    pub time: String,
    pub shift: i32,
    pub steel_ball_type: Option<String>,
    pub power_kw: Option<f64>,
    pub steel_ball_kg: Option<f64>,
    pub voltage_ps: Option<f64>,
    pub impeller1_rpm: Option<f64>,
    pub impeller2_rpm: Option<f64>,
    pub current_ps: Option<f64>,
    pub current_impeller1: Option<f64>,
    pub current_impeller2: Option<f64>,
    pub current_dust: Option<f64>,
    pub current_main: Option<f64>,
    pub power_ps: Option<f64>,
    pub power_impeller1_kw: Option<f64>,
    pub power_impeller2_kw: Option<f64>,
    pub power_dust_kw: Option<f64>,
}

/// Full audit trail of one measurement.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementHistory {
    pub raw: RawMeasurement,
    pub tombstone: Option<Tombstone>,
    /// Oldest first; the last entry is the current override.
    pub overrides: Vec<Override>,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}

fn check_shift(shift: i32) -> Result<()> {
    if !(1..=3).contains(&shift) {
        return Err(Error::Validation(format!("shift must be 1, 2 or 3 (got {})", shift)));
    }
    Ok(())
}

fn raw_exists(conn: &mut SqliteConnection, raw_id: i32) -> Result<bool> {
    let found = batches_raw::table
        .find(raw_id)
        .select(batches_raw::id)
        .first::<i32>(conn)
        .optional()?;
    Ok(found.is_some())
}

impl Database {
    // ========================================================================
    // Writes
    // ========================================================================

    /// Append a measurement to the raw log
    pub fn append_raw(&self, m: &NewMeasurement) -> Result<i32> {
        require("batch_code", &m.batch_code)?;
        require("date", &m.date)?;
        require("time", &m.time)?;
        check_shift(m.shift)?;

        let r = &m.readings;
        let row = NewRawRow {
            batch_code: &m.batch_code,
            date: &m.date,
            time: &m.time,
            shift: m.shift,
            steel_ball_type: r.steel_ball_type.as_deref(),
            power_kw: r.power_kw,
            steel_ball_kg: r.steel_ball_kg,
            voltage_ps: r.voltage_ps,
            impeller1_rpm: r.impeller1_rpm,
            impeller2_rpm: r.impeller2_rpm,
            current_ps: r.current_ps,
            current_impeller1: r.current_impeller1,
            current_impeller2: r.current_impeller2,
            current_dust: r.current_dust,
            current_main: r.current_main,
            power_ps: r.power_ps,
            power_impeller1_kw: r.power_impeller1_kw,
            power_impeller2_kw: r.power_impeller2_kw,
            power_dust_kw: r.power_dust_kw,
        };

        let mut conn = self.get_conn()?;
        conn.immediate_transaction(|conn| {
            diesel::insert_into(batches_raw::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })
    }

    /// Tombstone a measurement. Re-deleting is a conflict, not a no-op.
    pub fn soft_delete(
        &self,
        raw_id: i32,
        actor: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let deleted_at = format_timestamp(now);
        let mut conn = self.get_conn()?;

        conn.immediate_transaction(|conn| {
            if !raw_exists(conn, raw_id)? {
                return Err(Error::NotFound(format!("raw measurement {}", raw_id)));
            }

            let existing = batches_tombstone::table
                .filter(batches_tombstone::raw_id.eq(raw_id))
                .select(batches_tombstone::id)
                .first::<i32>(conn)
                .optional()?;
            if existing.is_some() {
                tracing::warn!(raw_id, "delete rejected, measurement already tombstoned");
                return Err(Error::Conflict(format!("raw measurement {} is already deleted", raw_id)));
            }

            diesel::insert_into(batches_tombstone::table)
                .values(&NewTombstone { raw_id, deleted_at: &deleted_at, deleted_by: actor, reason })
                .execute(conn)?;
            Ok(())
        })?;

        tracing::info!(raw_id, actor = actor.unwrap_or("-"), "measurement tombstoned");
        Ok(())
    }

    /// Layer a field-level correction over a measurement.
    ///
    /// Fields left `None` in `patch` keep their current effective value. The
    /// tombstone is not consulted: corrections to deleted rows are kept but
    /// never become visible.
    pub fn apply_override(
        &self,
        raw_id: i32,
        patch: &Readings,
        actor: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        if patch.is_empty() {
            return Err(Error::Validation("override must set at least one field".into()));
        }

        let updated_at = format_timestamp(now);
        let row = NewOverride {
            raw_id,
            updated_at: &updated_at,
            updated_by: actor,
            reason,
            steel_ball_type: patch.steel_ball_type.as_deref(),
            power_kw: patch.power_kw,
            steel_ball_kg: patch.steel_ball_kg,
            voltage_ps: patch.voltage_ps,
            impeller1_rpm: patch.impeller1_rpm,
            impeller2_rpm: patch.impeller2_rpm,
            current_ps: patch.current_ps,
            current_impeller1: patch.current_impeller1,
            current_impeller2: patch.current_impeller2,
            current_dust: patch.current_dust,
            current_main: patch.current_main,
            power_ps: patch.power_ps,
            power_impeller1_kw: patch.power_impeller1_kw,
            power_impeller2_kw: patch.power_impeller2_kw,
            power_dust_kw: patch.power_dust_kw,
        };

        let mut conn = self.get_conn()?;
        let id = conn.immediate_transaction(|conn| {
            if !raw_exists(conn, raw_id)? {
                return Err(Error::NotFound(format!("raw measurement {}", raw_id)));
            }
            diesel::insert_into(batches_override::table).values(&row).execute(conn)?;
            last_insert_id(conn)
        })?;

        tracing::info!(raw_id, override_id = id, actor = actor.unwrap_or("-"), "override recorded");
        Ok(id)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Effective rows for a filter, ordered by batch code, time, then id
    pub fn query_effective(&self, filter: &EffectiveFilter) -> Result<Vec<EffectiveRow>> {
        require("date", &filter.date)?;
        if let Some(shift) = filter.shift {
            check_shift(shift)?;
        }

        let mut conn = self.get_conn()?;
        let mut query = batches_effective::table
            .filter(batches_effective::date.eq(&filter.date))
            .select(EffectiveRow::as_select())
            .into_boxed();

        if let Some(ref code) = filter.batch_code {
            query = query.filter(batches_effective::batch_code.eq(code));
        }
        if let Some(shift) = filter.shift {
            query = query.filter(batches_effective::shift.eq(shift));
        }
        if let Some(ref time_max) = filter.time_max {
            query = query.filter(batches_effective::time.le(time_max));
        }

        let rows = query
            .order((
                batches_effective::batch_code.asc(),
                batches_effective::time.asc(),
                batches_effective::id.asc(),
            ))
            .load::<EffectiveRow>(&mut conn)?;
        Ok(rows)
    }

    /// Distinct batch codes with at least one effective row on `date`
    pub fn effective_batch_codes(&self, date: &str) -> Result<Vec<String>> {
        require("date", date)?;
        let mut conn = self.get_conn()?;
        let codes = batches_effective::table
            .filter(batches_effective::date.eq(date))
            .select(batches_effective::batch_code)
            .distinct()
            .order(batches_effective::batch_code.asc())
            .load::<String>(&mut conn)?;
        Ok(codes)
    }

    /// Raw row, tombstone and every override for one measurement
    pub fn history(&self, raw_id: i32) -> Result<MeasurementHistory> {
        let mut conn = self.get_conn()?;

        let raw = batches_raw::table
            .find(raw_id)
            .select(RawMeasurement::as_select())
            .first(&mut conn)
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("raw measurement {}", raw_id)))?;

        let tombstone = batches_tombstone::table
            .filter(batches_tombstone::raw_id.eq(raw_id))
            .select(Tombstone::as_select())
            .first(&mut conn)
            .optional()?;

        let overrides = batches_override::table
            .filter(batches_override::raw_id.eq(raw_id))
            .order(batches_override::id.asc())
            .select(Override::as_select())
            .load(&mut conn)?;

        Ok(MeasurementHistory { raw, tombstone, overrides })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::error::ErrorKind;

    // ==========================================================================
    // The raw log is append-only. Corrections never rewrite it; they stack
    // tombstones and overrides that the effective view folds in on read.
    // ==========================================================================

    fn measurement(batch: &str, date: &str, time: &str, power: f64) -> NewMeasurement {
        NewMeasurement {
            batch_code: batch.to_string(),
            date: date.to_string(),
            time: time.to_string(),
            shift: 2,
            readings: Readings {
                steel_ball_type: Some("S3".to_string()),
                power_kw: Some(power),
                current_main: Some(40.0),
                voltage_ps: Some(380.0),
                ..Default::default()
            },
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_append_returns_increasing_ids() {
        let (_dir, db) = test_db();
        let a = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();
        let b = db.append_raw(&measurement("B1", "2025-09-30", "08:02:00", 11.0)).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_append_rejects_missing_identity_fields() {
        let (_dir, db) = test_db();

        let mut m = measurement("", "2025-09-30", "08:00:00", 1.0);
        assert_eq!(db.append_raw(&m).unwrap_err().kind(), ErrorKind::Validation);

        m.batch_code = "B1".into();
        m.date = "  ".into();
        assert_eq!(db.append_raw(&m).unwrap_err().kind(), ErrorKind::Validation);

        m.date = "2025-09-30".into();
        m.time = String::new();
        assert_eq!(db.append_raw(&m).unwrap_err().kind(), ErrorKind::Validation);

        m.time = "08:00:00".into();
        m.shift = 4;
        assert_eq!(db.append_raw(&m).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_append_accepts_any_sensor_values() {
        // Range checks belong to alarms, not to the ledger
        let (_dir, db) = test_db();
        let mut m = measurement("B1", "2025-09-30", "08:00:00", -5000.0);
        m.readings.current_main = Some(1.0e9);
        assert!(db.append_raw(&m).is_ok());
    }

    #[test]
    fn test_append_deserializes_flat_json() {
        let json = r#"{"batch_code":"B7","date":"2025-09-30","time":"09:00:00","shift":1,"power_kw":12.5}"#;
        let m: NewMeasurement = serde_json::from_str(json).unwrap();
        assert_eq!(m.readings.power_kw, Some(12.5));
        assert_eq!(m.readings.steel_ball_kg, None);
    }

    #[test]
    fn test_raw_update_is_invariant_violation() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();

        let mut conn = db.get_conn().unwrap();
        let err = diesel::update(batches_raw::table.find(id))
            .set(batches_raw::power_kw.eq(Some(99.0)))
            .execute(&mut conn)
            .unwrap_err();
        assert_eq!(Error::from(err).kind(), ErrorKind::InvariantViolation);

        let history = db.history(id).unwrap();
        assert_eq!(history.raw.power_kw, Some(10.0));
    }

    #[test]
    fn test_raw_delete_is_invariant_violation() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();

        let mut conn = db.get_conn().unwrap();
        let err = diesel::delete(batches_raw::table.find(id)).execute(&mut conn).unwrap_err();
        assert_eq!(Error::from(err).kind(), ErrorKind::InvariantViolation);

        let err = diesel::delete(batches_raw::table).execute(&mut conn).unwrap_err();
        assert_eq!(Error::from(err).kind(), ErrorKind::InvariantViolation);
        drop(conn);

        assert!(db.history(id).is_ok());
    }

    #[test]
    fn test_soft_delete_hides_row() {
        let (_dir, db) = test_db();
        let keep = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();
        let gone = db.append_raw(&measurement("B1", "2025-09-30", "08:02:00", 11.0)).unwrap();

        db.soft_delete(gone, Some("admin"), Some("sensor glitch"), now()).unwrap();

        let rows = db.query_effective(&EffectiveFilter::for_date("2025-09-30")).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![keep]);

        let history = db.history(gone).unwrap();
        let tomb = history.tombstone.expect("tombstone recorded");
        assert_eq!(tomb.deleted_by.as_deref(), Some("admin"));
        assert_eq!(tomb.reason.as_deref(), Some("sensor glitch"));
    }

    #[test]
    fn test_soft_delete_twice_conflicts() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();

        db.soft_delete(id, None, None, now()).unwrap();
        let err = db.soft_delete(id, None, None, now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_soft_delete_unknown_id_not_found() {
        let (_dir, db) = test_db();
        let err = db.soft_delete(404, None, None, now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_effective_count_matches_raw_minus_tombstones_per_date() {
        let (_dir, db) = test_db();
        let mut ids = Vec::new();
        for (i, date) in ["2025-09-29", "2025-09-30", "2025-09-30", "2025-09-30", "2025-10-01"]
            .iter()
            .enumerate()
        {
            let time = format!("08:{:02}:00", i * 2);
            ids.push(db.append_raw(&measurement("B1", date, &time, i as f64)).unwrap());
        }

        db.soft_delete(ids[1], None, None, now()).unwrap();
        db.soft_delete(ids[4], None, None, now()).unwrap();
        // Overrides never change the count
        db.apply_override(ids[2], &Readings { power_kw: Some(1.0), ..Default::default() }, None, None, now()).unwrap();
        db.apply_override(ids[2], &Readings { power_kw: Some(2.0), ..Default::default() }, None, None, now()).unwrap();

        let count = |date: &str| db.query_effective(&EffectiveFilter::for_date(date)).unwrap().len();
        assert_eq!(count("2025-09-29"), 1);
        assert_eq!(count("2025-09-30"), 3 - 1);
        assert_eq!(count("2025-10-01"), 0);
        assert_eq!(count("2025-10-02"), 0);
    }

    #[test]
    fn test_overrides_merge_field_by_field_latest_wins() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();

        db.apply_override(
            id,
            &Readings { power_kw: Some(12.0), current_main: Some(41.0), ..Default::default() },
            Some("alice"),
            Some("recalibrated"),
            now(),
        )
        .unwrap();
        db.apply_override(
            id,
            &Readings { current_main: Some(42.0), ..Default::default() },
            Some("bob"),
            None,
            now(),
        )
        .unwrap();

        let rows = db.query_effective(&EffectiveFilter::for_date("2025-09-30")).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        // Set by the latest override
        assert_eq!(row.current_main, Some(42.0));
        // The latest override leaves power_kw unset, so the raw value shows through
        assert_eq!(row.power_kw, Some(10.0));
        // Untouched fields come from the raw row
        assert_eq!(row.voltage_ps, Some(380.0));
        assert_eq!(row.steel_ball_type.as_deref(), Some("S3"));
        assert_eq!(row.steel_ball_kg, None);
    }

    #[test]
    fn test_override_can_fill_a_missing_raw_value() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();
        db.apply_override(id, &Readings { steel_ball_kg: Some(3.5), ..Default::default() }, None, None, now())
            .unwrap();

        let rows = db.query_effective(&EffectiveFilter::for_date("2025-09-30")).unwrap();
        assert_eq!(rows[0].steel_ball_kg, Some(3.5));
    }

    #[test]
    fn test_override_validation_and_missing_target() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();

        let err = db.apply_override(id, &Readings::default(), None, None, now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let patch = Readings { power_kw: Some(1.0), ..Default::default() };
        let err = db.apply_override(id + 100, &patch, None, None, now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_override_on_tombstoned_row_is_stored_but_invisible() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();
        db.soft_delete(id, None, None, now()).unwrap();

        let patch = Readings { power_kw: Some(77.0), ..Default::default() };
        db.apply_override(id, &patch, None, None, now()).unwrap();

        assert!(db.query_effective(&EffectiveFilter::for_date("2025-09-30")).unwrap().is_empty());
        assert_eq!(db.history(id).unwrap().overrides.len(), 1);
    }

    #[test]
    fn test_patch_json_rejects_unknown_keys() {
        let patch = Readings::from_patch_json(r#"{"power_kw": 120.0, "steel_ball_type": "S330"}"#).unwrap();
        assert_eq!(patch.power_kw, Some(120.0));
        assert_eq!(patch.steel_ball_type.as_deref(), Some("S330"));
        assert!(patch.voltage_ps.is_none());

        for json in [
            r#"{"powr_kw": 120.0}"#,
            r#"{"batch_code": "B9", "power_kw": 1.0}"#,
            r#"[1, 2]"#,
            r#"{"power_kw": "high"}"#,
            "not json",
        ] {
            let err = Readings::from_patch_json(json).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{}", json);
        }
    }

    #[test]
    fn test_query_order_and_filters() {
        let (_dir, db) = test_db();
        let b2_late = db.append_raw(&measurement("B2", "2025-09-30", "20:10:00", 1.0)).unwrap();
        let b1_late = db.append_raw(&measurement("B1", "2025-09-30", "19:30:00", 2.0)).unwrap();
        let b1_early = db.append_raw(&measurement("B1", "2025-09-30", "07:00:00", 3.0)).unwrap();
        let b1_same_time = db.append_raw(&measurement("B1", "2025-09-30", "07:00:00", 4.0)).unwrap();
        let mut night = measurement("B2", "2025-09-30", "23:00:00", 5.0);
        night.shift = 1;
        let b2_night = db.append_raw(&night).unwrap();

        let all = db.query_effective(&EffectiveFilter::for_date("2025-09-30")).unwrap();
        assert_eq!(
            all.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![b1_early, b1_same_time, b1_late, b2_late, b2_night]
        );

        let upto = db.query_effective(&EffectiveFilter::for_date("2025-09-30").up_to_hour(19)).unwrap();
        assert_eq!(upto.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b1_early, b1_same_time, b1_late]);

        let b2 = db.query_effective(&EffectiveFilter::for_date("2025-09-30").with_batch("B2")).unwrap();
        assert_eq!(b2.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b2_late, b2_night]);

        let shift1 = db.query_effective(&EffectiveFilter::for_date("2025-09-30").with_shift(1)).unwrap();
        assert_eq!(shift1.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b2_night]);
    }

    #[test]
    fn test_query_requires_date_and_valid_shift() {
        let (_dir, db) = test_db();
        let err = db.query_effective(&EffectiveFilter::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = db.query_effective(&EffectiveFilter::for_date("2025-09-30").with_shift(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_query_is_restartable() {
        let (_dir, db) = test_db();
        db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();
        let filter = EffectiveFilter::for_date("2025-09-30");
        let first = db.query_effective(&filter).unwrap();
        let second = db.query_effective(&filter).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_effective_batch_codes_skip_deleted_batches() {
        let (_dir, db) = test_db();
        db.append_raw(&measurement("B2", "2025-09-30", "08:00:00", 1.0)).unwrap();
        db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 1.0)).unwrap();
        db.append_raw(&measurement("B1", "2025-09-30", "08:02:00", 1.0)).unwrap();
        let only = db.append_raw(&measurement("B3", "2025-09-30", "08:00:00", 1.0)).unwrap();
        db.soft_delete(only, None, None, now()).unwrap();

        assert_eq!(db.effective_batch_codes("2025-09-30").unwrap(), vec!["B1", "B2"]);
    }

    #[test]
    fn test_history_lists_overrides_oldest_first() {
        let (_dir, db) = test_db();
        let id = db.append_raw(&measurement("B1", "2025-09-30", "08:00:00", 10.0)).unwrap();
        let first = db.apply_override(id, &Readings { power_kw: Some(1.0), ..Default::default() }, None, None, now()).unwrap();
        let second = db.apply_override(id, &Readings { power_kw: Some(2.0), ..Default::default() }, None, None, now()).unwrap();

        let history = db.history(id).unwrap();
        assert!(history.tombstone.is_none());
        assert_eq!(history.overrides.iter().map(|o| o.id).collect::<Vec<_>>(), vec![first, second]);

        assert_eq!(db.history(id + 1).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_hour_upper_bound_clamps() {
        assert_eq!(hour_upper_bound(19), "19:59:59");
        assert_eq!(hour_upper_bound(0), "00:59:59");
        assert_eq!(hour_upper_bound(-3), "00:59:59");
        assert_eq!(hour_upper_bound(42), "23:59:59");
    }
}
