//! Component lifetime accounting
//!
//! A persisted cursor (`tick_state.last_tick_at`, epoch milliseconds) marks the
//! instant up to which wear hours have been credited. Each cycle converts the
//! whole steps elapsed since the cursor into hours, credits every component,
//! and moves the cursor forward by exactly those steps. The sub-step remainder
//! stays behind the cursor for the next cycle, so jittery scheduling neither
//! loses nor gains time, and a restart picks up where the cursor left off.
//!
//! Warnings are edge-triggered: a component raises one `Lifetime Warning` when
//! its hours go from below its threshold to at-or-above it. Resetting the
//! component re-arms the warning.

use crate::alarm::{self, RaiseOutcome, LIFETIME_WARNING, LIFETIME_WARNING_DETAILS};
use crate::db::{format_timestamp, seed_tick_cursor, Database};
use crate::error::{Error, Result};
use crate::schema::{component_life, tick_state};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, TryLockError};

/// Cursor key shared by every component counter.
pub const DEFAULT_TICK_KEY: &str = "component_life";
pub const DEFAULT_STEP_INTERVAL_MS: i64 = 60_000;
/// One minute of wear per one-minute step.
pub const DEFAULT_HOURS_PER_STEP: f64 = 1.0 / 60.0;
const MS_PER_HOUR: f64 = 3_600_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TickConfig {
    pub key: String,
    pub step_interval_ms: i64,
    pub hours_per_step: f64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_TICK_KEY.to_string(),
            step_interval_ms: DEFAULT_STEP_INTERVAL_MS,
            hours_per_step: DEFAULT_HOURS_PER_STEP,
        }
    }
}

impl TickConfig {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Set the step length. Wear per step is rescaled to the real time a step
    /// covers; call [`TickConfig::with_hours_per_step`] afterwards to override.
    pub fn with_step_interval_ms(mut self, ms: i64) -> Self {
        self.step_interval_ms = ms;
        self.hours_per_step = ms as f64 / MS_PER_HOUR;
        self
    }

    /// Accelerated configurations (e.g. one hour per step) are for testing rigs.
    pub fn with_hours_per_step(mut self, hours: f64) -> Self {
        self.hours_per_step = hours;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::Validation("tick key is required".into()));
        }
        if self.step_interval_ms <= 0 {
            return Err(Error::Validation(format!(
                "step interval must be positive (got {} ms)",
                self.step_interval_ms
            )));
        }
        if !self.hours_per_step.is_finite() || self.hours_per_step <= 0.0 {
            return Err(Error::Validation(format!(
                "hours per step must be a positive number (got {})",
                self.hours_per_step
            )));
        }
        Ok(())
    }
}

#[derive(Queryable, Selectable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = component_life)]
pub struct ComponentLife {
    pub id: i32,
    pub component_name: String,
    pub accumulated_hours: f64,
    pub warning_hours: f64,
    pub last_reset_at: Option<String>,
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub steps: i64,
    pub delta_hours: f64,
    /// Cursor value after the cycle.
    pub cursor: i64,
    /// Components whose threshold was crossed in this cycle.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Advanced(TickReport),
    /// Another cycle or a reset was in flight; this call did nothing.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditReport {
    pub component: String,
    pub accumulated_hours: f64,
    pub warning_hours: f64,
    pub triggered: bool,
}

/// True when `before -> after` crosses an armed threshold from below.
pub fn crosses_threshold(before: f64, after: f64, warning_hours: f64) -> bool {
    warning_hours > 0.0 && before < warning_hours && after >= warning_hours
}

fn read_cursor(conn: &mut SqliteConnection, key: &str) -> Result<i64> {
    tick_state::table
        .find(key)
        .select(tick_state::last_tick_at)
        .first::<i64>(conn)
        .optional()?
        .ok_or_else(|| Error::InvariantViolation(format!("tick cursor '{}' was never seeded", key)))
}

fn warn_lifetime(conn: &mut SqliteConnection, component: &str, now: DateTime<Utc>) -> Result<()> {
    let outcome = alarm::raise_on(conn, LIFETIME_WARNING, component, Some(LIFETIME_WARNING_DETAILS), now)?;
    if outcome == RaiseOutcome::Suppressed {
        tracing::warn!(component, "lifetime warning crossed while a previous one is still open");
    }
    Ok(())
}

/// Drives the tick cycle and the operations that rewrite the cursor.
///
/// `advance` and `reset_component` share one guard: an `advance` that finds
/// it taken returns [`TickOutcome::Busy`] at once, while a reset waits for it.
/// Cross-process writers are serialized by `BEGIN IMMEDIATE`.
pub struct LifetimeTracker {
    db: Database,
    config: TickConfig,
    cycle: Mutex<()>,
}

impl LifetimeTracker {
    /// Validates `config` and seeds its cursor if this key has never ticked.
    pub fn new(db: Database, config: TickConfig) -> Result<Self> {
        config.validate()?;
        let mut conn = db.get_conn()?;
        seed_tick_cursor(&mut conn, &config.key)?;
        drop(conn);
        Ok(Self { db, config, cycle: Mutex::new(()) })
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn try_enter(&self) -> Option<MutexGuard<'_, ()>> {
        match self.cycle.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn enter(&self) -> MutexGuard<'_, ()> {
        self.cycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run one tick cycle against `now`.
    pub fn advance(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let Some(_guard) = self.try_enter() else {
            tracing::debug!(key = %self.config.key, "tick cycle already in flight, skipping");
            return Ok(TickOutcome::Busy);
        };

        let mut conn = self.db.get_conn()?;
        let report = conn.immediate_transaction(|conn| self.advance_on(conn, now))?;

        if report.steps > 0 {
            tracing::info!(
                steps = report.steps,
                delta_hours = report.delta_hours,
                warnings = report.warnings.len(),
                "component hours credited"
            );
        } else {
            tracing::debug!("no whole step elapsed");
        }
        Ok(TickOutcome::Advanced(report))
    }

    fn advance_on(&self, conn: &mut SqliteConnection, now: DateTime<Utc>) -> Result<TickReport> {
        let key = self.config.key.as_str();
        let last = read_cursor(conn, key)?;
        let elapsed = now.timestamp_millis() - last;
        let steps = if elapsed > 0 { elapsed / self.config.step_interval_ms } else { 0 };

        if steps == 0 {
            return Ok(TickReport { steps: 0, delta_hours: 0.0, cursor: last, warnings: Vec::new() });
        }

        let delta_hours = steps as f64 * self.config.hours_per_step;
        let components = component_life::table
            .order(component_life::component_name.asc())
            .select(ComponentLife::as_select())
            .load(conn)?;

        let mut warnings = Vec::new();
        for c in components {
            let after = c.accumulated_hours + delta_hours;
            diesel::update(component_life::table.find(c.id))
                .set(component_life::accumulated_hours.eq(after))
                .execute(conn)?;

            if crosses_threshold(c.accumulated_hours, after, c.warning_hours) {
                warn_lifetime(conn, &c.component_name, now)?;
                warnings.push(c.component_name);
            }
        }

        // Move by whole steps only; the remainder carries into the next cycle.
        let cursor = last + steps * self.config.step_interval_ms;
        diesel::update(tick_state::table.find(key))
            .set(tick_state::last_tick_at.eq(cursor))
            .execute(conn)?;

        Ok(TickReport { steps, delta_hours, cursor, warnings })
    }

    /// Zero a component's hours and restart the shared cursor at `now`.
    ///
    /// The cursor is global, so hours accrued by other components since the
    /// last cycle are forfeited too. Any open lifetime warning for this
    /// component is closed, re-arming it for the next crossing.
    pub fn reset_component(&self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("component name is required".into()));
        }

        let _guard = self.enter();
        let reset_at = format_timestamp(now);
        let key = self.config.key.as_str();
        let mut conn = self.db.get_conn()?;

        let closed = conn.immediate_transaction(|conn| {
            let changed = diesel::update(
                component_life::table.filter(component_life::component_name.eq(name)),
            )
            .set((
                component_life::accumulated_hours.eq(0.0),
                component_life::last_reset_at.eq(Some(reset_at.as_str())),
            ))
            .execute(conn)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("component '{}'", name)));
            }

            let moved = diesel::update(tick_state::table.find(key))
                .set(tick_state::last_tick_at.eq(now.timestamp_millis()))
                .execute(conn)?;
            if moved == 0 {
                return Err(Error::InvariantViolation(format!("tick cursor '{}' was never seeded", key)));
            }

            alarm::close_open_on(conn, LIFETIME_WARNING, name, now)
        })?;

        tracing::info!(component = name, closed_warnings = closed, "component reset");
        Ok(())
    }

    /// Manually credit hours to one component, applying the same warning rule.
    pub fn credit_hours(&self, name: &str, delta_hours: f64, now: DateTime<Utc>) -> Result<CreditReport> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("component name is required".into()));
        }
        if !delta_hours.is_finite() || delta_hours <= 0.0 {
            return Err(Error::Validation(format!("delta hours must be positive (got {})", delta_hours)));
        }

        let mut conn = self.db.get_conn()?;
        let report = conn.immediate_transaction(|conn| {
            let c = component_life::table
                .filter(component_life::component_name.eq(name))
                .select(ComponentLife::as_select())
                .first(conn)
                .optional()?
                .ok_or_else(|| Error::NotFound(format!("component '{}'", name)))?;

            let after = c.accumulated_hours + delta_hours;
            diesel::update(component_life::table.find(c.id))
                .set(component_life::accumulated_hours.eq(after))
                .execute(conn)?;

            let triggered = crosses_threshold(c.accumulated_hours, after, c.warning_hours);
            if triggered {
                warn_lifetime(conn, name, now)?;
            }

            Ok::<_, Error>(CreditReport {
                component: c.component_name,
                accumulated_hours: after,
                warning_hours: c.warning_hours,
                triggered,
            })
        })?;

        tracing::info!(component = name, delta_hours, triggered = report.triggered, "hours credited manually");
        Ok(report)
    }

    /// Current cursor, epoch milliseconds
    pub fn cursor(&self) -> Result<i64> {
        let mut conn = self.db.get_conn()?;
        read_cursor(&mut conn, &self.config.key)
    }
}

impl Database {
    /// All tracked components, ordered by name
    pub fn list_components(&self) -> Result<Vec<ComponentLife>> {
        let mut conn = self.get_conn()?;
        let rows = component_life::table
            .order(component_life::component_name.asc())
            .select(ComponentLife::as_select())
            .load(&mut conn)?;
        Ok(rows)
    }

    /// Start tracking a component at zero hours. Returns false if it already exists.
    pub fn register_component(&self, name: &str, warning_hours: f64) -> Result<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("component name is required".into()));
        }
        check_warning_hours(warning_hours)?;

        let mut conn = self.get_conn()?;
        let inserted = diesel::insert_or_ignore_into(component_life::table)
            .values((
                component_life::component_name.eq(name),
                component_life::accumulated_hours.eq(0.0),
                component_life::warning_hours.eq(warning_hours),
            ))
            .execute(&mut conn)?;
        Ok(inserted > 0)
    }

    /// Set warning thresholds for several components at once, all or nothing
    pub fn update_warning_thresholds(&self, items: &[(String, f64)]) -> Result<()> {
        if items.is_empty() {
            return Err(Error::Validation("at least one component is required".into()));
        }
        for (name, hours) in items {
            if name.trim().is_empty() {
                return Err(Error::Validation("component name is required".into()));
            }
            check_warning_hours(*hours)?;
        }

        let mut conn = self.get_conn()?;
        conn.immediate_transaction(|conn| {
            for (name, hours) in items {
                let changed = diesel::update(
                    component_life::table.filter(component_life::component_name.eq(name.trim())),
                )
                .set(component_life::warning_hours.eq(*hours))
                .execute(conn)?;
                if changed == 0 {
                    tracing::warn!(component = %name, "threshold update for unknown component");
                    return Err(Error::NotFound(format!("component '{}'", name)));
                }
            }
            Ok(())
        })
    }
}

fn check_warning_hours(hours: f64) -> Result<()> {
    if !hours.is_finite() || hours < 0.0 {
        return Err(Error::Validation(format!("warning hours must be zero or positive (got {})", hours)));
    }
    Ok(())
}
