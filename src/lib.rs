//! Ballwatch - monitoring core for a steel-ball production line
//!
//! Two pieces of the line's backend carry real invariants and live here:
//!
//! 1. **The batch ledger.** Sensor readings are appended to a raw log that can
//!    never be updated or deleted. Administrative deletes and edits are stored
//!    as tombstones and field-level overrides, and every reader sees the merged
//!    *effective* view.
//!
//! 2. **Component lifetime accounting.** A persisted cursor turns elapsed wall
//!    clock time into wear hours in fixed steps, survives restarts without
//!    double-counting, and raises a one-time alarm when a component crosses its
//!    warning threshold.
//!
//! Both sit on one embedded SQLite database managed through Diesel.
//!
//! # Quick Start
//!
//! ```no_run
//! use ballwatch::{Database, EffectiveFilter, LifetimeTracker, NewMeasurement, Readings, TickConfig};
//!
//! let db = Database::open_at("line.db")?;
//! let id = db.append_raw(&NewMeasurement {
//!     batch_code: "250930_0100".into(),
//!     date: "2025-09-30".into(),
//!     time: "01:00:00".into(),
//!     shift: 1,
//!     readings: Readings { power_kw: Some(123.4), ..Default::default() },
//! })?;
//!
//! let patch = Readings { power_kw: Some(120.0), ..Default::default() };
//! db.apply_override(id, &patch, Some("admin"), Some("meter drift"), chrono::Utc::now())?;
//! let rows = db.query_effective(&EffectiveFilter::for_date("2025-09-30"))?;
//! assert_eq!(rows[0].power_kw, Some(120.0));
//!
//! db.register_component("impeller1", 500.0)?;
//! let tracker = LifetimeTracker::new(db.clone(), TickConfig::default())?;
//! tracker.advance(chrono::Utc::now())?;
//! # Ok::<(), ballwatch::Error>(())
//! ```
//!
//! # Modules
//!
//! - [`ledger`]: raw log, tombstones, overrides and the effective view
//! - [`lifetime`]: tick cursor, component counters, lifetime warnings
//! - [`alarm`]: de-duplicated alarm log with acknowledgement
//! - [`cadence`]: background loop that drives the tick cycle

pub mod alarm;
pub mod cadence;
pub mod clock;
pub mod db;
pub mod error;
pub mod ledger;
pub mod lifetime;
pub mod schema;

pub use alarm::{Alarm, RaiseOutcome, LIFETIME_WARNING};
pub use cadence::{spawn_cadence, CadenceHandle};
pub use clock::{Clock, ManualClock, SystemClock};
pub use db::Database;
pub use error::{Error, ErrorKind, Result};
pub use ledger::{
    hour_upper_bound, EffectiveFilter, EffectiveRow, MeasurementHistory, NewMeasurement, Override,
    RawMeasurement, Readings, Tombstone,
};
pub use lifetime::{ComponentLife, CreditReport, LifetimeTracker, TickConfig, TickOutcome, TickReport};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tick_config() {
        let config = TickConfig::default();
        assert_eq!(config.key, "component_life");
        assert_eq!(config.step_interval_ms, 60_000);
        assert!((config.hours_per_step - 1.0 / 60.0).abs() < 1e-15);
    }
}
