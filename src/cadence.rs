//! Fixed-cadence driver for the tick cycle
//!
//! Runs [`LifetimeTracker::advance`] once immediately and then once per period
//! on a background thread. Failures are logged and left for the next period;
//! the cursor makes a late cycle catch up on every step it missed.

use crate::clock::Clock;
use crate::lifetime::{LifetimeTracker, TickOutcome};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Stops the loop when dropped or when [`CadenceHandle::stop`] is called.
pub struct CadenceHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CadenceHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("cadence thread panicked");
            }
        }
    }
}

impl Drop for CadenceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_once(tracker: &LifetimeTracker, clock: &dyn Clock) {
    match tracker.advance(clock.now()) {
        Ok(TickOutcome::Advanced(report)) => {
            for component in &report.warnings {
                tracing::warn!(component = %component, "lifetime threshold reached");
            }
        }
        Ok(TickOutcome::Busy) => tracing::debug!("previous cycle still running"),
        Err(e) if e.is_retryable() => tracing::error!(error = %e, "tick cycle failed, retrying next period"),
        Err(e) => tracing::error!(error = %e, kind = ?e.kind(), "tick cycle failed"),
    }
}

pub fn spawn_cadence(
    tracker: Arc<LifetimeTracker>,
    clock: Arc<dyn Clock>,
    period: Duration,
) -> std::io::Result<CadenceHandle> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("tick-cadence".into())
        .spawn(move || {
            tracing::info!(period_ms = period.as_millis() as u64, "cadence started");
            loop {
                run_once(&tracker, clock.as_ref());
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            tracing::info!("cadence stopped");
        })?;

    Ok(CadenceHandle { stop_tx: Some(stop_tx), thread: Some(thread) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::tests::test_db;
    use crate::lifetime::{TickConfig, DEFAULT_STEP_INTERVAL_MS};
    use chrono::DateTime;

    fn hours(tracker: &LifetimeTracker) -> f64 {
        tracker.database().list_components().unwrap()[0].accumulated_hours
    }

    #[test]
    fn test_first_cycle_runs_immediately_and_stop_joins() {
        let (_dir, db) = test_db();
        db.register_component("impeller1", 0.0).unwrap();
        let tracker = Arc::new(LifetimeTracker::new(db, TickConfig::default().with_hours_per_step(1.0)).unwrap());
        let t0 = tracker.cursor().unwrap();
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp_millis(t0 + 2 * DEFAULT_STEP_INTERVAL_MS).unwrap(),
        ));

        let handle = spawn_cadence(Arc::clone(&tracker), clock, Duration::from_secs(3600)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hours(&tracker) < 2.0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop();

        assert_eq!(hours(&tracker), 2.0);
        assert_eq!(tracker.cursor().unwrap(), t0 + 2 * DEFAULT_STEP_INTERVAL_MS);
    }

    #[test]
    fn test_failing_cycles_do_not_stop_the_loop() {
        use crate::lifetime::DEFAULT_TICK_KEY;
        use crate::schema::tick_state;
        use diesel::prelude::*;

        let (_dir, db) = test_db();
        db.register_component("impeller1", 0.0).unwrap();
        let tracker = Arc::new(LifetimeTracker::new(db.clone(), TickConfig::default().with_hours_per_step(1.0)).unwrap());
        let now = chrono::Utc::now();
        let clock = Arc::new(ManualClock::new(now));

        // Without a cursor every cycle fails with an invariant violation
        let mut conn = db.get_conn().unwrap();
        diesel::delete(tick_state::table.find(DEFAULT_TICK_KEY)).execute(&mut conn).unwrap();

        let handle = spawn_cadence(Arc::clone(&tracker), clock, Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hours(&tracker), 0.0);

        diesel::insert_into(tick_state::table)
            .values((
                tick_state::key.eq(DEFAULT_TICK_KEY),
                tick_state::last_tick_at.eq(now.timestamp_millis() - 2 * DEFAULT_STEP_INTERVAL_MS),
            ))
            .execute(&mut conn)
            .unwrap();
        drop(conn);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while hours(&tracker) < 2.0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop();

        assert_eq!(hours(&tracker), 2.0);
    }
}
