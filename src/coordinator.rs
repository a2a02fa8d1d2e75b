//! The coordinator: owns the task channel, paces task generation, and drains driver reports.

use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::announce;
use crate::channel::{Access, Channel, ChannelAttrs, ChannelFactory, Received, result_channel_name};
use crate::config::{EMIT_INTERVAL_MS, SimConfig};
use crate::error::Result;
use crate::fleet::{DriverExit, Fleet};
use crate::types::{DriverId, Task, TripReport};

/// Upper bound on reads from one result channel per drain pass.
pub const DRAIN_LIMIT: usize = 1024;
// Polling interval while waiting for drivers that may still be reporting.
const REAP_POLL: Duration = Duration::from_millis(20);

/// The coordinator's read end of one driver's result channel.
pub struct Inbox<C: Channel> {
    pub driver: DriverId,
    channel: C,
}

/// One distance reported by a driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Report {
    pub driver: DriverId,
    pub distance: i32,
}

/// Aggregated outcome of a simulation run.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub drivers: Vec<DriverId>,
    pub emitted: Vec<Task>,
    pub reports: Vec<Report>,
    pub exits: Vec<DriverExit>,
}

impl RunSummary {
    pub fn total_distance(&self) -> i64 {
        self.reports
            .iter()
            .map(|report| i64::from(report.distance))
            .sum()
    }

    pub fn failed_drivers(&self) -> Vec<DriverId> {
        self.exits
            .iter()
            .filter(|exit| !exit.succeeded())
            .map(|exit| exit.id)
            .collect()
    }

    pub fn print(&self) {
        println!("FLEET SUMMARY");
        println!(
            "drivers={} tasks_emitted={}",
            self.drivers.len(),
            self.emitted.len()
        );
        println!("results_received={}", self.reports.len());
        println!("total_distance={}", self.total_distance());
        println!("failed_drivers={:?}", self.failed_drivers());
        for exit in &self.exits {
            if let Some(driver) = &exit.summary {
                println!(
                    "driver={} trips={} distance_driven={}",
                    driver.id,
                    driver.trips.len(),
                    driver.distance_driven
                );
            }
        }
    }
}

/// Read everything currently queued in `inbox`, oldest first, stopping at `limit` reads.
pub fn drain_inbox<C: Channel>(inbox: &Inbox<C>, limit: usize) -> Result<Vec<Report>> {
    let mut reports = Vec::new();
    while reports.len() < limit {
        match inbox.channel.try_receive::<TripReport>()? {
            Received::Message(report) => reports.push(Report {
                driver: inbox.driver,
                distance: report.distance,
            }),
            Received::WouldBlock | Received::TimedOut => break,
        }
    }
    if reports.len() == limit {
        debug!(
            "[QUEUE] drain of driver {} hit the {limit}-read limit",
            inbox.driver
        );
    }
    Ok(reports)
}

struct Run<'a, F: ChannelFactory, L: Fleet> {
    config: &'a SimConfig,
    factory: &'a F,
    fleet: &'a mut L,
    inboxes: Vec<Inbox<F::Channel>>,
    summary: RunSummary,
}

impl<F: ChannelFactory, L: Fleet> Run<'_, F, L> {
    fn spawn_fleet(&mut self) -> Result<()> {
        for _ in 0..self.config.drivers {
            let id = self.fleet.spawn()?;
            self.summary.drivers.push(id);
        }
        info!("[FLEET] spawned {} driver(s)", self.summary.drivers.len());
        Ok(())
    }

    fn attach_inboxes(&mut self) -> Result<()> {
        let attrs = ChannelAttrs::for_message::<TripReport>();
        for &driver in &self.summary.drivers {
            // The driver may not have created its channel yet; open creates it if needed.
            let channel = self
                .factory
                .open(&result_channel_name(driver), attrs, Access::Read)?;
            self.inboxes.push(Inbox { driver, channel });
        }
        Ok(())
    }

    fn drain_all(&mut self) -> Result<()> {
        for inbox in &self.inboxes {
            for report in drain_inbox(inbox, DRAIN_LIMIT)? {
                announce!(
                    "The driver {} drove a distance of {}.",
                    report.driver, report.distance
                );
                self.summary.reports.push(report);
            }
        }
        Ok(())
    }

    fn generate_tasks(&mut self, tasks: &F::Channel) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let timing = self.config.timing;
        let mut remaining_ms = i64::try_from(self.config.duration_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        while remaining_ms > 0 {
            let pause = rng.gen_range(EMIT_INTERVAL_MS);
            remaining_ms -= pause as i64;
            thread::sleep(timing.ticks(pause));

            let task = Task::random(&mut rng);
            tasks.send(&task)?;
            self.summary.emitted.push(task);
            debug!(
                "[QUEUE] emitted task #{} ({} queued, {remaining_ms}ms left)",
                self.summary.emitted.len(),
                tasks.pending().unwrap_or(0)
            );

            self.drain_all()?;
        }
        Ok(())
    }

    fn wait_for_fleet(&mut self) -> Result<()> {
        if self.inboxes.is_empty() {
            let exits = self.fleet.wait_all()?;
            self.summary.exits.extend(exits);
            return Ok(());
        }
        // Keep draining while waiting: a driver blocked on a full result channel
        // would otherwise never reach its idle timeout.
        while self.fleet.running() > 0 {
            let exits = self.fleet.reap_exited()?;
            self.summary.exits.extend(exits);
            self.drain_all()?;
            if self.fleet.running() > 0 {
                thread::sleep(REAP_POLL);
            }
        }
        self.drain_all()
    }

    fn simulate(&mut self, tasks: &F::Channel) -> Result<()> {
        self.spawn_fleet()?;
        if self.config.report {
            self.attach_inboxes()?;
        }
        self.generate_tasks(tasks)?;
        announce!("Coordinator: no new tasks available.");
        self.wait_for_fleet()
    }

    fn release(&mut self) {
        self.inboxes.clear();
        if !self.config.report {
            return;
        }
        // Includes channels of drivers that failed before the coordinator attached.
        for &driver in &self.summary.drivers {
            if let Err(err) = self.factory.unlink(&result_channel_name(driver)) {
                warn!("[QUEUE] {err}");
            }
        }
    }
}

/// Run one simulation: create the task channel, spawn the fleet, emit tasks for the configured
/// duration, wait for every driver to retire, and release all channels.
///
/// A failure before the fleet has retired aborts the whole fleet.
pub fn run<F: ChannelFactory, L: Fleet>(
    config: &SimConfig,
    factory: &F,
    fleet: &mut L,
) -> Result<RunSummary> {
    let tasks = factory.create(
        &config.task_channel,
        ChannelAttrs::for_message::<Task>(),
        Access::Write,
    )?;

    let mut run = Run {
        config,
        factory,
        fleet,
        inboxes: Vec::new(),
        summary: RunSummary::default(),
    };
    let outcome = run.simulate(&tasks);
    if let Err(err) = &outcome {
        error!("[FLEET] aborting simulation: {err}");
        run.fleet.abort();
    }
    run.release();

    // Every driver has exited (or been killed), so nobody references the task channel.
    drop(tasks);
    if let Err(err) = factory.unlink(&config.task_channel) {
        warn!("[QUEUE] {err}");
    }
    outcome?;

    announce!("Coordinator: terminating.");
    info!(
        "[FLEET] emitted {} task(s), received {} report(s)",
        run.summary.emitted.len(),
        run.summary.reports.len()
    );
    Ok(run.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::LocalNamespace;
    use crate::config::Timing;
    use crate::error::FleetError;
    use crate::fleet::ThreadFleet;
    use crate::driver::start_position;
    use std::collections::HashMap;

    fn fast_config(drivers: u32, duration_secs: u64, report: bool) -> SimConfig {
        let mut config = SimConfig::new(drivers, duration_secs).expect("config");
        config.report = report;
        config.seed = 42;
        config.task_channel = "/coordinator_tasks".to_string();
        config.timing = Timing {
            idle_unit: Duration::from_millis(15),
            trip_unit: Duration::from_micros(2),
            tick: Duration::from_micros(5),
        };
        config
    }

    fn count(tasks: impl IntoIterator<Item = Task>) -> HashMap<Task, usize> {
        let mut counts = HashMap::new();
        for task in tasks {
            *counts.entry(task).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn every_emitted_task_is_driven_exactly_once() {
        let ns = LocalNamespace::new();
        let config = fast_config(3, 30, true);
        let mut fleet = ThreadFleet::new(ns.clone(), config.driver_config());
        let summary = run(&config, &ns, &mut fleet).expect("run");

        assert!(!summary.emitted.is_empty());
        assert_eq!(summary.exits.len(), 3);
        assert!(summary.failed_drivers().is_empty());
        let driven = summary
            .exits
            .iter()
            .filter_map(|exit| exit.summary.as_ref())
            .flat_map(|driver| driver.trips.iter().copied());
        assert_eq!(count(driven), count(summary.emitted.iter().copied()));
        assert_eq!(summary.reports.len(), summary.emitted.len());
    }

    #[test]
    fn reports_match_what_each_driver_drove() {
        let ns = LocalNamespace::new();
        let config = fast_config(2, 20, true);
        let mut fleet = ThreadFleet::new(ns.clone(), config.driver_config());
        let summary = run(&config, &ns, &mut fleet).expect("run");

        for exit in &summary.exits {
            let driver = exit.summary.as_ref().expect("thread driver summary");
            let reported: Vec<i32> = summary
                .reports
                .iter()
                .filter(|report| report.driver == exit.id)
                .map(|report| report.distance)
                .collect();
            let mut position = start_position(exit.id);
            let mut expected = Vec::new();
            for task in &driver.trips {
                expected.push(task.trip_distance(position));
                position = task.destination;
            }
            // Per-driver reports arrive in the order the driver produced them.
            assert_eq!(reported, expected);
        }
        let total: i64 = summary
            .exits
            .iter()
            .filter_map(|exit| exit.summary.as_ref())
            .map(|driver| driver.distance_driven)
            .sum();
        assert_eq!(summary.total_distance(), total);
    }

    #[test]
    fn silent_variant_skips_result_channels() {
        let ns = LocalNamespace::new();
        let config = fast_config(1, 5, false);
        let mut fleet = ThreadFleet::new(ns.clone(), config.driver_config());
        let summary = run(&config, &ns, &mut fleet).expect("run");
        assert!(summary.reports.is_empty());
        assert!(!summary.emitted.is_empty());
        assert!(!ns.contains(&result_channel_name(1)));
    }

    #[test]
    fn channels_are_released_after_the_run() {
        let ns = LocalNamespace::new();
        let config = fast_config(2, 5, true);
        let mut fleet = ThreadFleet::new(ns.clone(), config.driver_config());
        let summary = run(&config, &ns, &mut fleet).expect("run");
        assert!(!ns.contains(&config.task_channel));
        for driver in summary.drivers {
            assert!(!ns.contains(&result_channel_name(driver)));
        }
    }

    #[test]
    fn same_seed_emits_same_tasks() {
        let first = {
            let ns = LocalNamespace::new();
            let config = fast_config(1, 5, false);
            let mut fleet = ThreadFleet::new(ns.clone(), config.driver_config());
            run(&config, &ns, &mut fleet).expect("run").emitted
        };
        let second = {
            let ns = LocalNamespace::new();
            let config = fast_config(1, 5, false);
            let mut fleet = ThreadFleet::new(ns.clone(), config.driver_config());
            run(&config, &ns, &mut fleet).expect("run").emitted
        };
        assert_eq!(first, second);
    }

    #[test]
    fn drain_returns_backlog_in_order_then_stops() {
        let ns = LocalNamespace::new();
        let attrs = ChannelAttrs::for_message::<TripReport>();
        let writer = ns.open(&result_channel_name(9), attrs, Access::Write).expect("open");
        let inbox = Inbox {
            driver: 9,
            channel: ns.open(&result_channel_name(9), attrs, Access::Read).expect("open"),
        };
        for distance in [40, 10, 30] {
            writer.send(&TripReport::new(distance)).expect("send");
        }
        let reports = drain_inbox(&inbox, DRAIN_LIMIT).expect("drain");
        let distances: Vec<i32> = reports.iter().map(|report| report.distance).collect();
        assert_eq!(distances, vec![40, 10, 30]);
        assert!(drain_inbox(&inbox, DRAIN_LIMIT).expect("drain").is_empty());
    }

    #[test]
    fn drain_respects_its_limit() {
        let ns = LocalNamespace::new();
        let attrs = ChannelAttrs::for_message::<TripReport>();
        let writer = ns.open("/limited", attrs, Access::Write).expect("open");
        let inbox = Inbox {
            driver: 1,
            channel: ns.open("/limited", attrs, Access::Read).expect("open"),
        };
        for distance in 0..5 {
            writer.send(&TripReport::new(distance)).expect("send");
        }
        assert_eq!(drain_inbox(&inbox, 2).expect("drain").len(), 2);
        assert_eq!(drain_inbox(&inbox, 10).expect("drain").len(), 3);
    }

    /// Fleet whose spawns start failing after `ok` successes.
    struct FlakyFleet {
        ok: usize,
        spawned: Vec<DriverId>,
        aborted: bool,
    }

    impl Fleet for FlakyFleet {
        fn spawn(&mut self) -> Result<DriverId> {
            if self.spawned.len() == self.ok {
                return Err(FleetError::Spawn(std::io::Error::other("fork failed")));
            }
            let id = 500 + self.spawned.len() as DriverId;
            self.spawned.push(id);
            Ok(id)
        }

        fn running(&self) -> usize {
            self.spawned.len()
        }

        fn reap_exited(&mut self) -> Result<Vec<DriverExit>> {
            Ok(Vec::new())
        }

        fn wait_all(&mut self) -> Result<Vec<DriverExit>> {
            Ok(Vec::new())
        }

        fn abort(&mut self) {
            self.aborted = true;
            self.spawned.clear();
        }
    }

    #[test]
    fn spawn_failure_aborts_the_fleet_and_frees_the_task_channel() {
        let ns = LocalNamespace::new();
        let config = fast_config(3, 5, true);
        let mut fleet = FlakyFleet {
            ok: 2,
            spawned: Vec::new(),
            aborted: false,
        };
        let err = run(&config, &ns, &mut fleet).err().expect("spawn failure");
        assert!(matches!(err, FleetError::Spawn(_)));
        assert!(fleet.aborted);
        assert!(!ns.contains(&config.task_channel));
    }

    #[test]
    fn invalid_task_channel_fails_before_spawning() {
        let ns = LocalNamespace::new();
        let mut config = fast_config(1, 5, true);
        config.task_channel = "no-slash".to_string();
        let mut fleet = FlakyFleet {
            ok: 1,
            spawned: Vec::new(),
            aborted: false,
        };
        let err = run(&config, &ns, &mut fleet).err().expect("resource failure");
        assert!(matches!(err, FleetError::Resource(_)));
        assert!(fleet.spawned.is_empty());
    }
}
