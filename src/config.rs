//! Run configuration and the timing knobs that scale every simulated delay.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::channel::TASK_CHANNEL;
use crate::error::{FleetError, Result};

/// Smallest accepted simulation duration, in seconds.
pub const MIN_DURATION_SECS: u64 = 5;
/// Pause between two emitted tasks, in simulated milliseconds.
pub const EMIT_INTERVAL_MS: RangeInclusive<u64> = 500..=2000;
/// Idle units a driver waits per fleet member before concluding the run has ended.
pub const IDLE_FACTOR: u32 = 4;

/// How drivers are executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// One OS process per driver, coordinated through kernel message queues.
    #[default]
    Process,
    /// One thread per driver, coordinated through in-process queues.
    Thread,
}

/// Wall-clock length of each simulated unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timing {
    /// One unit of the driver idle timeout.
    pub idle_unit: Duration,
    /// Time spent per unit of trip distance.
    pub trip_unit: Duration,
    /// One simulated millisecond of the coordinator's clock.
    pub tick: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self::with_speedup(1)
    }
}

impl Timing {
    /// Real-time timing divided by `speedup` (treated as at least 1).
    pub fn with_speedup(speedup: u32) -> Self {
        let speedup = speedup.max(1);
        Self {
            idle_unit: Duration::from_secs(1) / speedup,
            trip_unit: Duration::from_millis(1) / speedup,
            tick: Duration::from_millis(1) / speedup,
        }
    }

    /// How long a driver in a fleet of `fleet_size` waits for a task before exiting.
    pub fn idle_timeout(&self, fleet_size: u32) -> Duration {
        self.idle_unit * IDLE_FACTOR * fleet_size
    }

    pub fn trip_time(&self, distance: i32) -> Duration {
        self.trip_unit * distance.max(0).unsigned_abs()
    }

    pub fn ticks(&self, millis: u64) -> Duration {
        self.tick * u32::try_from(millis).unwrap_or(u32::MAX)
    }
}

/// Everything one driver needs to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverConfig {
    pub fleet_size: u32,
    pub report: bool,
    pub task_channel: String,
    pub timing: Timing,
}

/// Coordinator configuration for one simulation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimConfig {
    pub drivers: u32,
    pub duration_secs: u64,
    /// Drivers report trip distances on private result channels.
    pub report: bool,
    /// Seed for the coordinator's task generator.
    pub seed: u64,
    pub task_channel: String,
    pub timing: Timing,
}

impl SimConfig {
    /// Validated configuration with defaults for everything but the fleet shape.
    pub fn new(drivers: u32, duration_secs: u64) -> Result<Self> {
        if drivers < 1 {
            return Err(FleetError::Usage(format!(
                "N must be at least 1, got {drivers}"
            )));
        }
        if duration_secs < MIN_DURATION_SECS {
            return Err(FleetError::Usage(format!(
                "T must be at least {MIN_DURATION_SECS} seconds, got {duration_secs}"
            )));
        }
        Ok(Self {
            drivers,
            duration_secs,
            report: true,
            seed: u64::from(std::process::id()),
            task_channel: TASK_CHANNEL.to_string(),
            timing: Timing::default(),
        })
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            fleet_size: self.drivers,
            report: self.report,
            task_channel: self.task_channel.clone(),
            timing: self.timing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_fleet_and_short_runs() {
        assert!(matches!(SimConfig::new(0, 10), Err(FleetError::Usage(_))));
        assert!(matches!(SimConfig::new(3, 4), Err(FleetError::Usage(_))));
        let config = SimConfig::new(1, 5).expect("minimal config");
        assert!(config.report);
        assert_eq!(config.task_channel, TASK_CHANNEL);
    }

    #[test]
    fn idle_timeout_scales_with_fleet_size() {
        let timing = Timing::default();
        assert_eq!(timing.idle_timeout(1), Duration::from_secs(4));
        assert_eq!(timing.idle_timeout(3), Duration::from_secs(12));
    }

    #[test]
    fn speedup_divides_every_unit() {
        let timing = Timing::with_speedup(10);
        assert_eq!(timing.idle_timeout(2), Duration::from_millis(800));
        assert_eq!(timing.trip_time(1500), Duration::from_millis(150));
        assert_eq!(timing.ticks(2000), Duration::from_millis(200));
        // Zero is clamped rather than dividing by it.
        assert_eq!(Timing::with_speedup(0), Timing::default());
    }

    #[test]
    fn negative_distance_takes_no_time() {
        assert_eq!(Timing::default().trip_time(-5), Duration::ZERO);
    }
}
