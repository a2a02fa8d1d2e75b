//! A single driver: waits for ride tasks, drives them, reports distances, and retires when idle.

use std::thread;

use log::{debug, info};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::announce;
use crate::channel::{Access, Channel, ChannelAttrs, ChannelFactory, Deadline, Received, result_channel_name};
use crate::config::DriverConfig;
use crate::error::Result;
use crate::types::{DriverId, Position, Task, TripReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Spawned,
    AwaitingTask,
    Executing,
    Terminated,
}

/// Per-driver state, private to the driver's own execution unit.
#[derive(Debug)]
pub struct Driver {
    id: DriverId,
    position: Position,
    state: DriverState,
    trips: Vec<Task>,
    distance_driven: i64,
}

/// What a driver did over its lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverSummary {
    pub id: DriverId,
    pub trips: Vec<Task>,
    pub distance_driven: i64,
}

/// Starting point for `id`; its generator is seeded from the identity alone.
pub fn start_position(id: DriverId) -> Position {
    Position::random(&mut StdRng::seed_from_u64(u64::from(id)))
}

impl Driver {
    pub fn spawn(id: DriverId) -> Self {
        Self {
            id,
            position: start_position(id),
            state: DriverState::Spawned,
            trips: Vec::new(),
            distance_driven: 0,
        }
    }

    pub fn position(&self) -> Position {
        self.position
    }

    #[cfg(test)]
    fn state(&self) -> DriverState {
        self.state
    }

    /// Take a task: returns the distance to drive and moves the driver to the destination.
    pub fn accept(&mut self, task: Task) -> i32 {
        self.transition(DriverState::Executing);
        let distance = task.trip_distance(self.position);
        self.position = task.destination;
        self.distance_driven += i64::from(distance);
        self.trips.push(task);
        distance
    }

    fn transition(&mut self, next: DriverState) {
        if self.state != next {
            debug!("[DRIVER] {} {:?} -> {:?}", self.id, self.state, next);
        }
        self.state = next;
    }

    fn summary(&self) -> DriverSummary {
        DriverSummary {
            id: self.id,
            trips: self.trips.clone(),
            distance_driven: self.distance_driven,
        }
    }
}

/// Run driver `id` until no task arrives within the fleet-scaled idle timeout.
///
/// Any channel failure other than that timeout ends the driver with an error.
pub fn run_driver<F: ChannelFactory>(
    id: DriverId,
    config: &DriverConfig,
    factory: &F,
) -> Result<DriverSummary> {
    let mut driver = Driver::spawn(id);
    let start = driver.position();
    announce!(
        "Driver {id} starts at ({}, {})",
        start.x, start.y
    );

    let tasks = factory.open(
        &config.task_channel,
        ChannelAttrs::for_message::<Task>(),
        Access::Read,
    )?;
    let results = if config.report {
        Some(factory.open(
            &result_channel_name(id),
            ChannelAttrs::for_message::<TripReport>(),
            Access::Write,
        )?)
    } else {
        None
    };

    let idle_timeout = config.timing.idle_timeout(config.fleet_size);
    loop {
        driver.transition(DriverState::AwaitingTask);
        let deadline = Deadline::after(idle_timeout);
        let task = match tasks.receive_until::<Task>(deadline)? {
            Received::Message(task) => task,
            Received::TimedOut | Received::WouldBlock => break,
        };

        let distance = driver.accept(task);
        debug!("[DRIVER] {id} accepted task, distance={distance}");
        if let Some(results) = &results {
            results.send(&TripReport::new(distance))?;
        }
        announce!(
            "Driver {id} is taking a client from ({}, {}) to ({}, {})",
            task.pickup.x, task.pickup.y, task.destination.x, task.destination.y
        );
        thread::sleep(config.timing.trip_time(distance));
    }

    driver.transition(DriverState::Terminated);
    announce!("Driver {id} timed out");
    info!(
        "[DRIVER] {id} retiring after {} trip(s), {} distance",
        driver.trips.len(),
        driver.distance_driven
    );
    Ok(driver.summary())
}
