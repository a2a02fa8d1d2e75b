//! Spawning and reaping drivers, either as child processes or as threads.

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::channel::ChannelFactory;
use crate::config::DriverConfig;
use crate::driver::{DriverSummary, run_driver};
use crate::error::{FleetError, Result};
use crate::types::DriverId;

/// How one driver ended.
#[derive(Clone, Debug)]
pub struct DriverExit {
    pub id: DriverId,
    /// Why the driver failed; `None` when it retired normally.
    pub failure: Option<String>,
    /// Available when the driver ran in-process.
    pub summary: Option<DriverSummary>,
}

impl DriverExit {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// A set of independently scheduled drivers owned by the coordinator.
pub trait Fleet {
    /// Start one more driver and return its identity.
    fn spawn(&mut self) -> Result<DriverId>;

    /// Drivers spawned and not yet reaped.
    fn running(&self) -> usize;

    /// Reap the drivers that have already exited; never blocks.
    fn reap_exited(&mut self) -> Result<Vec<DriverExit>>;

    /// Block until every driver has exited.
    fn wait_all(&mut self) -> Result<Vec<DriverExit>>;

    /// Tear the fleet down after a fatal coordinator error.
    fn abort(&mut self);
}

/// Drivers run as re-executions of this binary, one OS process each.
pub struct ProcessFleet {
    program: PathBuf,
    args: Vec<String>,
    children: Vec<Child>,
}

impl ProcessFleet {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            children: Vec::new(),
        }
    }

    /// Fleet that re-executes the running binary with `args`.
    pub fn from_current_exe(args: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe().map_err(FleetError::Spawn)?;
        Ok(Self::new(program, args))
    }

    fn exit_of(child: &Child, status: ExitStatus) -> DriverExit {
        let id = child.id();
        if !status.success() {
            warn!("[FLEET] driver {id} exited with {status}");
        }
        DriverExit {
            id,
            failure: (!status.success()).then(|| status.to_string()),
            summary: None,
        }
    }
}

impl Fleet for ProcessFleet {
    fn spawn(&mut self) -> Result<DriverId> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(FleetError::Spawn)?;
        let id = child.id();
        debug!("[FLEET] spawned driver process {id}");
        self.children.push(child);
        Ok(id)
    }

    fn running(&self) -> usize {
        self.children.len()
    }

    fn reap_exited(&mut self) -> Result<Vec<DriverExit>> {
        let mut exits = Vec::new();
        let mut index = 0;
        while index < self.children.len() {
            let child = &mut self.children[index];
            match child.try_wait() {
                Ok(Some(status)) => {
                    exits.push(Self::exit_of(child, status));
                    self.children.swap_remove(index);
                }
                Ok(None) => index += 1,
                Err(source) => {
                    return Err(FleetError::Reap {
                        id: child.id(),
                        source,
                    });
                }
            }
        }
        Ok(exits)
    }

    fn wait_all(&mut self) -> Result<Vec<DriverExit>> {
        let mut exits = Vec::with_capacity(self.children.len());
        while let Some(mut child) = self.children.pop() {
            let status = child.wait().map_err(|source| FleetError::Reap {
                id: child.id(),
                source,
            })?;
            exits.push(Self::exit_of(&child, status));
        }
        Ok(exits)
    }

    fn abort(&mut self) {
        for mut child in self.children.drain(..) {
            let id = child.id();
            if let Err(err) = child.kill() {
                debug!("[FLEET] kill of driver {id} failed: {err}");
            }
            if let Err(err) = child.wait() {
                warn!("[FLEET] reaping aborted driver {id} failed: {err}");
            }
        }
    }
}

/// Drivers run as named threads sharing an in-process channel namespace.
pub struct ThreadFleet<F: ChannelFactory> {
    factory: F,
    config: DriverConfig,
    next_id: DriverId,
    handles: Vec<(DriverId, JoinHandle<Result<DriverSummary>>)>,
}

impl<F: ChannelFactory> ThreadFleet<F> {
    pub fn new(factory: F, config: DriverConfig) -> Self {
        Self {
            factory,
            config,
            next_id: 1,
            handles: Vec::new(),
        }
    }

    fn join(id: DriverId, handle: JoinHandle<Result<DriverSummary>>) -> DriverExit {
        let (failure, summary) = match handle.join() {
            Ok(Ok(summary)) => (None, Some(summary)),
            Ok(Err(err)) => (Some(err.to_string()), None),
            Err(_) => (Some("driver thread panicked".to_string()), None),
        };
        if let Some(reason) = &failure {
            warn!("[FLEET] driver {id} failed: {reason}");
        }
        DriverExit {
            id,
            failure,
            summary,
        }
    }
}

impl<F: ChannelFactory> Fleet for ThreadFleet<F> {
    fn spawn(&mut self) -> Result<DriverId> {
        let id = self.next_id;
        let factory = self.factory.clone();
        let config = self.config.clone();
        let handle = thread::Builder::new()
            .name(format!("driver-{id}"))
            .spawn(move || run_driver(id, &config, &factory))
            .map_err(FleetError::Spawn)?;
        self.next_id += 1;
        self.handles.push((id, handle));
        Ok(id)
    }

    fn running(&self) -> usize {
        self.handles.len()
    }

    fn reap_exited(&mut self) -> Result<Vec<DriverExit>> {
        let mut exits = Vec::new();
        let mut index = 0;
        while index < self.handles.len() {
            if self.handles[index].1.is_finished() {
                let (id, handle) = self.handles.swap_remove(index);
                exits.push(Self::join(id, handle));
            } else {
                index += 1;
            }
        }
        Ok(exits)
    }

    fn wait_all(&mut self) -> Result<Vec<DriverExit>> {
        Ok(self
            .handles
            .drain(..)
            .map(|(id, handle)| Self::join(id, handle))
            .collect())
    }

    fn abort(&mut self) {
        // Threads cannot be killed; detached drivers retire on their idle timeout.
        let detached = self.handles.len();
        self.handles.clear();
        if detached > 0 {
            warn!("[FLEET] detached {detached} driver thread(s)");
        }
    }
}
