//! Error taxonomy for the coordinator and its drivers.

use std::io;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::types::DriverId;

#[derive(Debug, Error)]
pub enum FleetError {
    /// Bad command-line input, detected before any channel or driver exists.
    #[error("{0}")]
    Usage(String),
    /// A channel could not be created, opened, or used.
    #[error(transparent)]
    Resource(#[from] ChannelError),
    #[error("failed to spawn driver: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to reap driver {id}: {source}")]
    Reap {
        id: DriverId,
        #[source]
        source: io::Error,
    },
}

impl FleetError {
    /// Process exit status reported for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            FleetError::Usage(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
