//! Shared identifiers, the ride task model, and fixed-size wire encodings.

use rand::Rng;

/// Unique identifier for a driver: its process id, or a synthetic counter for thread-backed fleets.
pub type DriverId = u32;

/// Coordinates live in `[-COORD_BOUND, COORD_BOUND]` on both axes.
pub const COORD_BOUND: i32 = 1000;

/// A point on the simulated city grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Uniformly random point inside the coordinate bounds.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            x: rng.gen_range(-COORD_BOUND..=COORD_BOUND),
            y: rng.gen_range(-COORD_BOUND..=COORD_BOUND),
        }
    }

    /// Taxicab distance, saturating at `i32::MAX` for points decoded from arbitrary bytes.
    pub fn manhattan(self, other: Position) -> i32 {
        let sum = self.x.abs_diff(other.x).saturating_add(self.y.abs_diff(other.y));
        i32::try_from(sum).unwrap_or(i32::MAX)
    }
}

/// A ride request: drive to `pickup`, then carry the client to `destination`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Task {
    pub pickup: Position,
    pub destination: Position,
}

impl Task {
    pub const fn new(pickup: Position, destination: Position) -> Self {
        Self {
            pickup,
            destination,
        }
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            pickup: Position::random(rng),
            destination: Position::random(rng),
        }
    }

    /// Distance driven from `from` to the pickup plus the trip itself.
    pub fn trip_distance(&self, from: Position) -> i32 {
        from.manhattan(self.pickup)
            .saturating_add(self.pickup.manhattan(self.destination))
    }
}

/// Distance a driver reports back after accepting a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TripReport {
    pub distance: i32,
}

impl TripReport {
    pub const fn new(distance: i32) -> Self {
        Self { distance }
    }
}

/// Fixed-size encoding for values carried over a channel.
///
/// Both ends of a channel live on the same host, so integers travel in native byte order.
pub trait Wire: Sized {
    /// Exact encoded length in bytes.
    const SIZE: usize;

    /// Write the encoding into `buf`, which is exactly `SIZE` bytes long.
    fn encode(&self, buf: &mut [u8]);

    /// Decode from exactly `SIZE` bytes; `None` on a length mismatch.
    fn decode(buf: &[u8]) -> Option<Self>;
}

fn read_i32(buf: &[u8], index: usize) -> Option<i32> {
    let start = index * 4;
    let bytes = buf.get(start..start + 4)?;
    Some(i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn write_i32(buf: &mut [u8], index: usize, value: i32) {
    let start = index * 4;
    buf[start..start + 4].copy_from_slice(&value.to_ne_bytes());
}

impl Wire for Task {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        write_i32(buf, 0, self.pickup.x);
        write_i32(buf, 1, self.pickup.y);
        write_i32(buf, 2, self.destination.x);
        write_i32(buf, 3, self.destination.y);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self {
            pickup: Position::new(read_i32(buf, 0)?, read_i32(buf, 1)?),
            destination: Position::new(read_i32(buf, 2)?, read_i32(buf, 3)?),
        })
    }
}

impl Wire for TripReport {
    const SIZE: usize = 4;

    fn encode(&self, buf: &mut [u8]) {
        write_i32(buf, 0, self.distance);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::SIZE {
            return None;
        }
        Some(Self::new(read_i32(buf, 0)?))
    }
}
