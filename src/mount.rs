// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canonical_error::{CanonicalError, internal_error};
use log::info;

use crate::clock::Clock;
use crate::command_queue::CommandQueueDriver;
use crate::instruction::{AxisPolarity, Direction, GuidingState, InstructionKind,
                         Outcome};
use crate::mount_driver::{MountDriver, ra_difference};
use crate::settings::MountSettings;

/// High-level mount operations. All hardware access is serialized through a
/// CommandQueueDriver; the facade adds the read-out correction learned from
/// the last slew and the axis polarity learned from calibration.
pub struct Mount {
    command_queue: CommandQueueDriver,

    // Requested minus reported position after the most recent slew. Added to
    // every position lookup.
    readout_correction: Mutex<(f64, f64)>,

    polarity: Mutex<AxisPolarity>,

    // Nominal direction -> direction sent to the hardware, for nudges in
    // progress. A recalibration must not change what stop_nudge() removes.
    active_nudges: Mutex<HashMap<Direction, Direction>>,
}

impl Mount {
    pub fn new(driver: Box<dyn MountDriver + Send>,
               settings: MountSettings,
               clock: Arc<dyn Clock + Send + Sync>) -> Result<Self, CanonicalError> {
        Ok(Mount{
            command_queue: CommandQueueDriver::start(driver, settings, clock)?,
            readout_correction: Mutex::new((0.0, 0.0)),
            polarity: Mutex::new(AxisPolarity::default()),
            active_nudges: Mutex::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &MountSettings {
        self.command_queue.settings()
    }

    pub fn readout_correction(&self) -> (f64, f64) {
        *self.readout_correction.lock().unwrap()
    }

    pub fn polarity(&self) -> AxisPolarity {
        *self.polarity.lock().unwrap()
    }

    /// Slews and waits for the mount to settle. Afterwards the position read
    /// back from the mount (plus correction) equals the requested position.
    pub fn slew_to(&self, ra: f64, de: f64) -> Result<(), CanonicalError> {
        self.command_queue.enqueue_and_wait(InstructionKind::SlewTo{ra, de})?;
        let (ra_reported, de_reported) = self.raw_position()?;
        let correction = (ra_difference(ra, ra_reported), de - de_reported);
        info!("Slewed to {:.6}/{:.6}; read-out correction {:.2e}/{:.2e}",
              ra, de, correction.0, correction.1);
        *self.readout_correction.lock().unwrap() = correction;
        Ok(())
    }

    /// Settled mount position, with the read-out correction applied.
    pub fn lookup_position(&self) -> Result<(f64, f64), CanonicalError> {
        let (ra, de) = self.raw_position()?;
        let correction = self.readout_correction();
        Ok(((ra + correction.0).rem_euclid(2.0 * PI), de + correction.1))
    }

    fn raw_position(&self) -> Result<(f64, f64), CanonicalError> {
        match self.command_queue.enqueue_and_wait(InstructionKind::LookupPosition)? {
            Outcome::Position{ra, de} => Ok((ra, de)),
            other => Err(internal_error(
                format!("Unexpected lookup outcome {:?}", other).as_str())),
        }
    }

    /// Starts tracking the given rates (radians per second) by guide pulses.
    /// Replaces any guiding already in progress. Returns without waiting for
    /// the first guiding iteration.
    pub fn start_guiding(&self, rate_ra: f64, rate_de: f64)
                         -> Result<(), CanonicalError> {
        self.stop_guiding()?;
        self.command_queue.enqueue_back(InstructionKind::Guide(
            GuidingState::new(rate_ra, rate_de, self.polarity())))
    }

    /// Returns once no guiding instruction remains queued.
    pub fn stop_guiding(&self) -> Result<(), CanonicalError> {
        self.command_queue.enqueue_and_wait(InstructionKind::StopGuiding)?;
        Ok(())
    }

    /// Keeps pulsing in `direction` until stop_nudge() is called for the same
    /// direction.
    pub fn start_nudge(&self, direction: Direction) -> Result<(), CanonicalError> {
        let mapped = self.polarity().map(direction);
        self.command_queue.enqueue_front(InstructionKind::Nudge(mapped))?;
        self.active_nudges.lock().unwrap().insert(direction, mapped);
        Ok(())
    }

    pub fn stop_nudge(&self, direction: Direction) -> Result<(), CanonicalError> {
        let started = self.active_nudges.lock().unwrap().remove(&direction);
        let mapped = started.unwrap_or_else(|| self.polarity().map(direction));
        self.command_queue.enqueue_and_wait(InstructionKind::StopNudge(mapped))?;
        Ok(())
    }

    /// One guide pulse; `direction` is nominal (North increases DE, East
    /// increases RA).
    pub fn pulse_correction(&self, direction: Direction, duration: Duration)
                            -> Result<(), CanonicalError> {
        let mapped = self.polarity().map(direction);
        self.command_queue.enqueue_and_wait(
            InstructionKind::PulseCorrection{direction: mapped, duration})?;
        Ok(())
    }

    /// Determines which axes move opposite to their nominal direction. The
    /// result re-maps all later directional instructions.
    pub fn calibrate(&self) -> Result<AxisPolarity, CanonicalError> {
        match self.command_queue.enqueue_and_wait(InstructionKind::Calibrate)? {
            Outcome::Polarity(polarity) => {
                *self.polarity.lock().unwrap() = polarity;
                Ok(polarity)
            }
            other => Err(internal_error(
                format!("Unexpected calibration outcome {:?}", other).as_str())),
        }
    }

    /// Disconnects from the mount. No further operations are possible.
    pub fn terminate(&self) -> Result<(), CanonicalError> {
        self.command_queue.terminate()
    }
}

// mod tests.
