// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, deadline_exceeded_error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::North => Direction::South,
            Direction::South => Direction::North,
            Direction::East => Direction::West,
            Direction::West => Direction::East,
        }
    }
}

/// Whether the hardware moves opposite to the nominal direction in each
/// axis. Determined by calibration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AxisPolarity {
    pub ra_mirrored: bool,
    pub de_mirrored: bool,
}

impl AxisPolarity {
    // Maps a nominal direction (North increases DE, East increases RA) to the
    // direction the hardware must be told.
    pub fn map(&self, direction: Direction) -> Direction {
        match direction {
            Direction::North | Direction::South if self.de_mirrored =>
                direction.opposite(),
            Direction::East | Direction::West if self.ra_mirrored =>
                direction.opposite(),
            _ => direction,
        }
    }
}

/// Per-iteration state of a guiding instruction. The first iteration latches
/// the starting time and position; later iterations extrapolate from it.
#[derive(Clone, Debug)]
pub struct GuidingState {
    // Radians per second.
    pub rate_ra: f64,
    pub rate_de: f64,

    pub polarity: AxisPolarity,

    // Set by the first iteration.
    pub start: Option<(f64, f64, f64)>,  // time, ra, de
}

impl GuidingState {
    pub fn new(rate_ra: f64, rate_de: f64, polarity: AxisPolarity) -> Self {
        GuidingState{rate_ra, rate_de, polarity, start: None}
    }
}

#[derive(Clone, Debug)]
pub enum InstructionKind {
    SlewTo { ra: f64, de: f64 },
    // Raw (not read-out corrected) position once the mount has settled.
    LookupPosition,
    // Determines axis polarity by issuing test pulses.
    Calibrate,
    Guide(GuidingState),
    StopGuiding,
    // `direction` is already mapped through the axis polarity.
    Nudge(Direction),
    // Removes pending nudges in this (mapped) direction.
    StopNudge(Direction),
    PulseCorrection { direction: Direction, duration: Duration },
    Terminate,
}

impl InstructionKind {
    pub fn is_guiding(&self) -> bool {
        matches!(self, InstructionKind::Guide(_))
    }

    pub fn is_nudge(&self, direction: Direction) -> bool {
        matches!(self, InstructionKind::Nudge(d) if *d == direction)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    Done,
    Position { ra: f64, de: f64 },
    Polarity(AxisPolarity),
}

pub type InstructionResult = Result<Outcome, CanonicalError>;

/// One-shot result slot shared between the issuing caller and the queue
/// worker. The worker is the only writer.
#[derive(Default)]
pub struct Completion {
    result: Mutex<Option<InstructionResult>>,

    // Signalled when `result` is populated.
    finished: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Completion{..Default::default()}
    }

    pub fn complete(&self, result: InstructionResult) {
        let mut locked_result = self.result.lock().unwrap();
        if locked_result.is_none() {
            *locked_result = Some(result);
        }
        self.finished.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }

    /// Blocks until the worker posts a result, or until `timeout` elapses.
    /// Timing out does not cancel the instruction.
    pub fn wait(&self, timeout: Option<Duration>) -> InstructionResult {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut locked_result = self.result.lock().unwrap();
        loop {
            if let Some(result) = locked_result.take() {
                return result;
            }
            match deadline {
                None => {
                    locked_result = self.finished.wait(locked_result).unwrap();
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(deadline_exceeded_error(
                            format!("Instruction not finished after {:?}",
                                    timeout.unwrap_or_default()).as_str()));
                    }
                    locked_result = self.finished.wait_timeout(
                        locked_result, deadline - now).unwrap().0;
                }
            }
        }
    }
}

pub struct Instruction {
    pub kind: InstructionKind,

    // Present when the issuer wants to learn the outcome.
    pub completion: Option<Arc<Completion>>,
}

impl Instruction {
    pub fn new(kind: InstructionKind) -> Self {
        Instruction{kind, completion: None}
    }

    // Returns the instruction along with the handle the issuer waits on.
    pub fn with_completion(kind: InstructionKind) -> (Self, Arc<Completion>) {
        let completion = Arc::new(Completion::new());
        (Instruction{kind, completion: Some(completion.clone())}, completion)
    }

    pub fn finish(&self, result: InstructionResult) {
        if let Some(ref completion) = self.completion {
            completion.complete(result);
        }
    }
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Instruction({:?})", self.kind)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use canonical_error::CanonicalErrorCode;
    use super::*;

    #[test]
    fn test_polarity_mapping() {
        let normal = AxisPolarity::default();
        assert_eq!(normal.map(Direction::North), Direction::North);
        assert_eq!(normal.map(Direction::West), Direction::West);

        let mirrored_de = AxisPolarity{ra_mirrored: false, de_mirrored: true};
        assert_eq!(mirrored_de.map(Direction::North), Direction::South);
        assert_eq!(mirrored_de.map(Direction::South), Direction::North);
        assert_eq!(mirrored_de.map(Direction::East), Direction::East);

        let mirrored_ra = AxisPolarity{ra_mirrored: true, de_mirrored: false};
        assert_eq!(mirrored_ra.map(Direction::East), Direction::West);
        assert_eq!(mirrored_ra.map(Direction::North), Direction::North);
    }

    #[test]
    fn test_completion_across_threads() {
        let (instruction, completion) =
            Instruction::with_completion(InstructionKind::LookupPosition);
        assert!(!completion.is_finished());
        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            instruction.finish(Ok(Outcome::Position{ra: 1.0, de: 0.5}));
        });
        let result = completion.wait(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(result, Outcome::Position{ra: 1.0, de: 0.5});
        worker.join().unwrap();
    }

    #[test]
    fn test_completion_timeout() {
        let completion = Completion::new();
        let err = completion.wait(Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err.code, CanonicalErrorCode::DeadlineExceeded);
    }

}  // mod tests.
