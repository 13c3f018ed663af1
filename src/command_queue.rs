// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use canonical_error::{CanonicalError, aborted_error, deadline_exceeded_error,
                      failed_precondition_error};
use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::instruction::{AxisPolarity, Direction, GuidingState, Instruction,
                         InstructionKind, InstructionResult, Outcome};
use crate::mount_driver::{MountDriver, ra_difference};
use crate::settings::MountSettings;

/// Thread-safe double-ended queue of pending instructions. Urgent and
/// one-shot instructions go to the front; repeating instructions re-append
/// themselves at the back, so anything inserted at the front preempts them
/// on the very next pop.
#[derive(Default)]
pub struct InstructionQueue {
    state: Mutex<QueueState>,

    // Signalled on every insertion.
    changed: Condvar,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Instruction>,

    // Incremented by each push_front(); lets a waiting worker notice
    // preemption.
    front_insertions: u64,
}

impl InstructionQueue {
    pub fn new() -> Self {
        InstructionQueue{..Default::default()}
    }

    pub fn push_front(&self, instruction: Instruction) {
        let mut locked_state = self.state.lock().unwrap();
        locked_state.pending.push_front(instruction);
        locked_state.front_insertions += 1;
        self.changed.notify_all();
    }

    pub fn push_back(&self, instruction: Instruction) {
        let mut locked_state = self.state.lock().unwrap();
        locked_state.pending.push_back(instruction);
        self.changed.notify_all();
    }

    /// Blocks until an instruction is available. Also returns the number of
    /// front insertions made so far, as of the pop.
    pub fn pop_front(&self) -> (Instruction, u64) {
        let mut locked_state = self.state.lock().unwrap();
        loop {
            if let Some(instruction) = locked_state.pending.pop_front() {
                return (instruction, locked_state.front_insertions);
            }
            locked_state = self.changed.wait(locked_state).unwrap();
        }
    }

    /// Removes every pending instruction for which `predicate` holds. Callers
    /// waiting on a removed instruction are told it was aborted. Returns the
    /// number removed.
    pub fn remove_matching<F>(&self, predicate: F) -> usize
    where F: Fn(&InstructionKind) -> bool
    {
        let mut locked_state = self.state.lock().unwrap();
        let before = locked_state.pending.len();
        let mut kept = VecDeque::with_capacity(before);
        for instruction in locked_state.pending.drain(..) {
            if predicate(&instruction.kind) {
                instruction.finish(Err(aborted_error(
                    "Removed by a countermanding instruction")));
            } else {
                kept.push_back(instruction);
            }
        }
        locked_state.pending = kept;
        before - locked_state.pending.len()
    }

    pub fn count_matching<F>(&self, predicate: F) -> usize
    where F: Fn(&InstructionKind) -> bool
    {
        let locked_state = self.state.lock().unwrap();
        locked_state.pending.iter().filter(|i| predicate(&i.kind)).count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Waits up to `timeout` for a push_front() beyond the `seen` count.
    fn wait_for_front_insertion(&self, seen: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut locked_state = self.state.lock().unwrap();
        while locked_state.front_insertions == seen {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            locked_state =
                self.changed.wait_timeout(locked_state, deadline - now).unwrap().0;
        }
    }
}

/// Owns the mount driver and the worker thread that executes queued
/// instructions one at a time. The worker is the only code that talks to the
/// hardware.
pub struct CommandQueueDriver {
    queue: Arc<InstructionQueue>,
    settings: MountSettings,
    terminated: AtomicBool,
    worker_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Drop for CommandQueueDriver {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Error terminating command queue: {:?}", e);
        }
    }
}

impl CommandQueueDriver {
    /// Connects `driver` and starts the worker thread.
    pub fn start(mut driver: Box<dyn MountDriver + Send>,
                 settings: MountSettings,
                 clock: Arc<dyn Clock + Send + Sync>)
                 -> Result<Self, CanonicalError> {
        settings.validate()?;
        driver.connect()?;
        info!("Starting command queue for {}", driver.name());
        let queue = Arc::new(InstructionQueue::new());
        let worker = Worker{driver, queue: queue.clone(),
                            settings: settings.clone(), clock};
        let worker_thread = thread::spawn(move || worker.run());
        Ok(CommandQueueDriver{
            queue,
            settings,
            terminated: AtomicBool::new(false),
            worker_thread: Mutex::new(Some(worker_thread)),
        })
    }

    pub fn settings(&self) -> &MountSettings {
        &self.settings
    }

    pub fn queue(&self) -> &Arc<InstructionQueue> {
        &self.queue
    }

    fn check_running(&self) -> Result<(), CanonicalError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(aborted_error("Command queue has been terminated"));
        }
        Ok(())
    }

    /// Non-blocking; the instruction runs before anything already pending.
    pub fn enqueue_front(&self, kind: InstructionKind) -> Result<(), CanonicalError> {
        self.check_running()?;
        self.queue.push_front(Instruction::new(kind));
        Ok(())
    }

    /// Non-blocking; the instruction runs after everything already pending.
    pub fn enqueue_back(&self, kind: InstructionKind) -> Result<(), CanonicalError> {
        self.check_running()?;
        self.queue.push_back(Instruction::new(kind));
        Ok(())
    }

    /// Inserts at the front and blocks until the worker has executed the
    /// instruction, or until the configured instruction timeout.
    pub fn enqueue_and_wait(&self, kind: InstructionKind) -> InstructionResult {
        self.check_running()?;
        let (instruction, completion) = Instruction::with_completion(kind);
        self.queue.push_front(instruction);
        completion.wait(self.settings.instruction_timeout)
    }

    /// Executes a terminate sentinel (disconnecting the driver) and joins the
    /// worker. Idempotent.
    pub fn terminate(&self) -> Result<(), CanonicalError> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (instruction, completion) =
            Instruction::with_completion(InstructionKind::Terminate);
        self.queue.push_front(instruction);
        let result = completion.wait(self.settings.instruction_timeout);
        if result.is_ok() {
            if let Some(handle) = self.worker_thread.lock().unwrap().take() {
                if handle.join().is_err() {
                    error!("Command queue worker panicked");
                }
            }
        }
        result.map(|_| ())
    }
}

struct Worker {
    driver: Box<dyn MountDriver + Send>,
    queue: Arc<InstructionQueue>,
    settings: MountSettings,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let (Instruction{kind, completion}, seen_insertions) =
                self.queue.pop_front();
            let instruction = |kind| Instruction{kind, completion: completion.clone()};
            match kind {
                InstructionKind::Terminate => {
                    let result = self.driver.disconnect().map(|_| Outcome::Done);
                    let abandoned = self.queue.remove_matching(|_| true);
                    info!("Command queue for {} terminated ({} pending aborted)",
                          self.driver.name(), abandoned);
                    instruction(InstructionKind::Terminate).finish(result);
                    break;
                }
                InstructionKind::SlewTo{ra, de} => {
                    debug!("Slewing to {:.6}/{:.6}", ra, de);
                    let result = self.driver.slew_to(ra, de).map(|_| Outcome::Done);
                    instruction(kind).finish(result);
                }
                InstructionKind::LookupPosition => {
                    let result = self.settled_position()
                        .map(|(ra, de)| Outcome::Position{ra, de});
                    instruction(kind).finish(result);
                }
                InstructionKind::Calibrate => {
                    let result = self.calibrate().map(Outcome::Polarity);
                    instruction(kind).finish(result);
                }
                InstructionKind::PulseCorrection{direction, duration} => {
                    let result = self.driver.pulse_guide(direction, duration)
                        .map(|_| Outcome::Done);
                    instruction(kind).finish(result);
                }
                InstructionKind::Guide(mut state) => {
                    if let Err(e) = self.guide_step(&mut state) {
                        warn!("Guiding step failed: {:?}", e);
                    }
                    self.requeue(instruction(InstructionKind::Guide(state)),
                                 seen_insertions);
                }
                InstructionKind::StopGuiding => {
                    let removed = self.queue.remove_matching(|k| k.is_guiding());
                    info!("Stopped guiding ({} pending removed)", removed);
                    instruction(kind).finish(Ok(Outcome::Done));
                }
                InstructionKind::Nudge(direction) => {
                    if let Err(e) = self.driver.pulse_guide(
                        direction, self.settings.nudge_pulse)
                    {
                        warn!("Nudge {:?} failed: {:?}", direction, e);
                    }
                    self.requeue(instruction(kind), seen_insertions);
                }
                InstructionKind::StopNudge(direction) => {
                    let removed =
                        self.queue.remove_matching(|k| k.is_nudge(direction));
                    debug!("Stopped nudging {:?} ({} pending removed)",
                           direction, removed);
                    instruction(kind).finish(Ok(Outcome::Done));
                }
            }
        }
    }

    // Re-appends a repeating instruction after one polling interval, or
    // sooner if something was inserted at the front meanwhile.
    fn requeue(&self, instruction: Instruction, seen_insertions: u64) {
        self.queue.wait_for_front_insertion(seen_insertions,
                                            self.settings.polling_interval);
        self.queue.push_back(instruction);
    }

    // Polls the raw position until two consecutive samples agree within the
    // lookup precision in both axes.
    fn settled_position(&mut self) -> Result<(f64, f64), CanonicalError> {
        let precision = self.settings.lookup_precision();
        let mut previous = self.driver.position()?;
        for _ in 1..self.settings.max_settle_samples {
            thread::sleep(self.settings.polling_interval);
            let current = self.driver.position()?;
            if ra_difference(current.0, previous.0).abs() < precision &&
                (current.1 - previous.1).abs() < precision
            {
                return Ok(current);
            }
            previous = current;
        }
        Err(deadline_exceeded_error(
            format!("Mount position did not settle within {} samples",
                    self.settings.max_settle_samples).as_str()))
    }

    // Pulses each axis in its nominal positive direction (and back) and
    // reports which axes move the wrong way.
    fn calibrate(&mut self) -> Result<AxisPolarity, CanonicalError> {
        let pulse = self.settings.calibration_pulse;
        let expected = self.settings.guide_rate * pulse.as_secs_f64();

        let (_, de_before) = self.settled_position()?;
        self.driver.pulse_guide(Direction::North, pulse)?;
        let (_, de_after) = self.settled_position()?;
        self.driver.pulse_guide(Direction::South, pulse)?;
        let de_change = de_after - de_before;

        let (ra_before, _) = self.settled_position()?;
        self.driver.pulse_guide(Direction::East, pulse)?;
        let (ra_after, _) = self.settled_position()?;
        self.driver.pulse_guide(Direction::West, pulse)?;
        let ra_change = ra_difference(ra_after, ra_before);

        if de_change.abs() < 0.25 * expected || ra_change.abs() < 0.25 * expected {
            return Err(failed_precondition_error(
                format!("Mount barely responded to calibration pulses: \
                         RA {:.2e} DE {:.2e} expected {:.2e} rad",
                        ra_change, de_change, expected).as_str()));
        }
        let polarity = AxisPolarity{ra_mirrored: ra_change < 0.0,
                                    de_mirrored: de_change < 0.0};
        info!("Calibrated axis polarity {:?}", polarity);
        Ok(polarity)
    }

    // One guiding iteration: compare the extrapolated target with the
    // current position and pulse an axis only if it lags behind.
    fn guide_step(&mut self, state: &mut GuidingState) -> Result<(), CanonicalError> {
        let now = self.clock.now();
        let (ra, de) = self.driver.position()?;
        let (start_time, start_ra, start_de) = match state.start {
            Some(start) => start,
            None => {
                state.start = Some((now, ra, de));
                info!("Guiding at {:.3e}/{:.3e} rad/s", state.rate_ra, state.rate_de);
                return Ok(());
            }
        };
        let elapsed = now - start_time;
        let lag_ra = ra_difference(start_ra + state.rate_ra * elapsed, ra);
        let lag_de = start_de + state.rate_de * elapsed - de;

        let tolerance = self.settings.lookup_precision();
        if let Some(duration) = self.catch_up_pulse(lag_ra, state.rate_ra, tolerance) {
            let direction = if state.rate_ra > 0.0 { Direction::East }
                            else { Direction::West };
            debug!("Guiding RA lag {:.2e} rad, pulse {:?} {:?}",
                   lag_ra, direction, duration);
            self.driver.pulse_guide(state.polarity.map(direction), duration)?;
        }
        if let Some(duration) = self.catch_up_pulse(lag_de, state.rate_de, tolerance) {
            let direction = if state.rate_de > 0.0 { Direction::North }
                            else { Direction::South };
            debug!("Guiding DE lag {:.2e} rad, pulse {:?} {:?}",
                   lag_de, direction, duration);
            self.driver.pulse_guide(state.polarity.map(direction), duration)?;
        }
        Ok(())
    }

    // None unless the mount trails the target (in the direction of motion) by
    // more than `tolerance`. Pulses never exceed max_guide_pulse.
    fn catch_up_pulse(&self, lag: f64, rate: f64, tolerance: f64) -> Option<Duration> {
        if rate == 0.0 || lag * rate.signum() <= tolerance {
            return None;
        }
        let seconds = (lag.abs() / self.settings.guide_rate)
            .min(self.settings.max_guide_pulse.as_secs_f64());
        Some(Duration::from_secs_f64(seconds))
    }
}

// mod tests.
