//! Acquisition state machine and worker thread.
//!
//! ```text
//!  Stopped --arm--> Armed --poll: Triggered--> TriggeredDataNotReady
//!     ^               ^                                |
//!     |               |                      acquire_data (queue below
//!     |               |                      high-water mark)
//!     |               +--- continuous ----- DataReady <-+
//!     +----------------- single shot ----------+
//! ```
//!
//! `stop` returns to `Stopped` from any state and clears the pending queue.
//! A transport error also stops the machine and is kept in `status`.
//!
//! While the queue is at its high-water mark the worker thread blocks until a
//! consumer takes a set or the poll interval elapses.

use super::transport::lock;
use super::{Instrument, TriggerMode, WaveformSet};
use crate::config::AcquisitionConfig;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How often `wait_for_trigger` looks at the pending queue
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Stopped,
    Armed,
    TriggeredDataNotReady,
    DataReady,
}

#[derive(Debug)]
struct Machine {
    state: AcquisitionState,
    single_shot: bool,
}

/// Drives one instrument through arm / trigger / acquire and buffers the results
pub struct AcquisitionController {
    instrument: Arc<dyn Instrument>,
    machine: Mutex<Machine>,
    pending: Mutex<VecDeque<WaveformSet>>,
    pending_cond: Condvar,
    high_water: usize,
    auto_rearm: bool,
    status: Mutex<Option<String>>,
    acquired: Mutex<u64>,
    stalled_polls: AtomicU64,
}

impl AcquisitionController {
    pub fn new(instrument: Arc<dyn Instrument>, high_water: usize) -> Self {
        Self {
            instrument,
            machine: Mutex::new(Machine {
                state: AcquisitionState::Stopped,
                single_shot: false,
            }),
            pending: Mutex::new(VecDeque::new()),
            pending_cond: Condvar::new(),
            high_water: high_water.max(1),
            auto_rearm: true,
            status: Mutex::new(None),
            acquired: Mutex::new(0),
            stalled_polls: AtomicU64::new(0),
        }
    }

    pub fn from_config(instrument: Arc<dyn Instrument>, config: &AcquisitionConfig) -> Self {
        let mut controller = Self::new(instrument, config.pending_high_water);
        controller.auto_rearm = config.auto_rearm;
        controller
    }

    pub fn instrument(&self) -> &Arc<dyn Instrument> {
        &self.instrument
    }

    pub fn state(&self) -> AcquisitionState {
        lock(&self.machine).state
    }

    /// Last transport error, cleared when the machine is re-armed
    pub fn status(&self) -> Option<String> {
        lock(&self.status).clone()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Total waveform sets pushed into the queue
    pub fn acquired_count(&self) -> u64 {
        *lock(&self.acquired)
    }

    /// Polls that found the pending queue full
    pub fn stalled_polls(&self) -> u64 {
        self.stalled_polls.load(Ordering::Relaxed)
    }

    fn set_state(&self, machine: &mut Machine, state: AcquisitionState) {
        if machine.state != state {
            tracing::debug!(
                "{}: {:?} -> {:?}",
                self.instrument.name(),
                machine.state,
                state
            );
            machine.state = state;
        }
    }

    fn fail(&self, machine: &mut Machine, error: &crate::error::ScopeError) {
        tracing::warn!("{}: acquisition stopped: {}", self.instrument.name(), error);
        *lock(&self.status) = Some(error.to_string());
        self.set_state(machine, AcquisitionState::Stopped);
    }

    /// Arm for continuous acquisition
    pub fn start(&self) -> Result<()> {
        self.arm(false)
    }

    /// Arm for one trigger, then stop
    pub fn start_single_trigger(&self) -> Result<()> {
        self.arm(true)
    }

    pub fn arm(&self, single_shot: bool) -> Result<()> {
        let mut machine = lock(&self.machine);
        let result = if single_shot {
            self.instrument.start_single_trigger()
        } else {
            self.instrument.start()
        };
        if let Err(e) = result {
            self.fail(&mut machine, &e);
            return Err(e);
        }
        *lock(&self.status) = None;
        machine.single_shot = single_shot;
        self.set_state(&mut machine, AcquisitionState::Armed);
        tracing::info!(
            "{}: armed ({})",
            self.instrument.name(),
            if single_shot { "single" } else { "continuous" }
        );
        Ok(())
    }

    /// Stop the instrument and drop every pending set
    pub fn stop(&self) -> Result<()> {
        let mut machine = lock(&self.machine);
        self.set_state(&mut machine, AcquisitionState::Stopped);
        lock(&self.pending).clear();
        self.pending_cond.notify_all();
        tracing::info!("{}: stopped", self.instrument.name());
        self.instrument.stop()
    }

    /// Trigger now. A stopped machine is armed for a single shot first.
    pub fn force_trigger(&self) -> Result<()> {
        let mut machine = lock(&self.machine);
        if machine.state == AcquisitionState::Stopped {
            machine.single_shot = true;
            self.set_state(&mut machine, AcquisitionState::Armed);
        }
        if let Err(e) = self.instrument.force_trigger() {
            self.fail(&mut machine, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Advance the state machine by one step and return the new state
    pub fn poll(&self) -> Result<AcquisitionState> {
        let mut machine = lock(&self.machine);
        match machine.state {
            AcquisitionState::Stopped => {}
            AcquisitionState::Armed => match self.instrument.poll_trigger() {
                Ok(TriggerMode::Triggered) => {
                    self.set_state(&mut machine, AcquisitionState::TriggeredDataNotReady)
                }
                Ok(TriggerMode::Stop) => {
                    // Single-shot instruments report Stop once their capture is downloaded
                    if !self.instrument.is_trigger_armed() {
                        self.set_state(&mut machine, AcquisitionState::Stopped);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.fail(&mut machine, &e);
                    return Err(e);
                }
            },
            AcquisitionState::TriggeredDataNotReady => {
                if self.is_stalled() {
                    self.stalled_polls.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!("{}: pending queue full, stalling", self.instrument.name());
                    return Ok(machine.state);
                }
                match self.instrument.acquire_data() {
                    Ok(set) => {
                        self.push_pending(set);
                        self.set_state(&mut machine, AcquisitionState::DataReady);
                    }
                    Err(e) => {
                        self.fail(&mut machine, &e);
                        return Err(e);
                    }
                }
            }
            AcquisitionState::DataReady => {
                let next = if machine.single_shot || !self.auto_rearm {
                    AcquisitionState::Stopped
                } else {
                    AcquisitionState::Armed
                };
                self.set_state(&mut machine, next);
            }
        }
        Ok(machine.state)
    }

    fn push_pending(&self, set: WaveformSet) {
        lock(&self.pending).push_back(set);
        *lock(&self.acquired) += 1;
        self.pending_cond.notify_all();
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether the pending queue is at its high-water mark
    pub fn is_stalled(&self) -> bool {
        self.pending_len() >= self.high_water
    }

    /// Take the oldest captured set, if any
    pub fn pop_pending_waveform(&self) -> Option<WaveformSet> {
        let set = lock(&self.pending).pop_front();
        if set.is_some() {
            self.pending_cond.notify_all();
        }
        set
    }

    /// Block until the pending queue drops below the high-water mark or
    /// `timeout` elapses. Returns `true` if there is room.
    pub fn wait_for_room(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.pending);
        loop {
            if pending.len() < self.high_water {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            pending = match self.pending_cond.wait_timeout(pending, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Poll the pending queue until a set arrives or `timeout` elapses
    pub fn wait_for_trigger(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pending = lock(&self.pending);
        loop {
            if !pending.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = WAIT_POLL_INTERVAL.min(deadline - now);
            pending = match self.pending_cond.wait_timeout(pending, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

impl std::fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("instrument", &self.instrument.name())
            .field("state", &self.state())
            .field("pending", &self.pending_len())
            .finish()
    }
}

/// Runs `AcquisitionController::poll` on a dedicated thread
pub struct AcquisitionWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AcquisitionWorker {
    pub fn spawn(controller: Arc<AcquisitionController>, poll_interval: Duration) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let name = format!("acq-{}", controller.instrument().name());
        let handle = std::thread::Builder::new().name(name).spawn(move || {
            tracing::info!("Acquisition thread started");
            while flag.load(Ordering::Relaxed) {
                match controller.poll() {
                    Ok(AcquisitionState::Stopped) => std::thread::sleep(poll_interval),
                    Ok(AcquisitionState::TriggeredDataNotReady) if controller.is_stalled() => {
                        controller.wait_for_room(poll_interval);
                    }
                    Ok(AcquisitionState::DataReady) | Ok(AcquisitionState::TriggeredDataNotReady) => {
                        std::thread::yield_now()
                    }
                    Ok(AcquisitionState::Armed) => std::thread::sleep(poll_interval),
                    Err(e) => {
                        tracing::error!("Acquisition error: {}", e);
                        std::thread::sleep(poll_interval);
                    }
                }
            }
            tracing::info!("Acquisition thread exiting");
        })?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn from_config(controller: Arc<AcquisitionController>, config: &AcquisitionConfig) -> Result<Self> {
        Self::spawn(controller, Duration::from_millis(config.trigger_poll_ms))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Acquisition thread panicked");
            }
        }
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::DemoOscilloscope;

    fn controller(high_water: usize) -> Arc<AcquisitionController> {
        let scope = Arc::new(DemoOscilloscope::new("demo"));
        scope.set_sample_depth(64).unwrap();
        Arc::new(AcquisitionController::new(scope, high_water))
    }

    #[test]
    fn test_single_shot_cycle() {
        let acq = controller(4);
        assert_eq!(acq.state(), AcquisitionState::Stopped);
        acq.start_single_trigger().unwrap();
        assert_eq!(acq.poll().unwrap(), AcquisitionState::TriggeredDataNotReady);
        assert_eq!(acq.poll().unwrap(), AcquisitionState::DataReady);
        assert_eq!(acq.poll().unwrap(), AcquisitionState::Stopped);
        assert_eq!(acq.pending_len(), 1);
        assert!(acq.pop_pending_waveform().is_some());
    }

    #[test]
    fn test_high_water_stalls() {
        let acq = controller(1);
        acq.start().unwrap();
        for _ in 0..12 {
            acq.poll().unwrap();
        }
        assert_eq!(acq.pending_len(), 1);
        assert_eq!(acq.state(), AcquisitionState::TriggeredDataNotReady);

        acq.stop().unwrap();
        assert_eq!(acq.pending_len(), 0);
        assert_eq!(acq.state(), AcquisitionState::Stopped);
    }

    #[test]
    fn test_no_auto_rearm_stops_after_one_set() {
        let scope = Arc::new(DemoOscilloscope::new("demo"));
        scope.set_sample_depth(16).unwrap();
        let config = AcquisitionConfig {
            auto_rearm: false,
            ..AcquisitionConfig::default()
        };
        let acq = AcquisitionController::from_config(scope, &config);
        acq.start().unwrap();
        for _ in 0..3 {
            acq.poll().unwrap();
        }
        assert_eq!(acq.state(), AcquisitionState::Stopped);
        assert_eq!(acq.acquired_count(), 1);
    }

    #[test]
    fn test_wait_for_trigger_times_out() {
        let acq = controller(2);
        let start = Instant::now();
        assert!(!acq.wait_for_trigger(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_for_room() {
        let acq = controller(1);
        assert!(acq.wait_for_room(Duration::ZERO));
        acq.start().unwrap();
        while acq.pending_len() == 0 {
            acq.poll().unwrap();
        }

        let start = Instant::now();
        assert!(!acq.wait_for_room(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));

        let consumer = {
            let acq = acq.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                acq.pop_pending_waveform().is_some()
            })
        };
        assert!(acq.wait_for_room(Duration::from_secs(5)));
        assert!(consumer.join().unwrap());
    }

    #[test]
    fn test_worker_sleeps_while_queue_full() {
        let acq = controller(1);
        acq.start().unwrap();
        let mut worker = AcquisitionWorker::spawn(acq.clone(), Duration::from_millis(20)).unwrap();
        assert!(acq.wait_for_trigger(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(200));
        let stalled = acq.stalled_polls();
        // One stalled poll per interval, not one per spin
        assert!(stalled <= 20, "{} stalled polls in 200 ms", stalled);

        // Taking a set wakes the worker before the interval is up
        let before = acq.acquired_count();
        acq.pop_pending_waveform().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while acq.acquired_count() == before && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        worker.stop();
        assert!(acq.acquired_count() > before);
    }

    #[test]
    fn test_worker_fills_queue() {
        let acq = controller(2);
        acq.start().unwrap();
        let mut worker = AcquisitionWorker::spawn(acq.clone(), Duration::from_millis(1)).unwrap();
        assert!(acq.wait_for_trigger(Duration::from_secs(2)));
        worker.stop();
        assert!(!worker.is_running());
        assert!(acq.acquired_count() >= 1);
    }
}
