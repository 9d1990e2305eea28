//! Background refresh loop.
//!
//! The runner owns a [`Scheduler`] on its own thread and refreshes a shared
//! graph at a fixed rate. Other threads talk to it through
//! [`RunnerCommand`]s and read per-cycle [`RefreshStats`] from a channel.

use super::{RefreshStats, Scheduler};
use crate::error::Result;
use crate::graph::FilterGraph;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Stats messages kept when nobody is reading
const STATS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCommand {
    /// Run one cycle now, even while paused
    Refresh,
    /// Cycles per second; 0 pauses periodic refresh
    SetRate(u32),
    Stop,
}

pub struct SchedulerRunner {
    cmd_tx: Sender<RunnerCommand>,
    stats_rx: Receiver<RefreshStats>,
    handle: Option<JoinHandle<Scheduler>>,
}

struct RunLoop {
    scheduler: Scheduler,
    graph: Arc<Mutex<FilterGraph>>,
    cmd_rx: Receiver<RunnerCommand>,
    stats_tx: Sender<RefreshStats>,
    tick_rate_hz: u32,
    last_tick_time: Option<Instant>,
    running: bool,
}

impl SchedulerRunner {
    pub fn spawn(scheduler: Scheduler, graph: Arc<Mutex<FilterGraph>>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = unbounded();
        let (stats_tx, stats_rx) = bounded(STATS_CAPACITY);
        let tick_rate_hz = scheduler.config().refresh_rate_hz;
        let mut run_loop = RunLoop {
            scheduler,
            graph,
            cmd_rx,
            stats_tx,
            tick_rate_hz,
            last_tick_time: None,
            running: true,
        };
        let handle = std::thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || {
                run_loop.run();
                run_loop.scheduler
            })?;
        Ok(Self {
            cmd_tx,
            stats_rx,
            handle: Some(handle),
        })
    }

    pub fn send(&self, cmd: RunnerCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::warn!("Scheduler thread is gone; command dropped");
        }
    }

    pub fn refresh_now(&self) {
        self.send(RunnerCommand::Refresh);
    }

    pub fn set_rate(&self, hz: u32) {
        self.send(RunnerCommand::SetRate(hz));
    }

    pub fn stats(&self) -> &Receiver<RefreshStats> {
        &self.stats_rx
    }

    /// Stop the thread and hand back the scheduler
    pub fn stop(mut self) -> Option<Scheduler> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<Scheduler> {
        let _ = self.cmd_tx.send(RunnerCommand::Stop);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(scheduler) => Some(scheduler),
            Err(_) => {
                tracing::error!("Scheduler thread panicked");
                None
            }
        }
    }
}

impl Drop for SchedulerRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl RunLoop {
    fn run(&mut self) {
        tracing::info!("Scheduler thread started");

        while self.running {
            let forced = self.process_commands();
            if !self.running {
                break;
            }
            if forced || self.tick_rate_hz > 0 {
                self.tick();
            }
            self.rate_limit();
        }

        tracing::info!("Scheduler thread exiting");
    }

    /// Returns true when a refresh was requested explicitly
    fn process_commands(&mut self) -> bool {
        let mut forced = false;
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                RunnerCommand::Refresh => forced = true,
                RunnerCommand::SetRate(hz) => {
                    tracing::debug!("Refresh rate set to {} Hz", hz);
                    self.tick_rate_hz = hz;
                }
                RunnerCommand::Stop => self.running = false,
            }
        }
        forced
    }

    fn tick(&mut self) {
        self.last_tick_time = Some(Instant::now());
        let stats = {
            let mut graph = self.graph.lock().unwrap_or_else(|p| p.into_inner());
            self.scheduler.refresh(&mut graph)
        };
        match self.stats_tx.try_send(stats) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => self.running = false,
        }
    }

    fn rate_limit(&self) {
        if self.tick_rate_hz == 0 {
            std::thread::sleep(Duration::from_millis(10));
            return;
        }

        let target_interval = Duration::from_nanos(1_000_000_000 / self.tick_rate_hz as u64);

        if let Some(last) = self.last_tick_time {
            let elapsed = last.elapsed();
            if elapsed < target_interval {
                let remaining = target_interval - elapsed;
                // Spin for sub-millisecond accuracy, sleep for larger waits
                if remaining > Duration::from_millis(2) {
                    std::thread::sleep(remaining - Duration::from_millis(1));
                }
                while last.elapsed() < target_interval {
                    std::hint::spin_loop();
                }
            }
        }
    }
}
