use std::time::Duration;

use tracing::{debug, info};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::sandbox::{Interpreter, Sandbox};

/// Shortest poll interval; a zero tick would spin the host thread.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// The host's cooperative execution slot. Owns the sandbox, so it must stay
/// on the thread that created the interpreter.
pub struct MainLoop<I> {
    bridge: Bridge,
    sandbox: Sandbox<I>,
    tick_interval: Duration,
    drain_budget: usize,
}

impl<I: Interpreter> MainLoop<I> {
    pub fn new(bridge: Bridge, sandbox: Sandbox<I>, config: &BridgeConfig) -> Self {
        Self {
            bridge,
            sandbox,
            tick_interval: config.tick_interval.max(MIN_TICK_INTERVAL),
            drain_budget: config.drain_budget.max(1),
        }
    }

    /// Drains up to the budget and returns how many jobs ran. Never blocks
    /// waiting for work.
    pub fn tick(&mut self) -> usize {
        let mut ran = 0;
        while ran < self.drain_budget && self.bridge.drain_one(&mut self.sandbox) {
            ran += 1;
        }
        ran
    }

    /// Polls until shutdown has begun and the queue is empty, then stops the
    /// bridge. Returns the sandbox so callers can inspect it afterwards.
    pub fn run(mut self) -> Sandbox<I> {
        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            budget = self.drain_budget,
            "main loop started"
        );
        while !self.bridge.is_drained() {
            self.bridge.wait_for_work(self.tick_interval);
            let ran = self.tick();
            if ran > 0 {
                debug!(ran, "tick");
            }
        }
        self.bridge.close();
        info!(executions = self.sandbox.executions(), "main loop finished");
        self.sandbox
    }

    pub fn sandbox(&self) -> &Sandbox<I> {
        &self.sandbox
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }
}
