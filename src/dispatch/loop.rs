use super::Dispatcher;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};

enum Signal {
    Trigger,
    Stop,
}

/// Cheap, cloneable handle that asks the dispatch loop for an immediate tick.
#[derive(Clone)]
pub struct DispatchTrigger {
    tx: mpsc::Sender<Signal>,
}

impl DispatchTrigger {
    /// Returns false once the loop has stopped.
    pub fn trigger(&self) -> bool {
        self.tx.send(Signal::Trigger).is_ok()
    }
}

pub struct DispatcherHandle {
    trigger: DispatchTrigger,
    handle: Option<JoinHandle<()>>,
    dispatcher: Arc<Dispatcher>,
}

impl DispatcherHandle {
    pub fn trigger(&self) -> bool {
        self.trigger.trigger()
    }

    pub fn trigger_handle(&self) -> DispatchTrigger {
        self.trigger.clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stops ticking. Executions already running are left to finish.
    pub fn stop(mut self) {
        let _ = self.trigger.tx.send(Signal::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Stops ticking and waits for in-flight executions to record outcomes.
    pub fn shutdown(self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.stop();
        dispatcher.wait_for_inflight();
    }

    /// Blocks until the loop thread exits. The loop only exits on `stop`, so
    /// `serve` parks here for the life of the process.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("dispatch loop thread panicked")),
            None => Ok(()),
        }
    }
}

impl Dispatcher {
    /// Recovers jobs left `running` by a previous process, runs one tick, then
    /// keeps ticking every poll interval and on every trigger.
    pub fn start(self: Arc<Self>) -> Result<DispatcherHandle> {
        let recovered = self
            .store()
            .reset_stuck_jobs()
            .context("reset jobs left running by a previous process")?;
        if recovered > 0 {
            tracing::warn!(recovered, "requeued jobs left running by a previous process");
        }

        let (tx, rx) = mpsc::channel::<Signal>();
        let dispatcher = Arc::clone(&self);
        let interval = self.config().poll_interval;
        let handle = thread::Builder::new()
            .name("hookq-dispatch".to_string())
            .spawn(move || {
                tracing::info!(
                    max_concurrent = dispatcher.config().max_concurrent,
                    poll_interval_ms = interval.as_millis() as u64,
                    "dispatcher started"
                );
                run_tick(&dispatcher);
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(Signal::Trigger) => {
                            if drain_pending(&rx) {
                                break;
                            }
                            run_tick(&dispatcher);
                        }
                        Err(RecvTimeoutError::Timeout) => run_tick(&dispatcher),
                    }
                }
                tracing::info!("dispatcher stopped");
            })
            .context("spawn dispatch loop thread")?;

        Ok(DispatcherHandle {
            trigger: DispatchTrigger { tx },
            handle: Some(handle),
            dispatcher: self,
        })
    }
}

/// Coalesces queued triggers into the tick about to run. Returns true when a
/// stop was queued behind them.
fn drain_pending(rx: &mpsc::Receiver<Signal>) -> bool {
    loop {
        match rx.try_recv() {
            Ok(Signal::Trigger) => continue,
            Ok(Signal::Stop) => return true,
            Err(TryRecvError::Empty) => return false,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

fn run_tick(dispatcher: &Dispatcher) {
    match dispatcher.tick() {
        Ok(report) if !report.dispatched.is_empty() || !report.failed.is_empty() => {
            tracing::debug!(
                slots = report.slots,
                candidates = report.candidates,
                dispatched = report.dispatched.len(),
                failed = report.failed.len(),
                "dispatch tick"
            );
        }
        Ok(_) => {}
        Err(err) => tracing::error!(error = %format!("{err:#}"), "dispatch tick failed"),
    }
}
