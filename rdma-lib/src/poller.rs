use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering::SeqCst},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{
    error::{RdmaLibError, Result},
    provider::RdmaProvider,
    table::ConnectionTable,
    utils::affinity::pin_current_thread,
};

/// Completion-channel driven poller for one completion queue.
pub struct CompletionPoller<P: RdmaProvider> {
    pub provider: P,
    pub channel: P::CompChannel,
    pub cq: P::Cq,
    pub table: Arc<ConnectionTable>,
    pub wait_interval: Duration,
    pub pin_cpu: Option<u16>,
}

type ExitHook = Box<dyn FnOnce() + Send>;

pub struct PollerHandle {
    stop_signal: Arc<AtomicBool>,
    exit_hook: Arc<Mutex<Option<ExitHook>>>,
    handle: JoinHandle<Result<()>>,
}

impl PollerHandle {
    pub fn stop(&self) {
        self.stop_signal.store(true, SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// True when called from the poller thread, e.g. inside a completion callback.
    pub fn is_current(&self) -> bool {
        self.handle.thread().id() == std::thread::current().id()
    }

    /// Stops the poller and runs `release` on the poller thread after its
    /// loop has exited. The thread is detached.
    ///
    /// For teardown started from inside a dispatch, where the queue is still
    /// being drained and must outlive the current drain pass.
    pub fn release_on_exit(self, release: impl FnOnce() + Send + 'static) {
        debug_assert!(self.is_current(), "release_on_exit outside the poller thread");
        *self.exit_hook.lock() = Some(Box::new(release));
        self.stop();
    }

    /// Waits for the thread and returns how it ended.
    ///
    /// When called from the poller thread itself, only the stop flag is set.
    pub fn join(self) -> Result<()> {
        self.stop();
        if self.is_current() {
            return Ok(());
        }
        self.handle
            .join()
            .map_err(|_| RdmaLibError::PollerFailed("poller thread panicked".into()))?
    }
}

impl<P: RdmaProvider> CompletionPoller<P> {
    /// Spawns the poller thread and waits until it is running.
    pub fn spawn(self, name: String) -> Result<PollerHandle> {
        let (init_tx, init_rx) = oneshot::channel();
        let stop_signal = Arc::new(AtomicBool::new(false));
        let exit_hook: Arc<Mutex<Option<ExitHook>>> = Arc::default();
        let thread_stop = stop_signal.clone();
        let thread_exit_hook = exit_hook.clone();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let ret = self.run(thread_stop, init_tx);
                let hook = thread_exit_hook.lock().take();
                if let Some(hook) = hook {
                    hook();
                }
                ret
            })
            .map_err(|e| {
                RdmaLibError::Errno(syscalls::Errno::new(e.raw_os_error().unwrap_or(libc::EAGAIN)))
            })?;
        match init_rx.recv() {
            Ok(Ok(())) => Ok(PollerHandle { stop_signal, exit_hook, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => Err(RdmaLibError::PollerFailed(
                "poller exited before initialization".into(),
            )),
        }
    }

    fn run(
        self,
        stop_signal: Arc<AtomicBool>,
        init_tx: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if let Some(cpu) = self.pin_cpu {
            debug!(cpu, cq = ?self.cq, "Pin completion poller CPU");
            if let Err(e) = pin_current_thread(cpu) {
                let _ = init_tx.send(Err(e.clone()));
                return Err(e);
            }
        }
        if init_tx.send(Ok(())).is_err() {
            return Ok(());
        }

        let ret = self.poll_loop(&stop_signal);
        if let Err(e) = &ret {
            error!(cq = ?self.cq, error = %e, "Completion poller stopped");
        }
        ret
    }

    fn poll_loop(&self, stop_signal: &AtomicBool) -> Result<()> {
        while !stop_signal.load(SeqCst) {
            let Some(cq) = self.provider.get_cq_event(self.channel, self.wait_interval)? else {
                continue;
            };
            self.provider.ack_cq_events(cq, 1);
            self.provider.req_notify_cq(cq).map_err(|e| {
                RdmaLibError::PollerFailed(format!("failed to re-arm completion queue: {e}"))
            })?;
            self.drain(cq)?;
        }
        trace!(cq = ?self.cq, "Completion poller stopping");
        Ok(())
    }

    fn drain(&self, cq: P::Cq) -> Result<()> {
        loop {
            let wc = self.provider.poll_cq(cq).map_err(|e| {
                RdmaLibError::PollerFailed(format!("failed to poll completion queue: {e}"))
            })?;
            let Some(wc) = wc else {
                return Ok(());
            };
            self.table.dispatch(&wc);
        }
    }
}
