//! Acquires the adapter in the background and publishes the ready [Session].
//!
//! Every attempt builds a new session from scratch. A session that failed to find
//! or open an adapter is closed and thrown away, never retried.

use std::{
    io,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    engine::{EngineCallbacks, EngineConfig, EngineFactory},
    error::{Error, Result},
    session::{Session, SessionTiming},
};

/// Where adapters find the current session.
#[derive(Default)]
pub struct SessionSlot {
    session: RwLock<Option<Arc<Session>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a session is installed and its adapter is open.
    pub fn is_ready(&self) -> bool {
        self.session.read().as_ref().map_or(false, |s| s.is_ready())
    }

    /// The ready session, or [Error::ServiceUnavailable].
    pub fn get(&self) -> Result<Arc<Session>> {
        match &*self.session.read() {
            Some(s) if s.is_ready() => Ok(s.clone()),
            _ => Err(Error::ServiceUnavailable),
        }
    }

    pub fn install(&self, session: Arc<Session>) {
        *self.session.write() = Some(session);
    }

    /// Remove the session, e.g. to close it on shutdown.
    pub fn take(&self) -> Option<Arc<Session>> {
        self.session.write().take()
    }
}

/// Doubling retry delay with an upper bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(60))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }
    /// The delay to wait now. Doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Everything one connection attempt needs.
pub struct ConnectOptions {
    pub factory: Arc<dyn EngineFactory>,
    pub engine: EngineConfig,
    pub callbacks: Arc<dyn EngineCallbacks>,
    pub timing: SessionTiming,
    /// open this adapter instead of the first one found
    pub adapter: Option<String>,
    pub backoff: Backoff,
}

/// Single connection attempt: new session, find, open, settle.
fn connect(opts: &ConnectOptions) -> Result<Session> {
    info!("initialising CEC connection");
    let session = Session::open(
        opts.factory.as_ref(),
        &opts.engine,
        opts.callbacks.clone(),
        opts.timing.clone(),
    )?;
    let path = match &opts.adapter {
        Some(path) if !path.is_empty() => path.clone(),
        _ => {
            let adapters = session.find_adapters()?;
            let first = adapters.first().ok_or(Error::NoAdapterFound)?;
            info!(path = first.open_path(), comm = %first.comm, "found adapter");
            first.open_path().to_string()
        }
    };
    session.open_adapter(&path)?;
    info!(info = %session.engine_info(), "CEC connection established");
    Ok(session)
}

/// Handle on the background connect loop.
pub struct Supervisor {
    stop: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Start acquiring an adapter. Returns immediately; the session shows up in `slot`.
    pub fn spawn(opts: ConnectOptions, slot: Arc<SessionSlot>) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel();
        let thread = thread::Builder::new()
            .name("cec-connect".into())
            .spawn(move || run(opts, &slot, &stopped))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// True once the loop has ended, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Interrupt a pending retry and wait for the loop to end.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.stop.send(());
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                warn!("connect thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Sleep for `delay`. False if a stop was requested meanwhile.
fn pause(stopped: &mpsc::Receiver<()>, delay: Duration) -> bool {
    matches!(stopped.recv_timeout(delay), Err(RecvTimeoutError::Timeout))
}

fn run(mut opts: ConnectOptions, slot: &SessionSlot, stopped: &mpsc::Receiver<()>) {
    loop {
        match stopped.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => return,
            Err(mpsc::TryRecvError::Empty) => {}
        }
        match connect(&opts) {
            Ok(session) => {
                if !pause(stopped, opts.timing.post_open_settle) {
                    session.close();
                    return;
                }
                slot.install(Arc::new(session));
                info!("CEC adapter is ready");
                return;
            }
            Err(e) => {
                let delay = opts.backoff.next_delay();
                warn!("CEC connection failed: {e}, retrying in {delay:?}");
                if !pause(stopped, delay) {
                    return;
                }
            }
        }
    }
}
