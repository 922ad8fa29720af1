//! Port ownership, cancellation and the passive serial monitor.
//!
//! The programmer and the monitor share the port through a [`PortLock`].
//! Protocol operations hold the lock for their whole duration, the monitor
//! only ever tries to take it and backs off when it is owned or paused.

use core::fmt::Debug;
use core::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use embedded_hal::serial::{Read, Write};

use crate::Error;

/// Exclusive ownership token for the transport
pub struct PortLock<P>(Arc<Mutex<P>>);

impl<P> Clone for PortLock<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P> PortLock<P> {
    pub fn new(port: P) -> Self {
        Self(Arc::new(Mutex::new(port)))
    }

    /// Block until the port is free
    pub fn lock(&self) -> MutexGuard<'_, P> {
        // A panic while holding the port leaves nothing half-updated that we track
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the port only if nobody else holds it
    pub fn try_lock(&self) -> Option<MutexGuard<'_, P>> {
        match self.0.try_lock() {
            Ok(g) => Some(g),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Cooperative cancellation, observed while waiting for responses
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Set while the bootloader session owns the link
#[derive(Clone, Debug, Default)]
pub(crate) struct Gate(Arc<AtomicBool>);

impl Gate {
    pub fn pause(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Passive reader for application output
pub struct Monitor<P, E> {
    port: PortLock<P>,
    gate: Gate,
    _err: PhantomData<E>,
}

impl<P, E> Clone for Monitor<P, E> {
    fn clone(&self) -> Self {
        Self { port: self.port.clone(), gate: self.gate.clone(), _err: PhantomData }
    }
}

impl<P, E> Monitor<P, E>
where
    P: Read<u8, Error = E> + Write<u8, Error = E>,
    E: Debug,
{
    pub(crate) fn new(port: PortLock<P>, gate: Gate) -> Self {
        Self { port, gate, _err: PhantomData }
    }

    /// Whether a bootloader session currently owns the link
    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Read pending bytes without waiting.
    ///
    /// Fails with [`Error::Busy`] while a protocol operation holds the port or the
    /// session has paused the monitor.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error<E>> {
        if self.gate.is_paused() {
            return Err(Error::Busy);
        }
        let mut port = self.port.try_lock().ok_or(Error::Busy)?;

        let mut n = 0;
        while n < buf.len() {
            match port.read() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }
        }
        Ok(n)
    }

    /// Send bytes to the running application
    pub fn write(&self, data: &[u8]) -> Result<(), Error<E>> {
        if self.gate.is_paused() {
            return Err(Error::Busy);
        }
        let mut port = self.port.try_lock().ok_or(Error::Busy)?;

        for b in data {
            block!(port.write(*b))?;
        }
        block!(port.flush())?;
        Ok(())
    }

    /// Poll the port on a background thread, handing output to `sink`
    pub fn spawn<F>(self, poll: Duration, mut sink: F) -> MonitorHandle
    where
        P: Send + 'static,
        E: Send + 'static,
        F: FnMut(&[u8]) + Send + 'static,
    {
        let cancel = CancelToken::default();
        let stop = cancel.clone();

        let thread = thread::spawn(move || {
            let mut buf = [0u8; 256];
            while !stop.is_cancelled() {
                match self.read(&mut buf) {
                    Ok(0) | Err(Error::Busy) => thread::sleep(poll),
                    Ok(n) => sink(&buf[..n]),
                    Err(e) => {
                        error!("Monitor read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Monitor stopped");
        });

        MonitorHandle { cancel, thread: Some(thread) }
    }
}

/// Background monitor, stopped when dropped
pub struct MonitorHandle {
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
