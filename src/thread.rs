//! Spawn-join functionality.
//!
//! **You may not need to check this if it is OK to run workers with [`std::thread`].**
//!
//! The orchestrator never spawns threads directly. It goes through the [`Thread`] trait so that a
//! failed spawn is reported as an error instead of a panic, and so that joining can be bounded:
//! a [`JoinHandle`] can be asked whether its thread has finished before it is joined. A handle
//! that is dropped without being joined detaches its thread.
//!
//! Note that for simplicity, the closure passed to [`Thread::spawn`] does not return a value.

use std::io;

/// A join handle returned by a spawn function.
pub trait JoinHandle: Send {
    /// Join the thread, consume the boxed self. Returns `false` if the thread panicked.
    fn join(self: Box<Self>) -> bool;

    /// Whether the thread has finished running its closure.
    fn is_finished(&self) -> bool;
}

/// A thread management abstraction.
pub trait Thread: Send + Sync {
    /// Spawn a new named thread using a boxed closure.
    fn spawn(&self, name: String, f: Box<dyn FnOnce() + Send>) -> io::Result<Box<dyn JoinHandle>>;
}

/// A zero-sized wrapper for [`std::thread`] functions.
#[derive(Clone, Debug, Default)]
pub struct DefaultThread;

/// A wrapper for [`std::thread::JoinHandle`].
pub struct DefaultJoinHandle(std::thread::JoinHandle<()>);

impl JoinHandle for DefaultJoinHandle {
    fn join(self: Box<Self>) -> bool {
        self.0.join().is_ok()
    }

    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Thread for DefaultThread {
    fn spawn(&self, name: String, f: Box<dyn FnOnce() + Send>) -> io::Result<Box<dyn JoinHandle>> {
        let handle = std::thread::Builder::new().name(name).spawn(f)?;
        Ok(Box::new(DefaultJoinHandle(handle)))
    }
}
