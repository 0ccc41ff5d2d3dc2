//! Background execution of volume transitions.
//!
//! The worker thread owns the whole privileged sequence and talks to the user
//! only through the presentation channel, so the presentation thread stays
//! free to answer prompts. The single-transition rule is enforced by the
//! controller's slot, so a worker never bypasses it.

use crate::controller::{Transition, TransitionOutcome, VolumeController};
use crate::error::{CryptdeckError, CryptdeckResult};
use crate::interaction::{dispatch, EventReceiver, Presenter};
use crate::provider::VolumeOps;
use crossbeam_channel::RecvTimeoutError;
use log::{debug, error};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often a serving presentation loop checks whether the worker died.
const SERVE_POLL: Duration = Duration::from_millis(100);

/// Runs transitions off the presentation thread.
pub struct TransitionWorker<O> {
    controller: Arc<VolumeController<O>>,
}

impl<O> Clone for TransitionWorker<O> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
        }
    }
}

/// Handle for a submitted transition.
#[derive(Debug)]
pub struct TransitionTicket {
    volume: String,
    handle: JoinHandle<TransitionOutcome>,
}

impl TransitionTicket {
    pub fn volume(&self) -> &str {
        &self.volume
    }

    /// True once the worker thread has ended, normally or by panicking.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the transition to finish.
    pub fn join(self) -> CryptdeckResult<TransitionOutcome> {
        self.handle.join().map_err(|_| {
            error!("transition worker for `{}` panicked", self.volume);
            CryptdeckError::Provider(format!("transition of `{}` panicked", self.volume))
        })
    }

    /// Answer events on the calling thread until the worker ends, then join.
    ///
    /// Returns even when the worker dies without publishing a completion and
    /// the channel stays open because other handles keep the controller alive.
    pub fn serve<P: Presenter + ?Sized>(
        self,
        events: &EventReceiver,
        presenter: &mut P,
    ) -> CryptdeckResult<TransitionOutcome> {
        loop {
            match events.recv_timeout(SERVE_POLL) {
                Ok(event) => dispatch(event, presenter),
                Err(RecvTimeoutError::Timeout) if self.is_finished() => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            dispatch(event, presenter);
        }
        self.join()
    }
}

impl<O> TransitionWorker<O>
where
    O: VolumeOps + Send + Sync + 'static,
{
    pub fn new(controller: Arc<VolumeController<O>>) -> Self {
        Self { controller }
    }

    /// True while any transition holds the controller's slot.
    pub fn is_busy(&self) -> bool {
        self.controller.is_busy()
    }

    /// Start `transition` for `volume` on a fresh thread.
    ///
    /// The controller's slot is claimed before the thread starts, so this
    /// fails with [`CryptdeckError::TransitionInFlight`] while any other
    /// transition on the same controller is still running.
    pub fn submit(
        &self,
        volume: &str,
        transition: Transition,
    ) -> CryptdeckResult<TransitionTicket> {
        let slot = self.controller.claim().map_err(|err| {
            debug!("rejecting {transition} of `{volume}`: {err}");
            err
        })?;

        let controller = self.controller.clone();
        let name = volume.to_string();
        let handle = thread::Builder::new()
            .name(format!("cryptdeck-{transition}"))
            .spawn(move || controller.transition_claimed(&slot, &name, transition))?;

        Ok(TransitionTicket {
            volume: volume.to_string(),
            handle,
        })
    }
}
