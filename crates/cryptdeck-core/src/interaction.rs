//! Message passing between transition workers and the presentation thread.
//!
//! Workers never touch presentation code. When a transition needs a passphrase
//! or has to show a notice it sends an [`InteractionRequest`] and blocks until
//! the presentation thread answers it. Snapshot and completion notifications
//! travel over the same channel but expect no answer.

use crate::controller::TransitionOutcome;
use crate::error::{CryptdeckError, CryptdeckResult};
use crate::oracle::VolumeState;
use crate::tables::SnapshotSummary;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::debug;
use std::fmt;
use zeroize::Zeroizing;

/// Severity of a notice: refusals are warnings, failed operations errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Warning,
    Error,
}

/// Unit of user interaction a worker needs performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interaction {
    /// Collect a secret for unlocking `volume`.
    Passphrase {
        volume: String,
        title: String,
        prompt: String,
    },
    /// Show a message and wait for acknowledgement.
    Notice {
        level: NoticeLevel,
        title: String,
        message: String,
    },
}

/// Answer produced by the presentation thread.
pub enum InteractionResponse {
    /// Entered secret, or `None` when the prompt was cancelled.
    Passphrase(Option<Zeroizing<String>>),
    Acknowledged,
}

impl fmt::Debug for InteractionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractionResponse::Passphrase(Some(_)) => f.write_str("Passphrase(<redacted>)"),
            InteractionResponse::Passphrase(None) => f.write_str("Passphrase(cancelled)"),
            InteractionResponse::Acknowledged => f.write_str("Acknowledged"),
        }
    }
}

/// An interaction awaiting an answer. Dropping it unanswered wakes the
/// worker with [`CryptdeckError::InteractionClosed`].
#[derive(Debug)]
pub struct InteractionRequest {
    interaction: Interaction,
    reply: Sender<InteractionResponse>,
}

impl InteractionRequest {
    pub fn interaction(&self) -> &Interaction {
        &self.interaction
    }

    pub fn respond(self, response: InteractionResponse) {
        if self.reply.send(response).is_err() {
            debug!("worker went away before its interaction was answered");
        }
    }
}

/// Everything the presentation thread receives.
#[derive(Debug)]
pub enum PresentationEvent {
    Interaction(InteractionRequest),
    Refreshed(SnapshotSummary),
    TransitionComplete {
        volume: String,
        state: Option<VolumeState>,
        outcome: TransitionOutcome,
    },
}

/// Worker-side handle onto the presentation channel.
#[derive(Debug, Clone)]
pub struct PresentationLink {
    tx: Sender<PresentationEvent>,
}

/// Receiving end drained by the presentation thread.
pub type EventReceiver = Receiver<PresentationEvent>;

/// Create a link and the receiver the presentation thread drains.
pub fn presentation_channel() -> (PresentationLink, EventReceiver) {
    let (tx, rx) = unbounded();
    (PresentationLink { tx }, rx)
}

impl PresentationLink {
    /// Send `interaction` and block until the presentation thread answers.
    pub fn request(&self, interaction: Interaction) -> CryptdeckResult<InteractionResponse> {
        let (reply, response) = bounded(1);
        self.tx
            .send(PresentationEvent::Interaction(InteractionRequest {
                interaction,
                reply,
            }))
            .map_err(|_| CryptdeckError::InteractionClosed)?;
        response
            .recv()
            .map_err(|_| CryptdeckError::InteractionClosed)
    }

    pub fn ask_passphrase(&self, volume: &str) -> CryptdeckResult<Option<Zeroizing<String>>> {
        let response = self.request(Interaction::Passphrase {
            volume: volume.to_string(),
            title: format!("Unlocking {volume}"),
            prompt: "Please enter the passphrase".to_string(),
        })?;
        match response {
            InteractionResponse::Passphrase(secret) => Ok(secret),
            InteractionResponse::Acknowledged => Ok(None),
        }
    }

    pub fn notify(
        &self,
        level: NoticeLevel,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> CryptdeckResult<()> {
        self.request(Interaction::Notice {
            level,
            title: title.into(),
            message: message.into(),
        })
        .map(|_| ())
    }

    /// Fire-and-forget notification.
    pub fn publish(&self, event: PresentationEvent) {
        if self.tx.send(event).is_err() {
            debug!("presentation channel closed; dropping notification");
        }
    }
}

/// Presentation-thread behaviour for each kind of event.
pub trait Presenter {
    /// Collect a secret; `None` cancels the unlock.
    fn passphrase(&mut self, volume: &str, title: &str, prompt: &str)
        -> Option<Zeroizing<String>>;

    fn notice(&mut self, level: NoticeLevel, title: &str, message: &str);

    fn refreshed(&mut self, _summary: SnapshotSummary) {}

    fn transition_complete(
        &mut self,
        _volume: &str,
        _state: Option<VolumeState>,
        _outcome: &TransitionOutcome,
    ) {
    }
}

/// Handle one event on the calling (presentation) thread.
pub fn dispatch<P: Presenter + ?Sized>(event: PresentationEvent, presenter: &mut P) {
    match event {
        PresentationEvent::Interaction(request) => {
            let response = match request.interaction() {
                Interaction::Passphrase {
                    volume,
                    title,
                    prompt,
                } => InteractionResponse::Passphrase(presenter.passphrase(volume, title, prompt)),
                Interaction::Notice {
                    level,
                    title,
                    message,
                } => {
                    presenter.notice(*level, title, message);
                    InteractionResponse::Acknowledged
                }
            };
            request.respond(response);
        }
        PresentationEvent::Refreshed(summary) => presenter.refreshed(summary),
        PresentationEvent::TransitionComplete {
            volume,
            state,
            outcome,
        } => presenter.transition_complete(&volume, state, &outcome),
    }
}
