//! Core building blocks shared by the cryptdeck binaries.
//!
//! Table snapshots, state classification, and transition orchestration live
//! here so front ends only need to render events and answer prompts.

pub mod config;
pub mod controller;
pub mod error;
pub mod interaction;
pub mod logging;
pub mod oracle;
pub mod provider;
pub mod tables;
pub mod worker;

pub use config::{CryptdeckConfig, DevicesCfg, TablesCfg, ToolsCfg};
pub use controller::{
    Transition, TransitionOutcome, TransitionSlot, VolumeController, VolumeStatus,
};
pub use error::{CryptdeckError, CryptdeckResult};
pub use interaction::{
    dispatch, presentation_channel, EventReceiver, Interaction, InteractionRequest,
    InteractionResponse, NoticeLevel, PresentationEvent, PresentationLink, Presenter,
};
pub use oracle::{StateOracle, VolumeState};
pub use provider::{OpKind, OpOutcome, OpStatus, UnlockKey, VolumeOps};
pub use tables::{
    ConfigStore, KeySource, LiveMountSet, SkippedLine, Snapshot, SnapshotSummary, TableSource,
    VolumeDefinition,
};
pub use worker::{TransitionTicket, TransitionWorker};
