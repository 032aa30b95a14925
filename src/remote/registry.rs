//! The handler registry: one slot per message type.
//!
//! A request names a `msg_type` in 120..=143. The reserved half carries
//! the built-in handlers; the upper half belongs to the embedding
//! application. Registration replaces the slot.
//!
//! Handlers come in two shapes:
//!
//! - **`OneShot`** — runs, fills the shared data buffer, and its `i32`
//!   result plus the buffer travel back to the client in the reply.
//! - **`TwoStage`** — for operations that cannot return (reboot, OTA).
//!   The optional `verify` stage validates and produces a result; the
//!   reply (header only) is flushed and the connection closed, and only
//!   then does `commit` run the destructive part.

use crate::adapters::device_id::BoardId;
use crate::error::Error;
use crate::flash::storage::{SettingsFile, SettingsSource};
use crate::ports::{FlashPort, SystemPort, WifiPort};

use super::crypto::SecretState;
use super::{ID_FIRST_HANDLER, ID_LAST_USER_HANDLER, MAX_DATA_SIZE, NUM_HANDLERS};

// ── Handler context ──────────────────────────────────────────

/// Everything a handler may touch, threaded in from the service per
/// dispatch so the registry itself stays borrow-free.
pub struct HandlerCtx<'a> {
    pub flash: &'a mut dyn FlashPort,
    pub system: &'a mut dyn SystemPort,
    pub wifi: &'a mut dyn WifiPort,
    pub secret: &'a mut SecretState,
    pub board_id: BoardId,
}

impl HandlerCtx<'_> {
    /// Snapshot the settings file for lookups.
    pub fn settings(&self) -> crate::error::Result<SettingsFile> {
        SettingsFile::load(&*self.flash)
    }

    /// Convenience lookup against a fresh snapshot.
    pub fn settings_lookup(&self, key: &str, out: &mut [u8]) -> Option<usize> {
        self.settings().ok()?.lookup(key, out)
    }
}

// ── Handler I/O ──────────────────────────────────────────────

/// The shared request/reply buffer view handed to a handler.
pub struct HandlerIo<'a> {
    /// The session data buffer. On entry it holds the request payload;
    /// whatever the handler leaves in it becomes the reply payload.
    pub data: &'a mut [u8; MAX_DATA_SIZE],
    /// Request payload length.
    pub input_size: usize,
    /// Request parameter (stage-1) or stage-1 result (commit stage).
    pub parameter: i32,
    /// Reply payload length. Starts at the full buffer size; the handler
    /// must shrink it to what it actually produced.
    pub output_size: usize,
}

impl HandlerIo<'_> {
    /// The request payload.
    pub fn input(&self) -> &[u8] {
        &self.data[..self.input_size.min(MAX_DATA_SIZE)]
    }

    /// Replace the reply payload.
    pub fn set_output(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(MAX_DATA_SIZE);
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.output_size = n;
    }
}

/// First stage: validate and produce a result plus reply data.
pub type Stage1Fn = Box<dyn FnMut(&mut HandlerCtx<'_>, u8, &mut HandlerIo<'_>) -> i32>;

/// Second stage: the destructive action, after the reply is on the wire.
pub type Stage2Fn = Box<dyn FnMut(&mut HandlerCtx<'_>, u8, &mut HandlerIo<'_>)>;

/// A registered handler.
pub enum Handler {
    OneShot(Stage1Fn),
    TwoStage {
        verify: Option<Stage1Fn>,
        commit: Stage2Fn,
    },
}

// ── Table ────────────────────────────────────────────────────

/// Outcome of a stage-1 dispatch.
pub struct DispatchResult {
    pub result: i32,
    pub output_size: usize,
    /// Whether a commit stage is pending for this message type.
    pub commit_pending: bool,
}

/// Fixed table of handlers indexed by message type.
#[derive(Default)]
pub struct HandlerTable {
    entries: [Option<Handler>; NUM_HANDLERS],
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-shot handler, replacing any previous entry.
    /// `InvalidArg` when `msg_type` is outside the handler id range.
    pub fn set_handler(&mut self, msg_type: u8, stage1: Stage1Fn) -> crate::error::Result<()> {
        self.install(msg_type, Handler::OneShot(stage1))
    }

    /// Register a two-stage handler, replacing any previous entry.
    pub fn set_two_stage_handler(
        &mut self,
        msg_type: u8,
        verify: Option<Stage1Fn>,
        commit: Stage2Fn,
    ) -> crate::error::Result<()> {
        self.install(msg_type, Handler::TwoStage { verify, commit })
    }

    fn install(&mut self, msg_type: u8, handler: Handler) -> crate::error::Result<()> {
        let index = Self::index_of(msg_type).ok_or(Error::InvalidArg)?;
        self.entries[index] = Some(handler);
        Ok(())
    }

    /// Whether a request for `msg_type` can be dispatched.
    pub fn is_registered(&self, msg_type: u8) -> bool {
        Self::index_of(msg_type)
            .map(|i| self.entries[i].is_some())
            .unwrap_or(false)
    }

    /// Run the stage-1 side of a request. `None` when no handler is
    /// registered (the table may have changed since the header check).
    ///
    /// Without a verify stage the input size and parameter pass straight
    /// through to the pending commit.
    pub fn dispatch(
        &mut self,
        ctx: &mut HandlerCtx<'_>,
        msg_type: u8,
        io: &mut HandlerIo<'_>,
    ) -> Option<DispatchResult> {
        let index = Self::index_of(msg_type)?;
        let handler = self.entries[index].as_mut()?;

        let (stage1, commit_pending) = match handler {
            Handler::OneShot(stage1) => (Some(stage1), false),
            Handler::TwoStage { verify, .. } => (verify.as_mut(), true),
        };

        let (result, output_size) = match stage1 {
            Some(stage1) => {
                io.output_size = MAX_DATA_SIZE;
                let result = stage1(ctx, msg_type, io);
                // A handler must not grow the reply past the buffer; cap
                // rather than trusting it.
                (result, io.output_size.min(MAX_DATA_SIZE))
            }
            None => (io.parameter, io.input_size),
        };

        Some(DispatchResult {
            result,
            output_size,
            commit_pending,
        })
    }

    /// Run the commit stage, if one is registered.
    pub fn run_commit(&mut self, ctx: &mut HandlerCtx<'_>, msg_type: u8, io: &mut HandlerIo<'_>) {
        let Some(index) = Self::index_of(msg_type) else {
            return;
        };
        if let Some(Handler::TwoStage { commit, .. }) = self.entries[index].as_mut() {
            commit(ctx, msg_type, io);
        }
    }

    fn index_of(msg_type: u8) -> Option<usize> {
        (ID_FIRST_HANDLER..=ID_LAST_USER_HANDLER)
            .contains(&msg_type)
            .then(|| (msg_type - ID_FIRST_HANDLER) as usize)
    }
}
