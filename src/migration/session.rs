// SPDX-License-Identifier: Apache-2.0

//! Source and destination migration sessions as type-state machines.
//! This ensures (at compile time) that the operations of a
//! [`MemoryEncryptionOps`] implementation are called in the right order.
//!
//! ```text
//! source:      IDLE -> SETUP_DONE -> TRANSFERRING -> DONE
//! destination: IDLE -> RECEIVING -> DONE
//! ```
//!
//! Any failing operation moves the session to `ABORTED`, which is terminal:
//! the backend is told to discard its partial state and the session can
//! only be dropped. A destination that aborted must not resume the guest.

use super::{Gfn, MemoryEncryptionOps, SetupParameters};
use crate::error::Error;
use crate::support::ConfidentialGuestSupport;

use uuid::Uuid;

use std::fmt::Display;
use std::io::{Read, Write};

/// Runtime view of a session's progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No session in progress.
    Idle,

    /// Source platform context initialized.
    SetupDone,

    /// Source is streaming pages.
    Transferring,

    /// Destination is installing pages.
    Receiving,

    /// Completed successfully.
    Done,

    /// Failed; terminal.
    Aborted,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::SetupDone => "setup-done",
            SessionState::Transferring => "transferring",
            SessionState::Receiving => "receiving",
            SessionState::Done => "done",
            SessionState::Aborted => "aborted",
        };
        write!(f, "{name}")
    }
}

/// Session type-state that indicates a brand new session.
pub struct New;

/// Sender type-state that indicates the platform context is set up.
pub struct SetupDone;

/// Session type-state that indicates pages are flowing.
pub struct Transferring {
    pages: u64,
    bytes: u64,
    aborted: bool,
}

impl Transferring {
    fn new() -> Self {
        Self {
            pages: 0,
            bytes: 0,
            aborted: false,
        }
    }
}

/// Totals of a completed session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Encrypted pages moved.
    pub pages: u64,

    /// Wrapped page bytes moved.
    pub bytes: u64,
}

type Ops = dyn MemoryEncryptionOps + 'static;

fn lookup(cgs: &mut ConfidentialGuestSupport) -> Result<&mut Ops, Error> {
    let technology = cgs.technology();
    cgs.memory_encryption_ops()?
        .ok_or(Error::Unsupported(technology))
}

/// Facilitates the correct execution of the source side of a migration.
pub struct Sender<'a, T> {
    state: T,
    ops: &'a mut Ops,
    id: Uuid,
}

impl<'a, T> Sender<'a, T> {
    /// Identifier used to correlate this session's log events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether `gfn` must take the encrypted page path.
    pub fn is_private(&self, gfn: Gfn) -> bool {
        self.ops.is_gfn_in_unshared_region(gfn)
    }

    /// Cancel the session, discarding the backend's partial state.
    pub fn cancel(self) {
        tracing::info!(session = %self.id, "outgoing migration cancelled");
        self.ops.cancel();
    }

    fn abort(&mut self, error: &Error) {
        tracing::warn!(session = %self.id, %error, "outgoing migration aborted");
        self.ops.cancel();
    }
}

impl<'a> Sender<'a, New> {
    /// Begin an outgoing session for a ready guest with an operation set.
    pub fn new(cgs: &'a mut ConfidentialGuestSupport) -> Result<Self, Error> {
        Ok(Self {
            state: New,
            ops: lookup(cgs)?,
            id: Uuid::new_v4(),
        })
    }

    /// Initialize the platform migration context. No data has been sent
    /// if this fails.
    pub fn setup(mut self, params: &SetupParameters) -> Result<Sender<'a, SetupDone>, Error> {
        if let Err(e) = self.ops.save_setup(params) {
            self.abort(&e);
            return Err(e);
        }

        tracing::debug!(session = %self.id, "outgoing migration set up");
        Ok(Sender {
            state: SetupDone,
            ops: self.ops,
            id: self.id,
        })
    }
}

impl<'a> Sender<'a, SetupDone> {
    /// Write the shared-region list ahead of all pages.
    pub fn send_shared_regions(
        mut self,
        stream: &mut dyn Write,
    ) -> Result<Sender<'a, Transferring>, Error> {
        if let Err(e) = self.ops.save_outgoing_shared_regions_list(stream) {
            self.abort(&e);
            return Err(e);
        }

        Ok(Sender {
            state: Transferring::new(),
            ops: self.ops,
            id: self.id,
        })
    }
}

impl<'a> Sender<'a, Transferring> {
    /// Send one private page. Returns the wrapped bytes written.
    ///
    /// After a failure every further call returns [`Error::Aborted`].
    pub fn send_page(&mut self, stream: &mut dyn Write, page: &[u8]) -> Result<u64, Error> {
        if self.state.aborted {
            return Err(Error::Aborted);
        }

        match self.ops.save_outgoing_page(stream, page) {
            Ok(bytes) => {
                self.state.pages += 1;
                self.state.bytes += bytes;
                Ok(bytes)
            }
            Err(e) => {
                self.state.aborted = true;
                self.abort(&e);
                Err(e)
            }
        }
    }

    /// Current state of the session.
    pub fn state(&self) -> SessionState {
        if self.state.aborted {
            SessionState::Aborted
        } else {
            SessionState::Transferring
        }
    }

    /// Complete the session.
    pub fn finish(self) -> Result<Summary, Error> {
        if self.state.aborted {
            return Err(Error::Aborted);
        }

        tracing::info!(
            session = %self.id,
            pages = self.state.pages,
            bytes = self.state.bytes,
            "outgoing encrypted migration complete"
        );

        Ok(Summary {
            pages: self.state.pages,
            bytes: self.state.bytes,
        })
    }
}

/// Destination type-state that indicates pages may be installed.
pub struct Receiving {
    pages: u64,
    aborted: bool,
}

/// Facilitates the correct execution of the destination side of a
/// migration.
pub struct Receiver<'a, T> {
    state: T,
    ops: &'a mut Ops,
    id: Uuid,
}

impl<'a, T> Receiver<'a, T> {
    /// Identifier used to correlate this session's log events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancel the session, discarding the backend's partial state.
    pub fn cancel(self) {
        tracing::info!(session = %self.id, "incoming migration cancelled");
        self.ops.cancel();
    }

    fn abort(&mut self, error: &Error) {
        tracing::warn!(
            session = %self.id,
            %error,
            "incoming migration aborted, guest must not resume"
        );
        self.ops.cancel();
    }
}

impl<'a> Receiver<'a, New> {
    /// Begin an incoming session for a ready guest with an operation set.
    pub fn new(cgs: &'a mut ConfidentialGuestSupport) -> Result<Self, Error> {
        Ok(Self {
            state: New,
            ops: lookup(cgs)?,
            id: Uuid::new_v4(),
        })
    }

    /// Rebuild the shared-region set. Must precede every page.
    pub fn receive_shared_regions(
        mut self,
        stream: &mut dyn Read,
    ) -> Result<Receiver<'a, Receiving>, Error> {
        if let Err(e) = self.ops.load_incoming_shared_regions_list(stream) {
            self.abort(&e);
            return Err(e);
        }

        Ok(Receiver {
            state: Receiving {
                pages: 0,
                aborted: false,
            },
            ops: self.ops,
            id: self.id,
        })
    }
}

impl<'a> Receiver<'a, Receiving> {
    /// Whether `gfn` is private according to the received list.
    pub fn is_private(&self, gfn: Gfn) -> bool {
        self.ops.is_gfn_in_unshared_region(gfn)
    }

    /// Install one private page into `page`.
    ///
    /// After a failure every further call returns [`Error::Aborted`].
    pub fn receive_page(&mut self, stream: &mut dyn Read, page: &mut [u8]) -> Result<(), Error> {
        if self.state.aborted {
            return Err(Error::Aborted);
        }

        if let Err(e) = self.ops.load_incoming_page(stream, page) {
            self.state.aborted = true;
            self.abort(&e);
            return Err(e);
        }

        self.state.pages += 1;
        Ok(())
    }

    /// Current state of the session.
    pub fn state(&self) -> SessionState {
        if self.state.aborted {
            SessionState::Aborted
        } else {
            SessionState::Receiving
        }
    }

    /// Complete the session. Only on success may the guest resume.
    pub fn finish(self) -> Result<Summary, Error> {
        if self.state.aborted {
            return Err(Error::Aborted);
        }

        tracing::info!(
            session = %self.id,
            pages = self.state.pages,
            "incoming encrypted migration complete"
        );
        Ok(Summary {
            pages: self.state.pages,
            bytes: 0,
        })
    }
}
