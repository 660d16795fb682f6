// SPDX-License-Identifier: Apache-2.0

//! A software stand-in for a confidentiality technology, for exercising
//! migration drivers without hardware.
//!
//! The mock honours the full operation contract (ordering, state checks,
//! shared-region bookkeeping, fail-stop reads) but its "encryption" is a
//! keystream XOR whose key travels in the clear inside the first page
//! record. It protects nothing.
//!
//! Page record layout:
//!
//! | Field | Size |
//! |---|---|
//! | session present | `u8`, 0 or 1 |
//! | session | big-endian `u32` length + bincode `MockSession`, only if present |
//! | SHA-256 of the plaintext page | 32 bytes |
//! | wrapped page | big-endian `u32` length + bytes |
//!
//! The shared-region list uses the [`SharedRegionList`] encoding.
//!
//! ## Example
//!
//! ```
//! use cgs::backend::mock::MockBackend;
//! use cgs::migration::{Gfn, MemoryEncryptionOps, SetupParameters, PAGE_SIZE};
//!
//! let mut source = MockBackend::new();
//! source.shared_regions().share(Gfn(5), 1);
//! source.save_setup(&SetupParameters::new("pdh", "plat", "amd")).unwrap();
//!
//! let mut stream = Vec::<u8>::new();
//! source.save_outgoing_shared_regions_list(&mut stream).unwrap();
//! let page = [0xA5u8; PAGE_SIZE];
//! assert_eq!(source.save_outgoing_page(&mut stream, &page).unwrap(), 4096);
//!
//! let mut destination = MockBackend::new();
//! let mut rdr = &stream[..];
//! destination.load_incoming_shared_regions_list(&mut rdr).unwrap();
//! assert!(!destination.is_gfn_in_unshared_region(Gfn(5)));
//!
//! let mut installed = [0u8; PAGE_SIZE];
//! destination.load_incoming_page(&mut rdr, &mut installed).unwrap();
//! assert_eq!(installed, page);
//! ```

use crate::error::Error;
use crate::migration::regions::{SharedRegionList, SharedRegions};
use crate::migration::session::SessionState;
use crate::migration::stream::{get_blob, put_blob};
use crate::migration::{Gfn, MemoryEncryptionOps, SetupParameters, PAGE_SIZE};
use crate::parser::{Decoder, Encoder};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

/// Status code reported by injected failures.
pub const INJECTED_FAILURE: u32 = 0xFF;

const MAX_SESSION_LEN: usize = 256;

/// Where to inject a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    /// `save_setup` fails.
    SaveSetup,

    /// The `save_outgoing_page` call with this zero-based index fails.
    SaveOutgoingPage(usize),

    /// The `load_incoming_page` call with this zero-based index fails.
    LoadIncomingPage(usize),

    /// `save_outgoing_shared_regions_list` fails.
    SaveSharedRegionsList,

    /// `load_incoming_shared_regions_list` fails.
    LoadSharedRegionsList,
}

/// An operation invoked on the mock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// `save_setup`
    SaveSetup,
    /// `save_outgoing_page`
    SaveOutgoingPage,
    /// `load_incoming_page`
    LoadIncomingPage,
    /// `save_outgoing_shared_regions_list`
    SaveSharedRegionsList,
    /// `load_incoming_shared_regions_list`
    LoadSharedRegionsList,
    /// `cancel`
    Cancel,
}

/// Record of the operations invoked on a mock, readable after the mock
/// was handed to a confidential guest support object.
#[derive(Clone, Debug, Default)]
pub struct Journal(Arc<Mutex<Vec<Operation>>>);

impl Journal {
    fn record(&self, op: Operation) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }

    /// Every operation so far, in call order.
    pub fn operations(&self) -> Vec<Operation> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times `op` was invoked.
    pub fn count(&self, op: Operation) -> usize {
        self.operations().iter().filter(|o| **o == op).count()
    }
}

#[derive(Serialize, Deserialize)]
struct MockSession {
    id: Uuid,
    #[serde(with = "serde_bytes")]
    key: Vec<u8>,
}

impl MockSession {
    fn wrap(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ self.key[i % self.key.len()] ^ (i / self.key.len()) as u8)
            .collect()
    }
}

/// The mock memory encryption backend.
pub struct MockBackend {
    regions: SharedRegions,
    state: SessionState,
    session: Option<MockSession>,
    session_sent: bool,
    pages_out: usize,
    pages_in: usize,
    fail: Option<FailPoint>,
    journal: Journal,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// A backend with all guest memory private.
    pub fn new() -> Self {
        Self::with_regions(SharedRegions::new())
    }

    /// A backend classifying memory with an existing shared-region handle.
    pub fn with_regions(regions: SharedRegions) -> Self {
        Self {
            regions,
            state: SessionState::Idle,
            session: None,
            session_sent: false,
            pages_out: 0,
            pages_in: 0,
            fail: None,
            journal: Journal::default(),
        }
    }

    /// Make the given operation fail with [`Error::Firmware`].
    pub fn fail_at(mut self, point: FailPoint) -> Self {
        self.fail = Some(point);
        self
    }

    /// Handle for converting guest pages between shared and private.
    pub fn shared_regions(&self) -> SharedRegions {
        self.regions.clone()
    }

    /// Handle to the operation journal.
    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    /// The backend's session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn inject(&self, point: FailPoint) -> Result<(), Error> {
        if self.fail == Some(point) {
            tracing::debug!(?point, "injecting mock failure");
            return Err(Error::Firmware(INJECTED_FAILURE));
        }

        Ok(())
    }

    fn expect_source(&self) -> Result<(), Error> {
        match self.state {
            SessionState::SetupDone | SessionState::Transferring => Ok(()),
            actual => Err(Error::InvalidState {
                expected: SessionState::Transferring,
                actual,
            }),
        }
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }

        Ok(())
    }
}

impl MemoryEncryptionOps for MockBackend {
    fn save_setup(&mut self, params: &SetupParameters) -> Result<(), Error> {
        self.journal.record(Operation::SaveSetup);
        self.expect_state(SessionState::Idle)?;
        self.inject(FailPoint::SaveSetup)?;

        for (name, value) in [
            ("pdh", &params.pdh),
            ("plat_cert", &params.plat_cert),
            ("amd_cert", &params.amd_cert),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidCertificate(format!("{name} is empty")));
            }
        }

        let id = Uuid::new_v4();
        let mut hasher = Sha256::new();
        hasher.update(id.as_bytes());
        hasher.update(params.pdh.as_bytes());
        hasher.update(params.plat_cert.as_bytes());
        hasher.update(params.amd_cert.as_bytes());

        self.session = Some(MockSession {
            id,
            key: hasher.finalize().to_vec(),
        });
        self.session_sent = false;
        self.pages_out = 0;
        self.state = SessionState::SetupDone;
        Ok(())
    }

    fn save_outgoing_page(&mut self, stream: &mut dyn Write, page: &[u8]) -> Result<u64, Error> {
        self.journal.record(Operation::SaveOutgoingPage);
        self.expect_source()?;

        let index = self.pages_out;
        self.pages_out += 1;
        self.inject(FailPoint::SaveOutgoingPage(index))?;

        if page.len() != PAGE_SIZE {
            return Err(Error::InvalidPageSize(page.len(), PAGE_SIZE));
        }

        let session = match &self.session {
            Some(session) => session,
            None => {
                return Err(Error::InvalidState {
                    expected: SessionState::SetupDone,
                    actual: SessionState::Idle,
                })
            }
        };

        if self.session_sent {
            0u8.encode(stream, ())?;
        } else {
            1u8.encode(stream, ())?;
            put_blob(stream, &bincode::serialize(session)?)?;
        }

        let digest: [u8; 32] = Sha256::digest(page).into();
        digest.encode(stream, ())?;

        let wrapped = session.wrap(page);
        put_blob(stream, &wrapped)?;

        tracing::trace!(digest = %hex::encode(&digest[..8]), "mock page wrapped");

        self.session_sent = true;
        self.state = SessionState::Transferring;
        Ok(wrapped.len() as u64)
    }

    fn load_incoming_page(&mut self, stream: &mut dyn Read, page: &mut [u8]) -> Result<(), Error> {
        self.journal.record(Operation::LoadIncomingPage);
        self.expect_state(SessionState::Receiving)?;

        let index = self.pages_in;
        self.pages_in += 1;
        self.inject(FailPoint::LoadIncomingPage(index))?;

        if page.len() != PAGE_SIZE {
            return Err(Error::InvalidPageSize(page.len(), PAGE_SIZE));
        }

        match u8::decode(stream, ())? {
            0 => {}
            1 => {
                let blob = get_blob(stream, MAX_SESSION_LEN)?;
                let session: MockSession = bincode::deserialize(&blob)?;
                if session.key.is_empty() {
                    return Err(Error::InvalidRecord("empty mock session key".into()));
                }

                tracing::debug!(session = %session.id, "mock receive start");
                self.session = Some(session);
            }
            flag => {
                return Err(Error::InvalidRecord(format!(
                    "invalid session flag {flag:#x}"
                )))
            }
        }

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| Error::InvalidRecord("page arrived before session start".into()))?;

        let digest = <[u8; 32]>::decode(stream, ())?;
        let wrapped = get_blob(stream, PAGE_SIZE)?;
        if wrapped.len() != page.len() {
            return Err(Error::InvalidPageSize(wrapped.len(), page.len()));
        }

        // Unwrapping is the same XOR.
        let plain = session.wrap(&wrapped);
        let actual: [u8; 32] = Sha256::digest(&plain).into();
        if actual != digest {
            return Err(Error::IntegrityFailure);
        }

        page.copy_from_slice(&plain);
        Ok(())
    }

    fn is_gfn_in_unshared_region(&self, gfn: Gfn) -> bool {
        !self.regions.is_shared(gfn)
    }

    fn save_outgoing_shared_regions_list(&mut self, stream: &mut dyn Write) -> Result<(), Error> {
        self.journal.record(Operation::SaveSharedRegionsList);
        self.expect_state(SessionState::SetupDone)?;
        self.inject(FailPoint::SaveSharedRegionsList)?;

        let list = self.regions.snapshot();
        list.encode(stream, ())?;

        tracing::debug!(regions = list.len(), pages = list.pages(), "mock shared regions sent");
        self.state = SessionState::Transferring;
        Ok(())
    }

    fn load_incoming_shared_regions_list(&mut self, stream: &mut dyn Read) -> Result<(), Error> {
        self.journal.record(Operation::LoadSharedRegionsList);
        self.expect_state(SessionState::Idle)?;
        self.inject(FailPoint::LoadSharedRegionsList)?;

        let list = SharedRegionList::decode(stream, ())?;
        tracing::debug!(regions = list.len(), pages = list.pages(), "mock shared regions received");

        self.regions.replace(list);
        self.pages_in = 0;
        self.state = SessionState::Receiving;
        Ok(())
    }

    fn cancel(&mut self) {
        self.journal.record(Operation::Cancel);
        self.session = None;
        self.session_sent = false;
        self.state = SessionState::Idle;
    }
}
