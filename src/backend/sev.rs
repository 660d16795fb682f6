// SPDX-License-Identifier: Apache-2.0

//! Memory encryption migration for AMD SEV guests.
//!
//! [`SevMigration`] drives the SEV `SEND_*`/`RECEIVE_*` firmware flow
//! through a [`MigrationFirmware`] implementation and keeps the guest's
//! shared-region bookkeeping. The firmware transport (the KVM
//! memory-encryption ioctls on a host) stays behind the trait.
//!
//! The send context is started lazily on the first private page, so a
//! guest without private memory never talks to the firmware.
//!
//! First page record:
//!
//! | Field | Encoding |
//! |---|---|
//! | policy | big-endian `u32` |
//! | session PDH | blob |
//! | session data | blob |
//! | packet header | blob |
//! | transport data | blob |
//!
//! Later records carry the packet header and transport data only. Blobs
//! are a big-endian `u32` length followed by the bytes.

use crate::error::Error;
use crate::migration::regions::{SharedRegionList, SharedRegions};
use crate::migration::session::SessionState;
use crate::migration::stream::{get_blob, put_blob};
use crate::migration::{Gfn, MemoryEncryptionOps, SetupParameters, PAGE_SIZE};
use crate::parser::{Decoder, Encoder};

use base64::{engine::general_purpose::STANDARD, Engine};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Read, Write};

/// Upper bound on any certificate or session blob read from a stream.
const MAX_BLOB_LEN: usize = 16 * 1024;

/// Upper bound on a packet header.
const MAX_HDR_LEN: usize = 256;

/// Output of `SEND_START`, replayed into `RECEIVE_START` on the
/// destination.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendStart {
    /// Guest policy.
    pub policy: u32,

    /// The source's PDH for this session.
    pub pdh: Vec<u8>,

    /// Wrapped transport keys.
    pub session: Vec<u8>,
}

/// One page as produced by `SEND_UPDATE_DATA`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    /// Packet header (IV and MAC).
    pub hdr: Vec<u8>,

    /// Page re-encrypted with the transport keys.
    pub trans: Vec<u8>,
}

/// Access to the SEV migration firmware commands of one guest.
pub trait MigrationFirmware: Send {
    /// `SEND_START`: create the outgoing context for the destination
    /// platform described by the decoded certificates.
    fn send_start(
        &mut self,
        pdh: &[u8],
        plat_cert: &[u8],
        amd_cert: &[u8],
    ) -> Result<SendStart, Error>;

    /// `SEND_UPDATE_DATA`: re-encrypt one guest page for transport.
    fn send_update_data(&mut self, page: &[u8]) -> Result<Packet, Error>;

    /// `RECEIVE_START`: create the incoming context.
    fn receive_start(&mut self, start: &SendStart) -> Result<(), Error>;

    /// `RECEIVE_UPDATE_DATA`: decrypt a packet into `page` with the guest's
    /// memory encryption key.
    fn receive_update_data(&mut self, packet: &Packet, page: &mut [u8]) -> Result<(), Error>;

    /// `SEND_CANCEL` or context teardown.
    fn cancel(&mut self) {}
}

struct Certificates {
    pdh: Vec<u8>,
    plat_cert: Vec<u8>,
    amd_cert: Vec<u8>,
}

impl Certificates {
    fn decode(params: &SetupParameters) -> Result<Self, Error> {
        let field = |name: &str, value: &str| {
            if value.is_empty() {
                return Err(Error::InvalidCertificate(format!("{name} is empty")));
            }

            STANDARD
                .decode(value)
                .map_err(|e| Error::InvalidCertificate(format!("{name}: {e}")))
        };

        Ok(Self {
            pdh: field("pdh", &params.pdh)?,
            plat_cert: field("plat-cert", &params.plat_cert)?,
            amd_cert: field("amd-cert", &params.amd_cert)?,
        })
    }
}

/// [`MemoryEncryptionOps`] for SEV guests.
pub struct SevMigration<F: MigrationFirmware> {
    firmware: F,
    regions: SharedRegions,
    state: SessionState,
    certs: Option<Certificates>,
    started: bool,
}

impl<F: MigrationFirmware> SevMigration<F> {
    /// Wrap the firmware of one guest. All memory starts private.
    pub fn new(firmware: F) -> Self {
        Self {
            firmware,
            regions: SharedRegions::new(),
            state: SessionState::Idle,
            certs: None,
            started: false,
        }
    }

    /// Handle to the shared-region set.
    pub fn shared_regions(&self) -> SharedRegions {
        self.regions.clone()
    }

    /// Record a guest page-state change of `npages` frames from `gpa`.
    pub fn map_gpa_range(&self, gpa: u64, npages: u64, encrypted: bool) {
        let start = Gfn::from_gpa(gpa);
        if encrypted {
            self.regions.unshare(start, npages);
        } else {
            self.regions.share(start, npages);
        }

        tracing::trace!(%start, npages, encrypted, "page state change");
    }

    /// The backend's session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The wrapped firmware.
    pub fn firmware(&self) -> &F {
        &self.firmware
    }

    fn start_send(&mut self, stream: &mut dyn Write) -> Result<(), Error> {
        let certs = self.certs.as_ref().ok_or(Error::InvalidState {
            expected: SessionState::SetupDone,
            actual: self.state,
        })?;

        let start = self
            .firmware
            .send_start(&certs.pdh, &certs.plat_cert, &certs.amd_cert)?;

        stream.write_u32::<BigEndian>(start.policy)?;
        put_blob(stream, &start.pdh)?;
        put_blob(stream, &start.session)?;

        tracing::debug!(policy = start.policy, "SEV send context started");
        self.started = true;
        Ok(())
    }

    fn start_receive(&mut self, stream: &mut dyn Read) -> Result<(), Error> {
        let policy = stream.read_u32::<BigEndian>()?;
        let pdh = get_blob(stream, MAX_BLOB_LEN)?;
        let session = get_blob(stream, MAX_BLOB_LEN)?;

        self.firmware.receive_start(&SendStart {
            policy,
            pdh,
            session,
        })?;

        tracing::debug!(policy, "SEV receive context started");
        self.started = true;
        Ok(())
    }
}

impl<F: MigrationFirmware> MemoryEncryptionOps for SevMigration<F> {
    fn save_setup(&mut self, params: &SetupParameters) -> Result<(), Error> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidState {
                expected: SessionState::Idle,
                actual: self.state,
            });
        }

        self.certs = Some(Certificates::decode(params)?);
        self.started = false;
        self.state = SessionState::SetupDone;
        Ok(())
    }

    fn save_outgoing_page(&mut self, stream: &mut dyn Write, page: &[u8]) -> Result<u64, Error> {
        match self.state {
            SessionState::SetupDone | SessionState::Transferring => {}
            actual => {
                return Err(Error::InvalidState {
                    expected: SessionState::Transferring,
                    actual,
                })
            }
        }

        if page.len() != PAGE_SIZE {
            return Err(Error::InvalidPageSize(page.len(), PAGE_SIZE));
        }

        if !self.started {
            self.start_send(stream)?;
        }

        let packet = self.firmware.send_update_data(page)?;
        put_blob(stream, &packet.hdr)?;
        put_blob(stream, &packet.trans)?;

        self.state = SessionState::Transferring;
        Ok(packet.trans.len() as u64)
    }

    fn load_incoming_page(&mut self, stream: &mut dyn Read, page: &mut [u8]) -> Result<(), Error> {
        if self.state != SessionState::Receiving {
            return Err(Error::InvalidState {
                expected: SessionState::Receiving,
                actual: self.state,
            });
        }

        if page.len() != PAGE_SIZE {
            return Err(Error::InvalidPageSize(page.len(), PAGE_SIZE));
        }

        if !self.started {
            self.start_receive(stream)?;
        }

        let hdr = get_blob(stream, MAX_HDR_LEN)?;
        let trans = get_blob(stream, PAGE_SIZE)?;
        if trans.len() != PAGE_SIZE {
            return Err(Error::InvalidPageSize(trans.len(), PAGE_SIZE));
        }

        self.firmware
            .receive_update_data(&Packet { hdr, trans }, page)
    }

    fn is_gfn_in_unshared_region(&self, gfn: Gfn) -> bool {
        !self.regions.is_shared(gfn)
    }

    fn save_outgoing_shared_regions_list(&mut self, stream: &mut dyn Write) -> Result<(), Error> {
        if self.state != SessionState::SetupDone {
            return Err(Error::InvalidState {
                expected: SessionState::SetupDone,
                actual: self.state,
            });
        }

        let list = self.regions.snapshot();
        list.encode(stream, ())?;

        tracing::debug!(regions = list.len(), "SEV shared regions sent");
        self.state = SessionState::Transferring;
        Ok(())
    }

    fn load_incoming_shared_regions_list(&mut self, stream: &mut dyn Read) -> Result<(), Error> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidState {
                expected: SessionState::Idle,
                actual: self.state,
            });
        }

        let list = SharedRegionList::decode(stream, ())?;
        tracing::debug!(regions = list.len(), "SEV shared regions received");

        self.regions.replace(list);
        self.started = false;
        self.state = SessionState::Receiving;
        Ok(())
    }

    fn cancel(&mut self) {
        if self.started {
            self.firmware.cancel();
        }

        self.certs = None;
        self.started = false;
        self.state = SessionState::Idle;
    }
}
