// SPDX-License-Identifier: Apache-2.0

//! Live migration of encrypted guest memory.
//!
//! A confidentiality technology opts in to migration by implementing
//! [`MemoryEncryptionOps`] and attaching it to the VM's
//! [`ConfidentialGuestSupport`](crate::support::ConfidentialGuestSupport).
//! The operations are only reachable once the support object is ready and
//! are driven in this order:
//!
//! | Side | Sequence |
//! |---|---|
//! | source | `save_setup`, `save_outgoing_shared_regions_list`, `save_outgoing_page`* |
//! | destination | `load_incoming_shared_regions_list`, `load_incoming_page`* |
//!
//! The shared-region list travels once, ahead of every page, so the
//! destination can classify each incoming page without a live oracle.
//! [`session::Sender`] and [`session::Receiver`] enforce that order at
//! compile time; [`driver`] is a reference driver built on them.
//!
//! The byte layout of page and region records belongs to the backend. A
//! stream written by one backend is only readable by the same backend on
//! the destination.

pub mod driver;
pub mod regions;
pub mod session;
pub mod stream;

use crate::error::Error;
use crate::parser::{Decoder, Encoder};

use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

use std::fmt::Display;
use std::io::{Read, Write};

/// log2 of the guest page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size in bytes of a guest page moved by one page operation.
pub const PAGE_SIZE: usize = 4096;

const_assert_eq!(PAGE_SIZE, 1 << PAGE_SHIFT);

/// A guest frame number: guest physical address >> [`PAGE_SHIFT`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Gfn(pub u64);

impl Gfn {
    /// The frame containing guest physical address `gpa`.
    pub fn from_gpa(gpa: u64) -> Self {
        Self(gpa >> PAGE_SHIFT)
    }

    /// Guest physical address of the first byte of this frame.
    pub fn gpa(&self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// The frame `pages` frames after this one.
    pub fn offset(&self, pages: u64) -> Self {
        Self(self.0.saturating_add(pages))
    }
}

impl Display for Gfn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Gfn {
    fn from(gfn: u64) -> Self {
        Self(gfn)
    }
}

impl Encoder<()> for Gfn {
    fn encode(&self, writer: &mut (impl Write + ?Sized), params: ()) -> Result<(), std::io::Error> {
        self.0.encode(writer, params)
    }
}

impl Decoder<()> for Gfn {
    fn decode(reader: &mut (impl Read + ?Sized), params: ()) -> Result<Self, std::io::Error> {
        Ok(Self(u64::decode(reader, params)?))
    }
}

/// Platform and vendor certificate material authenticating a migration
/// session to the destination's confidentiality hardware.
///
/// For AMD SEV these are the destination's PDH, the platform certificate
/// chain and the AMD certificate chain, each base64 encoded.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupParameters {
    /// Platform Diffie-Hellman certificate of the destination.
    pub pdh: String,

    /// Platform certificate chain.
    pub plat_cert: String,

    /// Vendor certificate chain.
    pub amd_cert: String,
}

impl SetupParameters {
    /// Bundle the three certificates.
    pub fn new(
        pdh: impl Into<String>,
        plat_cert: impl Into<String>,
        amd_cert: impl Into<String>,
    ) -> Self {
        Self {
            pdh: pdh.into(),
            plat_cert: plat_cert.into(),
            amd_cert: amd_cert.into(),
        }
    }
}

impl std::fmt::Debug for SetupParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupParameters")
            .field("pdh", &format_args!("<{} bytes>", self.pdh.len()))
            .field("plat_cert", &format_args!("<{} bytes>", self.plat_cert.len()))
            .field("amd_cert", &format_args!("<{} bytes>", self.amd_cert.len()))
            .finish()
    }
}

/// The operations a confidentiality technology provides to migrate its
/// guest's encrypted memory.
///
/// Only the migration code calls these, only after the owning support
/// object is ready, and never for two concurrent sessions of the same VM.
/// Every fallible operation aborts the session on error.
pub trait MemoryEncryptionOps: Send {
    /// Source side, once, before any page: initialize the platform
    /// migration context from the certificate material.
    fn save_setup(&mut self, params: &SetupParameters) -> Result<(), Error>;

    /// Source side, once per private page: write the page (re-wrapped for
    /// transport) and its metadata to `stream`.
    ///
    /// Returns the number of wrapped page bytes written, excluding framing
    /// and metadata.
    fn save_outgoing_page(&mut self, stream: &mut dyn Write, page: &[u8]) -> Result<u64, Error>;

    /// Destination side, once per private page: read one record written by
    /// [`save_outgoing_page`](Self::save_outgoing_page) and install its
    /// content in `page`, which is exactly one guest page long.
    fn load_incoming_page(&mut self, stream: &mut dyn Read, page: &mut [u8]) -> Result<(), Error>;

    /// Whether `gfn` is private (encrypted) memory.
    ///
    /// Private frames take the encrypted page path; shared frames may be
    /// migrated as plaintext. Total over every gfn, safe to call while the
    /// guest runs, and never blocks for long.
    fn is_gfn_in_unshared_region(&self, gfn: Gfn) -> bool;

    /// Source side, once: write the shared-region descriptors.
    fn save_outgoing_shared_regions_list(&mut self, stream: &mut dyn Write) -> Result<(), Error>;

    /// Destination side, once, before any page: rebuild the shared-region
    /// set from the stream.
    fn load_incoming_shared_regions_list(&mut self, stream: &mut dyn Read) -> Result<(), Error>;

    /// Discard all partial session state and return to idle. Guest memory
    /// is never touched.
    fn cancel(&mut self) {}
}
