// SPDX-License-Identifier: Apache-2.0

//! A reference migration driver for guest RAM.
//!
//! The source walks guest memory page by page. Private pages go through the
//! technology's encrypted page path, shared pages are copied as plaintext,
//! and every record is tagged so the destination can check it against the
//! classification it rebuilt from the shared-region list. Guests without a
//! memory encryption operation set use the plaintext path for everything.
//!
//! Stream layout (encrypted guests):
//!
//! ```text
//! shared-region list | { PageHeader, payload }* | PageHeader(EOS)
//! ```

use super::session::{Receiver, Receiving, Sender, SessionState, Transferring};
use super::stream::{PageFlags, PageHeader};
use super::{Gfn, SetupParameters, PAGE_SIZE};
use crate::error::Error;
use crate::parser::{Decoder, Encoder};
use crate::support::ConfidentialGuestSupport;

use std::convert::TryFrom;
use std::io::{Read, Write};

/// What a completed migration moved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Pages moved through the encrypted path.
    pub encrypted_pages: u64,

    /// Pages moved as plaintext.
    pub shared_pages: u64,

    /// Payload bytes written, wrapped and plaintext.
    pub bytes_sent: u64,
}

fn check_layout(memory: &[u8]) -> Result<(), Error> {
    if memory.len() % PAGE_SIZE != 0 {
        return Err(Error::InvalidPageSize(memory.len() % PAGE_SIZE, PAGE_SIZE));
    }

    Ok(())
}

/// Frames of guest memory installed so far on the destination.
struct Arrivals(Vec<bool>);

impl Arrivals {
    fn new(memory: &[u8]) -> Self {
        Self(vec![false; memory.len() / PAGE_SIZE])
    }

    fn mark(&mut self, gfn: Gfn) -> Result<(), Error> {
        let seen = usize::try_from(gfn.0)
            .ok()
            .and_then(|n| self.0.get_mut(n))
            .ok_or_else(|| Error::InvalidRecord(format!("gfn {gfn} outside guest memory")))?;

        if *seen {
            return Err(Error::InvalidRecord(format!("duplicate page for gfn {gfn}")));
        }

        *seen = true;
        Ok(())
    }

    /// Every frame must arrive exactly once before the guest may resume.
    fn complete(&self) -> Result<(), Error> {
        match self.0.iter().position(|seen| !seen) {
            Some(missing) => Err(Error::InvalidRecord(format!(
                "stream ended without gfn {}",
                Gfn(missing as u64)
            ))),
            None => Ok(()),
        }
    }
}

/// Send guest RAM `memory` (starting at gfn 0) over `stream`.
///
/// Fails with [`Error::NotReady`] before the guest's confidential guest
/// support is ready. Any failure aborts the whole migration; nothing is
/// reported as a partial success.
pub fn save_guest_memory(
    cgs: &mut ConfidentialGuestSupport,
    params: &SetupParameters,
    memory: &[u8],
    stream: &mut dyn Write,
) -> Result<MigrationSummary, Error> {
    check_layout(memory)?;

    if cgs.memory_encryption_ops()?.is_none() {
        return save_plain(memory, stream);
    }

    let mut sender = Sender::new(cgs)?
        .setup(params)?
        .send_shared_regions(stream)?;

    match send_pages(&mut sender, memory, stream) {
        Ok(summary) => {
            sender.finish()?;
            Ok(summary)
        }
        Err(e) => {
            // A failed page already aborted the backend.
            if sender.state() != SessionState::Aborted {
                sender.cancel();
            }
            Err(e)
        }
    }
}

fn send_pages(
    sender: &mut Sender<'_, Transferring>,
    memory: &[u8],
    stream: &mut dyn Write,
) -> Result<MigrationSummary, Error> {
    let mut summary = MigrationSummary::default();

    for (gfn, page) in memory.chunks_exact(PAGE_SIZE).enumerate() {
        let gfn = Gfn(gfn as u64);

        if sender.is_private(gfn) {
            PageHeader::encrypted(gfn).encode(stream, ())?;
            summary.bytes_sent += sender.send_page(stream, page)?;
            summary.encrypted_pages += 1;
        } else {
            PageHeader::shared(gfn).encode(stream, ())?;
            stream.write_all(page)?;
            summary.bytes_sent += page.len() as u64;
            summary.shared_pages += 1;
        }

        tracing::trace!(session = %sender.id(), %gfn, "page sent");
    }

    PageHeader::eos().encode(stream, ())?;
    Ok(summary)
}

fn save_plain(memory: &[u8], stream: &mut dyn Write) -> Result<MigrationSummary, Error> {
    let mut summary = MigrationSummary::default();

    for (gfn, page) in memory.chunks_exact(PAGE_SIZE).enumerate() {
        PageHeader::shared(Gfn(gfn as u64)).encode(stream, ())?;
        stream.write_all(page)?;
        summary.bytes_sent += page.len() as u64;
        summary.shared_pages += 1;
    }

    PageHeader::eos().encode(stream, ())?;
    Ok(summary)
}

/// Receive guest RAM into `memory` from `stream`.
///
/// Succeeds only if every frame of `memory` arrived exactly once. On error the contents of `memory` are unspecified and the guest must
/// not be resumed.
pub fn load_guest_memory(
    cgs: &mut ConfidentialGuestSupport,
    memory: &mut [u8],
    stream: &mut dyn Read,
) -> Result<MigrationSummary, Error> {
    check_layout(memory)?;

    if cgs.memory_encryption_ops()?.is_none() {
        return load_plain(memory, stream);
    }

    let mut receiver = Receiver::new(cgs)?.receive_shared_regions(stream)?;

    match receive_pages(&mut receiver, memory, stream) {
        Ok(summary) => {
            receiver.finish()?;
            Ok(summary)
        }
        Err(e) => {
            if receiver.state() != SessionState::Aborted {
                receiver.cancel();
            }
            Err(e)
        }
    }
}

fn receive_pages(
    receiver: &mut Receiver<'_, Receiving>,
    memory: &mut [u8],
    stream: &mut dyn Read,
) -> Result<MigrationSummary, Error> {
    let mut summary = MigrationSummary::default();
    let mut arrivals = Arrivals::new(memory);

    loop {
        let header = PageHeader::decode(stream, ())?;
        if header.is_eos() {
            arrivals.complete()?;
            return Ok(summary);
        }

        let page = page_mut(memory, header.gfn)?;
        let encrypted = header.flags == PageFlags::ENCRYPTED;

        // The record's tag must agree with the received shared-region list.
        if encrypted != receiver.is_private(header.gfn) {
            return Err(Error::ClassificationMismatch(header.gfn));
        }

        arrivals.mark(header.gfn)?;

        if encrypted {
            receiver.receive_page(stream, page)?;
            summary.encrypted_pages += 1;
        } else {
            stream.read_exact(page)?;
            summary.shared_pages += 1;
        }

        summary.bytes_sent += PAGE_SIZE as u64;
    }
}

fn load_plain(memory: &mut [u8], stream: &mut dyn Read) -> Result<MigrationSummary, Error> {
    let mut summary = MigrationSummary::default();
    let mut arrivals = Arrivals::new(memory);

    loop {
        let header = PageHeader::decode(stream, ())?;
        if header.is_eos() {
            break;
        }

        if header.flags != PageFlags::SHARED {
            return Err(Error::InvalidRecord(format!(
                "encrypted page {} for a guest without memory encryption",
                header.gfn
            )));
        }

        let page = page_mut(memory, header.gfn)?;
        arrivals.mark(header.gfn)?;
        stream.read_exact(page)?;
        summary.shared_pages += 1;
        summary.bytes_sent += PAGE_SIZE as u64;
    }

    arrivals.complete()?;
    Ok(summary)
}

fn page_mut(memory: &mut [u8], gfn: Gfn) -> Result<&mut [u8], Error> {
    let out_of_range = || Error::InvalidRecord(format!("gfn {gfn} outside guest memory"));

    let start = usize::try_from(gfn.0)
        .ok()
        .and_then(|n| n.checked_mul(PAGE_SIZE))
        .ok_or_else(out_of_range)?;
    let end = start.checked_add(PAGE_SIZE).ok_or_else(out_of_range)?;

    memory.get_mut(start..end).ok_or_else(out_of_range)
}
