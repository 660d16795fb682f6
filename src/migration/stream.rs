// SPDX-License-Identifier: Apache-2.0

//! Framing on the migration stream.
//!
//! The stream is any ordered, fail-stop byte channel: `std::io::Write` on
//! the source and `std::io::Read` on the destination. Reading past the
//! last record surfaces as `UnexpectedEof`, never as zero-filled data.
//! Page headers and blob lengths are big-endian. Records encoded through
//! [`crate::parser`], such as the shared-region list, are little-endian.

use super::Gfn;
use crate::error::Error;
use crate::parser::{Decoder, Encoder};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::convert::TryFrom;
use std::io::{self, ErrorKind, Read, Write};

bitflags! {
    /// Tag carried by every page record.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// The payload went through the backend's encrypted page path.
        const ENCRYPTED = 1 << 0;

        /// The payload is a plaintext shared page.
        const SHARED    = 1 << 1;

        /// End of the page section; no payload follows.
        const EOS       = 1 << 2;
    }
}

/// Header preceding each page record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageHeader {
    /// Frame the payload belongs to.
    pub gfn: Gfn,

    /// Payload kind.
    pub flags: PageFlags,
}

impl PageHeader {
    /// Header for a page sent through the encrypted path.
    pub fn encrypted(gfn: Gfn) -> Self {
        Self {
            gfn,
            flags: PageFlags::ENCRYPTED,
        }
    }

    /// Header for a plaintext shared page.
    pub fn shared(gfn: Gfn) -> Self {
        Self {
            gfn,
            flags: PageFlags::SHARED,
        }
    }

    /// The end-of-section marker.
    pub fn eos() -> Self {
        Self {
            gfn: Gfn(0),
            flags: PageFlags::EOS,
        }
    }

    /// Whether this is the end-of-section marker.
    pub fn is_eos(&self) -> bool {
        self.flags == PageFlags::EOS
    }
}

impl Encoder<()> for PageHeader {
    fn encode(&self, writer: &mut (impl Write + ?Sized), _: ()) -> io::Result<()> {
        writer.write_u64::<BigEndian>(self.gfn.0)?;
        writer.write_u32::<BigEndian>(self.flags.bits())
    }
}

impl Decoder<()> for PageHeader {
    fn decode(reader: &mut (impl Read + ?Sized), _: ()) -> io::Result<Self> {
        let gfn = Gfn(reader.read_u64::<BigEndian>()?);
        let bits = reader.read_u32::<BigEndian>()?;

        let flags = PageFlags::from_bits(bits).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidData, format!("unknown page flags {bits:#x}"))
        })?;

        // Exactly one kind per record.
        if flags.bits().count_ones() != 1 {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("ambiguous page flags {bits:#x}"),
            ));
        }

        Ok(Self { gfn, flags })
    }
}

/// Write `bytes` prefixed with its big-endian `u32` length.
pub fn put_blob(stream: &mut dyn Write, bytes: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::InvalidRecord(format!("blob of {} bytes too large", bytes.len())))?;
    stream.write_u32::<BigEndian>(len)?;
    stream.write_all(bytes)?;
    Ok(())
}

/// Read a blob written by [`put_blob`], refusing lengths above `max`.
pub fn get_blob(stream: &mut dyn Read, max: usize) -> Result<Vec<u8>, Error> {
    let len = stream.read_u32::<BigEndian>()? as usize;
    if len > max {
        return Err(Error::InvalidRecord(format!(
            "blob of {len} bytes exceeds limit of {max}"
        )));
    }

    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes)?;
    Ok(bytes)
}
