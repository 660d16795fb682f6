// SPDX-License-Identifier: Apache-2.0

//! Tracking of the guest memory the guest chose to share with the
//! hypervisor.
//!
//! A confidential guest converts pages between private and shared with
//! page-state-change requests. The resulting set is what
//! `is_gfn_in_unshared_region` consults on the source and what the
//! shared-region list rebuilds on the destination.

use super::Gfn;
use crate::parser::{Decoder, Encoder};

use serde::{Deserialize, Serialize};

use std::convert::TryFrom;
use std::io::{Error, ErrorKind, Read, Write};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Upper bound on the number of regions accepted from a stream.
pub const MAX_REGIONS: u32 = 1 << 20;

/// A half-open range `[start, end)` of shared guest frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRegion {
    /// First shared frame.
    pub start: Gfn,

    /// One past the last shared frame.
    pub end: Gfn,
}

impl SharedRegion {
    /// Number of frames in the region.
    pub fn pages(&self) -> u64 {
        self.end.0 - self.start.0
    }

    /// Whether `gfn` falls in the region.
    pub fn contains(&self, gfn: Gfn) -> bool {
        self.start <= gfn && gfn < self.end
    }
}

impl Encoder<()> for SharedRegion {
    fn encode(&self, writer: &mut (impl Write + ?Sized), _: ()) -> Result<(), Error> {
        self.start.encode(writer, ())?;
        self.end.encode(writer, ())
    }
}

impl Decoder<()> for SharedRegion {
    fn decode(reader: &mut (impl Read + ?Sized), _: ()) -> Result<Self, Error> {
        let start = Gfn::decode(reader, ())?;
        let end = Gfn::decode(reader, ())?;
        Ok(Self { start, end })
    }
}

/// Sorted, coalesced set of shared regions.
///
/// Regions never overlap and never touch; adding or removing a range
/// merges or splits neighbours to keep it that way.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRegionList {
    regions: Vec<SharedRegion>,
}

impl SharedRegionList {
    /// An empty list: all memory private.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `npages` frames starting at `start` shared.
    pub fn add(&mut self, start: Gfn, npages: u64) {
        let mut start = start;
        let mut end = start.offset(npages);

        // Zero pages, or a range clamped to nothing at the top of the gfn space.
        if end <= start {
            return;
        }

        let mut merged = Vec::with_capacity(self.regions.len() + 1);
        let mut placed = false;

        for region in std::mem::take(&mut self.regions) {
            if region.end < start {
                merged.push(region);
            } else if region.start > end {
                if !placed {
                    merged.push(SharedRegion { start, end });
                    placed = true;
                }
                merged.push(region);
            } else {
                start = start.min(region.start);
                end = end.max(region.end);
            }
        }

        if !placed {
            merged.push(SharedRegion { start, end });
        }

        self.regions = merged;
    }

    /// Mark `npages` frames starting at `start` private again.
    pub fn remove(&mut self, start: Gfn, npages: u64) {
        if npages == 0 {
            return;
        }

        let end = start.offset(npages);
        let mut kept = Vec::with_capacity(self.regions.len() + 1);

        for region in std::mem::take(&mut self.regions) {
            if region.end <= start || region.start >= end {
                kept.push(region);
                continue;
            }

            if region.start < start {
                kept.push(SharedRegion {
                    start: region.start,
                    end: start,
                });
            }

            if region.end > end {
                kept.push(SharedRegion {
                    start: end,
                    end: region.end,
                });
            }
        }

        self.regions = kept;
    }

    /// Whether `gfn` is shared.
    pub fn contains(&self, gfn: Gfn) -> bool {
        let idx = self.regions.partition_point(|r| r.end <= gfn);
        self.regions.get(idx).is_some_and(|r| r.start <= gfn)
    }

    /// The regions, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &SharedRegion> {
        self.regions.iter()
    }

    /// Number of disjoint regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether no memory is shared.
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total number of shared frames.
    pub fn pages(&self) -> u64 {
        self.regions.iter().map(SharedRegion::pages).sum()
    }
}

/// Wire layout: little-endian `u32` count followed by `(start, end)` pairs.
impl Encoder<()> for SharedRegionList {
    fn encode(&self, writer: &mut (impl Write + ?Sized), _: ()) -> Result<(), Error> {
        let count = u32::try_from(self.regions.len())
            .map_err(|_| Error::new(ErrorKind::InvalidInput, "too many shared regions"))?;
        count.encode(writer, ())?;

        for region in &self.regions {
            region.encode(writer, ())?;
        }

        Ok(())
    }
}

impl Decoder<()> for SharedRegionList {
    fn decode(reader: &mut (impl Read + ?Sized), _: ()) -> Result<Self, Error> {
        let count = u32::decode(reader, ())?;
        if count > MAX_REGIONS {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("shared region count {count} exceeds {MAX_REGIONS}"),
            ));
        }

        let mut regions: Vec<SharedRegion> = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let region = SharedRegion::decode(reader, ())?;
            if region.start >= region.end {
                return Err(Error::new(ErrorKind::InvalidData, "empty shared region"));
            }

            if let Some(last) = regions.last() {
                if region.start <= last.end {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "shared regions not sorted and disjoint",
                    ));
                }
            }

            regions.push(region);
        }

        Ok(Self { regions })
    }
}

/// Shared handle to a [`SharedRegionList`].
///
/// Page-state changes arrive on vCPU threads while the migration thread
/// classifies frames, so the list sits behind a reader-writer lock held
/// only for the duration of one lookup or update.
#[derive(Clone, Debug, Default)]
pub struct SharedRegions(Arc<RwLock<SharedRegionList>>);

impl SharedRegions {
    /// A handle to a new, empty list.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SharedRegionList> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SharedRegionList> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Convert `npages` frames at `start` to shared.
    pub fn share(&self, start: Gfn, npages: u64) {
        self.write().add(start, npages);
    }

    /// Convert `npages` frames at `start` back to private.
    pub fn unshare(&self, start: Gfn, npages: u64) {
        self.write().remove(start, npages);
    }

    /// Whether `gfn` is currently shared.
    pub fn is_shared(&self, gfn: Gfn) -> bool {
        self.read().contains(gfn)
    }

    /// A copy of the current list.
    pub fn snapshot(&self) -> SharedRegionList {
        self.read().clone()
    }

    /// Replace the whole list, as the destination does when the source's
    /// list arrives.
    pub fn replace(&self, list: SharedRegionList) {
        *self.write() = list;
    }
}
