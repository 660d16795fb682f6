// SPDX-License-Identifier: Apache-2.0

//! Implementations of [`MemoryEncryptionOps`](crate::migration::MemoryEncryptionOps).

pub mod mock;

#[cfg(feature = "sev")]
pub mod sev;
