// SPDX-License-Identifier: Apache-2.0

//! The `cgs` crate provides the technology-agnostic contract between a
//! hypervisor and the confidential computing mechanisms that protect a
//! guest's memory and state from it (AMD SEV and SEV-SNP, Intel TDX,
//! POWER PEF, s390x protected virtualization).
//!
//! ## Confidential Guest Support
//!
//! A VM that requests a confidentiality technology owns exactly one
//! [`ConfidentialGuestSupport`](crate::support::ConfidentialGuestSupport)
//! object. Technology-specific initialization marks it ready once the
//! platform has been set up, and the VM start path verifies readiness
//! immediately before the first guest instruction runs. A guest that asked
//! for protection but never received it is never started: the process
//! aborts instead.
//!
//! Refer to the [support](crate::support) and [machine](crate::machine)
//! modules for more information.
//!
//! ## Encrypted Guest Migration
//!
//! Technologies that can live-migrate encrypted memory attach an
//! implementation of
//! [`MemoryEncryptionOps`](crate::migration::MemoryEncryptionOps) to their
//! guard. The migration code drives it through the source and destination
//! sessions of the [migration](crate::migration) module, which make it
//! impossible (at compile time) to send a page before the platform session
//! is set up or to load a page before the shared-region list arrived.
//!
//! ## Backends
//!
//! The [backend](crate::backend) module ships a fully software
//! [mock](crate::backend::mock) implementation for testing migration
//! drivers and, behind the `sev` feature, the glue that maps the operation
//! set onto the AMD SEV `SEND_*`/`RECEIVE_*` firmware commands.
//!
//! ## Logging
//!
//! The crate reports through [`tracing`]. No subscriber is installed; the
//! embedding VMM decides where the events go.

#![deny(clippy::all)]
#![deny(missing_docs)]
#![allow(unknown_lints)]
#![allow(clippy::identity_op)]
#![allow(clippy::unreadable_literal)]

pub mod backend;
pub mod machine;
pub mod migration;
pub mod support;

/// Error module.
pub mod error;

/// Module for Encoding and Decoding types.
pub mod parser;

pub use error::{ConfigError, Error};
pub use machine::{MachineConfig, MachineState};
pub use migration::{Gfn, MemoryEncryptionOps, SetupParameters};
pub use support::{ConfidentialGuestSupport, Technology};
