// SPDX-License-Identifier: Apache-2.0

//! Confidential guest support: the per-VM object stating that a
//! confidentiality technology protects this guest.
//!
//! Different technologies are initialized in different, often arch or
//! machine specific, places of the VM construction path, and an invalid
//! configuration is usually only detectable by that code. That makes it
//! easy for a configuration to bypass initialization entirely. To never
//! silently run an unprotected guest under a confidentiality claim,
//! technology setup code calls [`ConfidentialGuestSupport::mark_ready`]
//! once the platform is prepared, and the VM start path calls
//! [`ConfidentialGuestSupport::assert_ready_or_abort`] as late as possible.
//! If the flag is still clear at that point the process is aborted.
//!
//! ## Example
//!
//! ```
//! use cgs::{ConfidentialGuestSupport, Technology};
//!
//! let mut cgs = ConfidentialGuestSupport::new(Technology::Sev);
//! assert!(!cgs.is_ready());
//!
//! // ... technology specific platform setup ...
//! cgs.mark_ready();
//!
//! cgs.assert_ready_or_abort();
//! ```

mod technology;

pub use technology::{ConfidentialGuestSupportClass, Technology, CLASSES};

use crate::error::Error;
use crate::migration::MemoryEncryptionOps;

use std::fmt::{self, Debug};

/// Confidential guest support for a single VM.
///
/// Created with `ready` clear, flipped exactly once by the technology
/// setup code, never cleared while the VM exists.
pub struct ConfidentialGuestSupport {
    technology: Technology,
    ready: bool,
    ops: Option<Box<dyn MemoryEncryptionOps>>,
}

impl ConfidentialGuestSupport {
    /// Create the confidential guest support object for a VM requesting
    /// `technology`. It starts out not ready.
    pub fn new(technology: Technology) -> Self {
        Self {
            technology,
            ready: false,
            ops: None,
        }
    }

    /// Attach the memory encryption operation set the migration code will
    /// drive. Fails if the technology's class cannot migrate encrypted
    /// memory.
    pub fn with_memory_encryption_ops(
        mut self,
        ops: Box<dyn MemoryEncryptionOps>,
    ) -> Result<Self, Error> {
        self.attach_memory_encryption_ops(ops)?;
        Ok(self)
    }

    /// In-place variant of [`with_memory_encryption_ops`](Self::with_memory_encryption_ops).
    pub fn attach_memory_encryption_ops(
        &mut self,
        ops: Box<dyn MemoryEncryptionOps>,
    ) -> Result<(), Error> {
        if !self.technology.is_migratable() {
            return Err(Error::Unsupported(self.technology));
        }

        self.ops = Some(ops);
        Ok(())
    }

    /// The technology this VM requested.
    pub fn technology(&self) -> Technology {
        self.technology
    }

    /// The class descriptor of the requested technology.
    pub fn class(&self) -> &'static ConfidentialGuestSupportClass {
        self.technology.class()
    }

    /// Record that technology-specific setup completed.
    ///
    /// The caller vouches that the platform is prepared to run the guest
    /// protected; nothing here can verify it. Repeated calls are harmless.
    pub fn mark_ready(&mut self) {
        if !self.ready {
            tracing::info!(technology = %self.technology, "confidential guest support ready");
        }

        self.ready = true;
    }

    /// Whether [`mark_ready`](Self::mark_ready) has been called.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether a memory encryption operation set is attached.
    pub fn has_memory_encryption_ops(&self) -> bool {
        self.ops.is_some()
    }

    /// Look up the memory encryption operation set for migration.
    ///
    /// Returns `Ok(None)` when the technology migrates through the generic
    /// memory path, and [`Error::NotReady`] before setup has completed.
    pub fn memory_encryption_ops(
        &mut self,
    ) -> Result<Option<&mut (dyn MemoryEncryptionOps + 'static)>, Error> {
        if !self.ready {
            return Err(Error::NotReady);
        }

        Ok(self.ops.as_deref_mut())
    }

    /// Verify setup completed, immediately before guest execution starts.
    ///
    /// This is a fail-stop check. If the flag is clear, the process is
    /// terminated through [`fail_stop`]; no error is returned.
    pub fn assert_ready_or_abort(&self) {
        if !self.ready {
            fail_stop(format_args!(
                "confidential guest support ({}) was requested but never initialized",
                self.technology
            ));
        }
    }
}

impl Debug for ConfidentialGuestSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfidentialGuestSupport")
            .field("technology", &self.technology)
            .field("ready", &self.ready)
            .field("memory_encryption_ops", &self.ops.is_some())
            .finish()
    }
}

/// Terminate the process with a fatal diagnostic.
///
/// Used where continuing would run a guest without the protection it was
/// configured with. Never unwinds and never returns.
pub fn fail_stop(reason: fmt::Arguments<'_>) -> ! {
    tracing::error!("fatal: {}", reason);
    eprintln!("cgs: fatal: {reason}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    #[test]
    fn created_not_ready() {
        let cgs = ConfidentialGuestSupport::new(Technology::SevSnp);
        assert!(!cgs.is_ready());
        assert_eq!(cgs.technology(), Technology::SevSnp);
        assert_eq!(cgs.class().type_name, "sev-snp-guest");
    }

    #[test]
    fn mark_ready_is_idempotent() {
        let mut cgs = ConfidentialGuestSupport::new(Technology::Sev);
        cgs.mark_ready();
        cgs.mark_ready();
        assert!(cgs.is_ready());
        cgs.assert_ready_or_abort();
    }

    #[test]
    fn ops_hidden_until_ready() {
        let mut cgs = ConfidentialGuestSupport::new(Technology::Sev)
            .with_memory_encryption_ops(Box::new(MockBackend::new()))
            .unwrap();
        assert!(cgs.has_memory_encryption_ops());
        assert!(matches!(cgs.memory_encryption_ops(), Err(Error::NotReady)));

        cgs.mark_ready();
        assert!(matches!(cgs.memory_encryption_ops(), Ok(Some(_))));
    }

    #[test]
    fn no_ops_means_generic_path() {
        let mut cgs = ConfidentialGuestSupport::new(Technology::Tdx);
        cgs.mark_ready();
        assert!(matches!(cgs.memory_encryption_ops(), Ok(None)));
    }

    #[test]
    fn non_migratable_rejects_ops() {
        let err = ConfidentialGuestSupport::new(Technology::Pef)
            .with_memory_encryption_ops(Box::new(MockBackend::new()))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(Technology::Pef)));
    }

    #[test]
    fn debug_hides_backend() {
        let cgs = ConfidentialGuestSupport::new(Technology::S390Pv);
        assert_eq!(
            format!("{cgs:?}"),
            "ConfidentialGuestSupport { technology: S390Pv, ready: false, memory_encryption_ops: false }"
        );
    }
}
