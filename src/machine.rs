// SPDX-License-Identifier: Apache-2.0

//! The VM's top-level configuration object, owner of its confidential
//! guest support.

use crate::support::{ConfidentialGuestSupport, Technology};

use serde::{Deserialize, Serialize};

/// Machine configuration relevant to confidential guests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// The confidentiality technology requested for this VM, if any.
    #[serde(default)]
    pub confidential_guest_support: Option<Technology>,
}

impl MachineConfig {
    /// Configuration requesting `technology`.
    pub fn confidential(technology: Technology) -> Self {
        Self {
            confidential_guest_support: Some(technology),
        }
    }
}

/// A VM under construction or running.
///
/// The confidential guest support object exists if and only if the
/// configuration requested a technology, and is dropped with the machine.
#[derive(Debug)]
pub struct MachineState {
    config: MachineConfig,
    cgs: Option<ConfidentialGuestSupport>,
}

impl MachineState {
    /// Construct the machine, creating its confidential guest support
    /// object when one was requested.
    pub fn new(config: MachineConfig) -> Self {
        let cgs = config
            .confidential_guest_support
            .map(ConfidentialGuestSupport::new);

        Self { config, cgs }
    }

    /// The configuration the machine was built from.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// The confidential guest support object, if requested.
    pub fn cgs(&self) -> Option<&ConfidentialGuestSupport> {
        self.cgs.as_ref()
    }

    /// Mutable access for technology setup and the migration code.
    pub fn cgs_mut(&mut self) -> Option<&mut ConfidentialGuestSupport> {
        self.cgs.as_mut()
    }

    /// Whether the guest asked to be protected.
    pub fn is_confidential(&self) -> bool {
        self.cgs.is_some()
    }

    /// Last check before the first guest instruction executes.
    ///
    /// A no-op for ordinary guests. For confidential guests whose setup
    /// never marked the support object ready, the process is aborted.
    pub fn assert_cgs_ready_or_abort(&self) {
        if let Some(cgs) = &self.cgs {
            cgs.assert_ready_or_abort();
        }
    }
}
