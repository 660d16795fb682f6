// SPDX-License-Identifier: Apache-2.0

//! The confidentiality technologies a guest can request and the static
//! class descriptor registered for each of them.

use crate::error::ConfigError;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::Display;
use std::str::FromStr;

/// A hardware or platform mechanism isolating guest memory and state from
/// the hypervisor.
///
/// The variant selects which class descriptor, and therefore which
/// migration capabilities, apply to a VM's confidential guest support.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Technology {
    /// AMD Secure Encrypted Virtualization (SEV and SEV-ES).
    Sev,

    /// AMD SEV Secure Nested Paging.
    SevSnp,

    /// Intel Trust Domain Extensions.
    Tdx,

    /// POWER Protected Execution Facility.
    Pef,

    /// s390x Protected Virtualization.
    S390Pv,
}

/// Static, per-technology description of confidential guest support.
#[derive(Debug, PartialEq, Eq)]
pub struct ConfidentialGuestSupportClass {
    /// The technology this class describes.
    pub technology: Technology,

    /// Object type name used on the command line and in configuration.
    pub type_name: &'static str,

    /// Human readable description.
    pub description: &'static str,

    /// Whether the technology can carry a memory encryption operation set,
    /// i.e. whether its guests' encrypted memory can be live-migrated.
    pub migratable: bool,
}

static SEV: ConfidentialGuestSupportClass = ConfidentialGuestSupportClass {
    technology: Technology::Sev,
    type_name: "sev-guest",
    description: "AMD SEV/SEV-ES encrypted guest",
    migratable: true,
};

static SEV_SNP: ConfidentialGuestSupportClass = ConfidentialGuestSupportClass {
    technology: Technology::SevSnp,
    type_name: "sev-snp-guest",
    description: "AMD SEV-SNP guest",
    migratable: true,
};

static TDX: ConfidentialGuestSupportClass = ConfidentialGuestSupportClass {
    technology: Technology::Tdx,
    type_name: "tdx-guest",
    description: "Intel TDX trust domain",
    migratable: false,
};

static PEF: ConfidentialGuestSupportClass = ConfidentialGuestSupportClass {
    technology: Technology::Pef,
    type_name: "pef-guest",
    description: "POWER PEF secure guest",
    migratable: false,
};

static S390_PV: ConfidentialGuestSupportClass = ConfidentialGuestSupportClass {
    technology: Technology::S390Pv,
    type_name: "s390-pv-guest",
    description: "s390x protected virtualization guest",
    migratable: false,
};

/// Every registered class, in declaration order.
pub static CLASSES: [&ConfidentialGuestSupportClass; 5] = [&SEV, &SEV_SNP, &TDX, &PEF, &S390_PV];

lazy_static! {
    static ref BY_NAME: HashMap<&'static str, Technology> = {
        let mut names = HashMap::new();
        for class in CLASSES.iter() {
            names.insert(class.type_name, class.technology);
        }

        // Short aliases.
        names.insert("sev", Technology::Sev);
        names.insert("snp", Technology::SevSnp);
        names.insert("sev-snp", Technology::SevSnp);
        names.insert("tdx", Technology::Tdx);
        names.insert("pef", Technology::Pef);
        names.insert("s390-pv", Technology::S390Pv);
        names
    };
}

impl Technology {
    /// The class descriptor registered for this technology.
    pub fn class(&self) -> &'static ConfidentialGuestSupportClass {
        match self {
            Self::Sev => &SEV,
            Self::SevSnp => &SEV_SNP,
            Self::Tdx => &TDX,
            Self::Pef => &PEF,
            Self::S390Pv => &S390_PV,
        }
    }

    /// The object type name of this technology.
    pub fn type_name(&self) -> &'static str {
        self.class().type_name
    }

    /// Whether guests of this technology can be live-migrated with their
    /// memory encrypted.
    pub fn is_migratable(&self) -> bool {
        self.class().migratable
    }
}

impl Display for Technology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl FromStr for Technology {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        BY_NAME
            .get(&name.trim().to_lowercase()[..])
            .copied()
            .ok_or_else(|| ConfigError::UnknownTechnology(name.to_string()))
    }
}

impl TryFrom<String> for Technology {
    type Error = ConfigError;

    fn try_from(val: String) -> Result<Self, Self::Error> {
        val.parse()
    }
}

impl From<Technology> for String {
    fn from(technology: Technology) -> String {
        technology.type_name().to_string()
    }
}
