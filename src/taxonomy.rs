//! Compliance taxonomy: the fixed catalog of framework controls
//!
//! Every evidence record references exactly one `ComplianceControl`. The
//! standard catalog covers SOC2, HIPAA, GDPR and FedRAMP. A `Taxonomy` is
//! built once and is read-only afterwards; it validates controls before their
//! evidence is queued.

use crate::error::{TelemetryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Supported compliance frameworks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Soc2,
    Hipaa,
    Gdpr,
    FedRamp,
}

impl Framework {
    /// All frameworks, in catalog order
    pub const ALL: [Framework; 4] = [
        Framework::Soc2,
        Framework::Hipaa,
        Framework::Gdpr,
        Framework::FedRamp,
    ];

    /// Wire name used in attributes and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Soc2 => "soc2",
            Framework::Hipaa => "hipaa",
            Framework::Gdpr => "gdpr",
            Framework::FedRamp => "fedramp",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "soc2" => Ok(Framework::Soc2),
            "hipaa" => Ok(Framework::Hipaa),
            "gdpr" => Ok(Framework::Gdpr),
            "fedramp" => Ok(Framework::FedRamp),
            other => Err(TelemetryError::Config(format!(
                "Unknown compliance framework: {}",
                other
            ))),
        }
    }
}

/// A single control within a compliance framework
///
/// Controls are plain values: copy them freely and compare by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ComplianceControl {
    framework: Framework,
    control_id: &'static str,
    notes: &'static str,
}

impl ComplianceControl {
    /// Define a control. Register custom controls through
    /// [`Taxonomy::with_controls`] so they pass validation.
    pub const fn new(framework: Framework, control_id: &'static str, notes: &'static str) -> Self {
        Self {
            framework,
            control_id,
            notes,
        }
    }

    pub fn framework(&self) -> Framework {
        self.framework
    }

    pub fn control_id(&self) -> &'static str {
        self.control_id
    }

    pub fn notes(&self) -> &'static str {
        self.notes
    }
}

impl fmt::Display for ComplianceControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.framework, self.control_id)
    }
}

// SOC2 Trust Service Criteria
pub const SOC2_CC6_1: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC6.1", "Logical Access Controls");
pub const SOC2_CC6_2: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC6.2", "Access Provisioning");
pub const SOC2_CC6_3: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC6.3", "Data Isolation");
pub const SOC2_CC6_6: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC6.6", "Encryption at Rest");
pub const SOC2_CC6_7: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC6.7", "Encryption in Transit");
pub const SOC2_CC7_1: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC7.1", "System Monitoring");
pub const SOC2_CC7_2: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC7.2", "System Performance");
pub const SOC2_CC8_1: ComplianceControl =
    ComplianceControl::new(Framework::Soc2, "CC8.1", "Change Management");

// HIPAA Technical Safeguards
pub const HIPAA_164_312_A: ComplianceControl =
    ComplianceControl::new(Framework::Hipaa, "164.312(a)", "Access Control");
pub const HIPAA_164_312_B: ComplianceControl =
    ComplianceControl::new(Framework::Hipaa, "164.312(b)", "Audit Controls");
pub const HIPAA_164_312_A_2_I: ComplianceControl =
    ComplianceControl::new(Framework::Hipaa, "164.312(a)(2)(i)", "Unique User Identification");
pub const HIPAA_164_312_A_2_IV: ComplianceControl =
    ComplianceControl::new(Framework::Hipaa, "164.312(a)(2)(iv)", "Encryption/Decryption");
pub const HIPAA_164_312_E_2_II: ComplianceControl =
    ComplianceControl::new(Framework::Hipaa, "164.312(e)(2)(ii)", "Transmission Security");

// GDPR Articles
pub const GDPR_ART_15: ComplianceControl =
    ComplianceControl::new(Framework::Gdpr, "Art. 15", "Right of Access");
pub const GDPR_ART_17: ComplianceControl =
    ComplianceControl::new(Framework::Gdpr, "Art. 17", "Right to Erasure");
pub const GDPR_ART_7: ComplianceControl =
    ComplianceControl::new(Framework::Gdpr, "Art. 7", "Consent");
pub const GDPR_ART_32: ComplianceControl =
    ComplianceControl::new(Framework::Gdpr, "Art. 32", "Security of Processing");

// FedRAMP Controls
pub const FEDRAMP_AC_2: ComplianceControl =
    ComplianceControl::new(Framework::FedRamp, "AC-2", "Account Management");
pub const FEDRAMP_AC_3: ComplianceControl =
    ComplianceControl::new(Framework::FedRamp, "AC-3", "Access Enforcement");
pub const FEDRAMP_AU_2: ComplianceControl =
    ComplianceControl::new(Framework::FedRamp, "AU-2", "Audit Events");
pub const FEDRAMP_AU_3: ComplianceControl =
    ComplianceControl::new(Framework::FedRamp, "AU-3", "Audit Record Content");
pub const FEDRAMP_CM_2: ComplianceControl =
    ComplianceControl::new(Framework::FedRamp, "CM-2", "Baseline Configuration");

/// The standard control catalog
pub const STANDARD_CONTROLS: [ComplianceControl; 22] = [
    SOC2_CC6_1,
    SOC2_CC6_2,
    SOC2_CC6_3,
    SOC2_CC6_6,
    SOC2_CC6_7,
    SOC2_CC7_1,
    SOC2_CC7_2,
    SOC2_CC8_1,
    HIPAA_164_312_A,
    HIPAA_164_312_B,
    HIPAA_164_312_A_2_I,
    HIPAA_164_312_A_2_IV,
    HIPAA_164_312_E_2_II,
    GDPR_ART_15,
    GDPR_ART_17,
    GDPR_ART_7,
    GDPR_ART_32,
    FEDRAMP_AC_2,
    FEDRAMP_AC_3,
    FEDRAMP_AU_2,
    FEDRAMP_AU_3,
    FEDRAMP_CM_2,
];

/// Read-only registry of known controls, keyed by framework then control id
#[derive(Debug, Clone)]
pub struct Taxonomy {
    controls: HashMap<Framework, HashMap<&'static str, ComplianceControl>>,
}

impl Taxonomy {
    /// Taxonomy containing the standard catalog
    pub fn standard() -> Self {
        let mut taxonomy = Self::empty();
        for control in STANDARD_CONTROLS {
            taxonomy.insert(control);
        }
        taxonomy
    }

    fn empty() -> Self {
        Self {
            controls: HashMap::new(),
        }
    }

    fn insert(&mut self, control: ComplianceControl) {
        self.controls
            .entry(control.framework)
            .or_default()
            .insert(control.control_id, control);
    }

    /// Standard catalog plus additional controls
    ///
    /// Rejects an extra control whose key is already present with different
    /// notes; re-listing an identical control is accepted.
    pub fn with_controls(extra: impl IntoIterator<Item = ComplianceControl>) -> Result<Self> {
        let mut taxonomy = Self::standard();
        for control in extra {
            if control.control_id.trim().is_empty() {
                return Err(TelemetryError::Config(
                    "Control id cannot be empty".to_string(),
                ));
            }
            match taxonomy.lookup(control.framework, control.control_id) {
                Some(existing) if existing != control => {
                    return Err(TelemetryError::Config(format!(
                        "Conflicting definition for control {}",
                        control
                    )));
                }
                _ => taxonomy.insert(control),
            }
        }
        Ok(taxonomy)
    }

    /// Look up a control by framework and id
    pub fn lookup(&self, framework: Framework, control_id: &str) -> Option<ComplianceControl> {
        self.controls.get(&framework)?.get(control_id).copied()
    }

    /// Whether this exact control (including notes) is registered
    pub fn contains(&self, control: &ComplianceControl) -> bool {
        self.lookup(control.framework, control.control_id)
            .is_some_and(|c| c == *control)
    }

    /// All controls of a framework, sorted by control id
    pub fn controls_for(&self, framework: Framework) -> Vec<ComplianceControl> {
        let mut controls: Vec<ComplianceControl> = self
            .controls
            .get(&framework)
            .map(|by_id| by_id.values().copied().collect())
            .unwrap_or_default();
        controls.sort_by_key(|c| c.control_id);
        controls
    }

    pub fn len(&self) -> usize {
        self.controls.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::standard()
    }
}
