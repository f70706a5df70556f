//! Fault Policy Table
//!
//! Maps fault classifications to recovery policy levels. Policy levels form a
//! total order and every comparison between two policies goes through
//! [`PolicyLevel`]'s ordering, never through the wire strings.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Recovery policy level, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PolicyLevel {
    /// No error codes
    #[default]
    Empty,
    /// Faults that need no action
    Ignore,
    /// Wait for the fault to clear on its own, reset otherwise
    RestartRequest,
    /// Restart the workload, reset if the fault persists
    Restart,
    /// Reset once the device is free
    FreeReset,
    /// Hot reset the device ring
    Reset,
    /// Take the device out of service
    Isolate,
}

impl PolicyLevel {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyLevel::Empty => "EmptyError",
            PolicyLevel::Ignore => "IgnoreError",
            PolicyLevel::RestartRequest => "RestartRequestError",
            PolicyLevel::Restart => "RestartError",
            PolicyLevel::FreeReset => "FreeResetError",
            PolicyLevel::Reset => "ResetError",
            PolicyLevel::Isolate => "IsolateError",
        }
    }

    /// Parse a wire string; unrecognized strings fail closed to `Isolate`
    pub fn parse_or_isolate(s: &str) -> Self {
        s.parse().unwrap_or_else(|e: PolicyError| {
            warn!(error = %e, "Unknown policy, treating as isolate");
            PolicyLevel::Isolate
        })
    }

    /// Whether the recovery engine must act on this level
    pub fn needs_recovery(&self) -> bool {
        *self >= PolicyLevel::RestartRequest
    }
}

impl fmt::Display for PolicyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyLevel {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EmptyError" => Ok(PolicyLevel::Empty),
            "IgnoreError" => Ok(PolicyLevel::Ignore),
            "RestartRequestError" => Ok(PolicyLevel::RestartRequest),
            "RestartError" => Ok(PolicyLevel::Restart),
            "FreeResetError" => Ok(PolicyLevel::FreeReset),
            "ResetError" => Ok(PolicyLevel::Reset),
            "IsolateError" => Ok(PolicyLevel::Isolate),
            other => Err(PolicyError::UnknownPolicy(other.to_string())),
        }
    }
}

impl From<String> for PolicyLevel {
    fn from(s: String) -> Self {
        PolicyLevel::parse_or_isolate(&s)
    }
}

impl From<PolicyLevel> for String {
    fn from(p: PolicyLevel) -> Self {
        p.as_str().to_string()
    }
}

/// Fault classification as produced by the fault code table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultType {
    NotHandleFault,
    RestartRequest,
    RestartBusiness,
    #[serde(rename = "FreeRestartNPU")]
    FreeRestartNpu,
    #[serde(rename = "RestartNPU")]
    RestartNpu,
    #[serde(rename = "SeparateNPU")]
    SeparateNpu,
}

impl FromStr for FaultType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotHandleFault" => Ok(FaultType::NotHandleFault),
            "RestartRequest" => Ok(FaultType::RestartRequest),
            "RestartBusiness" => Ok(FaultType::RestartBusiness),
            "FreeRestartNPU" => Ok(FaultType::FreeRestartNpu),
            "RestartNPU" => Ok(FaultType::RestartNpu),
            "SeparateNPU" => Ok(FaultType::SeparateNpu),
            other => Err(PolicyError::UnknownFaultType(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Unknown fault type: {0}")]
    UnknownFaultType(String),

    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    #[error("Invalid fault code: {0}")]
    InvalidCode(String),
}

/// Policy level of a fault type
pub fn policy_of(fault: FaultType) -> PolicyLevel {
    match fault {
        FaultType::NotHandleFault => PolicyLevel::Ignore,
        FaultType::RestartRequest => PolicyLevel::RestartRequest,
        FaultType::RestartBusiness => PolicyLevel::Restart,
        FaultType::FreeRestartNpu => PolicyLevel::FreeReset,
        FaultType::RestartNpu => PolicyLevel::Reset,
        FaultType::SeparateNpu => PolicyLevel::Isolate,
    }
}

/// Policy level of a fault type given by name; unknown names fail closed
pub fn policy_of_name(fault: &str) -> PolicyLevel {
    match fault.parse::<FaultType>() {
        Ok(f) => policy_of(f),
        Err(e) => {
            warn!(error = %e, "Unrecognized fault type, isolating");
            PolicyLevel::Isolate
        }
    }
}

/// Highest policy in a set, `Empty` for an empty set
pub fn max_policy<I: IntoIterator<Item = PolicyLevel>>(policies: I) -> PolicyLevel {
    policies.into_iter().max().unwrap_or(PolicyLevel::Empty)
}

/// Parse "0x80E01801" or "80E01801"
pub fn parse_fault_code(s: &str) -> Result<u64, PolicyError> {
    let trimmed = s.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u64::from_str_radix(hex, 16).map_err(|_| PolicyError::InvalidCode(s.to_string()))
}

/// Error code to fault type classification
#[derive(Debug, Clone)]
pub struct FaultCodeTable {
    codes: HashMap<u64, FaultType>,
}

impl FaultCodeTable {
    /// Empty table; every code classifies as `SeparateNPU`
    pub fn empty() -> Self {
        Self {
            codes: HashMap::new(),
        }
    }

    /// Register codes for a fault type, later registrations win
    pub fn insert_all<I: IntoIterator<Item = u64>>(&mut self, fault: FaultType, codes: I) {
        for code in codes {
            self.codes.insert(code, fault);
        }
    }

    /// Classify one code; unknown codes fail closed to `SeparateNPU`
    pub fn classify(&self, code: u64) -> FaultType {
        self.codes
            .get(&code)
            .copied()
            .unwrap_or(FaultType::SeparateNpu)
    }

    /// Derived policy of a device's code set
    pub fn policy_for_codes(&self, codes: &[u64]) -> PolicyLevel {
        max_policy(codes.iter().map(|c| policy_of(self.classify(*c))))
    }
}

impl Default for FaultCodeTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.insert_all(FaultType::NotHandleFault, [0x80E18402, 0x80C98000, 0x80CD8008]);
        table.insert_all(FaultType::RestartRequest, [0x80CB8009, 0x80E3A203]);
        table.insert_all(FaultType::RestartBusiness, [0x80E3A202, 0x80F38008]);
        table.insert_all(FaultType::FreeRestartNpu, [0x80E18005]);
        table.insert_all(FaultType::RestartNpu, [0x8C084E00, 0x80E01801, 0x80E01803]);
        table.insert_all(FaultType::SeparateNpu, [0x80E0180F, 0x80A18008]);
        table
    }
}
