use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by the register file, memory and ALU.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    #[error("register R{0} does not exist (valid: R0-R7)")]
    RegisterOutOfRange(u8),
    #[error("address ${0:04X} is outside the 256-byte address space")]
    AddressOutOfRange(u16),
    #[error("stack overflow: SP=${0:02X} cannot grow below $80")]
    StackOverflow(u8),
    #[error("stack underflow: SP=${0:02X}, nothing to pop")]
    StackUnderflow(u8),
    #[error("division by zero")]
    DivisionByZero,
}

/// Static validation failures reported by `load`, before any cycle runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("invalid program at operation {index} (line {source_line}): {reason}")]
    InvalidProgram {
        index: usize,
        source_line: u32,
        reason: String,
    },
    #[error("invalid address map: {0}")]
    InvalidAddressMap(String),
}

impl LoadError {
    pub fn invalid(index: usize, source_line: u32, reason: impl Into<String>) -> Self {
        LoadError::InvalidProgram {
            index,
            source_line,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    DivisionByZero,
    OutOfRange(String),
    CycleLimitExceeded(u64),
}

impl FaultKind {
    pub fn label(&self) -> &'static str {
        match self {
            FaultKind::DivisionByZero => "division_by_zero",
            FaultKind::OutOfRange(_) => "out_of_range",
            FaultKind::CycleLimitExceeded(_) => "cycle_limit_exceeded",
        }
    }
}

impl From<MachineError> for FaultKind {
    fn from(err: MachineError) -> Self {
        match err {
            MachineError::DivisionByZero => FaultKind::DivisionByZero,
            other => FaultKind::OutOfRange(other.to_string()),
        }
    }
}

/// A runtime fault, pinned to the operation that raised it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{} at operation {index} (line {source_line})", describe(.kind))]
pub struct Fault {
    pub kind: FaultKind,
    pub index: usize,
    pub source_line: u32,
}

fn describe(kind: &FaultKind) -> String {
    match kind {
        FaultKind::DivisionByZero => "division by zero".to_string(),
        FaultKind::OutOfRange(detail) => format!("out of range: {detail}"),
        FaultKind::CycleLimitExceeded(limit) => format!("cycle limit of {limit} exceeded"),
    }
}
