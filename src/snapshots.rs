use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alu::Flags;
use crate::cpu::{ControlUnit, Phase};
use crate::error::Fault;
use crate::memory::MEMORY_SIZE;
use crate::registers::{RegisterId, REGISTER_COUNT, SP_EMPTY};

/// Complete observable machine state between two cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub registers: [u8; REGISTER_COUNT],
    pub sp: u8,
    pub flags: Flags,
    pub pc: usize,
    pub cycles: u64,
    pub phase: Phase,
    pub memory: Vec<u8>,
    pub fault: Option<Fault>,
    pub transaction_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCell {
    pub address: u8,
    pub value: u8,
}

impl MachineSnapshot {
    pub fn capture(cu: &ControlUnit) -> Self {
        let registers = cu.registers().values();
        Self {
            registers,
            sp: registers[RegisterId::SP.index()],
            flags: cu.get_flags(),
            pc: cu.get_pc(),
            cycles: cu.get_cycles(),
            phase: cu.get_phase(),
            memory: cu.memory().contents().to_vec(),
            fault: cu.get_fault().cloned(),
            transaction_count: cu.bus().len() as u64,
        }
    }

    /// The state every run starts from.
    pub fn initial() -> Self {
        let mut registers = [0; REGISTER_COUNT];
        registers[RegisterId::SP.index()] = SP_EMPTY;
        Self {
            registers,
            sp: SP_EMPTY,
            flags: Flags::default(),
            pc: 0,
            cycles: 0,
            phase: Phase::Idle,
            memory: vec![0; MEMORY_SIZE],
            fault: None,
            transaction_count: 0,
        }
    }

    pub fn register(&self, id: RegisterId) -> u8 {
        self.registers[id.index()]
    }

    pub fn read(&self, address: u8) -> u8 {
        self.memory[address as usize]
    }

    /// `len` cells starting at `start`, wrapping past $FF.
    pub fn memory_window(&self, start: u8, len: usize) -> Vec<MemoryCell> {
        (0..len.min(MEMORY_SIZE))
            .map(|offset| {
                let address = start.wrapping_add(offset as u8);
                MemoryCell {
                    address,
                    value: self.read(address),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointReason {
    Manual,
    Paused,
    Halted,
    Faulted,
}

/// An immutable, named copy of a snapshot kept for later inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
    pub snapshot: MachineSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: String,
    pub name: String,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
    pub cycles: u64,
    pub pc: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCheckpointRequest {
    pub name: Option<String>,
}

impl Checkpoint {
    pub fn new(session_id: &str, name: Option<String>, reason: CheckpointReason, snapshot: MachineSnapshot) -> Self {
        let name = name.unwrap_or_else(|| format!("cycle-{}", snapshot.cycles));
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            name,
            reason,
            created_at: Utc::now(),
            snapshot,
        }
    }

    pub fn reason_for(phase: Phase) -> CheckpointReason {
        match phase {
            Phase::Halted => CheckpointReason::Halted,
            Phase::Faulted => CheckpointReason::Faulted,
            _ => CheckpointReason::Manual,
        }
    }

    pub fn get_summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            reason: self.reason,
            created_at: self.created_at,
            cycles: self.snapshot.cycles,
            pc: self.snapshot.pc,
        }
    }
}
