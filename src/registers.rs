use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bus::{Component, CycleBus};
use crate::error::MachineError;

pub const REGISTER_COUNT: usize = 8;
/// Value of SP when the stack is empty.
pub const SP_EMPTY: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RegisterId(u8);

impl RegisterId {
    pub const R0: RegisterId = RegisterId(0);
    pub const R1: RegisterId = RegisterId(1);
    pub const R2: RegisterId = RegisterId(2);
    pub const R3: RegisterId = RegisterId(3);
    pub const R4: RegisterId = RegisterId(4);
    pub const R5: RegisterId = RegisterId(5);
    pub const R6: RegisterId = RegisterId(6);
    /// R7 doubles as the stack pointer.
    pub const SP: RegisterId = RegisterId(7);

    pub fn new(id: u8) -> Result<Self, MachineError> {
        if (id as usize) < REGISTER_COUNT {
            Ok(RegisterId(id))
        } else {
            Err(MachineError::RegisterOutOfRange(id))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_stack_pointer(self) -> bool {
        self == Self::SP
    }

    pub fn component(self) -> Component {
        Component::Register(self.0)
    }
}

impl TryFrom<u8> for RegisterId {
    type Error = MachineError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        RegisterId::new(id)
    }
}

impl From<RegisterId> for u8 {
    fn from(id: RegisterId) -> u8 {
        id.0
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    registers: [u8; REGISTER_COUNT],
}

impl RegisterFile {
    pub fn new() -> Self {
        let mut registers = [0; REGISTER_COUNT];
        registers[RegisterId::SP.index()] = SP_EMPTY;
        RegisterFile { registers }
    }

    pub fn read(&self, id: u8) -> Result<u8, MachineError> {
        let id = RegisterId::new(id)?;
        Ok(self.get(id))
    }

    pub fn get(&self, id: RegisterId) -> u8 {
        self.registers[id.index()]
    }

    pub fn sp(&self) -> u8 {
        self.get(RegisterId::SP)
    }

    /// Latches `value` into a register; the DATA bus carries it from `source`.
    pub fn write(
        &mut self,
        id: u8,
        value: u8,
        source: Component,
        bus: &mut CycleBus,
    ) -> Result<(), MachineError> {
        let id = RegisterId::new(id)?;
        bus.drive_data(value, source, id.component());
        self.registers[id.index()] = value;
        Ok(())
    }

    pub fn values(&self) -> [u8; REGISTER_COUNT] {
        self.registers
    }

    pub fn reset(&mut self) {
        *self = RegisterFile::new();
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}
