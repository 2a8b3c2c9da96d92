use serde::Serialize;

use crate::bus::{Component, CycleBus, Direction};
use crate::error::MachineError;

pub const MEMORY_SIZE: usize = 256;
pub const DATA_START: u8 = 0x00;
pub const DATA_END: u8 = 0x7F;
pub const STACK_START: u8 = 0x80;
pub const STACK_END: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Data,
    Stack,
}

pub fn region_of(address: u8) -> Region {
    if address <= DATA_END {
        Region::Data
    } else {
        Region::Stack
    }
}

fn check_address(address: u16) -> Result<u8, MachineError> {
    u8::try_from(address).map_err(|_| MachineError::AddressOutOfRange(address))
}

#[derive(Debug, Clone)]
pub struct Memory {
    data: [u8; MEMORY_SIZE], // 0x00-0x7F data, 0x80-0xFF stack
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: [0; MEMORY_SIZE],
        }
    }

    /// Reads a byte, driving the address bus. The value's trip to its
    /// destination is recorded by whoever receives it.
    pub fn read_byte(&self, address: u16, bus: &mut CycleBus) -> Result<u8, MachineError> {
        let address = check_address(address)?;
        bus.drive_address(address, Direction::Read);
        Ok(self.data[address as usize])
    }

    pub fn write_byte(
        &mut self,
        address: u16,
        value: u8,
        source: Component,
        bus: &mut CycleBus,
    ) -> Result<(), MachineError> {
        let address = check_address(address)?;
        bus.drive_address(address, Direction::Write);
        bus.drive_data(value, source, Component::Memory);
        self.data[address as usize] = value;
        Ok(())
    }

    /// Inspection read; never touches the buses.
    pub fn peek(&self, address: u8) -> u8 {
        self.data[address as usize]
    }

    pub fn contents(&self) -> &[u8; MEMORY_SIZE] {
        &self.data
    }

    pub fn reset(&mut self) {
        self.data = [0; MEMORY_SIZE];
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}
