//! Address and data bus recording.
//!
//! Transactions raised while a cycle executes are staged in a [`CycleBus`]
//! and only reach the [`BusRecorder`] log when the cycle commits, so a
//! faulted cycle leaves no trace on the buses.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusKind {
    Address,
    Data,
}

impl BusKind {
    pub fn label(&self) -> &'static str {
        match self {
            BusKind::Address => "address",
            BusKind::Data => "data",
        }
    }
}

/// Which way a value travelled relative to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Memory towards the CPU.
    Read,
    /// CPU towards memory.
    Write,
    /// Between CPU-internal components (ALU, registers, control unit).
    Internal,
}

impl Direction {
    pub fn label(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
            Direction::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Component {
    ControlUnit,
    Alu,
    Memory,
    Register(u8),
    Immediate,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::ControlUnit => write!(f, "CU"),
            Component::Alu => write!(f, "ALU"),
            Component::Memory => write!(f, "MEM"),
            Component::Register(7) => write!(f, "SP"),
            Component::Register(id) => write!(f, "R{id}"),
            Component::Immediate => write!(f, "IMM"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusTransaction {
    /// Position in the log; strictly increasing from 0.
    pub seq: u64,
    pub cycle: u64,
    pub bus: BusKind,
    pub value: u8,
    pub source: Component,
    pub destination: Component,
    pub direction: Direction,
}

impl fmt::Display for BusTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[T{:03}] {:<7} ${:02X} {} -> {} ({})",
            self.cycle,
            self.bus.label(),
            self.value,
            self.source,
            self.destination,
            self.direction.label()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StagedTransfer {
    bus: BusKind,
    value: u8,
    source: Component,
    destination: Component,
    direction: Direction,
}

/// Transactions raised during a single cycle, not yet committed.
#[derive(Debug, Clone, Default)]
pub struct CycleBus {
    staged: Vec<StagedTransfer>,
}

impl CycleBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drive_address(&mut self, address: u8, direction: Direction) {
        self.staged.push(StagedTransfer {
            bus: BusKind::Address,
            value: address,
            source: Component::ControlUnit,
            destination: Component::Memory,
            direction,
        });
    }

    pub fn drive_data(&mut self, value: u8, source: Component, destination: Component) {
        let direction = match (source, destination) {
            (Component::Memory, _) => Direction::Read,
            (_, Component::Memory) => Direction::Write,
            _ => Direction::Internal,
        };
        self.staged.push(StagedTransfer {
            bus: BusKind::Data,
            value,
            source,
            destination,
            direction,
        });
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Whether an address was driven for `direction` this cycle.
    pub fn addressed(&self, direction: Direction) -> bool {
        self.staged
            .iter()
            .any(|t| t.bus == BusKind::Address && t.direction == direction)
    }
}

/// Append-only transaction log for the current run.
#[derive(Debug, Clone, Default)]
pub struct BusRecorder {
    log: Vec<BusTransaction>,
}

impl BusRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends everything staged in `bus` under `cycle` and returns the
    /// newly committed transactions.
    pub fn commit(&mut self, cycle: u64, bus: CycleBus) -> &[BusTransaction] {
        let start = self.log.len();
        for staged in bus.staged {
            let seq = self.log.len() as u64;
            self.log.push(BusTransaction {
                seq,
                cycle,
                bus: staged.bus,
                value: staged.value,
                source: staged.source,
                destination: staged.destination,
                direction: staged.direction,
            });
        }
        &self.log[start..]
    }

    /// Iterates the log from the beginning. Each call starts over.
    pub fn transactions(&self) -> std::slice::Iter<'_, BusTransaction> {
        self.log.iter()
    }

    /// Transactions with `seq >= from`.
    pub fn since(&self, from: u64) -> &[BusTransaction] {
        let start = (from as usize).min(self.log.len());
        &self.log[start..]
    }

    pub fn in_cycle(&self, cycle: u64) -> impl Iterator<Item = &BusTransaction> {
        self.log.iter().filter(move |t| t.cycle == cycle)
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn clear(&mut self) {
        self.log.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_direction_follows_memory() {
        let mut bus = CycleBus::new();
        bus.drive_data(1, Component::Memory, Component::Register(0));
        bus.drive_data(2, Component::Register(2), Component::Memory);
        bus.drive_data(3, Component::Alu, Component::Register(2));

        let mut recorder = BusRecorder::new();
        let committed = recorder.commit(0, bus);
        let directions: Vec<_> = committed.iter().map(|t| t.direction).collect();
        assert_eq!(directions, vec![Direction::Read, Direction::Write, Direction::Internal]);
    }

    #[test]
    fn test_sequence_numbers_continue_across_cycles() {
        let mut recorder = BusRecorder::new();

        let mut first = CycleBus::new();
        first.drive_address(0x05, Direction::Read);
        first.drive_data(20, Component::Memory, Component::Register(1));
        recorder.commit(0, first);

        let mut second = CycleBus::new();
        second.drive_data(7, Component::Immediate, Component::Register(3));
        let committed = recorder.commit(1, second);
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].seq, 2);
        assert_eq!(committed[0].cycle, 1);

        let seqs: Vec<u64> = recorder.transactions().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(recorder.since(1).len(), 2);
        assert!(recorder.since(99).is_empty());
        assert_eq!(recorder.in_cycle(0).count(), 2);
    }

    #[test]
    fn test_transaction_display() {
        let mut recorder = BusRecorder::new();
        let mut bus = CycleBus::new();
        bus.drive_data(0x0F, Component::Alu, Component::Register(2));
        recorder.commit(4, bus);
        let line = recorder.transactions().next().unwrap().to_string();
        assert_eq!(line, "[T004] data    $0F ALU -> R2 (internal)");
    }
}
