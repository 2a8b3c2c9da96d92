use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::alu::{self, AluOutput, Flags};
use crate::bus::{BusRecorder, Component, CycleBus, Direction};
use crate::error::{Fault, FaultKind, MachineError};
use crate::memory::{Memory, STACK_START};
use crate::metrics::{record_bus_transactions, record_fault, record_operation, Timer};
use crate::program::{render_output, Decoded, LoadSource, OpKind, Operation, Program, Source};
use crate::registers::{RegisterFile, RegisterId, SP_EMPTY};
use crate::snapshots::MachineSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Fetch,
    Decode,
    Execute,
    Writeback,
    Halted,
    Faulted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Halted | Phase::Faulted)
    }
}

/// What one completed cycle did, for labelling the visualization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u64,
    pub index: usize,
    pub source_line: u32,
    pub kind: OpKind,
    pub text: String,
    pub alu: Option<AluOutput>,
    pub output: Option<String>,
    pub signals: ControlSignals,
}

/// Control lines the CU asserted during one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignals {
    pub reg_write: bool,
    pub mem_read: bool,
    pub mem_write: bool,
    pub alu_op: bool,
    /// PC advanced by one rather than being loaded by JUMP/CALL/RET.
    pub pc_inc: bool,
    pub bus_enable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Cycle(CycleRecord),
    Halted,
    Faulted(Fault),
}

#[derive(Debug, Clone, Copy)]
enum Commit {
    Register(RegisterId, u8, Component),
    Memory(u8, u8, Component),
    /// Return index popped off the stack into PC.
    ProgramCounter(u8),
}

/// Effects computed in EXECUTE and applied in WRITEBACK.
#[derive(Debug, Default)]
struct Pending {
    commits: Vec<Commit>,
    flags: Option<Flags>,
    next_pc: Option<usize>,
    alu: Option<AluOutput>,
    output: Option<String>,
}

impl Pending {
    fn signals(&self, bus: &CycleBus) -> ControlSignals {
        ControlSignals {
            reg_write: self.commits.iter().any(|c| matches!(c, Commit::Register(..))),
            mem_read: bus.addressed(Direction::Read),
            mem_write: self.commits.iter().any(|c| matches!(c, Commit::Memory(..))),
            alu_op: self.alu.is_some(),
            pc_inc: self.next_pc.is_none(),
            bus_enable: !bus.is_empty(),
        }
    }
}

#[derive(Debug)]
pub struct ControlUnit {
    program: Program,
    registers: RegisterFile,
    memory: Memory,
    flags: Flags,
    pc: usize,
    cycles: u64,
    phase: Phase,
    bus: BusRecorder,
    fault: Option<Fault>,
    max_cycles: Option<u64>,
}

impl ControlUnit {
    pub fn new(program: Program) -> Self {
        ControlUnit {
            program,
            registers: RegisterFile::new(),
            memory: Memory::new(),
            flags: Flags::default(),
            pc: 0,
            cycles: 0,
            phase: Phase::Idle,
            bus: BusRecorder::new(),
            fault: None,
            max_cycles: None,
        }
    }

    pub fn with_cycle_limit(mut self, max_cycles: Option<u64>) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    /// Swaps in a new program and returns to the initial state.
    pub fn load(&mut self, program: Program) {
        self.program = program;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.registers.reset();
        self.memory.reset();
        self.flags = Flags::default();
        self.pc = 0;
        self.cycles = 0;
        self.phase = Phase::Idle;
        self.bus.clear();
        self.fault = None;
    }

    // Getters
    pub fn get_pc(&self) -> usize { self.pc }
    pub fn get_sp(&self) -> u8 { self.registers.sp() }
    pub fn get_flags(&self) -> Flags { self.flags }
    pub fn get_cycles(&self) -> u64 { self.cycles }
    pub fn get_phase(&self) -> Phase { self.phase }
    pub fn get_fault(&self) -> Option<&Fault> { self.fault.as_ref() }
    pub fn is_halted(&self) -> bool { self.phase == Phase::Halted }
    pub fn is_faulted(&self) -> bool { self.phase == Phase::Faulted }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn bus(&self) -> &BusRecorder {
        &self.bus
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot::capture(self)
    }

    /// Runs one FETCH -> DECODE -> EXECUTE -> WRITEBACK traversal. Either the
    /// whole cycle commits or, on a fault, nothing from it is visible.
    pub fn step(&mut self) -> StepOutcome {
        match self.phase {
            Phase::Halted => return StepOutcome::Halted,
            Phase::Faulted => {
                if let Some(fault) = &self.fault {
                    return StepOutcome::Faulted(fault.clone());
                }
            }
            _ => {}
        }

        let timer = Timer::new();

        // FETCH
        self.enter(Phase::Fetch);
        let Some(op) = self.program.get(self.pc).cloned() else {
            self.phase = Phase::Halted;
            debug!(pc = self.pc, cycles = self.cycles, "end of program, halted");
            return StepOutcome::Halted;
        };
        if let Some(limit) = self.max_cycles {
            if self.cycles >= limit {
                return self.raise(FaultKind::CycleLimitExceeded(limit), &op);
            }
        }

        // DECODE
        self.enter(Phase::Decode);
        let decoded = match op.decode(self.program.address_map()) {
            Ok(decoded) => decoded,
            Err(reason) => return self.raise(FaultKind::OutOfRange(reason), &op),
        };

        // EXECUTE
        self.enter(Phase::Execute);
        let mut cycle_bus = CycleBus::new();
        let pending = match self.execute(&op, decoded, &mut cycle_bus) {
            Ok(pending) => pending,
            Err(err) => return self.raise(err.into(), &op),
        };

        // WRITEBACK
        self.enter(Phase::Writeback);
        if let Err(err) = self.writeback(&pending, &mut cycle_bus) {
            return self.raise(err.into(), &op);
        }

        let signals = pending.signals(&cycle_bus);
        let cycle = self.cycles;
        let index = self.pc;
        self.cycles += 1;
        self.pc = pending.next_pc.unwrap_or(self.pc + 1);
        let committed = self.bus.commit(cycle, cycle_bus);
        record_bus_transactions(committed);
        self.phase = Phase::Fetch;

        record_operation(op.kind.mnemonic(), timer.elapsed());
        debug!(cycle, index, op = %op, next_pc = self.pc, "cycle committed");

        StepOutcome::Cycle(CycleRecord {
            cycle,
            index,
            source_line: op.source_line,
            kind: op.kind,
            text: op.to_string(),
            alu: pending.alu,
            output: pending.output,
            signals,
        })
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        trace!(?phase, cycle = self.cycles, pc = self.pc, "phase");
    }

    fn raise(&mut self, kind: FaultKind, op: &Operation) -> StepOutcome {
        let fault = Fault {
            kind,
            index: self.pc,
            source_line: op.source_line,
        };
        warn!(%fault, op = %op, cycle = self.cycles, "run faulted");
        record_fault(fault.kind.label());
        self.phase = Phase::Faulted;
        self.fault = Some(fault.clone());
        StepOutcome::Faulted(fault)
    }

    fn value_of(&self, source: Source) -> (u8, Component) {
        match source {
            Source::Register(id) => (self.registers.get(id), id.component()),
            Source::Immediate(value) => (value, Component::Immediate),
        }
    }

    fn execute(
        &self,
        op: &Operation,
        decoded: Decoded,
        bus: &mut CycleBus,
    ) -> Result<Pending, MachineError> {
        let mut pending = Pending::default();

        match decoded {
            Decoded::Load { dst, from } => {
                let (value, source) = match from {
                    LoadSource::Memory(addr) => (self.memory.read_byte(addr as u16, bus)?, Component::Memory),
                    LoadSource::Immediate(value) => (value, Component::Immediate),
                };
                pending.commits.push(Commit::Register(dst, value, source));
            }
            Decoded::Store { src, address } => {
                let value = self.registers.get(src);
                pending.commits.push(Commit::Memory(address, value, src.component()));
            }
            Decoded::Alu { op: alu_op, dst, a, b } => {
                let (a, _) = self.value_of(a);
                let (b, _) = self.value_of(b);
                let out = alu::execute(alu_op, a, b)?;
                pending.commits.push(Commit::Register(dst, out.result, Component::Alu));
                pending.flags = Some(out.flags);
                pending.alu = Some(out);
            }
            Decoded::Move { dst, src } => {
                let (value, source) = self.value_of(src);
                pending.commits.push(Commit::Register(dst, value, source));
            }
            Decoded::Push { src } => {
                let (value, source) = self.value_of(src);
                self.push(value, source, &mut pending)?;
            }
            Decoded::Pop { dst } => {
                let value = self.pop(bus, &mut pending)?;
                pending.commits.insert(0, Commit::Register(dst, value, Component::Memory));
            }
            Decoded::Jump { target } => {
                pending.next_pc = Some(target);
            }
            Decoded::Call { target } => {
                // Return index was checked to fit a byte when the program loaded.
                let ret = u8::try_from(self.pc + 1)
                    .map_err(|_| MachineError::AddressOutOfRange((self.pc + 1) as u16))?;
                self.push(ret, Component::ControlUnit, &mut pending)?;
                pending.next_pc = Some(target);
            }
            Decoded::Ret => {
                let ret = self.pop(bus, &mut pending)?;
                pending.commits.insert(0, Commit::ProgramCounter(ret));
                pending.next_pc = Some(ret as usize);
            }
            Decoded::Output { values } => {
                let values: Vec<u8> = values.into_iter().map(|s| self.value_of(s).0).collect();
                pending.output = Some(render_output(op.template.as_deref(), &values));
            }
        }

        Ok(pending)
    }

    /// Decrements SP, then writes at the new SP.
    fn push(&self, value: u8, source: Component, pending: &mut Pending) -> Result<(), MachineError> {
        let sp = self.registers.sp();
        if sp <= STACK_START {
            return Err(MachineError::StackOverflow(sp));
        }
        let new_sp = sp - 1;
        pending.commits.push(Commit::Register(RegisterId::SP, new_sp, Component::ControlUnit));
        pending.commits.push(Commit::Memory(new_sp, value, source));
        Ok(())
    }

    /// Reads at SP, then increments SP. The caller decides where the value lands.
    fn pop(&self, bus: &mut CycleBus, pending: &mut Pending) -> Result<u8, MachineError> {
        let sp = self.registers.sp();
        if sp == SP_EMPTY {
            return Err(MachineError::StackUnderflow(sp));
        }
        let value = self.memory.read_byte(sp as u16, bus)?;
        pending.commits.push(Commit::Register(RegisterId::SP, sp + 1, Component::ControlUnit));
        Ok(value)
    }

    fn writeback(&mut self, pending: &Pending, bus: &mut CycleBus) -> Result<(), MachineError> {
        for commit in &pending.commits {
            match *commit {
                Commit::Register(id, value, source) => {
                    self.registers.write(id.into(), value, source, bus)?;
                }
                Commit::Memory(address, value, source) => {
                    self.memory.write_byte(address as u16, value, source, bus)?;
                }
                Commit::ProgramCounter(value) => {
                    bus.drive_data(value, Component::Memory, Component::ControlUnit);
                }
            }
        }
        if let Some(flags) = pending.flags {
            self.flags = flags;
        }
        Ok(())
    }
}
