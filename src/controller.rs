//! Run / pause / resume / reset over a [`ControlUnit`].
//!
//! Scheduling is cooperative. The controller drives one cycle at a time and
//! only looks at pause requests between a WRITEBACK and the next FETCH, so
//! any snapshot taken while paused is a fully committed state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::BusTransaction;
use crate::config::EngineConfig;
use crate::cpu::{ControlUnit, CycleRecord, Phase, StepOutcome};
use crate::error::{Fault, LoadError};
use crate::program::{AddressMap, Operation, Program};
use crate::snapshots::MachineSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Pause,
}

/// Outbound notifications; the visualization and status display hook in here.
pub trait ExecutionObserver {
    fn on_cycle_complete(
        &mut self,
        _snapshot: &MachineSnapshot,
        _record: &CycleRecord,
        _transactions: &[BusTransaction],
    ) -> Flow {
        Flow::Continue
    }

    /// Must not block: the whole run waits on it.
    fn on_output(&mut self, _text: &str) {}
}

pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

/// Keeps everything it is told about.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    pub snapshots: Vec<MachineSnapshot>,
    pub records: Vec<CycleRecord>,
    pub transactions: Vec<BusTransaction>,
    pub outputs: Vec<String>,
    /// Ask for a pause after this many cycles have been observed.
    pub pause_after: Option<usize>,
}

impl ExecutionObserver for CollectingObserver {
    fn on_cycle_complete(
        &mut self,
        snapshot: &MachineSnapshot,
        record: &CycleRecord,
        transactions: &[BusTransaction],
    ) -> Flow {
        self.snapshots.push(snapshot.clone());
        self.records.push(record.clone());
        self.transactions.extend_from_slice(transactions);
        match self.pause_after {
            Some(n) if self.records.len() == n => Flow::Pause,
            _ => Flow::Continue,
        }
    }

    fn on_output(&mut self, text: &str) {
        self.outputs.push(text.to_string());
    }
}

/// A pause request that can be handed to another task or thread.
#[derive(Debug, Clone, Default)]
pub struct PauseToken(Arc<AtomicBool>);

impl PauseToken {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Ready,
    Paused,
    Halted,
    Faulted { fault: Fault },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Halted | RunStatus::Faulted { .. })
    }
}

pub struct ExecutionController {
    cu: ControlUnit,
    config: EngineConfig,
    pause: PauseToken,
    paused: bool,
    outputs: Vec<String>,
}

impl ExecutionController {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            cu: ControlUnit::new(Program::empty()).with_cycle_limit(config.max_cycles),
            config,
            pause: PauseToken::default(),
            paused: false,
            outputs: Vec::new(),
        }
    }

    /// Validates and installs a program. A rejected program leaves the
    /// previous one in place.
    pub fn load(&mut self, operations: Vec<Operation>, address_map: AddressMap) -> Result<(), LoadError> {
        let program = Program::new(operations, address_map)?;
        self.load_program(program);
        Ok(())
    }

    pub fn load_program(&mut self, program: Program) {
        info!(
            operations = program.len(),
            variables = program.address_map().allocations().len(),
            "program loaded"
        );
        self.cu.load(program);
        self.clear_run_state();
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Drives cycles until the run halts, faults or is paused.
    pub fn run(&mut self, observer: &mut dyn ExecutionObserver) -> RunStatus {
        loop {
            match self.run_slice(usize::MAX, observer) {
                RunStatus::Ready => continue,
                status => return status,
            }
        }
    }

    /// Like [`run`](Self::run) but gives control back after `budget` cycles,
    /// returning `Ready` if the program is still going.
    pub fn run_slice(&mut self, budget: usize, observer: &mut dyn ExecutionObserver) -> RunStatus {
        self.paused = false;
        if self.cu.get_phase().is_terminal() {
            self.pause.clear();
            return self.status();
        }
        let status = self.drive_cycles(budget, observer);
        match &status {
            RunStatus::Paused => {
                self.paused = true;
                info!(cycles = self.cu.get_cycles(), pc = self.cu.get_pc(), "paused");
            }
            RunStatus::Halted => {
                self.pause.clear();
                info!(cycles = self.cu.get_cycles(), "halted");
            }
            RunStatus::Faulted { .. } => self.pause.clear(),
            RunStatus::Idle | RunStatus::Ready => {}
        }
        status
    }

    fn drive_cycles(&mut self, budget: usize, observer: &mut dyn ExecutionObserver) -> RunStatus {
        for _ in 0..budget {
            if self.pause.take() {
                return RunStatus::Paused;
            }
            match self.cycle(observer) {
                (StepOutcome::Cycle(_), Flow::Pause) => {
                    self.pause.clear();
                    return RunStatus::Paused;
                }
                (StepOutcome::Cycle(_), Flow::Continue) => {}
                (StepOutcome::Halted, _) => return RunStatus::Halted,
                (StepOutcome::Faulted(fault), _) => return RunStatus::Faulted { fault },
            }
        }
        RunStatus::Ready
    }

    /// Asks a running loop to stop at the next cycle boundary.
    pub fn pause(&self) {
        self.pause.request();
    }

    pub fn pause_token(&self) -> PauseToken {
        self.pause.clone()
    }

    pub fn resume(&mut self, observer: &mut dyn ExecutionObserver) -> RunStatus {
        self.run(observer)
    }

    /// Back to the initial state with the same program.
    pub fn reset(&mut self) {
        self.cu.reset();
        self.clear_run_state();
        info!("reset");
    }

    /// Runs exactly one cycle and notifies the observer about it. Outside a
    /// run there is nothing to suspend, so a `Flow::Pause` answer is dropped.
    pub fn step(&mut self, observer: &mut dyn ExecutionObserver) -> StepOutcome {
        self.cycle(observer).0
    }

    fn cycle(&mut self, observer: &mut dyn ExecutionObserver) -> (StepOutcome, Flow) {
        let before = self.cu.bus().len() as u64;
        let outcome = self.cu.step();
        let mut flow = Flow::Continue;
        if let StepOutcome::Cycle(record) = &outcome {
            if let Some(text) = &record.output {
                self.outputs.push(text.clone());
                observer.on_output(text);
            }
            let snapshot = self.cu.snapshot();
            flow = observer.on_cycle_complete(&snapshot, record, self.cu.bus().since(before));
        }
        (outcome, flow)
    }

    pub fn snapshot(&self) -> MachineSnapshot {
        self.cu.snapshot()
    }

    /// The log since the last reset. Each call starts from the first entry.
    pub fn transaction_log(&self) -> impl Iterator<Item = &BusTransaction> + '_ {
        self.cu.bus().transactions()
    }

    pub fn transactions_since(&self, seq: u64) -> &[BusTransaction] {
        self.cu.bus().since(seq)
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn program(&self) -> &Program {
        self.cu.program()
    }

    pub fn status(&self) -> RunStatus {
        match self.cu.get_phase() {
            Phase::Halted => RunStatus::Halted,
            Phase::Faulted => match self.cu.get_fault() {
                Some(fault) => RunStatus::Faulted { fault: fault.clone() },
                None => RunStatus::Halted,
            },
            Phase::Idle => RunStatus::Idle,
            _ if self.paused => RunStatus::Paused,
            _ => RunStatus::Ready,
        }
    }

    fn clear_run_state(&mut self) {
        self.outputs.clear();
        self.paused = false;
        self.pause.clear();
    }
}

impl Default for ExecutionController {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
