//! Property-based tests for whole-machine behavior: stack round trips,
//! cycle numbering, and pause/resume transparency.

use proptest::prelude::*;
use trace8::bus::BusTransaction;
use trace8::config::EngineConfig;
use trace8::controller::{CollectingObserver, ExecutionController, NullObserver, RunStatus};
use trace8::cpu::{ControlUnit, StepOutcome};
use trace8::program::{AddressMap, OpKind, Operand, Operation, Program};
use trace8::registers::SP_EMPTY;

fn writable_register() -> impl Strategy<Value = u8> {
    0u8..7
}

fn data_address() -> impl Strategy<Value = u16> {
    0u16..=0x7F
}

/// Straight-line operations that touch registers, memory, the ALU and the
/// stack. DIV may fault, which the properties below must tolerate.
fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        (writable_register(), any::<u8>()).prop_map(|(r, v)| Operation::load_immediate(r, v)),
        (writable_register(), data_address()).prop_map(|(r, a)| Operation::load(r, Operand::Address(a))),
        (writable_register(), data_address()).prop_map(|(r, a)| Operation::store(r, Operand::Address(a))),
        (writable_register(), writable_register(), writable_register()).prop_map(|(d, a, b)| Operation::add(d, a, b)),
        (writable_register(), writable_register(), writable_register()).prop_map(|(d, a, b)| Operation::sub(d, a, b)),
        (writable_register(), writable_register(), writable_register()).prop_map(|(d, a, b)| Operation::mul(d, a, b)),
        (writable_register(), writable_register(), writable_register()).prop_map(|(d, a, b)| Operation::div(d, a, b)),
        (writable_register(), writable_register()).prop_map(|(d, s)| Operation::mov(d, Operand::Register(s))),
        writable_register().prop_map(|r| Operation::push(Operand::Register(r))),
        writable_register().prop_map(Operation::pop),
        writable_register().prop_map(|r| Operation::output("{}", vec![Operand::Register(r)])),
    ]
}

fn program() -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(operation(), 1..40)
}

fn controller(ops: Vec<Operation>) -> ExecutionController {
    let mut ctl = ExecutionController::new(EngineConfig::unbounded());
    ctl.load(ops, AddressMap::new()).unwrap();
    ctl
}

fn log(ctl: &ExecutionController) -> Vec<BusTransaction> {
    ctl.transaction_log().copied().collect()
}

proptest! {
    /// Property: PUSH then POP of the same register restores registers and SP
    #[test]
    fn prop_push_pop_round_trip(values in prop::array::uniform7(any::<u8>()), reg in writable_register()) {
        let mut ops: Vec<Operation> = values
            .iter()
            .enumerate()
            .map(|(r, &v)| Operation::load_immediate(r as u8, v))
            .collect();
        ops.push(Operation::push(Operand::Register(reg)));
        ops.push(Operation::pop(reg));

        let mut cu = ControlUnit::new(Program::new(ops, AddressMap::new()).unwrap());
        for _ in 0..7 {
            cu.step();
        }
        let before = cu.snapshot();
        prop_assert_eq!(before.sp, SP_EMPTY);

        cu.step();
        prop_assert_eq!(cu.get_sp(), SP_EMPTY - 1);
        cu.step();

        let after = cu.snapshot();
        prop_assert_eq!(after.registers, before.registers);
        prop_assert_eq!(after.sp, SP_EMPTY);
        prop_assert_eq!(after.flags, before.flags);
    }

    /// Property: cycle numbers run 0, 1, 2, ... without gaps or repeats
    #[test]
    fn prop_cycle_counter_is_monotonic(ops in program()) {
        let mut ctl = controller(ops);
        let mut observer = CollectingObserver::default();
        ctl.run(&mut observer);

        for (expected, record) in observer.records.iter().enumerate() {
            prop_assert_eq!(record.cycle, expected as u64);
        }
        for (expected, snapshot) in observer.snapshots.iter().enumerate() {
            prop_assert_eq!(snapshot.cycles, expected as u64 + 1);
        }
        prop_assert_eq!(ctl.snapshot().cycles, observer.records.len() as u64);

        let seqs: Vec<u64> = ctl.transaction_log().map(|t| t.seq).collect();
        prop_assert_eq!(seqs, (0..ctl.transaction_log().count() as u64).collect::<Vec<_>>());
        let cycles: Vec<u64> = ctl.transaction_log().map(|t| t.cycle).collect();
        prop_assert!(cycles.windows(2).all(|w| w[0] <= w[1]));
    }

    /// Property: pausing anywhere and resuming ends in the same state and log
    #[test]
    fn prop_pause_resume_is_transparent(ops in program(), pause_at in 1usize..40) {
        let mut straight = controller(ops.clone());
        let straight_status = straight.run(&mut NullObserver);

        let mut interrupted = controller(ops);
        let mut observer = CollectingObserver { pause_after: Some(pause_at), ..Default::default() };
        let mut status = interrupted.run(&mut observer);
        if status == RunStatus::Paused {
            let paused = interrupted.snapshot();
            prop_assert_eq!(paused.cycles, pause_at as u64);
            status = interrupted.resume(&mut observer);
        }

        prop_assert_eq!(status, straight_status);
        prop_assert_eq!(interrupted.snapshot(), straight.snapshot());
        prop_assert_eq!(log(&interrupted), log(&straight));
        prop_assert_eq!(interrupted.outputs(), straight.outputs());
    }

    /// Property: a fault leaves the state of the last committed cycle
    #[test]
    fn prop_fault_preserves_committed_state(ops in program()) {
        let program = Program::new(ops, AddressMap::new()).unwrap();
        let mut cu = ControlUnit::new(program);
        let mut last = cu.snapshot();
        loop {
            match cu.step() {
                StepOutcome::Cycle(_) => last = cu.snapshot(),
                StepOutcome::Halted => break,
                StepOutcome::Faulted(fault) => {
                    let after = cu.snapshot();
                    prop_assert_eq!(after.registers, last.registers);
                    prop_assert_eq!(&after.memory, &last.memory);
                    prop_assert_eq!(after.cycles, last.cycles);
                    prop_assert_eq!(after.pc, last.pc);
                    prop_assert_eq!(after.transaction_count, last.transaction_count);
                    prop_assert_eq!(after.fault, Some(fault.clone()));
                    prop_assert!(matches!(
                        cu.program().get(fault.index).map(|op| op.kind),
                        Some(OpKind::Div | OpKind::Pop | OpKind::Push)
                    ));
                    break;
                }
            }
        }
    }
}
