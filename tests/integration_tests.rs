use trace8::bus::{BusKind, Component, Direction};
use trace8::config::{EngineConfig, RunProfile};
use trace8::controller::{CollectingObserver, ExecutionController, NullObserver, RunStatus};
use trace8::cpu::ControlSignals;
use trace8::error::{FaultKind, LoadError};
use trace8::program::{AddressMap, OpKind, Operand, Operation};
use trace8::snapshots::MachineSnapshot;
use trace8::templates::{ProgramTemplate, ARRAY_A, ARRAY_B};

fn array_addition() -> ExecutionController {
    let template = ProgramTemplate::find("array-addition").unwrap().unwrap();
    let mut controller = ExecutionController::default();
    controller.load(template.operations, template.address_map).unwrap();
    controller
}

#[test]
fn test_array_addition_program() {
    let mut controller = array_addition();
    let mut observer = CollectingObserver::default();

    assert_eq!(controller.run(&mut observer), RunStatus::Halted);

    // Check result array
    let snapshot = controller.snapshot();
    let result: Vec<u8> = (0x0A..=0x0E).map(|addr| snapshot.read(addr)).collect();
    assert_eq!(result, vec![15, 35, 55, 75, 95]);
    for i in 0..5 {
        assert_eq!(snapshot.read(i as u8), ARRAY_A[i]);
        assert_eq!(snapshot.read(5 + i as u8), ARRAY_B[i]);
    }

    // Five OUTPUT events, one per element
    assert_eq!(
        observer.outputs,
        vec![
            "Index 0: 10 + 5 = 15",
            "Index 1: 20 + 15 = 35",
            "Index 2: 30 + 25 = 55",
            "Index 3: 40 + 35 = 75",
            "Index 4: 50 + 45 = 95",
        ]
    );
    assert_eq!(controller.outputs(), observer.outputs.as_slice());

    // No addition is zero or negative
    let additions: Vec<_> = observer.records.iter().filter(|r| r.kind == OpKind::Add).collect();
    assert_eq!(additions.len(), 5);
    for record in additions {
        let alu = record.alu.expect("ADD reports its ALU output");
        assert!(!alu.flags.zero);
        assert!(!alu.flags.sign);
    }
}

#[test]
fn test_array_addition_bus_traffic_per_iteration() {
    let mut controller = array_addition();
    let mut observer = CollectingObserver::default();
    controller.run(&mut observer);

    // The loop body is the four line-6 operations of each iteration
    let body: Vec<u64> = observer
        .records
        .iter()
        .filter(|r| r.source_line == 6)
        .map(|r| r.cycle)
        .collect();
    assert_eq!(body.len(), 20);

    for iteration in body.chunks(4) {
        let traffic: Vec<_> = controller
            .transaction_log()
            .filter(|t| iteration.contains(&t.cycle) && t.bus == BusKind::Data)
            .collect();
        let reads = traffic.iter().filter(|t| t.direction == Direction::Read).count();
        let writes = traffic.iter().filter(|t| t.direction == Direction::Write).count();
        let internal = traffic.iter().filter(|t| t.direction == Direction::Internal).count();
        assert_eq!((reads, writes, internal), (2, 1, 1));

        let alu = traffic.iter().find(|t| t.source == Component::Alu).unwrap();
        assert_eq!(alu.destination, Component::Register(2));
    }
}

#[test]
fn test_array_addition_control_signals() {
    let mut controller = array_addition();
    let mut observer = CollectingObserver::default();
    controller.run(&mut observer);

    let load = ControlSignals {
        reg_write: true,
        mem_read: true,
        pc_inc: true,
        bus_enable: true,
        ..ControlSignals::default()
    };
    let add = ControlSignals {
        reg_write: true,
        alu_op: true,
        pc_inc: true,
        bus_enable: true,
        ..ControlSignals::default()
    };
    let store = ControlSignals {
        mem_write: true,
        pc_inc: true,
        bus_enable: true,
        ..ControlSignals::default()
    };
    let output = ControlSignals {
        pc_inc: true,
        ..ControlSignals::default()
    };

    let body: Vec<ControlSignals> = observer
        .records
        .iter()
        .filter(|r| r.source_line >= 6)
        .map(|r| r.signals)
        .collect();
    assert_eq!(body.len(), 25);
    for iteration in body.chunks(5) {
        assert_eq!(iteration, [load, load, add, store, output]);
    }
}

#[test]
fn test_memory_access_records_address_then_data() {
    let mut controller = ExecutionController::default();
    controller
        .load(
            vec![
                Operation::load_immediate(3, 0x2A),
                Operation::store(3, Operand::Address(0x40)),
                Operation::load(4, Operand::Address(0x40)),
            ],
            AddressMap::new(),
        )
        .unwrap();
    controller.run(&mut NullObserver);

    let log: Vec<_> = controller.transaction_log().collect();
    let lines: Vec<String> = log.iter().map(|t| t.to_string()).collect();
    assert_eq!(log.len(), 5, "{lines:#?}");

    assert_eq!((log[0].bus, log[0].source, log[0].direction), (BusKind::Data, Component::Immediate, Direction::Internal));
    assert_eq!((log[1].bus, log[1].value, log[1].cycle), (BusKind::Address, 0x40, 1));
    assert_eq!((log[2].bus, log[2].value, log[2].direction), (BusKind::Data, 0x2A, Direction::Write));
    assert_eq!((log[3].bus, log[3].direction), (BusKind::Address, Direction::Read));
    assert_eq!((log[4].destination, log[4].direction), (Component::Register(4), Direction::Read));

    // The log starts over on every call
    assert_eq!(controller.transaction_log().count(), 5);
    assert_eq!(controller.transaction_log().next().map(|t| t.seq), Some(0));
}

#[test]
fn test_pause_resume_matches_uninterrupted_run() {
    let mut straight = array_addition();
    straight.run(&mut NullObserver);

    for pause_at in [1, 7, 20, 39] {
        let mut controller = array_addition();
        let mut observer = CollectingObserver {
            pause_after: Some(pause_at),
            ..Default::default()
        };
        assert_eq!(controller.run(&mut observer), RunStatus::Paused);

        let paused = controller.snapshot();
        assert_eq!(paused.cycles, pause_at as u64);
        assert_eq!(controller.snapshot(), paused);

        assert_eq!(controller.resume(&mut observer), RunStatus::Halted);
        assert_eq!(controller.snapshot(), straight.snapshot());
        assert!(controller.transaction_log().eq(straight.transaction_log()));
    }
}

#[test]
fn test_reset_after_fault_returns_to_initial_state() {
    let mut controller = ExecutionController::default();
    controller
        .load(
            vec![
                Operation::load_immediate(0, 9),
                Operation::store(0, Operand::Address(0x10)),
                Operation::push(Operand::Register(0)),
                Operation::div(1, 0, 2).at_line(4),
            ],
            AddressMap::new(),
        )
        .unwrap();

    let RunStatus::Faulted { fault } = controller.run(&mut NullObserver) else {
        panic!("expected a division fault");
    };
    assert_eq!(fault.kind, FaultKind::DivisionByZero);
    assert_eq!((fault.index, fault.source_line), (3, 4));

    let faulted = controller.snapshot();
    assert_eq!(faulted.fault, Some(fault));
    assert_eq!(faulted.read(0x10), 9);
    assert_eq!(faulted.sp, 0xFE);

    controller.reset();
    assert_eq!(controller.snapshot(), MachineSnapshot::initial());
    assert_eq!(controller.transaction_log().count(), 0);
    assert!(controller.outputs().is_empty());

    // same program replays after reset
    assert!(matches!(controller.run(&mut NullObserver), RunStatus::Faulted { .. }));
}

#[test]
fn test_static_validation_rejects_bad_programs() {
    let cases = vec![
        (vec![Operation::load(9, Operand::Address(0x00))], "register"),
        (vec![Operation::store(0, Operand::Address(0x80))], "stack"),
        (vec![Operation::load(0, Operand::Address(0x100))], "address"),
        (vec![Operation::load_immediate(7, 1)], "SP"),
        (vec![Operation::jump(5)], "target"),
        (vec![Operation::load(0, Operand::elem("missing", 0))], "variable"),
    ];

    for (ops, what) in cases {
        let mut controller = ExecutionController::default();
        match controller.load(ops, AddressMap::new()) {
            Err(LoadError::InvalidProgram { index, .. }) => assert_eq!(index, 0, "{what}"),
            other => panic!("expected InvalidProgram for bad {what}, got {other:?}"),
        }
        assert_eq!(controller.snapshot().cycles, 0);
    }
}

#[test]
fn test_runaway_loop_hits_cycle_limit() {
    let mut controller = ExecutionController::new(EngineConfig::from_profile(RunProfile::Stepper));
    controller
        .load(vec![Operation::load_immediate(0, 1), Operation::jump(0)], AddressMap::new())
        .unwrap();

    let RunStatus::Faulted { fault } = controller.run(&mut NullObserver) else {
        panic!("expected the cycle limit to trip");
    };
    assert_eq!(fault.kind, FaultKind::CycleLimitExceeded(1_000));
    assert_eq!(controller.snapshot().cycles, 1_000);
}

#[test]
fn test_step_by_step_matches_run() {
    let mut stepped = array_addition();
    let mut observer = CollectingObserver::default();
    while let trace8::cpu::StepOutcome::Cycle(_) = stepped.step(&mut observer) {}

    let mut straight = array_addition();
    straight.run(&mut NullObserver);

    assert_eq!(stepped.snapshot(), straight.snapshot());
    assert_eq!(observer.outputs.len(), 5);
}
