//! # trace8
//!
//! A cycle-by-cycle emulator for a small illustrative 8-bit CPU. It replays
//! operation sequences traced out of tiny C programs and makes every step
//! observable: register and memory contents, ALU flags, and an ordered log
//! of address- and data-bus transactions.
//!
//! ## Features
//!
//! - 256 bytes of memory split into a data region ($00-$7F) and a stack ($80-$FF)
//! - Eight registers, R7 doubling as the stack pointer
//! - ADD/SUB/MUL/DIV with Carry, Zero, Overflow and Sign flags
//! - Atomic FETCH/DECODE/EXECUTE/WRITEBACK cycles; a fault leaves no partial state
//! - Run, pause, resume, reset and single-step over a loaded program
//! - An HTTP session API and Prometheus metrics for the visualization front end
//!
//! ## Example
//!
//! ```rust
//! use trace8::controller::{ExecutionController, NullObserver, RunStatus};
//! use trace8::program::{AddressMap, Operand, Operation};
//!
//! let mut map = AddressMap::new();
//! map.declare_scalar("total").unwrap();
//!
//! let ops = vec![
//!     Operation::load_immediate(0, 40),
//!     Operation::load_immediate(1, 2),
//!     Operation::add(2, 0, 1),
//!     Operation::store(2, Operand::var("total")),
//! ];
//!
//! let mut controller = ExecutionController::default();
//! controller.load(ops, map).unwrap();
//! assert_eq!(controller.run(&mut NullObserver), RunStatus::Halted);
//!
//! let snapshot = controller.snapshot();
//! assert_eq!(snapshot.read(0x00), 42);
//! assert_eq!(snapshot.cycles, 4);
//! ```

#![recursion_limit = "2048"]

pub mod alu;
pub mod bus;
pub mod config;
pub mod controller;
pub mod cpu;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod program;
pub mod registers;
pub mod server;
pub mod snapshots;
pub mod templates;

pub use controller::ExecutionController;
pub use cpu::ControlUnit;
pub use memory::Memory;
pub use program::{AddressMap, Operand, Operation, Program};
pub use snapshots::MachineSnapshot;
