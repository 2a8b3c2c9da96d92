//! Operation sequences and the address map that come from the translator.
//!
//! Both are immutable inputs to a run. `Program::new` is the static
//! validation pass: every operation is decoded against the address map
//! up front so a program that would reference a missing register, an
//! out-of-range address or an unknown variable never starts.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::alu::AluOp;
use crate::error::LoadError;
use crate::memory::{DATA_END, DATA_START, STACK_END};
use crate::registers::RegisterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpKind {
    Load,
    Store,
    Add,
    Sub,
    Mul,
    Div,
    Move,
    Push,
    Pop,
    Jump,
    Call,
    Ret,
    Output,
}

impl OpKind {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpKind::Load => "LOAD",
            OpKind::Store => "STORE",
            OpKind::Add => "ADD",
            OpKind::Sub => "SUB",
            OpKind::Mul => "MUL",
            OpKind::Div => "DIV",
            OpKind::Move => "MOVE",
            OpKind::Push => "PUSH",
            OpKind::Pop => "POP",
            OpKind::Jump => "JUMP",
            OpKind::Call => "CALL",
            OpKind::Ret => "RET",
            OpKind::Output => "OUTPUT",
        }
    }

    pub fn alu_op(&self) -> Option<AluOp> {
        match self {
            OpKind::Add => Some(AluOp::Add),
            OpKind::Sub => Some(AluOp::Sub),
            OpKind::Mul => Some(AluOp::Mul),
            OpKind::Div => Some(AluOp::Div),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Register(u8),
    Address(u16),
    Immediate(u8),
    /// A variable or array element, resolved through the address map.
    Variable { name: String, index: Option<u8> },
    /// An operation index, for JUMP and CALL.
    Target(usize),
}

impl Operand {
    pub fn var(name: &str) -> Self {
        Operand::Variable {
            name: name.to_string(),
            index: None,
        }
    }

    pub fn elem(name: &str, index: u8) -> Self {
        Operand::Variable {
            name: name.to_string(),
            index: Some(index),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(7) => write!(f, "SP"),
            Operand::Register(id) => write!(f, "R{id}"),
            Operand::Address(addr) => write!(f, "[${addr:02X}]"),
            Operand::Immediate(value) => write!(f, "#{value}"),
            Operand::Variable { name, index: None } => write!(f, "{name}"),
            Operand::Variable { name, index: Some(i) } => write!(f, "{name}[{i}]"),
            Operand::Target(index) => write!(f, "@{index}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    #[serde(default)]
    pub operands: Vec<Operand>,
    #[serde(default)]
    pub source_line: u32,
    /// OUTPUT format string; each `{}` takes the next operand value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl Operation {
    pub fn new(kind: OpKind, operands: Vec<Operand>) -> Self {
        Operation {
            kind,
            operands,
            source_line: 0,
            template: None,
        }
    }

    pub fn at_line(mut self, line: u32) -> Self {
        self.source_line = line;
        self
    }

    pub fn load(dst: u8, src: Operand) -> Self {
        Self::new(OpKind::Load, vec![Operand::Register(dst), src])
    }

    pub fn load_immediate(dst: u8, value: u8) -> Self {
        Self::load(dst, Operand::Immediate(value))
    }

    pub fn store(src: u8, dst: Operand) -> Self {
        Self::new(OpKind::Store, vec![Operand::Register(src), dst])
    }

    pub fn alu(kind: OpKind, dst: u8, a: Operand, b: Operand) -> Self {
        Self::new(kind, vec![Operand::Register(dst), a, b])
    }

    pub fn add(dst: u8, a: u8, b: u8) -> Self {
        Self::alu(OpKind::Add, dst, Operand::Register(a), Operand::Register(b))
    }

    pub fn sub(dst: u8, a: u8, b: u8) -> Self {
        Self::alu(OpKind::Sub, dst, Operand::Register(a), Operand::Register(b))
    }

    pub fn mul(dst: u8, a: u8, b: u8) -> Self {
        Self::alu(OpKind::Mul, dst, Operand::Register(a), Operand::Register(b))
    }

    pub fn div(dst: u8, a: u8, b: u8) -> Self {
        Self::alu(OpKind::Div, dst, Operand::Register(a), Operand::Register(b))
    }

    pub fn mov(dst: u8, src: Operand) -> Self {
        Self::new(OpKind::Move, vec![Operand::Register(dst), src])
    }

    pub fn push(src: Operand) -> Self {
        Self::new(OpKind::Push, vec![src])
    }

    pub fn pop(dst: u8) -> Self {
        Self::new(OpKind::Pop, vec![Operand::Register(dst)])
    }

    pub fn jump(target: usize) -> Self {
        Self::new(OpKind::Jump, vec![Operand::Target(target)])
    }

    pub fn call(target: usize) -> Self {
        Self::new(OpKind::Call, vec![Operand::Target(target)])
    }

    pub fn ret() -> Self {
        Self::new(OpKind::Ret, Vec::new())
    }

    pub fn output(template: &str, values: Vec<Operand>) -> Self {
        Operation {
            template: Some(template.to_string()),
            ..Self::new(OpKind::Output, values)
        }
    }

    /// Resolves operands into concrete registers, addresses and values.
    pub fn decode(&self, map: &AddressMap) -> Result<Decoded, String> {
        let ops = &self.operands;
        let decoded = match self.kind {
            OpKind::Load => {
                expect_count(self, 2)?;
                let dst = dest_register(&ops[0])?;
                let from = match &ops[1] {
                    Operand::Immediate(value) => LoadSource::Immediate(*value),
                    other => LoadSource::Memory(data_address(other, map)?),
                };
                Decoded::Load { dst, from }
            }
            OpKind::Store => {
                expect_count(self, 2)?;
                Decoded::Store {
                    src: register(&ops[0])?,
                    address: data_address(&ops[1], map)?,
                }
            }
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => {
                let op = self.kind.alu_op().ok_or("not an ALU operation")?;
                let (dst, a, b) = match ops.len() {
                    2 => {
                        let dst = dest_register(&ops[0])?;
                        (dst, Source::Register(dst), source(&ops[1])?)
                    }
                    3 => (dest_register(&ops[0])?, source(&ops[1])?, source(&ops[2])?),
                    n => return Err(format!("{} takes 2 or 3 operands, got {n}", self.kind.mnemonic())),
                };
                Decoded::Alu { op, dst, a, b }
            }
            OpKind::Move => {
                expect_count(self, 2)?;
                Decoded::Move {
                    dst: dest_register(&ops[0])?,
                    src: source(&ops[1])?,
                }
            }
            OpKind::Push => {
                expect_count(self, 1)?;
                Decoded::Push { src: source(&ops[0])? }
            }
            OpKind::Pop => {
                expect_count(self, 1)?;
                Decoded::Pop {
                    dst: dest_register(&ops[0])?,
                }
            }
            OpKind::Jump => {
                expect_count(self, 1)?;
                Decoded::Jump { target: target(&ops[0])? }
            }
            OpKind::Call => {
                expect_count(self, 1)?;
                Decoded::Call { target: target(&ops[0])? }
            }
            OpKind::Ret => {
                expect_count(self, 0)?;
                Decoded::Ret
            }
            OpKind::Output => Decoded::Output {
                values: ops.iter().map(source).collect::<Result<_, _>>()?,
            },
        };
        Ok(decoded)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.mnemonic())?;
        for (i, operand) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{operand}")?;
        }
        Ok(())
    }
}

fn expect_count(op: &Operation, n: usize) -> Result<(), String> {
    if op.operands.len() == n {
        Ok(())
    } else {
        Err(format!(
            "{} takes {n} operand(s), got {}",
            op.kind.mnemonic(),
            op.operands.len()
        ))
    }
}

fn register(operand: &Operand) -> Result<RegisterId, String> {
    match operand {
        Operand::Register(id) => RegisterId::new(*id).map_err(|e| e.to_string()),
        other => Err(format!("expected a register, got {other}")),
    }
}

fn dest_register(operand: &Operand) -> Result<RegisterId, String> {
    let id = register(operand)?;
    if id.is_stack_pointer() {
        return Err("R7 is the stack pointer and cannot be a destination".to_string());
    }
    Ok(id)
}

fn source(operand: &Operand) -> Result<Source, String> {
    match operand {
        Operand::Immediate(value) => Ok(Source::Immediate(*value)),
        Operand::Register(_) => Ok(Source::Register(register(operand)?)),
        other => Err(format!("expected a register or immediate, got {other}")),
    }
}

fn data_address(operand: &Operand, map: &AddressMap) -> Result<u8, String> {
    let address = match operand {
        Operand::Address(addr) => *addr,
        Operand::Variable { name, index } => map
            .resolve(name, *index)
            .ok_or_else(|| format!("unknown variable {operand}"))? as u16,
        other => return Err(format!("expected an address or variable, got {other}")),
    };
    if address > DATA_END as u16 {
        return Err(format!(
            "address ${address:02X} is outside the data region ($00-${DATA_END:02X})"
        ));
    }
    Ok(address as u8)
}

fn target(operand: &Operand) -> Result<usize, String> {
    match operand {
        Operand::Target(index) => Ok(*index),
        other => Err(format!("expected an operation index, got {other}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Register(RegisterId),
    Immediate(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Memory(u8),
    Immediate(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Load { dst: RegisterId, from: LoadSource },
    Store { src: RegisterId, address: u8 },
    Alu { op: AluOp, dst: RegisterId, a: Source, b: Source },
    Move { dst: RegisterId, src: Source },
    Push { src: Source },
    Pop { dst: RegisterId },
    Jump { target: usize },
    Call { target: usize },
    Ret,
    Output { values: Vec<Source> },
}

/// Fills each `{}` in `template` with the next value; leftover values are
/// appended. Without a template the values are joined by spaces.
pub fn render_output(template: Option<&str>, values: &[u8]) -> String {
    let Some(template) = template else {
        return values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
    };

    let mut out = String::with_capacity(template.len() + values.len() * 3);
    let mut values = values.iter();
    let mut pieces = template.split("{}").peekable();
    while let Some(piece) = pieces.next() {
        out.push_str(piece);
        if pieces.peek().is_some() {
            match values.next() {
                Some(v) => out.push_str(&v.to_string()),
                None => out.push_str("{}"),
            }
        }
    }
    for v in values {
        out.push(' ');
        out.push_str(&v.to_string());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    Scalar,
    Array,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub name: String,
    pub base: u8,
    pub len: u8,
    pub kind: AllocationKind,
}

impl Allocation {
    fn end(&self) -> u16 {
        self.base as u16 + self.len as u16
    }
}

/// Variable name to fixed data-region address, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMap {
    allocations: Vec<Allocation>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_free(&self) -> u16 {
        self.allocations.iter().map(Allocation::end).max().unwrap_or(DATA_START as u16)
    }

    fn allocate(&mut self, name: &str, len: u8, kind: AllocationKind) -> Result<u8, LoadError> {
        if self.get(name).is_some() {
            return Err(LoadError::InvalidAddressMap(format!("{name} is already declared")));
        }
        if len == 0 {
            return Err(LoadError::InvalidAddressMap(format!("{name} has zero length")));
        }
        let base = self.next_free();
        if base + len as u16 > DATA_END as u16 + 1 {
            return Err(LoadError::InvalidAddressMap(format!(
                "{name} ({len} bytes) does not fit in the data region"
            )));
        }
        let base = base as u8;
        self.allocations.push(Allocation {
            name: name.to_string(),
            base,
            len,
            kind,
        });
        Ok(base)
    }

    pub fn declare_scalar(&mut self, name: &str) -> Result<u8, LoadError> {
        self.allocate(name, 1, AllocationKind::Scalar)
    }

    pub fn declare_array(&mut self, name: &str, len: u8) -> Result<u8, LoadError> {
        self.allocate(name, len, AllocationKind::Array)
    }

    pub fn get(&self, name: &str) -> Option<&Allocation> {
        self.allocations.iter().find(|a| a.name == name)
    }

    pub fn resolve(&self, name: &str, index: Option<u8>) -> Option<u8> {
        let alloc = self.get(name)?;
        let offset = index.unwrap_or(0);
        (offset < alloc.len).then(|| alloc.base + offset)
    }

    /// Looks up `name` or `name[i]`.
    pub fn lookup(&self, reference: &str) -> Option<u8> {
        match reference.split_once('[') {
            Some((name, rest)) => {
                let index = rest.strip_suffix(']')?.trim().parse().ok()?;
                self.resolve(name.trim(), Some(index))
            }
            None => self.resolve(reference.trim(), None),
        }
    }

    /// Name of the variable element living at `address`, if any.
    pub fn name_at(&self, address: u8) -> Option<String> {
        self.allocations.iter().find_map(|a| {
            let end = a.end();
            if (a.base as u16..end).contains(&(address as u16)) {
                Some(match a.kind {
                    AllocationKind::Scalar => a.name.clone(),
                    AllocationKind::Array => format!("{}[{}]", a.name, address - a.base),
                })
            } else {
                None
            }
        })
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Checks a map built elsewhere: unique names, non-empty, inside the
    /// data region and non-overlapping.
    pub fn validate(&self) -> Result<(), LoadError> {
        let mut names = HashSet::new();
        let mut used = [false; DATA_END as usize + 1];
        for alloc in &self.allocations {
            if !names.insert(alloc.name.as_str()) {
                return Err(LoadError::InvalidAddressMap(format!(
                    "{} is declared twice",
                    alloc.name
                )));
            }
            if alloc.len == 0 || alloc.end() > DATA_END as u16 + 1 {
                return Err(LoadError::InvalidAddressMap(format!(
                    "{} at ${:02X} (+{}) is outside the data region",
                    alloc.name, alloc.base, alloc.len
                )));
            }
            for addr in alloc.base as usize..alloc.end() as usize {
                if used[addr] {
                    return Err(LoadError::InvalidAddressMap(format!(
                        "{} overlaps another variable at ${addr:02X}",
                        alloc.name
                    )));
                }
                used[addr] = true;
            }
        }
        Ok(())
    }
}

/// A validated operation sequence together with its address map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Program {
    operations: Vec<Operation>,
    address_map: AddressMap,
}

impl Program {
    pub fn new(operations: Vec<Operation>, address_map: AddressMap) -> Result<Self, LoadError> {
        address_map.validate()?;

        let len = operations.len();
        for (index, op) in operations.iter().enumerate() {
            let decoded = op
                .decode(&address_map)
                .map_err(|reason| LoadError::invalid(index, op.source_line, reason))?;
            match decoded {
                Decoded::Jump { target } | Decoded::Call { target } if target > len => {
                    return Err(LoadError::invalid(
                        index,
                        op.source_line,
                        format!("target {target} is past the end of the program ({len} operations)"),
                    ));
                }
                Decoded::Call { .. } if index + 1 > STACK_END as usize => {
                    return Err(LoadError::invalid(
                        index,
                        op.source_line,
                        "return index does not fit in a stack byte",
                    ));
                }
                _ => {}
            }
        }

        Ok(Program {
            operations,
            address_map,
        })
    }

    pub fn empty() -> Self {
        Program {
            operations: Vec::new(),
            address_map: AddressMap::new(),
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn get(&self, index: usize) -> Option<&Operation> {
        self.operations.get(index)
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.address_map
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrays() -> AddressMap {
        let mut map = AddressMap::new();
        map.declare_array("arrayA", 5).unwrap();
        map.declare_array("arrayB", 5).unwrap();
        map.declare_array("result", 5).unwrap();
        map
    }

    #[test]
    fn test_declaration_order_is_contiguous() {
        let map = arrays();
        assert_eq!(map.resolve("arrayA", Some(0)), Some(0x00));
        assert_eq!(map.resolve("arrayB", Some(0)), Some(0x05));
        assert_eq!(map.resolve("result", Some(4)), Some(0x0E));
        assert_eq!(map.resolve("result", Some(5)), None);
        assert_eq!(map.lookup("arrayB[2]"), Some(0x07));
        assert_eq!(map.name_at(0x0B), Some("result[1]".to_string()));
    }

    #[test]
    fn test_redeclaration_rejected() {
        let mut map = arrays();
        assert!(matches!(
            map.declare_scalar("arrayA"),
            Err(LoadError::InvalidAddressMap(_))
        ));
    }

    #[test]
    fn test_data_region_exhaustion() {
        let mut map = AddressMap::new();
        map.declare_array("big", 0x7F).unwrap();
        map.declare_scalar("last").unwrap();
        assert_eq!(map.lookup("last"), Some(0x7F));
        assert!(map.declare_scalar("spill").is_err());
    }

    #[test]
    fn test_decode_resolves_variables() {
        let map = arrays();
        let op = Operation::load(1, Operand::elem("arrayB", 3));
        assert_eq!(
            op.decode(&map),
            Ok(Decoded::Load {
                dst: RegisterId::R1,
                from: LoadSource::Memory(0x08),
            })
        );
    }

    #[test]
    fn test_stack_region_not_addressable_by_store() {
        let err = Program::new(
            vec![Operation::store(0, Operand::Address(0x80)).at_line(9)],
            AddressMap::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LoadError::InvalidProgram {
                index: 0,
                source_line: 9,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_register_rejected() {
        let err = Program::new(vec![Operation::load_immediate(8, 1)], AddressMap::new()).unwrap_err();
        assert!(matches!(err, LoadError::InvalidProgram { index: 0, .. }));
    }

    #[test]
    fn test_stack_pointer_is_not_a_destination() {
        let result = Program::new(vec![Operation::add(7, 0, 1)], AddressMap::new());
        assert!(result.is_err());
        // reading SP is fine
        assert!(Program::new(vec![Operation::push(Operand::Register(7))], AddressMap::new()).is_ok());
    }

    #[test]
    fn test_jump_target_past_end_rejected() {
        let ops = vec![Operation::jump(2), Operation::ret()];
        assert!(Program::new(ops, AddressMap::new()).is_ok());
        let ops = vec![Operation::jump(3), Operation::ret()];
        assert!(Program::new(ops, AddressMap::new()).is_err());
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let ops = vec![Operation::load(0, Operand::var("missing"))];
        assert!(Program::new(ops, arrays()).is_err());
    }

    #[test]
    fn test_render_output() {
        assert_eq!(
            render_output(Some("Index {}: {} + {} = {}"), &[0, 10, 5, 15]),
            "Index 0: 10 + 5 = 15"
        );
        assert_eq!(render_output(None, &[1, 2, 3]), "1 2 3");
        assert_eq!(render_output(Some("x={}"), &[]), "x={}");
        assert_eq!(render_output(Some("sum"), &[9]), "sum 9");
    }

    #[test]
    fn test_operation_display_and_json() {
        let op = Operation::load(0, Operand::elem("arrayA", 2));
        assert_eq!(op.to_string(), "LOAD R0, arrayA[2]");

        let json = r#"{"kind":"ADD","operands":[{"register":2},{"register":0},{"immediate":5}],"source_line":14}"#;
        let parsed: Operation = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind, OpKind::Add);
        assert_eq!(parsed.operands[2], Operand::Immediate(5));
        assert_eq!(parsed.source_line, 14);
    }

    #[test]
    fn test_overlapping_map_rejected() {
        let json = r#"{"allocations":[
            {"name":"a","base":0,"len":4,"kind":"array"},
            {"name":"b","base":3,"len":1,"kind":"scalar"}]}"#;
        let map: AddressMap = serde_json::from_str(json).unwrap();
        assert!(map.validate().is_err());
    }

    #[test]
    fn test_call_return_index_must_fit_a_byte() {
        let filler = |n: usize| (0..n).map(|_| Operation::load_immediate(0, 1)).collect::<Vec<_>>();

        let mut ops = filler(254);
        ops.push(Operation::call(0));
        ops.push(Operation::ret());
        assert!(Program::new(ops, AddressMap::new()).is_ok());

        let mut ops = filler(255);
        ops.push(Operation::call(0).at_line(40));
        let err = Program::new(ops, AddressMap::new()).unwrap_err();
        assert!(matches!(
            err,
            LoadError::InvalidProgram {
                index: 255,
                source_line: 40,
                ..
            }
        ));
    }
}
