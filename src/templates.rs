use serde::Serialize;

use crate::config::RunProfile;
use crate::error::LoadError;
use crate::program::{AddressMap, Operand, Operation, Program};

/// A ready-made operation sequence, as the translator would have produced
/// it for a small C program.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramTemplate {
    pub id: String,
    pub name: String,
    pub description: String,
    /// C source the operations were traced from, one entry per line.
    pub source: Vec<String>,
    pub profile: RunProfile,
    pub tags: Vec<String>,
    pub operations: Vec<Operation>,
    pub address_map: AddressMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub operations: usize,
    pub profile: RunProfile,
    pub tags: Vec<String>,
}

pub const ARRAY_A: [u8; 5] = [10, 20, 30, 40, 50];
pub const ARRAY_B: [u8; 5] = [5, 15, 25, 35, 45];

impl ProgramTemplate {
    pub fn create_builtin_templates() -> Result<Vec<ProgramTemplate>, LoadError> {
        Ok(vec![array_addition()?, swap()?, stack_roundtrip()?, countdown()?])
    }

    pub fn find(id: &str) -> Result<Option<ProgramTemplate>, LoadError> {
        Ok(Self::create_builtin_templates()?.into_iter().find(|t| t.id == id))
    }

    pub fn build(&self) -> Result<Program, LoadError> {
        Program::new(self.operations.clone(), self.address_map.clone())
    }

    pub fn get_summary(&self) -> TemplateSummary {
        TemplateSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            operations: self.operations.len(),
            profile: self.profile,
            tags: self.tags.clone(),
        }
    }
}

fn lines(source: &[&str]) -> Vec<String> {
    source.iter().map(|s| s.to_string()).collect()
}

fn tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|s| s.to_string()).collect()
}

/// Initialises `name[i]` from `values` through R0, the way a translated
/// array initialiser comes out.
fn init_array(ops: &mut Vec<Operation>, name: &str, values: &[u8], line: u32) {
    for (i, &value) in values.iter().enumerate() {
        ops.push(Operation::load_immediate(0, value).at_line(line));
        ops.push(Operation::store(0, Operand::elem(name, i as u8)).at_line(line));
    }
}

fn array_addition() -> Result<ProgramTemplate, LoadError> {
    let mut map = AddressMap::new();
    map.declare_array("arrayA", 5)?;
    map.declare_array("arrayB", 5)?;
    map.declare_array("result", 5)?;

    let mut ops = Vec::new();
    init_array(&mut ops, "arrayA", &ARRAY_A, 2);
    init_array(&mut ops, "arrayB", &ARRAY_B, 3);

    for i in 0..5u8 {
        ops.push(Operation::load(0, Operand::elem("arrayA", i)).at_line(6));
        ops.push(Operation::load(1, Operand::elem("arrayB", i)).at_line(6));
        ops.push(Operation::add(2, 0, 1).at_line(6));
        ops.push(Operation::store(2, Operand::elem("result", i)).at_line(6));
        ops.push(
            Operation::output(
                "Index {}: {} + {} = {}",
                vec![
                    Operand::Immediate(i),
                    Operand::Register(0),
                    Operand::Register(1),
                    Operand::Register(2),
                ],
            )
            .at_line(7),
        );
    }

    Ok(ProgramTemplate {
        id: "array-addition".to_string(),
        name: "Array Addition".to_string(),
        description: "Adds two 5-element arrays element by element into a third".to_string(),
        source: lines(&[
            "int main() {",
            "    int arrayA[5] = {10, 20, 30, 40, 50};",
            "    int arrayB[5] = {5, 15, 25, 35, 45};",
            "    int result[5];",
            "    for (int i = 0; i < 5; i++) {",
            "        result[i] = arrayA[i] + arrayB[i];",
            "        printf(\"Index %d: %d + %d = %d\\n\", i, arrayA[i], arrayB[i], result[i]);",
            "    }",
            "}",
        ]),
        profile: RunProfile::Classroom,
        tags: tags(&["arrays", "alu", "loop"]),
        operations: ops,
        address_map: map,
    })
}

fn swap() -> Result<ProgramTemplate, LoadError> {
    let mut map = AddressMap::new();
    map.declare_scalar("a")?;
    map.declare_scalar("b")?;
    map.declare_scalar("tmp")?;

    let ops = vec![
        Operation::load_immediate(0, 7).at_line(2),
        Operation::store(0, Operand::var("a")).at_line(2),
        Operation::load_immediate(0, 42).at_line(2),
        Operation::store(0, Operand::var("b")).at_line(2),
        Operation::load(0, Operand::var("a")).at_line(4),
        Operation::store(0, Operand::var("tmp")).at_line(4),
        Operation::load(1, Operand::var("b")).at_line(5),
        Operation::store(1, Operand::var("a")).at_line(5),
        Operation::load(2, Operand::var("tmp")).at_line(6),
        Operation::store(2, Operand::var("b")).at_line(6),
        Operation::load(0, Operand::var("a")).at_line(7),
        Operation::load(1, Operand::var("b")).at_line(7),
        Operation::output("a = {}, b = {}", vec![Operand::Register(0), Operand::Register(1)]).at_line(7),
    ];

    Ok(ProgramTemplate {
        id: "swap".to_string(),
        name: "Variable Swap".to_string(),
        description: "Swaps two variables through a temporary".to_string(),
        source: lines(&[
            "int main() {",
            "    int a = 7, b = 42;",
            "    int tmp;",
            "    tmp = a;",
            "    a = b;",
            "    b = tmp;",
            "    printf(\"a = %d, b = %d\\n\", a, b);",
            "}",
        ]),
        profile: RunProfile::Stepper,
        tags: tags(&["memory", "basics"]),
        operations: ops,
        address_map: map,
    })
}

fn stack_roundtrip() -> Result<ProgramTemplate, LoadError> {
    let mut map = AddressMap::new();
    map.declare_scalar("n")?;
    map.declare_scalar("sq")?;

    let ops = vec![
        Operation::load_immediate(0, 9).at_line(6),
        Operation::store(0, Operand::var("n")).at_line(6),
        Operation::call(6).at_line(7),
        Operation::store(1, Operand::var("sq")).at_line(7),
        Operation::output("square({}) = {}", vec![Operand::Register(0), Operand::Register(1)]).at_line(8),
        Operation::jump(10).at_line(9),
        // square(x): x arrives in R0, result leaves in R1
        Operation::push(Operand::Register(0)).at_line(1),
        Operation::mul(1, 0, 0).at_line(2),
        Operation::pop(0).at_line(2),
        Operation::ret().at_line(2),
    ];

    Ok(ProgramTemplate {
        id: "stack-roundtrip".to_string(),
        name: "Function Call".to_string(),
        description: "Calls a function that saves its argument on the stack".to_string(),
        source: lines(&[
            "int square(int x) {",
            "    return x * x;",
            "}",
            "",
            "int main() {",
            "    int n = 9;",
            "    int sq = square(n);",
            "    printf(\"square(%d) = %d\\n\", n, sq);",
            "}",
        ]),
        profile: RunProfile::Classroom,
        tags: tags(&["stack", "call"]),
        operations: ops,
        address_map: map,
    })
}

fn countdown() -> Result<ProgramTemplate, LoadError> {
    let mut map = AddressMap::new();
    map.declare_scalar("n")?;

    let mut ops = vec![
        Operation::load_immediate(0, 3).at_line(2),
        Operation::store(0, Operand::var("n")).at_line(2),
        Operation::load_immediate(1, 1).at_line(5),
    ];
    for _ in 0..3 {
        ops.push(Operation::load(0, Operand::var("n")).at_line(4));
        ops.push(Operation::output("n = {}", vec![Operand::Register(0)]).at_line(4));
        ops.push(Operation::sub(0, 0, 1).at_line(5));
        ops.push(Operation::store(0, Operand::var("n")).at_line(5));
    }
    ops.push(Operation::output("liftoff", Vec::new()).at_line(7));

    Ok(ProgramTemplate {
        id: "countdown".to_string(),
        name: "Countdown".to_string(),
        description: "Decrements a counter to zero; the last SUB sets the Zero flag".to_string(),
        source: lines(&[
            "int main() {",
            "    int n = 3;",
            "    while (n > 0) {",
            "        printf(\"n = %d\\n\", n);",
            "        n = n - 1;",
            "    }",
            "    printf(\"liftoff\\n\");",
            "}",
        ]),
        profile: RunProfile::Stepper,
        tags: tags(&["loop", "flags"]),
        operations: ops,
        address_map: map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ExecutionController, NullObserver, RunStatus};
    use crate::registers::RegisterId;

    fn run(id: &str) -> ExecutionController {
        let template = ProgramTemplate::find(id).unwrap().unwrap();
        let mut ctl = ExecutionController::default();
        ctl.load_program(template.build().unwrap());
        assert_eq!(ctl.run(&mut NullObserver), RunStatus::Halted);
        ctl
    }

    #[test]
    fn test_builtin_templates_load() {
        let templates = ProgramTemplate::create_builtin_templates().unwrap();
        assert_eq!(templates.len(), 4);
        for template in &templates {
            assert!(template.build().is_ok(), "{} failed validation", template.id);
        }
        assert!(ProgramTemplate::find("nope").unwrap().is_none());
    }

    #[test]
    fn test_array_addition_layout() {
        let template = ProgramTemplate::find("array-addition").unwrap().unwrap();
        assert_eq!(template.address_map.lookup("arrayA[0]"), Some(0x00));
        assert_eq!(template.address_map.lookup("arrayB[0]"), Some(0x05));
        assert_eq!(template.address_map.lookup("result[4]"), Some(0x0E));
    }

    #[test]
    fn test_swap() {
        let ctl = run("swap");
        let snap = ctl.snapshot();
        assert_eq!(snap.read(0x00), 42);
        assert_eq!(snap.read(0x01), 7);
        assert_eq!(ctl.outputs(), &["a = 42, b = 7".to_string()]);
    }

    #[test]
    fn test_stack_roundtrip() {
        let ctl = run("stack-roundtrip");
        let snap = ctl.snapshot();
        assert_eq!(snap.register(RegisterId::R1), 81);
        assert_eq!(snap.register(RegisterId::R0), 9);
        assert_eq!(snap.sp, 0xFF);
        assert_eq!(snap.read(0x01), 81);
        assert_eq!(ctl.outputs(), &["square(9) = 81".to_string()]);
    }

    #[test]
    fn test_countdown_ends_on_zero() {
        let ctl = run("countdown");
        let snap = ctl.snapshot();
        assert!(snap.flags.zero);
        assert!(!snap.flags.carry);
        assert_eq!(ctl.outputs(), &["n = 3", "n = 2", "n = 1", "liftoff"]);
    }
}
