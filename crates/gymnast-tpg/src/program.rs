//! Register-machine programs that compute a learner's bid.
//!
//! A program is a linear sequence of instructions over [`REGISTER_COUNT`]
//! registers. Every instruction reads one operand, either an observation input or a
//! register, and writes one destination register. Register 0 holds the result.
//!
//! Memory instructions access a [`Memory`] bank that outlives a single execution,
//! which lets a learner carry state from one decision to the next.

use gymnast_training::stats::StructureCounts;
use rand::{Rng, seq::IndexedRandom as _};
use serde::{Deserialize, Serialize};

/// Number of registers of a program, also the size of a memory bank.
pub const REGISTER_COUNT: usize = 8;

/// Exclusive upper bound of input indices drawn for new instructions.
///
/// Indices are wrapped by the actual observation length at execution time.
const MAX_INPUT_INDEX: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    #[display("add")]
    Add,
    #[display("sub")]
    Subtract,
    #[display("mul")]
    Multiply,
    /// Division that leaves the destination unchanged for a zero divisor.
    #[display("div")]
    Divide,
    #[display("neg")]
    Negate,
    /// Loads the memory cell at the destination index.
    #[display("mem-read")]
    MemRead,
    /// Stores the operand into the memory cell at the destination index.
    #[display("mem-write")]
    MemWrite,
}

impl Operation {
    pub const ALL: [Self; 7] = [
        Self::Add,
        Self::Subtract,
        Self::Multiply,
        Self::Divide,
        Self::Negate,
        Self::MemRead,
        Self::MemWrite,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operand {
    Input(usize),
    Register(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Operation,
    pub dest: usize,
    pub operand: Operand,
}

impl Instruction {
    pub fn random<R>(rng: &mut R) -> Self
    where
        R: Rng + ?Sized,
    {
        Self {
            op: random_operation(rng),
            dest: rng.random_range(0..REGISTER_COUNT),
            operand: random_operand(rng),
        }
    }
}

fn random_operation<R>(rng: &mut R) -> Operation
where
    R: Rng + ?Sized,
{
    *Operation::ALL.choose(rng).unwrap_or(&Operation::Add)
}

fn random_operand<R>(rng: &mut R) -> Operand
where
    R: Rng + ?Sized,
{
    if rng.random_bool(0.5) {
        Operand::Input(rng.random_range(0..MAX_INPUT_INDEX))
    } else {
        Operand::Register(rng.random_range(0..REGISTER_COUNT))
    }
}

/// Memory cells shared between executions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Memory {
    cells: [f64; REGISTER_COUNT],
}

impl Memory {
    #[must_use]
    pub fn cells(&self) -> &[f64; REGISTER_COUNT] {
        &self.cells
    }
}

/// Probabilities applied by [`Program::mutate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMutation {
    pub delete: f64,
    pub insert: f64,
    pub change: f64,
    pub swap: f64,
    pub max_len: usize,
}

impl Default for ProgramMutation {
    fn default() -> Self {
        Self {
            delete: 0.5,
            insert: 0.5,
            change: 1.0,
            swap: 0.5,
            max_len: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    /// Creates a program of `1..=max_len` random instructions.
    pub fn random<R>(rng: &mut R, max_len: usize) -> Self
    where
        R: Rng + ?Sized,
    {
        let len = rng.random_range(1..=max_len.max(1));
        Self {
            instructions: (0..len).map(|_| Instruction::random(rng)).collect(),
        }
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Runs the program on freshly zeroed registers and returns register 0.
    ///
    /// Non-finite intermediate results are replaced by zero, so the result is always
    /// a finite number.
    pub fn execute(&self, inputs: &[f64], memory: &mut Memory) -> f64 {
        let mut registers = [0.0; REGISTER_COUNT];
        for instruction in &self.instructions {
            let value = match instruction.operand {
                Operand::Input(_) if inputs.is_empty() => 0.0,
                Operand::Input(index) => inputs[index % inputs.len()],
                Operand::Register(index) => registers[index % REGISTER_COUNT],
            };
            let dest = instruction.dest % REGISTER_COUNT;
            let current = registers[dest];
            let result = match instruction.op {
                Operation::Add => current + value,
                Operation::Subtract => current - value,
                Operation::Multiply => current * value,
                Operation::Divide if value == 0.0 => current,
                Operation::Divide => current / value,
                Operation::Negate => -value,
                Operation::MemRead => memory.cells[dest],
                Operation::MemWrite => {
                    memory.cells[dest] = finite_or_zero(value);
                    current
                }
            };
            registers[dest] = finite_or_zero(result);
        }
        registers[0]
    }

    /// Applies deletion, insertion, change and swap mutations, each with its
    /// configured probability. The program never becomes empty.
    pub fn mutate<R>(&mut self, rng: &mut R, params: &ProgramMutation)
    where
        R: Rng + ?Sized,
    {
        if self.instructions.len() > 1 && rng.random_bool(params.delete) {
            let index = rng.random_range(0..self.instructions.len());
            self.instructions.remove(index);
        }
        if self.instructions.len() < params.max_len && rng.random_bool(params.insert) {
            let index = rng.random_range(0..=self.instructions.len());
            self.instructions.insert(index, Instruction::random(rng));
        }
        if !self.instructions.is_empty() && rng.random_bool(params.change) {
            let index = rng.random_range(0..self.instructions.len());
            let instruction = &mut self.instructions[index];
            match rng.random_range(0..3) {
                0 => instruction.op = random_operation(rng),
                1 => instruction.dest = rng.random_range(0..REGISTER_COUNT),
                _ => instruction.operand = random_operand(rng),
            }
        }
        if self.instructions.len() > 1 && rng.random_bool(params.swap) {
            let a = rng.random_range(0..self.instructions.len());
            let b = rng.random_range(0..self.instructions.len());
            self.instructions.swap(a, b);
        }
        if self.instructions.is_empty() {
            self.instructions.push(Instruction::random(rng));
        }
    }

    /// Adds this program's instruction counts to `counts`.
    pub fn tally(&self, counts: &mut StructureCounts) {
        counts.instructions += self.instructions.len();
        for instruction in &self.instructions {
            let slot = match instruction.op {
                Operation::Add => &mut counts.add,
                Operation::Subtract => &mut counts.subtract,
                Operation::Multiply => &mut counts.multiply,
                Operation::Divide => &mut counts.divide,
                Operation::Negate => &mut counts.negate,
                Operation::MemRead => &mut counts.mem_read,
                Operation::MemWrite => &mut counts.mem_write,
            };
            *slot += 1;
        }
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng as _;
    use rand_pcg::Pcg64;

    use super::*;

    fn ins(op: Operation, dest: usize, operand: Operand) -> Instruction {
        Instruction { op, dest, operand }
    }

    #[test]
    fn test_execute_arithmetic() {
        let program = Program::new(vec![
            ins(Operation::Add, 0, Operand::Input(0)),
            ins(Operation::Multiply, 0, Operand::Input(1)),
            ins(Operation::Add, 1, Operand::Input(2)),
            ins(Operation::Subtract, 0, Operand::Register(1)),
        ]);
        let result = program.execute(&[3.0, 4.0, 2.0], &mut Memory::default());
        assert_eq!(result, 10.0);
    }

    #[test]
    fn test_divide_by_zero_is_protected() {
        let program = Program::new(vec![
            ins(Operation::Add, 0, Operand::Input(0)),
            ins(Operation::Divide, 0, Operand::Input(1)),
        ]);
        assert_eq!(program.execute(&[5.0, 0.0], &mut Memory::default()), 5.0);
        assert_eq!(program.execute(&[5.0, 2.0], &mut Memory::default()), 2.5);
    }

    #[test]
    fn test_input_index_wraps_and_empty_input_reads_zero() {
        let program = Program::new(vec![ins(Operation::Negate, 0, Operand::Input(5))]);
        assert_eq!(program.execute(&[1.0, 2.0], &mut Memory::default()), -2.0);
        assert_eq!(program.execute(&[], &mut Memory::default()), 0.0);
    }

    #[test]
    fn test_memory_persists_between_executions() {
        let writer = Program::new(vec![ins(Operation::MemWrite, 3, Operand::Input(0))]);
        let reader = Program::new(vec![
            ins(Operation::MemRead, 3, Operand::Register(0)),
            ins(Operation::Add, 0, Operand::Register(3)),
        ]);
        let mut memory = Memory::default();

        assert_eq!(reader.execute(&[], &mut memory), 0.0);
        writer.execute(&[7.5], &mut memory);
        assert_eq!(memory.cells()[3], 7.5);
        assert_eq!(reader.execute(&[], &mut memory), 7.5);
    }

    #[test]
    fn test_overflow_is_replaced_by_zero() {
        let program = Program::new(vec![
            ins(Operation::Add, 0, Operand::Input(0)),
            ins(Operation::Multiply, 0, Operand::Register(0)),
        ]);
        assert_eq!(program.execute(&[f64::MAX], &mut Memory::default()), 0.0);
    }

    #[test]
    fn test_mutate_never_empties_program() {
        let mut rng = Pcg64::seed_from_u64(3);
        let params = ProgramMutation {
            delete: 1.0,
            insert: 0.0,
            max_len: 4,
            ..ProgramMutation::default()
        };
        let mut program = Program::random(&mut rng, 4);
        for _ in 0..20 {
            program.mutate(&mut rng, &params);
            assert!(!program.instructions().is_empty());
            assert!(program.instructions().len() <= 4);
        }
    }

    #[test]
    fn test_tally_counts_operations() {
        let program = Program::new(vec![
            ins(Operation::Add, 0, Operand::Input(0)),
            ins(Operation::Add, 1, Operand::Input(0)),
            ins(Operation::MemWrite, 2, Operand::Register(0)),
        ]);
        let mut counts = StructureCounts::default();
        program.tally(&mut counts);
        assert_eq!(counts.instructions, 3);
        assert_eq!(counts.add, 2);
        assert_eq!(counts.mem_write, 1);
        assert_eq!(counts.divide, 0);
    }
}
