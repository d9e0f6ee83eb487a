use std::cell::RefCell;
use vm::{EagerSymbol, Instruction, RunContext, VirtualMachine};

/// 记录型虚拟机，按轮次保留收到的指令与符号定义。
#[derive(Default)]
#[repr(transparent)]
pub struct TestVM(RefCell<Internal>);

#[derive(Default)]
struct Internal {
    runs: Vec<Run>,
}

/// 一个构建轮次提交的全部内容。
#[derive(Clone)]
pub struct Run {
    pub ctx: RunContext,
    pub instructions: Vec<Instruction>,
    pub symbols: Vec<EagerSymbol>,
}

impl VirtualMachine for TestVM {
    fn run(&self, ctx: RunContext, instructions: &[Instruction], symbols: &[EagerSymbol]) {
        println!(
            "[vm:{ctx:?}] run #{} | {} instructions / {} symbols",
            self.0.borrow().runs.len(),
            instructions.len(),
            symbols.len(),
        );
        for instruction in instructions {
            println!("  {instruction}")
        }
        self.0.borrow_mut().runs.push(Run {
            ctx,
            instructions: instructions.to_vec(),
            symbols: symbols.to_vec(),
        })
    }
}

impl TestVM {
    pub fn n_runs(&self) -> usize {
        self.0.borrow().runs.len()
    }

    pub fn nth_run(&self, idx: usize) -> Run {
        self.0.borrow().runs[idx].clone()
    }

    pub fn last_run(&self) -> Run {
        self.0.borrow().runs.last().unwrap().clone()
    }

    /// 全部轮次的指令平铺成一个序列。
    pub fn instructions(&self) -> Vec<Instruction> {
        self.0
            .borrow()
            .runs
            .iter()
            .flat_map(|run| run.instructions.iter().cloned())
            .collect()
    }

    /// 指定类型名的指令总数。
    pub fn count(&self, instr_type_name: &str) -> usize {
        self.0
            .borrow()
            .runs
            .iter()
            .flat_map(|run| &run.instructions)
            .filter(|instruction| instruction.instr_type_name == instr_type_name)
            .count()
    }
}
