use crate::{object_id, symbol_id};
use std::fmt;

/// 一条虚拟机指令：类型名、可选的并行放置符号、有序操作数序列。
#[derive(Clone, Debug)]
pub struct Instruction {
    pub instr_type_name: String,
    pub parallel_desc_symbol_id: Option<symbol_id>,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(instr_type_name: impl ToString) -> Self {
        Self {
            instr_type_name: instr_type_name.to_string(),
            parallel_desc_symbol_id: None,
            operands: Vec::new(),
        }
    }

    pub fn on_parallel_desc(mut self, symbol_id: symbol_id) -> Self {
        self.parallel_desc_symbol_id = Some(symbol_id);
        self
    }

    pub fn operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    pub fn push(&mut self, operand: Operand) {
        self.operands.push(operand)
    }
}

/// 指令操作数。
///
/// `Mut` 就地更新并保持对象身份，`Mut2` 整体替换对象的值，
/// `DelObject` 作用于全部分布式副本，`Separator` 分隔变长操作数组。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operand {
    Symbol(symbol_id),
    InitSymbol(symbol_id),
    Const(object_id),
    Mut(object_id),
    Mut2(object_id),
    DelObject(object_id),
    Int64(i64),
    Separator,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Symbol(id) => write!(f, "s{id}"),
            Self::InitSymbol(id) => write!(f, "s{id}!"),
            Self::Const(id) => write!(f, "%{id}"),
            Self::Mut(id) => write!(f, "%{id}:mut"),
            Self::Mut2(id) => write!(f, "%{id}:mut2"),
            Self::DelObject(id) => write!(f, "%{id}:all"),
            Self::Int64(val) => write!(f, "{val}"),
            Self::Separator => write!(f, "|"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.instr_type_name)?;
        if let Some(id) = self.parallel_desc_symbol_id {
            write!(f, " @s{id}")?
        }
        for operand in &self.operands {
            write!(f, " {operand}")?
        }
        Ok(())
    }
}
