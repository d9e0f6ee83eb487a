mod conf;
mod instruction;
mod op;

pub use conf::{
    BlobDesc, DeviceTag, EagerSymbol, JobConf, OpConfType, OperatorConf, ParallelConf, SbpParallel,
    ScopeConf, SymbolPayload,
};
pub use instruction::{Instruction, Operand};
pub use op::{ArgModifierSignature, OpAttribute, OpNodeSignature, ParallelSignature};

#[allow(non_camel_case_types)]
pub type symbol_id = i64;

#[allow(non_camel_case_types)]
pub type object_id = i64;

#[allow(non_camel_case_types)]
pub type machine_id = u64;

#[allow(non_camel_case_types)]
pub type device_id = u64;

/// 运行上下文：逻辑（分布式）或物理（单个具体设备）。
///
/// 两个上下文各自持有独立的编号器和指令/符号缓冲区，互不泄漏。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum RunContext {
    Logical,
    Physical,
}

/// 指令虚拟机。
///
/// 每个构建轮次提交一批指令和与之配套的符号定义，执行是异步的，
/// 本层不等待任何指令的结果。
pub trait VirtualMachine {
    fn run(&self, ctx: RunContext, instructions: &[Instruction], symbols: &[EagerSymbol]);
}
