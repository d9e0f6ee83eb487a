use vm::{RunContext, object_id, symbol_id};

/// 物理上下文的编号基址。两个上下文共享符号/对象表，
/// 编号空间由基址错开，互不冲突。
const PHYSICAL_ID_BASE: i64 = 1 << 40;

/// 单个运行上下文的编号器，符号和对象各用一个严格递增的计数器。
pub(crate) struct IdGenerator {
    next_symbol_id: symbol_id,
    next_object_id: object_id,
}

impl IdGenerator {
    pub fn new(ctx: RunContext) -> Self {
        let base = match ctx {
            RunContext::Logical => 0,
            RunContext::Physical => PHYSICAL_ID_BASE,
        };
        Self {
            next_symbol_id: base,
            next_object_id: base,
        }
    }

    pub fn new_symbol_id(&mut self) -> symbol_id {
        self.next_symbol_id += 1;
        self.next_symbol_id
    }

    pub fn new_object_id(&mut self) -> object_id {
        self.next_object_id += 1;
        self.next_object_id
    }
}
