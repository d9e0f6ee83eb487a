use crate::{
    BoxingTo, CallError, CallbackRegistry, DenyBoxing, InstructionsBuilder,
    blob_cache::BlobCache,
    id::IdGenerator,
    object::{ObjectStorage, ReleaseQueue},
    symbol::SymbolStorage,
};
use std::{collections::HashMap, rc::Rc};
use vm::{EagerSymbol, Instruction, OpAttribute, RunContext, VirtualMachine};

/// 会话状态：符号/对象表、缓存、回调表，
/// 以及逻辑/物理两个上下文各自的缓冲区、编号器和释放队列。
///
/// 符号和对象的寿命与会话一致；一次 `logical_run`/`physical_run`
/// 是一个完整的构建→提交→清空轮次，`&mut self` 保证轮次不可重入。
pub struct Session {
    pub(crate) symbols: SymbolStorage,
    pub(crate) objects: ObjectStorage,
    pub(crate) blob_cache: BlobCache,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) interface_ops: HashMap<String, Rc<OpAttribute>>,
    boxing: Rc<dyn BoxingTo>,
    logical: CtxState,
    physical: CtxState,
}

struct CtxState {
    id_gen: IdGenerator,
    instructions: Vec<Instruction>,
    symbol_buf: Vec<EagerSymbol>,
    released: ReleaseQueue,
}

impl CtxState {
    fn new(ctx: RunContext) -> Self {
        Self {
            id_gen: IdGenerator::new(ctx),
            instructions: Vec::new(),
            symbol_buf: Vec::new(),
            released: ReleaseQueue::default(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Rc::new(DenyBoxing))
    }
}

impl Session {
    pub fn new(boxing: Rc<dyn BoxingTo>) -> Self {
        Self {
            symbols: Default::default(),
            objects: Default::default(),
            blob_cache: Default::default(),
            callbacks: Default::default(),
            interface_ops: Default::default(),
            boxing,
            logical: CtxState::new(RunContext::Logical),
            physical: CtxState::new(RunContext::Physical),
        }
    }

    /// 注册接口算子描述，供 `make_lazy_ref_blob_object` 按名解析。
    pub fn register_interface_op_attribute(
        &mut self,
        interface_op_name: impl ToString,
        op_attribute: OpAttribute,
    ) {
        self.interface_ops
            .insert(interface_op_name.to_string(), Rc::new(op_attribute));
    }

    pub fn callbacks(&mut self) -> &mut CallbackRegistry {
        &mut self.callbacks
    }

    pub fn logical_run<VM: VirtualMachine>(
        &mut self,
        vm: &VM,
        build: impl FnOnce(&mut InstructionsBuilder) -> Result<(), CallError>,
    ) -> Result<(), CallError> {
        self.run(RunContext::Logical, vm, build)
    }

    pub fn physical_run<VM: VirtualMachine>(
        &mut self,
        vm: &VM,
        build: impl FnOnce(&mut InstructionsBuilder) -> Result<(), CallError>,
    ) -> Result<(), CallError> {
        self.run(RunContext::Physical, vm, build)
    }

    fn run<VM: VirtualMachine>(
        &mut self,
        ctx: RunContext,
        vm: &VM,
        build: impl FnOnce(&mut InstructionsBuilder) -> Result<(), CallError>,
    ) -> Result<(), CallError> {
        let Self {
            symbols,
            objects,
            blob_cache,
            callbacks,
            interface_ops,
            boxing,
            logical,
            physical,
        } = self;
        let state = match ctx {
            RunContext::Logical => logical,
            RunContext::Physical => physical,
        };
        let mut builder = InstructionsBuilder {
            ctx,
            id_gen: &mut state.id_gen,
            instructions: &mut state.instructions,
            symbol_buf: &mut state.symbol_buf,
            symbols,
            objects,
            blob_cache,
            callbacks,
            interface_ops,
            boxing: boxing.clone(),
            released: state.released.clone(),
        };

        // 上一轮次释放的对象在本轮次开头补发删除指令
        let released = state.released.borrow_mut().drain(..).collect::<Vec<_>>();
        for record in released {
            builder.apply_released(record)
        }
        build(&mut builder)?;

        log::debug!(
            "{ctx:?} run: {} instructions / {} symbols",
            state.instructions.len(),
            state.symbol_buf.len(),
        );
        vm.run(ctx, &state.instructions, &state.symbol_buf);
        state.instructions.clear();
        state.symbol_buf.clear();
        Ok(())
    }
}
