use crate::{
    BlobObject, BoxingTo, CallError, ForeignCallback, Object, OpArgBlobAttr, OpArgParallelAttr,
    OpKernelObject, Sym,
    blob_cache::BlobCache,
    boxing::try_replace_device_tag,
    callback::CallbackRegistry,
    id::IdGenerator,
    object::{ObjectStorage, ReleaseQueue, Released},
    symbol::SymbolStorage,
};
use itertools::Itertools;
use std::{collections::HashMap, rc::Rc};
use vm::{
    DeviceTag, EagerSymbol, Instruction, JobConf, OpAttribute, OpNodeSignature, Operand,
    OperatorConf, ParallelConf, RunContext, ScopeConf, SymbolPayload, object_id, symbol_id,
};

/// 调用方持有的绑定名到张量对象的映射。
/// 调用会把急切创建的输出对象写回这张表。
pub type BlobBindings = HashMap<String, Rc<BlobObject>>;

/// 指令构建器。
///
/// 在一个运行上下文的缓冲区上工作：解析/驻留符号、创建对象、
/// 追加指令。所有先决条件在所属调用的第一条指令入列之前检查完毕。
pub struct InstructionsBuilder<'s> {
    pub(crate) ctx: RunContext,
    pub(crate) id_gen: &'s mut IdGenerator,
    pub(crate) instructions: &'s mut Vec<Instruction>,
    pub(crate) symbol_buf: &'s mut Vec<EagerSymbol>,
    pub(crate) symbols: &'s mut SymbolStorage,
    pub(crate) objects: &'s mut ObjectStorage,
    pub(crate) blob_cache: &'s mut BlobCache,
    pub(crate) callbacks: &'s mut CallbackRegistry,
    pub(crate) interface_ops: &'s HashMap<String, Rc<OpAttribute>>,
    pub(crate) boxing: Rc<dyn BoxingTo>,
    pub(crate) released: ReleaseQueue,
}

#[derive(Clone, Copy)]
enum Stream {
    Compute,
    CopyD2H,
    CopyH2D,
}

impl Stream {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::CopyD2H => "copy_d2h",
            Self::CopyH2D => "copy_h2d",
        }
    }
}

#[derive(Clone, Copy)]
enum Delegate {
    Boxed,
    Direct,
}

type Operands = Vec<(Sym<String>, Rc<BlobObject>)>;

/// 一次调用的全部操作数，解析完成但尚未发出任何指令。
struct ResolvedOperands {
    consts: Vec<(String, Rc<BlobObject>, OpArgParallelAttr)>,
    mut1_refs: Vec<(String, Rc<BlobObject>)>,
    mut1_outs: Vec<(String, OpArgParallelAttr, OpArgBlobAttr)>,
    mut2_outs: Vec<(String, OpArgParallelAttr, OpArgBlobAttr)>,
}

impl InstructionsBuilder<'_> {
    pub fn ctx(&self) -> RunContext {
        self.ctx
    }

    // ---- 调用协议 ----

    /// 无状态调用：按算子放置复用共享内核对象，
    /// 常量输入经过委托/盒变换机制解析。
    pub fn stateless_call(
        &mut self,
        op_attribute: &OpAttribute,
        parallel_conf: ParallelConf,
        bindings: &mut BlobBindings,
    ) -> Result<(), CallError> {
        self.check_ref_placement(op_attribute, &parallel_conf, bindings)?;
        let op_parallel_desc = self.get_parallel_desc_symbol(parallel_conf);
        self.call_stateless(
            Stream::Compute,
            op_attribute,
            op_parallel_desc.clone(),
            op_parallel_desc,
            bindings,
            Delegate::Boxed,
        )
    }

    /// 盒变换实现自用的无状态调用变体，绕过委托机制直接取绑定对象。
    pub fn boxing_stateless_call(
        &mut self,
        op_attribute: &OpAttribute,
        parallel_conf: ParallelConf,
        bindings: &mut BlobBindings,
    ) -> Result<(), CallError> {
        self.check_ref_placement(op_attribute, &parallel_conf, bindings)?;
        let op_parallel_desc = self.get_parallel_desc_symbol(parallel_conf);
        self.call_stateless(
            Stream::Compute,
            op_attribute,
            op_parallel_desc.clone(),
            op_parallel_desc,
            bindings,
            Delegate::Direct,
        )
    }

    /// 设备到主机拷贝流上的无状态调用。
    /// 输出对象落在换成 cpu 标签的放置下。
    pub fn boxing_cuda_d2h_stateless_call(
        &mut self,
        op_attribute: &OpAttribute,
        in_parallel_conf: ParallelConf,
        bindings: &mut BlobBindings,
    ) -> Result<(), CallError> {
        let op_parallel_desc = self.get_parallel_desc_symbol(in_parallel_conf);
        let blob_parallel_desc = try_replace_device_tag(self, &op_parallel_desc, DeviceTag::Cpu);
        self.check_ref_placement(op_attribute, &blob_parallel_desc, bindings)?;
        self.call_stateless(
            Stream::CopyD2H,
            op_attribute,
            op_parallel_desc,
            blob_parallel_desc,
            bindings,
            Delegate::Direct,
        )
    }

    /// 主机到设备拷贝流上的无状态调用。
    pub fn boxing_cuda_h2d_stateless_call(
        &mut self,
        op_attribute: &OpAttribute,
        out_parallel_conf: ParallelConf,
        bindings: &mut BlobBindings,
    ) -> Result<(), CallError> {
        self.check_ref_placement(op_attribute, &out_parallel_conf, bindings)?;
        let op_parallel_desc = self.get_parallel_desc_symbol(out_parallel_conf);
        self.call_stateless(
            Stream::CopyH2D,
            op_attribute,
            op_parallel_desc.clone(),
            op_parallel_desc,
            bindings,
            Delegate::Direct,
        )
    }

    /// 有状态调用：使用调用方持有的内核对象，
    /// 其放置必须与算子签名声明的放置一致（按符号编号比较）。
    pub fn stateful_call(
        &mut self,
        op_attribute: &OpAttribute,
        opkernel_object: &Rc<OpKernelObject>,
        bindings: &mut BlobBindings,
    ) -> Result<(), CallError> {
        let expected = op_attribute
            .parallel_signature
            .op_parallel_desc_symbol_id
            .ok_or(CallError::MissingParallelSignature)?;
        let op_parallel_desc = opkernel_object.parallel_desc().clone();
        if op_parallel_desc.symbol_id() != expected {
            return Err(CallError::ParallelDescMismatch {
                expected,
                actual: op_parallel_desc.symbol_id(),
            });
        }
        if !op_attribute.op_conf.is_user_op() {
            return Err(CallError::NotUserOp(op_attribute.op_conf.name.clone()));
        }
        self.check_ref_placement(op_attribute, &op_parallel_desc, bindings)?;

        let resolved =
            self.resolve_operands(op_attribute, &op_parallel_desc, &op_parallel_desc, bindings)?;
        let op_node_signature = self.get_op_node_signature_symbol(op_attribute);
        let (consts, mut1, mut2) = self.emit_operands(resolved, bindings, Delegate::Boxed)?;
        self.call_op_kernel(
            format!("{}.CallOpKernel", op_parallel_desc.device_tag.as_str()),
            &op_parallel_desc,
            [
                Operand::Mut(opkernel_object.object_id()),
                Operand::Symbol(op_node_signature.symbol_id()),
            ],
            &consts,
            &mut1,
            &mut2,
        );
        Ok(())
    }

    fn call_stateless(
        &mut self,
        stream: Stream,
        op_attribute: &OpAttribute,
        op_parallel_desc: Sym<ParallelConf>,
        blob_parallel_desc: Sym<ParallelConf>,
        bindings: &mut BlobBindings,
        delegate: Delegate,
    ) -> Result<(), CallError> {
        // 签名里声明了算子放置的，以签名为准
        let op_parallel_desc = match op_attribute.parallel_signature.op_parallel_desc_symbol_id {
            Some(id) => self
                .symbols
                .parallel_conf(id)
                .ok_or(CallError::UnknownSymbol(id))?,
            None => op_parallel_desc,
        };
        let scope_symbol_id = op_attribute
            .op_conf
            .scope_symbol_id
            .ok_or(CallError::MissingScope)?;
        let scope = self
            .symbols
            .scope(scope_symbol_id)
            .ok_or(CallError::UnknownSymbol(scope_symbol_id))?;
        let job_desc = self
            .symbols
            .job_conf(scope.job_desc_symbol_id)
            .ok_or(CallError::UnknownSymbol(scope.job_desc_symbol_id))?;
        let resolved =
            self.resolve_operands(op_attribute, &op_parallel_desc, &blob_parallel_desc, bindings)?;

        let op_conf = self.get_op_conf_symbol(&op_attribute.op_conf);
        let op_node_signature = self.get_op_node_signature_symbol(op_attribute);
        let opkernel = self.get_shared_op_kernel_object(&op_parallel_desc);
        let (consts, mut1, mut2) = self.emit_operands(resolved, bindings, delegate)?;

        let prefix = if op_attribute.op_conf.is_user_op() {
            "User"
        } else {
            "System"
        };
        self.call_op_kernel(
            format!(
                "{}.{}.{prefix}StatelessCallOpKernel",
                op_parallel_desc.device_tag.as_str(),
                stream.as_str(),
            ),
            &op_parallel_desc,
            [
                Operand::Symbol(job_desc.symbol_id()),
                Operand::Symbol(op_conf.symbol_id()),
                Operand::Symbol(op_node_signature.symbol_id()),
                Operand::Mut(opkernel.object_id()),
            ],
            &consts,
            &mut1,
            &mut2,
        );
        Ok(())
    }

    /// 可变输入不做盒变换，放置不一致按合同违背处理。
    fn check_ref_placement(
        &self,
        op_attribute: &OpAttribute,
        parallel_conf: &ParallelConf,
        bindings: &BlobBindings,
    ) -> Result<(), CallError> {
        for ibn in &op_attribute.input_bns {
            if !op_attribute.input_is_mutable(ibn) {
                continue;
            }
            let blob = bindings
                .get(ibn)
                .ok_or_else(|| CallError::MissingBinding(ibn.clone()))?;
            if &**blob.parallel_desc() != parallel_conf {
                return Err(CallError::RefParallelDescMismatch(ibn.clone()));
            }
        }
        Ok(())
    }

    fn resolve_operands(
        &self,
        op_attribute: &OpAttribute,
        op_parallel_desc: &Sym<ParallelConf>,
        blob_parallel_desc: &Sym<ParallelConf>,
        bindings: &BlobBindings,
    ) -> Result<ResolvedOperands, CallError> {
        let mut consts = Vec::new();
        let mut mut1_refs = Vec::new();
        for ibn in &op_attribute.input_bns {
            let blob = bindings
                .get(ibn)
                .ok_or_else(|| CallError::MissingBinding(ibn.clone()))?
                .clone();
            if op_attribute.input_is_mutable(ibn) {
                mut1_refs.push((ibn.clone(), blob))
            } else {
                let attr = OpArgParallelAttr::for_arg(op_parallel_desc, op_attribute, ibn)?;
                consts.push((ibn.clone(), blob, attr))
            }
        }

        let out_parallel_desc = |obn: &str| match op_attribute
            .parallel_signature
            .bn2parallel_desc_symbol_id
            .get(obn)
        {
            Some(&id) => self
                .symbols
                .parallel_conf(id)
                .ok_or(CallError::UnknownSymbol(id)),
            None => Ok(blob_parallel_desc.clone()),
        };
        let resolve_out =
            |obn: &String| -> Result<(String, OpArgParallelAttr, OpArgBlobAttr), CallError> {
                let desc = out_parallel_desc(obn)?;
                let parallel_attr = OpArgParallelAttr::for_arg(&desc, op_attribute, obn)?;
                let blob_attr = OpArgBlobAttr::for_arg(op_attribute, obn)?;
                Ok((obn.clone(), parallel_attr, blob_attr))
            };

        // 布局先于计算可知的输出和暂存绑定走 mut1，其余输出走 mut2
        let mut1_outs = op_attribute
            .output_bns
            .iter()
            .filter(|obn| op_attribute.output_header_infered(obn))
            .chain(op_attribute.tmp_bns.iter())
            .map(resolve_out)
            .collect::<Result<Vec<_>, _>>()?;
        let mut2_outs = op_attribute
            .output_bns
            .iter()
            .filter(|obn| !op_attribute.output_header_infered(obn))
            .map(resolve_out)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedOperands {
            consts,
            mut1_refs,
            mut1_outs,
            mut2_outs,
        })
    }

    fn emit_operands(
        &mut self,
        resolved: ResolvedOperands,
        bindings: &mut BlobBindings,
        delegate: Delegate,
    ) -> Result<(Operands, Operands, Operands), CallError> {
        let ResolvedOperands {
            consts,
            mut1_refs,
            mut1_outs,
            mut2_outs,
        } = resolved;

        let mut const_operands = Vec::with_capacity(consts.len());
        for (ibn, blob, attr) in consts {
            let bn_sym = self.get_string_symbol(&ibn);
            let blob = match delegate {
                Delegate::Boxed => self.get_or_create_delegate(&blob, &attr)?,
                Delegate::Direct => blob,
            };
            const_operands.push((bn_sym, blob))
        }

        let mut mut1_operands = Vec::with_capacity(mut1_refs.len() + mut1_outs.len());
        for (ibn, blob) in mut1_refs {
            mut1_operands.push((self.get_string_symbol(&ibn), blob))
        }
        let mut outs = |builder: &mut Self,
                        resolved: Vec<(String, OpArgParallelAttr, OpArgBlobAttr)>| {
            resolved
                .into_iter()
                .map(|(obn, parallel_attr, blob_attr)| {
                    let bn_sym = builder.get_string_symbol(&obn);
                    let blob = builder.new_blob_object(parallel_attr, blob_attr);
                    bindings.insert(obn, blob.clone());
                    (bn_sym, blob)
                })
                .collect::<Vec<_>>()
        };
        mut1_operands.extend(outs(self, mut1_outs));
        let mut2_operands = outs(self, mut2_outs);

        Ok((const_operands, mut1_operands, mut2_operands))
    }

    fn call_op_kernel(
        &mut self,
        instr_type_name: String,
        parallel_desc: &Sym<ParallelConf>,
        head: impl IntoIterator<Item = Operand>,
        const_operands: &[(Sym<String>, Rc<BlobObject>)],
        mut1_operands: &[(Sym<String>, Rc<BlobObject>)],
        mut2_operands: &[(Sym<String>, Rc<BlobObject>)],
    ) {
        let mut instruction =
            Instruction::new(instr_type_name).on_parallel_desc(parallel_desc.symbol_id());
        for operand in head {
            instruction.push(operand)
        }
        instruction.push(Operand::Separator);
        for (bn, blob) in const_operands {
            instruction.push(Operand::Symbol(bn.symbol_id()));
            instruction.push(Operand::Const(blob.object_id()));
        }
        instruction.push(Operand::Separator);
        for (bn, blob) in mut1_operands {
            instruction.push(Operand::Symbol(bn.symbol_id()));
            instruction.push(Operand::Mut(blob.object_id()));
        }
        instruction.push(Operand::Separator);
        for (bn, blob) in mut2_operands {
            instruction.push(Operand::Symbol(bn.symbol_id()));
            instruction.push(Operand::Mut2(blob.object_id()));
        }
        self.instructions.push(instruction);
    }

    // ---- 委托 / 盒变换 ----

    /// 取张量对象在目标布局下的等价委托。
    ///
    /// 布局已一致时原样返回，不触缓存；否则查缓存，
    /// 未命中时调用盒变换并记忆结果，条目随源对象存活。
    pub fn get_or_create_delegate(
        &mut self,
        blob_object: &Rc<BlobObject>,
        op_arg_parallel_attr: &OpArgParallelAttr,
    ) -> Result<Rc<BlobObject>, CallError> {
        if blob_object.op_arg_parallel_attr == *op_arg_parallel_attr {
            return Ok(blob_object.clone());
        }
        if let Some(delegate) = self
            .blob_cache
            .find(blob_object.object_id(), op_arg_parallel_attr)
        {
            return Ok(delegate);
        }
        log::trace!(
            "boxing %{} -> {:?}",
            blob_object.object_id(),
            op_arg_parallel_attr.distribute,
        );
        let boxing = self.boxing.clone();
        let delegate = boxing.boxing_to(self, blob_object, op_arg_parallel_attr)?;
        self.blob_cache
            .insert(blob_object.object_id(), op_arg_parallel_attr, delegate.clone());
        Ok(delegate)
    }

    // ---- 对象生命周期 ----

    /// 急切创建一个张量对象：分配编号并发出 `NewObject`。
    pub fn new_blob_object(
        &mut self,
        op_arg_parallel_attr: OpArgParallelAttr,
        op_arg_blob_attr: OpArgBlobAttr,
    ) -> Rc<BlobObject> {
        let parallel_desc = op_arg_parallel_attr.parallel_desc.clone();
        let object_id = self.new_object_id(&parallel_desc);
        let object = Object::new(object_id, parallel_desc, Some(self.released.clone()));
        Rc::new(BlobObject::new(
            object,
            op_arg_parallel_attr,
            op_arg_blob_attr,
        ))
    }

    /// 每个放置至多一个共享内核对象，跨调用复用。
    pub fn get_shared_op_kernel_object(
        &mut self,
        parallel_desc: &Sym<ParallelConf>,
    ) -> Rc<Object> {
        if let Some(object) = self.objects.shared_opkernel(parallel_desc.symbol_id()) {
            return object;
        }
        let object_id = self.new_object_id(parallel_desc);
        let object = Rc::new(Object::new(object_id, parallel_desc.clone(), None));
        self.objects
            .cache_shared_opkernel(parallel_desc.symbol_id(), object.clone());
        object
    }

    /// 实例化一个有状态内核对象，放置经算子的作用域解析。
    pub fn new_op_kernel_object(
        &mut self,
        op_conf: OperatorConf,
    ) -> Result<Rc<OpKernelObject>, CallError> {
        let scope_symbol_id = op_conf.scope_symbol_id.ok_or(CallError::MissingScope)?;
        let scope = self
            .symbols
            .scope(scope_symbol_id)
            .ok_or(CallError::UnknownSymbol(scope_symbol_id))?;
        let job_desc = self
            .symbols
            .job_conf(scope.job_desc_symbol_id)
            .ok_or(CallError::UnknownSymbol(scope.job_desc_symbol_id))?;
        let device_parallel_conf = scope.device_parallel_conf.clone();

        let op_conf_sym = self.get_op_conf_symbol(&op_conf);
        let parallel_desc = self.get_parallel_desc_symbol(device_parallel_conf);
        let object_id = self.new_object_id(&parallel_desc);
        self.instructions.push(
            Instruction::new("InitOpKernelObject")
                .on_parallel_desc(parallel_desc.symbol_id())
                .operand(Operand::Symbol(job_desc.symbol_id()))
                .operand(Operand::Symbol(op_conf_sym.symbol_id()))
                .operand(Operand::Mut(object_id)),
        );
        let object = Object::new(object_id, parallel_desc, Some(self.released.clone()));
        Ok(Rc::new(OpKernelObject::new(object, op_conf)))
    }

    /// 两段式删除：先让虚拟机释放对象的内部资源，再从命名空间移除。
    /// 删除后编号失效，释放回调随之解除。
    pub fn delete_object(&mut self, object: &Object) -> Result<(), CallError> {
        if !self.objects.contains(object.object_id()) {
            return Err(CallError::DeadObject(object.object_id()));
        }
        object.disarm();
        self.apply_released(Released {
            object_id: object.object_id(),
            parallel_desc_symbol_id: object.parallel_desc().symbol_id(),
        });
        Ok(())
    }

    pub(crate) fn apply_released(&mut self, released: Released) {
        let Released {
            object_id,
            parallel_desc_symbol_id,
        } = released;
        assert!(self.objects.remove(object_id));
        self.blob_cache.evict(object_id);
        self.instructions.push(
            Instruction::new("TryClearObject")
                .on_parallel_desc(parallel_desc_symbol_id)
                .operand(Operand::Mut(object_id)),
        );
        self.instructions
            .push(Instruction::new("DeleteObject").operand(Operand::DelObject(object_id)));
    }

    // ---- 跨放置操作 ----

    /// 物理到逻辑打包。物理对象的设备对必须恰好覆盖目标放置的设备集。
    pub fn pack_physical_blobs_to_logical_blob(
        &mut self,
        physical_blob_objects: &[Rc<BlobObject>],
        op_arg_parallel_attr: OpArgParallelAttr,
        op_arg_blob_attr: OpArgBlobAttr,
    ) -> Result<Rc<BlobObject>, CallError> {
        let parallel_desc = op_arg_parallel_attr.parallel_desc.clone();
        let device_tag = parallel_desc.device_tag;
        for blob in physical_blob_objects {
            let desc = blob.parallel_desc();
            if desc.parallel_num() != 1 {
                return Err(CallError::NotPhysical(blob.object_id()));
            }
            if desc.device_tag != device_tag {
                return Err(CallError::DeviceTagMismatch {
                    expected: device_tag,
                    actual: desc.device_tag,
                });
            }
        }
        let covered = physical_blob_objects
            .iter()
            .map(|blob| blob.parallel_desc().sole_device_pair())
            .sorted()
            .collect::<Vec<_>>();
        if covered != parallel_desc.device_pairs().sorted().collect::<Vec<_>>() {
            return Err(CallError::DevicePairsMismatch);
        }

        let logical = self.new_blob_object(op_arg_parallel_attr, op_arg_blob_attr);
        self.replace_mirrored(
            &parallel_desc,
            [logical.object_id()],
            physical_blob_objects.iter().map(|blob| blob.object_id()),
        );
        Ok(logical)
    }

    /// 放置的每个（机器，设备）对各取一个单设备放置符号。
    pub fn get_physical_parallel_desc_symbols(
        &mut self,
        parallel_desc: &Sym<ParallelConf>,
    ) -> Vec<Sym<ParallelConf>> {
        let device_tag = parallel_desc.device_tag;
        parallel_desc
            .device_pairs()
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(machine, device)| {
                self.get_parallel_desc_symbol(ParallelConf::device(device_tag, machine, device))
            })
            .collect()
    }

    /// 逻辑到物理拆包，打包的逆操作。
    pub fn unpack_logical_blob_to_physical_blobs(
        &mut self,
        blob_object: &BlobObject,
    ) -> Vec<Rc<BlobObject>> {
        let parallel_desc = blob_object.parallel_desc().clone();
        let physical = self
            .get_physical_parallel_desc_symbols(&parallel_desc)
            .into_iter()
            .map(|desc| {
                self.new_blob_object(
                    OpArgParallelAttr::mirrored(desc),
                    blob_object.op_arg_blob_attr.clone(),
                )
            })
            .collect::<Vec<_>>();
        self.replace_mirrored(
            &parallel_desc,
            physical.iter().map(|blob| blob.object_id()),
            [blob_object.object_id()],
        );
        physical
    }

    /// 同放置下的对象别名。
    pub fn make_reference_blob_object(
        &mut self,
        blob_object: &Rc<BlobObject>,
        op_arg_parallel_attr: OpArgParallelAttr,
    ) -> Result<Rc<BlobObject>, CallError> {
        let parallel_desc = blob_object.parallel_desc();
        if *parallel_desc != op_arg_parallel_attr.parallel_desc {
            return Err(CallError::ParallelDescMismatch {
                expected: op_arg_parallel_attr.parallel_desc.symbol_id(),
                actual: parallel_desc.symbol_id(),
            });
        }
        let parallel_desc = parallel_desc.clone();
        let reference =
            self.new_blob_object(op_arg_parallel_attr, blob_object.op_arg_blob_attr.clone());
        self.replace_mirrored(
            &parallel_desc,
            [reference.object_id()],
            [blob_object.object_id()],
        );
        Ok(reference)
    }

    /// 把单设备对象广播到更宽的放置下。源放置每台机器至多一个设备。
    pub fn broadcast_blob_reference(
        &mut self,
        sole_mirrored_blob_object: &Rc<BlobObject>,
        parallel_desc: &Sym<ParallelConf>,
    ) -> Result<Rc<BlobObject>, CallError> {
        if sole_mirrored_blob_object
            .parallel_desc()
            .devices
            .values()
            .any(|devices| devices.len() != 1)
        {
            return Err(CallError::MultiDeviceBroadcastSource);
        }
        // 广播引用复用既有存储，不发 NewObject
        let object_id = self.id_gen.new_object_id();
        self.objects.register(object_id);
        self.instructions.push(
            Instruction::new("BroadcastObjectReference")
                .on_parallel_desc(parallel_desc.symbol_id())
                .operand(Operand::Int64(object_id))
                .operand(Operand::Int64(sole_mirrored_blob_object.object_id())),
        );
        let object = Object::new(object_id, parallel_desc.clone(), Some(self.released.clone()));
        Ok(Rc::new(BlobObject::new(
            object,
            OpArgParallelAttr::broadcast(parallel_desc.clone()),
            sole_mirrored_blob_object.op_arg_blob_attr.clone(),
        )))
    }

    /// 为已注册的接口输出建一个占位对象，延迟绑定到既有的逻辑名。
    pub fn make_lazy_ref_blob_object(
        &mut self,
        interface_op_name: &str,
    ) -> Result<Rc<BlobObject>, CallError> {
        let op_attribute = self
            .interface_ops
            .get(interface_op_name)
            .ok_or_else(|| CallError::UnknownInterfaceOp(interface_op_name.into()))?
            .clone();
        let [obn] = &op_attribute.output_bns[..] else {
            return Err(CallError::SoleOutputExpected(interface_op_name.into()));
        };
        let parallel_desc_symbol_id = op_attribute
            .parallel_signature
            .bn2parallel_desc_symbol_id
            .get(obn)
            .copied()
            .ok_or(CallError::MissingParallelSignature)?;
        let parallel_desc = self
            .symbols
            .parallel_conf(parallel_desc_symbol_id)
            .ok_or(CallError::UnknownSymbol(parallel_desc_symbol_id))?;
        let parallel_attr = OpArgParallelAttr::for_arg(&parallel_desc, &op_attribute, obn)?;
        let blob_attr = OpArgBlobAttr::for_arg(&op_attribute, obn)?;

        let blob = self.new_blob_object(parallel_attr, blob_attr);
        let lbn_sym = self.get_string_symbol(&blob.op_arg_blob_attr.logical_blob_name);
        self.instructions.push(
            Instruction::new(format!(
                "{}.LazyReference",
                parallel_desc.device_tag.as_str()
            ))
            .on_parallel_desc(parallel_desc.symbol_id())
            .operand(Operand::Mut(blob.object_id()))
            .operand(Operand::Symbol(lbn_sym.symbol_id())),
        );
        Ok(blob)
    }

    fn replace_mirrored(
        &mut self,
        parallel_desc: &Sym<ParallelConf>,
        lhs: impl IntoIterator<Item = object_id>,
        rhs: impl IntoIterator<Item = object_id>,
    ) {
        let mut instruction =
            Instruction::new("ReplaceMirrored").on_parallel_desc(parallel_desc.symbol_id());
        for object_id in lhs {
            instruction.push(Operand::Int64(object_id))
        }
        instruction.push(Operand::Separator);
        for object_id in rhs {
            instruction.push(Operand::Int64(object_id))
        }
        self.instructions.push(instruction);
    }

    // ---- 取数 / 喂数 / 回调 ----

    pub fn fetch_blob_header(
        &mut self,
        blob_object: &BlobObject,
        callback: ForeignCallback,
    ) -> i64 {
        self.fetch_blob("FetchBlobHeader", blob_object, callback)
    }

    pub fn fetch_blob_body(&mut self, blob_object: &BlobObject, callback: ForeignCallback) -> i64 {
        self.fetch_blob("FetchBlobBody", blob_object, callback)
    }

    fn fetch_blob(
        &mut self,
        instruction_name: &str,
        blob_object: &BlobObject,
        callback: ForeignCallback,
    ) -> i64 {
        let callback_id = self.callbacks.register(callback);
        let parallel_desc = blob_object.parallel_desc();
        self.instructions.push(
            Instruction::new(format!(
                "{}.{instruction_name}",
                parallel_desc.device_tag.as_str()
            ))
            .on_parallel_desc(parallel_desc.symbol_id())
            .operand(Operand::Const(blob_object.object_id()))
            .operand(Operand::Int64(callback_id)),
        );
        callback_id
    }

    pub fn feed_blob(&mut self, blob_object: &BlobObject, callback: ForeignCallback) -> i64 {
        let callback_id = self.callbacks.register(callback);
        let parallel_desc = blob_object.parallel_desc();
        self.instructions.push(
            Instruction::new(format!("{}.FeedBlob", parallel_desc.device_tag.as_str()))
                .on_parallel_desc(parallel_desc.symbol_id())
                .operand(Operand::Mut2(blob_object.object_id()))
                .operand(Operand::Int64(callback_id)),
        );
        callback_id
    }

    pub fn remove_foreign_callback(&mut self, object_id: object_id, callback_id: i64) {
        self.instructions.push(
            Instruction::new("RemoveForeignCallback")
                .operand(Operand::DelObject(object_id))
                .operand(Operand::Int64(callback_id)),
        );
    }

    /// 把张量对象钉在主机可分页内存外，作用域内执行 `f`。
    pub fn cuda_host_pin_blob<R>(
        &mut self,
        blob_object: &BlobObject,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        self.cuda_host_blob_instruction("CudaHostRegisterBlob", blob_object);
        let ans = f(self);
        self.cuda_host_blob_instruction("CudaHostUnregisterBlob", blob_object);
        ans
    }

    fn cuda_host_blob_instruction(&mut self, instr_type_name: &str, blob_object: &BlobObject) {
        self.instructions.push(
            Instruction::new(instr_type_name)
                .on_parallel_desc(blob_object.parallel_desc().symbol_id())
                .operand(Operand::Mut(blob_object.object_id())),
        );
    }

    // ---- 符号驻留 ----

    pub fn get_string_symbol(&mut self, string: impl ToString) -> Sym<String> {
        let string = string.to_string();
        if let Some(sym) = self.symbols.find_string(&string) {
            return sym;
        }
        let symbol_id = self.new_symbol_id();
        self.init_symbol(
            "InitStringSymbol",
            symbol_id,
            SymbolPayload::String(string.clone()),
        );
        self.symbols.insert_string(symbol_id, string)
    }

    pub fn get_job_conf_symbol(&mut self, job_conf: JobConf) -> Sym<JobConf> {
        if let Some(sym) = self.symbols.find_job_conf(&job_conf) {
            return sym;
        }
        let symbol_id = self.new_symbol_id();
        self.init_symbol(
            "InitJobDescSymbol",
            symbol_id,
            SymbolPayload::JobConf(job_conf.clone()),
        );
        self.symbols.insert_job_conf(symbol_id, job_conf)
    }

    pub fn get_parallel_desc_symbol(&mut self, parallel_conf: ParallelConf) -> Sym<ParallelConf> {
        if let Some(sym) = self.symbols.find_parallel_conf(&parallel_conf) {
            return sym;
        }
        // 并行描述符号一条指令完成，不经过 NewSymbol
        let symbol_id = self.id_gen.new_symbol_id();
        self.instructions.push(
            Instruction::new("NewParallelDescSymbol").operand(Operand::Int64(symbol_id)),
        );
        self.symbol_buf.push(EagerSymbol {
            symbol_id,
            payload: SymbolPayload::ParallelConf(parallel_conf.clone()),
        });
        self.symbols.insert_parallel_conf(symbol_id, parallel_conf)
    }

    pub fn get_scope_symbol(&mut self, scope_conf: ScopeConf) -> Sym<ScopeConf> {
        if let Some(sym) = self.symbols.find_scope(&scope_conf) {
            return sym;
        }
        let symbol_id = self.new_symbol_id();
        self.init_symbol(
            "InitScopeSymbol",
            symbol_id,
            SymbolPayload::Scope(scope_conf.clone()),
        );
        self.symbols.insert_scope(symbol_id, scope_conf)
    }

    fn get_op_conf_symbol(&mut self, op_conf: &OperatorConf) -> Sym<OperatorConf> {
        if let Some(sym) = self.symbols.find_op_conf(op_conf) {
            return sym;
        }
        let symbol_id = self.new_symbol_id();
        self.init_symbol(
            "InitOperatorConfSymbol",
            symbol_id,
            SymbolPayload::OpConf(op_conf.clone()),
        );
        self.symbols.insert_op_conf(symbol_id, op_conf.clone())
    }

    fn get_op_node_signature_symbol(&mut self, op_attribute: &OpAttribute) -> Sym<OpNodeSignature> {
        let op_node_signature = op_attribute.op_node_signature();
        if let Some(sym) = self.symbols.find_op_node_signature(&op_node_signature) {
            return sym;
        }
        let symbol_id = self.new_symbol_id();
        self.init_symbol(
            "InitOpNodeSignatureDescSymbol",
            symbol_id,
            SymbolPayload::OpNodeSignature(op_node_signature.clone()),
        );
        self.symbols
            .insert_op_node_signature(symbol_id, op_node_signature)
    }

    fn init_symbol(&mut self, instr_type_name: &str, symbol_id: symbol_id, payload: SymbolPayload) {
        self.instructions
            .push(Instruction::new(instr_type_name).operand(Operand::InitSymbol(symbol_id)));
        self.symbol_buf.push(EagerSymbol { symbol_id, payload });
    }

    fn new_symbol_id(&mut self) -> symbol_id {
        let symbol_id = self.id_gen.new_symbol_id();
        self.instructions
            .push(Instruction::new("NewSymbol").operand(Operand::Int64(symbol_id)));
        symbol_id
    }

    fn new_object_id(&mut self, parallel_desc: &Sym<ParallelConf>) -> object_id {
        let object_id = self.id_gen.new_object_id();
        self.instructions.push(
            Instruction::new("NewObject")
                .on_parallel_desc(parallel_desc.symbol_id())
                .operand(Operand::Int64(object_id)),
        );
        self.objects.register(object_id);
        object_id
    }
}
