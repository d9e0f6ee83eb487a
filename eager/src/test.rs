use crate::{
    ArgDistribute, BlobBindings, BlobObject, BoxingTo, CallError, InstructionsBuilder,
    OpArgBlobAttr, OpArgParallelAttr, Session,
};
use digit_layout::types;
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    rc::Rc,
};
use test_vm::{Run, TestVM};
use vm::{
    ArgModifierSignature, BlobDesc, DeviceTag, Instruction, JobConf, OpAttribute, OpConfType,
    Operand, OperatorConf, ParallelConf, RunContext, SbpParallel, ScopeConf, SymbolPayload,
    symbol_id,
};

fn sole_conf() -> ParallelConf {
    ParallelConf::device(DeviceTag::Cpu, 0, 0)
}

fn blob_desc() -> BlobDesc {
    BlobDesc {
        dt: types::F32,
        shape: [2, 2].into(),
    }
}

fn scope_symbol(builder: &mut InstructionsBuilder, device_parallel_conf: ParallelConf) -> symbol_id {
    let job = builder.get_job_conf_symbol(JobConf {
        name: "test-job".into(),
    });
    builder
        .get_scope_symbol(ScopeConf {
            job_desc_symbol_id: job.symbol_id(),
            parent_scope_symbol_id: None,
            device_parallel_conf,
        })
        .symbol_id()
}

/// inputs: (绑定名, 是否可变); outputs: (绑定名, 布局是否先于计算可知)
fn op_attribute(
    name: &str,
    scope_symbol_id: symbol_id,
    inputs: &[(&str, bool)],
    outputs: &[(&str, bool)],
) -> OpAttribute {
    let mut arg_modifier = ArgModifierSignature::default();
    let mut sbp_signature = BTreeMap::new();
    let mut blob_desc_signature = BTreeMap::new();
    let mut lbn_signature = BTreeMap::new();
    for &(bn, is_mutable) in inputs {
        arg_modifier.ibn2is_mutable.insert(bn.into(), is_mutable);
        sbp_signature.insert(bn.into(), SbpParallel::Broadcast);
        blob_desc_signature.insert(bn.into(), blob_desc());
        lbn_signature.insert(bn.into(), format!("{name}/{bn}"));
    }
    for &(bn, header_infered) in outputs {
        arg_modifier
            .obn2header_infered_before_compute
            .insert(bn.into(), header_infered);
        sbp_signature.insert(bn.into(), SbpParallel::Broadcast);
        blob_desc_signature.insert(bn.into(), blob_desc());
        lbn_signature.insert(bn.into(), format!("{name}/{bn}"));
    }
    OpAttribute {
        op_conf: OperatorConf {
            name: name.into(),
            scope_symbol_id: Some(scope_symbol_id),
            conf: OpConfType::User {
                op_type_name: "relu".into(),
            },
        },
        input_bns: inputs.iter().map(|&(bn, _)| bn.into()).collect(),
        output_bns: outputs.iter().map(|&(bn, _)| bn.into()).collect(),
        tmp_bns: Vec::new(),
        arg_modifier,
        sbp_signature,
        blob_desc_signature,
        lbn_signature,
        parallel_signature: Default::default(),
    }
}

fn source_blob(builder: &mut InstructionsBuilder, parallel_conf: ParallelConf) -> Rc<BlobObject> {
    let parallel_desc = builder.get_parallel_desc_symbol(parallel_conf);
    builder.new_blob_object(
        OpArgParallelAttr::broadcast(parallel_desc),
        OpArgBlobAttr {
            blob_desc: blob_desc(),
            logical_blob_name: "source/out".into(),
        },
    )
}

fn operand_groups(instruction: &Instruction) -> Vec<Vec<Operand>> {
    let mut groups = vec![Vec::new()];
    for &operand in &instruction.operands {
        match operand {
            Operand::Separator => groups.push(Vec::new()),
            operand => groups.last_mut().unwrap().push(operand),
        }
    }
    groups
}

fn symbol_id_of(run: &Run, pred: impl Fn(&SymbolPayload) -> bool) -> symbol_id {
    run.symbols
        .iter()
        .find(|symbol| pred(&symbol.payload))
        .unwrap()
        .symbol_id
}

#[derive(Default)]
struct CountingBoxing(RefCell<usize>);

impl BoxingTo for CountingBoxing {
    fn boxing_to(
        &self,
        builder: &mut InstructionsBuilder,
        blob_object: &Rc<BlobObject>,
        op_arg_parallel_attr: &OpArgParallelAttr,
    ) -> Result<Rc<BlobObject>, CallError> {
        *self.0.borrow_mut() += 1;
        Ok(builder.new_blob_object(
            op_arg_parallel_attr.clone(),
            blob_object.op_arg_blob_attr.clone(),
        ))
    }
}

#[test]
fn string_symbol_interning_is_idempotent() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let a = builder.get_string_symbol("in_0");
            let b = builder.get_string_symbol("in_0");
            assert_eq!(a.symbol_id(), b.symbol_id());
            Ok(())
        })
        .unwrap();
    session
        .logical_run(&vm, |builder| {
            builder.get_string_symbol("in_0");
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("NewSymbol"), 1);
    assert_eq!(vm.count("InitStringSymbol"), 1);
}

#[test]
fn scope_symbol_reinterning_emits_nothing() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let a = scope_symbol(builder, sole_conf());
            let b = scope_symbol(builder, sole_conf());
            assert_eq!(a, b);
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("InitJobDescSymbol"), 1);
    assert_eq!(vm.count("InitScopeSymbol"), 1);
}

#[test]
fn object_ids_are_unique_and_increasing() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let ids = (0..8)
                .map(|_| source_blob(builder, sole_conf()).object_id())
                .collect::<Vec<_>>();
            assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("NewObject"), 8);
}

#[test]
fn logical_and_physical_ids_do_not_collide() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let mut logical_id = 0;
    session
        .logical_run(&vm, |builder| {
            logical_id = source_blob(builder, sole_conf()).object_id();
            Ok(())
        })
        .unwrap();
    let mut physical_id = 0;
    session
        .physical_run(&vm, |builder| {
            physical_id = source_blob(builder, sole_conf()).object_id();
            Ok(())
        })
        .unwrap();
    assert_ne!(logical_id, physical_id);
    assert!(logical_id < 1 << 40);
    assert!(physical_id > 1 << 40);
    assert_eq!(vm.nth_run(0).ctx, RunContext::Logical);
    assert_eq!(vm.nth_run(1).ctx, RunContext::Physical);
}

#[test]
fn delegate_short_circuits_on_equal_attr() {
    let boxing = Rc::new(CountingBoxing::default());
    let vm = TestVM::default();
    let mut session = Session::new(boxing.clone());
    session
        .logical_run(&vm, |builder| {
            let blob = source_blob(builder, sole_conf());
            let delegate = builder.get_or_create_delegate(&blob, &blob.op_arg_parallel_attr)?;
            assert!(Rc::ptr_eq(&blob, &delegate));
            Ok(())
        })
        .unwrap();
    assert_eq!(*boxing.0.borrow(), 0);
    // 只有建源对象的两条指令，委托没有发任何指令
    assert_eq!(vm.nth_run(0).instructions.len(), 2);
    assert_eq!(vm.count("NewParallelDescSymbol"), 1);
    assert_eq!(vm.count("NewObject"), 1);
}

#[test]
fn delegate_is_memoized_per_source_and_target() {
    let boxing = Rc::new(CountingBoxing::default());
    let vm = TestVM::default();
    let mut session = Session::new(boxing.clone());
    session
        .logical_run(&vm, |builder| {
            let blob = source_blob(builder, sole_conf());
            let parallel_desc = builder.get_parallel_desc_symbol(sole_conf());
            let target = OpArgParallelAttr::new(parallel_desc, ArgDistribute::Split(0));
            let a = builder.get_or_create_delegate(&blob, &target)?;
            assert!(!Rc::ptr_eq(&blob, &a));
            let b = builder.get_or_create_delegate(&blob, &target)?;
            assert!(Rc::ptr_eq(&a, &b));
            Ok(())
        })
        .unwrap();
    assert_eq!(*boxing.0.borrow(), 1);
}

#[test]
fn unpack_reverses_pack_placements() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let physical = [(0, 0), (0, 1), (1, 0)].map(|(machine, device)| {
                source_blob(builder, ParallelConf::device(DeviceTag::Cpu, machine, device))
            });
            let parallel_desc = builder.get_parallel_desc_symbol(ParallelConf {
                device_tag: DeviceTag::Cpu,
                devices: BTreeMap::from([(0, vec![0, 1]), (1, vec![0])]),
            });
            let logical = builder.pack_physical_blobs_to_logical_blob(
                &physical,
                OpArgParallelAttr::broadcast(parallel_desc),
                physical[0].op_arg_blob_attr.clone(),
            )?;
            let unpacked = builder.unpack_logical_blob_to_physical_blobs(&logical);

            let mut original = physical
                .iter()
                .map(|blob| blob.parallel_desc().sole_device_pair())
                .collect::<Vec<_>>();
            let mut roundtrip = unpacked
                .iter()
                .map(|blob| blob.parallel_desc().sole_device_pair())
                .collect::<Vec<_>>();
            original.sort();
            roundtrip.sort();
            assert_eq!(original, roundtrip);
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("ReplaceMirrored"), 2);
}

#[test]
fn pack_requires_exact_device_cover() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let physical = [source_blob(builder, sole_conf())];
            let parallel_desc = builder.get_parallel_desc_symbol(ParallelConf {
                device_tag: DeviceTag::Cpu,
                devices: BTreeMap::from([(0, vec![0, 1])]),
            });
            let result = builder.pack_physical_blobs_to_logical_blob(
                &physical,
                OpArgParallelAttr::broadcast(parallel_desc),
                physical[0].op_arg_blob_attr.clone(),
            );
            assert_eq!(result.err(), Some(CallError::DevicePairsMismatch));
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("ReplaceMirrored"), 0);
}

#[test]
fn outputs_classify_into_mut1_and_mut2_groups() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let mut captured = None;
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let op = op_attribute(
                "op",
                scope,
                &[("in_0", false)],
                &[("out_a", true), ("out_b", false)],
            );
            let mut bindings =
                HashMap::from([("in_0".to_string(), source_blob(builder, sole_conf()))]);
            builder.stateless_call(&op, sole_conf(), &mut bindings)?;
            captured = Some((
                bindings["out_a"].object_id(),
                bindings["out_b"].object_id(),
                bindings,
            ));
            Ok(())
        })
        .unwrap();
    let (out_a, out_b, _bindings) = captured.unwrap();
    let run = vm.nth_run(0);
    let dispatch = run
        .instructions
        .iter()
        .find(|i| i.instr_type_name == "cpu.compute.UserStatelessCallOpKernel")
        .unwrap();
    let groups = operand_groups(dispatch);
    let [_head, _consts, mut1, mut2] = &groups[..] else {
        panic!("{dispatch}")
    };
    assert!(mut1.contains(&Operand::Mut(out_a)));
    assert!(!mut1.iter().any(|op| matches!(op, Operand::Mut(id) | Operand::Mut2(id) if *id == out_b)));
    assert!(mut2.contains(&Operand::Mut2(out_b)));
    assert!(!mut2.iter().any(|op| matches!(op, Operand::Mut(id) | Operand::Mut2(id) if *id == out_a)));
}

#[test]
fn stateless_call_emits_the_wire_layout() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let mut captured = None;
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let op = op_attribute("op", scope, &[("in_0", false)], &[("out_0", true)]);
            let in_blob = source_blob(builder, sole_conf());
            let in_id = in_blob.object_id();
            let mut bindings = HashMap::from([("in_0".to_string(), in_blob)]);
            builder.stateless_call(&op, sole_conf(), &mut bindings)?;
            captured = Some((in_id, bindings["out_0"].object_id(), bindings));
            Ok(())
        })
        .unwrap();
    let (in_id, out_id, _bindings) = captured.unwrap();
    let run = vm.nth_run(0);

    // 调用只新建了内核和输出两个对象
    let new_objects = run
        .instructions
        .iter()
        .filter(|i| i.instr_type_name == "NewObject")
        .map(|i| match i.operands[..] {
            [Operand::Int64(id)] => id,
            _ => panic!("{i}"),
        })
        .collect::<Vec<_>>();
    let [first, kernel_id, last] = new_objects[..] else {
        panic!("{new_objects:?}")
    };
    assert_eq!(first, in_id);
    assert_eq!(last, out_id);

    let job = symbol_id_of(&run, |p| matches!(p, SymbolPayload::JobConf(_)));
    let op_conf = symbol_id_of(&run, |p| matches!(p, SymbolPayload::OpConf(_)));
    let signature = symbol_id_of(&run, |p| matches!(p, SymbolPayload::OpNodeSignature(_)));
    let in_sym = symbol_id_of(&run, |p| matches!(p, SymbolPayload::String(s) if s == "in_0"));
    let out_sym = symbol_id_of(&run, |p| matches!(p, SymbolPayload::String(s) if s == "out_0"));
    let parallel_desc =
        symbol_id_of(&run, |p| matches!(p, SymbolPayload::ParallelConf(_)));

    let dispatch = run
        .instructions
        .iter()
        .find(|i| i.instr_type_name == "cpu.compute.UserStatelessCallOpKernel")
        .unwrap();
    assert_eq!(dispatch.parallel_desc_symbol_id, Some(parallel_desc));
    assert_eq!(
        dispatch.operands,
        [
            Operand::Symbol(job),
            Operand::Symbol(op_conf),
            Operand::Symbol(signature),
            Operand::Mut(kernel_id),
            Operand::Separator,
            Operand::Symbol(in_sym),
            Operand::Const(in_id),
            Operand::Separator,
            Operand::Symbol(out_sym),
            Operand::Mut(out_id),
            Operand::Separator,
        ],
    );
}

#[test]
fn shared_opkernel_is_reused_per_placement() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let mut bindings = BlobBindings::new();
            for name in ["op_a", "op_b"] {
                let op = op_attribute(name, scope, &[], &[("out_0", true)]);
                builder.stateless_call(&op, sole_conf(), &mut bindings)?;
            }
            Ok(())
        })
        .unwrap();
    let kernels = vm
        .instructions()
        .iter()
        .filter(|i| i.instr_type_name == "cpu.compute.UserStatelessCallOpKernel")
        .map(|i| match i.operands[3] {
            Operand::Mut(id) => id,
            ref operand => panic!("{operand}"),
        })
        .collect::<Vec<_>>();
    let [a, b] = kernels[..] else { panic!() };
    assert_eq!(a, b);
}

#[test]
fn delete_object_is_two_phase_and_invalidates_the_id() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let mut kept = None;
    session
        .logical_run(&vm, |builder| {
            kept = Some(source_blob(builder, sole_conf()));
            Ok(())
        })
        .unwrap();
    let blob = kept.unwrap();
    let object_id = blob.object_id();
    session
        .logical_run(&vm, |builder| builder.delete_object(&blob))
        .unwrap();
    assert_eq!(
        vm.nth_run(1)
            .instructions
            .iter()
            .map(|i| i.instr_type_name.as_str())
            .collect::<Vec<_>>(),
        ["TryClearObject", "DeleteObject"],
    );
    assert!(!session.objects.contains(object_id));
    session
        .logical_run(&vm, |builder| {
            assert_eq!(
                builder.delete_object(&blob),
                Err(CallError::DeadObject(object_id)),
            );
            Ok(())
        })
        .unwrap();
    // 显式删除过的句柄析构不再补发
    drop(blob);
    session.logical_run(&vm, |_| Ok(())).unwrap();
    assert!(vm.nth_run(3).instructions.is_empty());
}

#[test]
fn dropping_a_blob_schedules_delete_on_next_run() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let mut kept = None;
    session
        .logical_run(&vm, |builder| {
            kept = Some(source_blob(builder, sole_conf()));
            Ok(())
        })
        .unwrap();
    let object_id = kept.as_ref().unwrap().object_id();
    drop(kept);
    session.logical_run(&vm, |_| Ok(())).unwrap();
    assert_eq!(
        vm.nth_run(1)
            .instructions
            .iter()
            .map(|i| i.instr_type_name.as_str())
            .collect::<Vec<_>>(),
        ["TryClearObject", "DeleteObject"],
    );
    assert!(!session.objects.contains(object_id));
}

#[test]
fn mutable_input_with_wrong_placement_fails_fast() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let op = op_attribute("op", scope, &[("in_0", true)], &[("out_0", true)]);
            let mut bindings = HashMap::from([(
                "in_0".to_string(),
                source_blob(builder, ParallelConf::device(DeviceTag::Cpu, 1, 0)),
            )]);
            let result = builder.stateless_call(&op, sole_conf(), &mut bindings);
            assert_eq!(
                result,
                Err(CallError::RefParallelDescMismatch("in_0".into())),
            );
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("cpu.compute.UserStatelessCallOpKernel"), 0);
    // 只有可变输入的源对象被创建过
    assert_eq!(vm.count("NewObject"), 1);
}

#[test]
fn missing_binding_fails_before_any_emission() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let op = op_attribute("op", scope, &[("in_0", false)], &[("out_0", true)]);
            let result = builder.stateless_call(&op, sole_conf(), &mut BlobBindings::new());
            assert_eq!(result, Err(CallError::MissingBinding("in_0".into())));
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("cpu.compute.UserStatelessCallOpKernel"), 0);
    assert_eq!(vm.count("NewObject"), 0);
}

#[test]
fn stateful_call_uses_the_kernel_and_signature_layout() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let mut captured = None;
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let mut op = op_attribute("stateful", scope, &[("in_0", false)], &[("out_0", true)]);
            let kernel = builder.new_op_kernel_object(op.op_conf.clone())?;
            op.parallel_signature.op_parallel_desc_symbol_id =
                Some(kernel.parallel_desc().symbol_id());

            let in_blob = source_blob(builder, sole_conf());
            let in_id = in_blob.object_id();
            let mut bindings = HashMap::from([("in_0".to_string(), in_blob)]);
            builder.stateful_call(&op, &kernel, &mut bindings)?;
            captured = Some((
                kernel.object_id(),
                in_id,
                bindings["out_0"].object_id(),
                kernel,
                bindings,
            ));
            Ok(())
        })
        .unwrap();
    let (kernel_id, in_id, out_id, _kernel, _bindings) = captured.unwrap();
    let run = vm.nth_run(0);
    let signature = symbol_id_of(&run, |p| matches!(p, SymbolPayload::OpNodeSignature(_)));
    let in_sym = symbol_id_of(&run, |p| matches!(p, SymbolPayload::String(s) if s == "in_0"));
    let out_sym = symbol_id_of(&run, |p| matches!(p, SymbolPayload::String(s) if s == "out_0"));
    let dispatch = run
        .instructions
        .iter()
        .find(|i| i.instr_type_name == "cpu.CallOpKernel")
        .unwrap();
    assert_eq!(
        dispatch.operands,
        [
            Operand::Mut(kernel_id),
            Operand::Symbol(signature),
            Operand::Separator,
            Operand::Symbol(in_sym),
            Operand::Const(in_id),
            Operand::Separator,
            Operand::Symbol(out_sym),
            Operand::Mut(out_id),
            Operand::Separator,
        ],
    );
    assert_eq!(vm.count("InitOpKernelObject"), 1);
}

#[test]
fn stateful_call_rejects_bad_preconditions() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let mut op = op_attribute("stateful", scope, &[], &[("out_0", true)]);
            let kernel = builder.new_op_kernel_object(op.op_conf.clone())?;

            // 签名缺并行放置
            assert_eq!(
                builder.stateful_call(&op, &kernel, &mut BlobBindings::new()),
                Err(CallError::MissingParallelSignature),
            );

            // 签名指向另一个放置
            let other = builder
                .get_parallel_desc_symbol(ParallelConf::device(DeviceTag::Cpu, 1, 0))
                .symbol_id();
            op.parallel_signature.op_parallel_desc_symbol_id = Some(other);
            assert_eq!(
                builder.stateful_call(&op, &kernel, &mut BlobBindings::new()),
                Err(CallError::ParallelDescMismatch {
                    expected: other,
                    actual: kernel.parallel_desc().symbol_id(),
                }),
            );

            // 系统算子不可走有状态调用
            op.parallel_signature.op_parallel_desc_symbol_id =
                Some(kernel.parallel_desc().symbol_id());
            op.op_conf.conf = OpConfType::System {
                op_type_name: "variable".into(),
            };
            assert_eq!(
                builder.stateful_call(&op, &kernel, &mut BlobBindings::new()),
                Err(CallError::NotUserOp("stateful".into())),
            );
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("cpu.CallOpKernel"), 0);
}

#[test]
fn broadcast_reference_requires_sole_device_per_machine() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let target = builder.get_parallel_desc_symbol(ParallelConf {
                device_tag: DeviceTag::Cpu,
                devices: BTreeMap::from([(0, vec![0]), (1, vec![0])]),
            });

            let sole = source_blob(builder, sole_conf());
            let reference = builder.broadcast_blob_reference(&sole, &target)?;
            assert_eq!(reference.parallel_desc().symbol_id(), target.symbol_id());
            assert_eq!(
                reference.op_arg_parallel_attr.distribute,
                ArgDistribute::Broadcast,
            );

            let wide = source_blob(
                builder,
                ParallelConf {
                    device_tag: DeviceTag::Cpu,
                    devices: BTreeMap::from([(0, vec![0, 1])]),
                },
            );
            assert_eq!(
                builder.broadcast_blob_reference(&wide, &target).err(),
                Some(CallError::MultiDeviceBroadcastSource),
            );
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("BroadcastObjectReference"), 1);
}

#[test]
fn lazy_reference_resolves_interface_output() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let mut parallel_desc_id = 0;
    session
        .logical_run(&vm, |builder| {
            parallel_desc_id = builder.get_parallel_desc_symbol(sole_conf()).symbol_id();
            Ok(())
        })
        .unwrap();
    let mut op = op_attribute("iface", 0, &[], &[("out_0", true)]);
    op.parallel_signature
        .bn2parallel_desc_symbol_id
        .insert("out_0".into(), parallel_desc_id);
    session.register_interface_op_attribute("iface", op);

    let mut captured = None;
    session
        .logical_run(&vm, |builder| {
            captured = Some(builder.make_lazy_ref_blob_object("iface")?);
            Ok(())
        })
        .unwrap();
    let blob = captured.unwrap();
    let run = vm.nth_run(1);
    let lbn_sym = symbol_id_of(&run, |p| matches!(p, SymbolPayload::String(s) if s == "iface/out_0"));
    let lazy = run
        .instructions
        .iter()
        .find(|i| i.instr_type_name == "cpu.LazyReference")
        .unwrap();
    assert_eq!(lazy.parallel_desc_symbol_id, Some(parallel_desc_id));
    assert_eq!(
        lazy.operands,
        [Operand::Mut(blob.object_id()), Operand::Symbol(lbn_sym)],
    );
}

#[test]
fn fetch_registers_a_callback_and_emits_by_id() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let received = Rc::new(RefCell::new(Vec::new()));
    let mut captured = None;
    session
        .logical_run(&vm, |builder| {
            let blob = source_blob(builder, sole_conf());
            let callback = {
                let received = received.clone();
                Box::new(move |data: &[u8]| received.borrow_mut().extend_from_slice(data))
            };
            let callback_id = builder.fetch_blob_body(&blob, callback);
            captured = Some((blob, callback_id));
            Ok(())
        })
        .unwrap();
    let (blob, callback_id) = captured.unwrap();

    let fetch = vm
        .instructions()
        .into_iter()
        .find(|i| i.instr_type_name == "cpu.FetchBlobBody")
        .unwrap();
    assert_eq!(
        fetch.operands,
        [
            Operand::Const(blob.object_id()),
            Operand::Int64(callback_id),
        ],
    );

    assert!(session.callbacks().invoke(callback_id, &[1, 2, 3]));
    assert_eq!(*received.borrow(), [1, 2, 3]);
    assert!(session.callbacks().unregister(callback_id));
    assert!(!session.callbacks().invoke(callback_id, &[4]));
}

#[test]
fn cuda_copy_variants_pick_stream_and_device_tags() {
    let vm = TestVM::default();
    let mut session = Session::default();
    let gpu_conf = ParallelConf::device(DeviceTag::Gpu, 0, 0);
    let mut captured = None;
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let mut bindings = BlobBindings::new();
            let d2h = op_attribute("d2h", scope, &[], &[("out_0", true)]);
            builder.boxing_cuda_d2h_stateless_call(&d2h, gpu_conf.clone(), &mut bindings)?;
            let h2d = op_attribute("h2d", scope, &[], &[("out_1", true)]);
            builder.boxing_cuda_h2d_stateless_call(&h2d, gpu_conf.clone(), &mut bindings)?;
            captured = Some(bindings);
            Ok(())
        })
        .unwrap();
    let bindings = captured.unwrap();
    assert_eq!(vm.count("gpu.copy_d2h.UserStatelessCallOpKernel"), 1);
    assert_eq!(vm.count("gpu.copy_h2d.UserStatelessCallOpKernel"), 1);
    // 设备到主机的输出落在 cpu 放置下，主机到设备的留在 gpu 上
    assert_eq!(bindings["out_0"].parallel_desc().device_tag, DeviceTag::Cpu);
    assert_eq!(bindings["out_1"].parallel_desc().device_tag, DeviceTag::Gpu);
}

#[test]
fn symbol_definitions_stay_in_lockstep_with_the_buffer() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let scope = scope_symbol(builder, sole_conf());
            let op = op_attribute("op", scope, &[("in_0", false)], &[("out_0", false)]);
            let mut bindings =
                HashMap::from([("in_0".to_string(), source_blob(builder, sole_conf()))]);
            builder.stateless_call(&op, sole_conf(), &mut bindings)?;
            Ok(())
        })
        .unwrap();
    let run = vm.nth_run(0);
    let defined = run
        .instructions
        .iter()
        .filter_map(|instruction| match &*instruction.instr_type_name {
            "NewParallelDescSymbol" => match instruction.operands[..] {
                [Operand::Int64(id)] => Some(id),
                _ => panic!("{instruction}"),
            },
            name if name.starts_with("Init") && name.ends_with("Symbol") => {
                match instruction.operands[..] {
                    [Operand::InitSymbol(id)] => Some(id),
                    _ => None,
                }
            }
            _ => None,
        })
        .collect::<Vec<_>>();
    let buffered = run
        .symbols
        .iter()
        .map(|symbol| symbol.symbol_id)
        .collect::<Vec<_>>();
    assert_eq!(defined, buffered);
}

#[test]
fn reference_aliases_share_placement_and_replace_mirrored() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let blob = source_blob(builder, sole_conf());
            let reference = builder
                .make_reference_blob_object(&blob, blob.op_arg_parallel_attr.clone())?;
            assert_ne!(reference.object_id(), blob.object_id());

            let other = builder.get_parallel_desc_symbol(ParallelConf::device(DeviceTag::Cpu, 1, 0));
            assert_eq!(
                builder
                    .make_reference_blob_object(&blob, OpArgParallelAttr::broadcast(other.clone()))
                    .err(),
                Some(CallError::ParallelDescMismatch {
                    expected: other.symbol_id(),
                    actual: blob.parallel_desc().symbol_id(),
                }),
            );

            let feed_id = builder.feed_blob(&reference, Box::new(|_| {}));
            let feed = builder.feed_blob(&reference, Box::new(|_| {}));
            assert_ne!(feed_id, feed);
            Ok(())
        })
        .unwrap();
    assert_eq!(vm.count("ReplaceMirrored"), 1);
    assert_eq!(vm.count("cpu.FeedBlob"), 2);
}

#[test]
fn cuda_host_pin_brackets_the_scope() {
    let vm = TestVM::default();
    let mut session = Session::default();
    session
        .logical_run(&vm, |builder| {
            let blob = source_blob(builder, sole_conf());
            builder.cuda_host_pin_blob(&blob, |builder| {
                builder.remove_foreign_callback(blob.object_id(), 7);
            });
            Ok(())
        })
        .unwrap();
    let names = vm.nth_run(0).instructions[2..]
        .iter()
        .map(|i| i.instr_type_name.clone())
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        [
            "CudaHostRegisterBlob",
            "RemoveForeignCallback",
            "CudaHostUnregisterBlob",
        ],
    );
}
