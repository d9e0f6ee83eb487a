use crate::{OpArgBlobAttr, OpArgParallelAttr, Sym};
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    ops::Deref,
    rc::Rc,
};
use vm::{OperatorConf, ParallelConf, object_id, symbol_id};

/// 对象句柄释放时入列的记录，在下一个构建轮次补发删除指令。
#[derive(Clone, Copy, Debug)]
pub(crate) struct Released {
    pub object_id: object_id,
    pub parallel_desc_symbol_id: symbol_id,
}

pub(crate) type ReleaseQueue = Rc<RefCell<Vec<Released>>>;

/// 虚拟机中的活跃对象。
///
/// 释放回调恰好触发一次：要么句柄析构时，要么显式删除时解除。
pub struct Object {
    object_id: object_id,
    parallel_desc: Sym<ParallelConf>,
    release: RefCell<Option<ReleaseQueue>>,
}

impl Object {
    pub(crate) fn new(
        object_id: object_id,
        parallel_desc: Sym<ParallelConf>,
        release: Option<ReleaseQueue>,
    ) -> Self {
        Self {
            object_id,
            parallel_desc,
            release: RefCell::new(release),
        }
    }

    pub fn object_id(&self) -> object_id {
        self.object_id
    }

    pub fn parallel_desc(&self) -> &Sym<ParallelConf> {
        &self.parallel_desc
    }

    pub(crate) fn disarm(&self) {
        self.release.borrow_mut().take();
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if let Some(queue) = self.release.borrow_mut().take() {
            queue.borrow_mut().push(Released {
                object_id: self.object_id,
                parallel_desc_symbol_id: self.parallel_desc.symbol_id(),
            })
        }
    }
}

/// 张量对象：身份 + 并行属性 + 静态属性，不含数据。
pub struct BlobObject {
    object: Object,
    pub op_arg_parallel_attr: OpArgParallelAttr,
    pub op_arg_blob_attr: OpArgBlobAttr,
}

impl BlobObject {
    pub(crate) fn new(
        object: Object,
        op_arg_parallel_attr: OpArgParallelAttr,
        op_arg_blob_attr: OpArgBlobAttr,
    ) -> Self {
        Self {
            object,
            op_arg_parallel_attr,
            op_arg_blob_attr,
        }
    }
}

impl Deref for BlobObject {
    type Target = Object;

    fn deref(&self) -> &Self::Target {
        &self.object
    }
}

/// 实例化的有状态算子内核，绑定到一个放置描述，可跨调用复用。
pub struct OpKernelObject {
    object: Object,
    pub op_conf: OperatorConf,
}

impl OpKernelObject {
    pub(crate) fn new(object: Object, op_conf: OperatorConf) -> Self {
        Self { object, op_conf }
    }
}

impl Deref for OpKernelObject {
    type Target = Object;

    fn deref(&self) -> &Self::Target {
        &self.object
    }
}

/// 对象表：活跃编号集合 + 按放置符号缓存的共享内核对象。
#[derive(Default)]
pub(crate) struct ObjectStorage {
    live: HashSet<object_id>,
    shared_opkernel: HashMap<symbol_id, Rc<Object>>,
}

impl ObjectStorage {
    pub fn register(&mut self, object_id: object_id) {
        assert!(self.live.insert(object_id))
    }

    pub fn remove(&mut self, object_id: object_id) -> bool {
        self.live.remove(&object_id)
    }

    pub fn contains(&self, object_id: object_id) -> bool {
        self.live.contains(&object_id)
    }

    pub fn shared_opkernel(&self, parallel_desc_symbol_id: symbol_id) -> Option<Rc<Object>> {
        self.shared_opkernel.get(&parallel_desc_symbol_id).cloned()
    }

    pub fn cache_shared_opkernel(
        &mut self,
        parallel_desc_symbol_id: symbol_id,
        object: Rc<Object>,
    ) {
        assert!(
            self.shared_opkernel
                .insert(parallel_desc_symbol_id, object)
                .is_none()
        )
    }
}
