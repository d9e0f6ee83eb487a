use crate::{ArgDistribute, BlobObject, OpArgParallelAttr};
use std::{collections::HashMap, rc::Rc};
use vm::{object_id, symbol_id};

type DelegateKey = (symbol_id, ArgDistribute);

/// 按源对象记忆盒变换结果。
///
/// 条目随源对象存活，源对象删除时整体逐出。
#[derive(Default)]
pub(crate) struct BlobCache(HashMap<object_id, HashMap<DelegateKey, Rc<BlobObject>>>);

impl BlobCache {
    pub fn find(&self, src: object_id, attr: &OpArgParallelAttr) -> Option<Rc<BlobObject>> {
        self.0.get(&src)?.get(&Self::key(attr)).cloned()
    }

    pub fn insert(&mut self, src: object_id, attr: &OpArgParallelAttr, delegate: Rc<BlobObject>) {
        assert!(
            self.0
                .entry(src)
                .or_default()
                .insert(Self::key(attr), delegate)
                .is_none()
        )
    }

    pub fn evict(&mut self, src: object_id) {
        self.0.remove(&src);
    }

    fn key(attr: &OpArgParallelAttr) -> DelegateKey {
        (attr.parallel_desc.symbol_id(), attr.distribute)
    }
}
