use crate::{CallError, Sym};
use vm::{BlobDesc, OpAttribute, ParallelConf, SbpParallel};

/// 参数级分布策略：sbp 之一，或逐副本独立的镜像。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ArgDistribute {
    Broadcast,
    Split(usize),
    PartialSum,
    Mirrored,
}

impl From<SbpParallel> for ArgDistribute {
    fn from(sbp: SbpParallel) -> Self {
        match sbp {
            SbpParallel::Broadcast => Self::Broadcast,
            SbpParallel::Split(axis) => Self::Split(axis),
            SbpParallel::PartialSum => Self::PartialSum,
        }
    }
}

/// 参数的并行属性：放置 + 分布策略。
#[derive(Clone, Debug)]
pub struct OpArgParallelAttr {
    pub parallel_desc: Sym<ParallelConf>,
    pub distribute: ArgDistribute,
}

impl PartialEq for OpArgParallelAttr {
    fn eq(&self, other: &Self) -> bool {
        self.parallel_desc == other.parallel_desc && self.distribute == other.distribute
    }
}

impl Eq for OpArgParallelAttr {}

impl OpArgParallelAttr {
    pub fn new(parallel_desc: Sym<ParallelConf>, distribute: ArgDistribute) -> Self {
        Self {
            parallel_desc,
            distribute,
        }
    }

    pub fn broadcast(parallel_desc: Sym<ParallelConf>) -> Self {
        Self::new(parallel_desc, ArgDistribute::Broadcast)
    }

    pub fn mirrored(parallel_desc: Sym<ParallelConf>) -> Self {
        Self::new(parallel_desc, ArgDistribute::Mirrored)
    }

    /// 按绑定名从算子描述中解出参数的分布策略。
    pub fn for_arg(
        parallel_desc: &Sym<ParallelConf>,
        op_attribute: &OpAttribute,
        bn: &str,
    ) -> Result<Self, CallError> {
        let &sbp = op_attribute
            .sbp_signature
            .get(bn)
            .ok_or_else(|| CallError::MissingSbpSignature(bn.into()))?;
        Ok(Self::new(parallel_desc.clone(), sbp.into()))
    }
}

/// 参数的静态属性：元信息 + 逻辑名。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OpArgBlobAttr {
    pub blob_desc: BlobDesc,
    pub logical_blob_name: String,
}

impl OpArgBlobAttr {
    pub fn for_arg(op_attribute: &OpAttribute, bn: &str) -> Result<Self, CallError> {
        let blob_desc = op_attribute
            .blob_desc_signature
            .get(bn)
            .cloned()
            .ok_or_else(|| CallError::MissingBlobDesc(bn.into()))?;
        let logical_blob_name = op_attribute
            .lbn_signature
            .get(bn)
            .cloned()
            .unwrap_or_else(|| format!("{}/{bn}", op_attribute.op_conf.name));
        Ok(Self {
            blob_desc,
            logical_blob_name,
        })
    }
}
