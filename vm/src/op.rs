use crate::{BlobDesc, OperatorConf, SbpParallel, symbol_id};
use std::collections::BTreeMap;

/// 一次算子调用的完整描述，由外部的配置推导层提供。
///
/// 绑定名（bn）在算子内部标识每个输入/输出参数；
/// 各签名按绑定名给出分布策略、静态元信息和放置覆盖。
#[derive(Clone, Debug)]
pub struct OpAttribute {
    pub op_conf: OperatorConf,
    pub input_bns: Vec<String>,
    pub output_bns: Vec<String>,
    pub tmp_bns: Vec<String>,
    pub arg_modifier: ArgModifierSignature,
    pub sbp_signature: BTreeMap<String, SbpParallel>,
    pub blob_desc_signature: BTreeMap<String, BlobDesc>,
    pub lbn_signature: BTreeMap<String, String>,
    pub parallel_signature: ParallelSignature,
}

#[derive(Clone, Default, Debug)]
pub struct ArgModifierSignature {
    pub ibn2is_mutable: BTreeMap<String, bool>,
    pub obn2header_infered_before_compute: BTreeMap<String, bool>,
}

#[derive(Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct ParallelSignature {
    pub op_parallel_desc_symbol_id: Option<symbol_id>,
    pub bn2parallel_desc_symbol_id: BTreeMap<String, symbol_id>,
}

impl OpAttribute {
    pub fn input_is_mutable(&self, ibn: &str) -> bool {
        self.arg_modifier
            .ibn2is_mutable
            .get(ibn)
            .copied()
            .unwrap_or(false)
    }

    pub fn output_header_infered(&self, obn: &str) -> bool {
        self.arg_modifier
            .obn2header_infered_before_compute
            .get(obn)
            .copied()
            .unwrap_or(false)
    }

    /// 摘出驻留为签名符号的部分。
    pub fn op_node_signature(&self) -> OpNodeSignature {
        OpNodeSignature {
            sbp_signature: self.sbp_signature.clone(),
            blob_desc_signature: self.blob_desc_signature.clone(),
            parallel_signature: self.parallel_signature.clone(),
        }
    }
}

/// 算子节点签名，内容寻址驻留，供虚拟机侧重建算子的参数布局。
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct OpNodeSignature {
    pub sbp_signature: BTreeMap<String, SbpParallel>,
    pub blob_desc_signature: BTreeMap<String, BlobDesc>,
    pub parallel_signature: ParallelSignature,
}
