use crate::{OpNodeSignature, device_id, machine_id, symbol_id};
use digit_layout::DigitLayout;
use std::collections::BTreeMap;

/// 设备类别标签，限定指令由哪类引擎执行。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DeviceTag {
    Cpu,
    Gpu,
}

impl DeviceTag {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        }
    }
}

/// 并行放置描述：设备标签 + 机器到设备列表的有序映射。
///
/// `parallel_num == 1` 时恰好命名一个（机器，设备）对。
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ParallelConf {
    pub device_tag: DeviceTag,
    pub devices: BTreeMap<machine_id, Vec<device_id>>,
}

impl ParallelConf {
    /// 单个具体设备的放置。
    pub fn device(device_tag: DeviceTag, machine: machine_id, device: device_id) -> Self {
        Self {
            device_tag,
            devices: BTreeMap::from([(machine, vec![device])]),
        }
    }

    pub fn parallel_num(&self) -> usize {
        self.devices.values().map(|devices| devices.len()).sum()
    }

    pub fn device_pairs(&self) -> impl Iterator<Item = (machine_id, device_id)> + '_ {
        self.devices
            .iter()
            .flat_map(|(&machine, devices)| devices.iter().map(move |&device| (machine, device)))
    }

    pub fn sole_device_pair(&self) -> (machine_id, device_id) {
        assert_eq!(self.parallel_num(), 1);
        self.device_pairs().next().unwrap()
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct JobConf {
    pub name: String,
}

/// 算子配置，携带作用域引用和用户/系统判别。
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct OperatorConf {
    pub name: String,
    pub scope_symbol_id: Option<symbol_id>,
    pub conf: OpConfType,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum OpConfType {
    User { op_type_name: String },
    System { op_type_name: String },
}

impl OperatorConf {
    pub fn is_user_op(&self) -> bool {
        matches!(self.conf, OpConfType::User { .. })
    }
}

/// 作用域：引用父作用域构成一棵树，
/// 为作用域内的算子解析任务配置和设备放置。
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ScopeConf {
    pub job_desc_symbol_id: symbol_id,
    pub parent_scope_symbol_id: Option<symbol_id>,
    pub device_parallel_conf: ParallelConf,
}

/// 张量静态元信息。
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct BlobDesc {
    pub dt: DigitLayout,
    pub shape: Box<[usize]>,
}

/// 参数级分布策略。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SbpParallel {
    Broadcast,
    Split(usize),
    PartialSum,
}

/// 符号载荷，六种之一。
#[derive(Clone, Debug)]
pub enum SymbolPayload {
    String(String),
    ParallelConf(ParallelConf),
    JobConf(JobConf),
    OpConf(OperatorConf),
    OpNodeSignature(OpNodeSignature),
    Scope(ScopeConf),
}

/// 符号缓冲区记录，与符号定义指令成对出现。
#[derive(Clone, Debug)]
pub struct EagerSymbol {
    pub symbol_id: symbol_id,
    pub payload: SymbolPayload,
}
