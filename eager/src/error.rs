use vm::{DeviceTag, object_id, symbol_id};

/// 构建期的先决条件违背。
///
/// 任何一条都发生在所属调用的指令入列之前，缓冲区保持完好，
/// 本层不做重试。
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CallError {
    MissingBinding(String),
    MissingSbpSignature(String),
    MissingBlobDesc(String),
    MissingScope,
    MissingParallelSignature,
    UnknownSymbol(symbol_id),
    UnknownInterfaceOp(String),
    /// 可变输入的放置必须与算子解析出的放置一致，不做盒变换。
    RefParallelDescMismatch(String),
    ParallelDescMismatch {
        expected: symbol_id,
        actual: symbol_id,
    },
    DeviceTagMismatch {
        expected: DeviceTag,
        actual: DeviceTag,
    },
    DevicePairsMismatch,
    NotPhysical(object_id),
    MultiDeviceBroadcastSource,
    NotUserOp(String),
    SoleOutputExpected(String),
    DeadObject(object_id),
    BoxingUnsupported,
}
