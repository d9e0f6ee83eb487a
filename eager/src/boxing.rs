use crate::{BlobObject, CallError, InstructionsBuilder, OpArgParallelAttr, Sym};
use std::rc::Rc;
use vm::{DeviceTag, ParallelConf};

/// 盒变换：发出指令把张量对象转换到目标并行布局，由外部协作者实现。
///
/// 实现方可以使用构建器的全部接口，包括 `new_blob_object` 和
/// 各 `boxing_*` 调用变体。
pub trait BoxingTo {
    fn boxing_to(
        &self,
        builder: &mut InstructionsBuilder,
        blob_object: &Rc<BlobObject>,
        op_arg_parallel_attr: &OpArgParallelAttr,
    ) -> Result<Rc<BlobObject>, CallError>;
}

/// 默认实现，拒绝一切变换。
pub struct DenyBoxing;

impl BoxingTo for DenyBoxing {
    fn boxing_to(
        &self,
        _builder: &mut InstructionsBuilder,
        _blob_object: &Rc<BlobObject>,
        _op_arg_parallel_attr: &OpArgParallelAttr,
    ) -> Result<Rc<BlobObject>, CallError> {
        Err(CallError::BoxingUnsupported)
    }
}

/// 同样的设备集合换一个设备标签；标签已一致时原样返回。
pub fn try_replace_device_tag(
    builder: &mut InstructionsBuilder,
    parallel_desc: &Sym<ParallelConf>,
    device_tag: DeviceTag,
) -> Sym<ParallelConf> {
    if parallel_desc.device_tag == device_tag {
        return parallel_desc.clone();
    }
    builder.get_parallel_desc_symbol(ParallelConf {
        device_tag,
        devices: parallel_desc.devices.clone(),
    })
}
