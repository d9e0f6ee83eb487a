mod blob_cache;
mod boxing;
mod builder;
mod callback;
mod error;
mod id;
mod object;
mod op_arg;
mod session;
mod symbol;

pub use boxing::{BoxingTo, DenyBoxing, try_replace_device_tag};
pub use builder::{BlobBindings, InstructionsBuilder};
pub use callback::{CallbackRegistry, ForeignCallback};
pub use error::CallError;
pub use object::{BlobObject, Object, OpKernelObject};
pub use op_arg::{ArgDistribute, OpArgBlobAttr, OpArgParallelAttr};
pub use session::Session;
pub use symbol::Sym;

#[cfg(test)]
mod test;
