use std::collections::HashMap;

pub type ForeignCallback = Box<dyn FnMut(&[u8])>;

/// 进程级回调表。
///
/// 指令以编号引用回调，虚拟机就绪时按编号带外调用，
/// 这是本层唯一的结果回传通道。
#[derive(Default)]
pub struct CallbackRegistry {
    next_id: i64,
    table: HashMap<i64, ForeignCallback>,
}

impl CallbackRegistry {
    pub fn register(&mut self, callback: ForeignCallback) -> i64 {
        self.next_id += 1;
        assert!(self.table.insert(self.next_id, callback).is_none());
        self.next_id
    }

    pub fn invoke(&mut self, id: i64, data: &[u8]) -> bool {
        match self.table.get_mut(&id) {
            Some(callback) => {
                callback(data);
                true
            }
            None => false,
        }
    }

    pub fn unregister(&mut self, id: i64) -> bool {
        self.table.remove(&id).is_some()
    }
}
