use patricia_tree::PatriciaMap;
use std::{collections::HashMap, fmt, ops::Deref, rc::Rc};
use vm::{JobConf, OpNodeSignature, OperatorConf, ParallelConf, ScopeConf, symbol_id};

/// 已驻留符号的句柄：编号 + 共享载荷。按编号比较相等。
pub struct Sym<P> {
    symbol_id: symbol_id,
    payload: Rc<P>,
}

impl<P> Sym<P> {
    fn new(symbol_id: symbol_id, payload: Rc<P>) -> Self {
        Self { symbol_id, payload }
    }

    pub fn symbol_id(&self) -> symbol_id {
        self.symbol_id
    }
}

impl<P> Clone for Sym<P> {
    fn clone(&self) -> Self {
        Self {
            symbol_id: self.symbol_id,
            payload: self.payload.clone(),
        }
    }
}

impl<P> Deref for Sym<P> {
    type Target = P;

    fn deref(&self) -> &Self::Target {
        &self.payload
    }
}

impl<P> PartialEq for Sym<P> {
    fn eq(&self, other: &Self) -> bool {
        self.symbol_id == other.symbol_id
    }
}

impl<P> Eq for Sym<P> {}

impl<P> fmt::Debug for Sym<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "s{}", self.symbol_id)
    }
}

#[derive(Clone)]
pub(crate) enum AnySym {
    String(Sym<String>),
    ParallelConf(Sym<ParallelConf>),
    JobConf(Sym<JobConf>),
    OpConf(Sym<OperatorConf>),
    OpNodeSignature(Sym<OpNodeSignature>),
    Scope(Sym<ScopeConf>),
}

/// 符号表：编号到符号的稠密映射，加上按载荷种类分开的内容反查表。
///
/// 同一会话内内容相等的载荷总是映射到同一个符号编号。
#[derive(Default)]
pub(crate) struct SymbolStorage {
    id2symbol: HashMap<symbol_id, AnySym>,
    strings: PatriciaMap<symbol_id>,
    parallel_confs: HashMap<Rc<ParallelConf>, symbol_id>,
    job_confs: HashMap<Rc<JobConf>, symbol_id>,
    op_confs: HashMap<Rc<OperatorConf>, symbol_id>,
    op_node_signatures: HashMap<Rc<OpNodeSignature>, symbol_id>,
    scopes: HashMap<Rc<ScopeConf>, symbol_id>,
}

macro_rules! intern {
    ($( $find:ident $insert:ident $get:ident: $map:ident $variant:ident $ty:ty; )+) => {
        $(
            pub fn $find(&self, payload: &$ty) -> Option<Sym<$ty>> {
                self.$map
                    .get_key_value(payload)
                    .map(|(payload, &id)| Sym::new(id, payload.clone()))
            }

            pub fn $insert(&mut self, symbol_id: symbol_id, payload: $ty) -> Sym<$ty> {
                let payload = Rc::new(payload);
                self.$map.insert(payload.clone(), symbol_id);
                let sym = Sym::new(symbol_id, payload);
                assert!(
                    self.id2symbol
                        .insert(symbol_id, AnySym::$variant(sym.clone()))
                        .is_none()
                );
                sym
            }

            pub fn $get(&self, symbol_id: symbol_id) -> Option<Sym<$ty>> {
                match self.id2symbol.get(&symbol_id)? {
                    AnySym::$variant(sym) => Some(sym.clone()),
                    _ => None,
                }
            }
        )+
    };
}

impl SymbolStorage {
    intern! {
        find_parallel_conf     insert_parallel_conf     parallel_conf    : parallel_confs     ParallelConf    ParallelConf;
        find_job_conf          insert_job_conf          job_conf         : job_confs          JobConf         JobConf;
        find_op_conf           insert_op_conf           op_conf          : op_confs           OpConf          OperatorConf;
        find_op_node_signature insert_op_node_signature op_node_signature: op_node_signatures OpNodeSignature OpNodeSignature;
        find_scope             insert_scope             scope            : scopes             Scope           ScopeConf;
    }

    pub fn find_string(&self, payload: &str) -> Option<Sym<String>> {
        let &id = self.strings.get(payload)?;
        match &self.id2symbol[&id] {
            AnySym::String(sym) => Some(sym.clone()),
            _ => unreachable!(),
        }
    }

    pub fn insert_string(&mut self, symbol_id: symbol_id, payload: String) -> Sym<String> {
        let payload = Rc::new(payload);
        self.strings.insert(payload.as_str(), symbol_id);
        let sym = Sym::new(symbol_id, payload);
        assert!(
            self.id2symbol
                .insert(symbol_id, AnySym::String(sym.clone()))
                .is_none()
        );
        sym
    }
}
