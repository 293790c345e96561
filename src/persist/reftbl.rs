//! Reference tables: object identity → id on the write side, id → restored
//! object on the read side. Ids are dense and 1-based; both sides issue them
//! in depth-first pre-order, which is what makes cycles line up.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::runtime::program::FuncProto;
use crate::runtime::value::{ObjKey, Value};
use crate::runtime::vm::{ScriptClosure, SharedUpValue};

pub(crate) struct WriteRefs {
    map: HashMap<ObjKey, u32>,
    next: u32,
}

impl WriteRefs {
    pub(crate) fn new() -> Self {
        Self {
            map: HashMap::new(),
            next: 0,
        }
    }

    pub(crate) fn lookup(&self, key: ObjKey) -> Option<u32> {
        self.map.get(&key).copied()
    }

    /// Bind `key` to the next id. The id must be allocated before the body
    /// is written so that cycles back to this object resolve.
    pub(crate) fn insert(&mut self, key: ObjKey) -> u32 {
        self.next += 1;
        self.map.insert(key, self.next);
        self.next
    }
}

/// The intermediate record an upvalue decodes into: its value, the live
/// upvalue cell once one exists, and a back-pointer per closure slot that
/// bound the cell, so reopening against a thread stack can re-point every
/// referring closure in one pass.
#[derive(Default)]
pub(crate) struct UpvalRecord {
    pub(crate) value: Value,
    pub(crate) reopened: Option<SharedUpValue>,
    pub(crate) backrefs: Vec<(Rc<RefCell<ScriptClosure>>, usize)>,
}

/// What a reference id resolves to on the read side. Prototypes and upvalue
/// records are not first-class values, so they get their own arms.
pub(crate) enum Restored {
    Value(Value),
    Proto(Rc<RefCell<FuncProto>>),
    Upval(Rc<RefCell<UpvalRecord>>),
}

pub(crate) struct ReadRefs {
    slots: Vec<Restored>,
}

impl ReadRefs {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Register the next object; returns its 1-based id.
    pub(crate) fn register(&mut self, obj: Restored) -> u32 {
        self.slots.push(obj);
        self.slots.len() as u32
    }

    pub(crate) fn get(&self, id: u32) -> Option<&Restored> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize - 1)
    }

    /// Replace a reserved slot once the real object exists (special
    /// persistence and permanents both reserve before they construct).
    pub(crate) fn rewrite(&mut self, id: u32, obj: Restored) {
        if id != 0 {
            if let Some(slot) = self.slots.get_mut(id as usize - 1) {
                *slot = obj;
            }
        }
    }
}
