//! Shared builders for the round-trip tests: hand-assembled prototypes and
//! closures, the way the VM's own tests construct them.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use amber::runtime::program::{FuncProto, Instruction, Opcode, UpvalDesc};
use amber::runtime::value::{Table, Value};
use amber::runtime::vm::{Function, ScriptClosure, SharedUpValue, UpValue};

pub fn closed(v: Value) -> SharedUpValue {
    Rc::new(RefCell::new(UpValue::Closed(v)))
}

pub fn script(proto: Rc<RefCell<FuncProto>>, upvalues: Vec<SharedUpValue>) -> Value {
    Value::Function(Function::Script(Rc::new(RefCell::new(ScriptClosure {
        proto,
        upvalues,
    }))))
}

pub fn upval_desc(in_stack: bool, index: u8) -> UpvalDesc {
    UpvalDesc {
        in_stack,
        index,
        name: None,
    }
}

/// fn() n = n + 1; return n   -- over one upvalue
pub fn increment_proto() -> Rc<RefCell<FuncProto>> {
    Rc::new(RefCell::new(FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0),
            Instruction::new(Opcode::LoadConst, 1, 0, 0),
            Instruction::new(Opcode::Add, 0, 0, 1),
            Instruction::new(Opcode::SetUpval, 0, 0, 0),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        constants: vec![Value::Number(1.0)],
        upvalues: vec![upval_desc(true, 0)],
        ..Default::default()
    }))
}

/// fn() return n   -- over one upvalue
pub fn read_proto() -> Rc<RefCell<FuncProto>> {
    Rc::new(RefCell::new(FuncProto {
        max_stack: 1,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        upvalues: vec![upval_desc(true, 0)],
        ..Default::default()
    }))
}

/// A counter closure with a closed upvalue starting at `start`.
pub fn counter_closure(start: f64) -> Value {
    script(increment_proto(), vec![closed(Value::Number(start))])
}

pub fn new_table(pairs: &[(Value, Value)]) -> Value {
    let mut t = Table::new();
    for (k, v) in pairs {
        t.set(k.clone(), v.clone()).unwrap();
    }
    Value::Table(Rc::new(RefCell::new(t)))
}

pub fn get_field(v: &Value, key: &Value) -> Value {
    match v {
        Value::Table(t) => t.borrow().get(key),
        _ => panic!("expected a table, got {v:?}"),
    }
}
