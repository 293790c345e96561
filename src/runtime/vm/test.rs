use std::cell::RefCell;
use std::rc::Rc;

use super::*;
use crate::runtime::builtins;
use crate::runtime::program::{FuncProto, Instruction, Opcode, UpvalDesc};
use crate::runtime::value::Value;
use crate::runtime::VmError;

fn closed(v: Value) -> SharedUpValue {
    Rc::new(RefCell::new(UpValue::Closed(v)))
}

fn script(proto: FuncProto, upvalues: Vec<SharedUpValue>) -> Value {
    Value::Function(Function::Script(Rc::new(RefCell::new(ScriptClosure {
        proto: Rc::new(RefCell::new(proto)),
        upvalues,
    }))))
}

/// fn() n = n + 1; return n   -- n captured as a closed upvalue
fn counter_closure(start: f64) -> Value {
    let proto = FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0),
            Instruction::new(Opcode::LoadConst, 1, 0, 0),
            Instruction::new(Opcode::Add, 0, 0, 1),
            Instruction::new(Opcode::SetUpval, 0, 0, 0),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        constants: vec![Value::Number(1.0)],
        upvalues: vec![UpvalDesc {
            in_stack: true,
            index: 0,
            name: None,
        }],
        ..Default::default()
    };
    script(proto, vec![closed(Value::Number(start))])
}

#[test]
fn counter_counts() {
    let mut vm = Vm::new();
    let f = counter_closure(0.0);
    assert_eq!(vm.call(&f, &[]).unwrap(), Value::Number(1.0));
    assert_eq!(vm.call(&f, &[]).unwrap(), Value::Number(2.0));
}

/// A coroutine that yields a closure capturing one of its own stack slots,
/// then increments that slot after being resumed.
fn sharing_coroutine() -> (Rc<RefCell<Thread>>, Vm) {
    let inc = FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0),
            Instruction::new(Opcode::LoadConst, 1, 0, 0),
            Instruction::new(Opcode::Add, 0, 0, 1),
            Instruction::new(Opcode::SetUpval, 0, 0, 0),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        constants: vec![Value::Number(1.0)],
        upvalues: vec![UpvalDesc {
            in_stack: true,
            index: 0,
            name: None,
        }],
        ..Default::default()
    };
    let main = FuncProto {
        max_stack: 6,
        code: vec![
            Instruction::new(Opcode::LoadConst, 0, 0, 0), // n = 100
            Instruction::new(Opcode::NewClosure, 1, 0, 0), // f captures n
            Instruction::new(Opcode::GetUpval, 2, 0, 0),  // yield
            Instruction::new(Opcode::Move, 3, 1, 0),
            Instruction::new(Opcode::Call, 2, 1, 0), // yield(f)
            Instruction::new(Opcode::LoadConst, 4, 1, 0),
            Instruction::new(Opcode::Add, 0, 0, 4), // n = n + 1
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        constants: vec![Value::Number(100.0), Value::Number(1.0)],
        protos: vec![Rc::new(RefCell::new(inc))],
        upvalues: vec![UpvalDesc {
            in_stack: false,
            index: 0,
            name: None,
        }],
        ..Default::default()
    };
    let func = script(
        main,
        vec![closed(Value::Function(Function::Native(
            builtins::coroutine_yield,
        )))],
    );
    (Thread::new(func), Vm::new())
}

#[test]
fn open_upvalue_is_shared_with_the_caller() {
    let (co, mut vm) = sharing_coroutine();
    let f = match vm.resume(&co, &[]).unwrap() {
        Resume::Yielded(v) => v,
        other => panic!("expected yield, got {other:?}"),
    };
    // mutating through the closure writes the coroutine's live stack slot
    assert_eq!(vm.call(&f, &[]).unwrap(), Value::Number(101.0));
    assert_eq!(vm.call(&f, &[]).unwrap(), Value::Number(102.0));
    match vm.resume(&co, &[Value::Nil]).unwrap() {
        Resume::Done(v) => assert_eq!(v, Value::Number(103.0)),
        other => panic!("expected completion, got {other:?}"),
    }
    // the coroutine returned, so the upvalue is closed now but still shared
    assert_eq!(vm.call(&f, &[]).unwrap(), Value::Number(104.0));
}

/// pcall(f) where f yields once, carrying the continuation across the
/// suspension.
fn pcall_coroutine() -> (Rc<RefCell<Thread>>, Vm) {
    let callee = FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0), // yield
            Instruction::new(Opcode::LoadConst, 1, 0, 0),
            Instruction::new(Opcode::Call, 0, 1, 0), // yield(7)
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        constants: vec![Value::Number(7.0)],
        upvalues: vec![UpvalDesc {
            in_stack: false,
            index: 1,
            name: None,
        }],
        ..Default::default()
    };
    let main = FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0),   // pcall
            Instruction::new(Opcode::NewClosure, 1, 0, 0), // f
            Instruction::new(Opcode::Call, 0, 1, 0),       // pcall(f)
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        protos: vec![Rc::new(RefCell::new(callee))],
        upvalues: vec![
            UpvalDesc {
                in_stack: false,
                index: 0,
                name: None,
            },
            UpvalDesc {
                in_stack: false,
                index: 1,
                name: None,
            },
        ],
        ..Default::default()
    };
    let func = script(
        main,
        vec![
            closed(Value::Function(Function::Native(builtins::pcall))),
            closed(Value::Function(Function::Native(builtins::coroutine_yield))),
        ],
    );
    (Thread::new(func), Vm::new())
}

#[test]
fn yield_crosses_a_protected_call() {
    let (co, mut vm) = pcall_coroutine();
    match vm.resume(&co, &[]).unwrap() {
        Resume::Yielded(v) => assert_eq!(v, Value::Number(7.0)),
        other => panic!("expected yield, got {other:?}"),
    }
    let result = match vm.resume(&co, &[Value::Number(42.0)]).unwrap() {
        Resume::Done(v) => v,
        other => panic!("expected completion, got {other:?}"),
    };
    let t = match result {
        Value::Table(t) => t,
        other => panic!("pcall result should be a table, got {other:?}"),
    };
    assert_eq!(t.borrow().get(&Value::Number(1.0)), Value::Boolean(true));
    assert_eq!(t.borrow().get(&Value::Number(2.0)), Value::Number(42.0));
}

fn boom(_vm: &mut Vm, _call: &mut NativeCall) -> Result<Control, VmError> {
    Err(VmError::Message("boom".to_string()))
}

#[test]
fn pcall_absorbs_errors() {
    let main = FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0), // pcall
            Instruction::new(Opcode::GetUpval, 1, 1, 0), // boom
            Instruction::new(Opcode::Call, 0, 1, 0),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        upvalues: vec![
            UpvalDesc {
                in_stack: false,
                index: 0,
                name: None,
            },
            UpvalDesc {
                in_stack: false,
                index: 1,
                name: None,
            },
        ],
        ..Default::default()
    };
    let func = script(
        main,
        vec![
            closed(Value::Function(Function::Native(builtins::pcall))),
            closed(Value::Function(Function::Native(boom))),
        ],
    );
    let mut vm = Vm::new();
    let result = vm.call(&func, &[]).unwrap();
    let t = match result {
        Value::Table(t) => t,
        other => panic!("pcall result should be a table, got {other:?}"),
    };
    assert_eq!(t.borrow().get(&Value::Number(1.0)), Value::Boolean(false));
    let second = t.borrow().get(&Value::Number(2.0));
    match second {
        Value::Str(s) => assert!(String::from_utf8_lossy(s.as_bytes()).contains("boom")),
        other => panic!("expected error message, got {other:?}"),
    }
}

#[test]
fn dead_coroutines_refuse_resume() {
    let f = counter_closure(0.0);
    let co = Thread::new(f);
    let mut vm = Vm::new();
    match vm.resume(&co, &[]).unwrap() {
        Resume::Done(v) => assert_eq!(v, Value::Number(1.0)),
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(matches!(
        vm.resume(&co, &[]),
        Err(VmError::NotResumable("dead"))
    ));
}
