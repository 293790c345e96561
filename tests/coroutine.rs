//! Thread persistence: suspended coroutines, open upvalues shared with the
//! caller, yielded protected calls and the writer's forbidden cases.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use amber::persist::{persist, unpersist, ErrorKind, PermsIn, PermsOut};
use amber::runtime::builtins;
use amber::runtime::program::{FuncProto, Instruction, Opcode};
use amber::runtime::value::Value;
use amber::runtime::vm::{Control, Function, NativeCall, Resume, Thread, Vm};
use amber::runtime::VmError;
use amber::Config;

use common::*;

fn native(f: amber::runtime::vm::NativeFn) -> Value {
    Value::Function(Function::Native(f))
}

/// Permanents for the builtin natives, both directions.
fn builtin_perms() -> (PermsOut, PermsIn) {
    let mut out = PermsOut::new();
    let mut inp = PermsIn::new();
    for (name, f) in [
        ("yield", builtins::coroutine_yield as amber::runtime::vm::NativeFn),
        ("pcall", builtins::pcall),
        ("pcall_cont", builtins::pcall_cont),
    ] {
        out.insert(&native(f), Value::str(name)).unwrap();
        inp.insert(Value::str(name), native(f)).unwrap();
    }
    (out, inp)
}

/// A coroutine that sets a local `n = 100`, yields a closure capturing it,
/// then adds one to the same (still open) slot once resumed.
fn sharing_coroutine() -> Rc<RefCell<Thread>> {
    let main = Rc::new(RefCell::new(FuncProto {
        max_stack: 6,
        code: vec![
            Instruction::new(Opcode::LoadConst, 0, 0, 0), // n = 100
            Instruction::new(Opcode::NewClosure, 1, 0, 0), // f over n
            Instruction::new(Opcode::GetUpval, 2, 0, 0),  // yield
            Instruction::new(Opcode::Move, 3, 1, 0),
            Instruction::new(Opcode::Call, 2, 1, 0), // yield(f)
            Instruction::new(Opcode::LoadConst, 4, 1, 0),
            Instruction::new(Opcode::Add, 0, 0, 4),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        constants: vec![Value::Number(100.0), Value::Number(1.0)],
        protos: vec![increment_proto()],
        upvalues: vec![upval_desc(false, 0)],
        ..Default::default()
    }));
    let func = script(main, vec![closed(native(builtins::coroutine_yield))]);
    Thread::new(func)
}

#[test]
fn suspended_coroutine_resumes_after_the_trip() {
    let co = sharing_coroutine();
    let mut vm = Vm::new();
    match vm.resume(&co, &[]).unwrap() {
        Resume::Yielded(_) => {}
        other => panic!("expected yield, got {other:?}"),
    }

    let (perms_out, perms_in) = builtin_perms();
    let cfg = Config::default();
    let bytes = persist(&mut vm, &cfg, &perms_out, &Value::Thread(co)).unwrap();

    let mut vm2 = Vm::new();
    let out = unpersist(&mut vm2, &cfg, &perms_in, &bytes).unwrap();
    let co2 = match out {
        Value::Thread(t) => t,
        other => panic!("expected thread, got {other:?}"),
    };
    match vm2.resume(&co2, &[Value::Nil]).unwrap() {
        Resume::Done(v) => assert_eq!(v, Value::Number(101.0)),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn open_upvalue_stays_shared_across_the_trip() {
    let co = sharing_coroutine();
    let mut vm = Vm::new();
    let f = match vm.resume(&co, &[]).unwrap() {
        Resume::Yielded(v) => v,
        other => panic!("expected yield, got {other:?}"),
    };

    // the closure is decoded before the thread reopens the upvalue, so the
    // record's back-pointers get patched
    let bundle = new_table(&[
        (Value::str("f"), f),
        (Value::str("co"), Value::Thread(co)),
    ]);

    let (perms_out, perms_in) = builtin_perms();
    let cfg = Config::default();
    let bytes = persist(&mut vm, &cfg, &perms_out, &bundle).unwrap();

    let mut vm2 = Vm::new();
    let out = unpersist(&mut vm2, &cfg, &perms_in, &bytes).unwrap();
    let f2 = get_field(&out, &Value::str("f"));
    let co2 = match get_field(&out, &Value::str("co")) {
        Value::Thread(t) => t,
        other => panic!("expected thread, got {other:?}"),
    };

    // mutate through the reconstructed closure: must write the thread's
    // still-open stack slot
    assert_eq!(vm2.call(&f2, &[]).unwrap(), Value::Number(101.0));
    assert_eq!(vm2.call(&f2, &[]).unwrap(), Value::Number(102.0));
    match vm2.resume(&co2, &[Value::Nil]).unwrap() {
        Resume::Done(v) => assert_eq!(v, Value::Number(103.0)),
        other => panic!("expected completion, got {other:?}"),
    }
    // the coroutine closed the upvalue on return; sharing persists
    assert_eq!(vm2.call(&f2, &[]).unwrap(), Value::Number(104.0));
}

/// pcall(f) where f yields; the continuation must survive via perms.
fn pcall_coroutine() -> Rc<RefCell<Thread>> {
    let callee = Rc::new(RefCell::new(FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0),
            Instruction::new(Opcode::LoadConst, 1, 0, 0),
            Instruction::new(Opcode::Call, 0, 1, 0),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        constants: vec![Value::Number(7.0)],
        upvalues: vec![upval_desc(false, 1)],
        ..Default::default()
    }));
    let main = Rc::new(RefCell::new(FuncProto {
        max_stack: 2,
        code: vec![
            Instruction::new(Opcode::GetUpval, 0, 0, 0),
            Instruction::new(Opcode::NewClosure, 1, 0, 0),
            Instruction::new(Opcode::Call, 0, 1, 0),
            Instruction::new(Opcode::Return, 0, 1, 0),
        ],
        protos: vec![callee],
        upvalues: vec![upval_desc(false, 0), upval_desc(false, 1)],
        ..Default::default()
    }));
    let func = script(
        main,
        vec![
            closed(native(builtins::pcall)),
            closed(native(builtins::coroutine_yield)),
        ],
    );
    Thread::new(func)
}

#[test]
fn yielded_pcall_survives_persistence() {
    let co = pcall_coroutine();
    let mut vm = Vm::new();
    match vm.resume(&co, &[]).unwrap() {
        Resume::Yielded(v) => assert_eq!(v, Value::Number(7.0)),
        other => panic!("expected yield, got {other:?}"),
    }

    let (perms_out, perms_in) = builtin_perms();
    let cfg = Config::default();
    let bytes = persist(&mut vm, &cfg, &perms_out, &Value::Thread(co)).unwrap();

    let mut vm2 = Vm::new();
    let co2 = match unpersist(&mut vm2, &cfg, &perms_in, &bytes).unwrap() {
        Value::Thread(t) => t,
        other => panic!("expected thread, got {other:?}"),
    };
    let result = match vm2.resume(&co2, &[Value::Number(42.0)]).unwrap() {
        Resume::Done(v) => v,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(get_field(&result, &Value::Number(1.0)), Value::Boolean(true));
    assert_eq!(get_field(&result, &Value::Number(2.0)), Value::Number(42.0));
}

#[test]
fn yielded_pcall_without_perms_fails_to_persist() {
    let co = pcall_coroutine();
    let mut vm = Vm::new();
    vm.resume(&co, &[]).unwrap();
    let err = persist(
        &mut vm,
        &Config::default(),
        &PermsOut::new(),
        &Value::Thread(co),
    )
    .unwrap_err();
    // the pcall native on the stack is a light native outside perms
    assert!(matches!(err.kind, ErrorKind::Unsupported(_)));
}

fn persist_own_thread(vm: &mut Vm, _call: &mut NativeCall) -> Result<Control, VmError> {
    let me = vm
        .current_thread()
        .ok_or(VmError::Internal("no current thread"))?;
    let err = persist(
        vm,
        &Config::default(),
        &PermsOut::new(),
        &Value::Thread(me),
    )
    .unwrap_err();
    let hit = matches!(&err.kind, ErrorKind::Unsupported(m)
        if m.contains("currently running thread"));
    Ok(Control::Return(Value::Boolean(hit)))
}

#[test]
fn the_running_thread_refuses_to_persist_itself() {
    let co = Thread::new(native(persist_own_thread));
    let mut vm = Vm::new();
    match vm.resume(&co, &[]).unwrap() {
        Resume::Done(v) => assert_eq!(v, Value::Boolean(true)),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn debug_hooks_are_dropped_with_a_warning() {
    fn hook(_vm: &mut Vm, _call: &mut NativeCall) -> Result<Control, VmError> {
        Ok(Control::Return(Value::Nil))
    }
    let co = sharing_coroutine();
    let mut vm = Vm::new();
    vm.resume(&co, &[]).unwrap();
    co.borrow_mut().hook = Some(hook);

    let (perms_out, perms_in) = builtin_perms();
    let cfg = Config::default();
    let bytes = persist(&mut vm, &cfg, &perms_out, &Value::Thread(co)).unwrap();
    let mut vm2 = Vm::new();
    let co2 = match unpersist(&mut vm2, &cfg, &perms_in, &bytes).unwrap() {
        Value::Thread(t) => t,
        other => panic!("expected thread, got {other:?}"),
    };
    assert!(co2.borrow().hook.is_none());
}

#[test]
fn active_error_handlers_forbid_persistence() {
    let co = sharing_coroutine();
    let mut vm = Vm::new();
    vm.resume(&co, &[]).unwrap();
    co.borrow_mut().errfunc = 5;

    let (perms_out, _) = builtin_perms();
    let err = persist(&mut vm, &Config::default(), &perms_out, &Value::Thread(co)).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::Unsupported(_)));
}

#[test]
fn fresh_threads_round_trip_too() {
    let co = sharing_coroutine();
    let (perms_out, perms_in) = builtin_perms();
    let cfg = Config::default();
    let mut vm = Vm::new();
    let bytes = persist(&mut vm, &cfg, &perms_out, &Value::Thread(co)).unwrap();
    let mut vm2 = Vm::new();
    let co2 = match unpersist(&mut vm2, &cfg, &perms_in, &bytes).unwrap() {
        Value::Thread(t) => t,
        other => panic!("expected thread, got {other:?}"),
    };
    // never started; runs from the beginning after the trip
    match vm2.resume(&co2, &[]).unwrap() {
        Resume::Yielded(f) => {
            assert_eq!(vm2.call(&f, &[]).unwrap(), Value::Number(101.0));
        }
        other => panic!("expected yield, got {other:?}"),
    }
}
