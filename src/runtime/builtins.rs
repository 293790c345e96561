//! Native functions the runtime ships with.
//!
//! Hosts that persist suspended coroutines must place these in their
//! permanents tables (both directions): a yielded protected call stores
//! [`pcall_cont`] as its continuation, and the functions themselves sit on
//! the suspended thread's stack.

use std::cell::RefCell;
use std::rc::Rc;

use super::value::{Table, Value};
use super::vm::{CallStatus, Control, NativeCall, Vm};
use super::VmError;

/// Suspend the current coroutine, passing the first argument out to the
/// resumer.
pub fn coroutine_yield(_vm: &mut Vm, call: &mut NativeCall) -> Result<Control, VmError> {
    Ok(Control::Yield(call.args.first().cloned().unwrap_or(Value::Nil)))
}

/// Protected call: `pcall(f, arg...)` returns a table `{ok, result}` where
/// `ok` is `true` and `result` the return value, or `false` and the error
/// message. A yield inside the callee suspends right through; the pending
/// continuation ([`pcall_cont`]) survives persistence via the permanents
/// table.
pub fn pcall(_vm: &mut Vm, call: &mut NativeCall) -> Result<Control, VmError> {
    let mut args = call.args.clone();
    if args.is_empty() {
        return Err(VmError::Message("pcall expects a function".to_string()));
    }
    let func = args.remove(0);
    Ok(Control::CallThen {
        func,
        args,
        ctx: 0,
        cont: pcall_cont,
        protected: true,
    })
}

/// Continuation of [`pcall`]; runs when the callee completes, whether it
/// returned, yielded and was resumed to completion, or errored.
pub fn pcall_cont(_vm: &mut Vm, call: &mut NativeCall) -> Result<Control, VmError> {
    let ok = call.status != CallStatus::Errored;
    let result = call.args.first().cloned().unwrap_or(Value::Nil);
    let mut t = Table::new();
    t.set(Value::Number(1.0), Value::Boolean(ok))?;
    t.set(Value::Number(2.0), result)?;
    Ok(Control::Return(Value::Table(Rc::new(RefCell::new(t)))))
}
