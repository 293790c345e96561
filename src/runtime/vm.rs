//! The amber virtual machine: a register frame machine with first-class
//! coroutines.
//!
//! The machine is small (ten opcodes, single-value calls) but structurally
//! complete: call frames live in an explicit per-thread vector so a coroutine
//! can suspend across a native call that installed a continuation, and
//! upvalues are shared `Rc<RefCell<UpValue>>` cells that are either open
//! (pointing into a live thread stack) or closed (self-contained). The
//! persistence layer depends on both properties.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use num_enum::TryFromPrimitive;

use super::program::{FuncProto, Opcode};
use super::value::{Value, VmString};
use super::VmError;

/// Initial stack allocation of a fresh thread.
const BASE_STACK: usize = 40;

/// Signature of a native function. Natives communicate with the interpreter
/// through the returned [`Control`] value rather than by calling back in, so
/// a thread can suspend while a native call is logically in progress.
pub type NativeFn = fn(&mut Vm, &mut NativeCall) -> Result<Control, VmError>;

/// Call context handed to a native function.
pub struct NativeCall {
    pub args: Vec<Value>,
    /// Upvalues of the native closure being called; written back afterwards.
    /// Empty for bare native functions and continuations.
    pub upvalues: Vec<Value>,
    /// How this invocation came about: a plain call, the continuation of a
    /// call that yielded, or the continuation of a call that errored.
    pub status: CallStatus,
    pub ctx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    Yielded,
    Errored,
}

/// What a native function asks the interpreter to do next.
pub enum Control {
    Return(Value),
    Yield(Value),
    /// Call `func` with `args`, then invoke `cont` with the result. The
    /// native's frame stays on the call stack carrying the continuation, so
    /// the thread can be suspended and persisted in between.
    CallThen {
        func: Value,
        args: Vec<Value>,
        ctx: u32,
        cont: NativeFn,
        protected: bool,
    },
}

/// A function value: a bare native fn pointer, a native closure carrying
/// plain-value upvalues, or a script closure over a prototype.
#[derive(Clone)]
pub enum Function {
    Native(NativeFn),
    NativeClosure(Rc<RefCell<NativeClosure>>),
    Script(Rc<RefCell<ScriptClosure>>),
}

pub struct NativeClosure {
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
}

pub struct ScriptClosure {
    pub proto: Rc<RefCell<FuncProto>>,
    pub upvalues: Vec<SharedUpValue>,
}

/// An upvalue cell, possibly shared by several closures. Open upvalues point
/// into the owning thread's stack by index, so stack reallocation never
/// invalidates them.
#[derive(Debug)]
pub enum UpValue {
    Open {
        thread: Weak<RefCell<Thread>>,
        index: usize,
    },
    Closed(Value),
}

pub type SharedUpValue = Rc<RefCell<UpValue>>;

/// Read through an upvalue cell.
pub fn upvalue_value(uv: &SharedUpValue) -> Result<Value, VmError> {
    match &*uv.borrow() {
        UpValue::Closed(v) => Ok(v.clone()),
        UpValue::Open { thread, index } => {
            let t = thread.upgrade().ok_or(VmError::DeadUpvalue)?;
            let t = t.borrow();
            Ok(t.stack.get(*index).cloned().unwrap_or(Value::Nil))
        }
    }
}

/// Write through an upvalue cell.
pub fn set_upvalue_value(uv: &SharedUpValue, value: Value) -> Result<(), VmError> {
    match &mut *uv.borrow_mut() {
        UpValue::Closed(v) => {
            *v = value;
            Ok(())
        }
        UpValue::Open { thread, index } => {
            let t = thread.upgrade().ok_or(VmError::DeadUpvalue)?;
            let mut t = t.borrow_mut();
            let i = *index;
            t.ensure_stack(i + 1);
            t.stack[i] = value;
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ThreadStatus {
    Ready = 0,
    Suspended = 1,
    Running = 2,
    Done = 3,
}

/// Frame status bits. `SCRIPT` marks interpreted frames; the yield bits mark
/// native frames whose continuation must run when the callee completes.
pub mod frame_flags {
    pub const SCRIPT: u8 = 1 << 0;
    pub const PROTECTED: u8 = 1 << 1;
    pub const YIELDED: u8 = 1 << 2;
    pub const YIELDED_PCALL: u8 = 1 << 3;
    pub const HOOK_YIELD: u8 = 1 << 4;
}

/// A pending native continuation: an opaque context word plus the function
/// to call, which must be a bare native so it can travel through the
/// permanents table.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub ctx: u32,
    pub func: Value,
}

#[derive(Debug, Clone)]
pub enum FrameKind {
    Script { base: usize, saved_pc: usize },
    Native { status: u8, cont: Option<Continuation> },
}

/// One entry of a thread's call stack. All positions are offsets from the
/// stack base so the frame survives stack reallocation and serialization.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Stack index of the function being called.
    pub func: usize,
    /// One past the last stack slot this frame may use.
    pub top: usize,
    pub nresults: i16,
    pub flags: u8,
    pub extra: isize,
    pub kind: FrameKind,
}

impl CallFrame {
    /// The root frame every thread owns from birth, mirroring the host's
    /// base call info.
    fn base() -> Self {
        Self {
            func: 0,
            top: 1,
            nresults: -1,
            flags: 0,
            extra: 0,
            kind: FrameKind::Native {
                status: 0,
                cont: None,
            },
        }
    }
}

/// A coroutine: value stack, call frames and the list of upvalues currently
/// open over the stack.
pub struct Thread {
    pub status: ThreadStatus,
    /// Host reentrancy counter; carried through persistence untouched.
    pub ncalls: u16,
    pub allow_hook: bool,
    /// Debug hook, if any. Not persisted.
    pub hook: Option<NativeFn>,
    /// Index of an installed error handler function; nonzero only while the
    /// host runs a protected call, which forbids persistence.
    pub errfunc: usize,
    /// Whether a host-level error jump is armed. Forbids persistence.
    pub err_jmp: bool,
    /// Value stack. `stack.len()` is the allocated size.
    pub stack: Vec<Value>,
    /// Used stack height; slots at and above it are dead.
    pub top: usize,
    pub frames: Vec<CallFrame>,
    pub open_upvalues: Vec<(usize, SharedUpValue)>,
}

impl Thread {
    /// Create a thread that will run `func` when first resumed.
    pub fn new(func: Value) -> Rc<RefCell<Thread>> {
        let mut stack = vec![Value::Nil; BASE_STACK];
        stack[0] = func;
        Rc::new(RefCell::new(Thread {
            status: ThreadStatus::Ready,
            ncalls: 0,
            allow_hook: true,
            hook: None,
            errfunc: 0,
            err_jmp: false,
            stack,
            top: 1,
            frames: vec![CallFrame::base()],
            open_upvalues: Vec::new(),
        }))
    }

    /// Empty shell for the persistence reader to fill.
    pub(crate) fn raw() -> Thread {
        Thread {
            status: ThreadStatus::Ready,
            ncalls: 0,
            allow_hook: true,
            hook: None,
            errfunc: 0,
            err_jmp: false,
            stack: Vec::new(),
            top: 0,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
        }
    }

    pub fn ensure_stack(&mut self, n: usize) {
        if self.stack.len() < n {
            self.stack.resize(n, Value::Nil);
        }
    }
}

/// Result of resuming a coroutine.
#[derive(Debug)]
pub enum Resume {
    Yielded(Value),
    Done(Value),
}

enum StepEvent {
    Continue,
    Yield(Value),
    Finished(Value),
}

/// The virtual machine. Owns no heap of its own (values are shared `Rc`
/// graphs) but tracks which thread is currently executing, which both the
/// interpreter and the persistence writer need.
#[derive(Default)]
pub struct Vm {
    current: Option<Rc<RefCell<Thread>>>,
}

impl Vm {
    pub fn new() -> Self {
        Self::default()
    }

    /// The thread currently executing, if the VM is inside a resume.
    pub fn current_thread(&self) -> Option<Rc<RefCell<Thread>>> {
        self.current.clone()
    }

    /// Call a function to completion on behalf of the host. Script closures
    /// run on a scratch thread; yielding out of one is an error here.
    pub fn call(&mut self, func: &Value, args: &[Value]) -> Result<Value, VmError> {
        match func {
            Value::Function(Function::Script(_)) => {
                let co = Thread::new(func.clone());
                match self.resume(&co, args)? {
                    Resume::Done(v) => Ok(v),
                    Resume::Yielded(_) => Err(VmError::YieldFromOutside),
                }
            }
            Value::Function(_) => self.call_native(func.clone(), args.to_vec()),
            other => Err(VmError::NotCallable(other.type_name())),
        }
    }

    /// Resume a coroutine with the given arguments. A freshly created thread
    /// receives them as call arguments; a suspended one sees the first
    /// argument as the result of its pending yield.
    pub fn resume(
        &mut self,
        co: &Rc<RefCell<Thread>>,
        args: &[Value],
    ) -> Result<Resume, VmError> {
        let status = co.borrow().status;
        match status {
            ThreadStatus::Ready | ThreadStatus::Suspended => {}
            ThreadStatus::Running => return Err(VmError::NotResumable("non-suspended")),
            ThreadStatus::Done => return Err(VmError::NotResumable("dead")),
        }
        let prev = self.current.replace(co.clone());
        co.borrow_mut().status = ThreadStatus::Running;

        let first = match status {
            ThreadStatus::Ready => {
                {
                    let mut t = co.borrow_mut();
                    let needed = 1 + args.len();
                    t.ensure_stack(needed);
                    for (i, a) in args.iter().enumerate() {
                        t.stack[1 + i] = a.clone();
                    }
                    t.top = needed;
                }
                self.do_call(co, 0, args.len(), 1)
            }
            ThreadStatus::Suspended => {
                let arg = args.first().cloned().unwrap_or(Value::Nil);
                self.deliver(co, arg)
            }
            _ => unreachable!(),
        };
        let outcome = self.drive(co, first);

        self.current = prev;
        {
            let mut t = co.borrow_mut();
            t.status = match &outcome {
                Ok(Resume::Yielded(_)) => ThreadStatus::Suspended,
                Ok(Resume::Done(_)) | Err(_) => ThreadStatus::Done,
            };
        }
        outcome
    }

    /// Find the open upvalue of `co` at the given stack index, creating it if
    /// none exists yet. This is the host's find-or-create primitive the
    /// thread reader relies on when reopening upvalues.
    pub fn find_open_upvalue(co: &Rc<RefCell<Thread>>, index: usize) -> SharedUpValue {
        let mut t = co.borrow_mut();
        if let Some(uv) = t
            .open_upvalues
            .iter()
            .find_map(|(i, uv)| (*i == index).then(|| uv.clone()))
        {
            return uv;
        }
        let uv = Rc::new(RefCell::new(UpValue::Open {
            thread: Rc::downgrade(co),
            index,
        }));
        t.open_upvalues.push((index, uv.clone()));
        uv
    }

    fn drive(
        &mut self,
        co: &Rc<RefCell<Thread>>,
        first: Result<StepEvent, VmError>,
    ) -> Result<Resume, VmError> {
        let mut next = first;
        loop {
            match next {
                Ok(StepEvent::Continue) => next = self.step(co),
                Ok(StepEvent::Yield(v)) => return Ok(Resume::Yielded(v)),
                Ok(StepEvent::Finished(v)) => return Ok(Resume::Done(v)),
                Err(e) => next = Ok(self.recover(co, e)?),
            }
        }
    }

    /// Execute one instruction of the topmost (script) frame.
    fn step(&mut self, co: &Rc<RefCell<Thread>>) -> Result<StepEvent, VmError> {
        let (frame_func, base, pc) = {
            let t = co.borrow();
            let f = t
                .frames
                .last()
                .ok_or(VmError::Internal("interpreter entered without a frame"))?;
            match f.kind {
                FrameKind::Script { base, saved_pc } => (f.func, base, saved_pc),
                FrameKind::Native { .. } => {
                    return Err(VmError::Internal("native frame at interpreter top"))
                }
            }
        };
        let closure = {
            let t = co.borrow();
            match t.stack.get(frame_func) {
                Some(Value::Function(Function::Script(cl))) => cl.clone(),
                _ => return Err(VmError::Internal("frame function is not a script closure")),
            }
        };
        let proto = closure.borrow().proto.clone();
        let instr = {
            let p = proto.borrow();
            *p.code.get(pc).ok_or(VmError::PcOutOfRange)?
        };
        // Advance the saved pc first: a Call that suspends must resume past
        // itself, with the instruction still reachable at saved_pc - 1.
        {
            let mut t = co.borrow_mut();
            if let Some(CallFrame {
                kind: FrameKind::Script { saved_pc, .. },
                ..
            }) = t.frames.last_mut()
            {
                *saved_pc = pc + 1;
            }
        }

        let a = instr.a as usize;
        let b = instr.b as usize;
        let c = instr.c as usize;
        match instr.opcode()? {
            Opcode::Move => {
                let mut t = co.borrow_mut();
                let v = reg(&t, base + b)?;
                set_reg(&mut t, base + a, v)?;
            }
            Opcode::LoadConst => {
                let v = proto
                    .borrow()
                    .constants
                    .get(b)
                    .cloned()
                    .ok_or(VmError::Internal("constant index out of range"))?;
                let mut t = co.borrow_mut();
                set_reg(&mut t, base + a, v)?;
            }
            Opcode::LoadNil => {
                let mut t = co.borrow_mut();
                set_reg(&mut t, base + a, Value::Nil)?;
            }
            Opcode::Add | Opcode::Sub => {
                let mut t = co.borrow_mut();
                let x = number(&reg(&t, base + b)?)?;
                let y = number(&reg(&t, base + c)?)?;
                let r = if matches!(instr.opcode()?, Opcode::Add) {
                    x + y
                } else {
                    x - y
                };
                set_reg(&mut t, base + a, Value::Number(r))?;
            }
            Opcode::GetUpval => {
                let uv = closure
                    .borrow()
                    .upvalues
                    .get(b)
                    .cloned()
                    .ok_or(VmError::Internal("upvalue index out of range"))?;
                let v = upvalue_value(&uv)?;
                let mut t = co.borrow_mut();
                set_reg(&mut t, base + a, v)?;
            }
            Opcode::SetUpval => {
                let uv = closure
                    .borrow()
                    .upvalues
                    .get(a)
                    .cloned()
                    .ok_or(VmError::Internal("upvalue index out of range"))?;
                let v = {
                    let t = co.borrow();
                    reg(&t, base + b)?
                };
                set_upvalue_value(&uv, v)?;
            }
            Opcode::NewClosure => {
                let child = proto
                    .borrow()
                    .protos
                    .get(b)
                    .cloned()
                    .ok_or(VmError::Internal("child prototype index out of range"))?;
                let descs = child.borrow().upvalues.clone();
                let mut ups = Vec::with_capacity(descs.len());
                for d in &descs {
                    let uv = if d.in_stack {
                        Self::find_open_upvalue(co, base + d.index as usize)
                    } else {
                        closure
                            .borrow()
                            .upvalues
                            .get(d.index as usize)
                            .cloned()
                            .ok_or(VmError::Internal("upvalue index out of range"))?
                    };
                    ups.push(uv);
                }
                let cl = Rc::new(RefCell::new(ScriptClosure {
                    proto: child,
                    upvalues: ups,
                }));
                let mut t = co.borrow_mut();
                set_reg(&mut t, base + a, Value::Function(Function::Script(cl)))?;
            }
            Opcode::Call => {
                return self.do_call(co, base + a, b, 1);
            }
            Opcode::Return => {
                let v = {
                    let t = co.borrow();
                    reg(&t, base + a)?
                };
                return self.do_return(co, v);
            }
        }
        Ok(StepEvent::Continue)
    }

    fn do_call(
        &mut self,
        co: &Rc<RefCell<Thread>>,
        func_abs: usize,
        nargs: usize,
        nresults: i16,
    ) -> Result<StepEvent, VmError> {
        let callee = {
            let t = co.borrow();
            t.stack
                .get(func_abs)
                .cloned()
                .ok_or(VmError::Internal("call target out of range"))?
        };
        match callee {
            Value::Function(Function::Script(cl)) => {
                let max_stack = {
                    let proto = cl.borrow().proto.clone();
                    let m = proto.borrow().max_stack as usize;
                    m
                };
                let base = func_abs + 1;
                let top = base + max_stack;
                let mut t = co.borrow_mut();
                t.ensure_stack(top);
                for i in (base + nargs.min(max_stack))..top {
                    t.stack[i] = Value::Nil;
                }
                t.top = top;
                t.frames.push(CallFrame {
                    func: func_abs,
                    top,
                    nresults,
                    flags: frame_flags::SCRIPT,
                    extra: 0,
                    kind: FrameKind::Script { base, saved_pc: 0 },
                });
                Ok(StepEvent::Continue)
            }
            Value::Function(Function::Native(f)) => {
                let args = self.push_native_frame(co, func_abs, nargs, nresults)?;
                let mut call = NativeCall {
                    args,
                    upvalues: Vec::new(),
                    status: CallStatus::Ok,
                    ctx: 0,
                };
                let ctrl = f(self, &mut call)?;
                self.handle_control(co, ctrl)
            }
            Value::Function(Function::NativeClosure(nc)) => {
                let args = self.push_native_frame(co, func_abs, nargs, nresults)?;
                let f = nc.borrow().func;
                let ups = nc.borrow().upvalues.clone();
                let mut call = NativeCall {
                    args,
                    upvalues: ups,
                    status: CallStatus::Ok,
                    ctx: 0,
                };
                let res = f(self, &mut call);
                nc.borrow_mut().upvalues = call.upvalues;
                let ctrl = res?;
                self.handle_control(co, ctrl)
            }
            other => Err(VmError::NotCallable(other.type_name())),
        }
    }

    fn push_native_frame(
        &mut self,
        co: &Rc<RefCell<Thread>>,
        func_abs: usize,
        nargs: usize,
        nresults: i16,
    ) -> Result<Vec<Value>, VmError> {
        let mut t = co.borrow_mut();
        let top = func_abs + 1 + nargs;
        t.ensure_stack(top);
        let args = t.stack[func_abs + 1..top].to_vec();
        t.top = top;
        t.frames.push(CallFrame {
            func: func_abs,
            top,
            nresults,
            flags: 0,
            extra: 0,
            kind: FrameKind::Native {
                status: 0,
                cont: None,
            },
        });
        Ok(args)
    }

    fn handle_control(
        &mut self,
        co: &Rc<RefCell<Thread>>,
        ctrl: Control,
    ) -> Result<StepEvent, VmError> {
        match ctrl {
            Control::Return(v) => self.do_return(co, v),
            Control::Yield(v) => {
                // the yielding native's own frame does not outlive the yield
                co.borrow_mut().frames.pop();
                Self::mark_yield(co);
                Ok(StepEvent::Yield(v))
            }
            Control::CallThen {
                func,
                args,
                ctx,
                cont,
                protected,
            } => {
                let func_abs = {
                    let mut t = co.borrow_mut();
                    let frame = t
                        .frames
                        .last_mut()
                        .ok_or(VmError::Internal("continuation outside a call"))?;
                    if protected {
                        frame.flags |= frame_flags::PROTECTED;
                    }
                    match &mut frame.kind {
                        FrameKind::Native { cont: slot, .. } => {
                            *slot = Some(Continuation {
                                ctx,
                                func: Value::Function(Function::Native(cont)),
                            });
                        }
                        FrameKind::Script { .. } => {
                            return Err(VmError::Internal("continuation on a script frame"))
                        }
                    }
                    let func_abs = t.top;
                    let needed = func_abs + 1 + args.len();
                    t.ensure_stack(needed);
                    t.stack[func_abs] = func;
                    for (i, a) in args.iter().enumerate() {
                        t.stack[func_abs + 1 + i] = a.clone();
                    }
                    t.top = needed;
                    func_abs
                };
                let nargs = {
                    let t = co.borrow();
                    t.top - func_abs - 1
                };
                self.do_call(co, func_abs, nargs, 1)
            }
        }
    }

    fn do_return(&mut self, co: &Rc<RefCell<Thread>>, value: Value) -> Result<StepEvent, VmError> {
        let (func_slot, script_base) = {
            let mut t = co.borrow_mut();
            let frame = t
                .frames
                .pop()
                .ok_or(VmError::Internal("return without a frame"))?;
            let base = match frame.kind {
                FrameKind::Script { base, .. } => Some(base),
                FrameKind::Native { .. } => None,
            };
            (frame.func, base)
        };
        if let Some(base) = script_base {
            Self::close_upvalues(co, base);
        }
        {
            let mut t = co.borrow_mut();
            t.ensure_stack(func_slot + 1);
            t.stack[func_slot] = value.clone();
            t.top = func_slot + 1;
            if t.frames.len() <= 1 {
                return Ok(StepEvent::Finished(value));
            }
        }

        enum Next {
            Script(usize),
            Cont(Continuation, CallStatus),
        }
        let next = {
            let mut t = co.borrow_mut();
            let frame = t
                .frames
                .last_mut()
                .ok_or(VmError::Internal("unbalanced call stack"))?;
            match &mut frame.kind {
                FrameKind::Script { .. } => Next::Script(frame.top),
                FrameKind::Native { cont, .. } => {
                    let status =
                        if frame.flags & (frame_flags::YIELDED | frame_flags::YIELDED_PCALL) != 0 {
                            CallStatus::Yielded
                        } else {
                            CallStatus::Ok
                        };
                    let c = cont
                        .take()
                        .ok_or(VmError::Internal("native frame without continuation"))?;
                    Next::Cont(c, status)
                }
            }
        };
        match next {
            Next::Script(top) => {
                co.borrow_mut().top = top;
                Ok(StepEvent::Continue)
            }
            Next::Cont(c, status) => self.invoke_continuation(co, c, status, value),
        }
    }

    fn invoke_continuation(
        &mut self,
        co: &Rc<RefCell<Thread>>,
        c: Continuation,
        status: CallStatus,
        arg: Value,
    ) -> Result<StepEvent, VmError> {
        let f = match &c.func {
            Value::Function(Function::Native(f)) => *f,
            _ => return Err(VmError::Internal("continuation is not a native function")),
        };
        let mut call = NativeCall {
            args: vec![arg],
            upvalues: Vec::new(),
            status,
            ctx: c.ctx,
        };
        let ctrl = f(self, &mut call)?;
        self.handle_control(co, ctrl)
    }

    /// Hand the resume argument to whatever is waiting for it: the pending
    /// `Call` of the topmost script frame, or a native continuation.
    fn deliver(&mut self, co: &Rc<RefCell<Thread>>, value: Value) -> Result<StepEvent, VmError> {
        enum Target {
            Script { dest: usize, top: usize },
            Cont(Continuation),
        }
        // snapshot of the topmost frame: (func, base, saved_pc, top) when it
        // is a script frame, None when native
        let snapshot = {
            let t = co.borrow();
            let frame = t
                .frames
                .last()
                .ok_or(VmError::Internal("resumed thread has no frames"))?;
            match &frame.kind {
                FrameKind::Script { base, saved_pc } => {
                    Some((frame.func, *base, *saved_pc, frame.top))
                }
                FrameKind::Native { .. } => None,
            }
        };
        let target = match snapshot {
            Some((func, base, pc, top)) => {
                let cl = {
                    let t = co.borrow();
                    match t.stack.get(func) {
                        Some(Value::Function(Function::Script(cl))) => cl.clone(),
                        _ => {
                            return Err(VmError::Internal(
                                "frame function is not a script closure",
                            ))
                        }
                    }
                };
                let proto = cl.borrow().proto.clone();
                let instr = {
                    let p = proto.borrow();
                    *p.code
                        .get(pc.wrapping_sub(1))
                        .ok_or(VmError::PcOutOfRange)?
                };
                if instr.opcode()? != Opcode::Call {
                    return Err(VmError::Internal("resumed frame is not awaiting a call"));
                }
                Target::Script {
                    dest: base + instr.a as usize,
                    top,
                }
            }
            None => {
                let mut t = co.borrow_mut();
                let frame = t
                    .frames
                    .last_mut()
                    .ok_or(VmError::Internal("resumed thread has no frames"))?;
                match &mut frame.kind {
                    FrameKind::Native { cont, .. } => {
                        let c = cont.take().ok_or(VmError::Internal(
                            "resumed native frame has no continuation",
                        ))?;
                        Target::Cont(c)
                    }
                    FrameKind::Script { .. } => unreachable!(),
                }
            }
        };
        match target {
            Target::Script { dest, top } => {
                let mut t = co.borrow_mut();
                t.ensure_stack(dest + 1);
                t.stack[dest] = value;
                t.top = top;
                Ok(StepEvent::Continue)
            }
            Target::Cont(c) => self.invoke_continuation(co, c, CallStatus::Yielded, value),
        }
    }

    /// Unwind after an error, looking for the nearest protected native frame
    /// whose continuation can absorb it.
    fn recover(&mut self, co: &Rc<RefCell<Thread>>, err: VmError) -> Result<StepEvent, VmError> {
        let protected = {
            let t = co.borrow();
            t.frames.iter().rposition(|f| {
                f.flags & frame_flags::PROTECTED != 0
                    && matches!(&f.kind, FrameKind::Native { cont: Some(_), .. })
            })
        };
        let Some(idx) = protected else {
            return Err(err);
        };
        loop {
            let base = {
                let mut t = co.borrow_mut();
                if t.frames.len() - 1 == idx {
                    break;
                }
                let frame = t
                    .frames
                    .pop()
                    .ok_or(VmError::Internal("unbalanced call stack"))?;
                match frame.kind {
                    FrameKind::Script { base, .. } => Some(base),
                    FrameKind::Native { .. } => None,
                }
            };
            if let Some(base) = base {
                Self::close_upvalues(co, base);
            }
        }
        let c = {
            let mut t = co.borrow_mut();
            let frame = t
                .frames
                .last_mut()
                .ok_or(VmError::Internal("unbalanced call stack"))?;
            frame.flags &= !frame_flags::PROTECTED;
            match &mut frame.kind {
                FrameKind::Native { cont, .. } => cont
                    .take()
                    .ok_or(VmError::Internal("protected frame lost its continuation"))?,
                FrameKind::Script { .. } => {
                    return Err(VmError::Internal("protected frame is not native"))
                }
            }
        };
        let msg = Value::Str(Rc::new(VmString::from(err.to_string().as_str())));
        self.invoke_continuation(co, c, CallStatus::Errored, msg)
    }

    /// Close every upvalue open at or above `from`, copying the stack value
    /// into the cell.
    pub fn close_upvalues(co: &Rc<RefCell<Thread>>, from: usize) {
        let mut closing = Vec::new();
        {
            let mut t = co.borrow_mut();
            let mut i = 0;
            while i < t.open_upvalues.len() {
                if t.open_upvalues[i].0 >= from {
                    closing.push(t.open_upvalues.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        for (idx, uv) in closing {
            let v = {
                let t = co.borrow();
                t.stack.get(idx).cloned().unwrap_or(Value::Nil)
            };
            *uv.borrow_mut() = UpValue::Closed(v);
        }
    }

    /// Flag every suspended continuation so the persistence writer knows to
    /// carry it, mirroring how the host tags yielded protected calls.
    fn mark_yield(co: &Rc<RefCell<Thread>>) {
        let mut t = co.borrow_mut();
        for f in t.frames.iter_mut() {
            if let FrameKind::Native { cont: Some(_), .. } = &f.kind {
                f.flags |= if f.flags & frame_flags::PROTECTED != 0 {
                    frame_flags::YIELDED_PCALL
                } else {
                    frame_flags::YIELDED
                };
            }
        }
    }

    fn call_native(&mut self, func: Value, args: Vec<Value>) -> Result<Value, VmError> {
        let (f, nc) = match &func {
            Value::Function(Function::Native(f)) => (*f, None),
            Value::Function(Function::NativeClosure(c)) => (c.borrow().func, Some(c.clone())),
            _ => return Err(VmError::Internal("call_native on non-native")),
        };
        let ups = nc
            .as_ref()
            .map(|c| c.borrow().upvalues.clone())
            .unwrap_or_default();
        let mut call = NativeCall {
            args,
            upvalues: ups,
            status: CallStatus::Ok,
            ctx: 0,
        };
        let res = f(self, &mut call);
        if let Some(c) = &nc {
            c.borrow_mut().upvalues = call.upvalues;
        }
        match res? {
            Control::Return(v) => Ok(v),
            Control::Yield(_) => Err(VmError::YieldFromOutside),
            Control::CallThen {
                func: target,
                args: targs,
                ctx,
                cont,
                protected,
            } => {
                let inner = self.call(&target, &targs);
                let (status, arg) = match inner {
                    Ok(v) => (CallStatus::Ok, v),
                    Err(e) => {
                        if !protected {
                            return Err(e);
                        }
                        (
                            CallStatus::Errored,
                            Value::Str(Rc::new(VmString::from(e.to_string().as_str()))),
                        )
                    }
                };
                let mut kcall = NativeCall {
                    args: vec![arg],
                    upvalues: Vec::new(),
                    status,
                    ctx,
                };
                match cont(self, &mut kcall)? {
                    Control::Return(v) => Ok(v),
                    _ => Err(VmError::Internal("continuation chained outside a coroutine")),
                }
            }
        }
    }
}

fn reg(t: &Thread, i: usize) -> Result<Value, VmError> {
    t.stack
        .get(i)
        .cloned()
        .ok_or(VmError::Internal("register out of range"))
}

fn set_reg(t: &mut Thread, i: usize, v: Value) -> Result<(), VmError> {
    match t.stack.get_mut(i) {
        Some(slot) => {
            *slot = v;
            Ok(())
        }
        None => Err(VmError::Internal("register out of range")),
    }
}

fn number(v: &Value) -> Result<f64, VmError> {
    match v {
        Value::Number(n) => Ok(*n),
        other => Err(VmError::Arithmetic(other.type_name())),
    }
}

#[cfg(test)]
mod test;
