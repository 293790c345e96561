//! The unpersist side: reconstruct a value graph from the stream, filling
//! reference-table slots before descending so cycles resolve.

use std::cell::RefCell;
use std::rc::Rc;

use crate::runtime::program::{FuncProto, Instruction, LocVar, UpvalDesc};
use crate::runtime::value::{Table, Userdata, Value, VmString};
use crate::runtime::vm::{
    frame_flags, CallFrame, Continuation, Control, FrameKind, Function, NativeCall,
    NativeClosure, ScriptClosure, Thread, ThreadStatus, UpValue, Vm,
};
use crate::runtime::VmError;
use crate::Config;

use super::path::{format_key, PathTrace};
use super::perms::PermsIn;
use super::reftbl::{ReadRefs, Restored, UpvalRecord};
use super::stream::Reader;
use super::{kind_of, ErrorKind, Kind, PersistError, PERMANENT, REF_OFFSET};

pub(crate) fn run<'a>(
    vm: &'a mut Vm,
    cfg: &'a Config,
    perms: &'a PermsIn,
    input: Reader<'a>,
) -> Result<Value, PersistError> {
    let mut ctx = UnpersistCtx {
        vm,
        cfg,
        perms,
        refs: ReadRefs::new(),
        path: PathTrace::new(cfg.track_path),
        input,
        depth: 0,
    };
    ctx.path.push(|| "root".to_string());
    match ctx.unpersist() {
        Ok(v) => Ok(v),
        Err(mut e) => {
            if e.path.is_none() {
                e.path = ctx.path.render();
            }
            Err(e)
        }
    }
}

/// Stands in for the native function of a closure shell until the real one
/// arrives out of the permanents table.
fn hollow_native(_vm: &mut Vm, _call: &mut NativeCall) -> Result<Control, VmError> {
    Err(VmError::Internal("native closure shell was never filled"))
}

struct UnpersistCtx<'a> {
    vm: &'a mut Vm,
    cfg: &'a Config,
    perms: &'a PermsIn,
    refs: ReadRefs,
    path: PathTrace,
    input: Reader<'a>,
    depth: usize,
}

impl<'a> UnpersistCtx<'a> {
    fn corrupt(&self, msg: impl Into<String>) -> PersistError {
        ErrorKind::StreamCorrupt(msg.into()).into()
    }

    fn count(&self, n: i32) -> Result<usize, PersistError> {
        usize::try_from(n).map_err(|_| self.corrupt(format!("negative element count {n}")))
    }

    /// Top-level dispatcher: resolve a reference or decode a tagged body.
    fn unpersist(&mut self) -> Result<Value, PersistError> {
        if self.depth >= self.cfg.max_depth {
            return Err(ErrorKind::TooDeep.into());
        }
        self.depth += 1;
        let r = self.unpersist_value();
        self.depth -= 1;
        r
    }

    fn unpersist_value(&mut self) -> Result<Value, PersistError> {
        let word = self.input.i32()?;
        if word > REF_OFFSET {
            let id = (word - REF_OFFSET) as u32;
            return match self.refs.get(id) {
                Some(Restored::Value(v)) if !v.is_nil() => Ok(v.clone()),
                _ => Err(self.corrupt(format!("invalid reference #{id}"))),
            };
        }
        if word == PERMANENT {
            return self.read_permanent();
        }
        let kind = Kind::try_from(word)
            .map_err(|_| self.corrupt(format!("trying to unpersist unknown type {word}")))?;
        match kind {
            Kind::Nil => Ok(Value::Nil),
            Kind::Boolean => Ok(Value::Boolean(self.input.u8()? != 0)),
            Kind::LightPtr => Ok(Value::LightPtr(self.input.usize()?)),
            Kind::Number => Ok(Value::Number(self.input.f64()?)),
            Kind::Str => {
                let len = self.input.usize()?;
                let bytes = self.input.vec(len)?;
                let v = Value::Str(Rc::new(VmString::new(bytes)));
                self.refs.register(Restored::Value(v.clone()));
                Ok(v)
            }
            Kind::Table => self.read_special(Kind::Table),
            Kind::Userdata => self.read_special(Kind::Userdata),
            Kind::Function => self.read_closure(),
            Kind::Thread => self.read_thread(),
            // raw prototypes and upvalues only occur beneath closures and
            // threads, which consume their framing words themselves
            Kind::Proto | Kind::Upval => {
                Err(self.corrupt("unexpected raw prototype or upvalue"))
            }
        }
    }

    /// A value replaced through the permanents table: the key follows; the
    /// resolution must exist and match the original kind.
    fn read_permanent(&mut self) -> Result<Value, PersistError> {
        let orig = self.input.i32()?;
        let orig_kind = Kind::try_from(orig)
            .map_err(|_| self.corrupt(format!("trying to unpersist unknown type {orig}")))?;
        // reserve the id before the key so the orders agree with the writer
        let id = self.refs.register(Restored::Value(Value::Nil));
        let key = self.unpersist()?;
        let obj = self
            .perms
            .lookup(&key)
            .cloned()
            .ok_or_else(|| ErrorKind::PermsViolation("bad permanent value (no value)".to_string()))?;
        let got = kind_of(&obj);
        if got != orig_kind {
            return Err(ErrorKind::PermsViolation(format!(
                "bad permanent value ({} expected, got {})",
                orig_kind.name(),
                got.name()
            ))
            .into());
        }
        self.refs.rewrite(id, Restored::Value(obj.clone()));
        Ok(obj)
    }

    /// Literal-vs-special discriminator shared by tables and userdata.
    fn read_special(&mut self, kind: Kind) -> Result<Value, PersistError> {
        if self.input.u8()? != 0 {
            // reserve the slot first; the restore function cannot see it
            let id = self.refs.register(Restored::Value(Value::Nil));
            let f = self.unpersist()?;
            if !matches!(f, Value::Function(_)) {
                return Err(
                    ErrorKind::BadSpecialCallback("invalid restore function".to_string()).into(),
                );
            }
            let mut args = Vec::new();
            if self.cfg.pass_io {
                args.push(Value::LightPtr(self.input.handle_addr()));
            }
            let obj = self.vm.call(&f, &args).map_err(ErrorKind::Vm)?;
            let got = kind_of(&obj);
            if got != kind {
                return Err(ErrorKind::BadSpecialCallback(format!(
                    "bad restore function ({} expected, returned {})",
                    kind.name(),
                    got.name()
                ))
                .into());
            }
            self.refs.rewrite(id, Restored::Value(obj.clone()));
            Ok(obj)
        } else {
            match kind {
                Kind::Table => self.read_literal_table(),
                Kind::Userdata => self.read_literal_userdata(),
                _ => unreachable!("special body for non-special kind"),
            }
        }
    }

    fn read_literal_table(&mut self) -> Result<Value, PersistError> {
        let table = Rc::new(RefCell::new(Table::new()));
        let v = Value::Table(table.clone());
        // register before the pairs so cycles through keys/values resolve
        self.refs.register(Restored::Value(v.clone()));
        loop {
            self.path.push(|| "@key".to_string());
            let key = self.unpersist()?;
            self.path.pop();
            if key.is_nil() {
                break;
            }
            self.path.push(|| format_key(&key));
            let value = self.unpersist()?;
            if value.is_nil() {
                return Err(self.corrupt("bad table value, got a nil value"));
            }
            table.borrow_mut().set(key, value).map_err(ErrorKind::Vm)?;
            self.path.pop();
        }
        let mt = self.read_metatable()?;
        table.borrow_mut().metatable = mt;
        Ok(v)
    }

    fn read_literal_userdata(&mut self) -> Result<Value, PersistError> {
        let len = self.input.usize()?;
        let data = self.input.vec(len)?;
        let ud = Rc::new(RefCell::new(Userdata::new(data)));
        let v = Value::Userdata(ud.clone());
        self.refs.register(Restored::Value(v.clone()));
        let mt = self.read_metatable()?;
        ud.borrow_mut().metatable = mt;
        Ok(v)
    }

    fn read_metatable(&mut self) -> Result<Option<Rc<RefCell<Table>>>, PersistError> {
        self.path.push(|| "@metatable".to_string());
        let v = self.unpersist()?;
        let mt = match v {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            _ => return Err(self.corrupt("bad metatable, not nil or table")),
        };
        self.path.pop();
        Ok(mt)
    }

    fn read_closure(&mut self) -> Result<Value, PersistError> {
        let is_native = self.input.u8()? != 0;
        let nups = self.input.u8()? as usize;
        if is_native {
            // register a shell before the inner function so the id order
            // matches the writer, then fill it in
            let shell = Rc::new(RefCell::new(NativeClosure {
                func: hollow_native,
                upvalues: vec![Value::Nil; nups],
            }));
            let v = Value::Function(Function::NativeClosure(shell.clone()));
            self.refs.register(Restored::Value(v.clone()));
            let func = self.unpersist()?;
            match func {
                Value::Function(Function::Native(f)) => shell.borrow_mut().func = f,
                _ => return Err(self.corrupt("bad native closure function")),
            }
            self.path.push(|| ".upvalues".to_string());
            for i in 0..nups {
                self.path.push(|| format!("[{}]", i + 1));
                let uv = self.unpersist()?;
                shell.borrow_mut().upvalues[i] = uv;
                self.path.pop();
            }
            self.path.pop();
            Ok(v)
        } else {
            let proto_shell = Rc::new(RefCell::new(FuncProto::default()));
            let closure = Rc::new(RefCell::new(ScriptClosure {
                proto: proto_shell.clone(),
                upvalues: (0..nups)
                    .map(|_| Rc::new(RefCell::new(UpValue::Closed(Value::Nil))))
                    .collect(),
            }));
            let v = Value::Function(Function::Script(closure.clone()));
            self.refs.register(Restored::Value(v.clone()));

            self.path.push(|| ".proto".to_string());
            let proto = self.read_proto_ref(proto_shell)?;
            closure.borrow_mut().proto = proto;
            self.path.pop();

            self.path.push(|| ".upvalues".to_string());
            for k in 0..nups {
                self.path.push(|| format!("[{}]", k + 1));
                let rec = self.read_upval_record()?;
                let (uv, value) = {
                    let mut r = rec.borrow_mut();
                    let uv = match &r.reopened {
                        Some(uv) => uv.clone(),
                        None => {
                            let fresh = Rc::new(RefCell::new(UpValue::Closed(Value::Nil)));
                            r.reopened = Some(fresh.clone());
                            fresh
                        }
                    };
                    r.backrefs.push((closure.clone(), k));
                    (uv, r.value.clone())
                };
                // always reconcile: a cycle through this upvalue may have
                // left the temporary nil behind
                if let UpValue::Closed(slot) = &mut *uv.borrow_mut() {
                    *slot = value;
                }
                closure.borrow_mut().upvalues[k] = uv;
                self.path.pop();
            }
            self.path.pop();
            Ok(v)
        }
    }

    /// Read a prototype position: either a reference to one decoded earlier
    /// (the caller's shell is discarded) or a tagged body decoded into the
    /// shell. The shell is registered before its body in case the constants
    /// somehow cycle back into it.
    fn read_proto_ref(
        &mut self,
        shell: Rc<RefCell<FuncProto>>,
    ) -> Result<Rc<RefCell<FuncProto>>, PersistError> {
        let word = self.input.i32()?;
        if word > REF_OFFSET {
            let id = (word - REF_OFFSET) as u32;
            return match self.refs.get(id) {
                Some(Restored::Proto(p)) => Ok(p.clone()),
                _ => Err(self.corrupt(format!("invalid reference #{id}"))),
            };
        }
        if word == PERMANENT {
            // the kind check inside cannot pass for a prototype
            self.read_permanent()?;
            return Err(ErrorKind::PermsViolation(
                "bad permanent value (proto expected)".to_string(),
            )
            .into());
        }
        if word != Kind::Proto as i32 {
            return Err(self.corrupt(format!("trying to unpersist unknown type {word}")));
        }
        self.refs.register(Restored::Proto(shell.clone()));
        self.read_proto_body(&shell)?;
        Ok(shell)
    }

    fn read_proto_body(&mut self, shell: &Rc<RefCell<FuncProto>>) -> Result<(), PersistError> {
        {
            let mut p = shell.borrow_mut();
            p.line_defined = self.input.i32()?;
            p.last_line_defined = self.input.i32()?;
            p.nparams = self.input.u8()?;
            p.is_vararg = self.input.u8()? != 0;
            p.max_stack = self.input.u8()?;

            let ncode = self.input.i32()?;
            let ncode = self.count(ncode)?;
            p.code = Vec::with_capacity(ncode);
            for _ in 0..ncode {
                p.code.push(Instruction::unpack(self.input.u32()?));
            }
        }

        // constants recurse, so the shell borrow must be dropped in between
        let nconsts = self.input.i32()?;
        let nconsts = self.count(nconsts)?;
        self.path.push(|| ".constants".to_string());
        for i in 0..nconsts {
            self.path.push(|| format!("[{i}]"));
            let k = self.unpersist()?;
            shell.borrow_mut().constants.push(k);
            self.path.pop();
        }
        self.path.pop();

        let nprotos = self.input.i32()?;
        let nprotos = self.count(nprotos)?;
        self.path.push(|| ".protos".to_string());
        for i in 0..nprotos {
            self.path.push(|| format!("[{i}]"));
            let child_shell = Rc::new(RefCell::new(FuncProto::default()));
            let child = self.read_proto_ref(child_shell)?;
            shell.borrow_mut().protos.push(child);
            self.path.pop();
        }
        self.path.pop();

        let nups = self.input.i32()?;
        let nups = self.count(nups)?;
        for _ in 0..nups {
            let in_stack = self.input.u8()? != 0;
            let index = self.input.u8()?;
            shell.borrow_mut().upvalues.push(UpvalDesc {
                in_stack,
                index,
                name: None,
            });
        }

        if self.input.u8()? == 0 {
            return Ok(());
        }

        let source = self.read_debug_string()?;
        shell.borrow_mut().source = source;

        let nlines = self.input.i32()?;
        let nlines = self.count(nlines)?;
        {
            let mut p = shell.borrow_mut();
            p.line_info = Vec::with_capacity(nlines);
            for _ in 0..nlines {
                let line = self.input.i32()?;
                p.line_info.push(line);
            }
        }

        let nlocals = self.input.i32()?;
        let nlocals = self.count(nlocals)?;
        self.path.push(|| ".locvars".to_string());
        for i in 0..nlocals {
            self.path.push(|| format!("[{i}]"));
            let start_pc = self.input.i32()?;
            let end_pc = self.input.i32()?;
            let name = self.read_debug_string()?;
            shell.borrow_mut().locals.push(LocVar {
                start_pc,
                end_pc,
                name,
            });
            self.path.pop();
        }
        self.path.pop();

        self.path.push(|| ".upvalnames".to_string());
        for i in 0..nups {
            self.path.push(|| format!("[{i}]"));
            let name = self.read_debug_string()?;
            if let Some(desc) = shell.borrow_mut().upvalues.get_mut(i) {
                desc.name = name;
            }
            self.path.pop();
        }
        self.path.pop();
        Ok(())
    }

    fn read_debug_string(&mut self) -> Result<Option<Rc<VmString>>, PersistError> {
        match self.unpersist()? {
            Value::Nil => Ok(None),
            Value::Str(s) => Ok(Some(s)),
            _ => Err(self.corrupt("bad debug string")),
        }
    }

    /// Read an upvalue position into its intermediate record. A reference
    /// means the record is shared with a closure decoded earlier, which is
    /// exactly how upvalue sharing survives the trip.
    fn read_upval_record(&mut self) -> Result<Rc<RefCell<UpvalRecord>>, PersistError> {
        let word = self.input.i32()?;
        if word > REF_OFFSET {
            let id = (word - REF_OFFSET) as u32;
            return match self.refs.get(id) {
                Some(Restored::Upval(r)) => Ok(r.clone()),
                _ => Err(self.corrupt(format!("invalid reference #{id}"))),
            };
        }
        if word == PERMANENT {
            self.read_permanent()?;
            return Err(ErrorKind::PermsViolation(
                "bad permanent value (upvalue expected)".to_string(),
            )
            .into());
        }
        if word != Kind::Upval as i32 {
            return Err(self.corrupt(format!("trying to unpersist unknown type {word}")));
        }
        let rec = Rc::new(RefCell::new(UpvalRecord::default()));
        self.refs.register(Restored::Upval(rec.clone()));
        let value = self.unpersist()?;
        rec.borrow_mut().value = value;
        Ok(rec)
    }

    fn read_thread(&mut self) -> Result<Value, PersistError> {
        let thread = Rc::new(RefCell::new(Thread::raw()));
        let v = Value::Thread(thread.clone());
        self.refs.register(Restored::Value(v.clone()));

        {
            let mut t = thread.borrow_mut();
            let status = self.input.u8()?;
            t.status = ThreadStatus::try_from(status)
                .map_err(|_| self.corrupt(format!("bad thread status {status}")))?;
            t.ncalls = self.input.u16()?;
            t.allow_hook = self.input.u8()? != 0;
        }

        let stack_size = self.input.i32()?;
        let stack_size = self.count(stack_size)?;
        let top = self.input.usize()?;
        if top > stack_size {
            return Err(self.corrupt("thread stack offset out of bounds"));
        }
        {
            let mut t = thread.borrow_mut();
            t.stack = vec![Value::Nil; stack_size];
            t.top = top;
        }

        self.path.push(|| ".stack".to_string());
        for i in 0..top {
            self.path.push(|| format!("[{i}]"));
            let slot = self.unpersist()?;
            thread.borrow_mut().stack[i] = slot;
            self.path.pop();
        }
        self.path.pop();

        self.path.push(|| ".callinfo".to_string());
        let mut level = 0usize;
        loop {
            self.path.push(|| format!("[{level}]"));
            let func = self.input.usize()?;
            let ftop = self.input.usize()?;
            let nresults = self.input.i16()?;
            let flags = self.input.u8()?;
            let extra = self.input.isize()?;
            let kind = if flags & frame_flags::SCRIPT != 0 {
                let base = self.input.usize()?;
                let saved_pc = self.input.usize()?;
                // the frame's function was reconstructed with the stack above
                let is_script = {
                    let t = thread.borrow();
                    matches!(
                        t.stack.get(func),
                        Some(Value::Function(Function::Script(_)))
                    )
                };
                if !is_script {
                    return Err(
                        self.corrupt("stack frame function is not an interpreted closure")
                    );
                }
                FrameKind::Script { base, saved_pc }
            } else {
                let status = self.input.u8()?;
                let cont = if flags & (frame_flags::YIELDED | frame_flags::YIELDED_PCALL) != 0 {
                    let ctx = self.input.u32()?;
                    let k = self.unpersist()?;
                    if !matches!(k, Value::Function(Function::Native(_))) {
                        return Err(self.corrupt("invalid continuation function"));
                    }
                    Some(Continuation { ctx, func: k })
                } else {
                    None
                };
                FrameKind::Native { status, cont }
            };
            thread.borrow_mut().frames.push(CallFrame {
                func,
                top: ftop,
                nresults,
                flags,
                extra,
                kind,
            });
            self.path.pop();
            level += 1;
            if self.input.u8()? != 0 {
                break;
            }
        }
        self.path.pop();

        self.path.push(|| ".openupval".to_string());
        let mut level = 0usize;
        loop {
            let offset = self.input.usize()?;
            if offset == usize::MAX {
                break;
            }
            self.path.push(|| format!("[{level}]"));
            if offset >= stack_size {
                return Err(self.corrupt("thread stack offset out of bounds"));
            }
            let rec = self.read_upval_record()?;
            let fresh = Vm::find_open_upvalue(&thread, offset);
            {
                let mut r = rec.borrow_mut();
                if r.reopened.is_some() {
                    // closures decoded before this thread bound the upvalue
                    // closed; re-point every one of them at the open cell
                    for (closure, slot) in &r.backrefs {
                        let mut c = closure.borrow_mut();
                        if let Some(s) = c.upvalues.get_mut(*slot) {
                            *s = fresh.clone();
                        }
                    }
                }
                r.reopened = Some(fresh);
            }
            self.path.pop();
            level += 1;
        }
        self.path.pop();
        Ok(v)
    }
}
