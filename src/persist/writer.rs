//! The persist side: recursive type dispatch over a live value graph.
//!
//! Every non-trivial value is bound to a reference id *before* its body is
//! written, so cycles degrade into references. Prototypes and upvalues are
//! keyed through surrogate identities because they are not first-class
//! values.

use std::cell::RefCell;
use std::rc::Rc;

use crate::runtime::program::FuncProto;
use crate::runtime::value::{ObjKey, Table, Userdata, Value};
use crate::runtime::vm::{
    frame_flags, upvalue_value, CallFrame, FrameKind, Function, SharedUpValue, Thread,
    ThreadStatus, Vm,
};
use crate::Config;

use super::path::{format_key, PathTrace};
use super::perms::PermsOut;
use super::reftbl::WriteRefs;
use super::stream::Writer;
use super::{kind_of, ErrorKind, Kind, PersistError, PERMANENT, REF_OFFSET};

pub(crate) fn run<'a>(
    vm: &'a mut Vm,
    cfg: &'a Config,
    perms: &'a PermsOut,
    value: &Value,
    out: Writer<'a>,
) -> Result<(), PersistError> {
    let mut ctx = PersistCtx {
        vm,
        cfg,
        perms,
        refs: WriteRefs::new(),
        path: PathTrace::new(cfg.track_path),
        out,
        depth: 0,
    };
    ctx.path.push(|| "root".to_string());
    match ctx.persist(value) {
        Ok(()) => Ok(()),
        Err(mut e) => {
            if e.path.is_none() {
                e.path = ctx.path.render();
            }
            Err(e)
        }
    }
}

enum SpecialAction {
    Literal,
    Reconstruct(Value),
}

struct PersistCtx<'a> {
    vm: &'a mut Vm,
    cfg: &'a Config,
    perms: &'a PermsOut,
    refs: WriteRefs,
    path: PathTrace,
    out: Writer<'a>,
    depth: usize,
}

impl<'a> PersistCtx<'a> {
    /// Top-level dispatcher. Trivially small values are always inline; a
    /// reference would cost as much as the value itself.
    fn persist(&mut self, v: &Value) -> Result<(), PersistError> {
        if self.depth >= self.cfg.max_depth {
            return Err(ErrorKind::TooDeep.into());
        }
        self.depth += 1;
        let r = self.persist_value(v);
        self.depth -= 1;
        r
    }

    fn persist_value(&mut self, v: &Value) -> Result<(), PersistError> {
        let kind = kind_of(v);
        match v.obj_key() {
            None => {
                self.out.i32(kind as i32)?;
                match v {
                    Value::Nil => Ok(()),
                    Value::Boolean(b) => self.out.u8(*b as u8),
                    Value::LightPtr(p) => self.out.usize(*p),
                    Value::Number(n) => self.out.f64(*n),
                    _ => unreachable!("reference kind without identity"),
                }
            }
            Some(key) => self.persist_keyed(key, kind, v),
        }
    }

    /// Keyed persistence: reference check, id assignment, permanents check,
    /// then the kind body. Used with the value's own identity for first-class
    /// values; prototypes and upvalues go through the same sequence with a
    /// surrogate key (see `write_proto_keyed` / `write_upvalue_keyed`).
    fn persist_keyed(&mut self, key: ObjKey, kind: Kind, v: &Value) -> Result<(), PersistError> {
        if let Some(id) = self.refs.lookup(key) {
            return self.out.i32(REF_OFFSET + id as i32);
        }
        self.refs.insert(key);
        if let Some(perm_key) = self.perms.lookup(key) {
            let perm_key = perm_key.clone();
            self.out.i32(PERMANENT)?;
            self.out.i32(kind as i32)?;
            return self.persist(&perm_key);
        }
        self.out.i32(kind as i32)?;
        match v {
            Value::Str(s) => {
                self.out.usize(s.len())?;
                self.out.bytes(s.as_bytes())
            }
            Value::Table(t) => self.write_table(t),
            Value::Userdata(u) => self.write_userdata(u),
            Value::Function(f) => self.write_closure(f),
            Value::Thread(t) => self.write_thread(t),
            _ => unreachable!("inline kind in keyed path"),
        }
    }

    /// Consult the metatable's persistence field. Tables may be persisted
    /// literally by default; userdata only with explicit consent.
    fn special_action(&mut self, obj: &Value) -> Result<SpecialAction, PersistError> {
        let is_table = matches!(obj, Value::Table(_));
        let mut allow = is_table;
        let metatable = match obj {
            Value::Table(t) => t.borrow().metatable.clone(),
            Value::Userdata(u) => u.borrow().metatable.clone(),
            _ => None,
        };
        if let Some(mt) = metatable {
            let field = mt.borrow().get(&Value::str(&self.cfg.persist_key));
            match field {
                Value::Nil => {}
                Value::Boolean(b) => allow = b,
                f @ Value::Function(_) => {
                    let mut args = vec![obj.clone()];
                    if self.cfg.pass_io {
                        args.push(Value::LightPtr(self.out.handle_addr()));
                    }
                    let ret = self.vm.call(&f, &args).map_err(ErrorKind::Vm)?;
                    if !matches!(ret, Value::Function(_)) {
                        return Err(ErrorKind::BadSpecialCallback(format!(
                            "{} did not return a function",
                            self.cfg.persist_key
                        ))
                        .into());
                    }
                    return Ok(SpecialAction::Reconstruct(ret));
                }
                _ => {
                    return Err(ErrorKind::BadSpecialCallback(format!(
                        "{} must be nil, a boolean, or a function",
                        self.cfg.persist_key
                    ))
                    .into())
                }
            }
        }
        if allow {
            Ok(SpecialAction::Literal)
        } else if is_table {
            Err(ErrorKind::Forbidden("attempt to persist forbidden table".to_string()).into())
        } else {
            Err(ErrorKind::Forbidden(
                "literally persisting userdata is disabled by default".to_string(),
            )
            .into())
        }
    }

    fn write_table(&mut self, t: &Rc<RefCell<Table>>) -> Result<(), PersistError> {
        match self.special_action(&Value::Table(t.clone()))? {
            SpecialAction::Reconstruct(f) => {
                self.out.u8(1)?;
                self.persist(&f)
            }
            SpecialAction::Literal => {
                self.out.u8(0)?;
                let pairs: Vec<(Value, Value)> = t
                    .borrow()
                    .entries
                    .iter()
                    .map(|(k, v)| (k.value().clone(), v.clone()))
                    .collect();
                for (k, v) in &pairs {
                    self.path.push(|| format_key(k));
                    self.persist(k)?;
                    self.persist(v)?;
                    self.path.pop();
                }
                // nil key terminates the pair list
                self.persist(&Value::Nil)?;
                let mt = t.borrow().metatable.clone();
                self.write_metatable(&mt)
            }
        }
    }

    fn write_userdata(&mut self, u: &Rc<RefCell<Userdata>>) -> Result<(), PersistError> {
        match self.special_action(&Value::Userdata(u.clone()))? {
            SpecialAction::Reconstruct(f) => {
                self.out.u8(1)?;
                self.persist(&f)
            }
            SpecialAction::Literal => {
                self.out.u8(0)?;
                let (data, mt) = {
                    let ud = u.borrow();
                    (ud.data.clone(), ud.metatable.clone())
                };
                self.out.usize(data.len())?;
                self.out.bytes(&data)?;
                self.write_metatable(&mt)
            }
        }
    }

    fn write_metatable(&mut self, mt: &Option<Rc<RefCell<Table>>>) -> Result<(), PersistError> {
        self.path.push(|| "@metatable".to_string());
        match mt {
            Some(m) => self.persist(&Value::Table(m.clone()))?,
            None => self.persist(&Value::Nil)?,
        }
        self.path.pop();
        Ok(())
    }

    fn write_closure(&mut self, f: &Function) -> Result<(), PersistError> {
        match f {
            // bare natives only travel through the permanents table, which
            // the keyed path already checked
            Function::Native(nf) => Err(ErrorKind::Unsupported(format!(
                "attempt to persist a light native function ({:#x})",
                *nf as usize
            ))
            .into()),
            Function::NativeClosure(nc) => {
                self.out.u8(1)?;
                let (func, ups) = {
                    let c = nc.borrow();
                    (c.func, c.upvalues.clone())
                };
                self.out.u8(ups.len() as u8)?;
                self.persist(&Value::Function(Function::Native(func)))?;
                self.path.push(|| ".upvalues".to_string());
                for (i, v) in ups.iter().enumerate() {
                    self.path.push(|| format!("[{}]", i + 1));
                    // native-closure upvalues are plain values, never shared
                    self.persist(v)?;
                    self.path.pop();
                }
                self.path.pop();
                Ok(())
            }
            Function::Script(sc) => {
                self.out.u8(0)?;
                let (proto, ups) = {
                    let c = sc.borrow();
                    (c.proto.clone(), c.upvalues.clone())
                };
                self.out.u8(ups.len() as u8)?;
                self.path.push(|| ".proto".to_string());
                self.write_proto_keyed(&proto)?;
                self.path.pop();
                self.path.push(|| ".upvalues".to_string());
                for (i, uv) in ups.iter().enumerate() {
                    self.path.push(|| format!("[{}]", i + 1));
                    self.write_upvalue_keyed(uv)?;
                    self.path.pop();
                }
                self.path.pop();
                Ok(())
            }
        }
    }

    fn write_proto_keyed(&mut self, proto: &Rc<RefCell<FuncProto>>) -> Result<(), PersistError> {
        let key = ObjKey::Proto(Rc::as_ptr(proto) as usize);
        if let Some(id) = self.refs.lookup(key) {
            return self.out.i32(REF_OFFSET + id as i32);
        }
        self.refs.insert(key);
        if let Some(perm_key) = self.perms.lookup(key) {
            let perm_key = perm_key.clone();
            self.out.i32(PERMANENT)?;
            self.out.i32(Kind::Proto as i32)?;
            return self.persist(&perm_key);
        }
        self.out.i32(Kind::Proto as i32)?;
        self.write_proto_body(proto)
    }

    fn write_proto_body(&mut self, proto: &Rc<RefCell<FuncProto>>) -> Result<(), PersistError> {
        // snapshot so recursing into constants cannot observe a held borrow
        let (header, code, constants, protos, upvalues, source, line_info, locals) = {
            let p = proto.borrow();
            (
                (
                    p.line_defined,
                    p.last_line_defined,
                    p.nparams,
                    p.is_vararg,
                    p.max_stack,
                ),
                p.code.clone(),
                p.constants.clone(),
                p.protos.clone(),
                p.upvalues.clone(),
                p.source.clone(),
                p.line_info.clone(),
                p.locals.clone(),
            )
        };
        let (line_defined, last_line_defined, nparams, is_vararg, max_stack) = header;
        self.out.i32(line_defined)?;
        self.out.i32(last_line_defined)?;
        self.out.u8(nparams)?;
        self.out.u8(is_vararg as u8)?;
        self.out.u8(max_stack)?;

        self.out.i32(code.len() as i32)?;
        for instr in &code {
            self.out.u32(instr.pack())?;
        }

        self.out.i32(constants.len() as i32)?;
        self.path.push(|| ".constants".to_string());
        for (i, k) in constants.iter().enumerate() {
            self.path.push(|| format!("[{i}]"));
            self.persist(k)?;
            self.path.pop();
        }
        self.path.pop();

        self.out.i32(protos.len() as i32)?;
        self.path.push(|| ".protos".to_string());
        for (i, child) in protos.iter().enumerate() {
            self.path.push(|| format!("[{i}]"));
            self.write_proto_keyed(child)?;
            self.path.pop();
        }
        self.path.pop();

        self.out.i32(upvalues.len() as i32)?;
        for desc in &upvalues {
            self.out.u8(desc.in_stack as u8)?;
            self.out.u8(desc.index)?;
        }

        self.out.u8(self.cfg.debug_info as u8)?;
        if !self.cfg.debug_info {
            return Ok(());
        }

        match &source {
            Some(s) => self.persist(&Value::Str(s.clone()))?,
            None => self.persist(&Value::Nil)?,
        }

        self.out.i32(line_info.len() as i32)?;
        for line in &line_info {
            self.out.i32(*line)?;
        }

        self.out.i32(locals.len() as i32)?;
        self.path.push(|| ".locvars".to_string());
        for (i, loc) in locals.iter().enumerate() {
            self.path.push(|| format!("[{i}]"));
            self.out.i32(loc.start_pc)?;
            self.out.i32(loc.end_pc)?;
            match &loc.name {
                Some(s) => self.persist(&Value::Str(s.clone()))?,
                None => self.persist(&Value::Nil)?,
            }
            self.path.pop();
        }
        self.path.pop();

        self.path.push(|| ".upvalnames".to_string());
        for (i, desc) in upvalues.iter().enumerate() {
            self.path.push(|| format!("[{i}]"));
            match &desc.name {
                Some(s) => self.persist(&Value::Str(s.clone()))?,
                None => self.persist(&Value::Nil)?,
            }
            self.path.pop();
        }
        self.path.pop();
        Ok(())
    }

    /// Keyed by the upvalue cell's address: two closures sharing the cell
    /// share the reference id, which is all the reader needs to restore the
    /// sharing. The body, written once, is the current value.
    fn write_upvalue_keyed(&mut self, uv: &SharedUpValue) -> Result<(), PersistError> {
        let key = ObjKey::Upvalue(Rc::as_ptr(uv) as usize);
        if let Some(id) = self.refs.lookup(key) {
            return self.out.i32(REF_OFFSET + id as i32);
        }
        self.refs.insert(key);
        if let Some(perm_key) = self.perms.lookup(key) {
            let perm_key = perm_key.clone();
            self.out.i32(PERMANENT)?;
            self.out.i32(Kind::Upval as i32)?;
            return self.persist(&perm_key);
        }
        self.out.i32(Kind::Upval as i32)?;
        let v = upvalue_value(uv).map_err(ErrorKind::Vm)?;
        self.persist(&v)
    }

    fn write_thread(&mut self, t: &Rc<RefCell<Thread>>) -> Result<(), PersistError> {
        if let Some(cur) = self.vm.current_thread() {
            if Rc::ptr_eq(&cur, t) {
                return Err(ErrorKind::Unsupported(
                    "cannot persist currently running thread".to_string(),
                )
                .into());
            }
        }
        let (status, ncalls, allow_hook, has_hook, errfunc, err_jmp, stack_len, top, frames, open) = {
            let th = t.borrow();
            (
                th.status,
                th.ncalls,
                th.allow_hook,
                th.hook.is_some(),
                th.errfunc,
                th.err_jmp,
                th.stack.len(),
                th.top,
                th.frames.clone(),
                th.open_upvalues.clone(),
            )
        };
        if status == ThreadStatus::Running {
            return Err(ErrorKind::Unsupported(
                "cannot persist currently running thread".to_string(),
            )
            .into());
        }
        if err_jmp || errfunc != 0 {
            return Err(ErrorKind::Unsupported(
                "cannot persist thread with an active error handler".to_string(),
            )
            .into());
        }
        if frames.is_empty() {
            return Err(
                ErrorKind::Unsupported("cannot persist thread without call frames".to_string())
                    .into(),
            );
        }
        if has_hook {
            log::warn!("dropping debug hook of persisted thread");
        }

        self.out.u8(status as u8)?;
        self.out.u16(ncalls)?;
        self.out.u8(allow_hook as u8)?;

        self.out.i32(stack_len as i32)?;
        self.out.usize(top)?;
        self.path.push(|| ".stack".to_string());
        for i in 0..top {
            self.path.push(|| format!("[{i}]"));
            let slot = {
                let th = t.borrow();
                th.stack.get(i).cloned().unwrap_or(Value::Nil)
            };
            self.persist(&slot)?;
            self.path.pop();
        }
        self.path.pop();

        self.path.push(|| ".callinfo".to_string());
        for (i, frame) in frames.iter().enumerate() {
            self.path.push(|| format!("[{i}]"));
            self.write_frame(frame)?;
            self.out.u8((i + 1 == frames.len()) as u8)?;
            self.path.pop();
        }
        self.path.pop();

        self.path.push(|| ".openupval".to_string());
        for (i, (index, uv)) in open.iter().enumerate() {
            self.path.push(|| format!("[{i}]"));
            self.out.usize(*index)?;
            self.write_upvalue_keyed(uv)?;
            self.path.pop();
        }
        self.out.usize(usize::MAX)?;
        self.path.pop();
        Ok(())
    }

    fn write_frame(&mut self, frame: &CallFrame) -> Result<(), PersistError> {
        if frame.flags & frame_flags::HOOK_YIELD != 0 {
            return Err(ErrorKind::Unsupported("cannot persist yielded hooks".to_string()).into());
        }
        // the script bit must agree with the frame body that follows
        let mut flags = frame.flags;
        match &frame.kind {
            FrameKind::Script { .. } => flags |= frame_flags::SCRIPT,
            FrameKind::Native { .. } => flags &= !frame_flags::SCRIPT,
        }
        self.out.usize(frame.func)?;
        self.out.usize(frame.top)?;
        self.out.i16(frame.nresults)?;
        self.out.u8(flags)?;
        self.out.isize(frame.extra)?;
        match &frame.kind {
            FrameKind::Script { base, saved_pc } => {
                self.out.usize(*base)?;
                self.out.usize(*saved_pc)?;
            }
            FrameKind::Native { status, cont } => {
                self.out.u8(*status)?;
                if flags & (frame_flags::YIELDED | frame_flags::YIELDED_PCALL) != 0 {
                    let c = cont.as_ref().ok_or_else(|| {
                        ErrorKind::Unsupported(
                            "yielded native frame without continuation".to_string(),
                        )
                    })?;
                    self.out.u32(c.ctx)?;
                    self.persist(&c.func)?;
                }
            }
        }
        Ok(())
    }
}
