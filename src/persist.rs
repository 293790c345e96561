//! The object-graph serializer.
//!
//! Stream layout: a header (magic, local word widths, canary number), then
//! exactly one value in the recursive format. Every value starts with a
//! framing word holding a kind tag, the `PERMANENT` marker, or, when it
//! exceeds [`REF_OFFSET`], a reference to an already transferred object.

use std::io;

use num_enum::TryFromPrimitive;
use thiserror::Error;

use crate::runtime::value::Value;
use crate::runtime::vm::Vm;
use crate::runtime::VmError;
use crate::Config;

mod path;
mod reader;
mod reftbl;
mod stream;
mod writer;

pub mod perms;

pub use perms::{PermsIn, PermsOut};

/// Kind tags as they appear in the stream. Contiguous; `PERMANENT` and the
/// reference offset sit right above them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub(crate) enum Kind {
    Nil = 0,
    Boolean = 1,
    LightPtr = 2,
    Number = 3,
    Str = 4,
    Table = 5,
    Function = 6,
    Userdata = 7,
    Thread = 8,
    Proto = 9,
    Upval = 10,
}

impl Kind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Kind::Nil => "nil",
            Kind::Boolean => "boolean",
            Kind::LightPtr => "lightpointer",
            Kind::Number => "number",
            Kind::Str => "string",
            Kind::Table => "table",
            Kind::Function => "function",
            Kind::Userdata => "userdata",
            Kind::Thread => "thread",
            Kind::Proto => "proto",
            Kind::Upval => "upvalue",
        }
    }
}

pub(crate) fn kind_of(v: &Value) -> Kind {
    match v {
        Value::Nil => Kind::Nil,
        Value::Boolean(_) => Kind::Boolean,
        Value::LightPtr(_) => Kind::LightPtr,
        Value::Number(_) => Kind::Number,
        Value::Str(_) => Kind::Str,
        Value::Table(_) => Kind::Table,
        Value::Userdata(_) => Kind::Userdata,
        Value::Function(_) => Kind::Function,
        Value::Thread(_) => Kind::Thread,
    }
}

/// Framing word marking a value replaced through the permanents table.
pub(crate) const PERMANENT: i32 = 11;
/// Framing words strictly above this are references; reference ids start
/// at 1, so the first reference on the wire is `REF_OFFSET + 1`.
pub(crate) const REF_OFFSET: i32 = 12;

const MAGIC: [u8; 4] = *b"AMBR";
/// Float canary; readers reject any bit-level difference.
const CANARY: f64 = 370.5;

/// What went wrong. Mirrors the failure taxonomy of the wire protocol.
#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("could not write data: {0}")]
    Write(io::Error),
    #[error("could not read data: {0}")]
    Read(io::Error),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    BadSpecialCallback(String),
    #[error("{0}")]
    PermsViolation(String),
    #[error("{0}")]
    StreamCorrupt(String),
    #[error("persistence recursion limit exceeded")]
    TooDeep,
    #[error("error in persistence callback: {0}")]
    Vm(#[from] VmError),
}

/// A serializer error, optionally annotated with the object-graph path at
/// which it occurred (see [`Config::track_path`]).
#[derive(Debug)]
pub struct PersistError {
    pub kind: ErrorKind,
    pub path: Option<String>,
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{} ({})", self.kind, p),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for PersistError {
    fn from(kind: ErrorKind) -> Self {
        Self { kind, path: None }
    }
}

impl From<VmError> for PersistError {
    fn from(e: VmError) -> Self {
        ErrorKind::Vm(e).into()
    }
}

/// Write the header and `value` to `out`.
pub fn dump(
    vm: &mut Vm,
    cfg: &Config,
    perms: &PermsOut,
    value: &Value,
    out: &mut dyn io::Write,
) -> Result<(), PersistError> {
    let mut w = stream::Writer::new(out);
    write_header(&mut w)?;
    writer::run(vm, cfg, perms, value, w)
}

/// Read the header and one value from `input`.
pub fn undump(
    vm: &mut Vm,
    cfg: &Config,
    perms: &PermsIn,
    input: &mut dyn io::Read,
) -> Result<Value, PersistError> {
    let mut r = stream::Reader::new(input);
    read_header(&mut r)?;
    reader::run(vm, cfg, perms, r)
}

/// Persist `value` into a fresh byte buffer.
pub fn persist(
    vm: &mut Vm,
    cfg: &Config,
    perms: &PermsOut,
    value: &Value,
) -> Result<Vec<u8>, PersistError> {
    let mut buf = Vec::new();
    dump(vm, cfg, perms, value, &mut buf)?;
    Ok(buf)
}

/// Reconstruct the value persisted in `bytes`.
pub fn unpersist(
    vm: &mut Vm,
    cfg: &Config,
    perms: &PermsIn,
    bytes: &[u8],
) -> Result<Value, PersistError> {
    let mut input = bytes;
    undump(vm, cfg, perms, &mut input)
}

fn write_header(w: &mut stream::Writer) -> Result<(), PersistError> {
    w.bytes(&MAGIC)?;
    w.u8(4)?;
    w.u8(std::mem::size_of::<usize>() as u8)?;
    w.u8(8)?;
    w.f64(CANARY)
}

fn read_header(r: &mut stream::Reader) -> Result<(), PersistError> {
    let mut magic = [0u8; 4];
    r.bytes(&mut magic)?;
    if magic != MAGIC {
        return Err(ErrorKind::StreamCorrupt("bad header magic".to_string()).into());
    }
    let int_width = r.u8()?;
    let size_width = r.u8()?;
    let number_width = r.u8()?;
    if int_width != 4
        || size_width != std::mem::size_of::<usize>() as u8
        || number_width != 8
    {
        return Err(ErrorKind::StreamCorrupt("incompatible word widths".to_string()).into());
    }
    if r.f64()?.to_bits() != CANARY.to_bits() {
        return Err(ErrorKind::StreamCorrupt("incompatible number format".to_string()).into());
    }
    Ok(())
}
