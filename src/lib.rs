//! Heavy-duty persistence for **amber**, a small stack-based scripting runtime.
//!
//! The crate serializes an arbitrary live value (tables with cycles, closures
//! with shared upvalues, function prototypes, suspended coroutines with their
//! call stacks) into a self-contained byte string and reconstructs a
//! semantically equivalent value inside a (possibly different) [`Vm`],
//! preserving object identity within the persisted graph.
//!
//! The two halves of the crate:
//! * [`runtime`] is the host-VM shim: values, prototypes, the frame machine
//!   that runs coroutines and special-persistence callbacks.
//! * [`persist`] is the object-graph serializer: reference tracking,
//!   permanents indirection, per-kind codecs, closure/upvalue/coroutine
//!   reconstruction.

pub mod persist;
pub mod runtime;

pub use log;

pub use persist::{dump, persist, undump, unpersist};
pub use persist::{ErrorKind, PermsIn, PermsOut, PersistError};
pub use runtime::value::Value;
pub use runtime::vm::Vm;
pub use runtime::VmError;

/// Configuration for one persist or unpersist operation.
///
/// The knobs are threaded explicitly through every entry point; there is no
/// process-wide state, so independent VMs can persist concurrently with
/// different settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Emit prototype debug information (source name, line table, local
    /// variable intervals). Readers zero-fill the fields when absent.
    pub debug_info: bool,
    /// Accumulate a human-readable path through the object graph for error
    /// messages, e.g. `(root.bad@metatable)`. Off by default because of the
    /// formatting overhead.
    pub track_path: bool,
    /// Pass the opaque I/O handle to special-persistence callbacks as an
    /// extra light-pointer argument.
    pub pass_io: bool,
    /// Name of the metatable field consulted for special persistence.
    pub persist_key: String,
    /// Recursion bound for the dispatchers; pathological graphs fail with
    /// [`ErrorKind::TooDeep`] long before the native stack gives out.
    pub max_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_info: true,
            track_path: false,
            pass_io: false,
            persist_key: "__persist".to_string(),
            max_depth: 200,
        }
    }
}
