//! orus-natives — native-function registry for Orus intrinsic module exports.
//!
//! A module's `io`, `math`, `time`, and `os` exports are intrinsics: their
//! register/type metadata lives in the module's export table like any other
//! symbol, but their implementation is a native callable bound by symbol at
//! load time rather than a compiled function stub. This crate owns that
//! binding: a registry from fully-qualified name (`module.name`) to
//! [`NativeFn`], plus the small amount of host context (stdout, a KV `env`)
//! natives need.
//!
//! Unlike a self-contained FFI value type, natives here operate directly on
//! [`orus_core::Value`]: a native that builds a `String`/`Array`/`Error`
//! result needs the same [`orus_core::Heap`] the VM itself uses, so every
//! call site threads one through.

#![deny(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
use std::{
    boxed::Box,
    collections::BTreeMap,
    format,
    string::{String, ToString},
    vec::Vec,
};

#[cfg(not(feature = "std"))]
use alloc::{
    boxed::Box,
    collections::BTreeMap,
    format,
    string::{String, ToString},
    vec::Vec,
};

use core::fmt;

use orus_core::{Heap, ObjString, Value};

#[cfg(feature = "std")]
use std::io::{self, Write};

#[cfg(feature = "std")]
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(feature = "errors")]
use thiserror::Error;

/// Errors a native call or registry lookup can raise.
#[cfg_attr(feature = "errors", derive(Error))]
#[derive(Debug)]
pub enum NativeError {
    /// No native is registered under this fully-qualified name.
    #[cfg_attr(feature = "errors", error("native not found: {0}"))]
    NotFound(String),
    /// `register_fn` declared a fixed arity the call didn't match.
    #[cfg_attr(feature = "errors", error("wrong arity: expected {expected}, got {got}"))]
    Arity {
        /// Arity the native was registered with.
        expected: usize,
        /// Argument count the call actually provided.
        got: usize,
    },
    /// An argument's tag didn't match what the native expected.
    #[cfg_attr(feature = "errors", error("wrong type: expected {0}"))]
    Type(String),
    /// Host I/O failure.
    #[cfg(feature = "std")]
    #[cfg_attr(feature = "errors", error("io: {0}"))]
    Io(#[cfg_attr(feature = "errors", from)] io::Error),
    /// Anything else, carried as a message.
    #[cfg_attr(feature = "errors", error("{0}"))]
    Msg(String),
}

#[cfg(not(feature = "errors"))]
impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeError::NotFound(name) => write!(f, "native not found: {name}"),
            NativeError::Arity { expected, got } => {
                write!(f, "wrong arity: expected {expected}, got {got}")
            }
            NativeError::Type(t) => write!(f, "wrong type: expected {t}"),
            #[cfg(feature = "std")]
            NativeError::Io(e) => write!(f, "io: {e}"),
            NativeError::Msg(m) => write!(f, "{m}"),
        }
    }
}

#[cfg(all(feature = "std", not(feature = "errors")))]
impl From<io::Error> for NativeError {
    fn from(e: io::Error) -> Self {
        NativeError::Io(e)
    }
}

/// Result type every native call returns.
pub type NativeResult<T> = Result<T, NativeError>;

/// Host context passed to every native call: where `io.print`/`io.println`
/// write, a shared KV `env`, and the heap any string/array/error result must
/// be allocated through.
pub struct NativeCtx<'a> {
    /// Destination for `io.print`/`io.println`. Only meaningful under `std`;
    /// natives compiled without it must not assume a sink exists.
    #[cfg(feature = "std")]
    pub stdout: &'a mut (dyn Write + Send),
    /// A small key/value store natives can use to share state across calls.
    pub env: &'a mut BTreeMap<String, Value>,
    /// Heap to allocate string/array/error results through.
    pub heap: &'a mut Heap,
}

#[cfg(feature = "std")]
impl NativeCtx<'_> {
    /// Writes raw text to `stdout`.
    pub fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.stdout.write_all(s.as_bytes())
    }
    /// Writes `s` followed by a newline.
    pub fn writeln_str(&mut self, s: &str) -> io::Result<()> {
        self.stdout.write_all(s.as_bytes())?;
        self.stdout.write_all(b"\n")
    }
}

/// A native function: raw arguments in, a heap-aware context, a `Value` out.
pub type NativeFn = fn(&[Value], &mut NativeCtx<'_>) -> NativeResult<Value>;

/// One registered native: its fully-qualified name, declared arity (if
/// fixed), and function pointer.
#[derive(Clone)]
pub struct NativeEntry {
    /// `module.name`.
    pub fqname: String,
    /// Required argument count, or `None` if the native checks its own.
    pub arity: Option<usize>,
    /// The callable.
    pub func: NativeFn,
}

/// Registry of natives plus the host context they share. Intrinsic module
/// exports resolve their `intrinsic_symbol` against this at bind time.
pub struct NativeRegistry {
    entries: BTreeMap<String, NativeEntry>,
    #[cfg(feature = "std")]
    stdout: Box<dyn Write + Send>,
    env: BTreeMap<String, Value>,
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRegistry {
    /// An empty registry, writing to real stdout under `std`.
    pub fn new() -> Self {
        NativeRegistry {
            entries: BTreeMap::new(),
            #[cfg(feature = "std")]
            stdout: Box::new(io::stdout()),
            env: BTreeMap::new(),
        }
    }

    /// Swaps in a custom stdout sink (tests use this to capture output).
    #[cfg(feature = "std")]
    pub fn with_stdout<W: Write + Send + 'static>(mut self, w: W) -> Self {
        self.stdout = Box::new(w);
        self
    }

    /// Read-only view of the shared `env` store.
    pub fn env(&self) -> &BTreeMap<String, Value> {
        &self.env
    }

    /// Writes `s` to the registry's stdout sink, optionally followed by a
    /// newline. Backs the dispatch core's bare `OP_PRINT*` opcodes, which
    /// write directly rather than going through `io.print`/`io.println`.
    #[cfg(feature = "std")]
    pub fn write_stdout(&mut self, s: &str, newline: bool) -> io::Result<()> {
        self.stdout.write_all(s.as_bytes())?;
        if newline {
            self.stdout.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Registers one native under `module.name`.
    pub fn register_fn(&mut self, module: &str, name: &str, arity: Option<usize>, func: NativeFn) {
        let fqname = format!("{module}.{name}");
        self.entries.insert(fqname.clone(), NativeEntry { fqname, arity, func });
    }

    /// Registers a whole module's worth of natives at once.
    pub fn register_all(&mut self, module: &str, entries: &[(&str, Option<usize>, NativeFn)]) {
        for (name, arity, func) in entries {
            self.register_fn(module, name, *arity, *func);
        }
    }

    /// Looks up `fqname`'s entry without calling it — used by the module
    /// loader to validate an `intrinsic_symbol` at bind time.
    pub fn lookup(&self, fqname: &str) -> Option<&NativeEntry> {
        self.entries.get(fqname)
    }

    /// Calls `fqname` with `args`, allocating any result through `heap`.
    pub fn call(&mut self, fqname: &str, args: &[Value], heap: &mut Heap) -> NativeResult<Value> {
        let entry = self
            .entries
            .get(fqname)
            .ok_or_else(|| NativeError::NotFound(fqname.to_string()))?;
        if let Some(expected) = entry.arity {
            if args.len() != expected {
                return Err(NativeError::Arity { expected, got: args.len() });
            }
        }
        let func = entry.func;
        #[cfg(feature = "std")]
        let mut ctx = NativeCtx { stdout: &mut *self.stdout, env: &mut self.env, heap };
        #[cfg(not(feature = "std"))]
        let mut ctx = NativeCtx { env: &mut self.env, heap };
        func(args, &mut ctx)
    }

    /// A registry preloaded with the default `io`/`time`/`math`/`os` natives.
    /// File and environment access are `std`-only; under `alloc-only` those
    /// modules are simply absent from the registry.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();

        #[cfg(feature = "std")]
        reg.register_all(
            "io",
            &[
                ("print", Some(1), native_io_print as NativeFn),
                ("println", Some(1), native_io_println as NativeFn),
                ("read", Some(1), native_io_read_file as NativeFn),
                ("write", Some(2), native_io_write_file as NativeFn),
            ],
        );

        #[cfg(feature = "std")]
        reg.register_all("time", &[("now_ms", Some(0), native_time_now_ms as NativeFn)]);

        reg.register_all(
            "math",
            &[
                ("abs", Some(1), native_math_abs as NativeFn),
                ("floor", Some(1), native_math_floor as NativeFn),
                ("ceil", Some(1), native_math_ceil as NativeFn),
                ("sqrt", Some(1), native_math_sqrt as NativeFn),
            ],
        );

        #[cfg(feature = "std")]
        reg.register_all(
            "os",
            &[
                ("getenv", Some(1), native_os_getenv as NativeFn),
                ("setenv", Some(2), native_os_setenv as NativeFn),
            ],
        );

        reg
    }
}

fn expect_str(v: &Value) -> NativeResult<String> {
    match v {
        Value::String(s) => Ok(s.flatten_str()),
        other => Err(NativeError::Type(format!("string, found {}", other.type_name()))),
    }
}

#[cfg(feature = "std")]
fn native_io_print(args: &[Value], ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    let text = orus_core::print_value(ctx.heap, &args[0]);
    ctx.write_str(&text)?;
    Ok(Value::Bool(true))
}

#[cfg(feature = "std")]
fn native_io_println(args: &[Value], ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    let text = orus_core::print_value(ctx.heap, &args[0]);
    ctx.writeln_str(&text)?;
    Ok(Value::Bool(true))
}

#[cfg(feature = "std")]
fn native_io_read_file(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    let path = expect_str(&args[0])?;
    let text = std::fs::read_to_string(path)?;
    Ok(Value::String(ObjString::from_owned(text)))
}

#[cfg(feature = "std")]
fn native_io_write_file(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    let path = expect_str(&args[0])?;
    let text = expect_str(&args[1])?;
    if let Some(parent) = std::path::Path::new(&path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::write(path, text.as_bytes())?;
    Ok(Value::Bool(true))
}

#[cfg(feature = "std")]
fn native_time_now_ms(_args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| NativeError::Msg(format!("clock error: {e}")))?;
    Ok(Value::I64(elapsed.as_millis() as i64))
}

fn native_math_abs(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    match &args[0] {
        Value::I32(n) => Ok(Value::I32(n.wrapping_abs())),
        Value::I64(n) => Ok(Value::I64(n.wrapping_abs())),
        Value::F64(x) => Ok(Value::F64(x.abs())),
        other => Err(NativeError::Type(format!("number, found {}", other.type_name()))),
    }
}

fn native_math_floor(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    match &args[0] {
        Value::I32(n) => Ok(Value::I32(*n)),
        Value::I64(n) => Ok(Value::I64(*n)),
        Value::F64(x) => Ok(Value::F64(x.floor())),
        other => Err(NativeError::Type(format!("number, found {}", other.type_name()))),
    }
}

fn native_math_ceil(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    match &args[0] {
        Value::I32(n) => Ok(Value::I32(*n)),
        Value::I64(n) => Ok(Value::I64(*n)),
        Value::F64(x) => Ok(Value::F64(x.ceil())),
        other => Err(NativeError::Type(format!("number, found {}", other.type_name()))),
    }
}

fn native_math_sqrt(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    match &args[0] {
        Value::I32(n) => Ok(Value::F64((*n as f64).sqrt())),
        Value::I64(n) => Ok(Value::F64((*n as f64).sqrt())),
        Value::F64(x) => Ok(Value::F64(x.sqrt())),
        other => Err(NativeError::Type(format!("number, found {}", other.type_name()))),
    }
}

#[cfg(feature = "std")]
fn native_os_getenv(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    let key = expect_str(&args[0])?;
    match std::env::var(&key) {
        Ok(v) => Ok(Value::String(ObjString::from_owned(v))),
        Err(_) => Ok(Value::Bool(false)),
    }
}

#[cfg(feature = "std")]
fn native_os_setenv(args: &[Value], _ctx: &mut NativeCtx<'_>) -> NativeResult<Value> {
    let key = expect_str(&args[0])?;
    let val = expect_str(&args[1])?;
    std::env::set_var(key, val);
    Ok(Value::Bool(true))
}

/// A small `stdout` sink that captures writes into a `String`, used by tests
/// that need to assert on `io.print`/`io.println` output.
#[cfg(feature = "std")]
#[derive(Default, Clone)]
pub struct Captured(std::sync::Arc<std::sync::Mutex<String>>);

#[cfg(feature = "std")]
impl Captured {
    /// A copy of everything captured so far.
    pub fn get(&self) -> String {
        self.0.lock().unwrap().clone()
    }
}

#[cfg(feature = "std")]
impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().push_str(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::strategy::Strategy;

    #[cfg(feature = "std")]
    #[test]
    fn default_natives_print_and_compute() {
        let cap = Captured::default();
        let mut reg = NativeRegistry::with_defaults().with_stdout(cap.clone());
        let mut heap = Heap::new();

        reg.call("io.println", &[Value::I32(7)], &mut heap).unwrap();
        assert!(cap.get().contains('7'));

        let now = reg.call("time.now_ms", &[], &mut heap).unwrap();
        match now {
            Value::I64(ms) => assert!(ms > 0),
            other => panic!("expected I64, got {other:?}"),
        }

        let abs = reg.call("math.abs", &[Value::I32(-42)], &mut heap).unwrap();
        match abs {
            Value::I32(42) => {}
            other => panic!("expected I32(42), got {other:?}"),
        }
    }

    #[test]
    fn math_natives_widen_on_float_input() {
        let mut reg = NativeRegistry::new();
        reg.register_all(
            "math",
            &[
                ("abs", Some(1), native_math_abs as NativeFn),
                ("sqrt", Some(1), native_math_sqrt as NativeFn),
            ],
        );
        let mut heap = Heap::new();
        match reg.call("math.sqrt", &[Value::I32(9)], &mut heap).unwrap() {
            Value::F64(x) => assert!((x - 3.0).abs() < 1e-9),
            other => panic!("expected F64, got {other:?}"),
        }
    }

    #[test]
    fn unknown_native_reports_not_found() {
        let mut reg = NativeRegistry::new();
        let mut heap = Heap::new();
        let err = reg.call("nope.nope", &[], &mut heap).unwrap_err();
        match err {
            NativeError::NotFound(name) => assert_eq!(name, "nope.nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn arity_mismatch_is_rejected_before_the_call_runs() {
        let mut reg = NativeRegistry::new();
        reg.register_fn("demo", "id", Some(1), |args, _ctx| Ok(args[0].clone()));
        let mut heap = Heap::new();
        let err = reg.call("demo.id", &[], &mut heap).unwrap_err();
        match err {
            NativeError::Arity { expected: 1, got: 0 } => {}
            other => panic!("expected Arity{{1,0}}, got {other:?}"),
        }
    }

    #[cfg(feature = "std")]
    #[test]
    fn io_read_and_write_round_trip_through_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeting.txt");
        let path_str = path.to_str().unwrap().to_string();

        let mut reg = NativeRegistry::with_defaults();
        let mut heap = Heap::new();
        reg.call(
            "io.write",
            &[
                Value::String(ObjString::from_owned(path_str.clone())),
                Value::String(ObjString::from_owned("hi there".to_string())),
            ],
            &mut heap,
        )
        .unwrap();

        let read_back = reg
            .call("io.read", &[Value::String(ObjString::from_owned(path_str))], &mut heap)
            .unwrap();
        match read_back {
            Value::String(s) => assert_eq!(s.flatten_str(), "hi there"),
            other => panic!("expected String, got {other:?}"),
        }
    }

    #[test]
    fn custom_native_can_allocate_through_the_heap() {
        let mut reg = NativeRegistry::new();
        reg.register_fn("demo", "greet", Some(1), |args, ctx| {
            let name = expect_str(&args[0])?;
            let _ = ctx.heap.arrays.len();
            Ok(Value::String(ObjString::from_owned(format!("hello, {name}"))))
        });
        let mut heap = Heap::new();
        let greeting = reg
            .call("demo.greet", &[Value::String(ObjString::from_owned("orus".to_string()))], &mut heap)
            .unwrap();
        match greeting {
            Value::String(s) => assert_eq!(s.flatten_str(), "hello, orus"),
            other => panic!("expected String, got {other:?}"),
        }
    }

    proptest::proptest! {
        /// `math.abs` on an `I32` matches `wrapping_abs` exactly, including
        /// the `i32::MIN` edge case where the wrapped result stays negative.
        #[test]
        fn math_abs_i32_matches_wrapping_abs(n in proptest::prelude::any::<i32>()) {
            let mut reg = NativeRegistry::new();
            reg.register_all("math", &[("abs", Some(1), native_math_abs as NativeFn)]);
            let mut heap = Heap::new();
            let result = reg.call("math.abs", &[Value::I32(n)], &mut heap).unwrap();
            assert_eq!(result, Value::I32(n.wrapping_abs()));
        }

        /// `math.abs` on an `F64` is never negative for any finite input.
        #[test]
        fn math_abs_f64_is_never_negative(x in proptest::prelude::any::<f64>().prop_filter("finite", |x| x.is_finite())) {
            let mut reg = NativeRegistry::new();
            reg.register_all("math", &[("abs", Some(1), native_math_abs as NativeFn)]);
            let mut heap = Heap::new();
            let result = reg.call("math.abs", &[Value::F64(x)], &mut heap).unwrap();
            match result {
                Value::F64(y) => assert!(y >= 0.0),
                other => panic!("expected F64, got {other:?}"),
            }
        }
    }
}
