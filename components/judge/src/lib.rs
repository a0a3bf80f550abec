//! # Judge
//!
//! Execution units for the swarm worker pool. A unit loads uploaded program
//! code once and invokes its `main` entry point any number of times.
//!
//! Two kinds of program code are understood by [`Judge`]:
//!
//! * WebAssembly modules (binary, or WAT text starting with `(module`),
//!   executed with wasmer. See [`wasm`] for the calling conventions.
//! * `native:<name>` references to functions registered in a
//!   [`NativeRegistry`].

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use wasmer::{Engine, Module};

pub mod native;
pub mod wasm;

pub use native::{NativeFn, NativeRegistry, NATIVE_PREFIX};

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("program code is neither a wasm module nor a native reference")]
    UnrecognizedProgram,

    #[error("native function `{0}` is not registered")]
    UnknownNative(String),

    #[error("wasm compilation failed: {0}")]
    Compile(String),

    #[error("wasm instantiation failed: {0}")]
    Instantiate(String),

    #[error("missing export: {0}")]
    MissingExport(String),

    #[error("program trapped: {0}")]
    Trap(String),

    #[error("argument/result conversion failed: {0}")]
    Abi(String),

    #[error("no program loaded under handle {0}")]
    UnknownHandle(usize),

    #[error("{0}")]
    Native(String),
}

/// Opaque reference to a program loaded into one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramHandle(usize);

impl ProgramHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Capability to load program code and invoke its entry point.
///
/// Units are owned by exactly one worker thread and are never shared.
pub trait ExecutionUnit: Send {
    fn load(&mut self, code: &[u8]) -> Result<ProgramHandle, JudgeError>;

    fn invoke(&mut self, handle: ProgramHandle, args: &[Value]) -> Result<Value, JudgeError>;
}

enum Program {
    Wasm(Module),
    Native(NativeFn),
}

/// The default execution unit: wasm modules plus registered native functions.
pub struct Judge {
    engine: Engine,
    natives: Arc<NativeRegistry>,
    programs: Vec<Program>,
}

impl Judge {
    pub fn new(natives: Arc<NativeRegistry>) -> Self {
        Self {
            engine: Engine::default(),
            natives,
            programs: Vec::new(),
        }
    }

    pub fn with_builtins() -> Self {
        Self::new(Arc::new(NativeRegistry::with_builtins()))
    }

    fn classify(&self, code: &[u8]) -> Result<Program, JudgeError> {
        if code.starts_with(b"\0asm") || looks_like_wat(code) {
            return wasm::compile(&self.engine, code).map(Program::Wasm);
        }

        let text = std::str::from_utf8(code).map_err(|_| JudgeError::UnrecognizedProgram)?;
        let name = text
            .trim()
            .strip_prefix(NATIVE_PREFIX)
            .ok_or(JudgeError::UnrecognizedProgram)?;

        self.natives
            .get(name)
            .map(Program::Native)
            .ok_or_else(|| JudgeError::UnknownNative(name.to_string()))
    }
}

impl ExecutionUnit for Judge {
    fn load(&mut self, code: &[u8]) -> Result<ProgramHandle, JudgeError> {
        let program = self.classify(code)?;
        let kind = match program {
            Program::Wasm(_) => "wasm",
            Program::Native(_) => "native",
        };
        self.programs.push(program);
        let handle = ProgramHandle(self.programs.len() - 1);
        debug!(kind, handle = handle.0, "program loaded");
        Ok(handle)
    }

    fn invoke(&mut self, handle: ProgramHandle, args: &[Value]) -> Result<Value, JudgeError> {
        match self.programs.get(handle.0) {
            Some(Program::Wasm(module)) => wasm::run(&self.engine, module, args),
            Some(Program::Native(func)) => func(args).map_err(JudgeError::Native),
            None => Err(JudgeError::UnknownHandle(handle.0)),
        }
    }
}

fn looks_like_wat(code: &[u8]) -> bool {
    std::str::from_utf8(code)
        .map(|text| text.trim_start().starts_with("(module"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ADD: &str = r#"
        (module
          (func (export "main") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))
    "#;

    #[test]
    fn test_native_program_roundtrip() {
        let mut judge = Judge::with_builtins();
        let handle = judge.load(b"native:sha512x5000").unwrap();
        let out = judge.invoke(handle, &[json!("hello")]).unwrap();
        assert_eq!(out.as_str().map(str::len), Some(128));
    }

    #[test]
    fn test_wasm_program_numeric_entry() {
        let mut judge = Judge::with_builtins();
        let handle = judge.load(ADD.as_bytes()).unwrap();
        assert_eq!(judge.invoke(handle, &[json!(40), json!(2)]).unwrap(), json!(42));
        // Instances are fresh per call, so repeated invocations are independent.
        assert_eq!(judge.invoke(handle, &[json!(1), json!(1)]).unwrap(), json!(2));
    }

    #[test]
    fn test_rejects_unknown_code() {
        let mut judge = Judge::with_builtins();
        assert!(matches!(judge.load(b"print('hi')"), Err(JudgeError::UnrecognizedProgram)));
        assert!(matches!(
            judge.load(b"native:does-not-exist"),
            Err(JudgeError::UnknownNative(name)) if name == "does-not-exist"
        ));
    }

    #[test]
    fn test_unknown_handle() {
        let mut judge = Judge::with_builtins();
        let err = judge.invoke(ProgramHandle(3), &[]).unwrap_err();
        assert!(matches!(err, JudgeError::UnknownHandle(3)));
    }
}
