//! WebAssembly programs.
//!
//! Every invocation gets a fresh instance, so guest state never leaks
//! between tasks. Each call also gets its own `Store`, dropped on return,
//! so instance memories do not accumulate over a long-lived worker.
//!
//! Two calling conventions are supported:
//!
//! * **JSON**: the module exports `memory` and `alloc(len: i32) -> i32`.
//!   The argument array is serialized to JSON, copied into guest memory at
//!   the pointer returned by `alloc`, and `main(ptr: i32, len: i32) -> i64`
//!   is called. The return value packs the result location as
//!   `(ptr << 32) | len`; the bytes there must be a JSON document.
//! * **Numeric**: anything else. JSON numbers are converted to the declared
//!   parameter types of `main` (or `_start`), missing arguments default to
//!   zero, and the first return value is converted back.

use crate::JudgeError;
use serde_json::{Number, Value};
use tracing::{debug, warn};
use wasmer::{imports, Engine, Instance, Module, Store, Type, Value as WasmValue};

pub(crate) fn compile(engine: &Engine, code: &[u8]) -> Result<Module, JudgeError> {
    Module::new(engine, code).map_err(|e| {
        warn!("wasm compilation failed: {e}");
        JudgeError::Compile(e.to_string())
    })
}

pub(crate) fn run(engine: &Engine, module: &Module, args: &[Value]) -> Result<Value, JudgeError> {
    let mut store = Store::new(engine.clone());
    let store = &mut store;
    let import_object = imports! {};
    let instance = Instance::new(store, module, &import_object)
        .map_err(|e| JudgeError::Instantiate(e.to_string()))?;

    let has_json_abi = instance.exports.get_memory("memory").is_ok()
        && instance.exports.get_function("alloc").is_ok();

    let result = if has_json_abi {
        run_json(store, &instance, args)
    } else {
        run_numeric(store, &instance, args)
    };
    if let Err(JudgeError::Trap(reason)) = &result {
        debug!(%reason, "wasm program trapped");
    }
    result
}

fn run_json(store: &mut Store, instance: &Instance, args: &[Value]) -> Result<Value, JudgeError> {
    let memory = instance
        .exports
        .get_memory("memory")
        .map_err(|e| JudgeError::MissingExport(e.to_string()))?;
    let alloc = instance
        .exports
        .get_typed_function::<i32, i32>(&*store, "alloc")
        .map_err(|e| JudgeError::MissingExport(e.to_string()))?;
    let entry = instance
        .exports
        .get_typed_function::<(i32, i32), i64>(&*store, "main")
        .map_err(|e| JudgeError::MissingExport(e.to_string()))?;

    let input = serde_json::to_vec(args).map_err(|e| JudgeError::Abi(e.to_string()))?;
    let len = i32::try_from(input.len()).map_err(|_| JudgeError::Abi("arguments too large".into()))?;

    let ptr = alloc.call(store, len).map_err(|e| JudgeError::Trap(e.to_string()))?;
    memory
        .view(&*store)
        .write(ptr as u32 as u64, &input)
        .map_err(|e| JudgeError::Abi(e.to_string()))?;

    let packed = entry.call(store, ptr, len).map_err(|e| JudgeError::Trap(e.to_string()))? as u64;
    let out_ptr = packed >> 32;
    let out_len = packed & 0xffff_ffff;

    let view = memory.view(&*store);
    if out_ptr + out_len > view.data_size() {
        return Err(JudgeError::Abi(format!(
            "result at {out_ptr}+{out_len} is out of bounds of {} bytes of memory",
            view.data_size()
        )));
    }
    let mut output = vec![0u8; out_len as usize];
    view.read(out_ptr, &mut output)
        .map_err(|e| JudgeError::Abi(e.to_string()))?;

    serde_json::from_slice(&output).map_err(|e| JudgeError::Abi(format!("result is not JSON: {e}")))
}

fn run_numeric(store: &mut Store, instance: &Instance, args: &[Value]) -> Result<Value, JudgeError> {
    let entry_point = instance
        .exports
        .get_function("main")
        .or_else(|_| instance.exports.get_function("_start"))
        .map_err(|e| JudgeError::MissingExport(e.to_string()))?;

    let params = entry_point
        .ty(&*store)
        .params()
        .iter()
        .enumerate()
        .map(|(i, ty)| to_wasm(args.get(i), *ty))
        .collect::<Result<Vec<_>, _>>()?;

    let result = entry_point
        .call(store, &params)
        .map_err(|e| JudgeError::Trap(e.to_string()))?;

    Ok(result.first().map(from_wasm).unwrap_or(Value::Null))
}

fn to_wasm(arg: Option<&Value>, ty: Type) -> Result<WasmValue, JudgeError> {
    let arg = arg.unwrap_or(&Value::Null);
    let mismatch = || JudgeError::Abi(format!("cannot pass {arg} as {ty:?}"));
    if arg.is_null() {
        return match ty {
            Type::I32 => Ok(WasmValue::I32(0)),
            Type::I64 => Ok(WasmValue::I64(0)),
            Type::F32 => Ok(WasmValue::F32(0.0)),
            Type::F64 => Ok(WasmValue::F64(0.0)),
            _ => Err(mismatch()),
        };
    }

    match ty {
        Type::I32 => arg
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .map(WasmValue::I32)
            .ok_or_else(mismatch),
        Type::I64 => arg.as_i64().map(WasmValue::I64).ok_or_else(mismatch),
        Type::F32 => arg.as_f64().map(|v| WasmValue::F32(v as f32)).ok_or_else(mismatch),
        Type::F64 => arg.as_f64().map(WasmValue::F64).ok_or_else(mismatch),
        _ => Err(mismatch()),
    }
}

fn from_wasm(value: &WasmValue) -> Value {
    match value {
        WasmValue::I32(v) => Value::from(*v),
        WasmValue::I64(v) => Value::from(*v),
        WasmValue::F32(v) => Number::from_f64(f64::from(*v)).map(Value::Number).unwrap_or(Value::Null),
        WasmValue::F64(v) => Number::from_f64(*v).map(Value::Number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
