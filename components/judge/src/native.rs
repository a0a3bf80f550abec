use serde_json::Value;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::sync::Arc;

/// Program code of the form `native:<name>` resolves against a registry.
pub const NATIVE_PREFIX: &str = "native:";

pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// Named host functions callable as programs.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    functions: HashMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the stock programs (`sha512x5000`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("sha512x5000", sha512x5000);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(func));
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.functions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// SHA-512 of `input`, then of each previous digest, `rounds` times in total.
pub fn iterated_sha512(input: &[u8], rounds: usize) -> Vec<u8> {
    let mut digest = Sha512::digest(input).to_vec();
    for _ in 1..rounds {
        digest = Sha512::digest(&digest).to_vec();
    }
    digest
}

/// `main(text) -> hex digest` after 5000 rounds of SHA-512.
pub fn sha512x5000(args: &[Value]) -> Result<Value, String> {
    let input = match args.first() {
        Some(Value::String(text)) => text.as_bytes().to_vec(),
        Some(other) => other.to_string().into_bytes(),
        None => return Err("sha512x5000 expects one argument".to_string()),
    };

    let digest = iterated_sha512(&input, 5000);
    Ok(Value::String(to_hex(&digest)))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_round_matches_reference_vector() {
        let digest = iterated_sha512(b"abc", 1);
        assert_eq!(
            to_hex(&digest),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_sha512x5000_is_deterministic() {
        let a = sha512x5000(&[json!("hello")]).unwrap();
        let b = sha512x5000(&[json!("hello")]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, json!(to_hex(&iterated_sha512(b"hello", 1))));
        assert!(sha512x5000(&[]).is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = NativeRegistry::new();
        registry.register("double", |args: &[Value]| {
            args.first()
                .and_then(Value::as_i64)
                .map(|n| json!(n * 2))
                .ok_or_else(|| "expected a number".to_string())
        });
        let double = registry.get("double").unwrap();
        assert_eq!(double(&[json!(21)]).unwrap(), json!(42));
        assert!(registry.get("sha512x5000").is_none());
        assert!(NativeRegistry::with_builtins().names().any(|n| n == "sha512x5000"));
    }
}
