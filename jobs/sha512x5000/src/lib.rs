//! Guest build of the `sha512x5000` program.
//!
//! Takes one string argument and returns the hex digest after 5000 rounds
//! of SHA-512, using the JSON calling convention: the host writes the
//! argument array into memory from `alloc`, calls `main(ptr, len)` and
//! reads the JSON result at the packed `(ptr << 32) | len` location.

use serde_json::Value;
use sha2::{Digest, Sha512};

const ROUNDS: usize = 5000;

#[cfg_attr(target_arch = "wasm32", no_mangle)]
pub extern "C" fn alloc(len: i32) -> i32 {
    let buf = vec![0u8; len.max(0) as usize].into_boxed_slice();
    Box::leak(buf).as_mut_ptr() as i32
}

#[cfg_attr(target_arch = "wasm32", no_mangle)]
pub extern "C" fn main(ptr: i32, len: i32) -> i64 {
    // SAFETY: the host wrote `len` bytes at a pointer returned by `alloc`.
    let input = unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) };
    let output = match run(input) {
        Ok(digest) => Value::String(digest),
        Err(message) => serde_json::json!({ "error": message }),
    };

    let bytes = serde_json::to_vec(&output).unwrap_or_else(|_| b"null".to_vec());
    let len = bytes.len() as u64;
    let ptr = Box::leak(bytes.into_boxed_slice()).as_ptr() as u64;
    ((ptr << 32) | len) as i64
}

fn run(input: &[u8]) -> Result<String, String> {
    let args: Vec<Value> = serde_json::from_slice(input).map_err(|e| e.to_string())?;
    let text = match args.first() {
        Some(Value::String(text)) => text.as_bytes().to_vec(),
        Some(other) => other.to_string().into_bytes(),
        None => return Err("sha512x5000 expects one argument".to_string()),
    };

    let mut digest = Sha512::digest(&text).to_vec();
    for _ in 1..ROUNDS {
        digest = Sha512::digest(&digest).to_vec();
    }
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_hex_of_expected_length() {
        let digest = run(br#"["hello"]"#).unwrap();
        assert_eq!(digest.len(), 128);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(run(b"[]").is_err());
    }
}
