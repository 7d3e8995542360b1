// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! WASM Proof-of-Work solver, reproducing the DeepSeek web client's
//! exact export ABI bit-for-bit.
//!
//! The hash algorithm itself lives inside the bundled `.wasm` binary
//! and is never reimplemented natively — the formula is undocumented
//! upstream and a native port would have to guess it.

use anyhow::{bail, Context};
use wasmtime::{Engine, Instance, Memory, Module, Store, TypedFunc};

/// Default location of the PoW solver artifact, shipped alongside the
/// binary exactly as the upstream web client ships it (same filename,
/// same bytes — this is an opaque vendored binary, not something this
/// codebase builds or modifies).
pub const DEFAULT_POW_WASM_PATH: &str = "assets/sha3_wasm_bg.7b9ca65ddd.wasm";

pub struct PowChallenge {
    pub algorithm: String,
    pub challenge: String,
    pub salt: String,
    pub difficulty: u64,
    pub expire_at: i64,
    pub signature: String,
    pub target_path: String,
}

/// Fallback constants used when the challenge response omits
/// `difficulty`/`expire_at`. The `expire_at` value is a stale
/// timestamp inherited from the upstream web client; its effect on
/// the solution is undefined, so its use is logged at warn level.
pub const FALLBACK_DIFFICULTY: u64 = 144_000;
pub const FALLBACK_EXPIRE_AT: i64 = 1_680_000_000;

/// `prefix = "{salt}_{expire_at}_"`, the second input to `wasm_solve`.
pub fn pow_prefix(salt: &str, expire_at: i64) -> String {
    format!("{salt}_{expire_at}_")
}

pub struct PowSolution {
    pub answer: i64,
}

/// Invoke the bundled WASM module's `wasm_solve` export with the
/// documented calling convention: allocate a 16-byte return region on
/// the guest's shadow stack, copy `challenge` and `prefix` into
/// freshly allocated guest buffers, call `wasm_solve`, then read back
/// a little-endian `i32` status and `f64` value from the return
/// region.
pub fn solve(
    wasm_path: &std::path::Path,
    challenge: &str,
    salt: &str,
    expire_at: i64,
    difficulty: u64,
) -> anyhow::Result<PowSolution> {
    let wasm_bytes = std::fs::read(wasm_path)
        .with_context(|| format!("reading PoW wasm artifact at {}", wasm_path.display()))?;

    let prefix = pow_prefix(salt, expire_at);

    let engine = Engine::default();
    let module = Module::new(&engine, &wasm_bytes).context("compiling PoW wasm module")?;
    let mut store = Store::new(&engine, ());
    let instance = Instance::new(&mut store, &module, &[]).context("instantiating PoW wasm module")?;

    let memory = instance
        .get_memory(&mut store, "memory")
        .context("wasm module has no 'memory' export")?;

    let add_to_stack_pointer: TypedFunc<i32, i32> = instance
        .get_typed_func(&mut store, "__wbindgen_add_to_stack_pointer")
        .context("missing __wbindgen_add_to_stack_pointer export")?;
    let wbindgen_export_0: TypedFunc<(i32, i32), i32> = instance
        .get_typed_func(&mut store, "__wbindgen_export_0")
        .context("missing __wbindgen_export_0 export")?;
    let wasm_solve: TypedFunc<(i32, i32, i32, i32, i32, f64), ()> = instance
        .get_typed_func(&mut store, "wasm_solve")
        .context("missing wasm_solve export")?;

    let ret_ptr = add_to_stack_pointer.call(&mut store, -16)?;

    let challenge_ptr = write_utf8(&mut store, memory, &wbindgen_export_0, challenge)?;
    let prefix_ptr = write_utf8(&mut store, memory, &wbindgen_export_0, &prefix)?;

    wasm_solve.call(
        &mut store,
        (
            ret_ptr,
            challenge_ptr.0,
            challenge_ptr.1,
            prefix_ptr.0,
            prefix_ptr.1,
            difficulty as f64,
        ),
    )?;

    let mut status_bytes = [0u8; 4];
    memory.read(&store, ret_ptr as usize, &mut status_bytes)?;
    let status = i32::from_le_bytes(status_bytes);

    let mut value_bytes = [0u8; 8];
    memory.read(&store, ret_ptr as usize + 8, &mut value_bytes)?;
    let value = f64::from_le_bytes(value_bytes);

    add_to_stack_pointer.call(&mut store, 16)?;

    if status == 0 {
        bail!("wasm_solve returned failure status");
    }

    Ok(PowSolution {
        answer: value.trunc() as i64,
    })
}

fn write_utf8(
    store: &mut Store<()>,
    memory: Memory,
    alloc: &TypedFunc<(i32, i32), i32>,
    text: &str,
) -> anyhow::Result<(i32, i32)> {
    let bytes = text.as_bytes();
    let ptr = alloc.call(&mut *store, (bytes.len() as i32, 1))?;
    memory.write(&mut *store, ptr as usize, bytes)?;
    Ok((ptr, bytes.len() as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_salt_then_expiry_with_trailing_underscore() {
        assert_eq!(pow_prefix("s", 1_700_000_000), "s_1700000000_");
    }

    #[test]
    fn fallback_constants_are_stable() {
        assert_eq!(FALLBACK_DIFFICULTY, 144_000);
        assert_eq!(FALLBACK_EXPIRE_AT, 1_680_000_000);
    }
}
