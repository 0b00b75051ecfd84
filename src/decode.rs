// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoding raw register bytes into typed values.
//!
//! Pure functions over the response bytes of a single read transaction;
//! all I/O and locking lives in [`crate::device`].

use crate::{
    message::{RegisterConfig, Value},
    Error, Result,
};

/// Decodes the raw bytes of one read transaction according to the
/// register's declared type and scale factor.
///
/// Integer types multiply by `scale` and then truncate toward zero, so a
/// sub-unit scale on an integer register loses the fraction. The `float`
/// types interpret a single register as a scaled 16-bit magnitude, not as
/// an IEEE-754 payload. Both behaviors are part of the wire contract with
/// existing device configurations and must not be "fixed" here.
pub fn decode_register(raw: &[u8], reg: &RegisterConfig) -> Result<Value> {
    match reg.kind.as_str() {
        "bool" => Ok(Value::Bool(matches!(raw.first(), Some(byte) if *byte != 0))),
        "int16" => {
            let word = i16::from_be_bytes(take::<2>(raw, "int16")?);
            Ok(Value::Int((f64::from(word) * reg.scale) as i64))
        }
        "int32" => {
            let dword = i32::from_be_bytes(take::<4>(raw, "int32")?);
            Ok(Value::Int((f64::from(dword) * reg.scale) as i64))
        }
        "uint32" => {
            let dword = u32::from_be_bytes(take::<4>(raw, "uint32")?);
            Ok(Value::Int((f64::from(dword) * reg.scale) as i64))
        }
        "float" | "float32" => {
            let word = u16::from_be_bytes(take::<2>(raw, "float")?);
            Ok(Value::Float(f64::from(word) * reg.scale))
        }
        // "uint16" and every type string this revision does not know
        _ => {
            let word = u16::from_be_bytes(take::<2>(raw, "uint16")?);
            Ok(Value::Int((f64::from(word) * reg.scale) as i64))
        }
    }
}

fn take<const N: usize>(raw: &[u8], kind: &'static str) -> Result<[u8; N]> {
    raw.get(..N)
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or(Error::ShortRead {
            kind,
            needed: N,
            actual: raw.len(),
        })
}

/// Packs coil/discrete-input states into bytes, least significant bit
/// first, exactly as they travel in a _Modbus_ response PDU.
pub(crate) fn pack_coils(coils: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0_u8; coils.len().div_ceil(8)];
    for (index, coil) in coils.iter().enumerate() {
        if *coil {
            bytes[index / 8] |= 1 << (index % 8);
        }
    }
    bytes
}

/// Concatenates register words into their big-endian byte representation.
pub(crate) fn pack_words(words: &[u16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for word in words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    bytes
}
