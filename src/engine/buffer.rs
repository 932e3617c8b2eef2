// src/engine/buffer.rs

//! "Ask size, then fill" retrieval of variable-length engine payloads.
//!
//! 1. Query with no buffer; the engine answers `InsufficientBufferSize`
//!    together with the size it needs.
//! 2. Allocate exactly that many bytes and query again.
//! 3. Any first reply other than `InsufficientBufferSize` ends the exchange
//!    with an empty payload.
//!
//! The payload may grow between the two calls, so an insufficient reply to
//! a fill is retried, up to `MAX_FILL_ATTEMPTS` fills. The insufficient-size
//! code itself never reaches the caller.

use crate::codes::ResultCode;
use crate::engine::FillReply;
use crate::tdt_log;
use log::Level;
use std::ffi::CStr;

/// Upper bound on fill calls for one retrieval.
pub const MAX_FILL_ATTEMPTS: usize = 4;

/// Run the negotiation against `query` and return the payload with the
/// engine's code. Only success and the partial-result warning come with
/// data; every other outcome yields an empty string.
pub fn negotiate<F>(op: &str, mut query: F) -> (String, ResultCode)
where
    F: FnMut(Option<&mut [u8]>) -> FillReply,
{
    let first = query(None);
    if first.code != ResultCode::InsufficientBufferSize {
        tdt_log!(Level::Debug, "buffer", "{}: size query answered {:?}", op, first.code);
        return (String::new(), first.code);
    }

    let mut required = first.required;
    for attempt in 1..=MAX_FILL_ATTEMPTS {
        let len = match required {
            Some(n) if n > 0 => n,
            other => {
                tdt_log!(Level::Warn, "buffer", "{}: engine asked for an unusable size {:?}", op, other);
                return (String::new(), ResultCode::Internal);
            }
        };

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(len).is_err() {
            tdt_log!(Level::Error, "buffer", "{}: cannot allocate {} bytes", op, len);
            return (String::new(), ResultCode::OutOfMemory);
        }
        buffer.resize(len, 0u8);

        let reply = query(Some(&mut buffer));
        match reply.code {
            ResultCode::InsufficientBufferSize => {
                tdt_log!(Level::Debug, "buffer", "{}: payload outgrew {} bytes (attempt {})", op, len, attempt);
                required = match reply.required {
                    Some(n) => Some(n),
                    None => {
                        let again = query(None);
                        if again.code != ResultCode::InsufficientBufferSize {
                            return (String::new(), again.code);
                        }
                        again.required
                    }
                };
            }
            code if code.carries_payload() => return (decode(&buffer), code),
            code => return (String::new(), code),
        }
    }

    tdt_log!(Level::Warn, "buffer", "{}: gave up after {} fills", op, MAX_FILL_ATTEMPTS);
    (String::new(), ResultCode::Internal)
}

/// Bytes up to the first NUL, lossily decoded.
fn decode(buffer: &[u8]) -> String {
    match CStr::from_bytes_until_nul(buffer) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(buffer).into_owned(),
    }
}
