//! C ABI surface over the memory engine
//!
//! This is a stable wire contract for foreign runtimes. Returned strings
//! are NUL-terminated, owned by this library, and must be released through
//! `free_string`. Every exported function catches internal faults and
//! translates them to the documented failure value (`false`, `NULL`, or
//! `0`); no panic crosses the boundary.

use crate::config::MemoryConfig;
use crate::memory::MemoryEngine;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::ffi::{c_char, CStr, CString};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static ENGINE: OnceLock<MemoryEngine> = OnceLock::new();

fn engine() -> &'static MemoryEngine {
    ENGINE.get_or_init(|| MemoryEngine::new(&MemoryConfig::from_env()))
}

/// Borrow a C string argument; `NULL` and non-UTF-8 input read as absent
unsafe fn arg_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Hand a Rust string to the caller; they must release it via `free_string`
fn give_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(owned) => owned.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

fn guard_bool<F: FnOnce() -> bool>(f: F) -> bool {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(false)
}

fn guard_u64<F: FnOnce() -> u64>(f: F) -> u64 {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(0)
}

fn guard_ptr<F: FnOnce() -> *mut c_char>(f: F) -> *mut c_char {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or(std::ptr::null_mut())
}

/// Release a string previously returned by this library. `NULL` is a no-op.
#[no_mangle]
pub extern "C" fn free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            drop(CString::from_raw(ptr));
        }
    }
}

/// Library version as a caller-freed string
#[no_mangle]
pub extern "C" fn version() -> *mut c_char {
    guard_ptr(|| give_string(env!("CARGO_PKG_VERSION").to_string()))
}

#[no_mangle]
pub extern "C" fn memory_set(key: *const c_char, value: *const c_char, ttl: u64) -> bool {
    guard_bool(|| unsafe {
        match (arg_str(key), arg_str(value)) {
            (Some(key), Some(value)) => {
                engine().set(key, value.as_bytes(), ttl);
                true
            }
            _ => false,
        }
    })
}

/// `NULL` on miss (or expiry); otherwise the value, caller-freed
#[no_mangle]
pub extern "C" fn memory_get(key: *const c_char) -> *mut c_char {
    guard_ptr(|| unsafe {
        match arg_str(key).and_then(|key| engine().get(key)) {
            Some(value) => match String::from_utf8(value) {
                Ok(text) => give_string(text),
                Err(_) => std::ptr::null_mut(),
            },
            None => std::ptr::null_mut(),
        }
    })
}

#[no_mangle]
pub extern "C" fn memory_delete(key: *const c_char) -> bool {
    guard_bool(|| unsafe { arg_str(key).is_some_and(|key| engine().delete(key)) })
}

#[no_mangle]
pub extern "C" fn memory_clear() -> bool {
    guard_bool(|| {
        engine().clear();
        true
    })
}

#[no_mangle]
pub extern "C" fn memory_exists(key: *const c_char) -> bool {
    guard_bool(|| unsafe { arg_str(key).is_some_and(|key| engine().exists(key)) })
}

#[no_mangle]
pub extern "C" fn memory_cleanup() -> u64 {
    guard_u64(|| engine().cleanup() as u64)
}

#[no_mangle]
pub extern "C" fn memory_count() -> u64 {
    guard_u64(|| engine().count() as u64)
}

/// Batched set; returns how many of the `n` entries were stored
#[no_mangle]
pub extern "C" fn memory_set_multiple(
    keys: *const *const c_char,
    values: *const *const c_char,
    ttls: *const u64,
    n: usize,
) -> u64 {
    guard_u64(|| unsafe {
        if keys.is_null() || values.is_null() || ttls.is_null() {
            return 0;
        }
        let mut stored = 0;
        for i in 0..n {
            let key = arg_str(*keys.add(i));
            let value = arg_str(*values.add(i));
            if let (Some(key), Some(value)) = (key, value) {
                engine().set(key, value.as_bytes(), *ttls.add(i));
                stored += 1;
            }
        }
        stored
    })
}

/// Batched get; returns a JSON object mapping each requested key to its
/// value or `null`, caller-freed
#[no_mangle]
pub extern "C" fn memory_get_multiple(keys: *const *const c_char, n: usize) -> *mut c_char {
    guard_ptr(|| unsafe {
        if keys.is_null() {
            return std::ptr::null_mut();
        }
        let mut result = serde_json::Map::new();
        for i in 0..n {
            let Some(key) = arg_str(*keys.add(i)) else {
                continue;
            };
            let value = match engine().get(key) {
                Some(bytes) => serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                None => serde_json::Value::Null,
            };
            result.insert(key.to_string(), value);
        }
        match serde_json::to_string(&serde_json::Value::Object(result)) {
            Ok(json) => give_string(json),
            Err(_) => std::ptr::null_mut(),
        }
    })
}

/// Probe a remote backend with a blocking RESP `PING`
#[no_mangle]
pub extern "C" fn redis_ping(host: *const c_char, port: u16) -> bool {
    guard_bool(|| unsafe {
        let Some(host) = arg_str(host) else {
            return false;
        };
        ping_blocking(host, port, Duration::from_secs(2)).is_some()
    })
}

fn ping_blocking(host: &str, port: u16, timeout: Duration) -> Option<()> {
    let addr = (host, port).to_socket_addrs().ok()?.next()?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    stream.set_write_timeout(Some(timeout)).ok()?;

    stream.write_all(b"*1\r\n$4\r\nPING\r\n").ok()?;
    let mut reply = [0u8; 16];
    let read = stream.read(&mut reply).ok()?;
    reply[..read].starts_with(b"+PONG").then_some(())
}

/// LZ4-compress a string; the result is base64-armored for safe string
/// transport, with the raw compressed byte count written to `out_size`
#[no_mangle]
pub extern "C" fn compress_lz4(data: *const c_char, out_size: *mut usize) -> *mut c_char {
    guard_ptr(|| unsafe {
        let Some(data) = arg_str(data) else {
            return std::ptr::null_mut();
        };
        let compressed = lz4_flex::compress_prepend_size(data.as_bytes());
        if !out_size.is_null() {
            *out_size = compressed.len();
        }
        give_string(STANDARD.encode(compressed))
    })
}

/// Reverse of `compress_lz4`; `NULL` on any decode failure
#[no_mangle]
pub extern "C" fn decompress_lz4(data: *const c_char) -> *mut c_char {
    guard_ptr(|| unsafe {
        let Some(data) = arg_str(data) else {
            return std::ptr::null_mut();
        };
        let Ok(compressed) = STANDARD.decode(data) else {
            return std::ptr::null_mut();
        };
        let Ok(decompressed) = lz4_flex::decompress_size_prepended(&compressed) else {
            return std::ptr::null_mut();
        };
        match String::from_utf8(decompressed) {
            Ok(text) => give_string(text),
            Err(_) => std::ptr::null_mut(),
        }
    })
}

/// Time `operations` set/get/delete cycles; returns elapsed seconds
#[no_mangle]
pub extern "C" fn benchmark_memory(operations: u64) -> f64 {
    catch_unwind(AssertUnwindSafe(|| {
        let engine = engine();
        let start = Instant::now();
        for i in 0..operations {
            let key = format!("benchmark.{i}");
            let value = format!("benchmark-value-{i}");
            engine.set(&key, value.as_bytes(), 3600);
            let _ = engine.get(&key);
            engine.delete(&key);
        }
        start.elapsed().as_secs_f64()
    }))
    .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    unsafe fn take_string(ptr: *mut c_char) -> String {
        assert!(!ptr.is_null());
        let text = CStr::from_ptr(ptr).to_str().unwrap().to_string();
        free_string(ptr);
        text
    }

    #[test]
    fn round_trip_through_the_abi() {
        let key = c("ffi.round-trip");
        let value = c("the value");

        assert!(memory_set(key.as_ptr(), value.as_ptr(), 3600));
        assert!(memory_exists(key.as_ptr()));

        let fetched = memory_get(key.as_ptr());
        assert_eq!(unsafe { take_string(fetched) }, "the value");

        assert!(memory_delete(key.as_ptr()));
        assert!(!memory_exists(key.as_ptr()));
    }

    #[test]
    fn null_safety() {
        assert!(memory_get(c("ffi.nonexistent").as_ptr()).is_null());
        free_string(std::ptr::null_mut());

        assert!(!memory_set(std::ptr::null(), std::ptr::null(), 0));
        assert!(!memory_delete(std::ptr::null()));
        assert!(!memory_exists(std::ptr::null()));
        assert!(memory_get(std::ptr::null()).is_null());
        assert_eq!(memory_get_multiple(std::ptr::null(), 3), std::ptr::null_mut());
    }

    #[test]
    fn batched_get_reports_null_for_misses() {
        let present = c("ffi.batch.present");
        let missing = c("ffi.batch.missing");
        let value = c("v");
        assert!(memory_set(present.as_ptr(), value.as_ptr(), 3600));

        let keys = [present.as_ptr(), missing.as_ptr()];
        let json = memory_get_multiple(keys.as_ptr(), keys.len());
        let parsed: serde_json::Value =
            serde_json::from_str(&unsafe { take_string(json) }).unwrap();

        assert_eq!(parsed["ffi.batch.present"], "v");
        assert!(parsed["ffi.batch.missing"].is_null());
    }

    #[test]
    fn batched_set_counts_successes() {
        let k1 = c("ffi.ms.1");
        let k2 = c("ffi.ms.2");
        let v = c("v");
        let keys = [k1.as_ptr(), k2.as_ptr()];
        let values = [v.as_ptr(), v.as_ptr()];
        let ttls = [3600u64, 3600u64];

        assert_eq!(
            memory_set_multiple(keys.as_ptr(), values.as_ptr(), ttls.as_ptr(), 2),
            2
        );
        assert!(memory_exists(k1.as_ptr()));
    }

    #[test]
    fn compression_round_trip() {
        let text = "A reasonably compressible string. ".repeat(8);
        let data = c(&text);
        let mut compressed_size = 0usize;

        let compressed = compress_lz4(data.as_ptr(), &mut compressed_size);
        assert!(!compressed.is_null());
        assert!(compressed_size > 0);
        assert!(compressed_size < text.len());

        let compressed_text = unsafe { take_string(compressed) };
        let restored = decompress_lz4(c(&compressed_text).as_ptr());
        assert_eq!(unsafe { take_string(restored) }, text);
    }

    #[test]
    fn decompress_rejects_garbage() {
        assert!(decompress_lz4(c("not base64 at all!!!").as_ptr()).is_null());
        assert!(decompress_lz4(std::ptr::null()).is_null());
    }

    #[test]
    fn version_is_present() {
        let v = version();
        let text = unsafe { take_string(v) };
        assert_eq!(text, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn benchmark_reports_elapsed_time() {
        let elapsed = benchmark_memory(100);
        assert!(elapsed >= 0.0);
    }
}
