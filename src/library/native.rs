//! C ABI of the native engine library, loaded with `libloading`.
//!
//! Exported symbols:
//!
//! ```text
//! char* qe_version(void);
//! int   qe_new(const char* options, void* log_ctx, qe_log_fn log, void** engine, char** error);
//! void  qe_free(void* engine);
//! int   qe_call(void* engine, const char* method, const char* args, char** out);
//! int   qe_get_config(const char* options, char** out);
//! int   qe_dmmf(const char* datamodel, char** out);
//! void  qe_free_string(char* s);
//! ```
//!
//! Functions returning `int` return 0 on success and write a JSON document to
//! `out`; on failure `out` holds `{"code": ..., "message": ...}`. Every string
//! returned by the library is released with `qe_free_string`.

use super::{
    InstanceOptions, LibraryVersion, LogCallback, NativeError, NativeMethod, QueryEngineInstance,
    QueryEngineLibrary,
};
use async_trait::async_trait;
use libloading::Library;
use serde_json::Value;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use tracing::debug;

type LogFn = extern "C" fn(*mut c_void, *const c_char);
type VersionFn = unsafe extern "C" fn() -> *mut c_char;
type NewFn = unsafe extern "C" fn(
    *const c_char,
    *mut c_void,
    LogFn,
    *mut *mut c_void,
    *mut *mut c_char,
) -> c_int;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_char, *mut *mut c_char) -> c_int;
type StaticCallFn = unsafe extern "C" fn(*const c_char, *mut *mut c_char) -> c_int;
type FreeStringFn = unsafe extern "C" fn(*mut c_char);

struct Symbols {
    version: VersionFn,
    new: NewFn,
    free: FreeFn,
    call: CallFn,
    get_config: StaticCallFn,
    dmmf: StaticCallFn,
    free_string: FreeStringFn,
}

/// Loaded engine library. Function pointers stay valid while `_library` is alive.
pub struct NativeLibrary {
    symbols: Symbols,
    _library: Library,
}

impl std::fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLibrary").finish_non_exhaustive()
    }
}

fn native_error(code: &str, message: impl Into<String>) -> NativeError {
    NativeError {
        code: code.to_string(),
        message: message.into(),
    }
}

fn c_string(value: &str) -> Result<CString, NativeError> {
    CString::new(value).map_err(|e| native_error("InvalidArg", format!("string contains NUL: {e}")))
}

impl NativeLibrary {
    /// Load the library and resolve every exported symbol
    pub fn open(path: &Path) -> Result<Self, libloading::Error> {
        // SAFETY: loading runs the library's initializers; the path comes from the
        // engine artifact search and is expected to be a query engine library.
        unsafe {
            let library = Library::new(path)?;
            let symbols = Symbols {
                version: *library.get::<VersionFn>(b"qe_version\0")?,
                new: *library.get::<NewFn>(b"qe_new\0")?,
                free: *library.get::<FreeFn>(b"qe_free\0")?,
                call: *library.get::<CallFn>(b"qe_call\0")?,
                get_config: *library.get::<StaticCallFn>(b"qe_get_config\0")?,
                dmmf: *library.get::<StaticCallFn>(b"qe_dmmf\0")?,
                free_string: *library.get::<FreeStringFn>(b"qe_free_string\0")?,
            };
            debug!(path = %path.display(), "loaded native query engine library");
            Ok(Self {
                symbols,
                _library: library,
            })
        }
    }

    /// Copy and release a string returned by the library
    fn take_string(&self, raw: *mut c_char) -> String {
        if raw.is_null() {
            return String::new();
        }
        // SAFETY: non-null strings returned by the library are NUL-terminated and
        // owned by the caller until released with qe_free_string.
        unsafe {
            let text = CStr::from_ptr(raw).to_string_lossy().into_owned();
            (self.symbols.free_string)(raw);
            text
        }
    }

    fn result(&self, status: c_int, out: *mut c_char) -> Result<String, NativeError> {
        let text = self.take_string(out);
        if status == 0 {
            Ok(text)
        } else {
            Err(parse_native_error(&text))
        }
    }

    fn static_call(&self, f: StaticCallFn, arg: &str) -> Result<String, NativeError> {
        let arg = c_string(arg)?;
        let mut out: *mut c_char = ptr::null_mut();
        // SAFETY: `arg` outlives the call and `out` is a valid out-pointer.
        let status = unsafe { f(arg.as_ptr(), &mut out) };
        self.result(status, out)
    }
}

/// Decode a `{code, message}` error document
pub fn parse_native_error(text: &str) -> NativeError {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => NativeError {
            code: value
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or(crate::constants::NATIVE_GENERIC_FAILURE)
                .to_string(),
            message: value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| text.to_string()),
        },
        Err(_) => native_error(crate::constants::NATIVE_GENERIC_FAILURE, text),
    }
}

extern "C" fn log_trampoline(ctx: *mut c_void, line: *const c_char) {
    if ctx.is_null() || line.is_null() {
        return;
    }
    let _ = catch_unwind(AssertUnwindSafe(|| {
        // SAFETY: `ctx` is the boxed callback registered in `new_instance`, freed
        // only after the engine handle; `line` is a NUL-terminated string valid
        // for the duration of the call.
        let callback = unsafe { &*(ctx as *const LogCallback) };
        let text = unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned();
        callback(text);
    }));
}

/// Owner of an engine handle and its log context. Every in-flight call holds a
/// clone, so `qe_free` only runs once the last call has returned.
struct NativeHandle {
    library: Arc<NativeLibrary>,
    engine: *mut c_void,
    log_ctx: *mut LogCallback,
}

// SAFETY: the library allows calls on an engine handle from any thread;
// `log_ctx` points to a `LogCallback` (Send + Sync) that is only dereferenced
// by the trampoline. Both are freed exactly once, in `Drop`.
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        // SAFETY: the handle came from qe_new and no call is using it any more;
        // the log context is released after the engine can no longer call it.
        unsafe {
            (self.library.symbols.free)(self.engine);
            drop(Box::from_raw(self.log_ctx));
        }
    }
}

struct NativeInstance {
    handle: Arc<NativeHandle>,
}

#[async_trait]
impl QueryEngineInstance for NativeInstance {
    async fn call(&self, method: NativeMethod, args: Value) -> Result<String, NativeError> {
        let handle = self.handle.clone();
        let method = c_string(method.as_str())?;
        let args = c_string(&args.to_string())?;

        tokio::task::spawn_blocking(move || {
            let mut out: *mut c_char = ptr::null_mut();
            // SAFETY: `handle` keeps the engine alive until this closure returns,
            // even when the awaiting future is dropped.
            let status = unsafe {
                (handle.library.symbols.call)(handle.engine, method.as_ptr(), args.as_ptr(), &mut out)
            };
            handle.library.result(status, out)
        })
        .await
        .map_err(|e| native_error(crate::constants::NATIVE_GENERIC_FAILURE, format!("native call aborted: {e}")))?
    }
}

impl QueryEngineLibrary for Arc<NativeLibrary> {
    fn version(&self) -> Result<LibraryVersion, NativeError> {
        // SAFETY: qe_version takes no arguments and returns an owned string.
        let raw = unsafe { (self.symbols.version)() };
        let text = self.take_string(raw);
        serde_json::from_str(&text)
            .map_err(|e| native_error("InvalidVersion", format!("{e}: {text}")))
    }

    fn new_instance(
        &self,
        options: &InstanceOptions,
        logger: LogCallback,
    ) -> Result<Arc<dyn QueryEngineInstance>, NativeError> {
        let options = serde_json::to_string(options)
            .map_err(|e| native_error("InvalidArg", e.to_string()))?;
        let options = c_string(&options)?;
        let log_ctx = Box::into_raw(Box::new(logger));
        let mut engine: *mut c_void = ptr::null_mut();
        let mut error: *mut c_char = ptr::null_mut();

        // SAFETY: all pointers are valid for the duration of the call; `log_ctx`
        // stays alive until the instance is dropped.
        let status = unsafe {
            (self.symbols.new)(
                options.as_ptr(),
                log_ctx as *mut c_void,
                log_trampoline,
                &mut engine,
                &mut error,
            )
        };

        if status != 0 || engine.is_null() {
            // SAFETY: the library did not keep the log context on failure.
            unsafe { drop(Box::from_raw(log_ctx)) };
            let text = self.take_string(error);
            return Err(NativeError {
                code: "InitializationError".to_string(),
                message: text,
            });
        }

        Ok(Arc::new(NativeInstance {
            handle: Arc::new(NativeHandle {
                library: self.clone(),
                engine,
                log_ctx,
            }),
        }))
    }

    fn get_config(&self, options: &Value) -> Result<String, NativeError> {
        self.static_call(self.symbols.get_config, &options.to_string())
    }

    fn dmmf(&self, datamodel: &str) -> Result<String, NativeError> {
        self.static_call(self.symbols.dmmf, datamodel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_native_error_document() {
        let err = parse_native_error(r#"{"code":"GenericFailure","message":"PANIC: boom"}"#);
        assert_eq!(err.code, "GenericFailure");
        assert_eq!(err.message, "PANIC: boom");
    }

    #[test]
    fn test_parse_native_error_plain_text() {
        let err = parse_native_error("segfault-ish");
        assert_eq!(err.code, crate::constants::NATIVE_GENERIC_FAILURE);
        assert_eq!(err.message, "segfault-ish");
    }

    #[test]
    fn test_trampoline_ignores_null_pointers() {
        log_trampoline(ptr::null_mut(), ptr::null());
    }

    #[test]
    fn test_trampoline_forwards_lines() {
        use parking_lot::Mutex;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: LogCallback = Arc::new(move |line| sink.lock().push(line));
        let ctx = Box::into_raw(Box::new(callback));
        let line = CString::new("{\"level\":\"INFO\"}").unwrap();

        log_trampoline(ctx as *mut c_void, line.as_ptr());
        unsafe { drop(Box::from_raw(ctx)) };

        assert_eq!(seen.lock().as_slice(), ["{\"level\":\"INFO\"}".to_string()]);
    }

    #[test]
    fn test_open_missing_library_fails() {
        assert!(NativeLibrary::open(Path::new("/nonexistent/libquery_engine.so")).is_err());
    }

    #[cfg(unix)]
    mod handle_lifetime {
        use super::*;
        use crate::config::EngineConfig;
        use crate::library::{InstanceOptions, LogCallback, NativeMethod, QueryEngineLibrary};
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        static CALL_ACTIVE: AtomicBool = AtomicBool::new(false);
        static FREED: AtomicBool = AtomicBool::new(false);
        static FREED_DURING_CALL: AtomicBool = AtomicBool::new(false);

        unsafe extern "C" fn slow_version() -> *mut c_char {
            ptr::null_mut()
        }

        unsafe extern "C" fn slow_new(
            _options: *const c_char,
            _log_ctx: *mut c_void,
            _log: LogFn,
            engine: *mut *mut c_void,
            _error: *mut *mut c_char,
        ) -> c_int {
            *engine = ptr::NonNull::<u8>::dangling().as_ptr().cast();
            0
        }

        unsafe extern "C" fn slow_free(_engine: *mut c_void) {
            if CALL_ACTIVE.load(Ordering::SeqCst) {
                FREED_DURING_CALL.store(true, Ordering::SeqCst);
            }
            FREED.store(true, Ordering::SeqCst);
        }

        unsafe extern "C" fn slow_call(
            _engine: *mut c_void,
            _method: *const c_char,
            _args: *const c_char,
            out: *mut *mut c_char,
        ) -> c_int {
            CALL_ACTIVE.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            CALL_ACTIVE.store(false, Ordering::SeqCst);
            *out = ptr::null_mut();
            0
        }

        unsafe extern "C" fn slow_static(_arg: *const c_char, out: *mut *mut c_char) -> c_int {
            *out = ptr::null_mut();
            0
        }

        unsafe extern "C" fn slow_free_string(_s: *mut c_char) {}

        fn slow_library() -> Arc<NativeLibrary> {
            Arc::new(NativeLibrary {
                symbols: Symbols {
                    version: slow_version,
                    new: slow_new,
                    free: slow_free,
                    call: slow_call,
                    get_config: slow_static,
                    dmmf: slow_static,
                    free_string: slow_free_string,
                },
                _library: libloading::os::unix::Library::this().into(),
            })
        }

        #[tokio::test]
        async fn test_abandoned_call_keeps_engine_alive_until_it_returns() {
            let library = slow_library();
            let options = InstanceOptions::from_config(
                &EngineConfig::default(),
                String::new(),
                Vec::<(String, String)>::new(),
            );
            let logger: LogCallback = Arc::new(|_line: String| {});
            let instance = library.new_instance(&options, logger).unwrap();

            let call = tokio::spawn({
                let instance = instance.clone();
                async move { instance.call(NativeMethod::Query, serde_json::json!({})).await }
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(CALL_ACTIVE.load(Ordering::SeqCst));

            call.abort();
            drop(instance);

            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while !FREED.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(FREED.load(Ordering::SeqCst));
            assert!(!FREED_DURING_CALL.load(Ordering::SeqCst));
        }
    }
}
