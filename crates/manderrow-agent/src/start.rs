//! Process entry plumbing: reading argv before `main`, and entering `main` with the
//! rewritten argument vector.
//!
//! On glibc the agent exports its own `__libc_start_main`. The dynamic linker binds the
//! executable's call to it, the agent forwards to the real one with a trampoline in
//! place of `main`, and the trampoline passes `main` the target arguments and records
//! its return value for the `Exit` message.

use std::{
    ffi::{CStr, CString, OsStr, OsString, c_char, c_int},
    os::unix::ffi::OsStrExt,
};

/// Copy a C argument vector. Stops early at a NULL entry.
///
/// # Safety
/// `argv` must be NULL or point to `argc` pointers, each NULL or a C string.
pub(crate) unsafe fn collect_args(argc: c_int, argv: *const *const c_char) -> Vec<OsString> {
    if argv.is_null() {
        return Vec::new();
    }
    (0..usize::try_from(argc).unwrap_or(0))
        .map(|i| unsafe { *argv.add(i) })
        .take_while(|p| !p.is_null())
        .map(|p| OsStr::from_bytes(unsafe { CStr::from_ptr(p) }.to_bytes()).to_os_string())
        .collect()
}

/// Build a NULL-terminated C argument vector that lives for the rest of the process.
///
/// Arguments containing NUL cannot be represented and are dropped; the parser already
/// rejects them in instruction values.
pub(crate) fn leak_argv(args: &[OsString]) -> (c_int, *mut *mut c_char) {
    let mut ptrs: Vec<*mut c_char> = args
        .iter()
        .filter_map(|a| CString::new(a.as_bytes()).ok())
        .map(CString::into_raw)
        .collect();
    let argc = c_int::try_from(ptrs.len()).unwrap_or(c_int::MAX);
    ptrs.push(std::ptr::null_mut());
    (argc, ptrs.leak().as_mut_ptr())
}

#[cfg(all(target_os = "linux", target_env = "gnu", not(test)))]
mod interpose {
    use std::{
        ffi::{c_char, c_int, c_void},
        sync::OnceLock,
    };

    type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;
    type StartMainFn = unsafe extern "C" fn(
        MainFn,
        c_int,
        *mut *mut c_char,
        *mut c_void,
        *mut c_void,
        *mut c_void,
        *mut c_void,
    ) -> c_int;

    static REAL_MAIN: OnceLock<MainFn> = OnceLock::new();

    /// # Safety
    /// Called by the C runtime's `_start` with its usual arguments.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn __libc_start_main(
        main: MainFn,
        argc: c_int,
        argv: *mut *mut c_char,
        init: *mut c_void,
        fini: *mut c_void,
        rtld_fini: *mut c_void,
        stack_end: *mut c_void,
    ) -> c_int {
        // SAFETY: RTLD_NEXT finds the C library's definition, which has this signature.
        let real = unsafe { libc::dlsym(libc::RTLD_NEXT, c"__libc_start_main".as_ptr()) };
        if real.is_null() {
            std::process::abort();
        }
        let real = unsafe { std::mem::transmute::<*mut c_void, StartMainFn>(real) };
        let _ = REAL_MAIN.set(main);
        unsafe { real(main_trampoline, argc, argv, init, fini, rtld_fini, stack_end) }
    }

    unsafe extern "C" fn main_trampoline(
        argc: c_int,
        argv: *mut *mut c_char,
        envp: *mut *mut c_char,
    ) -> c_int {
        let Some(&main) = REAL_MAIN.get() else {
            std::process::abort();
        };
        let code = match crate::agent() {
            Some(ctx) => {
                let (argc, argv) = super::leak_argv(&ctx.target_args());
                unsafe { main(argc, argv, envp) }
            }
            None => unsafe { main(argc, argv, envp) },
        };
        if let Some(ctx) = crate::agent() {
            ctx.record_exit_code(code);
        }
        code
    }
}

/// True when the target's `main` will see the rewritten argument vector.
pub(crate) const REWRITES_ARGV: bool = cfg!(all(target_os = "linux", target_env = "gnu"));
