//! C ABI over a process-wide [`AgentHost`].
//!
//! Every function returns a [`HostStatus`] code. Strings are passed as pointer and
//! length pairs and need not be NUL-terminated.

use std::{ffi::c_void, slice, time::Duration};

use manderrow_ipc::{LogLevel, MessageError, OutputChannel, SafeOsString};

use crate::{AgentHost, HostCallError, HostStatus};

/// `line_kind` for [`manderrow_agent_host_send_output_line`]: `line_len` counts bytes.
pub const LINE_KIND_BYTES: u8 = 0;
/// `line_kind` for [`manderrow_agent_host_send_output_line`]: `line_len` counts UTF-16 units.
pub const LINE_KIND_WIDE: u8 = 1;

static HOST: AgentHost = AgentHost::new();

fn finish(result: Result<(), HostCallError>) -> u8 {
    match result {
        Ok(()) => HostStatus::Ok as u8,
        Err(e) => {
            tracing::debug!(error = %e, "host call failed");
            e.status() as u8
        }
    }
}

unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        // SAFETY: caller guarantees `len` valid elements at `ptr`.
        unsafe { slice::from_raw_parts(ptr, len) }
    }
}

unsafe fn raw_str<'a>(ptr: *const u8, len: usize) -> Result<&'a str, HostCallError> {
    let bytes = unsafe { raw_slice(ptr, len) };
    std::str::from_utf8(bytes).map_err(|_| HostCallError::InvalidArgument("not UTF-8"))
}

/// # Safety
/// `c2s_tx_ptr` must point to `c2s_tx_len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn manderrow_agent_host_init(c2s_tx_ptr: *const u8, c2s_tx_len: usize) -> u8 {
    finish(unsafe { raw_str(c2s_tx_ptr, c2s_tx_len) }.and_then(|tx| HOST.init(tx)))
}

/// `has_code == false` reports an exit without a code (e.g. killed by a signal).
#[unsafe(no_mangle)]
pub extern "C" fn manderrow_agent_host_send_exit(
    has_code: bool,
    code: i32,
    flush_timeout_ms: u64,
) -> u8 {
    finish(HOST.send_exit(
        has_code.then_some(code),
        Duration::from_millis(flush_timeout_ms),
    ))
}

/// # Safety
/// `error_ptr` must point to `error_len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn manderrow_agent_host_send_crash(error_ptr: *const u8, error_len: usize) -> u8 {
    let bytes = unsafe { raw_slice(error_ptr, error_len) };
    finish(match std::str::from_utf8(bytes) {
        Ok(error) => HOST.send_crash(error),
        Err(_) => Err(MessageError::InvalidMessage.into()),
    })
}

/// # Safety
/// `line_ptr` must point to `line_len` readable elements of the type `line_kind` names.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn manderrow_agent_host_send_output_line(
    channel: u8,
    line_kind: u8,
    line_ptr: *const c_void,
    line_len: usize,
) -> u8 {
    let Some(channel) = OutputChannel::from_u8(channel) else {
        return HostStatus::InvalidArgument as u8;
    };
    let line = match line_kind {
        LINE_KIND_BYTES => SafeOsString::from_bytes(unsafe { raw_slice(line_ptr.cast::<u8>(), line_len) }),
        LINE_KIND_WIDE => SafeOsString::from_wide(unsafe { raw_slice(line_ptr.cast::<u16>(), line_len) }),
        _ => return HostStatus::InvalidArgument as u8,
    };
    finish(HOST.send_output_line(channel, line))
}

/// # Safety
/// `scope_ptr` and `message_ptr` must point to `scope_len` and `message_len` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn manderrow_agent_host_send_log(
    level: u8,
    scope_ptr: *const u8,
    scope_len: usize,
    message_ptr: *const u8,
    message_len: usize,
) -> u8 {
    let Some(level) = LogLevel::from_u8(level) else {
        return HostStatus::InvalidArgument as u8;
    };
    let scope = unsafe { raw_slice(scope_ptr, scope_len) };
    let message = unsafe { raw_slice(message_ptr, message_len) };
    let result = match (std::str::from_utf8(scope), std::str::from_utf8(message)) {
        (Err(_), _) => Err(MessageError::InvalidScope(String::from_utf8_lossy(scope).into_owned()).into()),
        (_, Err(_)) => Err(MessageError::InvalidMessage.into()),
        (Ok(scope), Ok(message)) => HOST.send_log(level, scope, message),
    };
    finish(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The process-wide host is never initialized in tests, so every well-formed call
    // ends at the connection check.

    #[test]
    fn log_codes_distinguish_scope_message_and_connection() {
        let ok_scope = b"agent";
        let bad_scope = b"two words";
        let bad_msg = [0xffu8, 0xfe];
        unsafe {
            assert_eq!(
                manderrow_agent_host_send_log(3, bad_scope.as_ptr(), bad_scope.len(), b"x".as_ptr(), 1),
                HostStatus::InvalidScope as u8
            );
            assert_eq!(
                manderrow_agent_host_send_log(3, ok_scope.as_ptr(), ok_scope.len(), bad_msg.as_ptr(), 2),
                HostStatus::InvalidMessage as u8
            );
            assert_eq!(
                manderrow_agent_host_send_log(3, ok_scope.as_ptr(), ok_scope.len(), b"x".as_ptr(), 1),
                HostStatus::NotConnected as u8
            );
            assert_eq!(
                manderrow_agent_host_send_log(9, ok_scope.as_ptr(), ok_scope.len(), b"x".as_ptr(), 1),
                HostStatus::InvalidArgument as u8
            );
        }
    }

    #[test]
    fn output_line_rejects_unknown_channel_and_kind() {
        let line = b"hi";
        unsafe {
            assert_eq!(
                manderrow_agent_host_send_output_line(7, LINE_KIND_BYTES, line.as_ptr().cast(), 2),
                HostStatus::InvalidArgument as u8
            );
            assert_eq!(
                manderrow_agent_host_send_output_line(1, 9, line.as_ptr().cast(), 2),
                HostStatus::InvalidArgument as u8
            );
            assert_eq!(
                manderrow_agent_host_send_output_line(1, LINE_KIND_BYTES, std::ptr::null(), 0),
                HostStatus::NotConnected as u8
            );
        }
    }

    #[test]
    fn crash_rejects_non_utf8() {
        let bad = [0xc3u8];
        unsafe {
            assert_eq!(
                manderrow_agent_host_send_crash(bad.as_ptr(), 1),
                HostStatus::InvalidMessage as u8
            );
        }
        assert_eq!(
            manderrow_agent_host_send_exit(true, 0, 10),
            HostStatus::NotConnected as u8
        );
    }
}
