use std::{ffi::OsString, path::PathBuf, time::Duration};

pub const LOG_FILTER_ENV: &str = "MANDERROW_AGENT_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

pub fn log_filter() -> String {
    std::env::var(LOG_FILTER_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// How long `Exit` may take to reach the manager before the process is let go.
pub fn ipc_flush_timeout() -> Duration {
    Duration::from_millis(
        env_u64("MANDERROW_IPC_FLUSH_TIMEOUT_MS")
            .map(|v| v.clamp(50, 60_000))
            .unwrap_or(2000),
    )
}

/// How long to wait for captured stdout/stderr to drain at exit.
pub fn stdio_drain_timeout() -> Duration {
    Duration::from_millis(
        env_u64("MANDERROW_STDIO_DRAIN_TIMEOUT_MS")
            .map(|v| v.clamp(10, 10_000))
            .unwrap_or(500),
    )
}

/// Logs directory used when the launcher did not pass `--logs-dir`.
pub fn default_logs_dir() -> Option<PathBuf> {
    default_logs_dir_from(|name| std::env::var_os(name))
}

fn default_logs_dir_from(get: impl Fn(&str) -> Option<OsString>) -> Option<PathBuf> {
    let get = |name: &str| get(name).filter(|v| !v.is_empty()).map(PathBuf::from);
    if let Some(root) = get("MANDERROW_DATA_ROOT") {
        return Some(root.join("logs"));
    }
    if let Some(data) = get("XDG_DATA_HOME") {
        return Some(data.join("manderrow").join("logs"));
    }
    get("HOME").map(|home| home.join(".local/share/manderrow/logs"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn data_root_wins() {
        let dir = default_logs_dir_from(lookup(&[
            ("MANDERROW_DATA_ROOT", "/srv/manderrow"),
            ("XDG_DATA_HOME", "/home/u/.data"),
            ("HOME", "/home/u"),
        ]));
        assert_eq!(dir, Some(PathBuf::from("/srv/manderrow/logs")));
    }

    #[test]
    fn falls_back_through_xdg_and_home() {
        assert_eq!(
            default_logs_dir_from(lookup(&[("XDG_DATA_HOME", "/x"), ("HOME", "/h")])),
            Some(PathBuf::from("/x/manderrow/logs"))
        );
        assert_eq!(
            default_logs_dir_from(lookup(&[("XDG_DATA_HOME", ""), ("HOME", "/h")])),
            Some(PathBuf::from("/h/.local/share/manderrow/logs"))
        );
        assert_eq!(default_logs_dir_from(lookup(&[])), None);
    }
}
