use std::{
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
};

use crate::{AgentConfig, ArgsError, CLOSE, Encoding, Instruction, OPEN, ParsedArgs, opt};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Before,
    Inside { opened_at: usize },
    After,
}

/// Split the raw argument vector into the agent region and the passthrough arguments,
/// then decode the region and prepare `--logs-dir`.
///
/// The iterator is drained completely before decoding starts. Any error means no
/// configuration at all; callers must not fall back to defaults. The logs directory is
/// only created once the whole region has been accepted.
pub fn parse<I>(args: I) -> Result<ParsedArgs, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    let mut parsed = decode(args)?;
    if let Some(raw) = parsed.config.logs_dir.take() {
        parsed.config.logs_dir = Some(prepare_logs_dir(raw)?);
    }
    Ok(parsed)
}

/// Like [`parse`], without touching the filesystem. `logs_dir` is returned as given.
pub fn decode<I>(args: I) -> Result<ParsedArgs, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    let mut state = Scan::Before;
    let mut passthrough = Vec::new();
    let mut directives = Vec::new();

    for (index, arg) in args.into_iter().enumerate() {
        let is_open = arg == OPEN;
        let is_close = arg == CLOSE;
        state = match state {
            Scan::Before if is_open => Scan::Inside { opened_at: index },
            Scan::Inside { .. } if is_close => Scan::After,
            Scan::Before | Scan::After | Scan::Inside { .. } if is_open || is_close => {
                let token = if is_open { OPEN } else { CLOSE };
                return Err(ArgsError::UnbalancedDelimiter { token, index });
            }
            Scan::Inside { .. } => {
                directives.push(arg);
                state
            }
            Scan::Before | Scan::After => {
                passthrough.push(arg);
                state
            }
        };
    }

    if let Scan::Inside { opened_at } = state {
        return Err(ArgsError::UnbalancedDelimiter {
            token: OPEN,
            index: opened_at,
        });
    }

    let config = decode_region(directives)?;
    Ok(ParsedArgs {
        config,
        passthrough,
    })
}

fn decode_region(directives: Vec<OsString>) -> Result<AgentConfig, ArgsError> {
    let mut cfg = AgentConfig::default();
    let mut tokens = directives.into_iter();

    while let Some(token) = tokens.next() {
        let Some(name) = token.to_str() else {
            return Err(ArgsError::UnexpectedArgument(token));
        };
        match name {
            opt::ENABLE => cfg.enabled = true,
            opt::LOG_TO_FILE => cfg.log_to_file = true,
            opt::LOGS_DIR => {
                let value = take_value(&mut tokens, opt::LOGS_DIR, Encoding::Native)?;
                set_once(&mut cfg.logs_dir, opt::LOGS_DIR, PathBuf::from(value))?;
            }
            opt::C2S_TX => {
                let value = take_value(&mut tokens, opt::C2S_TX, Encoding::Utf8)?;
                let value = value
                    .into_string()
                    .map_err(|value| ArgsError::InvalidEncoding {
                        option: opt::C2S_TX,
                        encoding: Encoding::Utf8,
                        value,
                    })?;
                set_once(&mut cfg.c2s_tx, opt::C2S_TX, value)?;
            }
            opt::INSN_LOAD_LIBRARY => {
                let value = take_value(&mut tokens, opt::INSN_LOAD_LIBRARY, Encoding::Native)?;
                cfg.instructions.push(Instruction::LoadLibrary {
                    path: PathBuf::from(value),
                });
            }
            opt::INSN_SET_VAR => {
                let value = take_value(&mut tokens, opt::INSN_SET_VAR, Encoding::Native)?;
                let (key, value) = split_key_value(value)?;
                cfg.instructions.push(Instruction::SetVar { key, value });
            }
            opt::INSN_PREPEND_ARG => {
                let value = take_value(&mut tokens, opt::INSN_PREPEND_ARG, Encoding::Native)?;
                cfg.instructions.push(Instruction::PrependArg { value });
            }
            opt::INSN_APPEND_ARG => {
                let value = take_value(&mut tokens, opt::INSN_APPEND_ARG, Encoding::Native)?;
                cfg.instructions.push(Instruction::AppendArg { value });
            }
            // Consumed by the launcher wrapper; the agent only has to skip it.
            opt::AGENT_PATH => {
                take_value(&mut tokens, opt::AGENT_PATH, Encoding::Native)?;
            }
            opt::DLFCN_HOST_PATH => {
                let value = take_value(&mut tokens, opt::DLFCN_HOST_PATH, Encoding::Native)?;
                set_once(&mut cfg.dlfcn_host_path, opt::DLFCN_HOST_PATH, value.into())?;
            }
            opt::AGENT_HOST_PATH => {
                let value = take_value(&mut tokens, opt::AGENT_HOST_PATH, Encoding::Native)?;
                set_once(&mut cfg.agent_host_path, opt::AGENT_HOST_PATH, value.into())?;
            }
            _ => return Err(ArgsError::UnexpectedArgument(token)),
        }
    }

    if !cfg.enabled {
        return Err(ArgsError::Disabled);
    }
    if cfg.dlfcn_host_path.is_some() != cfg.agent_host_path.is_some() {
        return Err(ArgsError::IncompleteBridgePaths);
    }
    Ok(cfg)
}

fn take_value(
    tokens: &mut impl Iterator<Item = OsString>,
    option: &'static str,
    encoding: Encoding,
) -> Result<OsString, ArgsError> {
    let value = tokens
        .next()
        .ok_or(ArgsError::MissingOptionValue(option))?;
    let valid = match encoding {
        Encoding::Utf8 => value.to_str().is_some(),
        Encoding::Native => !value.as_encoded_bytes().contains(&0),
    };
    if !valid {
        return Err(ArgsError::InvalidEncoding {
            option,
            encoding,
            value,
        });
    }
    Ok(value)
}

fn set_once<T>(slot: &mut Option<T>, option: &'static str, value: T) -> Result<(), ArgsError> {
    if slot.is_some() {
        return Err(ArgsError::DuplicateOption(option));
    }
    *slot = Some(value);
    Ok(())
}

fn split_key_value(kv: OsString) -> Result<(OsString, OsString), ArgsError> {
    let bytes = kv.as_encoded_bytes();
    match bytes.iter().position(|&b| b == b'=') {
        Some(0) | None => Err(ArgsError::InvalidSetVarKV(kv)),
        Some(i) => {
            // SAFETY: both halves are split at an ASCII byte, which keeps them valid
            // encoded OS strings.
            let (key, value) = unsafe {
                (
                    OsStr::from_encoded_bytes_unchecked(&bytes[..i]),
                    OsStr::from_encoded_bytes_unchecked(&bytes[i + 1..]),
                )
            };
            Ok((key.to_owned(), value.to_owned()))
        }
    }
}

fn prepare_logs_dir(raw: PathBuf) -> Result<PathBuf, ArgsError> {
    let path = normalize_dir(&raw).map_err(|source| ArgsError::LogsDir {
        path: raw.clone(),
        source,
    })?;
    std::fs::create_dir_all(&path).map_err(|source| ArgsError::LogsDir {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

#[cfg(windows)]
fn normalize_dir(path: &Path) -> io::Result<PathBuf> {
    let abs = std::path::absolute(path)?;
    let bytes = abs.as_os_str().as_encoded_bytes();
    if bytes.starts_with(br"\\?\") {
        return Ok(abs);
    }
    let mut out = OsString::new();
    if let Some(unc) = bytes.strip_prefix(br"\\") {
        out.push(r"\\?\UNC\");
        // SAFETY: stripped an ASCII prefix from valid encoded bytes.
        out.push(unsafe { OsStr::from_encoded_bytes_unchecked(unc) });
    } else {
        out.push(r"\\?\");
        out.push(abs.as_os_str());
    }
    Ok(PathBuf::from(out))
}

#[cfg(not(windows))]
fn normalize_dir(path: &Path) -> io::Result<PathBuf> {
    std::path::absolute(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(v: &[&str]) -> Vec<OsString> {
        v.iter().map(OsString::from).collect()
    }

    #[test]
    fn no_region_is_disabled() {
        let err = parse(os(&["game", "-windowed"])).unwrap_err();
        assert!(err.is_disabled());
    }

    #[test]
    fn region_without_enable_is_disabled() {
        let err = parse(os(&["game", OPEN, "--log-to-file", CLOSE])).unwrap_err();
        assert!(matches!(err, ArgsError::Disabled));
    }

    #[test]
    fn minimal_region_is_stripped() {
        let parsed = parse(os(&["game", "a", OPEN, "--enable", CLOSE, "b"])).unwrap();
        assert!(parsed.config.enabled);
        assert!(!parsed.config.log_to_file);
        assert!(parsed.config.instructions.is_empty());
        assert_eq!(parsed.passthrough, os(&["game", "a", "b"]));
    }

    #[test]
    fn decodes_every_directive_in_order() {
        let parsed = parse(os(&[
            "launcher",
            OPEN,
            "--enable",
            "--log-to-file",
            "--c2s-tx",
            "tcp://127.0.0.1:4000?conn=3",
            "--insn-load-library",
            "/opt/mods/first.so",
            "--insn-set-var",
            "DOORSTOP_ENABLED=1",
            "--insn-prepend-arg",
            "--first",
            "--agent-path",
            "/ignored/agent",
            "--insn-set-var",
            "EMPTY=",
            "--insn-append-arg",
            "--last",
            "--insn-load-library",
            "/opt/mods/second.so",
            "--dlfcn-host-path",
            "/shim.so",
            "--agent-host-path",
            "/host.so",
            CLOSE,
            "-batchmode",
        ]))
        .unwrap();

        let cfg = &parsed.config;
        assert!(cfg.log_to_file);
        assert_eq!(cfg.c2s_tx.as_deref(), Some("tcp://127.0.0.1:4000?conn=3"));
        assert_eq!(
            cfg.instructions,
            vec![
                Instruction::LoadLibrary {
                    path: "/opt/mods/first.so".into()
                },
                Instruction::SetVar {
                    key: "DOORSTOP_ENABLED".into(),
                    value: "1".into()
                },
                Instruction::PrependArg {
                    value: "--first".into()
                },
                Instruction::SetVar {
                    key: "EMPTY".into(),
                    value: "".into()
                },
                Instruction::AppendArg {
                    value: "--last".into()
                },
                Instruction::LoadLibrary {
                    path: "/opt/mods/second.so".into()
                },
            ]
        );
        assert_eq!(cfg.dlfcn_host_path.as_deref(), Some(Path::new("/shim.so")));
        assert_eq!(cfg.agent_host_path.as_deref(), Some(Path::new("/host.so")));
        assert_eq!(parsed.passthrough, os(&["launcher", "-batchmode"]));
    }

    #[test]
    fn set_var_value_may_contain_equals() {
        let parsed = parse(os(&[OPEN, "--enable", "--insn-set-var", "A=b=c", CLOSE])).unwrap();
        assert_eq!(
            parsed.config.instructions,
            vec![Instruction::SetVar {
                key: "A".into(),
                value: "b=c".into()
            }]
        );
    }

    #[test]
    fn set_var_rejects_missing_separator_and_empty_key() {
        for bad in ["NOSEP", "=value"] {
            let err = parse(os(&[OPEN, "--enable", "--insn-set-var", bad, CLOSE])).unwrap_err();
            assert!(
                matches!(&err, ArgsError::InvalidSetVarKV(v) if v == bad),
                "{bad}: {err}"
            );
        }
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let err = parse(os(&[OPEN, "--enable", "--frobnicate", CLOSE])).unwrap_err();
        assert!(matches!(err, ArgsError::UnexpectedArgument(v) if v == "--frobnicate"));
    }

    #[test]
    fn value_directive_at_end_of_region_is_missing_value() {
        let err = parse(os(&[OPEN, "--enable", "--c2s-tx", CLOSE, "after"])).unwrap_err();
        assert!(matches!(err, ArgsError::MissingOptionValue("--c2s-tx")));
    }

    #[test]
    fn unbalanced_delimiters_are_rejected() {
        let cases: [(&[&str], &str, usize); 5] = [
            (&["game", OPEN, "--enable"], OPEN, 1),
            (&["game", "--enable", CLOSE], CLOSE, 2),
            (&[CLOSE, OPEN, "--enable"], CLOSE, 0),
            (&[OPEN, "--enable", OPEN, CLOSE], OPEN, 2),
            (&[OPEN, "--enable", CLOSE, OPEN, "--enable", CLOSE], OPEN, 3),
        ];
        for (args, token, index) in cases {
            let err = parse(os(args)).unwrap_err();
            match err {
                ArgsError::UnbalancedDelimiter { token: t, index: i } => {
                    assert_eq!((t, i), (token, index), "{args:?}");
                }
                other => panic!("{args:?}: unexpected {other}"),
            }
        }
    }

    #[test]
    fn duplicate_single_valued_option_is_rejected() {
        let err = parse(os(&[
            OPEN, "--enable", "--c2s-tx", "a", "--c2s-tx", "b", CLOSE,
        ]))
        .unwrap_err();
        assert!(matches!(err, ArgsError::DuplicateOption("--c2s-tx")));
    }

    #[test]
    fn bridge_paths_must_come_together() {
        let err = parse(os(&[OPEN, "--enable", "--dlfcn-host-path", "/shim.so", CLOSE]))
            .unwrap_err();
        assert!(matches!(err, ArgsError::IncompleteBridgePaths));
    }

    #[test]
    fn native_values_reject_nul() {
        let err = parse(os(&[OPEN, "--enable", "--insn-append-arg", "a\0b", CLOSE])).unwrap_err();
        assert!(matches!(
            err,
            ArgsError::InvalidEncoding {
                option: "--insn-append-arg",
                encoding: Encoding::Native,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn c2s_tx_must_be_utf8() {
        use std::os::unix::ffi::OsStringExt;

        let args = vec![
            OsString::from(OPEN),
            OsString::from("--enable"),
            OsString::from("--c2s-tx"),
            OsString::from_vec(vec![b'x', 0xff, b'y']),
            OsString::from(CLOSE),
        ];
        let err = parse(args).unwrap_err();
        assert!(matches!(
            err,
            ArgsError::InvalidEncoding {
                option: "--c2s-tx",
                encoding: Encoding::Utf8,
                ..
            }
        ));
    }

    #[cfg(unix)]
    #[test]
    fn passthrough_keeps_non_unicode_bytes() {
        use std::os::unix::ffi::OsStringExt;

        let raw = OsString::from_vec(vec![b'-', 0xfe, 0xff]);
        let args = vec![
            OsString::from("game"),
            raw.clone(),
            OsString::from(OPEN),
            OsString::from("--enable"),
            OsString::from(CLOSE),
        ];
        let parsed = parse(args).unwrap();
        assert_eq!(parsed.passthrough, vec![OsString::from("game"), raw]);
    }

    #[test]
    fn logs_dir_is_created_and_absolute() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("logs");
        let parsed = parse(vec![
            OsString::from(OPEN),
            OsString::from("--enable"),
            OsString::from("--logs-dir"),
            dir.clone().into_os_string(),
            OsString::from(CLOSE),
        ])
        .unwrap();

        let got = parsed.config.logs_dir.unwrap();
        assert!(got.is_absolute());
        assert!(got.is_dir());
        #[cfg(not(windows))]
        assert_eq!(got, dir);
    }

    #[test]
    fn rejected_regions_leave_logs_dir_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let disabled = tmp.path().join("disabled");
        let err = parse(vec![
            OsString::from("game"),
            OsString::from(OPEN),
            OsString::from("--logs-dir"),
            disabled.clone().into_os_string(),
            OsString::from(CLOSE),
        ])
        .unwrap_err();
        assert!(err.is_disabled());
        assert!(!disabled.exists());

        let invalid = tmp.path().join("invalid");
        let err = parse(vec![
            OsString::from(OPEN),
            OsString::from("--enable"),
            OsString::from("--logs-dir"),
            invalid.clone().into_os_string(),
            OsString::from("--bogus"),
            OsString::from(CLOSE),
        ])
        .unwrap_err();
        assert!(matches!(err, ArgsError::UnexpectedArgument(_)));
        assert!(!invalid.exists());

        let bridged = tmp.path().join("bridged");
        let err = parse(vec![
            OsString::from(OPEN),
            OsString::from("--enable"),
            OsString::from("--logs-dir"),
            bridged.clone().into_os_string(),
            OsString::from("--agent-host-path"),
            OsString::from("/host.so"),
            OsString::from(CLOSE),
        ])
        .unwrap_err();
        assert!(matches!(err, ArgsError::IncompleteBridgePaths));
        assert!(!bridged.exists());
    }

    #[test]
    fn decode_does_not_create_logs_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("later");
        let parsed = decode(vec![
            OsString::from(OPEN),
            OsString::from("--enable"),
            OsString::from("--logs-dir"),
            dir.clone().into_os_string(),
            OsString::from(CLOSE),
        ])
        .unwrap();
        assert_eq!(parsed.config.logs_dir, Some(dir.clone()));
        assert!(!dir.exists());
    }

    #[test]
    fn reparsing_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let args = vec![
            OsString::from("game"),
            OsString::from(OPEN),
            OsString::from("--enable"),
            OsString::from("--logs-dir"),
            tmp.path().as_os_str().to_owned(),
            OsString::from("--insn-prepend-arg"),
            OsString::from("x"),
            OsString::from(CLOSE),
        ];
        let first = parse(args.clone()).unwrap();
        let second = parse(args).unwrap();
        assert_eq!(first, second);
    }
}
