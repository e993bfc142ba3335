use std::{borrow::Cow, ffi::OsStr};

use serde::{Deserialize, Serialize};

/// An OS string that survives the trip to the host even when it is not valid text.
///
/// Output lines, argv entries and env values are only *usually* Unicode, so the
/// non-Unicode forms are carried verbatim instead of being coerced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SafeOsString {
    Unicode(String),
    NonUnicodeBytes(#[serde(with = "b64")] Vec<u8>),
    NonUnicodeWide(Vec<u16>),
}

impl SafeOsString {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(s) => SafeOsString::Unicode(s.to_string()),
            Err(_) => SafeOsString::NonUnicodeBytes(bytes.to_vec()),
        }
    }

    pub fn from_wide(units: &[u16]) -> Self {
        match String::from_utf16(units) {
            Ok(s) => SafeOsString::Unicode(s),
            Err(_) => SafeOsString::NonUnicodeWide(units.to_vec()),
        }
    }

    pub fn is_unicode(&self) -> bool {
        matches!(self, SafeOsString::Unicode(_))
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        match self {
            SafeOsString::Unicode(s) => Cow::Borrowed(s),
            SafeOsString::NonUnicodeBytes(b) => String::from_utf8_lossy(b),
            SafeOsString::NonUnicodeWide(w) => Cow::Owned(String::from_utf16_lossy(w)),
        }
    }
}

impl From<String> for SafeOsString {
    fn from(value: String) -> Self {
        SafeOsString::Unicode(value)
    }
}

impl From<&str> for SafeOsString {
    fn from(value: &str) -> Self {
        SafeOsString::Unicode(value.to_string())
    }
}

impl From<&OsStr> for SafeOsString {
    #[cfg(unix)]
    fn from(value: &OsStr) -> Self {
        use std::os::unix::ffi::OsStrExt;
        SafeOsString::from_bytes(value.as_bytes())
    }

    #[cfg(windows)]
    fn from(value: &OsStr) -> Self {
        use std::os::windows::ffi::OsStrExt;
        match value.to_str() {
            Some(s) => SafeOsString::Unicode(s.to_string()),
            None => SafeOsString::NonUnicodeWide(value.encode_wide().collect()),
        }
    }

    #[cfg(not(any(unix, windows)))]
    fn from(value: &OsStr) -> Self {
        SafeOsString::from_bytes(value.as_encoded_bytes())
    }
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    const ENGINE: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ENGINE.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        ENGINE.decode(s).map_err(serde::de::Error::custom)
    }
}
