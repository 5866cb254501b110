// GCPS
// Copyright 2023 Julio Merino
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not
// use this file except in compliance with the License.  You may obtain a copy
// of the License at:
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.  See the
// License for the specific language governing permissions and limitations
// under the License.

//! Utilities to deal with environment variables.
//!
//! Configuration for all GCPS components comes from environment variables whose names share a
//! common prefix, such as `PUBSUB_PROJECT_ID` and `PUBSUB_EMULATOR_HOST` for the `PUBSUB` prefix.
//! Option structs expose `from_env(prefix)` constructors built on top of these helpers.

use std::env;
use std::time::Duration;

/// Result type for environment errors.
type Result<T> = std::result::Result<T, String>;

/// Wrapper around an environment variable's value to support conversions to other types.
pub struct Value(String);

impl TryFrom<Value> for String {
    type Error = String;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        Ok(value.0)
    }
}

impl TryFrom<Value> for Duration {
    type Error = String;

    /// Parses a number of seconds, optionally followed by an `s` suffix.
    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let raw = value.0.strip_suffix('s').unwrap_or(&value.0);
        raw.parse::<u64>().map(Duration::from_secs).map_err(|e| {
            format!("Invalid Duration: '{}' is not a number of seconds: {}", value.0, e)
        })
    }
}

/// Generates a `TryFrom<Value>` for a type that can be parsed by `FromStr`.
macro_rules! tryfrom_value_for_fromstr [
    ( $t:ty ) => {
        impl TryFrom<Value> for $t {
            type Error = String;

            fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
                value.0.parse::<$t>().map_err(|e| format!("Invalid {}: {}", stringify!($t), e))
            }
        }
    }
];

tryfrom_value_for_fromstr!(u8);
tryfrom_value_for_fromstr!(u16);
tryfrom_value_for_fromstr!(u32);
tryfrom_value_for_fromstr!(u64);
tryfrom_value_for_fromstr!(usize);

/// Gets an optional environment variable whose name is `<prefix>_<suffix>` with a conversion to
/// a target type `T`.
///
/// Returns `None` if the variable is not set.  Empty values count as not set so that scripts can
/// blank out a variable without having to unset it.
pub fn get_optional_var<T: TryFrom<Value, Error = String>>(
    prefix: &str,
    suffix: &str,
) -> Result<Option<T>> {
    let name = format!("{}_{}", prefix, suffix);
    match env::var(&name) {
        Ok(value) if value.is_empty() => Ok(None),
        Ok(value) => match Value(value).try_into() {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(format!("Invalid type in environment variable {}: {}", name, e)),
        },
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => {
            Err(format!("Invalid value in environment variable {}", name))
        }
    }
}

/// Gets a required environment variable whose name is `<prefix>_<suffix>` with a conversion to
/// a target type `T`.
pub fn get_required_var<T: TryFrom<Value, Error = String>>(
    prefix: &str,
    suffix: &str,
) -> Result<T> {
    match get_optional_var(prefix, suffix)? {
        Some(value) => Ok(value),
        None => Err(format!("Required environment variable {}_{} not present", prefix, suffix)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    #[test]
    fn test_value_to_string() {
        assert_eq!("foo bar", &TryInto::<String>::try_into(Value("foo bar".to_owned())).unwrap());
    }

    #[test]
    fn test_value_to_fromstr() {
        assert_eq!(1234u16, TryInto::<u16>::try_into(Value("1234".to_owned())).unwrap());

        let err = TryInto::<u16>::try_into(Value("-1".to_owned())).unwrap_err();
        assert!(err.starts_with("Invalid u16:"));
    }

    #[test]
    fn test_value_to_duration() {
        assert_eq!(
            Duration::from_secs(30),
            TryInto::<Duration>::try_into(Value("30".to_owned())).unwrap()
        );
        assert_eq!(
            Duration::from_secs(600),
            TryInto::<Duration>::try_into(Value("600s".to_owned())).unwrap()
        );

        let err = TryInto::<Duration>::try_into(Value("5m".to_owned())).unwrap_err();
        assert!(err.starts_with("Invalid Duration:"));
    }

    #[test]
    fn test_get_optional_var_ok() {
        temp_env::with_var("PREFIX_OPT_PRESENT", Some("99"), || {
            assert_eq!(Some(99u8), get_optional_var::<u8>("PREFIX", "OPT_PRESENT").unwrap());
        });
    }

    #[test]
    fn test_get_optional_var_missing_or_empty() {
        temp_env::with_var_unset("PREFIX_OPT_MISSING", || {
            assert_eq!(None, get_optional_var::<String>("PREFIX", "OPT_MISSING").unwrap());
        });
        temp_env::with_var("PREFIX_OPT_EMPTY", Some(""), || {
            assert_eq!(None, get_optional_var::<String>("PREFIX", "OPT_EMPTY").unwrap());
        });
    }

    #[test]
    fn test_get_optional_var_bad_type() {
        temp_env::with_var("PREFIX_OPT_BAD", Some("300"), || {
            let err = get_optional_var::<u8>("PREFIX", "OPT_BAD").unwrap_err();
            assert!(err.starts_with("Invalid type in environment variable PREFIX_OPT_BAD"));
        });
    }

    #[test]
    fn test_get_required_var_ok() {
        temp_env::with_var("PREFIX_PRESENT", Some("1234"), || {
            assert_eq!("1234", &get_required_var::<String>("PREFIX", "PRESENT").unwrap());
        });
    }

    #[test]
    fn test_get_required_var_missing() {
        temp_env::with_var_unset("PREFIX_MISSING", || {
            assert_eq!(
                "Required environment variable PREFIX_MISSING not present",
                &get_required_var::<String>("PREFIX", "MISSING").unwrap_err()
            );
        });
    }

    #[test]
    fn test_get_required_var_not_utf8() {
        temp_env::with_var("PREFIX_INVALID", Some(OsStr::from_bytes(b"\xc3\x28")), || {
            assert_eq!(
                "Invalid value in environment variable PREFIX_INVALID",
                &get_required_var::<String>("PREFIX", "INVALID").unwrap_err()
            );
        });
    }

    #[test]
    fn test_get_required_var_bad_type() {
        temp_env::with_var("PREFIX_BAD", Some("b4d"), || {
            let err = get_required_var::<u16>("PREFIX", "BAD").unwrap_err();
            assert!(
                err.starts_with("Invalid type in environment variable PREFIX_BAD: Invalid u16")
            );
        });
    }
}
