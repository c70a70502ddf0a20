// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! ocf.rs
//!
//! OCF exit-code handling.
//!
//! A cluster resource agent reports its result through a fixed set of OCF
//! exit codes whose numeric values the cluster manager supplies through
//! environment variables. The helpers import them once at startup into an
//! [`OcfExitCodes`] value that is threaded through the dispatcher.

use crate::log::Logger;

/// A single OCF exit code as supplied by the cluster manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OcfExitCode(pub i32);

impl OcfExitCode {
    /// The process exit status for this code.
    ///
    /// OCF codes are offset by 10 so they can be told apart from
    /// interpreter-level failures (a panic exits with 1).
    pub fn process_status(self) -> i32 {
        self.0 + 10
    }
}

/// The nine OCF exit codes a resource agent can report, in import order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OcfExitCodes {
    pub err_configured: OcfExitCode,
    pub err_generic: OcfExitCode,
    pub err_args: OcfExitCode,
    pub err_perm: OcfExitCode,
    pub err_unimplemented: OcfExitCode,
    pub failed_master: OcfExitCode,
    pub not_running: OcfExitCode,
    pub running_master: OcfExitCode,
    pub success: OcfExitCode,
}

/// An OCF exit-code variable was missing or did not parse as a decimal
/// integer. An unset variable reports the empty string as its raw value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{name} is set to an invalid value [{raw}]")]
pub struct OcfImportError {
    pub name: &'static str,
    pub raw: String,
}

impl OcfExitCodes {
    /// Import the nine codes from the process environment.
    pub fn from_env() -> Result<Self, OcfImportError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the codes from an arbitrary name lookup. The first name that
    /// fails to parse is reported.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OcfImportError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let err_configured = import_one("OCF_ERR_CONFIGURED", &lookup)?;
        let err_generic = import_one("OCF_ERR_GENERIC", &lookup)?;
        let err_args = import_one("OCF_ERR_ARGS", &lookup)?;
        let err_perm = import_one("OCF_ERR_PERM", &lookup)?;
        let err_unimplemented = import_one("OCF_ERR_UNIMPLEMENTED", &lookup)?;
        let failed_master = import_one("OCF_FAILED_MASTER", &lookup)?;
        let not_running = import_one("OCF_NOT_RUNNING", &lookup)?;
        let running_master = import_one("OCF_RUNNING_MASTER", &lookup)?;
        let success = import_one("OCF_SUCCESS", &lookup)?;

        Ok(OcfExitCodes {
            err_configured,
            err_generic,
            err_args,
            err_perm,
            err_unimplemented,
            failed_master,
            not_running,
            running_master,
            success,
        })
    }
}

fn import_one<F>(name: &'static str, lookup: &F) -> Result<OcfExitCode, OcfImportError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name).unwrap_or_default();
    match raw.parse::<i32>() {
        Ok(value) => Ok(OcfExitCode(value)),
        Err(_) => Err(OcfImportError { name, raw }),
    }
}

/// Log `error` line by line on the error stream and terminate with
/// `status`. Used directly for non-OCF fatal paths; orderly completions go
/// through [`ocf_exit`].
pub fn exit(errors: &Logger, status: i32, error: Option<&anyhow::Error>) -> ! {
    if let Some(error) = error {
        // One logger call per line so every line carries the prefix.
        for line in format!("{error}").lines() {
            errors.line(line);
        }
    }
    std::process::exit(status);
}

/// Terminate with an OCF exit code, offset per
/// [`OcfExitCode::process_status`].
pub fn ocf_exit(errors: &Logger, code: OcfExitCode, error: Option<&anyhow::Error>) -> ! {
    exit(errors, code.process_status(), error)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{OcfExitCode, OcfExitCodes, OcfImportError};

    fn valid_environment() -> HashMap<&'static str, &'static str> {
        // Intentionally not the conventional values, so the test can tell
        // an imported code from a defaulted zero.
        HashMap::from([
            ("OCF_SUCCESS", "1"),
            ("OCF_ERR_ARGS", "2"),
            ("OCF_ERR_CONFIGURED", "3"),
            ("OCF_ERR_GENERIC", "4"),
            ("OCF_ERR_PERM", "5"),
            ("OCF_ERR_UNIMPLEMENTED", "6"),
            ("OCF_FAILED_MASTER", "7"),
            ("OCF_NOT_RUNNING", "8"),
            ("OCF_RUNNING_MASTER", "9"),
        ])
    }

    fn lookup_in(
        env: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Option<String> {
        move |name| env.get(name).map(|value| value.to_string())
    }

    #[test]
    fn imports_all_nine_codes() {
        let codes = OcfExitCodes::from_lookup(lookup_in(valid_environment())).unwrap();

        assert_eq!(codes.success, OcfExitCode(1));
        assert_eq!(codes.err_args, OcfExitCode(2));
        assert_eq!(codes.err_configured, OcfExitCode(3));
        assert_eq!(codes.err_generic, OcfExitCode(4));
        assert_eq!(codes.err_perm, OcfExitCode(5));
        assert_eq!(codes.err_unimplemented, OcfExitCode(6));
        assert_eq!(codes.failed_master, OcfExitCode(7));
        assert_eq!(codes.not_running, OcfExitCode(8));
        assert_eq!(codes.running_master, OcfExitCode(9));
    }

    #[test]
    fn missing_variable_reads_as_empty() {
        let mut env = valid_environment();
        env.remove("OCF_SUCCESS");

        let error = OcfExitCodes::from_lookup(lookup_in(env)).unwrap_err();
        assert_eq!(
            error,
            OcfImportError {
                name: "OCF_SUCCESS",
                raw: String::new(),
            }
        );
        assert_eq!(
            error.to_string(),
            "OCF_SUCCESS is set to an invalid value []"
        );
    }

    #[test]
    fn non_numeric_variable_fails_with_its_raw_value() {
        let mut env = valid_environment();
        env.insert("OCF_SUCCESS", "A");

        let error = OcfExitCodes::from_lookup(lookup_in(env)).unwrap_err();
        assert_eq!(
            error.to_string(),
            "OCF_SUCCESS is set to an invalid value [A]"
        );
    }

    #[test]
    fn first_bad_name_in_import_order_is_reported() {
        let mut env = valid_environment();
        env.insert("OCF_ERR_GENERIC", "nope");
        env.insert("OCF_SUCCESS", "nope");

        // OCF_ERR_GENERIC is imported before OCF_SUCCESS.
        let error = OcfExitCodes::from_lookup(lookup_in(env)).unwrap_err();
        assert_eq!(error.name, "OCF_ERR_GENERIC");
    }

    #[test]
    fn process_status_offsets_by_ten() {
        assert_eq!(OcfExitCode(0).process_status(), 10);
        assert_eq!(OcfExitCode(7).process_status(), 17);
    }
}
