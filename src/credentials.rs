// SPDX-License-Identifier: MIT
// Copyright 2026. The mssql-ha Authors.

//! credentials.rs
//!
//! Reads the SQL login from a credentials file: the first line is the
//! username, the second the password. Lines are LF separated and the
//! second may be terminated by EOF instead. Nothing is trimmed beyond the
//! line terminator and there is no comment syntax.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A SQL login read from a credentials file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("could not read first line to extract username")]
    MissingUsername,
    #[error("could not read second line to extract password")]
    MissingPassword,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parse the credentials file at `path`.
pub fn read_credentials_file(path: &Path) -> Result<Credentials, CredentialsError> {
    let file = File::open(path)?;
    let mut lines = BufReader::new(file).lines();

    let username = match lines.next() {
        Some(line) => line?,
        None => return Err(CredentialsError::MissingUsername),
    };
    let password = match lines.next() {
        Some(line) => line?,
        None => return Err(CredentialsError::MissingPassword),
    };

    Ok(Credentials { username, password })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{read_credentials_file, Credentials, CredentialsError};

    fn credentials_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_username_and_password() {
        let file = credentials_file("sa\ns3cret\n");

        let credentials = read_credentials_file(file.path()).unwrap();
        assert_eq!(
            credentials,
            Credentials {
                username: "sa".to_string(),
                password: "s3cret".to_string(),
            }
        );
    }

    #[test]
    fn second_line_may_end_at_eof() {
        let file = credentials_file("sa\ns3cret");

        let credentials = read_credentials_file(file.path()).unwrap();
        assert_eq!(credentials.password, "s3cret");
    }

    #[test]
    fn interior_whitespace_is_preserved() {
        let file = credentials_file("a user\n p@ss word \n");

        let credentials = read_credentials_file(file.path()).unwrap();
        assert_eq!(credentials.username, "a user");
        assert_eq!(credentials.password, " p@ss word ");
    }

    #[test]
    fn empty_file_is_missing_username() {
        let file = credentials_file("");

        let error = read_credentials_file(file.path()).unwrap_err();
        assert!(matches!(error, CredentialsError::MissingUsername));
    }

    #[test]
    fn single_line_is_missing_password() {
        let file = credentials_file("sa\n");

        let error = read_credentials_file(file.path()).unwrap_err();
        assert!(matches!(error, CredentialsError::MissingPassword));
    }

    #[test]
    fn nonexistent_file_reports_io_error() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("absent");

        let error = read_credentials_file(&path).unwrap_err();
        assert!(matches!(error, CredentialsError::Io(_)));
    }
}
