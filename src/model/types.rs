//! Core identifier types for the merge queue.
//!
//! Foundation types used throughout mergeq: request identifiers, branch
//! references, and session identifiers. All of them validate on
//! construction so the rest of the crate never handles malformed input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// The external identifier of a change to merge (e.g. a pull-request
/// number). Must be non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct RequestId(u64);

impl RequestId {
    /// Create a new `RequestId`, rejecting zero.
    ///
    /// # Errors
    /// Returns an error if `n` is zero.
    pub fn new(n: u64) -> Result<Self, ValidationError> {
        if n == 0 {
            return Err(ValidationError {
                kind: ErrorKind::RequestId,
                value: "0".to_owned(),
                reason: "request id must be a positive integer".to_owned(),
            });
        }
        Ok(Self(n))
    }

    /// Return the numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u64 = s.parse().map_err(|_| ValidationError {
            kind: ErrorKind::RequestId,
            value: s.to_owned(),
            reason: "must be a positive integer".to_owned(),
        })?;
        Self::new(n)
    }
}

impl TryFrom<u64> for RequestId {
    type Error = ValidationError;
    fn try_from(n: u64) -> Result<Self, Self::Error> {
        Self::new(n)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// BranchRef
// ---------------------------------------------------------------------------

/// A validated git branch name (e.g. `feature/auth`, `main`).
///
/// Validation follows the subset of `git check-ref-format` rules that matter
/// for branch names passed on a command line: no whitespace or control
/// characters, no `..`, no leading `-` or `/`, no trailing `/` or `.lock`,
/// and none of git's reserved metacharacters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchRef(String);

impl BranchRef {
    /// Create a new `BranchRef` from a string, validating format.
    ///
    /// # Errors
    /// Returns an error describing the first rule the name violates.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the branch name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let fail = |reason: String| ValidationError {
            kind: ErrorKind::BranchRef,
            value: s.to_owned(),
            reason,
        };

        if s.is_empty() {
            return Err(fail("branch name must not be empty".to_owned()));
        }
        if s.len() > 255 {
            return Err(fail("branch name must be at most 255 characters".to_owned()));
        }
        if s.starts_with('-') {
            return Err(fail("branch name must not start with '-'".to_owned()));
        }
        if s.starts_with('/') || s.ends_with('/') {
            return Err(fail("branch name must not start or end with '/'".to_owned()));
        }
        if s.ends_with(".lock") {
            return Err(fail("branch name must not end with '.lock'".to_owned()));
        }
        if s.contains("..") {
            return Err(fail("branch name must not contain '..'".to_owned()));
        }
        if s.contains("@{") {
            return Err(fail("branch name must not contain '@{'".to_owned()));
        }
        if let Some(c) = s
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(*c))
        {
            return Err(fail(format!("branch name must not contain '{c}'")));
        }
        Ok(())
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BranchRef {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BranchRef {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<BranchRef> for String {
    fn from(r: BranchRef) -> Self {
        r.0
    }
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Identifier of the producing development session (e.g. `term-3`).
///
/// Lowercase alphanumeric with hyphens, 1-64 characters. Recorded on each
/// request for audit.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Create a new `SessionId`, validating format.
    ///
    /// # Errors
    /// Returns an error if the string violates the naming rules.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// Return the session name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        let fail = |reason: String| ValidationError {
            kind: ErrorKind::SessionId,
            value: s.to_owned(),
            reason,
        };

        if s.is_empty() || s.len() > 64 {
            return Err(fail(format!("expected 1-64 characters, got {}", s.len())));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(fail(
                "must contain only lowercase letters, digits, and hyphens".to_owned(),
            ));
        }
        if s.starts_with('-') || s.ends_with('-') {
            return Err(fail("must not start or end with a hyphen".to_owned()));
        }
        Ok(())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// Which identifier type failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A [`RequestId`] failed validation.
    RequestId,
    /// A [`BranchRef`] failed validation.
    BranchRef,
    /// A [`SessionId`] failed validation.
    SessionId,
}

/// An identifier failed validation on construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    /// Which identifier type was being constructed.
    pub kind: ErrorKind,
    /// The rejected input.
    pub value: String,
    /// Why the input is invalid.
    pub reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            ErrorKind::RequestId => "request id",
            ErrorKind::BranchRef => "branch",
            ErrorKind::SessionId => "session id",
        };
        write!(f, "invalid {what} '{}': {}", self.value, self.reason)
    }
}

impl std::error::Error for ValidationError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
#[allow(clippy::all, clippy::pedantic, clippy::nursery)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Accepted branch refs always survive a serde round trip intact.
        #[test]
        fn branch_ref_serde_round_trip(name in "[a-zA-Z0-9][a-zA-Z0-9._/-]{0,80}") {
            if let Ok(r) = BranchRef::new(&name) {
                let json = serde_json::to_string(&r).unwrap();
                let back: BranchRef = serde_json::from_str(&json).unwrap();
                prop_assert_eq!(back, r);
            }
        }

        /// Anything containing whitespace or git's forbidden ref characters
        /// is rejected, no matter where the character lands.
        #[test]
        fn branch_ref_rejects_forbidden_chars(
            prefix in "[a-z]{0,10}",
            bad in prop::sample::select(vec![' ', '\t', '~', '^', ':', '?', '*', '[', '\\']),
            suffix in "[a-z]{0,10}",
        ) {
            let name = format!("{prefix}{bad}{suffix}");
            prop_assert!(BranchRef::new(&name).is_err());
        }

        /// Session ids accept exactly the documented alphabet.
        #[test]
        fn session_id_accepts_only_documented_alphabet(name in "[a-z0-9]([a-z0-9-]{0,62}[a-z0-9])?") {
            prop_assert!(SessionId::new(&name).is_ok());
        }

        #[test]
        fn request_id_round_trips_when_nonzero(n in 1u64..) {
            let id = RequestId::new(n).unwrap();
            prop_assert_eq!(id.get(), n);
            let json = serde_json::to_string(&id).unwrap();
            let back: RequestId = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, id);
        }
    }
}
