// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Versions and their cookie encoding.
//!
//! A [`CvrVersion`] is the pair `(state_version, minor_version)`. The state
//! version is the lexicographically ordered token assigned by the replica
//! ingester; the minor version advances when the CVR changes without the
//! replica advancing. The cookie encoding preserves the total order
//! byte-for-byte, so clients can compare cookies without parsing them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ErrorKind;

/// Digits of the base-36 alphabet, in order.
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// The separator between the state and minor components of a cookie.
///
/// `'.'` sorts below every base-36 digit, which is what makes
/// `(s, 0) < (s, 1) < (s', 0)` hold byte-wise for any state token `s` that is
/// a proper prefix of `s'`.
const COOKIE_SEPARATOR: char = '.';

/// An error produced while parsing a version or cookie.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// The token was empty or contained characters outside base-36.
    #[error("invalid version token: {0:?}")]
    InvalidToken(String),
    /// The cookie could not be split into its components.
    #[error("invalid cookie: {0:?}")]
    InvalidCookie(String),
    /// A length-prefixed integer encoding was malformed.
    #[error("invalid length-prefixed integer: {0:?}")]
    InvalidLexi(String),
}

impl VersionError {
    /// The taxonomy kind of this error. Malformed cookies always come from a
    /// client, so they fail only the offending request.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::BadRequest
    }
}

/// Encodes `n` as a base-36 string prefixed with one base-36 digit holding
/// the number of digits minus one. The encoding of a smaller number always
/// sorts below the encoding of a larger one.
pub fn to_lexi(n: u64) -> String {
    let mut digits = Vec::new();
    let mut n = n;
    loop {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    let mut out = String::with_capacity(digits.len() + 1);
    out.push(BASE36[digits.len() - 1] as char);
    out.extend(digits.iter().rev().map(|&b| b as char));
    out
}

/// Inverts [`to_lexi`].
pub fn from_lexi(s: &str) -> Result<u64, VersionError> {
    let err = || VersionError::InvalidLexi(s.to_owned());
    let mut chars = s.bytes();
    let len_digit = chars.next().ok_or_else(err)?;
    let len = base36_digit(len_digit).ok_or_else(err)? as usize + 1;
    let rest = &s.as_bytes()[1..];
    if rest.len() != len {
        return Err(err());
    }
    let mut n: u64 = 0;
    for &b in rest {
        let digit = base36_digit(b).ok_or_else(err)?;
        n = n.checked_mul(36).and_then(|n| n.checked_add(digit)).ok_or_else(err)?;
    }
    Ok(n)
}

fn base36_digit(b: u8) -> Option<u64> {
    match b {
        b'0'..=b'9' => Some(u64::from(b - b'0')),
        b'a'..=b'z' => Some(u64::from(b - b'a') + 10),
        _ => None,
    }
}

/// The externally ordered version token assigned by the replica ingester.
///
/// Tokens are opaque to the view syncer except for their ordering, which is
/// plain byte order. Tokens consist of base-36 digits.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(String);

impl StateVersion {
    /// The minimum state version, the version of an empty CVR.
    pub fn min() -> StateVersion {
        StateVersion("00".into())
    }

    /// Parses a state version token, rejecting anything outside base-36.
    pub fn parse(token: &str) -> Result<StateVersion, VersionError> {
        if token.is_empty() || !token.bytes().all(|b| base36_digit(b).is_some()) {
            return Err(VersionError::InvalidToken(token.to_owned()));
        }
        Ok(StateVersion(token.to_owned()))
    }

    /// The token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateVersion({})", self.0)
    }
}

/// The version of a client view record.
///
/// Ordering is lexicographic on `(state_version, minor_version)`, which the
/// derived implementation provides given the field order.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CvrVersion {
    /// The replica version the CVR was last synchronized against.
    pub state_version: StateVersion,
    /// Bumped when the CVR changes without the replica advancing.
    pub minor_version: u32,
}

impl CvrVersion {
    /// The minimum version, held by a CVR that has never been written.
    pub fn min() -> CvrVersion {
        CvrVersion {
            state_version: StateVersion::min(),
            minor_version: 0,
        }
    }

    /// Returns the successor of this version at the same state version.
    pub fn bump_minor(&self) -> CvrVersion {
        CvrVersion {
            state_version: self.state_version.clone(),
            minor_version: self.minor_version + 1,
        }
    }

    /// Returns the version for `state_version`, with the minor version
    /// bumped if the state version did not advance.
    ///
    /// This is the version assigned to a CVR change driven by the pipeline:
    /// if the pipeline advanced past the CVR, the new state version alone
    /// orders the change; otherwise the minor version carries it.
    pub fn advance_to(&self, state_version: StateVersion) -> CvrVersion {
        if state_version > self.state_version {
            CvrVersion {
                state_version,
                minor_version: 0,
            }
        } else {
            self.bump_minor()
        }
    }

    /// Encodes this version as a cookie whose byte order matches version
    /// order.
    pub fn to_cookie(&self) -> String {
        if self.minor_version == 0 {
            self.state_version.0.clone()
        } else {
            format!(
                "{}{}{}",
                self.state_version.0,
                COOKIE_SEPARATOR,
                to_lexi(u64::from(self.minor_version))
            )
        }
    }

    /// Decodes a cookie produced by [`CvrVersion::to_cookie`].
    pub fn from_cookie(cookie: &str) -> Result<CvrVersion, VersionError> {
        match cookie.split_once(COOKIE_SEPARATOR) {
            None => Ok(CvrVersion {
                state_version: StateVersion::parse(cookie)
                    .map_err(|_| VersionError::InvalidCookie(cookie.to_owned()))?,
                minor_version: 0,
            }),
            Some((state, minor)) => {
                let state_version = StateVersion::parse(state)
                    .map_err(|_| VersionError::InvalidCookie(cookie.to_owned()))?;
                let minor_version = from_lexi(minor)
                    .ok()
                    .and_then(|m| u32::try_from(m).ok())
                    .filter(|m| *m > 0)
                    .ok_or_else(|| VersionError::InvalidCookie(cookie.to_owned()))?;
                Ok(CvrVersion {
                    state_version,
                    minor_version,
                })
            }
        }
    }

    /// Decodes an optional base cookie; a missing cookie is the minimum
    /// version.
    pub fn from_base_cookie(cookie: Option<&str>) -> Result<CvrVersion, VersionError> {
        match cookie {
            None => Ok(CvrVersion::min()),
            Some(c) => CvrVersion::from_cookie(c),
        }
    }
}

/// `Display` for versions is the cookie encoding; it is what shows up in
/// logs and poke ids.
impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cookie())
    }
}

impl fmt::Debug for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CvrVersion({})", self.to_cookie())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn v(state: &str, minor: u32) -> CvrVersion {
        CvrVersion {
            state_version: StateVersion::parse(state).unwrap(),
            minor_version: minor,
        }
    }

    #[test]
    fn test_lexi_round_trip() {
        for n in [0, 1, 35, 36, 1295, 1296, u64::from(u32::MAX), u64::MAX] {
            assert_eq!(from_lexi(&to_lexi(n)), Ok(n), "n={n}");
        }
        assert_eq!(to_lexi(0), "00");
        assert_eq!(to_lexi(35), "0z");
        assert_eq!(to_lexi(36), "110");
    }

    #[test]
    fn test_cookie_round_trip() {
        for version in [v("00", 0), v("1xz", 0), v("1xz", 1), v("1xz", 37), v("zz", 4000)] {
            let cookie = version.to_cookie();
            assert_eq!(CvrVersion::from_cookie(&cookie), Ok(version.clone()));
        }
        assert_eq!(CvrVersion::from_base_cookie(None), Ok(CvrVersion::min()));
    }

    #[test]
    fn test_malformed_cookies() {
        for cookie in ["", "UPPER", "1xz.", "1xz.q", "1xz.00", ".11", "1 xz"] {
            let err = CvrVersion::from_cookie(cookie).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::BadRequest, "cookie={cookie:?}");
        }
    }

    #[test]
    fn test_advance_to() {
        let base = v("1xz", 2);
        assert_eq!(base.advance_to(StateVersion::parse("1y0").unwrap()), v("1y0", 0));
        assert_eq!(base.advance_to(StateVersion::parse("1xz").unwrap()), v("1xz", 3));
    }

    proptest! {
        // Cookie byte order must agree with version order, including across
        // state versions of different lengths.
        #[test]
        fn prop_cookie_order_matches_version_order(
            a_state in "[0-9a-z]{1,6}",
            a_minor in 0u32..5000,
            b_state in "[0-9a-z]{1,6}",
            b_minor in 0u32..5000,
        ) {
            let a = v(&a_state, a_minor);
            let b = v(&b_state, b_minor);
            prop_assert_eq!(a.cmp(&b), a.to_cookie().cmp(&b.to_cookie()));
        }

        #[test]
        fn prop_lexi_order_matches_integer_order(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(a.cmp(&b), to_lexi(a).cmp(&to_lexi(b)));
        }
    }
}
