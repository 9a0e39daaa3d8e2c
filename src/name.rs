// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ARI Contributors

//! Naming and addressing
//!
//! RINA application names are four-tuples (process name, process
//! instance, entity name, entity instance). The shims translate them
//! to and from the two wire address abstractions: the generic protocol
//! address (GPA) carried in resolver packets, and the generic hardware
//! address (GHA), a 48-bit MAC address.

use crate::error::ShimError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The source name used for remotely-initiated flows whose peer
/// application is not yet known.
pub const UNKNOWN_APP: &str = "Unknown app";

/// A RINA application (or DIF) name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppName {
    pub process_name: String,
    pub process_instance: String,
    pub entity_name: String,
    pub entity_instance: String,
}

impl AppName {
    pub fn new(
        process_name: &str,
        process_instance: &str,
        entity_name: &str,
        entity_instance: &str,
    ) -> Self {
        Self {
            process_name: process_name.to_string(),
            process_instance: process_instance.to_string(),
            entity_name: entity_name.to_string(),
            entity_instance: entity_instance.to_string(),
        }
    }

    /// Builds a name from the process-name component alone.
    pub fn from_process_name(process_name: &str) -> Self {
        Self::new(process_name, "", "", "")
    }

    /// The placeholder source name for flows whose remote application
    /// cannot be resolved yet. The instance component carries extra
    /// context (usually the assigned port-id).
    pub fn unknown_app(instance: &str) -> Self {
        Self::new(UNKNOWN_APP, instance, "", "")
    }

    /// Parses the `/`-separated wire form produced by [`AppName::to_wire`].
    /// Missing components default to the empty string.
    pub fn from_wire(s: &str) -> Self {
        let mut parts = s.splitn(4, '/');
        Self {
            process_name: parts.next().unwrap_or("").to_string(),
            process_instance: parts.next().unwrap_or("").to_string(),
            entity_name: parts.next().unwrap_or("").to_string(),
            entity_instance: parts.next().unwrap_or("").to_string(),
        }
    }

    /// Serializes the four components joined with `/`.
    pub fn to_wire(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.process_name, self.process_instance, self.entity_name, self.entity_instance
        )
    }

    /// Compares only the process-name and entity-name components, the
    /// comparison used by the TCP/UDP directory and expected
    /// registrations.
    pub fn matches_apn_aen(&self, other: &AppName) -> bool {
        self.process_name == other.process_name && self.entity_name == other.entity_name
    }

    pub fn is_ok(&self) -> bool {
        !self.process_name.is_empty()
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// A generic protocol address: the opaque byte string a resolver query
/// is keyed on. Shims derive it from the wire form of an [`AppName`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gpa(Vec<u8>);

impl Gpa {
    pub fn new(address: Vec<u8>) -> Self {
        Self(address)
    }

    pub fn from_name(name: &AppName) -> Self {
        Self(name.to_wire().into_bytes())
    }

    pub fn is_ok(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pads the address with NUL filler up to `len`, the normalization
    /// applied before embedding a GPA in a resolver packet.
    pub fn grown_to(&self, len: usize) -> Vec<u8> {
        let mut out = self.0.clone();
        out.resize(len.max(out.len()), 0u8);
        out
    }

    /// Undoes [`Gpa::grown_to`]: strips trailing NUL filler.
    pub fn shrunk(bytes: &[u8]) -> Self {
        let end = bytes
            .iter()
            .rposition(|&b| b != 0u8)
            .map(|p| p + 1)
            .unwrap_or(0);
        Self(bytes[..end].to_vec())
    }

    /// Interprets the address bytes as an application name, the reverse
    /// of [`Gpa::from_name`].
    pub fn to_name(&self) -> Option<AppName> {
        let s = std::str::from_utf8(&self.0).ok()?;
        let name = AppName::from_wire(s);
        name.is_ok().then_some(name)
    }
}

impl fmt::Display for Gpa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A generic hardware address: an IEEE 802.3 MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gha([u8; 6]);

impl Gha {
    pub const BROADCAST: Gha = Gha([0xff; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ShimError> {
        let octets: [u8; 6] = bytes
            .try_into()
            .map_err(|_| ShimError::BadArgument(format!("MAC length {}", bytes.len())))?;
        Ok(Self(octets))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl FromStr for Gha {
    type Err = ShimError;

    /// Parses the standard colon-hex notation, e.g. `02:ab:cd:00:11:22`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(ShimError::BadArgument(format!("invalid MAC '{s}'")));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| ShimError::BadArgument(format!("invalid MAC '{s}'")))?;
            count += 1;
        }
        if count != 6 {
            return Err(ShimError::BadArgument(format!("invalid MAC '{s}'")));
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for Gha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_wire_round_trip() {
        let name = AppName::new("server", "1", "echo", "2");
        assert_eq!(name.to_wire(), "server/1/echo/2");
        assert_eq!(AppName::from_wire(&name.to_wire()), name);
    }

    #[test]
    fn test_name_from_wire_partial() {
        let name = AppName::from_wire("server");
        assert_eq!(name.process_name, "server");
        assert_eq!(name.process_instance, "");
        assert!(name.is_ok());
    }

    #[test]
    fn test_unknown_app_name() {
        let name = AppName::unknown_app("42");
        assert_eq!(name.process_name, "Unknown app");
        assert_eq!(name.process_instance, "42");
    }

    #[test]
    fn test_gpa_grow_shrink() {
        let gpa = Gpa::from_name(&AppName::from_process_name("a"));
        let grown = gpa.grown_to(16);
        assert_eq!(grown.len(), 16);
        assert_eq!(Gpa::shrunk(&grown), gpa);
    }

    #[test]
    fn test_gpa_to_name() {
        let name = AppName::new("app", "7", "", "");
        let gpa = Gpa::from_name(&name);
        assert_eq!(gpa.to_name(), Some(name));
    }

    #[test]
    fn test_gha_parse_and_display() {
        let gha: Gha = "02:ab:cd:00:11:22".parse().unwrap();
        assert_eq!(gha.to_string(), "02:ab:cd:00:11:22");
        assert!("02:ab:cd:00:11".parse::<Gha>().is_err());
        assert!("02:ab:cd:00:11:zz".parse::<Gha>().is_err());
        assert!("02:ab:cd:00:11:22:33".parse::<Gha>().is_err());
    }
}
