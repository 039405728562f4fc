//! Endpoint tags and the phase routing table.
//!
//! A tag describes one named TCP service carried over the SSH connection:
//! `phase:name:port` or `phase:name:hostOrNs:port`. For inbounds the optional
//! third field is a network namespace, for outbounds a host to dial.

use crate::error::{CommsError, Result};
use std::fmt;
use std::str::FromStr;

/// Literal for services carried only during attestation.
pub const ATTESTATION_PHASE: &str = "ATTESTATION_PHASE";
/// Literal for services carried only after the upgrade.
pub const KUBERNETES_PHASE: &str = "KUBERNETES_PHASE";
/// Literal for services carried in both phases.
pub const BOTH_PHASES: &str = "BOTH_PHASES";

/// Role literal exchanged in the `Phase` request during attestation.
pub const ATTESTATION_ROLE: &str = "Attestation";
/// Role literal exchanged in the `Phase` request after the upgrade.
pub const KUBERNETES_ROLE: &str = "Kubernetes";

/// The phase(s) a tagged service is active in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Attestation,
    Kubernetes,
    Both,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Attestation => ATTESTATION_PHASE,
            Phase::Kubernetes => KUBERNETES_PHASE,
            Phase::Both => BOTH_PHASES,
        }
    }

    /// Whether a service tagged with this phase is carried by a peer in `role`.
    pub fn allows(&self, role: Role) -> bool {
        match (self, role) {
            (Phase::Both, _) => true,
            (Phase::Attestation, Role::Attestation) => true,
            (Phase::Kubernetes, Role::Kubernetes) => true,
            _ => false,
        }
    }
}

impl FromStr for Phase {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ATTESTATION_PHASE => Ok(Phase::Attestation),
            KUBERNETES_PHASE => Ok(Phase::Kubernetes),
            BOTH_PHASES => Ok(Phase::Both),
            other => Err(CommsError::TagError(format!("unknown phase '{}'", other))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a peer connection. Attestation is upgraded to Kubernetes once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Attestation,
    Kubernetes,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Attestation => ATTESTATION_ROLE,
            Role::Kubernetes => KUBERNETES_ROLE,
        }
    }
}

impl FromStr for Role {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ATTESTATION_ROLE => Ok(Role::Attestation),
            KUBERNETES_ROLE => Ok(Role::Kubernetes),
            other => Err(CommsError::ProtocolError(format!("unknown role '{}'", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed endpoint descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub phase: Phase,
    pub name: String,
    /// Namespace (inbounds) or host (outbounds); `None` when omitted.
    pub host_or_ns: Option<String>,
    pub port: u16,
}

impl Tag {
    /// Parse a single tag.
    pub fn parse(tag: &str) -> Result<Self> {
        let fields: Vec<&str> = tag.split(':').collect();
        let (phase, name, host_or_ns, port) = match fields.as_slice() {
            [phase, name, port] => (*phase, *name, None, *port),
            [phase, name, host_or_ns, port] => (*phase, *name, Some(*host_or_ns), *port),
            _ => {
                return Err(CommsError::TagError(format!(
                    "'{}' must have 3 or 4 colon separated fields",
                    tag
                )))
            }
        };

        let phase: Phase = phase
            .parse()
            .map_err(|e| CommsError::TagError(format!("'{}': {}", tag, e)))?;
        if name.is_empty() {
            return Err(CommsError::TagError(format!("'{}' has an empty name", tag)));
        }
        let port: u16 = port
            .parse()
            .map_err(|e| CommsError::TagError(format!("'{}' has a bad port: {}", tag, e)))?;

        Ok(Self {
            phase,
            name: name.to_string(),
            host_or_ns: host_or_ns.map(str::to_string),
            port,
        })
    }
}

impl FromStr for Tag {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self> {
        Tag::parse(s)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host_or_ns {
            Some(host_or_ns) => write!(
                f,
                "{}:{}:{}:{}",
                self.phase, self.name, host_or_ns, self.port
            ),
            None => write!(f, "{}:{}:{}", self.phase, self.name, self.port),
        }
    }
}

/// Parse a batch of tags, skipping blank entries.
///
/// Any malformed non-blank entry fails the whole batch.
pub fn parse_tags<S: AsRef<str>>(tags: &[S]) -> Result<Vec<Tag>> {
    tags.iter()
        .map(|t| t.as_ref().trim())
        .filter(|t| !t.is_empty())
        .map(Tag::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_three_fields() {
        let tag = Tag::parse("ATTESTATION_PHASE:ABC:7010").unwrap();
        assert_eq!(tag.phase, Phase::Attestation);
        assert_eq!(tag.name, "ABC");
        assert_eq!(tag.host_or_ns, None);
        assert_eq!(tag.port, 7010);
    }

    #[test]
    fn test_parse_four_fields() {
        let tag = Tag::parse("KUBERNETES_PHASE:KATAAGENT:127.0.0.1:7131").unwrap();
        assert_eq!(tag.phase, Phase::Kubernetes);
        assert_eq!(tag.name, "KATAAGENT");
        assert_eq!(tag.host_or_ns.as_deref(), Some("127.0.0.1"));
        assert_eq!(tag.port, 7131);
    }

    #[test]
    fn test_round_trip() {
        for s in [
            "BOTH_PHASES:KBS:7000",
            "KUBERNETES_PHASE:KUBEAPI:podns:16443",
            "ATTESTATION_PHASE:ABC:127.0.0.1:0",
            "KUBERNETES_PHASE:DNS:65535",
        ] {
            let tag = Tag::parse(s).unwrap();
            assert_eq!(tag.to_string(), s);
            assert_eq!(Tag::parse(&tag.to_string()).unwrap(), tag);
        }
    }

    #[test]
    fn test_malformed_tags() {
        for s in [
            "KUBERNETES_PHASE::7010",
            "BAD_PHASE:X:1",
            "ATTESTATION_PHASE:X:70000",
            "ATTESTATION_PHASE:X:-1",
            "ATTESTATION_PHASE:X:port",
            "X",
            "X:Y",
            "A:B:C:D:E",
        ] {
            let err = Tag::parse(s).unwrap_err();
            assert!(matches!(err, CommsError::TagError(_)), "{s} -> {err}");
        }
    }

    #[test]
    fn test_parse_tags_skips_blank() {
        let tags = parse_tags(&["", "  ", "BOTH_PHASES:KBS:7000", "\t"]).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "KBS");
    }

    #[test]
    fn test_parse_tags_fails_batch() {
        let err = parse_tags(&["BOTH_PHASES:KBS:7000", "X:Y"]);
        assert!(err.is_err());
    }

    #[test]
    fn test_phase_allows() {
        assert!(Phase::Both.allows(Role::Attestation));
        assert!(Phase::Both.allows(Role::Kubernetes));
        assert!(Phase::Attestation.allows(Role::Attestation));
        assert!(!Phase::Attestation.allows(Role::Kubernetes));
        assert!(Phase::Kubernetes.allows(Role::Kubernetes));
        assert!(!Phase::Kubernetes.allows(Role::Attestation));
    }

    #[test]
    fn test_role_literals() {
        assert_eq!(Role::Attestation.to_string(), "Attestation");
        assert_eq!("Kubernetes".parse::<Role>().unwrap(), Role::Kubernetes);
        assert!("kubernetes".parse::<Role>().is_err());
    }
}
