//! Artifacts: opaque bytes with an optional typed decomposition.

/// Typed decomposition of a PKI artifact. PEM strings carry their own
/// trailing newlines in whatever form the issuer returned them; the
/// sink layer normalizes separators on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertParts {
    pub certificate: String,
    pub private_key: String,
    pub ca: Option<String>,
    pub ca_chain: Vec<String>,
}

/// An opaque byte buffer, optionally with a typed decomposition the
/// type-aware sinks destructure on write. The engine diffs on `bytes`
/// only.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub parts: Option<CertParts>,
}

impl Artifact {
    pub fn opaque(bytes: Vec<u8>) -> Self {
        Self { bytes, parts: None }
    }

    /// Canonical bytes for diffing are the concatenated constituents,
    /// so any change in any part changes the digest.
    pub fn certificate(parts: CertParts) -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(parts.certificate.as_bytes());
        bytes.extend_from_slice(parts.private_key.as_bytes());
        if let Some(ca) = &parts.ca {
            bytes.extend_from_slice(ca.as_bytes());
        }
        for link in &parts.ca_chain {
            bytes.extend_from_slice(link.as_bytes());
        }
        Self {
            bytes,
            parts: Some(parts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_certificate_digest_bytes_cover_all_parts() {
        let a = Artifact::certificate(CertParts {
            certificate: "CERT".into(),
            private_key: "KEY".into(),
            ca: Some("CA".into()),
            ca_chain: vec!["C1".into()],
        });
        let b = Artifact::certificate(CertParts {
            certificate: "CERT".into(),
            private_key: "KEY".into(),
            ca: Some("CA".into()),
            ca_chain: vec!["C2".into()],
        });
        assert_ne!(a.bytes, b.bytes);
    }
}
