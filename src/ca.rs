//! Root CA and leaf certificate synthesis for TLS interception.
//!
//! This module owns the local trust anchor the proxy uses to terminate TLS:
//! - A root identity, either generated fresh (self-signed, multi-year) or
//!   supplied as an external PEM pair
//! - Per-host leaf certificates signed by that root, minted on demand with a
//!   fresh key pair per call
//!
//! # Subject template
//!
//! Every certificate carries the same organizational subject fields; only the
//! common name varies. The common name is always mirrored into the subject
//! alternative names as the first entry, because modern TLS stacks ignore the
//! CN and match hostnames against SANs only.
//!
//! # Example
//!
//! ```ignore
//! use lensproxy::ca::CertAuthority;
//!
//! let root = CertAuthority::generate()?;
//! let leaf = root.issue("api.example.com", 14, None)?;
//! // leaf.cert_pem / leaf.key_pem feed straight into rustls
//! ```

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

/// Common name on generated root certificates.
pub const ROOT_COMMON_NAME: &str = "LENSPROXY ROOT CA";

/// Validity of a generated root, in days.
pub const ROOT_VALIDITY_DAYS: u32 = 5 * 365;

/// Default validity for leaf certificates, in days.
pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 14;

/// Errors from certificate generation and parsing.
#[derive(Debug, Error)]
pub enum CaError {
    /// Caller passed arguments that cannot produce a valid certificate.
    #[error("invalid certificate request: {0}")]
    Validation(String),

    /// Key pair generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Signing the certificate failed.
    #[error("certificate signing failed: {0}")]
    Signing(String),

    /// External PEM material could not be parsed.
    #[error("failed to parse PEM material: {0}")]
    Parse(String),
}

/// Key algorithm used for generated roots and leaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyProfile {
    /// ECDSA over P-256 with SHA-256. Fast to mint, universally accepted.
    #[default]
    EcdsaP256,
    /// ECDSA over P-384 with SHA-384.
    EcdsaP384,
}

impl KeyProfile {
    fn algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            KeyProfile::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyProfile::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }
}

/// A root identity capable of signing leaf certificates.
///
/// Immutable once built. Generate one per cache instance, or install an
/// externally provisioned root via [`CertAuthority::from_pem`].
pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
    key_profile: KeyProfile,
}

/// A minted end-entity certificate with its private key.
///
/// Plain value type; the PEM fields are consumable by any standard TLS
/// implementation.
#[derive(Debug, Clone)]
pub struct LeafIdentity {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key (PKCS#8).
    pub key_pem: String,
    /// Subject common name.
    pub common_name: String,
    /// Subject alternative names, common name first.
    pub alt_names: Vec<String>,
    /// Start of the validity window.
    pub not_before: OffsetDateTime,
    /// End of the validity window.
    pub not_after: OffsetDateTime,
}

impl CertAuthority {
    /// Generate a fresh self-signed root with the default key profile.
    pub fn generate() -> Result<Self, CaError> {
        Self::generate_with(KeyProfile::default())
    }

    /// Generate a fresh self-signed root using the given key profile.
    ///
    /// The root carries the fixed organizational subject, CA basic
    /// constraints, and a [`ROOT_VALIDITY_DAYS`] validity window.
    pub fn generate_with(profile: KeyProfile) -> Result<Self, CaError> {
        debug!("Generating root certificate ({:?})", profile);

        let key_pair = KeyPair::generate_for(profile.algorithm())
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject_template(ROOT_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::days(i64::from(ROOT_VALIDITY_DAYS));

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Signing(e.to_string()))?;
        let cert_pem = cert.pem();

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            cert_pem,
            key_profile: profile,
        })
    }

    /// Build a root from externally provisioned PEM material.
    ///
    /// No self-signing is performed; the certificate is used as-is and the
    /// key must match it. Leaves minted by this root use the default key
    /// profile.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            cert_pem: cert_pem.to_string(),
            key_profile: KeyProfile::default(),
        })
    }

    /// The root certificate as PEM, for export into client trust stores.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Mint a leaf certificate signed by this root.
    ///
    /// See [`issue_identity`] for the full semantics.
    pub fn issue(
        &self,
        common_name: &str,
        validity_days: u32,
        alt_names: Option<&[String]>,
    ) -> Result<LeafIdentity, CaError> {
        issue_identity(Some(self), common_name, validity_days, alt_names)
    }
}

impl std::fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertAuthority")
            .field("key_profile", &self.key_profile)
            .finish_non_exhaustive()
    }
}

/// Mint a certificate, signed by `issuer` or self-signed when `None`.
///
/// A fresh key pair is generated per call. The subject is the fixed
/// organizational template with the requested common name. Alt names always
/// include the common name as the first entry: `None` becomes
/// `[common_name]`, and a list missing the common name gets it prepended.
/// Validity runs from now for exactly `validity_days` days.
///
/// # Errors
///
/// [`CaError::Validation`] for an empty common name, `validity_days == 0`,
/// or an empty alt-name entry. [`CaError::KeyGeneration`] / [`CaError::Signing`]
/// when rcgen fails; such failures abort this call only.
pub fn issue_identity(
    issuer: Option<&CertAuthority>,
    common_name: &str,
    validity_days: u32,
    alt_names: Option<&[String]>,
) -> Result<LeafIdentity, CaError> {
    if common_name.is_empty() {
        return Err(CaError::Validation("common name must not be empty".into()));
    }
    if validity_days == 0 {
        return Err(CaError::Validation(
            "validity must be at least one day".into(),
        ));
    }

    let alt_names: Vec<String> = match alt_names {
        Some(list) => {
            if list.iter().any(|n| n.is_empty()) {
                return Err(CaError::Validation("alt name must not be empty".into()));
            }
            if list.iter().any(|n| n == common_name) {
                list.to_vec()
            } else {
                let mut names = Vec::with_capacity(list.len() + 1);
                names.push(common_name.to_string());
                names.extend_from_slice(list);
                names
            }
        }
        None => vec![common_name.to_string()],
    };

    let profile = issuer.map_or_else(KeyProfile::default, |ca| ca.key_profile);
    let key_pair = KeyPair::generate_for(profile.algorithm())
        .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = subject_template(common_name);
    params.subject_alt_names = alt_names
        .iter()
        .map(|name| san_entry(name))
        .collect::<Result<Vec<_>, _>>()?;

    let now = OffsetDateTime::now_utc();
    let not_after = now + Duration::days(i64::from(validity_days));
    params.not_before = now;
    params.not_after = not_after;

    let cert = match issuer {
        Some(ca) => params.signed_by(&key_pair, &ca.issuer),
        None => params.self_signed(&key_pair),
    }
    .map_err(|e| CaError::Signing(e.to_string()))?;

    Ok(LeafIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        common_name: common_name.to_string(),
        alt_names,
        not_before: now,
        not_after,
    })
}

/// The fixed organizational subject, with the given common name.
fn subject_template(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "lensproxy");
    dn.push(DnType::OrganizationalUnitName, "lensproxy interception");
    dn
}

/// Build the right SAN variant for a name; IP literals get an iPAddress
/// entry, everything else a dNSName.
fn san_entry(name: &str) -> Result<SanType, CaError> {
    if let Ok(addr) = name.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(addr));
    }
    let dns = name
        .try_into()
        .map_err(|_| CaError::Validation(format!("invalid alt name: {}", name)))?;
    Ok(SanType::DnsName(dns))
}
