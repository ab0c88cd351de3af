use crate::{Error, Result};
use hudsucker::certificate_authority::RcgenAuthority;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyUsagePurpose};
use rustls::crypto::aws_lc_rs::default_provider;
use std::fs;
use std::path::{Path, PathBuf};

/// Number of impersonated leaf certificates hudsucker keeps cached
const LEAF_CACHE_SIZE: u64 = 1_000;

/// The CA that signs the certificates presented to intercepted clients
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self> {
        tracing::info!("Generating new CA certificate for skua");

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Skua Interception Proxy CA");
        dn.push(DnType::OrganizationName, "Skua");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| Error::Tls(format!("Failed to generate key pair: {}", e)))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Tls(format!("Failed to generate CA certificate: {}", e)))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    pub fn load_from_pem(cert_path: &Path, key_path: &Path) -> Result<Self> {
        tracing::debug!("Loading CA certificate from {:?}", cert_path);
        let ca = Self {
            cert_pem: fs::read_to_string(cert_path)?,
            key_pem: fs::read_to_string(key_path)?,
        };
        // Unparseable PEM is rejected here
        ca.authority()?;
        Ok(ca)
    }

    pub fn save_to_pem(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        tracing::info!("Saving CA certificate to {:?}", cert_path);
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(cert_path, &self.cert_pem)?;
        fs::write(key_path, &self.key_pem)?;
        Ok(())
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// `~/.skua/ca.crt` and `~/.skua/ca.key`
    pub fn default_paths() -> Result<(PathBuf, PathBuf)> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
        Ok(Self::paths_in(&home.join(".skua")))
    }

    fn paths_in(dir: &Path) -> (PathBuf, PathBuf) {
        (dir.join("ca.crt"), dir.join("ca.key"))
    }

    /// Load the CA from `~/.skua/`, generating and saving one on first use.
    ///
    /// The flag is `true` when a new CA was generated; it has to be trusted by
    /// clients before HTTPS can be intercepted.
    pub fn load_or_generate() -> Result<(Self, bool)> {
        let (cert_path, key_path) = Self::default_paths()?;
        Self::load_or_generate_at(&cert_path, &key_path)
    }

    pub fn load_or_generate_at(cert_path: &Path, key_path: &Path) -> Result<(Self, bool)> {
        if cert_path.exists() && key_path.exists() {
            tracing::info!("Loading existing CA certificate");
            return Ok((Self::load_from_pem(cert_path, key_path)?, false));
        }

        tracing::info!("No existing CA certificate found, generating new one");
        let ca = Self::generate()?;
        ca.save_to_pem(cert_path, key_path)?;
        Ok((ca, true))
    }

    /// The hudsucker signer for impersonated leaf certificates
    pub(crate) fn authority(&self) -> Result<RcgenAuthority> {
        let key_pair = rcgen::KeyPair::from_pem(&self.key_pem)
            .map_err(|e| Error::Tls(format!("Failed to parse private key: {}", e)))?;
        let issuer = rcgen::Issuer::from_ca_cert_pem(&self.cert_pem, key_pair)
            .map_err(|e| Error::Tls(format!("Failed to parse CA certificate: {}", e)))?;
        Ok(RcgenAuthority::new(issuer, LEAF_CACHE_SIZE, default_provider()))
    }
}
