use eyre::WrapErr as _;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use rsa::signature::{SignatureEncoding as _, Signer as _};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Signing key for the ACME account.
///
/// ES256 over P-256 is what this library generates by default; RSA keys are
/// accepted on import since many existing accounts still use them.
#[derive(Clone, Debug)]
pub(crate) enum KeyKind {
    P256(p256::ecdsa::SigningKey),
    Rsa(rsa::pkcs1v15::SigningKey<Sha256>),
}

#[derive(Clone, Debug)]
pub(crate) struct AcmeKey {
    kind: KeyKind,

    /// Set once we contacted the ACME API to figure out the key ID.
    key_id: Option<String>,
}

impl AcmeKey {
    pub(crate) fn new() -> AcmeKey {
        Self::from_key(KeyKind::P256(crate::create_p256_key()))
    }

    pub(crate) fn from_pem(pem: &str) -> eyre::Result<AcmeKey> {
        let kind = key_kind_from_pem(pem).wrap_err("Failed to read PEM")?;
        Ok(Self::from_key(kind))
    }

    fn from_key(kind: KeyKind) -> AcmeKey {
        AcmeKey { kind, key_id: None }
    }

    pub(crate) fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        let pem = match &self.kind {
            KeyKind::P256(key) => key.to_pkcs8_pem(pkcs8::LineEnding::LF),
            KeyKind::Rsa(key) => key.to_pkcs8_pem(pkcs8::LineEnding::LF),
        };
        pem.wrap_err("private_key_to_pem")
    }

    pub(crate) fn kind(&self) -> &KeyKind {
        &self.kind
    }

    /// JWS algorithm matching the key type.
    pub(crate) fn alg(&self) -> &'static str {
        match self.kind {
            KeyKind::P256(_) => "ES256",
            KeyKind::Rsa(_) => "RS256",
        }
    }

    /// Raw JWS signature over `msg` (r||s for EC, PKCS#1 v1.5 for RSA).
    pub(crate) fn sign(&self, msg: &[u8]) -> eyre::Result<Vec<u8>> {
        match &self.kind {
            KeyKind::P256(key) => {
                let signature: p256::ecdsa::Signature =
                    key.try_sign(msg).wrap_err("ES256 signing")?;
                Ok(signature.to_bytes().to_vec())
            }
            KeyKind::Rsa(key) => {
                let signature = key.try_sign(msg).wrap_err("RS256 signing")?;
                Ok(signature.to_vec())
            }
        }
    }

    pub(crate) fn key_id(&self) -> &str {
        self.key_id.as_deref().unwrap_or_default()
    }

    pub(crate) fn has_key_id(&self) -> bool {
        self.key_id.is_some()
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid)
    }
}

pub(crate) fn key_kind_from_pem(pem: &str) -> eyre::Result<KeyKind> {
    if let Ok(key) = ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(pem) {
        return Ok(KeyKind::P256(key));
    }

    let key = rsa::RsaPrivateKey::from_pkcs8_pem(pem).or_else(|_| {
        use rsa::pkcs1::DecodeRsaPrivateKey as _;
        rsa::RsaPrivateKey::from_pkcs1_pem(pem)
    })?;

    Ok(KeyKind::Rsa(rsa::pkcs1v15::SigningKey::new(key)))
}
