//! See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use eyre::WrapErr as _;
use hmac::{Hmac, Mac as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    acc::{AcmeKey, KeyKind},
    util::base64url,
};

/// JWS Protected Header scheme as defined in [RFC 8555 §6.2].
///
/// > For newAccount requests, and for revokeCert requests authenticated by a certificate key,
/// there MUST be a "jwk" field. This field MUST contain the public key corresponding to the
/// private key used to sign the JWS.
/// >
/// > For all other requests, the request is signed using an existing account, and there MUST be a
/// "kid" field. This field MUST contain the account URL received by POSTing to the newAccount
/// resource.
///
/// [RFC 8555 §6.2]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.2
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    /// Algorithm. `ES256` for EC account keys, `RS256` for RSA ones.
    ///
    /// This field MUST NOT contain "none" or a Message Authentication Code (MAC) algorithm (e.g.
    /// one in which the algorithm registry description mentions MAC/HMAC).
    alg: String,

    /// A unique value that enables the verifier of a JWS to recognize when replay has occurred.
    ///
    /// As defined in [RFC 8555 §6.5].
    ///
    /// [RFC 8555 §6.5]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.5
    nonce: String,

    /// Defined in [RFC 8555 §6.4].
    ///
    /// > The "url" header parameter specifies the URL (RFC 3986) to which this JWS object is
    /// directed. The "url" header parameter MUST be carried in the protected header of the JWS.
    ///
    /// [RFC 8555 §6.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-6.4
    url: String,

    /// JSON Web Key.
    ///
    /// Mutually exclusive with `kid` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    /// Key ID.
    ///
    /// Mutually exclusive with `jwk` field.
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String, alg: &str) -> Self {
        JwsProtectedHeader {
            alg: alg.to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String, alg: &str) -> Self {
        JwsProtectedHeader {
            alg: alg.to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

/// Public account key in JWK form.
///
/// Constructed fresh from the signing key; never carries `kid`, `key_ops` or
/// `ext` members, which RFC 7638 hashing must not see.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum Jwk {
    Ec {
        alg: String,
        crv: String,
        kty: String,
        #[serde(rename = "use")]
        _use: String,
        x: String,
        y: String,
    },
    Rsa {
        alg: String,
        e: String,
        kty: String,
        n: String,
        #[serde(rename = "use")]
        _use: String,
    },
}

impl TryFrom<&AcmeKey> for Jwk {
    type Error = eyre::Error;

    fn try_from(a: &AcmeKey) -> eyre::Result<Self> {
        match a.kind() {
            KeyKind::P256(key) => {
                let point = key.verifying_key().to_encoded_point(false);

                let x = point.x().ok_or_else(|| eyre::eyre!("identity point"))?;
                let y = point.y().ok_or_else(|| eyre::eyre!("identity point"))?;

                Ok(Jwk::Ec {
                    alg: "ES256".to_owned(),
                    kty: "EC".to_owned(),
                    crv: "P-256".to_owned(),
                    _use: "sig".to_owned(),
                    x: BASE64_URL_SAFE_NO_PAD.encode(x),
                    y: BASE64_URL_SAFE_NO_PAD.encode(y),
                })
            }
            KeyKind::Rsa(key) => {
                use rsa::signature::Keypair as _;
                use rsa::traits::PublicKeyParts as _;

                let public = key.verifying_key();
                let public = public.as_ref();

                Ok(Jwk::Rsa {
                    alg: "RS256".to_owned(),
                    kty: "RSA".to_owned(),
                    _use: "sig".to_owned(),
                    n: BASE64_URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
                    e: BASE64_URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
                })
            }
        }
    }
}

/// Subset of the JWK hashed for the RFC 7638 thumbprint.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) enum JwkThumb {
    Ec {
        crv: String,
        kty: String,
        x: String,
        y: String,
    },
    Rsa {
        e: String,
        kty: String,
        n: String,
    },
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        match a {
            Jwk::Ec { crv, kty, x, y, .. } => JwkThumb::Ec {
                crv: crv.clone(),
                kty: kty.clone(),
                x: x.clone(),
                y: y.clone(),
            },
            Jwk::Rsa { e, kty, n, .. } => JwkThumb::Rsa {
                e: e.clone(),
                kty: kty.clone(),
                n: n.clone(),
            },
        }
    }
}

/// base64url(SHA-256(canonical JWK)) per [RFC 7638].
///
/// [RFC 7638]: https://datatracker.ietf.org/doc/html/rfc7638
pub(crate) fn jwk_thumbprint(jwk: &Jwk) -> eyre::Result<String> {
    let jwk_thumb = JwkThumb::from(jwk);
    let jwk_json = serde_json::to_string(&jwk_thumb)?;
    Ok(base64url(&Sha256::digest(jwk_json)))
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

impl FlattenedJsonJws {
    pub(crate) fn new(protected: String, payload: String, signature: String) -> Self {
        FlattenedJsonJws {
            protected,
            payload,
            signature,
        }
    }
}

/// Pre-existing CA account to bind the new ACME account to.
///
/// See [RFC 8555 §7.3.4].
///
/// [RFC 8555 §7.3.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-7.3.4
#[derive(Debug, Clone)]
pub struct ExternalAccount {
    /// Key identifier handed out by the CA.
    pub id: String,

    /// base64url-encoded MAC key handed out by the CA.
    pub secret: String,

    /// MAC algorithm; `HS256` when unset, which is the only one supported.
    pub alg: Option<String>,
}

#[derive(Serialize)]
struct EabProtectedHeader<'a> {
    alg: &'a str,
    kid: &'a str,
    url: &'a str,
}

/// Builds the inner `externalAccountBinding` JWS: an HMAC over the account's
/// public JWK, keyed with the secret the CA handed out.
pub(crate) fn external_account_binding(
    eab: &ExternalAccount,
    account_jwk: &Jwk,
    new_account_url: &str,
) -> eyre::Result<serde_json::Value> {
    let alg = eab.alg.as_deref().unwrap_or("HS256");
    if alg != "HS256" {
        return Err(eyre::eyre!(
            "unsupported external account binding alg: {alg}"
        ));
    }

    let protected = EabProtectedHeader {
        alg,
        kid: &eab.id,
        url: new_account_url,
    };
    let protected = base64url(&serde_json::to_string(&protected)?);
    let payload = base64url(&serde_json::to_string(account_jwk)?);

    let secret = BASE64_URL_SAFE_NO_PAD
        .decode(&eab.secret)
        .wrap_err("external account secret is not base64url")?;

    let mut mac =
        Hmac::<Sha256>::new_from_slice(&secret).map_err(|_| eyre::eyre!("empty EAB secret"))?;
    mac.update(format!("{protected}.{payload}").as_bytes());
    let signature = base64url(&mac.finalize().into_bytes());

    Ok(serde_json::to_value(FlattenedJsonJws::new(
        protected, payload, signature,
    ))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    // https://datatracker.ietf.org/doc/html/rfc7638#section-3.1
    #[test]
    fn test_rsa_thumbprint_vector() {
        let jwk = Jwk::Rsa {
            alg: "RS256".to_owned(),
            kty: "RSA".to_owned(),
            _use: "sig".to_owned(),
            n: "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw".to_owned(),
            e: "AQAB".to_owned(),
        };

        assert_eq!(
            jwk_thumbprint(&jwk).unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn test_external_account_binding_is_a_mac_over_the_jwk() {
        let key = AcmeKey::new();
        let jwk = Jwk::try_from(&key).unwrap();

        let eab = ExternalAccount {
            id: "eab-kid-1".to_owned(),
            secret: base64url(b"super-secret-mac-key"),
            alg: None,
        };

        let binding =
            external_account_binding(&eab, &jwk, "https://example.com/acme/new-acct").unwrap();

        let protected = BASE64_URL_SAFE_NO_PAD
            .decode(binding["protected"].as_str().unwrap())
            .unwrap();
        let protected: serde_json::Value = serde_json::from_slice(&protected).unwrap();
        assert_eq!(protected["alg"], "HS256");
        assert_eq!(protected["kid"], "eab-kid-1");
        assert_eq!(protected["url"], "https://example.com/acme/new-acct");

        let payload = BASE64_URL_SAFE_NO_PAD
            .decode(binding["payload"].as_str().unwrap())
            .unwrap();
        assert_eq!(payload, serde_json::to_vec(&jwk).unwrap());

        // the signature verifies under the shared secret
        let mut mac = Hmac::<Sha256>::new_from_slice(b"super-secret-mac-key").unwrap();
        mac.update(
            format!(
                "{}.{}",
                binding["protected"].as_str().unwrap(),
                binding["payload"].as_str().unwrap()
            )
            .as_bytes(),
        );
        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(binding["signature"].as_str().unwrap())
            .unwrap();
        mac.verify_slice(&signature).unwrap();
    }

    #[test]
    fn test_external_account_binding_rejects_foreign_alg() {
        let key = AcmeKey::new();
        let jwk = Jwk::try_from(&key).unwrap();

        let eab = ExternalAccount {
            id: "eab-kid-1".to_owned(),
            secret: base64url(b"super-secret-mac-key"),
            alg: Some("HS512".to_owned()),
        };

        assert!(external_account_binding(&eab, &jwk, "https://example.com/acme/new-acct").is_err());
    }

    #[test]
    fn test_thumb_subset_is_lexical() {
        let jwk = Jwk::Ec {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: "x".to_owned(),
            y: "y".to_owned(),
        };

        let json = serde_json::to_string(&JwkThumb::from(&jwk)).unwrap();
        assert_eq!(json, r#"{"crv":"P-256","kty":"EC","x":"x","y":"y"}"#);
    }
}
