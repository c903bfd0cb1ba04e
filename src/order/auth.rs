use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use sha2::{Digest as _, Sha256};

use crate::{
    acc::{AccountInner, AcmeKey},
    api,
    error::AcmeError,
    jws::{jwk_thumbprint, Jwk},
    util::{base64url, read_json},
};

/// Challenge types this engine can fulfill.
///
/// The ACME API offers more (`tls-alpn-01`, the retired `tls-sni-01`); they
/// are simply never chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    /// A token file served under `/.well-known/acme-challenge/` over plain HTTP.
    ///
    /// See [RFC 8555 §8.3].
    ///
    /// [RFC 8555 §8.3]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.3
    Http01,

    /// A TXT record under `_acme-challenge.<domain>`.
    ///
    /// The only type the API accepts for wildcard names.
    ///
    /// See [RFC 8555 §8.4].
    ///
    /// [RFC 8555 §8.4]: https://datatracker.ietf.org/doc/html/rfc8555#section-8.4
    Dns01,
}

impl ChallengeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
        }
    }

    pub(crate) fn from_wire(s: &str) -> Option<Self> {
        match s {
            "http-01" => Some(ChallengeType::Http01),
            "dns-01" => Some(ChallengeType::Dns01),
            _ => None,
        }
    }

    /// Wildcard identifiers can only be proven over DNS.
    pub(crate) fn usable_for_wildcard(self) -> bool {
        matches!(self, ChallengeType::Dns01)
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authorization fused with the chosen challenge and the account key.
///
/// Carries everything a [`Provisioner`] needs to install the challenge
/// response, for either type. Built per authorization and dropped once the
/// challenge reaches a terminal state; the same value is handed to
/// [`Provisioner::remove_challenge`] for cleanup.
#[derive(Debug, Clone)]
pub struct ChallengeAuth {
    /// The identifier under authorization.
    pub identifier: api::Identifier,

    /// Bare domain name (no `*.`), as the authorization carries it.
    pub hostname: String,

    /// Domain as ordered: `hostname` with the leading `*.` restored for
    /// wildcard authorizations.
    pub altname: String,

    pub wildcard: bool,

    pub challenge_type: ChallengeType,

    /// Challenge URL at the ACME API (accept/poll endpoint).
    pub url: String,

    pub token: String,

    /// RFC 7638 thumbprint of the account public key.
    pub thumbprint: String,

    /// `token + "." + thumbprint`; the body an http-01 responder serves.
    pub key_authorization: String,

    /// Where the http-01 response must be reachable.
    pub challenge_url: String,

    /// TXT record name for dns-01 (`_acme-challenge.<hostname>`, or a
    /// randomized label during the self-test so failed rehearsals don't
    /// poison negative caches in recursive resolvers).
    pub dns_host: String,

    /// base64url(SHA-256(key_authorization)); the dns-01 TXT record value.
    pub dns_authorization: String,

    /// True while rehearsing via the self-test; no server interaction.
    pub dry_run: bool,
}

/// Installs and removes challenge responses.
///
/// The implementation owns the web root or the DNS zone: it writes the token
/// file an http-01 validation fetches, or publishes the TXT record a dns-01
/// validation queries.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn set_challenge(&self, auth: &ChallengeAuth) -> eyre::Result<()>;

    /// Cleanup after a successful validation. Failures are logged and
    /// swallowed by the driver.
    async fn remove_challenge(&self, auth: &ChallengeAuth) -> eyre::Result<()>;
}

/// Random label for self-test DNS records.
pub(crate) fn dry_run_label() -> String {
    format!("greenlock-dryrun-{:04x}", rand::random::<u16>())
}

/// Derive the client-side [`ChallengeAuth`] from an authorization and the
/// challenge chosen from it.
pub(crate) fn challenge_to_auth(
    acme_key: &AcmeKey,
    authz: &api::Authorization,
    challenge: &api::Challenge,
    challenge_type: ChallengeType,
    dry_run: bool,
) -> eyre::Result<ChallengeAuth> {
    let jwk = Jwk::try_from(acme_key)?;
    let thumbprint = jwk_thumbprint(&jwk)?;

    let hostname = authz.identifier.value.clone();
    let wildcard = authz.is_wildcard();
    let altname = if wildcard {
        format!("*.{hostname}")
    } else {
        hostname.clone()
    };

    let key_authorization = format!("{}.{}", challenge.token, thumbprint);
    let dns_authorization = base64url(&Sha256::digest(&key_authorization));

    let dns_host = if dry_run {
        format!("{}.{hostname}", dry_run_label())
    } else {
        format!("_acme-challenge.{hostname}")
    };

    Ok(ChallengeAuth {
        identifier: authz.identifier.clone(),
        challenge_url: format!(
            "http://{hostname}/.well-known/acme-challenge/{}",
            challenge.token
        ),
        hostname,
        altname,
        wildcard,
        challenge_type,
        url: challenge.url.clone(),
        token: challenge.token.clone(),
        thumbprint,
        key_authorization,
        dns_host,
        dns_authorization,
        dry_run,
    })
}

/// Pick a challenge from `authz` following the caller's preference order.
///
/// Wildcard authorizations only ever match dns-01; unknown server-side types
/// never match.
pub(crate) fn choose_challenge<'a>(
    authz: &'a api::Authorization,
    types: &[ChallengeType],
) -> Option<(&'a api::Challenge, ChallengeType)> {
    types
        .iter()
        .copied()
        .filter(|ct| !authz.is_wildcard() || ct.usable_for_wildcard())
        .find_map(|ct| authz.challenge_of_type(ct.as_str()).map(|c| (c, ct)))
}

/// Polling knobs for [`accept_and_poll`].
#[derive(Debug, Clone)]
pub(crate) struct PollTuning {
    pub retry_interval: Duration,
    pub retry_poll: usize,
    pub retry_pending: usize,
    pub deauth_wait: Duration,
}

/// Ask the server to validate a published challenge, then poll it to a
/// terminal state.
///
/// The accept POST (`{}`) always happens before the first poll. A challenge
/// that keeps reporting `pending` is re-accepted; after `retry_pending`
/// rounds it is deactivated, given `deauth_wait` to settle, and accepted
/// once more. `retry_poll` polls is the hard ceiling.
pub(crate) async fn accept_and_poll(
    inner: &Arc<AccountInner>,
    auth: &ChallengeAuth,
    tuning: &PollTuning,
) -> eyre::Result<()> {
    log::debug!("Accept challenge: {}", auth.url);
    inner.transport.call_kid(&auth.url, &api::EmptyObject).await?;

    tokio::time::sleep(tuning.retry_interval).await;

    let mut pending_count = 0;

    for _ in 0..tuning.retry_poll {
        let res = inner.transport.call_kid(&auth.url, &api::EmptyString).await?;
        let body: serde_json::Value = read_json(res).await?;
        let raw_status = body
            .get("status")
            .and_then(|s| s.as_str())
            .map(str::to_owned);
        let challenge: api::Challenge = serde_json::from_value(body)?;

        match challenge.status {
            None => return Err(AcmeError::ChallengeStateMissing.into()),

            Some(api::ChallengeStatus::Valid) => {
                log::debug!("Challenge valid: {}", auth.altname);
                return Ok(());
            }

            Some(api::ChallengeStatus::Invalid) => {
                let problem = challenge.error.unwrap_or_else(|| api::Problem {
                    _type: "urn:ietf:params:acme:error:unknown".into(),
                    detail: Some("challenge invalid and no error reported".into()),
                    ..Default::default()
                });
                return Err(AcmeError::ChallengeInvalid(problem).into());
            }

            Some(api::ChallengeStatus::Processing) => {
                tokio::time::sleep(tuning.retry_interval).await;
            }

            Some(api::ChallengeStatus::Pending) => {
                pending_count += 1;

                if pending_count < tuning.retry_pending {
                    tokio::time::sleep(tuning.retry_interval).await;
                } else {
                    // The server never picked up the accept. Deactivate the
                    // stuck attempt, give it time to settle, start over.
                    log::debug!("Deactivate stuck challenge: {}", auth.url);
                    inner.transport.call_kid(&auth.url, &api::Deactivate).await?;
                    tokio::time::sleep(tuning.deauth_wait).await;
                    pending_count = 0;
                }

                log::debug!("Re-accept challenge: {}", auth.url);
                inner.transport.call_kid(&auth.url, &api::EmptyObject).await?;
            }

            Some(api::ChallengeStatus::Unknown) => {
                return Err(AcmeError::ChallengeStateUnknown {
                    status: raw_status.unwrap_or_default(),
                }
                .into());
            }
        }
    }

    Err(AcmeError::ChallengePollExhausted {
        polls: tuning.retry_poll,
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_challenge(_type: &str, token: &str) -> api::Challenge {
        api::Challenge {
            _type: _type.to_owned(),
            url: format!("https://example.com/acme/challenge/{token}"),
            status: Some(api::ChallengeStatus::Pending),
            validated: None,
            error: None,
            token: token.to_owned(),
        }
    }

    fn authz(value: &str, wildcard: bool, types: &[&str]) -> api::Authorization {
        api::Authorization {
            identifier: api::Identifier::dns(value),
            status: api::AuthorizationStatus::Pending,
            expires: None,
            challenges: types
                .iter()
                .enumerate()
                .map(|(i, t)| pending_challenge(t, &format!("token-{i}")))
                .collect(),
            wildcard: wildcard.then_some(true),
        }
    }

    #[test]
    fn test_key_authorization_law() {
        let key = AcmeKey::new();
        let authz = authz("example.org", false, &["http-01"]);
        let challenge = &authz.challenges[0];

        let auth =
            challenge_to_auth(&key, &authz, challenge, ChallengeType::Http01, false).unwrap();

        let jwk = Jwk::try_from(&key).unwrap();
        let thumbprint = jwk_thumbprint(&jwk).unwrap();

        assert_eq!(
            auth.key_authorization,
            format!("{}.{thumbprint}", challenge.token)
        );
        assert_eq!(
            auth.dns_authorization,
            base64url(&Sha256::digest(&auth.key_authorization))
        );
    }

    #[test]
    fn test_auth_derives_install_paths() {
        let key = AcmeKey::new();
        let authz = authz("example.org", false, &["http-01"]);

        let auth = challenge_to_auth(
            &key,
            &authz,
            &authz.challenges[0],
            ChallengeType::Http01,
            false,
        )
        .unwrap();

        assert_eq!(
            auth.challenge_url,
            "http://example.org/.well-known/acme-challenge/token-0"
        );
        assert_eq!(auth.dns_host, "_acme-challenge.example.org");
        assert_eq!(auth.altname, "example.org");
    }

    #[test]
    fn test_wildcard_auth_restores_star_and_keeps_dns_host_bare() {
        let key = AcmeKey::new();
        let authz = authz("example.org", true, &["dns-01"]);

        let auth = challenge_to_auth(
            &key,
            &authz,
            &authz.challenges[0],
            ChallengeType::Dns01,
            false,
        )
        .unwrap();

        assert_eq!(auth.altname, "*.example.org");
        assert_eq!(auth.hostname, "example.org");
        assert_eq!(auth.dns_host, "_acme-challenge.example.org");
    }

    #[test]
    fn test_dry_run_randomizes_dns_label() {
        let key = AcmeKey::new();
        let authz = authz("example.org", false, &["dns-01"]);

        let auth = challenge_to_auth(
            &key,
            &authz,
            &authz.challenges[0],
            ChallengeType::Dns01,
            true,
        )
        .unwrap();

        assert!(auth.dns_host.starts_with("greenlock-dryrun-"));
        assert!(auth.dns_host.ends_with(".example.org"));
        assert!(!auth.dns_host.contains("_acme-challenge"));
    }

    #[test]
    fn test_chooser_follows_preference_order() {
        let authz = authz("example.org", false, &["http-01", "dns-01"]);

        let (_, chosen) =
            choose_challenge(&authz, &[ChallengeType::Dns01, ChallengeType::Http01]).unwrap();
        assert_eq!(chosen, ChallengeType::Dns01);

        let (_, chosen) =
            choose_challenge(&authz, &[ChallengeType::Http01, ChallengeType::Dns01]).unwrap();
        assert_eq!(chosen, ChallengeType::Http01);
    }

    #[test]
    fn test_chooser_never_picks_non_dns_for_wildcard() {
        let authz = authz("example.org", true, &["http-01", "dns-01"]);

        let (_, chosen) =
            choose_challenge(&authz, &[ChallengeType::Http01, ChallengeType::Dns01]).unwrap();
        assert_eq!(chosen, ChallengeType::Dns01);

        let http_only = choose_challenge(&authz, &[ChallengeType::Http01]);
        assert!(http_only.is_none());
    }

    #[test]
    fn test_chooser_skips_types_the_server_does_not_offer() {
        let authz = authz("example.org", false, &["tls-alpn-01"]);
        assert!(choose_challenge(&authz, &[ChallengeType::Http01, ChallengeType::Dns01]).is_none());
    }
}
