//! Rehearsal of the challenge install path before the CA gets involved.
//!
//! ACME providers rate-limit failed validations hard. Proving that the
//! caller's [`Provisioner`] actually publishes reachable responses costs a
//! couple of local requests and saves that quota.

use std::time::Duration;

use crate::{
    acc::AcmeKey,
    api,
    dns::TxtResolver,
    error::AcmeError,
    order::auth::{challenge_to_auth, choose_challenge, ChallengeAuth, ChallengeType, Provisioner},
    req::{req_get, req_safe_read_body},
    util::base64url,
};

/// Give published TXT records a moment to propagate before querying.
const DNS_PROPAGATION_WAIT: Duration = Duration::from_millis(1500);

/// Publish a pseudo-challenge for every requested domain and verify it
/// resolves the way a validation server would see it.
///
/// Fails fast with [`AcmeError::DryRunFailed`]; nothing has been submitted
/// to the CA at that point.
pub(crate) async fn self_test(
    client: &reqwest::Client,
    resolver: &dyn TxtResolver,
    provisioner: &dyn Provisioner,
    acme_key: &AcmeKey,
    domains: &[String],
    types: &[ChallengeType],
) -> eyre::Result<()> {
    let mut published = Vec::new();

    for domain in domains {
        let wildcard = domain.starts_with("*.");
        let hostname = domain.trim_start_matches("*.");

        let authz = pseudo_authorization(hostname, wildcard);
        let (challenge, challenge_type) =
            choose_challenge(&authz, types).ok_or_else(|| AcmeError::NoSolvableChallenge {
                domain: domain.clone(),
            })?;

        let auth = challenge_to_auth(acme_key, &authz, challenge, challenge_type, true)?;

        log::debug!("Dry-run install for {} ({challenge_type})", auth.altname);
        provisioner.set_challenge(&auth).await?;

        published.push(auth);
    }

    if published
        .iter()
        .any(|auth| auth.challenge_type == ChallengeType::Dns01)
    {
        tokio::time::sleep(DNS_PROPAGATION_WAIT).await;
    }

    for auth in &published {
        verify(client, resolver, auth).await?;
        log::debug!("Dry-run ok for {}", auth.altname);
    }

    // The rehearsal worked; clean up after ourselves.
    for auth in &published {
        if let Err(err) = provisioner.remove_challenge(auth).await {
            log::warn!("Failed to remove dry-run challenge for {}: {err}", auth.altname);
        }
    }

    Ok(())
}

/// A made-up authorization carrying one pending challenge of every type the
/// ACME ecosystem knows, so the regular chooser logic applies unchanged.
fn pseudo_authorization(hostname: &str, wildcard: bool) -> api::Authorization {
    let challenges = ["http-01", "dns-01", "tls-sni-01", "tls-alpn-01"]
        .into_iter()
        .map(|_type| api::Challenge {
            _type: _type.to_owned(),
            url: format!("dry-run:{_type}"),
            status: Some(api::ChallengeStatus::Pending),
            validated: None,
            error: None,
            token: format!("test-{}", base64url(&rand::random::<[u8; 16]>())),
        })
        .collect();

    api::Authorization {
        identifier: api::Identifier::dns(hostname),
        status: api::AuthorizationStatus::Pending,
        expires: None,
        challenges,
        wildcard: wildcard.then_some(true),
    }
}

async fn verify(
    client: &reqwest::Client,
    resolver: &dyn TxtResolver,
    auth: &ChallengeAuth,
) -> eyre::Result<()> {
    match auth.challenge_type {
        ChallengeType::Http01 => {
            let body = match req_get(client, &auth.challenge_url).await {
                Ok(res) => req_safe_read_body(res).await,
                Err(problem) => {
                    return Err(dry_run_failed(
                        auth,
                        format!(
                            "could not fetch the token file ({problem}); check with: curl -v '{}'",
                            auth.challenge_url
                        ),
                    ));
                }
            };

            if body.trim() != auth.key_authorization {
                return Err(dry_run_failed(
                    auth,
                    format!(
                        "token file served the wrong content (expected {:?}); check with: curl -v '{}'",
                        auth.key_authorization, auth.challenge_url
                    ),
                ));
            }
        }

        ChallengeType::Dns01 => {
            let records = match resolver.lookup_txt(&auth.dns_host).await {
                Ok(records) => records,
                Err(err) => {
                    return Err(dry_run_failed(
                        auth,
                        format!(
                            "TXT lookup failed ({err}); check with: dig TXT '{}'",
                            auth.dns_host
                        ),
                    ));
                }
            };

            if !records.iter().any(|r| r == &auth.dns_authorization) {
                return Err(dry_run_failed(
                    auth,
                    format!(
                        "no TXT record with value {:?} (saw {} records); check with: dig TXT '{}'",
                        auth.dns_authorization,
                        records.len(),
                        auth.dns_host
                    ),
                ));
            }
        }
    }

    Ok(())
}

fn dry_run_failed(auth: &ChallengeAuth, detail: String) -> eyre::Report {
    AcmeError::DryRunFailed {
        hostname: auth.altname.clone(),
        detail,
    }
    .into()
}
