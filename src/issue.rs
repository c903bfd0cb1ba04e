//! One-call certificate issuance.
//!
//! [`Account::issue_certificate()`] drives the full order life cycle:
//! self-test, newOrder, challenge publication, validation polling, CSR
//! finalization and certificate download.

use std::time::Duration;

use crate::{
    cert::{CertBundle, DomainKey},
    dns::TxtResolver,
    error::AcmeError,
    order::{
        auth::{accept_and_poll, challenge_to_auth, choose_challenge, PollTuning},
        precheck::self_test,
        ChallengeType, Provisioner,
    },
    Account,
};

/// What to issue and how patiently to poll for it.
#[derive(Debug, Clone)]
pub struct IssueOptions {
    /// Domains to certify. May include wildcard names (`*.example.org`).
    pub domains: Vec<String>,

    /// Which domain becomes the certificate's Common Name. Defaults to the
    /// first entry of [`domains`](Self::domains); must be listed there.
    pub subject: Option<String>,

    /// Challenge types in preference order.
    pub challenge_types: Vec<ChallengeType>,

    /// Bypass the local install-path rehearsal before ordering.
    pub skip_challenge_test: bool,

    /// Pause between challenge/order polls.
    pub retry_interval: Duration,

    /// Hard ceiling on challenge poll iterations.
    pub retry_poll: usize,

    /// `pending` polls tolerated before the stuck challenge is deactivated
    /// and re-accepted.
    pub retry_pending: usize,

    /// Settle time after deactivating a stuck challenge.
    pub deauth_wait: Duration,

    /// Pause after each [`Provisioner::set_challenge`] so slow install paths
    /// (disk sync, zone reload) catch up before validation is requested.
    pub set_challenge_wait: Duration,
}

impl IssueOptions {
    /// Options for `domains` with the defaults: both challenge types with
    /// http-01 preferred, self-test enabled, 1 s polls (8 max), 4 tolerated
    /// pending rounds, 10 s deactivation wait, 500 ms publish wait.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IssueOptions {
            domains: domains.into_iter().map(Into::into).collect(),
            subject: None,
            challenge_types: vec![ChallengeType::Http01, ChallengeType::Dns01],
            skip_challenge_test: false,
            retry_interval: Duration::from_millis(1000),
            retry_poll: 8,
            retry_pending: 4,
            deauth_wait: Duration::from_millis(10_000),
            set_challenge_wait: Duration::from_millis(500),
        }
    }

    fn poll_tuning(&self) -> PollTuning {
        PollTuning {
            retry_interval: self.retry_interval,
            retry_poll: self.retry_poll,
            retry_pending: self.retry_pending,
            deauth_wait: self.deauth_wait,
        }
    }

    /// Domain list with the subject moved to the front (it becomes the CN).
    fn sorted_domains(&self) -> Result<Vec<String>, AcmeError> {
        if self.domains.is_empty() {
            return Err(AcmeError::NoDomains);
        }

        let mut domains = self.domains.clone();

        if let Some(subject) = &self.subject {
            let pos = domains
                .iter()
                .position(|d| d == subject)
                .ok_or_else(|| AcmeError::SubjectNotInDomains(subject.clone()))?;
            let subject = domains.remove(pos);
            domains.insert(0, subject);
        }

        Ok(domains)
    }
}

impl Account {
    /// Obtain a certificate for `options.domains`, proving ownership through
    /// `provisioner`.
    ///
    /// Authorizations are worked through serially, in two passes: first every
    /// challenge response is published, then each challenge is accepted and
    /// polled to a terminal state. Published responses are removed once their
    /// challenge validates; on failure they are left in place for the
    /// caller's own cleanup path.
    pub async fn issue_certificate(
        &self,
        domain_key: &DomainKey,
        options: &IssueOptions,
        provisioner: &dyn Provisioner,
        resolver: &dyn TxtResolver,
    ) -> eyre::Result<CertBundle> {
        if options.challenge_types.is_empty() {
            return Err(AcmeError::NoChallengeTypes.into());
        }

        let domains = options.sorted_domains()?;

        let inner = self.inner();
        let acme_key = inner.transport.acme_key();

        if !options.skip_challenge_test {
            self_test(
                inner.transport.http_client(),
                resolver,
                provisioner,
                acme_key,
                &domains,
                &options.challenge_types,
            )
            .await?;
        }

        let alt_names = domains[1..].iter().map(String::as_str).collect::<Vec<_>>();
        let order = self.new_order(&domains[0], &alt_names).await?;

        let authorizations = order.authorizations().await?;
        if authorizations.is_empty() {
            return Err(AcmeError::NoAuthorizations.into());
        }

        // Pass one: publish every challenge response before asking the
        // server to validate any of them. Interleaving would give failed
        // early validations time to stick in DNS negative caches while the
        // later ones are still being published.
        let mut published = Vec::new();

        for ordered in &authorizations {
            let authz = &ordered.authorization;

            if authz.has_valid_challenge() {
                log::debug!("Authorization already valid: {}", authz.identifier.value);
                continue;
            }

            let (challenge, challenge_type) = choose_challenge(authz, &options.challenge_types)
                .ok_or_else(|| AcmeError::NoSolvableChallenge {
                    domain: authz.identifier.value.clone(),
                })?;

            let auth = challenge_to_auth(acme_key, authz, challenge, challenge_type, false)?;

            log::debug!("Publish challenge for {} ({challenge_type})", auth.altname);
            provisioner.set_challenge(&auth).await?;
            tokio::time::sleep(options.set_challenge_wait).await;

            published.push(auth);
        }

        // Pass two: accept and poll, still serially.
        let tuning = options.poll_tuning();

        for auth in &published {
            accept_and_poll(inner, auth, &tuning).await?;

            if let Err(err) = provisioner.remove_challenge(auth).await {
                log::warn!("Failed to remove challenge for {}: {err}", auth.altname);
            }
        }

        let csr_order = order.assume_validations();
        let cert_order = csr_order.finalize(domain_key, options.retry_interval).await?;

        cert_order.download_cert().await
    }
}
