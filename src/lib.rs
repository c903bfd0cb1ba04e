//! Provisioning certificates from ACME (Automatic Certificate Management Environment) providers
//! such as [Let's Encrypt](https://letsencrypt.org/).
//!
//! It follows the [RFC 8555](https://datatracker.ietf.org/doc/html/rfc8555) spec, using ACME v2 to
//! issue/renew certificates.
//!
//! # Usage
//!
//! 1. Fetch a [`Directory`] and register (or load) an [`Account`].
//! 2. Implement [`Provisioner`] for wherever your challenge responses live — a web root for
//!    `http-01`, a DNS zone for `dns-01`.
//! 3. Call [`Account::issue_certificate()`] with the domains and a [`DomainKey`]; it rehearses the
//!    install path, orders, publishes and validates every challenge, finalizes with a CSR, and
//!    returns the issued [`CertBundle`].
//!
//! Callers that want to drive the order life cycle themselves can use the façades in [`order`]
//! directly.
//!
//! A complete `http-01` example is provided in the source repository under `demos/`.
//!
//! # Domain Ownership
//!
//! Most website TLS certificates tries to prove ownership/control over the domain they are issued
//! for. For ACME, this means proving you control either:
//!
//! - a server answering HTTP requests for that domain;
//! - the DNS server answering name lookups against the domain.
//!
//! The [`Provisioner`] callbacks are the points in the flow where you modify either the web server
//! or the DNS server before the engine progresses to get the certificate. Wildcard domains can
//! only be proven over DNS.
//!
//! Before any challenge is submitted to the CA, the engine publishes a pseudo-challenge and checks
//! it is actually reachable (HTTP fetch or TXT lookup). Failed validations count against strict
//! server-side rate limits; failed rehearsals are free. Set
//! [`IssueOptions::skip_challenge_test`] to opt out.
//!
//! # Rate Limits
//!
//! The ACME API provider Let's Encrypt uses [rate limits] to ensure the API is not being abused. It
//! might be tempting to put the `retry_interval` really low, but balance this against the real
//! risk of having access cut off.
//!
//! ## Use Staging For Development!
//!
//! Especially take care to use the Let's Encrypt staging environment for development where the rate
//! limits are more relaxed. See [`DirectoryUrl::LetsEncryptStaging`].
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod acc;
mod cert;
mod dir;
mod error;
mod issue;
mod jws;
mod req;
mod trans;
mod util;

pub mod api;
pub mod dns;
pub mod order;


pub use crate::{
    acc::Account,
    cert::{create_p256_key, format_pem_chain, split_pem_chain, CertBundle, DomainKey},
    dir::{AccountOptions, Directory, DirectoryUrl},
    error::AcmeError,
    issue::IssueOptions,
    jws::ExternalAccount,
    order::{ChallengeAuth, ChallengeType, Provisioner},
};
