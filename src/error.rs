use crate::api;

/// Terminal failures of the issuance engine.
///
/// Everything flows through [`eyre::Result`], but callers that need to react
/// to a specific protocol failure can `downcast_ref::<AcmeError>()`.
#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
    /// The terms-of-service callback returned a URL other than the one the
    /// directory advertises.
    #[error("terms of service not agreed: CA offers {offered}, caller agreed to {agreed}")]
    TermsMismatch { offered: String, agreed: String },

    /// The pre-flight self-test could not observe the published challenge
    /// response. The detail carries a curl/dig command to reproduce.
    #[error("challenge self-test failed for {hostname}: {detail}")]
    DryRunFailed { hostname: String, detail: String },

    /// A challenge poll returned a body without a `status` field.
    #[error("challenge response contained no status")]
    ChallengeStateMissing,

    /// The server validated the challenge and rejected it.
    #[error("challenge failed: {0}")]
    ChallengeInvalid(api::Problem),

    /// The challenge reached a status this client does not know about.
    #[error("challenge reached unrecognized status {status:?}")]
    ChallengeStateUnknown { status: String },

    #[error("challenge stuck in bad pending/processing state after {polls} polls")]
    ChallengePollExhausted { polls: usize },

    #[error("order contained no authorizations")]
    NoAuthorizations,

    /// The order did not reach `valid` after finalization.
    #[error(
        "order for {requested:?} ended in status {status} (server validated {validated:?}): {body}"
    )]
    OrderFailed {
        status: String,
        requested: Vec<String>,
        validated: Vec<String>,
        body: String,
    },

    #[error("no challenge types configured")]
    NoChallengeTypes,

    #[error("domain list is empty")]
    NoDomains,

    #[error("subject {0:?} is not among the requested domains")]
    SubjectNotInDomains(String),

    /// None of the configured challenge types is offered by the server for
    /// this domain (wildcards accept only dns-01).
    #[error("no usable challenge offered for {domain}")]
    NoSolvableChallenge { domain: String },

    /// An ACME problem document returned by the server.
    #[error(transparent)]
    Problem(#[from] api::Problem),
}
