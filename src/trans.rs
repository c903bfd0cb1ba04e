use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use base64::prelude::*;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    acc::AcmeKey,
    error::AcmeError,
    jws::{FlattenedJsonJws, Jwk, JwsProtectedHeader},
    req::{req_expect_header, req_handle_error, req_head, req_post},
};

/// A nonce older than this is assumed to be rejected by the server and is
/// dropped instead of spent.
const NONCE_MAX_AGE: Duration = Duration::from_secs(15 * 60);

/// Upper bound on pooled nonces. Responses keep arriving with fresh nonces
/// whether we need them or not; everything beyond this is discarded.
const NONCE_POOL_CAP: usize = 32;

/// Bad nonces invalidate the signature; one bounded round of retries with a
/// freshly harvested nonce recovers without caller involvement.
const MAX_BAD_NONCE_RETRIES: usize = 3;

/// JWS payload and nonce handling for requests to the API.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against newAccount url
/// 3. `set_key_id` from the returned `Location` header.
/// 4. `call_kid()` for all calls after that.
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    client: reqwest::Client,
    acme_key: AcmeKey,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub fn new(nonce_pool: Arc<NoncePool>, client: reqwest::Client, acme_key: AcmeKey) -> Self {
        Transport {
            client,
            acme_key,
            nonce_pool,
        }
    }

    /// Update the key ID once it is known (part of setting up the transport).
    pub fn set_key_id(&mut self, kid: String) {
        self.acme_key.set_key_id(kid);
    }

    /// The key used in the transport.
    pub fn acme_key(&self) -> &AcmeKey {
        &self.acme_key
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Make call using the full JWK.
    ///
    /// Only needed for the first newAccount request.
    pub async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_jwk<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AcmeKey,
            payload: &T,
        ) -> eyre::Result<String> {
            let jwk = Jwk::try_from(key)?;
            let protected = JwsProtectedHeader::new_jwk(jwk, url, nonce, key.alg());
            jws_with(protected, key, payload)
        }

        self.do_call(url, body, jws_with_jwk).await
    }

    /// Make call using the key ID.
    pub async fn call_kid<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        fn jws_with_kid<T: Serialize + ?Sized>(
            url: &str,
            nonce: String,
            key: &AcmeKey,
            payload: &T,
        ) -> eyre::Result<String> {
            let protected = JwsProtectedHeader::new_kid(key.key_id(), url, nonce, key.alg());
            jws_with(protected, key, payload)
        }

        self.do_call(url, body, jws_with_kid).await
    }

    async fn do_call<T, F>(
        &self,
        url: &str,
        body: &T,
        make_body: F,
    ) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
        F: Fn(&str, String, &AcmeKey, &T) -> eyre::Result<String>,
    {
        // The ACME API may at any point invalidate all nonces. If we detect
        // such an error, retry with a freshly harvested nonce, a bounded
        // number of times.
        let mut attempt = 0;

        loop {
            attempt += 1;

            // Either get a new nonce, or reuse one from a previous request.
            let nonce = self.nonce_pool.get_nonce(&self.client).await?;

            // Sign the body.
            let body = make_body(url, nonce, &self.acme_key, body)?;

            log::debug!("Call endpoint: {url}");

            // Post it to the URL
            let response = req_post(&self.client, url, body).await;

            // Regardless of the request being a success or not, there might be a nonce in the
            // response.
            if let Ok(response) = &response {
                self.nonce_pool.extract_nonce(response);
            }

            // Turn errors into problem documents.
            let result = req_handle_error(response?).await;

            if let Err(problem) = &result {
                if attempt <= MAX_BAD_NONCE_RETRIES
                    && (problem.is_bad_nonce() || problem.is_jws_verification_error())
                {
                    log::debug!("Retrying on: {problem}");
                    continue;
                }
            }

            return Ok(result.map_err(AcmeError::Problem)?);
        }
    }
}

/// Shared pool of nonces.
///
/// Most recently received is spent first; entries expire after
/// [`NONCE_MAX_AGE`]. One pool is shared by every transport built from the
/// same directory, so concurrent orders never spend the same nonce twice.
#[derive(Debug)]
pub(crate) struct NoncePool {
    nonce_url: String,
    pool: Mutex<VecDeque<(String, Instant)>>,
}

impl NoncePool {
    pub fn new(nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.to_owned(),
            pool: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn extract_nonce(&self, res: &reqwest::Response) {
        if let Some(nonce) = res.headers().get("replay-nonce") {
            let Ok(nonce) = nonce.to_str() else {
                // see https://datatracker.ietf.org/doc/html/rfc8555#section-6.5.1
                log::trace!("Ignoring invalid replay-nonce value");
                return;
            };

            log::trace!("Extracting new nonce");

            let mut pool = self.pool.lock();

            pool.push_front((nonce.to_owned(), Instant::now()));
            pool.truncate(NONCE_POOL_CAP);
        }
    }

    /// Most recent fresh nonce, discarding expired entries along the way.
    fn pop_fresh(&self) -> Option<String> {
        let mut pool = self.pool.lock();

        while let Some((nonce, received_at)) = pool.pop_front() {
            if received_at.elapsed() < NONCE_MAX_AGE {
                return Some(nonce);
            }

            log::trace!("Discard expired nonce");
        }

        None
    }

    async fn get_nonce(&self, client: &reqwest::Client) -> eyre::Result<String> {
        if let Some(nonce) = self.pop_fresh() {
            log::trace!("Use previous nonce");
            return Ok(nonce);
        }

        log::debug!("Request new nonce");
        let res = req_head(client, &self.nonce_url)
            .await
            .map_err(AcmeError::Problem)?;

        Ok(req_expect_header(&res, "replay-nonce").map_err(AcmeError::Problem)?)
    }
}

/// Construct JWS with protected header according to [RFC 7515 §5.1].
///
/// [RFC 7515 §5.1]: https://datatracker.ietf.org/doc/html/rfc7515#section-5.1
fn jws_with<T: Serialize + ?Sized>(
    protected: JwsProtectedHeader,
    key: &AcmeKey,
    payload: &T,
) -> eyre::Result<String> {
    let header = {
        let pro_json = serde_json::to_string(&protected)?;
        BASE64_URL_SAFE_NO_PAD.encode(pro_json)
    };

    let payload = {
        let payload_json = serde_json::to_string(payload)?;

        if payload_json == "\"\"" {
            // This is the special POST-as-GET case produced by
            // api::EmptyString and must not be base64url encoded further.
            String::new()
        } else {
            BASE64_URL_SAFE_NO_PAD.encode(payload_json)
        }
    };

    let to_sign = format!("{header}.{payload}");
    let signature = BASE64_URL_SAFE_NO_PAD.encode(key.sign(to_sign.as_bytes())?);

    let jws = FlattenedJsonJws::new(header, payload, signature);

    Ok(serde_json::to_string(&jws)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(nonces: &[(&str, Instant)]) -> NoncePool {
        let pool = NoncePool::new("http://127.0.0.1:1/new-nonce");
        {
            let mut guard = pool.pool.lock();
            for (value, at) in nonces {
                guard.push_front(((*value).to_owned(), *at));
            }
        }
        pool
    }

    #[test]
    fn test_nonce_is_dispensed_lifo_and_once() {
        let now = Instant::now();
        let pool = pool_with(&[("a", now), ("b", now), ("c", now)]);

        assert_eq!(pool.pop_fresh().as_deref(), Some("c"));
        assert_eq!(pool.pop_fresh().as_deref(), Some("b"));
        assert_eq!(pool.pop_fresh().as_deref(), Some("a"));
        assert_eq!(pool.pop_fresh(), None);
    }

    #[test]
    fn test_expired_nonce_is_never_used() {
        let now = Instant::now();
        // Instant cannot represent times before the process clock's origin
        // on all platforms; skip when the machine is too freshly booted.
        let Some(stale) = now.checked_sub(NONCE_MAX_AGE + Duration::from_secs(1)) else {
            return;
        };
        let pool = pool_with(&[("stale", stale), ("fresh", now)]);

        assert_eq!(pool.pop_fresh().as_deref(), Some("fresh"));
        assert_eq!(pool.pop_fresh(), None);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = NoncePool::new("http://127.0.0.1:1/new-nonce");
        let now = Instant::now();
        {
            let mut guard = pool.pool.lock();
            for i in 0..(NONCE_POOL_CAP * 2) {
                guard.push_front((format!("nonce-{i}"), now));
                guard.truncate(NONCE_POOL_CAP);
            }
        }
        assert_eq!(pool.pool.lock().len(), NONCE_POOL_CAP);
    }
}
