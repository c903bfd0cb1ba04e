use std::{future::Future, sync::Arc};

use crate::{
    acc::AcmeKey,
    api,
    error::AcmeError,
    jws::{external_account_binding, ExternalAccount, Jwk},
    req::{default_client, req_expect_header, req_get, req_handle_error, req_safe_read_body},
    trans::{NoncePool, Transport},
    Account,
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Enumeration of known ACME API directories.
#[derive(Debug, Clone)]
pub enum DirectoryUrl<'a> {
    /// The main Let's Encrypt directory.
    ///
    /// Not appropriate for testing / development.
    LetsEncrypt,

    /// The staging Let's Encrypt directory.
    ///
    /// Use for testing and development. Doesn't issue "valid" certificates. The root signing
    /// certificate is not supposed to be in any trust chains.
    LetsEncryptStaging,

    /// Provide an arbitrary directory URL to connect to.
    Other(&'a str),
}

impl<'a> DirectoryUrl<'a> {
    fn to_url(&self) -> &str {
        match self {
            DirectoryUrl::LetsEncrypt => LETSENCRYPT_URL,
            DirectoryUrl::LetsEncryptStaging => LETSENCRYPT_STAGING_URL,
            DirectoryUrl::Other(url) => url,
        }
    }
}

/// Account creation parameters besides the key.
#[derive(Debug, Clone, Default)]
pub struct AccountOptions {
    /// Contact URLs, complete with scheme (`mailto:admin@example.org`).
    ///
    /// Takes precedence over [`email`](Self::email) when both are set.
    pub contact: Option<Vec<String>>,

    /// Convenience for the common single-address case; wrapped in `mailto:`.
    pub email: Option<String>,

    /// Binding to a pre-existing CA account, for CAs that require it.
    pub external_account: Option<ExternalAccount>,
}

impl AccountOptions {
    fn contact(&self) -> Option<Vec<String>> {
        self.contact.clone().or_else(|| {
            self.email
                .as_ref()
                .map(|email| vec![format!("mailto:{email}")])
        })
    }
}

/// Entry point for accessing an ACME API.
#[derive(Clone)]
pub struct Directory {
    client: reqwest::Client,
    nonce_pool: Arc<NoncePool>,
    api_directory: api::Directory,
}

impl Directory {
    /// Fetch the directory document over a default HTTP client.
    pub async fn fetch(url: DirectoryUrl<'_>) -> eyre::Result<Directory> {
        Self::fetch_with_client(url, default_client()).await
    }

    /// Fetch the directory document over a caller-configured client (custom
    /// roots, proxies, timeouts).
    pub async fn fetch_with_client(
        url: DirectoryUrl<'_>,
        client: reqwest::Client,
    ) -> eyre::Result<Directory> {
        let res = req_get(&client, url.to_url()).await;
        let res = req_handle_error(res?).await.map_err(AcmeError::Problem)?;
        let api_directory = res.json::<api::Directory>().await?;
        let nonce_pool = Arc::new(NoncePool::new(&api_directory.new_nonce));

        Ok(Directory {
            client,
            nonce_pool,
            api_directory,
        })
    }

    /// Use an already-loaded directory document as-is, skipping the fetch.
    pub fn from_api_directory(api_directory: api::Directory, client: reqwest::Client) -> Directory {
        let nonce_pool = Arc::new(NoncePool::new(&api_directory.new_nonce));

        Directory {
            client,
            nonce_pool,
            api_directory,
        }
    }

    /// URL of the terms of service the CA currently requires, if any.
    pub fn terms_of_service(&self) -> Option<&str> {
        self.api_directory.terms_of_service()
    }

    /// Create an account with a fresh P-256 key.
    ///
    /// `agree_to_terms` receives the CA's current terms-of-service URL and
    /// must return it to signal agreement; returning anything else aborts
    /// registration.
    ///
    /// Persist the key ([`Account::acme_private_key_pem()`]) and use
    /// [`load_account`][Self::load_account] afterwards.
    pub async fn register_account<F, Fut>(
        &self,
        options: AccountOptions,
        agree_to_terms: F,
    ) -> eyre::Result<Account>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = eyre::Result<String>>,
    {
        let acme_key = AcmeKey::new();
        self.upsert_account(acme_key, options, agree_to_terms).await
    }

    /// Access an account with an existing private key, registering if the CA
    /// does not know the key yet.
    pub async fn load_account<F, Fut>(
        &self,
        private_key_pem: &str,
        options: AccountOptions,
        agree_to_terms: F,
    ) -> eyre::Result<Account>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = eyre::Result<String>>,
    {
        let acme_key = AcmeKey::from_pem(private_key_pem)?;
        self.upsert_account(acme_key, options, agree_to_terms).await
    }

    /// Access an account the CA already knows, failing if it does not exist.
    pub async fn load_existing_account(&self, private_key_pem: &str) -> eyre::Result<Account> {
        let acme_key = AcmeKey::from_pem(private_key_pem)?;

        let acc = api::Account {
            only_return_existing: Some(true),
            ..Default::default()
        };

        let mut transport = Transport::new(
            Arc::clone(&self.nonce_pool),
            self.client.clone(),
            acme_key,
        );

        let res = transport
            .call_jwk(&self.api_directory.new_account, &acc)
            .await?;

        let kid = req_expect_header(&res, "location").map_err(AcmeError::Problem)?;
        log::debug!("Key ID is: {kid}");
        let api_account = read_account_body(res).await?;

        // fill in the server returned key ID
        transport.set_key_id(kid);

        Ok(Account::new(
            transport,
            api_account,
            self.api_directory.clone(),
        ))
    }

    async fn upsert_account<F, Fut>(
        &self,
        acme_key: AcmeKey,
        options: AccountOptions,
        agree_to_terms: F,
    ) -> eyre::Result<Account>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = eyre::Result<String>>,
    {
        // Terms first: no request is made unless the caller agrees to what
        // the directory currently advertises.
        let terms_of_service_agreed = match self.terms_of_service() {
            Some(offered) => {
                let agreed = agree_to_terms(offered.to_owned()).await?;
                if agreed != offered {
                    return Err(AcmeError::TermsMismatch {
                        offered: offered.to_owned(),
                        agreed,
                    }
                    .into());
                }
                Some(true)
            }
            None => None,
        };

        let new_account_url = self.api_directory.new_account.clone();

        let external_account_binding = options
            .external_account
            .as_ref()
            .map(|eab| {
                let jwk = Jwk::try_from(&acme_key)?;
                external_account_binding(eab, &jwk, &new_account_url)
            })
            .transpose()?;

        // Prepare making a call to newAccount. This is fine to do both for new
        // keys and existing. For existing the spec says to return a 200 with
        // the Location header set to the key ID (kid).
        let acc = api::Account {
            // TODO: ensure email contains no hfields or more than one addr-spec in the to component
            // see https://datatracker.ietf.org/doc/html/rfc8555#section-7.3
            contact: options.contact(),
            terms_of_service_agreed,
            external_account_binding,
            ..Default::default()
        };

        let mut transport = Transport::new(
            Arc::clone(&self.nonce_pool),
            self.client.clone(),
            acme_key,
        );
        let res = transport.call_jwk(&new_account_url, &acc).await?;

        let kid = req_expect_header(&res, "location").map_err(AcmeError::Problem)?;
        log::debug!("Key ID is: {kid}");
        let api_account = read_account_body(res).await?;

        // fill in the server returned key ID
        transport.set_key_id(kid);

        Ok(Account::new(
            transport,
            api_account,
            self.api_directory.clone(),
        ))
    }

    /// Returns a reference to the directory's API object.
    ///
    /// Useful for debugging.
    pub fn api_directory(&self) -> &api::Directory {
        &self.api_directory
    }
}

/// Some CAs reply to newAccount with an empty body; treat that the same as
/// an account object with nothing in it.
async fn read_account_body(res: reqwest::Response) -> eyre::Result<api::Account> {
    let body = req_safe_read_body(res).await;

    if body.trim().is_empty() {
        log::debug!("Empty newAccount response body");
        return Ok(api::Account::default());
    }

    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_directory() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let _dir = Directory::fetch(url).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_account() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let _acc = dir
            .register_account(
                AccountOptions {
                    email: Some("foo@bar.com".to_owned()),
                    ..Default::default()
                },
                |tos| async move { Ok(tos) },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_directory_from_loaded_document() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let fetched = Directory::fetch(url).await.unwrap();

        let dir = Directory::from_api_directory(
            fetched.api_directory().clone(),
            crate::req::default_client(),
        );

        let _acc = dir
            .register_account(AccountOptions::default(), |tos| async move { Ok(tos) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_existing_account() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let acc = dir
            .register_account(AccountOptions::default(), |tos| async move { Ok(tos) })
            .await
            .unwrap();
        let pem = acc.acme_private_key_pem().unwrap();

        let _acc = dir.load_existing_account(&pem).await.unwrap();

        let recorded = server.state.recorded();
        let reload: serde_json::Value = serde_json::from_str(&recorded[1].payload).unwrap();
        assert_eq!(reload["onlyReturnExisting"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_register_with_external_account() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let options = AccountOptions {
            email: Some("foo@bar.com".to_owned()),
            external_account: Some(crate::ExternalAccount {
                id: "eab-kid-1".to_owned(),
                secret: crate::util::base64url(b"super-secret-mac-key"),
                alg: None,
            }),
            ..Default::default()
        };

        dir.register_account(options, |tos| async move { Ok(tos) })
            .await
            .unwrap();

        let recorded = server.state.recorded();
        let account: serde_json::Value = serde_json::from_str(&recorded[0].payload).unwrap();
        let binding = &account["externalAccountBinding"];
        assert!(binding["protected"].is_string());
        assert!(binding["payload"].is_string());
        assert!(binding["signature"].is_string());
    }

    #[tokio::test]
    async fn test_disagreeing_with_terms_makes_no_request() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let err = dir
            .register_account(AccountOptions::default(), |_tos| async move {
                Ok("https://example.org/other-terms".to_owned())
            })
            .await
            .unwrap_err();

        let err = err.downcast_ref::<AcmeError>().unwrap();
        assert!(matches!(err, AcmeError::TermsMismatch { .. }));
        assert_eq!(server.state.requests(), 0);
    }
}
