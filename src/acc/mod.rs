use std::{collections::HashSet, iter, sync::Arc};

use zeroize::Zeroizing;

use crate::{
    api,
    error::AcmeError,
    order::{NewOrder, Order},
    req::req_expect_header,
    trans::Transport,
};

mod acme_key;

pub(crate) use self::acme_key::{key_kind_from_pem, AcmeKey, KeyKind};

#[derive(Debug, Clone)]
pub(crate) struct AccountInner {
    pub transport: Transport,
    pub api_account: api::Account,
    pub api_directory: api::Directory,
}

/// Account with an ACME provider.
///
/// Accounts are created using [`Directory::register_account()`] and consist of contact addresses
/// and a private key for signing requests to the ACME API.
///
/// This library generates elliptic curve P-256 account keys and accepts RSA ones on import.
///
/// The advantages of using elliptic curve cryptography are that the signed requests against the
/// ACME API are small and that the public key can be derived from the private key.
///
/// [`Directory::register_account()`]: crate::Directory::register_account()
#[derive(Debug, Clone)]
pub struct Account {
    inner: Arc<AccountInner>,
}

impl Account {
    pub(crate) fn new(
        transport: Transport,
        api_account: api::Account,
        api_directory: api::Directory,
    ) -> Self {
        Self {
            inner: Arc::new(AccountInner {
                transport,
                api_account,
                api_directory,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<AccountInner> {
        &self.inner
    }

    /// Private key for this account, PKCS#8 PEM.
    pub fn acme_private_key_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.inner.transport.acme_key().to_pem()
    }

    /// Create a new order to issue a certificate for this account.
    ///
    /// Each order has a required `primary_name` (which will be set as the certificate's `CN`) and a
    /// variable number of `alt_names`.
    ///
    /// This library doesn't constrain the number of `alt_names`, but it is limited by the ACME API
    /// provider. Let's Encrypt [sets a max of 100 names] per certificate.
    ///
    /// Every call creates a new order with the ACME API provider, even when the domain names
    /// supplied are exactly the same.
    ///
    /// [sets a max of 100 names]: https://letsencrypt.org/docs/rate-limits/
    pub async fn new_order(
        &self,
        primary_name: &str,
        alt_names: &[&str],
    ) -> eyre::Result<NewOrder> {
        let mut identifiers = Vec::new();
        let mut dedup = HashSet::new();
        for domain in iter::once(primary_name).chain(alt_names.iter().copied()) {
            if dedup.insert(domain) {
                identifiers.push(api::Identifier::dns(domain));
            }
        }

        let order = api::Order::from_identifiers(identifiers);

        let new_order_url = self.inner.api_directory.new_order.as_str();

        let res = self.inner.transport.call_kid(new_order_url, &order).await?;
        let order_url = req_expect_header(&res, "location").map_err(AcmeError::Problem)?;
        let api_order = res.json::<api::Order>().await?;

        let mut order = Order::new(&self.inner, order, order_url);
        order.api_order.overwrite(api_order)?;
        Ok(NewOrder { order })
    }

    /// Returns a reference to the account's API object.
    ///
    /// Useful for debugging.
    pub fn api_account(&self) -> &api::Account {
        &self.inner.api_account
    }
}

#[cfg(test)]
mod tests {
    use crate::{AccountOptions, Directory, DirectoryUrl};

    #[tokio::test]
    async fn test_create_order() {
        let server = crate::test::with_directory_server();

        let url = DirectoryUrl::Other(&server.dir_url);
        let dir = Directory::fetch(url).await.unwrap();

        let acc = dir
            .register_account(
                AccountOptions {
                    email: Some("foo@bar.com".to_owned()),
                    ..Default::default()
                },
                |tos| async move { Ok(tos) },
            )
            .await
            .unwrap();

        let _order = acc.new_order("acme-test.example.com", &[]).await.unwrap();
    }
}
