//! Order life cycle.
//!
//! An order goes through a life cycle of different states that require various actions by
//! the user. To ensure the user only use appropriate actions, this library have simple façade
//! structs that wraps the actual [`api::Order`].
//!
//! 1. First prove ownership:
//!    * [`NewOrder`] -> authorizations -> published challenges
//! 2. Then submit CSR and download the cert.
//!    * [`NewOrder`] -> [`CsrOrder`] -> [`CertOrder`]
//!
//! [`Account::issue_certificate()`](crate::Account::issue_certificate) drives the whole cycle in
//! one call; the façades remain available for callers that want to step through it themselves.

use std::{sync::Arc, time::Duration};

use crate::{
    acc::AccountInner,
    api,
    cert::{create_csr_web64, CertBundle, DomainKey},
    error::AcmeError,
    util::read_json,
};

pub(crate) mod auth;
pub(crate) mod precheck;

pub use self::auth::{ChallengeAuth, ChallengeType, Provisioner};

/// The order wrapped with an outer facade.
pub(crate) struct Order {
    acc: Arc<AccountInner>,
    pub(crate) api_order: api::Order,
    url: String,
}

impl Order {
    pub(crate) fn new(acc: &Arc<AccountInner>, api_order: api::Order, url: String) -> Self {
        Order {
            acc: Arc::clone(acc),
            api_order,
            url,
        }
    }
}

/// Helper to refresh an order status (POST-as-GET).
pub(crate) async fn refresh_order(acc: &Arc<AccountInner>, url: String) -> eyre::Result<Order> {
    let res = acc.transport.call_kid(&url, &api::EmptyString).await?;
    let api_order = read_json::<api::Order>(res).await?;

    Ok(Order {
        acc: Arc::clone(acc),
        api_order,
        url,
    })
}

/// An authorization fetched from the API, together with the URL it lives at.
#[derive(Debug, Clone)]
pub struct OrderAuthorization {
    pub url: String,
    pub authorization: api::Authorization,
}

/// A new order created by [`Account::new_order()`].
///
/// An order is created using one or many domains (a primary `CN` and possible multiple
/// alt names). All domains in the order must have authorizations ([confirmed ownership])
/// before the order can progress to submitting a [CSR].
///
/// This order façade provides calls to provide such authorizations and to progress the order
/// when ready.
///
/// The ACME API provider might "remember" for a time that you already own a domain, which
/// means you might not need to prove the ownership every time. Use appropriate methods to
/// first check whether you really need to handle authorizations.
///
/// [`Account::new_order()`]: crate::Account::new_order()
/// [confirmed ownership]: ../index.html#domain-ownership
/// [CSR]: https://en.wikipedia.org/wiki/Certificate_signing_request
pub struct NewOrder {
    pub(crate) order: Order,
}

impl NewOrder {
    /// Tell if the domains in this order have been authorized.
    ///
    /// This doesn't do any calls against the API. You must manually call [`refresh`].
    ///
    /// In ACME API terms, the order can either be `ready` or `valid`, which both would mean we have
    /// passed the authorization stage.
    ///
    /// [`refresh`]: Self::refresh
    pub fn is_validated(&self) -> bool {
        self.order.api_order.status.is_some_and(|status| {
            matches!(status, api::OrderStatus::Ready | api::OrderStatus::Valid)
        })
    }

    /// If the order [is validated], progress it to a [`CsrOrder`].
    ///
    /// This doesn't do any calls against the API. You must manually call [`refresh`].
    ///
    /// [is validated]: Self::is_validated
    /// [`refresh`]: Self::refresh
    pub fn confirm_validations(&self) -> Option<CsrOrder> {
        if self.is_validated() {
            Some(CsrOrder {
                order: Order::new(
                    &self.order.acc,
                    self.order.api_order.clone(),
                    self.order.url.clone(),
                ),
            })
        } else {
            None
        }
    }

    /// Progress to CSR submission without checking the local status copy.
    ///
    /// Used once every published challenge has been polled to `valid`; the
    /// finalize call itself is the authority on whether that sufficed.
    pub(crate) fn assume_validations(self) -> CsrOrder {
        CsrOrder { order: self.order }
    }

    /// Refresh the order state against the ACME API.
    ///
    /// The specification calls this a "POST-as-GET" against the order URL.
    pub async fn refresh(&mut self) -> eyre::Result<()> {
        let order = refresh_order(&self.order.acc, self.order.url.clone()).await?;
        self.order.api_order.overwrite(order.api_order)?;
        Ok(())
    }

    /// Provide the authorizations. The number of authorizations will be the same as
    /// the number of domains requested, i.e. at least one (the primary CN), but possibly
    /// more (for alt names).
    ///
    /// If the order includes new domain names that have not been authorized before, this
    /// list might contain a mix of already valid and not yet valid auths.
    pub async fn authorizations(&self) -> eyre::Result<Vec<OrderAuthorization>> {
        let mut result = vec![];
        if let Some(authorizations) = &self.order.api_order.authorizations {
            for auth_url in authorizations {
                let res = self
                    .order
                    .acc
                    .transport
                    .call_kid(auth_url, &api::EmptyString)
                    .await?;
                let authorization = read_json::<api::Authorization>(res).await?;
                result.push(OrderAuthorization {
                    url: auth_url.clone(),
                    authorization,
                });
            }
        }
        Ok(result)
    }

    /// Returns a reference to the order's API object.
    ///
    /// Useful for debugging.
    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

/// An order that is ready for a [CSR] submission.
///
/// Submitting the CSR is called "finalizing" the order.
///
/// To finalize, the user supplies a [`DomainKey`] (from which a public key is derived). This
/// library provides generators for P-256 and RSA keys, but the key can be created or retrieved in
/// some other way.
///
/// [CSR]: https://en.wikipedia.org/wiki/Certificate_signing_request
pub struct CsrOrder {
    pub(crate) order: Order,
}

impl CsrOrder {
    /// Finalizes the order by submitting a CSR and awaiting certificate issuance.
    ///
    /// Creates the CSR for the domains in the order and submits it to the ACME API.
    ///
    /// Once the CSR has been submitted, the order goes into a "processing" status, where we must
    /// poll until the status changes to "valid"; `interval` is the amount of time to wait between
    /// each poll attempt. Any other terminal status means the order is lost and the error spells
    /// out what the server thought it validated.
    pub async fn finalize(
        mut self,
        domain_key: &DomainKey,
        interval: Duration,
    ) -> eyre::Result<CertOrder> {
        // the domains that we have authorized
        let domains = self
            .order
            .api_order
            .domains()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();

        let csr_b64 = create_csr_web64(domain_key, &domains)?;
        let finalize = api::Finalize::new(csr_b64);

        let inner = Arc::clone(&self.order.acc);
        let order_url = self.order.url.clone();
        let finalize_url = &self.order.api_order.finalize;

        // If the CSR is invalid, we will get a 4xx code back that bombs out
        // from this call.
        inner.transport.call_kid(finalize_url, &finalize).await?;

        // wait for the status to leave processing:
        // valid -> cert is issued
        // anything else -> the whole thing is off
        let order = loop {
            let order = refresh_order(&inner, order_url.clone()).await?;

            if !matches!(order.api_order.status, Some(api::OrderStatus::Processing)) {
                break order;
            }

            tokio::time::sleep(interval).await;
        };

        if !matches!(order.api_order.status, Some(api::OrderStatus::Valid)) {
            let status = order
                .api_order
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_owned());
            let validated = order
                .api_order
                .domains()
                .into_iter()
                .map(str::to_owned)
                .collect();
            let body = serde_json::to_string(&order.api_order)?;

            return Err(AcmeError::OrderFailed {
                status,
                requested: domains,
                validated,
                body,
            }
            .into());
        }

        self.order.api_order.overwrite(order.api_order)?;

        Ok(CertOrder { order: self.order })
    }

    /// Returns a reference to the order's API object.
    ///
    /// Useful for debugging.
    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

/// Order for an issued certificate that is ready to download.
pub struct CertOrder {
    order: Order,
}

impl CertOrder {
    /// Request download of the issued certificate.
    pub async fn download_cert(self) -> eyre::Result<CertBundle> {
        let url = self
            .order
            .api_order
            .certificate
            .clone()
            .ok_or_else(|| eyre::eyre!("certificate url"))?;

        let inner = self.order.acc;

        let res = inner.transport.call_kid(&url, &api::EmptyString).await?;
        let pem_chain = res.text().await?;

        CertBundle::new(
            self.order.api_order.expires,
            self.order.api_order.identifiers,
            &pem_chain,
        )
    }

    /// Returns a reference to the order's API object.
    ///
    /// Useful for debugging.
    pub fn api_order(&self) -> &api::Order {
        &self.order.api_order
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{cert::DomainKey, AccountOptions, Directory, DirectoryUrl};

    async fn test_account(dir_url: &str) -> crate::Account {
        let url = DirectoryUrl::Other(dir_url);
        let dir = Directory::fetch(url).await.unwrap();
        dir.register_account(
            AccountOptions {
                email: Some("foo@bar.com".to_owned()),
                ..Default::default()
            },
            |tos| async move { Ok(tos) },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_authorizations() {
        let server = crate::test::with_directory_server();
        let acc = test_account(&server.dir_url).await;
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();
        let authorizations = ord.authorizations().await.unwrap();
        assert_eq!(authorizations.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_and_confirm_validations() {
        let server = crate::test::with_directory_server();
        let acc = test_account(&server.dir_url).await;
        let mut ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();

        // fresh orders start out pending
        assert!(!ord.is_validated());
        assert!(ord.confirm_validations().is_none());

        // the mock reports the order valid on refresh
        ord.refresh().await.unwrap();
        assert!(ord.is_validated());
        assert!(ord.confirm_validations().is_some());
    }

    #[tokio::test]
    async fn test_finalize_and_download() {
        let server = crate::test::with_directory_server();
        let acc = test_account(&server.dir_url).await;
        let ord = acc.new_order("acme-test.example.com", &[]).await.unwrap();

        // shortcut auth
        let ord = ord.assume_validations();
        let domain_key = DomainKey::generate_p256();
        let ord = ord
            .finalize(&domain_key, Duration::from_millis(1))
            .await
            .unwrap();

        let bundle = ord.download_cert().await.unwrap();
        assert!(bundle.cert.contains("BEGIN CERTIFICATE"));
        assert!(!bundle.chain.is_empty());
        assert_eq!(bundle.valid_days_left().unwrap(), 89);
    }
}
