//! TXT lookups for the dns-01 self-test.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

/// DNS TXT resolution as needed by the dns-01 pre-flight check.
///
/// Injected so tests and exotic environments can answer from somewhere other
/// than the system resolver.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// All TXT records published under `name`, one string per record
    /// (character-string segments joined).
    async fn lookup_txt(&self, name: &str) -> eyre::Result<Vec<String>>;
}

/// [`TxtResolver`] over the operating system's configured resolver.
pub struct SystemTxtResolver {
    resolver: TokioAsyncResolver,
}

impl SystemTxtResolver {
    /// Builds a resolver from `/etc/resolv.conf` (or the platform equivalent).
    pub fn from_system_conf() -> eyre::Result<Self> {
        Ok(SystemTxtResolver {
            resolver: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl TxtResolver for SystemTxtResolver {
    async fn lookup_txt(&self, name: &str) -> eyre::Result<Vec<String>> {
        let lookup = self.resolver.txt_lookup(name).await?;

        Ok(lookup
            .iter()
            .map(|txt| {
                txt.iter()
                    .map(|segment| String::from_utf8_lossy(segment).into_owned())
                    .collect::<String>()
            })
            .collect())
    }
}
