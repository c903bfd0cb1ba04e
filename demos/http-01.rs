use acme_engine::{
    AccountOptions, ChallengeAuth, ChallengeType, Directory, DirectoryUrl, DomainKey,
    IssueOptions, Provisioner,
};
use actix_files::Files;
use actix_web::{middleware::Logger, App, HttpServer};
use async_trait::async_trait;
use tokio::fs;

const CHALLENGE_DIR: &str = "./acme-challenges";
const DOMAINS: &[&str] = &["glados.example.org", "oc.example.org"];
const CONTACT_EMAIL: Option<&str> = None;

/// Writes challenge responses into the directory served below.
struct FileProvisioner;

#[async_trait]
impl Provisioner for FileProvisioner {
    async fn set_challenge(&self, auth: &ChallengeAuth) -> eyre::Result<()> {
        let path = format!("{CHALLENGE_DIR}/{}", auth.token);
        log::info!("persisting authorization proof to {path}");
        fs::write(path, &auth.key_authorization).await?;
        Ok(())
    }

    async fn remove_challenge(&self, auth: &ChallengeAuth) -> eyre::Result<()> {
        fs::remove_file(format!("{CHALLENGE_DIR}/{}", auth.token)).await?;
        Ok(())
    }
}

#[actix_web::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    log::info!("ensuring challenge dir exists");
    fs::create_dir_all(CHALLENGE_DIR)
        .await
        .expect("should be able to create challenge directory");

    log::info!("starting temporary HTTP challenge server");
    let srv = HttpServer::new(|| {
        App::new()
            .wrap(Logger::default().log_target("acme_http_server"))
            .service(Files::new("/.well-known/acme-challenge", CHALLENGE_DIR).show_files_listing())
    })
    .bind(("0.0.0.0", 80))?
    .workers(1)
    .disable_signals()
    .shutdown_timeout(0)
    .run();

    let srv_handle = srv.handle();
    let srv_task = actix_web::rt::spawn(srv);

    log::info!("fetching LetsEncrypt directory");
    // Create a directory entrypoint.
    // Note: Change to `DirectoryUrl::LetsEncrypt` in production.
    let dir = Directory::fetch(DirectoryUrl::LetsEncryptStaging).await?;

    log::info!("generating signing key and registering with ACME provider");
    // You should write the key to disk and use `load_account` afterwards.
    let acc = dir
        .register_account(
            AccountOptions {
                email: CONTACT_EMAIL.map(str::to_owned),
                ..Default::default()
            },
            |tos| async move {
                log::info!("agreeing to terms of service at {tos}");
                Ok(tos)
            },
        )
        .await?;

    log::info!("ordering a new TLS certificate for our domains");
    let mut options = IssueOptions::new(DOMAINS.iter().copied());
    options.challenge_types = vec![ChallengeType::Http01];

    let domain_key = DomainKey::generate_p256();
    let resolver = acme_engine::dns::SystemTxtResolver::from_system_conf()?;

    // Rehearses the install path, orders, publishes every challenge,
    // validates, finalizes with a CSR and downloads the issued certificate.
    let bundle = acc
        .issue_certificate(&domain_key, &options, &FileProvisioner, &resolver)
        .await?;

    // NOTE: Here you would spawn your HTTP server and use the private key
    // (`domain_key.to_pem()`) plus certificate to configure TLS on it. For
    // this example, we just print the certificate and exit.

    println!("{}", bundle.cert);
    println!("{}", bundle.chain);

    // Stop temporary ACME server.
    srv_handle.stop(true).await;
    srv_task.await??;

    // Delete challenge dir.
    fs::remove_dir_all(CHALLENGE_DIR).await?;

    Ok(())
}
