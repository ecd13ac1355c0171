use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use twinlink::clock::SystemClock;
use twinlink::config::{CoreConfig, SystemClientConfig};
use twinlink::external::{ExternalClients, MemExternalClient};
use twinlink::http::{AppState, router};
use twinlink::id::UuidGenerator;
use twinlink::oauth::{
    HttpUpstreamConfig, HttpUpstreamOauthClient, MemUpstreamOauthClient, UpstreamOauthClient,
};
use twinlink::password::Argon2PasswordService;
use twinlink::services::{Dependencies, Services};
use twinlink::types::Provider;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "twinlink")]
#[command(about = "links one account to your game platform accounts, and lets apps sign in with it")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "TWINLINK_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to
    #[arg(short, long, env = "TWINLINK_PORT", default_value = "3000")]
    port: u16,

    /// Public base URL (e.g., https://id.example.com)
    /// If not set, defaults to http://HOST:PORT
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,

    /// Session lifetime in seconds
    #[arg(long, env = "SESSION_TTL", default_value = "2592000")]
    session_ttl: u64,

    /// Authorization code / pending consent lifetime in seconds
    #[arg(long, env = "OAUTH_CODE_TTL", default_value = "600")]
    oauth_code_ttl: u64,

    /// Upstream oauth state lifetime in seconds
    #[arg(long, env = "OAUTH_STATE_TTL", default_value = "600")]
    oauth_state_ttl: u64,

    /// Access token lifetime in seconds (0 = no expiration)
    #[arg(long, env = "OAUTH_TOKEN_EXPIRATION", default_value = "0")]
    oauth_token_expiration: u64,

    /// Deadline for calls to external providers, in seconds
    #[arg(long, env = "EXTERNAL_TIMEOUT", default_value = "10")]
    external_timeout: u64,

    /// Bearer key granting a system context
    #[arg(long, env = "SYSTEM_KEY")]
    system_key: Option<String>,

    /// First-party oauth client as key|callback_uri|secret, may be repeated
    #[arg(long = "client", env = "OAUTH_SYSTEM_CLIENTS", value_delimiter = ',')]
    clients: Vec<SystemClientConfig>,

    /// Provider C authorization endpoint
    #[arg(long, env = "UPSTREAM_AUTHORIZE_URI")]
    upstream_authorize_uri: Option<Url>,

    /// Provider C token endpoint
    #[arg(long, env = "UPSTREAM_TOKEN_URI")]
    upstream_token_uri: Option<Url>,

    /// Provider C profile endpoint
    #[arg(long, env = "UPSTREAM_PROFILE_URI")]
    upstream_profile_uri: Option<Url>,

    /// Our client id at provider C
    #[arg(long, env = "UPSTREAM_CLIENT_ID", default_value = "twinlink")]
    upstream_client_id: String,

    /// Our client secret at provider C
    #[arg(long, env = "UPSTREAM_CLIENT_SECRET")]
    upstream_client_secret: Option<String>,

    /// Scope requested from provider C
    #[arg(long, env = "UPSTREAM_SCOPE")]
    upstream_scope: Option<String>,
}

fn ttl(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn upstream_client(args: &Args, config: &CoreConfig) -> Result<Arc<dyn UpstreamOauthClient>> {
    match (
        &args.upstream_authorize_uri,
        &args.upstream_token_uri,
        &args.upstream_profile_uri,
        &args.upstream_client_secret,
    ) {
        (Some(authorize_uri), Some(token_uri), Some(profile_uri), Some(client_secret)) => {
            tracing::info!("provider C oauth at {}", authorize_uri);
            Ok(Arc::new(HttpUpstreamOauthClient::new(HttpUpstreamConfig {
                authorize_uri: authorize_uri.clone(),
                token_uri: token_uri.clone(),
                profile_uri: profile_uri.clone(),
                client_id: args.upstream_client_id.clone(),
                client_secret: client_secret.clone(),
                redirect_uri: config.upstream_redirect_uri.clone(),
                scope: args.upstream_scope.clone(),
            })))
        }
        (None, None, None, None) => {
            // nothing serves this path, so provider C flows stop at the redirect
            tracing::warn!(
                "provider C oauth not configured, using the in-memory upstream: \
                 /oauth/upstream/start redirects to a page that does not exist and \
                 provider C links and logins cannot complete"
            );
            let authorize_uri = config.upstream_redirect_uri.join("/dev/upstream/authorize")?;
            Ok(Arc::new(MemUpstreamOauthClient::new(authorize_uri)))
        }
        _ => Err(anyhow::anyhow!(
            "UPSTREAM_AUTHORIZE_URI, UPSTREAM_TOKEN_URI, UPSTREAM_PROFILE_URI and UPSTREAM_CLIENT_SECRET must be set together"
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twinlink=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // we pass this to TcpListener::bind() which accepts ToSocketAddrs,
    // so hostnames like "localhost" get resolved properly
    let bind_addr = format!("{}:{}", args.host, args.port);
    let base_url = args
        .public_url
        .as_deref()
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port));
    let public_url = Url::parse(&base_url)?;

    let mut config = CoreConfig::for_public_url(&public_url)?;
    config.session_ttl = Duration::from_secs(args.session_ttl);
    config.code_ttl = Duration::from_secs(args.oauth_code_ttl);
    config.state_ttl = Duration::from_secs(args.oauth_state_ttl);
    config.access_token_ttl = ttl(args.oauth_token_expiration);
    config.external_timeout = Duration::from_secs(args.external_timeout);
    config.system_key = args.system_key.clone();
    config.upstream_client_id = args.upstream_client_id.clone();

    if config.system_key.is_none() {
        tracing::warn!("no SYSTEM_KEY set, system-only operations are unreachable over http");
    }

    // scraping clients for A/B/C live outside this crate
    tracing::warn!(
        "external providers are served by empty in-memory clients: \
         credential and session key links fail until real clients are wired in"
    );
    let external = ExternalClients::new(
        Arc::new(MemExternalClient::new(Provider::A)),
        Arc::new(MemExternalClient::new(Provider::B)),
        Arc::new(MemExternalClient::new(Provider::C)),
    );

    let services = Services::new(
        &config,
        Dependencies {
            ids: Arc::new(UuidGenerator),
            clock: Arc::new(SystemClock),
            passwords: Arc::new(Argon2PasswordService::new()),
            external,
            upstream: upstream_client(&args, &config)?,
        },
    );
    services.install_system_clients(&args.clients).await?;

    let shutdown = CancellationToken::new();
    let sweeper = services.spawn_sweeper(Duration::from_secs(60), shutdown.clone());

    let state = AppState::new(services, &base_url, config.session_ttl);
    let app = router(state, true)?;

    tracing::info!("twinlink listening on {}", bind_addr);
    tracing::info!(
        "Authorization server metadata: {}/.well-known/oauth-authorization-server",
        base_url
    );
    tracing::info!("Provider C callback: {}", config.upstream_redirect_uri);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server ready at {}", base_url);

    // into_make_service_with_connect_info gives us the peer ip for rate limiting fallback
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown.cancel();
        }
    })
    .await?;

    shutdown.cancel();
    sweeper.await?;
    Ok(())
}
