use crate::{
    admin::{self, Admin},
    admission::{AdmissionController, AdmissionMetrics},
    core::{ratelimit, AuthorizationGate, GoDuration, RateLimitPolicy},
    gate::GateLayer,
    index::{self, ConfigProvider, PathMappings, RouteSynthesizer},
    registry::ConsulClient,
    token::TokenVerifier,
    watcher::{RegistryWatcher, WatcherConfig, WatcherMetrics},
};
use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{net::TcpListener, time};
use tower::Layer;
use tracing::{info, info_span, Instrument};

const EVICTION_PERIOD: time::Duration = time::Duration::from_secs(10);

/// How long background tasks may take to finish once shutdown begins.
const SHUTDOWN_GRACE: time::Duration = time::Duration::from_secs(60);

#[derive(Debug, Parser)]
#[clap(name = "gateway-controller", about = "A gateway routing and admission controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "gateway=info,warn",
        env = "GATEWAY_CONTROLLER_LOG"
    )]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "http://127.0.0.1:8500", env = "CONSUL_HTTP_ADDR")]
    consul_addr: String,

    #[clap(long, env = "CONSUL_DATACENTER")]
    consul_datacenter: Option<String>,

    /// Serves health, readiness, metrics, and the current route snapshot.
    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    #[clap(long, default_value = "30s")]
    poll_interval: GoDuration,

    /// Caps the delay between polls after consecutive registry failures.
    #[clap(long, default_value = "60s")]
    max_backoff: GoDuration,

    /// Bounds each registry request.
    #[clap(long, default_value = "10s")]
    registry_timeout: GoDuration,

    /// Only instances carrying this tag are routed to.
    #[clap(long, default_value = "dapr")]
    mesh_tag: String,

    /// Registry services that are never routed to.
    #[clap(long, default_values = ["consul", "gateway"])]
    exclude_service: Vec<String>,

    /// A JSON file of rate-limit policies, overlaid onto the defaults.
    #[clap(long)]
    ratelimit_config: Option<PathBuf>,

    /// A `name=url` backend to route to when the registry yields nothing.
    #[clap(long)]
    static_service: Vec<StaticService>,

    /// The HMAC secret that bearer tokens are signed with.
    #[clap(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    /// When set, bearer tokens must carry this issuer.
    #[clap(long, env = "JWT_ISSUER")]
    jwt_issuer: Option<String>,

    /// When set, bearer tokens must carry this audience.
    #[clap(long, env = "JWT_AUDIENCE")]
    jwt_audience: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct StaticService {
    name: String,
    url: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            consul_addr,
            consul_datacenter,
            admin_addr,
            poll_interval,
            max_backoff,
            registry_timeout,
            mesh_tag,
            exclude_service,
            ratelimit_config,
            static_service,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
        } = self;

        init_tracing(&log_level, log_format)?;

        ensure!(!jwt_secret.trim().is_empty(), "--jwt-secret must not be empty");
        let tokens =
            TokenVerifier::new(&jwt_secret, jwt_issuer.as_deref(), jwt_audience.as_deref());

        // Refuse to start with an undefined throttling configuration.
        let policies = load_policies(ratelimit_config.as_ref())?;

        let mut prom = <Registry>::default();
        let provider = ConfigProvider::shared();
        index::metrics::register(&mut prom, provider.clone());
        let watcher_metrics = WatcherMetrics::register(&mut prom);
        let admission_metrics = AdmissionMetrics::register(&mut prom);

        let admission = Arc::new(
            AdmissionController::from_policies(policies)?.with_metrics(admission_metrics),
        );

        let registry = ConsulClient::new(&consul_addr, consul_datacenter)?;
        let fallback = static_service
            .into_iter()
            .map(|StaticService { name, url }| (name, url))
            .collect::<BTreeMap<_, _>>();
        let synthesizer = RouteSynthesizer::new(PathMappings::default(), fallback);
        let watcher = RegistryWatcher::new(
            registry,
            synthesizer,
            provider.clone(),
            WatcherConfig {
                poll_interval: non_zero("poll-interval", poll_interval)?,
                max_backoff: non_zero("max-backoff", max_backoff)?,
                timeout: non_zero("registry-timeout", registry_timeout)?,
                mesh_tag,
                exclude: exclude_service,
            },
            watcher_metrics,
        );

        let listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin server on {admin_addr}"))?;

        let (signal, drain) = drain::channel();

        tokio::spawn(watcher.run(drain.clone()).instrument(info_span!("watcher")));

        tokio::spawn(
            evict_idle(admission.clone(), drain.clone()).instrument(info_span!("admission")),
        );

        let svc = GateLayer::new(admission, AuthorizationGate::default(), tokens)
            .layer(Admin::new(provider, Arc::new(prom)));
        tokio::spawn(admin::serve(listener, svc, drain));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        shutdown_signal().await?;
        info!("Shutting down");
        if time::timeout(SHUTDOWN_GRACE, signal.drain()).await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

fn init_tracing(log_level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(anyhow::Error::msg)
}

fn non_zero(flag: &str, duration: GoDuration) -> Result<time::Duration> {
    let duration = time::Duration::from(duration);
    ensure!(!duration.is_zero(), "--{flag} must be greater than zero");
    Ok(duration)
}

fn load_policies(path: Option<&PathBuf>) -> Result<BTreeMap<String, RateLimitPolicy>> {
    let overrides = match path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_slice::<BTreeMap<String, RateLimitPolicy>>(&bytes)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => BTreeMap::new(),
    };
    let policies = ratelimit::merge_policies(overrides)?;
    for (name, policy) in &policies {
        info!(policy = %name, kind = policy.kind(), "Loaded rate-limit policy");
    }
    Ok(policies)
}

/// Drops idle rate-limit partitions until shutdown.
async fn evict_idle(admission: Arc<AdmissionController>, drain: drain::Watch) {
    let mut interval = time::interval(EVICTION_PERIOD);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                admission.evict_idle();
            }
            _ = &mut shutdown => return,
        }
    }
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

// === impl StaticService ===

impl std::str::FromStr for StaticService {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((name, url)) = s.split_once('=') else {
            bail!("expected name=url: {s}");
        };
        let (name, url) = (name.trim(), url.trim());
        ensure!(!name.is_empty(), "service name must not be empty: {s}");
        ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "service url must be http or https: {s}"
        );
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
        })
    }
}
