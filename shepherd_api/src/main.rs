//! Composition root.
//!
//! Process-wide state is initialized in dependency order (config, db,
//! secrets, providers, pools, loops, http server) and torn down in
//! reverse with a bounded drain deadline. Every background loop hangs off
//! a worker pool shutdown signal; nothing is spawned naked.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware, web, App, HttpServer};
use futures::future::BoxFuture;
use log::{error, info, warn};
use uuid::Uuid;

use shepherd_api::{auth, configure, errors, AppState};
use shepherd_core::crypto::{session_secret, SecretBox};
use shepherd_core::detector::Detector;
use shepherd_core::dispatch::{
    run_queue_loop, CapabilityRefresher, DispatchConfig, Dispatcher, ProviderRegistry,
};
use shepherd_core::reconcile::Reconciler;
use shepherd_core::{db, hygiene, Db, WorkerPool};
use shepherd_definitions::{Cluster, ShepherdConfig};
use shepherd_provider::types::VirtualMachine;
use shepherd_provider::{client, watcher, ClusterCache, KubeVirtProvider};

/// Build a provider for one cluster row from its sealed credentials.
async fn build_provider(
    secrets: &SecretBox,
    cluster: &Cluster,
) -> shepherd_core::Result<(Arc<KubeVirtProvider>, kube::Client)> {
    let kubeconfig = secrets.open(&cluster.credentials)?;
    let kubeconfig = String::from_utf8(kubeconfig).map_err(|_| {
        shepherd_definitions::Error::Internal("credential blob is not utf-8".into())
    })?;
    let kube_client = client::from_kubeconfig_yaml(&kubeconfig).await?;
    let provider = Arc::new(KubeVirtProvider::new(
        kube_client.clone(),
        cluster.name.clone(),
        &cluster.effective_features(),
    ));
    Ok((provider, kube_client))
}

/// Connect every registered cluster: provider + cache + watcher loop.
async fn connect_clusters(
    db: &Db,
    secrets: &SecretBox,
    registry: &Arc<ProviderRegistry>,
    pool: &WorkerPool,
) -> shepherd_core::Result<()> {
    for cluster in db::clusters::list(db.pool()).await? {
        match build_provider(secrets, &cluster).await {
            Ok((provider, kube_client)) => {
                let cache = ClusterCache::new();
                registry.register(cluster.id, provider, cache.clone());
                let api = kube::Api::<VirtualMachine>::all(kube_client);
                let shutdown = pool.shutdown_signal();
                let name = cluster.name.clone();
                pool.submit_detached(async move {
                    watcher::run(name, api, cache, shutdown).await;
                })
                .await?;
                info!("connected cluster {}", cluster.name);
            }
            Err(e) => {
                // a broken cluster must not block startup; the detector
                // keeps probing and an admin can fix the credentials
                warn!("cannot connect cluster {}: {}", cluster.name, e);
            }
        }
    }
    Ok(())
}

/// Rebuilds a cluster's provider after the detector notices a version or
/// capability change.
struct Refresher {
    db: Db,
    secrets: SecretBox,
    registry: Arc<ProviderRegistry>,
}

impl CapabilityRefresher for Refresher {
    fn refresh<'a>(&'a self, cluster_id: Uuid) -> BoxFuture<'a, shepherd_core::Result<()>> {
        Box::pin(async move {
            let Some(cluster) = db::clusters::get(self.db.pool(), cluster_id).await? else {
                return Ok(());
            };
            let (provider, _) = build_provider(&self.secrets, &cluster).await?;
            self.registry.replace_provider(cluster_id, provider);
            info!("refreshed provider for cluster {}", cluster.name);
            Ok(())
        })
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // logging first, everything else reports through it
    if env::var("RUST_LOG").is_err() {
        let level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
        env::set_var(
            "RUST_LOG",
            format!("actix_web=info,shepherd_api={lv},shepherd_core={lv},shepherd_provider={lv},kube=info", lv = level),
        );
    }
    env_logger::init();

    let cfg = match ShepherdConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration invalid: {}", e);
            std::process::exit(2);
        }
    };
    errors::set_verbose_errors(cfg.verbose_errors);

    let db = match Db::connect(&cfg).await {
        Ok(db) => db,
        Err(e) => {
            error!("cannot connect to postgres: {}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = db.migrate().await {
        error!("migrations failed: {}", e);
        std::process::exit(2);
    }
    if let Err(e) = shepherd_core::seed::run(&db).await {
        error!("seeding failed: {}", e);
        std::process::exit(2);
    }

    let secrets = SecretBox::from_config(cfg.encryption_key.as_deref(), &cfg.state_dir)
        .expect("encryption key");
    let jwt_secret =
        session_secret(cfg.session_secret.as_deref(), &cfg.state_dir).expect("session secret");
    let jwt = auth::JwtKeys::new(&jwt_secret, Arc::new(auth::NoRevocation));

    let general_pool = WorkerPool::new("general", cfg.general_pool_size);
    let cluster_pool = WorkerPool::new("cluster-api", cfg.cluster_pool_size);

    let registry = Arc::new(ProviderRegistry::new());
    if let Err(e) = connect_clusters(&db, &secrets, &registry, &general_pool).await {
        error!("cluster connection sweep failed: {}", e);
    }

    let dispatcher = Arc::new(
        Dispatcher::new(
            db.clone(),
            Arc::clone(&registry),
            DispatchConfig {
                completed_retention_secs: cfg.completed_retention_hours * 3600,
                discarded_retention_secs: cfg.discarded_retention_days * 24 * 3600,
                worker_timeout_secs: cfg.worker_timeout_secs,
            },
        )
        .with_refresher(Arc::new(Refresher {
            db: db.clone(),
            secrets: secrets.clone(),
            registry: Arc::clone(&registry),
        })),
    );

    // background loops: queue drain, detector, reconciler, hygiene
    {
        let db = db.clone();
        let pool = cluster_pool.clone();
        let dispatcher = Arc::clone(&dispatcher);
        let shutdown = general_pool.shutdown_signal();
        general_pool
            .submit_detached(async move {
                run_queue_loop(db, pool, dispatcher, shutdown).await;
            })
            .await
            .expect("spawn queue loop");
    }
    {
        let detector = Arc::new(Detector::new(db.clone(), Arc::clone(&registry)));
        let shutdown = general_pool.shutdown_signal();
        general_pool
            .submit_detached(async move { detector.run(shutdown).await })
            .await
            .expect("spawn detector");
    }
    {
        let reconciler = Arc::new(Reconciler::new(db.clone(), Arc::clone(&registry)));
        let shutdown = general_pool.shutdown_signal();
        general_pool
            .submit_detached(async move { reconciler.run(shutdown).await })
            .await
            .expect("spawn reconciler");
    }
    {
        let db = db.clone();
        let shutdown = general_pool.shutdown_signal();
        general_pool
            .submit_detached(async move { hygiene::run(db, shutdown).await })
            .await
            .expect("spawn hygiene loop");
    }

    let state = AppState::new(
        db,
        registry,
        jwt,
        secrets,
        cfg.clone(),
        general_pool.clone(),
        cluster_pool.clone(),
    );

    let port = cfg.server_port;
    let request_timeout = Duration::from_secs(cfg.request_timeout_secs);
    info!("starting http server on 0.0.0.0:{}", port);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(
                middleware::Logger::default()
                    .exclude("/health")
                    .exclude("/favicon.ico"),
            )
            .configure(configure)
    })
    .client_request_timeout(request_timeout)
    .bind(("0.0.0.0", port))?
    .shutdown_timeout(10)
    .run();

    let result = server.await;

    // reverse-order teardown with a bounded drain
    info!("http server stopped, draining workers");
    cluster_pool.shutdown(Duration::from_secs(30)).await;
    general_pool.shutdown(Duration::from_secs(30)).await;
    info!("shutdown complete");
    result
}
