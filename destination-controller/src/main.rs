#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use linkerd_destination_controller::{grpc, index, k8s, Discover};
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, sync::Arc};
use tonic::transport::Server;
use tracing::{info, info_span, instrument, Instrument};

#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[derive(Debug, Parser)]
#[clap(name = "destination", about = "Serves destination discovery to mesh proxies")]
struct Args {
    #[clap(
        long,
        default_value = "linkerd=info,warn",
        env = "LINKERD_DESTINATION_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    #[clap(long, default_value = "0.0.0.0:8086")]
    grpc_addr: SocketAddr,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    #[clap(long, default_value = "cluster.local")]
    identity_trust_domain: String,

    #[clap(long, default_value = "linkerd")]
    control_plane_namespace: String,

    /// Upgrade meshed HTTP/1 connections to HTTP/2 between proxies.
    #[clap(long)]
    enable_h2_upgrade: bool,

    /// Ports that are opaque for every workload unless overridden by
    /// annotation.
    #[clap(long, default_value = "")]
    default_opaque_ports: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        admin,
        client,
        log_level,
        log_format,
        grpc_addr,
        cluster_domain,
        identity_trust_domain,
        control_plane_namespace,
        enable_h2_upgrade,
        default_opaque_ports,
    } = Args::parse();

    let default_opaque_ports = index::ports::parse_portset(&default_opaque_ports)?;
    let cluster_info = Arc::new(index::ClusterInfo {
        control_plane_ns: control_plane_namespace,
        dns_domain: cluster_domain.clone(),
        identity_domain: identity_trust_domain,
        default_opaque_ports,
    });

    // Build the index data structures that process events from the resource
    // watches and publish lookups for the gRPC server.
    let endpoints_index = index::endpoints::Index::shared(cluster_info);
    let profiles_index = index::profiles::Index::shared();
    let servers_index = index::server::Index::shared();

    let mut prom = <Registry>::default();
    let grpc_metrics =
        grpc::ServerMetrics::register(prom.sub_registry_with_prefix("grpc_server"));
    index::metrics::register(
        prom.sub_registry_with_prefix("discovery_index"),
        endpoints_index.clone(),
        profiles_index.clone(),
    );

    let mut runtime = kubert::Runtime::builder()
        .with_log(log_level, log_format)
        .with_admin(admin.into_builder().with_prometheus(prom))
        .with_client(client)
        .build()
        .await?;

    // Spawn resource indexers. Pods and Servers feed both the endpoints
    // index and the server index, each through its own watch.
    let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(endpoints_index.clone(), pods).instrument(info_span!("pods")),
    );

    let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(servers_index.clone(), pods).instrument(info_span!("pods")),
    );

    let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(endpoints_index.clone(), services)
            .instrument(info_span!("services")),
    );

    let endpoints = runtime.watch_all::<k8s::Endpoints>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(endpoints_index.clone(), endpoints)
            .instrument(info_span!("endpoints")),
    );

    let servers = runtime.watch_all::<k8s::policy::Server>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(endpoints_index.clone(), servers)
            .instrument(info_span!("servers")),
    );

    let servers = runtime.watch_all::<k8s::policy::Server>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(servers_index.clone(), servers).instrument(info_span!("servers")),
    );

    let profiles = runtime.watch_all::<k8s::ServiceProfile>(watcher::Config::default());
    tokio::spawn(
        kubert::index::namespaced(profiles_index.clone(), profiles)
            .instrument(info_span!("serviceprofiles")),
    );

    let nodes = runtime.watch_all::<k8s::Node>(watcher::Config::default());
    tokio::spawn(
        kubert::index::cluster(endpoints_index.clone(), nodes)
            .instrument(info_span!("nodes")),
    );

    // Run the gRPC server, serving results by looking up against the index
    // handles.
    tokio::spawn(serve(
        grpc_addr,
        cluster_domain,
        enable_h2_upgrade,
        Discover::new(endpoints_index, profiles_index, servers_index),
        grpc_metrics,
        runtime.shutdown_handle(),
    ));

    // Block the main thread on the shutdown signal. Once it fires, wait for
    // the background tasks to complete before exiting.
    if runtime.run().await.is_err() {
        bail!("Aborted");
    }

    Ok(())
}

#[instrument(skip_all, fields(port = %addr.port()))]
async fn serve(
    addr: SocketAddr,
    cluster_domain: String,
    enable_h2_upgrade: bool,
    discover: Discover,
    metrics: grpc::ServerMetrics,
    drain: drain::Watch,
) -> Result<()> {
    let svc = grpc::DestinationServer::new(
        discover,
        cluster_domain,
        enable_h2_upgrade,
        metrics,
        drain.clone(),
    )
    .svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder().add_service(svc).serve_with_shutdown(addr, close_rx.map(|_| {}));
    }

    info!(%addr, "destination gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?
        }
    }
    Ok(())
}
