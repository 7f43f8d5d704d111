//! Controller to target replication over real HTTP, with in-memory clusters on both sides.

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, ObjectReference, Service,
    ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::api::WatchEvent;
use service_sync::cluster::{InMemoryCluster, Mutation};
use service_sync::config::{ConfigHandle, parse_config};
use service_sync::controller::{Controller, ControllerContext, DispatchReport, Dispatcher};
use service_sync::resources::{ResourcePair, SYNCED_ANNOTATION, SYNCED_ANNOTATION_VALUE};
use service_sync::shutdown::Shutdown;
use service_sync::target::{SyncReceiver, TargetServer};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        uid: Some(format!("{}-{}-uid", namespace, name)),
        resource_version: Some("4711".to_string()),
        ..Default::default()
    }
}

fn service(namespace: &str, name: &str) -> Service {
    Service {
        metadata: meta(namespace, name),
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.0.0.40".to_string()),
            cluster_ips: Some(vec!["10.0.0.40".to_string()]),
            selector: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
            ports: Some(vec![ServicePort {
                port: 80,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoints(namespace: &str, name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: meta(namespace, name),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        node_name: Some("node-a".to_string()),
                        target_ref: Some(ObjectReference {
                            kind: Some("Pod".to_string()),
                            name: Some(format!("{}-pod", name)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(vec![EndpointPort {
                port: 8080,
                ..Default::default()
            }]),
            ..Default::default()
        }]),
    }
}

fn addresses(endpoints: &Endpoints) -> Vec<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|address| address.ip.clone())
        .collect()
}

async fn start_target(
    cluster: Arc<InMemoryCluster>,
    shutdown: &Shutdown,
) -> (String, JoinHandle<service_sync::SyncResult<()>>) {
    let server = TargetServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        SyncReceiver::new(cluster),
    )
    .await
    .unwrap();
    let base = format!("http://{}", server.local_addr().unwrap());
    let handle = tokio::spawn(server.serve(shutdown.subscribe()));
    (base, handle)
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            TIMEOUT
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn dispatch_create_update_and_skip() {
    let target = Arc::new(InMemoryCluster::new());
    let shutdown = Shutdown::new();
    let (base, server) = start_target(target.clone(), &shutdown).await;
    let peers = vec![base];
    let dispatcher = Dispatcher::new().unwrap();

    // First push creates namespace, Service and Endpoints.
    let pair = ResourcePair::new(
        service("shop", "cart"),
        endpoints("shop", "cart", &["10.4.0.7", "10.4.1.9"]),
    );
    let report = dispatcher.dispatch(&pair, &peers, TIMEOUT).await.unwrap();
    assert_eq!(report.delivered, 1);

    let created = target.service("shop", "cart").unwrap();
    assert_eq!(
        created.annotations().get(SYNCED_ANNOTATION).map(String::as_str),
        Some(SYNCED_ANNOTATION_VALUE)
    );
    assert_ne!(created.metadata.uid.as_deref(), Some("shop-cart-uid"));
    let spec = created.spec.as_ref().unwrap();
    assert!(spec.cluster_ip.is_none());
    assert!(spec.cluster_ips.is_none());
    assert!(target.namespace("shop").is_some());

    // Second push only replaces the Endpoints.
    let moved = ResourcePair::new(
        service("shop", "cart"),
        endpoints("shop", "cart", &["10.4.3.1"]),
    );
    let report = dispatcher.dispatch(&moved, &peers, TIMEOUT).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(
        addresses(&target.endpoints("shop", "cart").unwrap()),
        vec!["10.4.3.1"]
    );
    let stored = target.endpoints("shop", "cart").unwrap();
    assert!(stored.subsets.as_ref().unwrap()[0].addresses.as_ref().unwrap()[0]
        .node_name
        .is_none());

    // A Service the target did not create is never overwritten.
    target.seed_service(service("shop", "checkout"));
    let foreign = ResourcePair::new(
        service("shop", "checkout"),
        endpoints("shop", "checkout", &["10.4.9.9"]),
    );
    let report = dispatcher.dispatch(&foreign, &peers, TIMEOUT).await.unwrap();
    assert_eq!(
        report,
        DispatchReport {
            delivered: 0,
            skipped: 1,
            failed: 0
        }
    );
    assert!(target.endpoints("shop", "checkout").is_none());

    assert_eq!(
        target.mutations(),
        vec![
            Mutation::CreateNamespace("shop".into()),
            Mutation::CreateService("shop/cart".into()),
            Mutation::CreateEndpoints("shop/cart".into()),
            Mutation::ReplaceEndpoints("shop/cart".into()),
        ]
    );

    shutdown.trigger();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn controller_replicates_to_every_target() {
    let source = Arc::new(InMemoryCluster::new());
    source.seed_namespace("shop");
    source.seed_service(service("shop", "cart"));
    source.seed_service(service("shop", "kube-proxy"));
    source.seed_service(service("billing", "ledger"));
    source.push_watch(vec![
        Ok(WatchEvent::Added(endpoints("shop", "kube-proxy", &["10.4.0.1"]))),
        Ok(WatchEvent::Added(endpoints("billing", "ledger", &["10.4.0.2"]))),
        Ok(WatchEvent::Added(endpoints("shop", "cart", &["10.4.0.7"]))),
    ]);
    source.push_watch(vec![Ok(WatchEvent::Modified(endpoints(
        "shop",
        "cart",
        &["10.4.0.7", "10.4.0.8"],
    )))]);

    let shutdown = Shutdown::new();
    let europe = Arc::new(InMemoryCluster::new());
    let asia = Arc::new(InMemoryCluster::new());
    let (europe_url, europe_server) = start_target(europe.clone(), &shutdown).await;
    let (asia_url, asia_server) = start_target(asia.clone(), &shutdown).await;

    let yaml = format!(
        "runMode: controller\nsyncNamespaces: [shop]\nskipServiceRegex: \"^kube-\"\npeers:\n  - {}\n  - {}\n",
        europe_url, asia_url
    );
    let config = ConfigHandle::new(parse_config(&yaml).unwrap());
    let controller = Controller::new(ControllerContext::new(source.clone(), config)).unwrap();
    let running = tokio::spawn(controller.run(shutdown.subscribe()));

    for target in [&europe, &asia] {
        eventually(|| {
            target
                .endpoints("shop", "cart")
                .is_some_and(|ep| addresses(&ep).len() == 2)
        })
        .await;
        assert!(target.service("shop", "kube-proxy").is_none());
        assert!(target.service("billing", "ledger").is_none());
    }

    shutdown.trigger();
    tokio::time::timeout(TIMEOUT, running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    europe_server.await.unwrap().unwrap();
    asia_server.await.unwrap().unwrap();

    assert!(source.watch_count() >= 2);
    assert!(source.mutations().is_empty());
}
