//! gRPC round trips against a server on a loopback port.

use futures::StreamExt;
use futures::channel::mpsc;
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube_runtime::watcher;
use pod_relay::{ControllerState, PodController, RelayConfig};
use pod_status::bot::PodBot;
use pod_status::proto::PodStatRequest;
use pod_status::proto::pod_stat_intf_client::PodStatIntfClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

type Feed = mpsc::UnboundedSender<Result<watcher::Event<Pod>, watcher::Error>>;

struct Relay {
    controller: Arc<PodController>,
    feed: Feed,
    endpoint: String,
    stop: CancellationToken,
}

fn pod(name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn start_relay(pods: &[Pod]) -> Relay {
    let (feed, rx) = mpsc::unbounded();
    let controller = PodController::new(rx.boxed(), RelayConfig::default()).expect("valid config");
    let stop = CancellationToken::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let endpoint = format!("http://{}", listener.local_addr().expect("addr"));
    tokio::spawn(pod_status::server::serve(Arc::clone(&controller), listener, stop.clone()));
    tokio::spawn(Arc::clone(&controller).run(stop.clone()));

    feed.unbounded_send(Ok(watcher::Event::Init)).expect("feed");
    for pod in pods {
        feed.unbounded_send(Ok(watcher::Event::InitApply(pod.clone()))).expect("feed");
    }
    feed.unbounded_send(Ok(watcher::Event::InitDone)).expect("feed");

    let mut state = controller.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ControllerState::Running))
        .await
        .expect("running in time")
        .expect("state channel open");

    Relay {
        controller,
        feed,
        endpoint,
        stop,
    }
}

async fn wait_for_subscribers(controller: &PodController, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while controller.registry().len().await != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber count reached");
}

#[tokio::test]
async fn test_listen_receives_updates_over_the_wire() {
    let relay = start_relay(&[]).await;
    let mut client = PodStatIntfClient::connect(relay.endpoint.clone()).await.expect("connect");

    let mut stream = client
        .listen_pod_status(PodStatRequest {
            clientid: "bot-1".to_string(),
            name: String::new(),
        })
        .await
        .expect("listen")
        .into_inner();
    wait_for_subscribers(&relay.controller, 1).await;

    relay
        .feed
        .unbounded_send(Ok(watcher::Event::Apply(pod("web-1", "Pending"))))
        .expect("feed");

    let reply = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("reply in time")
        .expect("stream ok")
        .expect("one reply");
    assert_eq!(reply.message, "create");
    assert_eq!(reply.podstat.expect("podstat").podname, "web-1");

    // Client hangs up: the server side tears the subscription down
    drop(stream);
    wait_for_subscribers(&relay.controller, 0).await;

    relay.stop.cancel();
}

#[tokio::test]
async fn test_shutdown_ends_client_streams() {
    let relay = start_relay(&[pod("web-1", "Running")]).await;
    let client = PodStatIntfClient::connect(relay.endpoint.clone()).await.expect("connect");

    let bot = PodBot::numbered(0);
    let run = {
        let bot = bot.clone();
        tokio::spawn(async move { bot.run(client, CancellationToken::new()).await })
    };
    wait_for_subscribers(&relay.controller, 1).await;

    relay.stop.cancel();
    let received = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("bot finished")
        .expect("bot task")
        .expect("clean end of stream");
    // The initial create may or may not land before the bot subscribed
    assert!(received <= 1, "received {received}");
}

#[tokio::test]
async fn test_snapshot_rpcs_over_the_wire() {
    let relay = start_relay(&[pod("web-1", "Running"), pod("web-2", "Pending")]).await;
    let mut client = PodStatIntfClient::connect(relay.endpoint.clone()).await.expect("connect");

    let mut all = client
        .get_all_pod_status(PodStatRequest::default())
        .await
        .expect("snapshot")
        .into_inner();
    let mut names = Vec::new();
    while let Some(reply) = all.message().await.expect("stream ok") {
        names.push(reply.podstat.expect("podstat").podname);
    }
    assert_eq!(names, vec!["web-1", "web-2"]);

    let one = client
        .get_pod_status_by_name(PodStatRequest {
            clientid: String::new(),
            name: "web-2".to_string(),
        })
        .await
        .expect("found")
        .into_inner();
    assert_eq!(one.podstat.expect("podstat").podstate, "Pending");

    let missing = client
        .get_pod_status_by_name(PodStatRequest {
            clientid: String::new(),
            name: "web-9".to_string(),
        })
        .await
        .expect_err("missing pod");
    assert_eq!(missing.code(), tonic::Code::NotFound);

    relay.stop.cancel();
}

#[tokio::test]
#[ignore] // Requires a cluster reachable through the default kubeconfig
async fn test_relay_against_live_cluster() {
    let client = pod_status::make_client(None).await.expect("kube client");
    let controller =
        PodController::for_namespace(client, RelayConfig::for_namespace("kube-system")).expect("controller");
    let stop = CancellationToken::new();
    let run = tokio::spawn(Arc::clone(&controller).run(stop.clone()));

    let mut state = controller.subscribe_state();
    tokio::time::timeout(Duration::from_secs(60), state.wait_for(|s| *s == ControllerState::Running))
        .await
        .expect("synced in time")
        .expect("state channel open");
    assert!(!controller.snapshot().expect("synced").is_empty());

    stop.cancel();
    run.await.expect("run task").expect("clean stop");
}
