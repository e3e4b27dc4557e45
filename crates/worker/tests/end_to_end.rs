//! A real controller and worker talking over HTTP on ephemeral ports

use chatserve_common::config::{ControllerConfig, WorkerConfig};
use chatserve_controller::{ControllerServer, ControllerState, WorkerClient, WorkerRegistry};
use chatserve_proto::{FrameDecoder, GenerateStreamParams, StreamFrame};
use chatserve_worker::{
    ByteTokenizer, HeartbeatReporter, HttpControllerClient, ScriptedEngine, WorkerIdentity, WorkerServer,
    WorkerService,
};
use futures::StreamExt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

struct Cluster {
    controller_url: String,
    worker_url: String,
    registry: Arc<WorkerRegistry>,
    service: Arc<WorkerService>,
}

async fn start_cluster(engine: ScriptedEngine) -> Cluster {
    let controller_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let controller_url = format!("http://{}", controller_listener.local_addr().unwrap());
    let registry = Arc::new(WorkerRegistry::new(&ControllerConfig::default()));
    let state = ControllerState {
        registry: registry.clone(),
        workers: WorkerClient::new(Duration::from_secs(2)).unwrap(),
    };
    tokio::spawn(ControllerServer::new(state, String::new(), 0).serve_with_listener(controller_listener, pending()));

    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_url = format!("http://{}", worker_listener.local_addr().unwrap());
    let config = WorkerConfig {
        worker_address: worker_url.clone(),
        controller_address: controller_url.clone(),
        limit_model_concurrency: 2,
        stream_interval: 2,
        ..WorkerConfig::default()
    };
    let identity = WorkerIdentity::generate(&config.worker_address, &config.model_name);
    let service = Arc::new(WorkerService::new(identity, Arc::new(engine), Arc::new(ByteTokenizer), &config).unwrap());
    tokio::spawn(
        WorkerServer::new(service.clone(), String::new(), 0).serve_with_listener(worker_listener, pending()),
    );

    let client = HttpControllerClient::new(controller_url.clone(), Duration::from_secs(2)).unwrap();
    HeartbeatReporter::new(
        client,
        service.identity().clone(),
        service.gate().clone(),
        Duration::from_millis(50),
        Duration::from_millis(20),
    )
    .spawn();

    Cluster {
        controller_url,
        worker_url,
        registry,
        service,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_registers_and_streams_through_the_controller() {
    let cluster = start_cluster(ScriptedEngine::from_text(" world<STOP>extra")).await;
    wait_until(|| cluster.registry.len() == 1).await;

    let http = reqwest::Client::new();
    let models: serde_json::Value = http
        .post(format!("{}/list_models", cluster.controller_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["models"], serde_json::json!(["opt-1.3b"]));

    let address: serde_json::Value = http
        .post(format!("{}/get_worker_address", cluster.controller_url))
        .json(&serde_json::json!({"model": "opt-1.3b"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(address["address"], cluster.worker_url.as_str());

    let params = GenerateStreamParams {
        temperature: 0.0,
        max_new_tokens: 32,
        stop: Some("<STOP>".to_string()),
        ..GenerateStreamParams::new("Hello")
    };
    let frames = WorkerClient::new(Duration::from_secs(2))
        .unwrap()
        .generate(&cluster.worker_url, &params)
        .await
        .unwrap();

    let last = frames.last().unwrap();
    assert_eq!(last.text, "Hello world");
    assert!(frames.iter().all(|f| f.error_code == 0));
    assert_eq!(cluster.service.gate().queue_length(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_wire_format_is_nul_delimited_json() {
    let cluster = start_cluster(ScriptedEngine::from_text("abc")).await;

    let body = reqwest::Client::new()
        .post(format!("{}/worker_generate_stream", cluster.worker_url))
        .json(&serde_json::json!({"prompt": "x", "temperature": 0.0, "max_new_tokens": 3}))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();

    assert_eq!(body.last(), Some(&0u8));
    let frames = FrameDecoder::new().push(&body).unwrap();
    assert_eq!(
        frames,
        vec![
            StreamFrame::text("xa"),
            StreamFrame::text("xabc"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_request_is_a_client_error() {
    let cluster = start_cluster(ScriptedEngine::from_text("abc")).await;

    let response = reqwest::Client::new()
        .post(format!("{}/worker_generate_stream", cluster.worker_url))
        .json(&serde_json::json!({"prompt": "x", "max_new_tokens": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(cluster.service.gate().acquired_total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forgotten_worker_registers_again() {
    let cluster = start_cluster(ScriptedEngine::from_text("abc")).await;
    wait_until(|| cluster.registry.len() == 1).await;

    assert!(cluster.registry.remove(&cluster.worker_url));
    wait_until(|| cluster.registry.len() == 1).await;

    let status: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/worker_get_status", cluster.worker_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["queue_length"], 0);
    assert_eq!(status["speed"], 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_client_sees_frames_incrementally() {
    let cluster = start_cluster(ScriptedEngine::from_text("abcdef").with_step_delay(Duration::from_millis(5))).await;
    let params = GenerateStreamParams {
        temperature: 0.0,
        max_new_tokens: 6,
        ..GenerateStreamParams::new(">")
    };

    let mut stream = WorkerClient::new(Duration::from_secs(2))
        .unwrap()
        .generate_stream(&cluster.worker_url, &params)
        .await
        .unwrap();

    let mut texts = Vec::new();
    while let Some(frame) = stream.next().await {
        texts.push(frame.unwrap().text);
    }
    assert_eq!(texts, vec![">a", ">abc", ">abcde", ">abcdef"]);
}
