use std::time::Duration;

use super::*;
use crate::test_support::{summary, template, transport, video, GatewayCall, ScriptedGateway};

fn store_with(gateway: Arc<ScriptedGateway>) -> (Arc<TaskStore>, broadcast::Receiver<ClientEvent>) {
    let (events, rx) = broadcast::channel(64);
    (Arc::new(TaskStore::new(gateway, events)), rx)
}

async fn wait_until_running(rx: &mut broadcast::Receiver<ClientEvent>) {
    loop {
        match rx.recv().await.expect("event") {
            ClientEvent::TaskChanged(task) if task.is_running => return,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn fresh_store_has_no_task_state() {
    let (store, _rx) = store_with(Arc::new(ScriptedGateway::new()));
    assert_eq!(store.snapshot(), TaskSnapshot::default());
    assert!(store.templates().is_empty());
    assert!(store.default_template().is_none());
}

#[tokio::test]
async fn successful_submit_records_result_and_forwards_credential() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_upload(Ok(summary("S", "Tx")));
    let (store, _rx) = store_with(Arc::clone(&gateway));

    let result = store
        .submit(video(), "Summarize this", Credential::new("T1"))
        .await
        .expect("submit");

    assert_eq!(result, summary("S", "Tx"));
    let task = store.snapshot();
    assert!(!task.is_running);
    assert_eq!(task.result, Some(summary("S", "Tx")));
    assert_eq!(task.failure, None);
    assert!(task.finished_at.is_some());
    assert_eq!(
        gateway.calls(),
        vec![GatewayCall::Upload {
            filename: "meeting.mp4".into(),
            prompt: "Summarize this".into(),
            bearer: Some("T1".into()),
        }]
    );
}

#[tokio::test]
async fn transport_failure_records_failure_and_stops_running() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_upload(Err(transport("upload", "connection reset")));
    let (store, _rx) = store_with(gateway);

    let err = store
        .submit(video(), "Summarize this", None)
        .await
        .expect_err("must fail");

    let task = store.snapshot();
    assert!(!task.is_running);
    assert_eq!(task.result, None);
    let failure = task.failure.expect("failure");
    assert!(failure.starts_with("video processing failed: "), "{failure}");
    assert!(failure.contains("connection reset"), "{failure}");
    assert_eq!(err.to_string(), failure);
}

#[tokio::test]
async fn new_submission_discards_previous_outcome_before_running() {
    let (gateway, gate) = ScriptedGateway::gated();
    let gateway = Arc::new(gateway);
    gateway.push_upload(Err(transport("upload", "boom")));
    gateway.push_upload(Ok(summary("S2", "Tx2")));
    let (store, mut rx) = store_with(gateway);

    gate.notify_one();
    let _ = store.submit(video(), "first", None).await;
    assert!(store.snapshot().failure.is_some());
    while rx.try_recv().is_ok() {}

    let running = Arc::clone(&store);
    let second = tokio::spawn(async move { running.submit(video(), "second", None).await });
    wait_until_running(&mut rx).await;

    let in_flight = store.snapshot();
    assert!(in_flight.is_running);
    assert_eq!(in_flight.failure, None);
    assert_eq!(in_flight.result, None);

    gate.notify_one();
    second.await.expect("join").expect("second submit");
    assert_eq!(store.snapshot().result, Some(summary("S2", "Tx2")));
}

#[tokio::test]
async fn overlapping_submit_is_rejected_without_touching_state() {
    let (gateway, gate) = ScriptedGateway::gated();
    let gateway = Arc::new(gateway);
    gateway.push_upload(Ok(summary("S", "Tx")));
    let (store, mut rx) = store_with(Arc::clone(&gateway));

    let running = Arc::clone(&store);
    let first = tokio::spawn(async move { running.submit(video(), "first", None).await });
    wait_until_running(&mut rx).await;
    let before = store.snapshot();

    let err = store
        .submit(video(), "second", None)
        .await
        .expect_err("single flight");

    assert!(matches!(err, TaskError::AlreadyRunning));
    assert_eq!(store.snapshot(), before);

    gate.notify_one();
    first.await.expect("join").expect("first submit");
    assert_eq!(gateway.calls().len(), 1);
    let task = store.snapshot();
    assert!(!task.is_running);
    assert_eq!(task.result, Some(summary("S", "Tx")));
}

#[tokio::test]
async fn dropped_submission_does_not_stay_running() {
    let (gateway, _gate) = ScriptedGateway::gated();
    let (store, _rx) = store_with(Arc::new(gateway));

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        store.submit(video(), "never answered", None),
    )
    .await;

    assert!(outcome.is_err(), "upload should still be parked");
    let task = store.snapshot();
    assert!(!task.is_running);
    assert!(task.result.is_none());
    assert!(task.failure.expect("failure").contains("cancelled"));
}

#[tokio::test]
async fn templates_load_replaces_cache_and_exposes_default() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_templates(Ok(vec![template("a"), template("b")]));
    let (store, _rx) = store_with(gateway);

    assert_eq!(store.load_templates().await, TemplatesLoad::Loaded(2));
    assert_eq!(store.default_template(), Some(template("a")));
    assert_eq!(store.template(&TemplateId::from("b")), Some(template("b")));
    assert_eq!(store.template(&TemplateId::from("zzz")), None);
    assert_eq!(store.templates_notice(), None);
}

#[tokio::test]
async fn failed_template_reload_keeps_previous_cache() {
    let gateway = Arc::new(ScriptedGateway::new());
    gateway.push_templates(Ok(vec![template("a")]));
    gateway.push_templates(Err(transport("templates", "404 not found")));
    let (store, _rx) = store_with(gateway);

    store.load_templates().await;
    let outcome = store.load_templates().await;

    let TemplatesLoad::Kept { cached, message } = outcome else {
        panic!("expected soft failure, got {outcome:?}");
    };
    assert_eq!(cached, 1);
    assert!(message.starts_with("could not load prompt templates"));
    assert_eq!(store.templates(), vec![template("a")]);
    assert_eq!(store.templates_notice(), Some(message));
    assert_eq!(store.snapshot(), TaskSnapshot::default());
}
