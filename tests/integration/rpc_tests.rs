//! Integration tests for the RPC correlator over an in-memory channel.

use std::time::Duration;

use serde_json::json;

use qga_exec::proto::{QgaRequest, QgaResponse};
use qga_exec::AppError;

use super::test_helpers::{rpc_pair, rpc_pair_with_timeout};

#[tokio::test]
async fn call_pairs_request_with_next_record() {
    let (mut client, mut agent) = rpc_pair();

    let agent_task = tokio::spawn(async move {
        let request = agent.read_request().await.expect("one request");
        assert_eq!(request["execute"], "guest-exec-status");
        assert_eq!(request["arguments"]["pid"], 42);
        agent.send_return(json!({ "exited": false })).await;
        agent
    });

    let response = client
        .call(&QgaRequest::guest_exec_status(42))
        .await
        .expect("call must succeed");

    match response {
        QgaResponse::Success(value) => assert_eq!(value, json!({ "exited": false })),
        QgaResponse::Failure(failure) => panic!("expected success, got: {failure:?}"),
    }

    agent_task.await.expect("agent task");
}

#[tokio::test]
async fn reply_split_across_writes_is_reassembled() {
    let (mut client, mut agent) = rpc_pair();

    let agent_task = tokio::spawn(async move {
        agent.read_request().await.expect("one request");
        agent.send_raw(r#"{"return": {"exi"#).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.send_raw("ted\": true}}\n").await;
        agent
    });

    let response = client
        .call(&QgaRequest::guest_exec_status(1))
        .await
        .expect("call must succeed once the record completes");

    assert!(matches!(response, QgaResponse::Success(_)));
    agent_task.await.expect("agent task");
}

#[tokio::test]
async fn agent_error_reply_decodes_as_failure() {
    let (mut client, mut agent) = rpc_pair();

    let agent_task = tokio::spawn(async move {
        agent.read_request().await.expect("one request");
        agent.send_error("GenericError", "not allowed").await;
        agent
    });

    let response = client
        .call(&QgaRequest::guest_exec_status(1))
        .await
        .expect("a structured agent error is still a decoded response");

    match response {
        QgaResponse::Failure(failure) => {
            assert_eq!(failure.class, "GenericError");
            assert_eq!(failure.desc, "not allowed");
        }
        QgaResponse::Success(value) => panic!("expected failure, got: {value:?}"),
    }

    agent_task.await.expect("agent task");
}

#[tokio::test]
async fn silent_agent_times_out() {
    let (mut client, mut agent) = rpc_pair_with_timeout(Duration::from_millis(50));

    let agent_task = tokio::spawn(async move {
        // Consume the request but never reply.
        agent.read_request().await.expect("one request");
        agent
    });

    let result = client.call(&QgaRequest::guest_exec_status(1)).await;

    assert!(
        matches!(result, Err(AppError::TransportTimeout(_))),
        "a silent agent must surface TransportTimeout, got: {result:?}"
    );

    agent_task.await.expect("agent task");
}

#[tokio::test]
async fn closed_channel_is_a_transport_error() {
    let (mut client, agent) = rpc_pair();
    drop(agent);

    let result = client.call(&QgaRequest::guest_exec_status(1)).await;

    assert!(
        matches!(result, Err(AppError::Transport(_))),
        "a closed channel must surface Transport, got: {result:?}"
    );
}

#[tokio::test]
async fn garbage_reply_is_a_protocol_error() {
    let (mut client, mut agent) = rpc_pair();

    let agent_task = tokio::spawn(async move {
        agent.read_request().await.expect("one request");
        agent.send_raw("***\n").await;
        agent
    });

    let result = client.call(&QgaRequest::guest_exec_status(1)).await;

    assert!(
        matches!(result, Err(AppError::Protocol(_))),
        "non-record bytes must surface Protocol, got: {result:?}"
    );

    agent_task.await.expect("agent task");
}

#[tokio::test]
async fn sync_discards_stale_records_until_id_matches() {
    let (mut client, mut agent) = rpc_pair();

    let agent_task = tokio::spawn(async move {
        let request = agent.read_request().await.expect("sync request");
        assert_eq!(request["execute"], "guest-sync");
        let id = request["arguments"]["id"].clone();

        // A stale reply left over from an earlier client, then the ack.
        agent.send_return(json!({ "exited": true, "exitcode": 0 })).await;
        agent.send_return(id).await;
        agent
    });

    client.sync().await.expect("sync must skip the stale record");
    agent_task.await.expect("agent task");
}

#[tokio::test]
async fn sync_tolerates_undecodable_whole_records() {
    let (mut client, mut agent) = rpc_pair();

    let agent_task = tokio::spawn(async move {
        let request = agent.read_request().await.expect("sync request");
        let id = request["arguments"]["id"].clone();

        // Well-framed but schema-less record, then the ack.
        agent.send_raw("{\"unrelated\": 1}\n").await;
        agent.send_return(id).await;
        agent
    });

    client.sync().await.expect("sync must skip undecodable records");
    agent_task.await.expect("agent task");
}
