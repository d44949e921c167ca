//! End-to-end get-result scenarios: the long-poll loop, the
//! still-running sentinel, peeks, and deadline mapping.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nexus_rpc::{
    ClientError, EncodedStream, ExecuteOperationOptions, Failure, GetOperationResultOptions,
    Handler, HandlerError, HttpHandler, OperationError, OperationResponse, OperationState,
    Payload, StartOperationOptions, UnsuccessfulOperationError, GET_RESULT_CONTEXT_PADDING,
    GET_RESULT_MAX_TIMEOUT, USER_AGENT,
};
use testresult::TestResult;

use common::{assert_duration_close, setup, setup_http};

#[derive(Debug, Clone)]
struct RecordedRequest {
    operation: String,
    id: String,
    wait: Duration,
}

#[derive(Clone, Copy)]
enum ResultBehavior {
    Succeed,
    Canceled,
}

/// Starts every operation as `a/sync` and serves get-result according
/// to [`ResultBehavior`], blocking the first `times_to_block` polls for
/// their full wait.
struct AsyncWithResultHandler {
    times_to_block: usize,
    behavior: ResultBehavior,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl AsyncWithResultHandler {
    fn new(times_to_block: usize, behavior: ResultBehavior) -> (Self, Arc<Mutex<Vec<RecordedRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                times_to_block,
                behavior,
                requests: Arc::clone(&requests),
            },
            requests,
        )
    }
}

#[async_trait]
impl Handler for AsyncWithResultHandler {
    async fn start_operation(
        &self,
        _operation: &str,
        _input: EncodedStream,
        _options: StartOperationOptions,
    ) -> Result<OperationResponse, OperationError> {
        Ok(OperationResponse::Async {
            operation_id: "a/sync".to_owned(),
        })
    }

    async fn get_operation_result(
        &self,
        operation: &str,
        id: &str,
        options: GetOperationResultOptions,
    ) -> Result<Payload, OperationError> {
        let count = {
            let mut requests = self.requests.lock().expect("lock");
            requests.push(RecordedRequest {
                operation: operation.to_owned(),
                id: id.to_owned(),
                wait: options.wait,
            });
            requests.len()
        };

        if options.header.get("user-agent").map(String::as_str) != Some(USER_AGENT) {
            return Err(HandlerError::bad_request("invalid 'User-Agent' header").into());
        }
        if options.header.contains_key("content-type") {
            return Err(HandlerError::bad_request("'Content-Type' header set on request").into());
        }

        match self.behavior {
            ResultBehavior::Canceled => {
                return Err(UnsuccessfulOperationError {
                    state: OperationState::Canceled,
                    failure: Failure::from_message("canceled"),
                }
                .into())
            }
            ResultBehavior::Succeed => {}
        }

        if count <= self.times_to_block {
            tokio::time::sleep(options.wait).await;
            return Err(OperationError::StillRunning);
        }
        Ok(Payload::bytes("body"))
    }
}

#[tokio::test]
async fn long_poll_blocks_once_then_succeeds() -> TestResult {
    const WAIT: Duration = Duration::from_secs(12);

    let (handler, requests) = AsyncWithResultHandler::new(1, ResultBehavior::Succeed);
    let (_server, client) = setup(handler).await;

    let response = client
        .execute_operation(
            "f/o/o",
            Payload::Empty,
            ExecuteOperationOptions {
                wait: WAIT,
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(response.read_bytes().await?, "body".as_bytes());

    let requests = requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].operation, "f/o/o");
    assert_eq!(requests[0].id, "a/sync");

    // First attempt asks for the full budget plus padding; the second
    // for what is left after one bounded attempt.
    let tolerance = Duration::from_millis(50);
    assert_duration_close(requests[0].wait, WAIT + GET_RESULT_CONTEXT_PADDING, tolerance);
    assert_duration_close(
        requests[1].wait,
        WAIT + GET_RESULT_CONTEXT_PADDING - GET_RESULT_MAX_TIMEOUT,
        tolerance,
    );
    Ok(())
}

#[tokio::test]
async fn exhausted_wait_budget_surfaces_still_running() -> TestResult {
    let (handler, _requests) = AsyncWithResultHandler::new(1000, ResultBehavior::Succeed);
    let (_server, client) = setup(handler).await;

    let result = client
        .start_operation("foo", Payload::Empty, StartOperationOptions::default())
        .await?;
    let handle = result.into_pending().expect("pending handle");

    let err = handle
        .get_result(GetOperationResultOptions {
            wait: Duration::from_millis(300),
            ..Default::default()
        })
        .await
        .expect_err("budget exhaustion expected");
    assert!(matches!(err, ClientError::OperationStillRunning));
    Ok(())
}

#[tokio::test]
async fn peek_reports_still_running_without_waiting() -> TestResult {
    let (handler, requests) = AsyncWithResultHandler::new(1000, ResultBehavior::Succeed);
    let (_server, client) = setup(handler).await;

    let handle = client.new_handle("foo", "a/sync")?;
    let started = Instant::now();
    let err = handle
        .get_result(GetOperationResultOptions::default())
        .await
        .expect_err("still running expected");

    assert!(matches!(err, ClientError::OperationStillRunning));
    assert!(started.elapsed() < Duration::from_secs(1), "peek must not wait");

    let requests = requests.lock().expect("lock").clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].wait, Duration::ZERO);
    Ok(())
}

#[tokio::test]
async fn peek_returns_a_ready_result() -> TestResult {
    let (handler, _requests) = AsyncWithResultHandler::new(0, ResultBehavior::Succeed);
    let (_server, client) = setup(handler).await;

    let handle = client.new_handle("foo", "a/sync")?;
    let response = handle.get_result(GetOperationResultOptions::default()).await?;
    assert_eq!(response.read_bytes().await?, "body".as_bytes());
    Ok(())
}

#[tokio::test]
async fn peek_surfaces_a_canceled_operation() -> TestResult {
    let (handler, _requests) = AsyncWithResultHandler::new(0, ResultBehavior::Canceled);
    let (_server, client) = setup(handler).await;

    let handle = client.new_handle("foo", "a/sync")?;
    let err = handle
        .get_result(GetOperationResultOptions::default())
        .await
        .expect_err("cancelation expected");

    match err {
        ClientError::Unsuccessful(unsuccessful) => {
            assert_eq!(unsuccessful.state, OperationState::Canceled);
        }
        other => panic!("expected an unsuccessful operation error, got {other:?}"),
    }
    Ok(())
}

/// Never answers; only the surrounding request bound can end the poll.
struct StuckHandler;

#[async_trait]
impl Handler for StuckHandler {
    async fn start_operation(
        &self,
        _operation: &str,
        _input: EncodedStream,
        _options: StartOperationOptions,
    ) -> Result<OperationResponse, OperationError> {
        Ok(OperationResponse::Async {
            operation_id: "stuck".to_owned(),
        })
    }

    async fn get_operation_result(
        &self,
        _operation: &str,
        _id: &str,
        _options: GetOperationResultOptions,
    ) -> Result<Payload, OperationError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(OperationError::StillRunning)
    }
}

#[tokio::test]
async fn server_poll_bound_maps_to_deadline_exceeded() -> TestResult {
    let http_handler =
        HttpHandler::new(StuckHandler).with_get_result_timeout(Duration::from_millis(300));
    let (_server, client) = setup_http(http_handler).await;

    let result = client
        .start_operation("foo", Payload::Empty, StartOperationOptions::default())
        .await?;
    let handle = result.into_pending().expect("pending handle");

    let err = handle
        .get_result(GetOperationResultOptions {
            wait: Duration::from_secs(5),
            ..Default::default()
        })
        .await
        .expect_err("server bound expected");
    assert!(matches!(err, ClientError::DeadlineExceeded));
    Ok(())
}

#[tokio::test]
async fn server_poll_bound_pads_the_requested_wait() -> TestResult {
    let (server, _client) = setup(StuckHandler).await;

    let http = reqwest::Client::new();
    let started = Instant::now();
    let response = http
        .get(format!("{}/foo/stuck/result?wait=500ms", server.base_url()))
        .send()
        .await?;

    assert_eq!(response.status().as_u16(), 408);
    // The bound is the requested wait plus the padding margin.
    assert_duration_close(
        started.elapsed(),
        Duration::from_millis(500) + GET_RESULT_CONTEXT_PADDING,
        Duration::from_millis(300),
    );
    Ok(())
}

#[tokio::test]
async fn invalid_wait_literals_are_a_bad_request() -> TestResult {
    let (server, _client) = setup(StuckHandler).await;

    let http = reqwest::Client::new();
    let response = http
        .get(format!("{}/foo/stuck/result?wait=abc", server.base_url()))
        .send()
        .await?;

    assert_eq!(response.status().as_u16(), 400);
    assert_eq!(
        response.headers().get("content-type").expect("content type"),
        "application/json"
    );
    let failure: Failure = serde_json::from_slice(&response.bytes().await?)?;
    assert_eq!(failure.message, "invalid wait query parameter");
    Ok(())
}

#[tokio::test]
async fn unmatched_routes_are_not_found() -> TestResult {
    let (server, _client) = setup(StuckHandler).await;

    let http = reqwest::Client::new();
    let response = http
        .delete(format!("{}/foo", server.base_url()))
        .send()
        .await?;

    assert_eq!(response.status().as_u16(), 404);
    let failure: Failure = serde_json::from_slice(&response.bytes().await?)?;
    assert_eq!(failure.message, "not found");
    Ok(())
}
