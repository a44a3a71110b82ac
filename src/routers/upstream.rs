//! One HTTP exchange with one worker

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue},
    response::Response,
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::header_utils::{preserve_response_headers, set_worker_id, WORKER_ID_HEADER};
use crate::core::{
    is_retryable_status, DispatchGuard, DispatchOutcome, RouterError, RouterResult, Worker,
};

const STREAM_CHANNEL_CAPACITY: usize = 32;

/// POST `body` to `route` on `worker`.
///
/// Transport errors and retryable statuses come back as errors (the body of a
/// failed response is read into the error); any other status is returned for
/// the caller to forward.
pub async fn send_json(
    client: &reqwest::Client,
    worker: &Worker,
    route: &str,
    headers: &HeaderMap,
    body: &Value,
) -> RouterResult<reqwest::Response> {
    let url = format!("{}{}", worker.url().trim_end_matches('/'), route);
    let res = client
        .post(&url)
        .headers(headers.clone())
        .json(body)
        .send()
        .await
        .map_err(|e| RouterError::WorkerUnreachable {
            worker_url: worker.url().to_string(),
            message: e.to_string(),
        })?;

    let status = res.status();
    if is_retryable_status(status) {
        let body = res.text().await.unwrap_or_default();
        debug!(worker = %worker.url(), status = %status, "Worker returned retryable status");
        return Err(RouterError::UpstreamStatus {
            worker_url: worker.url().to_string(),
            status,
            body,
        });
    }
    Ok(res)
}

/// Finish a dispatch by turning the worker's answer into the client response.
///
/// Buffered responses close the dispatch here. Successful streams keep the
/// guard alive until the last chunk has been forwarded.
pub async fn forward_response(
    res: reqwest::Response,
    guard: DispatchGuard,
    stream: bool,
) -> RouterResult<Response> {
    let status = res.status();
    let mut headers = preserve_response_headers(res.headers());
    set_worker_id(&mut headers, WORKER_ID_HEADER, guard.worker_id());

    if stream && status.is_success() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        let mut response = Response::new(stream_body(res, guard));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return Ok(response);
    }

    match res.bytes().await {
        Ok(body) => {
            guard.finish(DispatchOutcome::from_status(status));
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
        Err(e) => {
            let worker_url = guard.worker().url().to_string();
            guard.finish(DispatchOutcome::Failure);
            Err(RouterError::WorkerUnreachable {
                worker_url,
                message: format!("Failed to read response body: {}", e),
            })
        }
    }
}

fn stream_body(res: reqwest::Response, guard: DispatchGuard) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(STREAM_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut upstream = res.bytes_stream();
        let mut outcome = DispatchOutcome::Success;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        // Client went away; the unfinished guard releases the load
                        debug!(worker = %guard.worker().url(), "Client disconnected mid-stream");
                        return;
                    }
                }
                Err(e) => {
                    warn!(worker = %guard.worker().url(), "Upstream stream error: {}", e);
                    outcome = DispatchOutcome::Failure;
                    let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                    break;
                }
            }
        }
        guard.finish(outcome);
    });

    Body::from_stream(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}
