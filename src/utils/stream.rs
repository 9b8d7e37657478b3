use std::{convert::Infallible, pin::pin, time::Duration};

use axum::{body::Body, response::Response};
use bytes::Bytes;
use futures::StreamExt;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{PolygateError, error_body};

/// Builds a JSON response from a payload future. When `keep_alive` is
/// non-zero, blank lines are flushed on that interval until the payload is
/// ready; once anything has been written the status is already committed,
/// so late errors are rendered into the body.
pub fn json_response_with_keepalive(
    keep_alive: Duration,
    fut: impl Future<Output = Result<Bytes, PolygateError>> + Send + 'static,
) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(8);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(keep_alive);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        ticker.tick().await;
        let mut fut = pin!(fut);
        loop {
            tokio::select! {
                res = &mut fut => {
                    let payload = match res {
                        Ok(bytes) => bytes,
                        Err(e) => Bytes::from(error_body(e.status(), &e.client_text())),
                    };
                    let _ = tx.send(Ok(payload)).await;
                    break;
                }
                _ = ticker.tick() => {
                    if tx.send(Ok(Bytes::from_static(b"\n"))).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_default()
}

/// Wraps a conductor chunk channel into an SSE response. Chunks are raw
/// upstream bytes and pass through untouched; a trailing error is rendered
/// as a terminal `event: error` frame.
pub fn sse_response(rx: mpsc::Receiver<Result<Bytes, PolygateError>>) -> Response {
    let stream = ReceiverStream::new(rx).map(|item| match item {
        Ok(bytes) => Ok::<Bytes, Infallible>(bytes),
        Err(e) => {
            let body = error_body(e.status(), &e.client_text());
            Ok(Bytes::from(format!(
                "event: error\ndata: {}\n\n",
                String::from_utf8_lossy(&body)
            )))
        }
    });

    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_default()
}
