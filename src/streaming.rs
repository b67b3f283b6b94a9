use crate::aggregator::ResponseAggregator;
use crate::logging::{ExchangeSink, StreamMetric};
use crate::repair::ToolCallRepairer;
use crate::sse::{encode_frame, Frame, FrameDecoder, SseCodec};
use crate::types::*;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

pub type BodySender = mpsc::Sender<std::result::Result<Bytes, std::io::Error>>;

/// Everything a relay task needs besides its two ends.
#[derive(Clone)]
pub struct StreamContext {
    pub request_id: RequestId,
    pub sink: Arc<dyn ExchangeSink>,
    pub idle_timeout: Duration,
}

/// Client side of a relay. A failed send means the client went away.
struct Downstream {
    tx: BodySender,
    ctx: StreamContext,
}

impl Downstream {
    async fn send(&self, bytes: Bytes) -> bool {
        self.ctx.sink.log_stream_chunk(&self.ctx.request_id, &bytes);
        self.tx.send(Ok(bytes)).await.is_ok()
    }

    async fn send_frame(&self, frame: &Frame) -> bool {
        match encode_frame(frame) {
            Ok(bytes) => self.send(bytes).await,
            Err(e) => {
                tracing::warn!("[⚙️  -> 🖱️ ] Dropping frame that failed to encode: {}", e);
                true
            }
        }
    }

    async fn send_error(&self, err: &ProxyError) -> bool {
        self.ctx.sink.log_error(
            &self.ctx.request_id,
            &err.to_string(),
            &serde_json::json!({ "phase": "stream", "code": err.code() }),
        );
        self.send_frame(&Frame::Opaque(err.to_stream_error_json().to_string()))
            .await
    }
}

pub struct StreamHandler;

impl StreamHandler {
    /// Decodes the backend stream, runs every event through the repairer and
    /// writes the result to the client.
    pub async fn relay_repaired<S>(
        chunks: S,
        mut repairer: ToolCallRepairer,
        tx: BodySender,
        ctx: StreamContext,
    ) where
        S: Stream<Item = std::result::Result<Bytes, ProxyError>> + Unpin,
    {
        let sink = ctx.sink.clone();
        let request_id = ctx.request_id.clone();
        let logged = chunks.map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sink.log_server_chunk(&request_id, bytes);
            }
            chunk.map_err(std::io::Error::other)
        });
        let mut frames = FramedRead::new(StreamReader::new(logged), SseCodec::new());

        let down = Downstream { tx, ctx };
        let mut aggregator = ResponseAggregator::new();
        let mut metric = StreamMetric::new();
        let mut fatal: Option<ProxyError> = None;
        let mut saw_done = false;
        let mut client_gone = false;

        'relay: loop {
            // A client can leave while the repairer is holding text back.
            let next = tokio::select! {
                biased;
                _ = down.tx.closed() => {
                    client_gone = true;
                    break 'relay;
                }
                next = tokio::time::timeout(down.ctx.idle_timeout, frames.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    fatal = Some(ProxyError::Timeout(down.ctx.idle_timeout));
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    fatal = Some(e);
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };
            metric.record_frame();

            match frame {
                Frame::Event(event) => {
                    for out in repairer.observe(event) {
                        aggregator.observe(&out);
                        metric.record_event(&out);
                        if !down.send_frame(&Frame::Event(out)).await {
                            client_gone = true;
                            break 'relay;
                        }
                    }
                }
                Frame::Done => {
                    saw_done = true;
                    break;
                }
                Frame::Opaque(payload) => {
                    aggregator.observe_opaque(&payload);
                    if !down.send_frame(&Frame::Opaque(payload)).await {
                        client_gone = true;
                        break;
                    }
                }
                comment @ Frame::Comment(_) => {
                    if !down.send_frame(&comment).await {
                        client_gone = true;
                        break;
                    }
                }
            }
        }

        // Dropping the reader closes the backend connection.
        drop(frames);

        if !client_gone {
            client_gone = !Self::close(&down, repairer.finish(), &mut aggregator, &mut metric, fatal, saw_done).await;
        }
        if client_gone {
            tracing::warn!("[⚙️  -> 🖱️ ] Client disconnected; backend stream closed");
        }

        metric.log_summary(&down.ctx.request_id, repairer.repaired_calls());
        down.ctx
            .sink
            .log_aggregated(&down.ctx.request_id, &aggregator.finalize());
    }

    /// Forwards backend bytes untouched. A copy is decoded only to feed the
    /// aggregator.
    pub async fn relay_raw<S>(mut chunks: S, tx: BodySender, ctx: StreamContext)
    where
        S: Stream<Item = std::result::Result<Bytes, ProxyError>> + Unpin,
    {
        let down = Downstream { tx, ctx };
        let mut decoder = Some(FrameDecoder::new());
        let mut aggregator = ResponseAggregator::new();
        let mut metric = StreamMetric::new();
        let mut fatal: Option<ProxyError> = None;
        let mut client_gone = false;

        'relay: loop {
            let next = tokio::select! {
                biased;
                _ = down.tx.closed() => {
                    client_gone = true;
                    break 'relay;
                }
                next = tokio::time::timeout(down.ctx.idle_timeout, chunks.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    fatal = Some(ProxyError::Timeout(down.ctx.idle_timeout));
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    fatal = Some(e);
                    break;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            down.ctx.sink.log_server_chunk(&down.ctx.request_id, &chunk);

            if let Some(dec) = decoder.as_mut() {
                match dec.push(&chunk) {
                    Ok(frames) => Self::aggregate(frames, &mut aggregator, &mut metric),
                    Err(e) => {
                        tracing::warn!("[☁️  -> ⚙️ ] Aggregation stopped: {}", e);
                        decoder = None;
                    }
                }
            }

            if !down.send(chunk).await {
                client_gone = true;
                break;
            }
        }
        drop(chunks);

        if let Some(mut dec) = decoder {
            if let Ok(frames) = dec.finish() {
                Self::aggregate(frames, &mut aggregator, &mut metric);
            }
        }

        if client_gone {
            tracing::warn!("[⚙️  -> 🖱️ ] Client disconnected; backend stream closed");
        } else if let Some(err) = fatal {
            tracing::error!("[☁️  -> ⚙️ ] Stream aborted: {}", err);
            down.send_error(&err).await;
        }

        metric.log_summary(&down.ctx.request_id, 0);
        down.ctx
            .sink
            .log_aggregated(&down.ctx.request_id, &aggregator.finalize());
    }

    fn aggregate(frames: Vec<Frame>, aggregator: &mut ResponseAggregator, metric: &mut StreamMetric) {
        for frame in frames {
            metric.record_frame();
            match frame {
                Frame::Event(event) => {
                    aggregator.observe(&event);
                    metric.record_event(&event);
                }
                Frame::Opaque(payload) => aggregator.observe_opaque(&payload),
                Frame::Done | Frame::Comment(_) => {}
            }
        }
    }

    /// Writes held-back text, then either the error event or the sentinel.
    /// Returns false when the client is gone.
    async fn close(
        down: &Downstream,
        flushed: Vec<DeltaEvent>,
        aggregator: &mut ResponseAggregator,
        metric: &mut StreamMetric,
        fatal: Option<ProxyError>,
        saw_done: bool,
    ) -> bool {
        for out in flushed {
            aggregator.observe(&out);
            metric.record_event(&out);
            if !down.send_frame(&Frame::Event(out)).await {
                return false;
            }
        }
        if let Some(err) = fatal {
            tracing::error!("[☁️  -> ⚙️ ] Stream aborted: {}", err);
            return down.send_error(&err).await;
        }
        if saw_done {
            return down.send_frame(&Frame::Done).await;
        }
        true
    }
}
