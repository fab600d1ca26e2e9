//! Transport contract and the in-process duplex implementation.
//!
//! The RPC core consumes a [`Transport`]: ordered reliable delivery of
//! encoded frames, a drain future for send-side backpressure, an
//! at-most-once disconnect signal, and the pair of helpers mapping error
//! objects to wire payloads. Binding to an actual network transport lives
//! outside this crate; the [`ChannelTransport`] here connects two peers in
//! one process and is what the test suite runs on.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Value, json};

use crate::{
    error::{Error, Interrupt, Result},
    options::TransportOptions,
    rpc::{
        codec::{self, Message},
        signal::{AbortHandle, AbortSignal},
    },
};

/// Ordered, reliable delivery of messages to the peer.
pub trait Transport: Send + Sync + 'static {
    /// Sends one message. Failures are transport errors: they surface to
    /// the caller that requested the send and are never re-encoded onto the
    /// wire.
    fn send_message(&self, msg: Message) -> BoxFuture<'_, Result<()>>;

    /// `None` while the local send buffer is below its high-water mark,
    /// otherwise a future resolving once it drained. Only consulted while
    /// writing the streaming tail of a call or response.
    fn wait_to_drain(&self) -> Option<BoxFuture<'_, ()>>;

    /// Fires at most once, with the reason the connection went away.
    fn disconnect_signal(&self) -> AbortSignal;

    /// Serializes an error for an error frame payload.
    fn encode_error(&self, error: &Error) -> Value {
        encode_error_payload(error)
    }

    /// Inverse of [`Transport::encode_error`].
    fn decode_error(&self, payload: &Value) -> Error {
        decode_error_payload(payload)
    }
}

/// Default wire shape for error payloads: `{code, message}`.
pub fn encode_error_payload(error: &Error) -> Value {
    let code = match error {
        Error::Interrupted(Interrupt::Aborted(_)) => "aborted",
        Error::Interrupted(Interrupt::TimedOut) => "timeout",
        Error::Interrupted(Interrupt::Disconnected(_)) => "disconnected",
        Error::StoreBusy => "storeBusy",
        Error::Builder(_) => "builder",
        Error::UnknownMethod(_) => "unknownMethod",
        Error::Unimplemented(_) => "notImplemented",
        _ => "internal",
    };

    json!({ "code": code, "message": error.to_string() })
}

/// Maps an error payload back to an error object. Codes carrying structured
/// meaning are restored to their kinds; everything else becomes a remote
/// error.
pub fn decode_error_payload(payload: &Value) -> Error {
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| payload.to_string(), ToOwned::to_owned);

    match payload.get("code").and_then(Value::as_str) {
        Some("aborted") => Interrupt::Aborted(message).into(),
        Some("timeout") => Interrupt::TimedOut.into(),
        Some("disconnected") => Interrupt::Disconnected(message).into(),
        Some("storeBusy") => Error::StoreBusy,
        Some("builder") => Error::Builder(message),
        Some("unknownMethod") => Error::UnknownMethod(message),
        _ => Error::Remote(message),
    }
}

/// One direction of an in-process connection: a frame queue plus the byte
/// count of what is sitting in it.
fn frame_queue() -> (flume::Sender<String>, flume::Receiver<String>, Arc<AtomicUsize>) {
    let (tx, rx) = flume::unbounded();
    (tx, rx, Arc::new(AtomicUsize::new(0)))
}

/// In-process transport endpoint over a pair of frame queues.
#[derive(Debug)]
pub struct ChannelTransport {
    frames: flume::Sender<String>,
    buffered: Arc<AtomicUsize>,
    disconnect: AbortSignal,
    disconnect_handle: AbortHandle,
    options: TransportOptions,
}

/// Receiving half handed to the dispatch pump of a peer.
#[derive(Debug)]
pub struct FrameReceiver {
    frames: flume::Receiver<String>,
    buffered: Arc<AtomicUsize>,
}

impl FrameReceiver {
    /// Next raw frame, or `None` once the sending side is gone.
    pub async fn recv(&self) -> Option<String> {
        let frame = self.frames.recv_async().await.ok()?;
        self.buffered.fetch_sub(frame.len(), Ordering::Relaxed);
        Some(frame)
    }
}

/// Creates a connected pair of endpoints. Each endpoint comes with the
/// receiver its peer's frames arrive on.
pub fn duplex(
    options: TransportOptions,
) -> ((ChannelTransport, FrameReceiver), (ChannelTransport, FrameReceiver)) {
    let (a_tx, a_rx, a_bytes) = frame_queue();
    let (b_tx, b_rx, b_bytes) = frame_queue();

    let make = |frames: flume::Sender<String>, buffered: &Arc<AtomicUsize>| {
        let (disconnect_handle, disconnect) = AbortSignal::new_pair();
        ChannelTransport {
            frames,
            buffered: Arc::clone(buffered),
            disconnect,
            disconnect_handle,
            options,
        }
    };

    let left = make(a_tx, &a_bytes);
    let right = make(b_tx, &b_bytes);

    let left_incoming = FrameReceiver {
        frames: b_rx,
        buffered: b_bytes,
    };
    let right_incoming = FrameReceiver {
        frames: a_rx,
        buffered: a_bytes,
    };

    ((left, left_incoming), (right, right_incoming))
}

impl ChannelTransport {
    /// Tears this endpoint down, firing its disconnect signal.
    pub fn shutdown(&self, reason: impl Into<String>) {
        self.disconnect_handle
            .fire(Interrupt::Disconnected(reason.into()));
    }

    /// Bytes currently queued toward the peer.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Relaxed)
    }
}

impl Transport for ChannelTransport {
    fn send_message(&self, msg: Message) -> BoxFuture<'_, Result<()>> {
        async move {
            if let Some(reason) = self.disconnect.reason() {
                return Err(Error::Transport(reason.to_string()));
            }

            let frame = codec::encode(&msg)?;
            self.buffered.fetch_add(frame.len(), Ordering::Relaxed);
            self.frames
                .send(frame)
                .map_err(|_| Error::Transport("peer receiver is gone".into()))
        }
        .boxed()
    }

    fn wait_to_drain(&self) -> Option<BoxFuture<'_, ()>> {
        if self.buffered.load(Ordering::Relaxed) < self.options.high_water_mark {
            return None;
        }

        let buffered = Arc::clone(&self.buffered);
        let disconnect = self.disconnect.clone();
        let options = self.options;
        let drain = async move {
            while buffered.load(Ordering::Relaxed) >= options.high_water_mark
                && !disconnect.is_aborted()
            {
                tokio::time::sleep(options.buffer_timeout).await;
            }
        };

        Some(drain.boxed())
    }

    fn disconnect_signal(&self) -> AbortSignal {
        self.disconnect.clone()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::rpc::codec::MsgType;

    #[tokio::test]
    async fn frames_cross_the_duplex_in_order() {
        let ((left, _), (_, right_incoming)) = duplex(TransportOptions::default());

        for req_id in 1..=3 {
            let msg = Message::value_frame(MsgType::Call, req_id, Some(json!(req_id)), false);
            left.send_message(msg).await.unwrap();
        }

        for req_id in 1..=3 {
            let frame = right_incoming.recv().await.unwrap();
            assert_eq!(codec::decode(&frame).unwrap().req_id, req_id);
        }
    }

    #[tokio::test]
    async fn drain_tracks_the_buffered_byte_count() {
        let options = TransportOptions::default()
            .high_water_mark(8)
            .buffer_timeout(std::time::Duration::from_millis(1));
        let ((left, _), (_, right_incoming)) = duplex(options);

        assert!(left.wait_to_drain().is_none(), "empty buffer never waits");

        left.send_message(Message::chunk(MsgType::Resp, 1, json!("0123456789")))
            .await
            .unwrap();
        let drain = left.wait_to_drain().expect("above high-water mark");

        // Consuming the frame lets the drain future resolve.
        right_incoming.recv().await.unwrap();
        drain.await;
        assert!(left.wait_to_drain().is_none());
    }

    #[tokio::test]
    async fn shutdown_fails_later_sends() {
        let ((left, _), _) = duplex(TransportOptions::default());
        left.shutdown("test over");

        assert_eq!(
            left.disconnect_signal().reason(),
            Some(Interrupt::Disconnected("test over".into()))
        );
        let err = left
            .send_message(Message::end(MsgType::Resp, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn error_payloads_round_trip_their_kind() {
        let cases = [
            Error::Interrupted(Interrupt::Aborted("stop".into())),
            Error::Interrupted(Interrupt::TimedOut),
            Error::StoreBusy,
            Error::Builder("bad identifier".into()),
            Error::UnknownMethod("nope".into()),
        ];

        for error in cases {
            let payload = encode_error_payload(&error);
            let decoded = decode_error_payload(&payload);
            assert_eq!(
                std::mem::discriminant(&decoded),
                std::mem::discriminant(&error),
                "payload {payload}"
            );
        }

        let other = decode_error_payload(&encode_error_payload(&Error::Protocol("x".into())));
        assert!(matches!(other, Error::Remote(_)));
    }
}
