use std::time::Duration;

use futures_util::{FutureExt, StreamExt, TryStreamExt, stream};
use grist_engine::{
    AbortSignal, Error, Interrupt, Message, MsgType, OutgoingData, rpc::codec,
};
use serde_json::{Value, json};

use crate::common::rpc_pair;

#[tokio::test]
async fn echo_call_round_trips_its_value() -> anyhow::Result<()> {
    let (client, server) = rpc_pair();
    server.set_call_handler(|data, _abort| {
        async move { Ok(OutgoingData::value(data.value.unwrap_or(Value::Null))) }.boxed()
    });

    let response = client
        .make_call(OutgoingData::value(json!("hello world")), None)
        .await?;

    assert_eq!(response.value, Some(json!("hello world")));
    assert!(response.chunks.is_none());
    Ok(())
}

#[tokio::test]
async fn call_chunk_tails_arrive_in_order() -> anyhow::Result<()> {
    let (client, server) = rpc_pair();

    // The handler drains the call's chunk tail and streams it back.
    server.set_call_handler(|data, _abort| {
        async move {
            let chunks: Vec<Value> = match data.chunks {
                Some(chunks) => chunks.try_collect().await?,
                None => Vec::new(),
            };
            let count = chunks.len();
            Ok(OutgoingData::streamed(
                json!(count),
                stream::iter(chunks.into_iter().map(Ok)).boxed(),
            ))
        }
        .boxed()
    });

    let sent = vec![json!([1, 2]), json!("mid"), json!({"last": true})];
    let outgoing = OutgoingData::streamed(
        json!("upload"),
        stream::iter(sent.clone().into_iter().map(Ok)).boxed(),
    );

    let response = client.make_call(outgoing, None).await?;
    assert_eq!(response.value, Some(json!(3)));

    let echoed: Vec<Value> = response.chunks.expect("streamed response").try_collect().await?;
    assert_eq!(echoed, sent);
    Ok(())
}

#[tokio::test]
async fn aborting_an_in_flight_call_cancels_the_handler() -> anyhow::Result<()> {
    let (client, server) = rpc_pair();

    // The handler only finishes when its cancellation token fires, and
    // reports that reason back as its error.
    server.set_call_handler(|_data, abort| {
        async move {
            let reason = abort.aborted().await;
            Err(reason.into())
        }
        .boxed()
    });

    let (cancel, signal) = AbortSignal::new_pair();
    let call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .make_call(OutgoingData::value(json!(["slow"])), Some(signal))
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.fire(Interrupt::Aborted("caller gave up".into()));

    let err = call.await?.unwrap_err();
    assert!(
        matches!(err, Error::Interrupted(Interrupt::Aborted(_))),
        "got {err}"
    );
    Ok(())
}

#[tokio::test]
async fn disconnect_rejects_pending_calls_and_open_streams() -> anyhow::Result<()> {
    let (client, server) = rpc_pair();

    // One handler that never resolves, one that streams a chunk and stalls.
    server.set_call_handler(|data, _abort| {
        async move {
            match data.value {
                Some(Value::String(s)) if s == "stall" => std::future::pending().await,
                _ => {
                    let chunks = stream::iter([Ok(json!(1))]).chain(stream::pending()).boxed();
                    Ok(OutgoingData::streamed(json!("header"), chunks))
                }
            }
        }
        .boxed()
    });

    let pending_call = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .make_call(OutgoingData::value(json!("stall")), None)
                .await
        }
    });

    let mut open_stream = client
        .make_call(OutgoingData::value(json!("stream")), None)
        .await?
        .chunks
        .expect("streamed response");
    assert_eq!(open_stream.try_next().await?, Some(json!(1)));

    // Make sure the stalled call went out before tearing the link down.
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.transport().shutdown("network failure");

    let err = pending_call.await?.unwrap_err();
    assert!(
        matches!(&err, Error::Interrupted(Interrupt::Disconnected(r)) if r == "network failure"),
        "got {err}"
    );

    let err = open_stream.try_next().await.unwrap_err();
    assert!(
        matches!(err, Error::Interrupted(Interrupt::Disconnected(_))),
        "got {err}"
    );
    Ok(())
}

#[tokio::test]
async fn handler_errors_become_error_responses() -> anyhow::Result<()> {
    let (client, server) = rpc_pair();
    server.set_call_handler(|_data, _abort| {
        async move { Err(Error::Protocol("handler exploded".into())) }.boxed()
    });

    let err = client
        .make_call(OutgoingData::value(json!([])), None)
        .await
        .unwrap_err();
    assert!(matches!(&err, Error::Remote(msg) if msg.contains("handler exploded")));
    Ok(())
}

#[tokio::test]
async fn failing_chunk_sources_terminate_the_stream_with_an_error() -> anyhow::Result<()> {
    let (client, server) = rpc_pair();
    server.set_call_handler(|_data, _abort| {
        async move {
            let chunks = stream::iter([
                Ok(json!(1)),
                Err(Error::Store("cursor died".into())),
            ])
            .boxed();
            Ok(OutgoingData::streamed(json!("header"), chunks))
        }
        .boxed()
    });

    let mut chunks = client
        .make_call(OutgoingData::value(json!([])), None)
        .await?
        .chunks
        .expect("streamed response");

    assert_eq!(chunks.try_next().await?, Some(json!(1)));
    let err = chunks.try_next().await.unwrap_err();
    assert!(matches!(&err, Error::Remote(msg) if msg.contains("cursor died")));
    assert_eq!(chunks.try_next().await?, None);
    Ok(())
}

#[tokio::test]
async fn dispatch_reports_failures_without_altering_state() {
    let (client, _server) = rpc_pair();

    // Malformed frame.
    assert!(!client.dispatch_frame("X1:true"));
    // Response for a request nobody made.
    assert!(!client.dispatch(Message::value_frame(MsgType::Resp, 99, None, false)));
    // A well-formed signal still dispatches fine afterwards.
    assert!(client.dispatch(codec::decode("S1:[\"noop\"]").unwrap()));
}

#[tokio::test]
async fn signals_reach_the_signal_handler() -> anyhow::Result<()> {
    let (client, server) = rpc_pair();

    let (tx, rx) = futures_channel::oneshot::channel::<Value>();
    let tx = std::sync::Mutex::new(Some(tx));
    server.set_signal_handler(move |data| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(data.value.unwrap_or(Value::Null));
        }
        async move { Ok(()) }.boxed()
    });

    client
        .send_signal(OutgoingData::value(json!(["ping", 7])))
        .await?;

    assert_eq!(rx.await?, json!(["ping", 7]));
    Ok(())
}
