//! Server façade: exposes the engine's method surface over an RPC
//! connection and broadcasts applied action sets as signals.

use futures_util::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::{
    actions::ActionSet,
    engine::{DataEngine, RequestContext},
    error::{Error, Result},
    query::{Query, StreamingOptions},
    rpc::{IncomingData, OutgoingData, Rpc, signal::AbortSignal, transport::Transport},
};

/// Wires an engine to one connection: installs the call handler for the
/// method surface and registers the per-connection action listener that
/// turns every applied action set into an `("action", actionSet)` signal.
/// Both are torn down by the connection's disconnect signal.
pub fn serve_engine<T: Transport>(rpc: &Rpc<T>, engine: &DataEngine) {
    let call_engine = engine.clone();
    rpc.set_call_handler(move |data, abort| {
        let engine = call_engine.clone();
        async move { handle_call(&engine, data, abort).await }.boxed()
    });

    let signal_rpc = rpc.clone();
    engine
        .add_action_listener(&rpc.disconnect_signal(), move |set| {
            let payload = match serde_json::to_value(set) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to encode action broadcast");
                    return;
                }
            };

            let rpc = signal_rpc.clone();
            tokio::spawn(async move {
                let data = OutgoingData::value(json!(["action", payload]));
                if let Err(err) = rpc.send_signal(data).await {
                    if !err.is_interrupt() {
                        tracing::warn!(error = %err, "failed to broadcast action set");
                    }
                }
            });
        })
        .detach();
}

async fn handle_call(
    engine: &DataEngine,
    data: IncomingData,
    abort: AbortSignal,
) -> Result<OutgoingData> {
    let value = data
        .value
        .ok_or_else(|| Error::protocol("call payload is missing"))?;
    let Value::Array(items) = value else {
        return Err(Error::protocol("call payload must be [method, ...args]"));
    };

    let mut items = items.into_iter();
    let method = match items.next() {
        Some(Value::String(method)) => method,
        _ => return Err(Error::protocol("method name must be a string")),
    };
    let args: Vec<Value> = items.collect();
    tracing::debug!(%method, args = args.len(), "handling engine call");

    let ctx = RequestContext::new(abort);
    match method.as_str() {
        "fetchQuery" => {
            let query = parse_query(&args, 0)?;
            let result = engine.fetch_query(&ctx, &query).await?;
            Ok(OutgoingData::value(serde_json::to_value(result)?))
        }
        "fetchQueryStreaming" => {
            let query = parse_query(&args, 0)?;
            let options: StreamingOptions = parse_arg(&args, 1, "streaming options")?;
            let result = engine.fetch_query_streaming(&ctx, &query, options).await?;

            let chunks = result
                .chunks
                .map(|chunk| chunk.and_then(|rows| Ok(serde_json::to_value(rows)?)))
                .boxed();
            Ok(OutgoingData::streamed(
                serde_json::to_value(result.value)?,
                chunks,
            ))
        }
        "applyActions" => {
            let actions: ActionSet = parse_arg(&args, 0, "action set")?;
            let result = engine.apply_actions(&ctx, actions).await?;
            Ok(OutgoingData::value(serde_json::to_value(result)?))
        }
        other => Err(Error::UnknownMethod(other.to_owned())),
    }
}

fn parse_arg<T: DeserializeOwned>(args: &[Value], index: usize, what: &str) -> Result<T> {
    let value = args
        .get(index)
        .ok_or_else(|| Error::protocol(format!("call is missing its {what} argument")))?;
    serde_json::from_value(value.clone())
        .map_err(|err| Error::protocol(format!("invalid {what}: {err}")))
}

/// Query arguments decode through [`Query::from_json`]: shape violations in
/// the query description (filter arity, unknown tags) are builder errors,
/// not malformed-payload errors.
fn parse_query(args: &[Value], index: usize) -> Result<Query> {
    let value = args
        .get(index)
        .ok_or_else(|| Error::protocol("call is missing its query argument"))?;
    Query::from_json(value.clone())
}
