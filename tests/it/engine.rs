use std::sync::{Arc, Mutex};

use futures_util::{StreamExt, TryStreamExt};
use grist_engine::{
    AbortSignal, ActionSet, CellValue, Cursor, CursorKind, DataEngine, DocAction, EngineOptions,
    Error, FilterExpr, Interrupt, OutgoingData, Query, RequestContext, StreamingOptions,
};
use serde_json::json;

use crate::common::{add_table1, add_table1_rows, engine_harness, numbered_table, unique_db};

fn ctx() -> RequestContext {
    RequestContext::default()
}

fn age_filter_gte_20() -> FilterExpr {
    serde_json::from_value(json!(["GtE", ["Name", "Age"], ["Const", 20]])).unwrap()
}

async fn engine_with(db_prefix: &str, actions: ActionSet) -> anyhow::Result<DataEngine> {
    let engine = DataEngine::connect(EngineOptions::new(unique_db(db_prefix))).await?;
    engine.apply_actions(&ctx(), actions).await?;
    Ok(engine)
}

#[tokio::test]
async fn table_lifecycle_over_rpc() -> anyhow::Result<()> {
    let harness = engine_harness("lifecycle").await?;

    let created = harness
        .client
        .apply_actions(&ActionSet::new(vec![add_table1()]))
        .await?;
    assert_eq!(created.results, vec![json!(null)]);

    harness
        .client
        .apply_actions(&ActionSet::new(vec![add_table1_rows()]))
        .await?;

    let result = harness.client.fetch_query(&Query::table("Table1")).await?;
    assert_eq!(result.table_id, "Table1");
    assert_eq!(
        result.table_data.col("id"),
        Some(&[1.into(), 2.into(), 3.into()][..])
    );
    assert_eq!(
        result.table_data.col("Name"),
        Some(&["A".into(), "B".into(), "C".into()][..])
    );
    assert_eq!(
        result.table_data.col("Age"),
        Some(&[10.into(), 20.into(), 30.into()][..])
    );
    Ok(())
}

#[tokio::test]
async fn filter_and_sort_over_rpc() -> anyhow::Result<()> {
    let harness = engine_harness("filter_sort").await?;
    harness
        .client
        .apply_actions(&ActionSet::new(vec![add_table1(), add_table1_rows()]))
        .await?;

    let mut query = Query::table("Table1");
    query.filters = Some(age_filter_gte_20());
    query.sort = Some(vec!["-Age".into()]);

    let result = harness.client.fetch_query(&query).await?;
    assert_eq!(
        result.table_data.col("id"),
        Some(&[3.into(), 2.into()][..])
    );
    Ok(())
}

#[tokio::test]
async fn cursor_pagination_pages_through_everything() -> anyhow::Result<()> {
    let engine = engine_with("pagination", numbered_table(3000)).await?;

    let mut cursor: Option<Cursor> = None;
    let mut batches: Vec<Vec<i64>> = Vec::new();
    loop {
        let mut query = Query::table("T");
        query.sort = Some(vec!["id".into()]);
        query.limit = Some(1000);
        query.cursor = cursor.clone();

        let result = engine.fetch_query(&ctx(), &query).await?;
        let ids: Vec<i64> = result
            .table_data
            .col("id")
            .unwrap()
            .iter()
            .map(|v| v.as_int().unwrap())
            .collect();
        if ids.is_empty() {
            break;
        }

        cursor = Some(Cursor(
            CursorKind::After,
            vec![CellValue::Int(*ids.last().unwrap())],
        ));
        batches.push(ids);
    }

    assert_eq!(batches.len(), 3);
    let all: Vec<i64> = batches.concat();
    assert_eq!(all, (1..=3000).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn streaming_yields_exact_chunks_and_totals() -> anyhow::Result<()> {
    const ROWS: i64 = 200_000;
    let engine = engine_with("big_stream", numbered_table(ROWS)).await?;

    let mut query = Query::table("T");
    query.sort = Some(vec!["id".into()]);
    let result = engine
        .fetch_query_streaming(
            &ctx(),
            &query,
            StreamingOptions {
                timeout_ms: 60_000,
                chunk_rows: 500,
            },
        )
        .await?;

    let id_index = result
        .value
        .col_ids
        .iter()
        .position(|c| c == "id")
        .unwrap();

    let mut chunks = 0usize;
    let mut rows = 0usize;
    let mut id_sum = 0i64;
    let mut stream = result.chunks;
    while let Some(chunk) = stream.try_next().await? {
        assert_eq!(chunk.len(), 500);
        chunks += 1;
        rows += chunk.len();
        for row in &chunk {
            id_sum += row[id_index].as_int().unwrap();
        }
    }

    assert_eq!(chunks, 400);
    assert_eq!(rows, 200_000);
    assert_eq!(id_sum, 20_000_100_000);
    Ok(())
}

#[tokio::test]
async fn cancelled_streaming_rejects_and_frees_the_handle() -> anyhow::Result<()> {
    // One pooled handle, so the follow-up read must reuse the first one.
    let options = EngineOptions::new(unique_db("cancel_stream")).max_connections(1);
    let engine = DataEngine::connect(options).await?;
    engine.apply_actions(&ctx(), numbered_table(5000)).await?;

    let (cancel, signal) = AbortSignal::new_pair();
    let result = engine
        .fetch_query_streaming(
            &RequestContext::new(signal),
            &Query::table("T"),
            StreamingOptions {
                timeout_ms: 60_000,
                chunk_rows: 100,
            },
        )
        .await?;

    let mut stream = result.chunks;
    let first = stream.try_next().await?.unwrap();
    assert_eq!(first.len(), 100);

    cancel.fire(Interrupt::Aborted("user closed the view".into()));
    let err = stream.try_next().await.unwrap_err();
    assert!(matches!(err, Error::Interrupted(Interrupt::Aborted(_))));

    // A fresh stream on the same (sole) handle succeeds.
    let again = engine
        .fetch_query_streaming(
            &ctx(),
            &Query::table("T"),
            StreamingOptions {
                timeout_ms: 60_000,
                chunk_rows: 1000,
            },
        )
        .await?;
    let total: usize = again
        .chunks
        .try_collect::<Vec<_>>()
        .await?
        .iter()
        .map(Vec::len)
        .sum();
    assert_eq!(total, 5000);
    Ok(())
}

#[tokio::test]
async fn zero_timeout_streaming_times_out() -> anyhow::Result<()> {
    let engine = engine_with("timeout", numbered_table(100)).await?;

    let result = engine
        .fetch_query_streaming(
            &ctx(),
            &Query::table("T"),
            StreamingOptions {
                timeout_ms: 0,
                chunk_rows: 10,
            },
        )
        .await?;

    let err = result.chunks.try_collect::<Vec<_>>().await.unwrap_err();
    assert!(matches!(err, Error::Interrupted(Interrupt::TimedOut)));
    Ok(())
}

#[tokio::test]
async fn streaming_concatenation_matches_plain_fetch() -> anyhow::Result<()> {
    let harness = engine_harness("stream_vs_fetch").await?;
    harness
        .client
        .apply_actions(&ActionSet::new(vec![add_table1(), add_table1_rows()]))
        .await?;
    harness
        .engine
        .apply_actions(&ctx(), numbered_table(1000))
        .await?;

    let mut query = Query::table("T");
    query.sort = Some(vec!["-N".into()]);

    let plain = harness.engine.fetch_query(&ctx(), &query).await?;
    let plain_ids: Vec<i64> = plain
        .table_data
        .col("id")
        .unwrap()
        .iter()
        .map(|v| v.as_int().unwrap())
        .collect();

    // Through the whole stack: engine stream -> RPC frames -> client stream.
    let mut streamed = harness
        .client
        .fetch_query_streaming(
            &query,
            StreamingOptions {
                timeout_ms: 10_000,
                chunk_rows: 64,
            },
            None,
        )
        .await?;
    let id_index = streamed
        .value
        .col_ids
        .iter()
        .position(|c| c == "id")
        .unwrap();

    let mut streamed_ids = Vec::new();
    while let Some(chunk) = streamed.try_next().await? {
        assert!(chunk.len() <= 64);
        for row in chunk {
            streamed_ids.push(row[id_index].as_int().unwrap());
        }
    }

    assert_eq!(streamed_ids, plain_ids);
    Ok(())
}

#[tokio::test]
async fn include_previous_projects_prior_row_ids() -> anyhow::Result<()> {
    let engine = engine_with(
        "previous",
        ActionSet::new(vec![add_table1(), add_table1_rows()]),
    )
    .await?;

    let mut query = Query::table("Table1");
    query.sort = Some(vec!["Age".into()]);
    query.include_previous = true;

    let result = engine.fetch_query(&ctx(), &query).await?;
    assert_eq!(
        result.table_data.col("_grist_Previous"),
        Some(&[CellValue::Null, 1.into(), 2.into()][..])
    );

    // Filtered out rows do not count as "previous".
    query.filters = Some(age_filter_gte_20());
    let result = engine.fetch_query(&ctx(), &query).await?;
    assert_eq!(
        result.table_data.col("_grist_Previous"),
        Some(&[CellValue::Null, 2.into()][..])
    );
    Ok(())
}

#[tokio::test]
async fn failed_action_sets_change_nothing_and_notify_nobody() -> anyhow::Result<()> {
    let engine = engine_with(
        "atomicity",
        ActionSet::new(vec![add_table1(), add_table1_rows()]),
    )
    .await?;

    let notified = Arc::new(Mutex::new(0usize));
    let count = Arc::clone(&notified);
    let _guard = engine.add_action_listener(&AbortSignal::inert(), move |_| {
        *count.lock().unwrap() += 1;
    });

    let bad_set = ActionSet::new(vec![
        DocAction::BulkRemoveRecord {
            table_id: "Table1".into(),
            row_ids: vec![1, 2, 3],
        },
        DocAction::RemoveTable {
            table_id: "Missing".into(),
        },
    ]);
    assert!(engine.apply_actions(&ctx(), bad_set).await.is_err());

    let result = engine.fetch_query(&ctx(), &Query::table("Table1")).await?;
    assert_eq!(result.table_data.num_rows(), Some(3));
    assert_eq!(*notified.lock().unwrap(), 0);
    Ok(())
}

#[tokio::test]
async fn large_broadcasts_are_stripped() -> anyhow::Result<()> {
    let engine = DataEngine::connect(EngineOptions::new(unique_db("stripping"))).await?;

    let seen: Arc<Mutex<Vec<ActionSet>>> = Arc::default();
    let sink = Arc::clone(&seen);
    let _guard = engine.add_action_listener(&AbortSignal::inert(), move |set| {
        sink.lock().unwrap().push(set.clone());
    });

    // 150 rows crosses the default threshold of 100.
    engine.apply_actions(&ctx(), numbered_table(150)).await?;
    // 3 rows stays under it.
    engine
        .apply_actions(
            &ctx(),
            ActionSet::new(vec![DocAction::BulkUpdateRecord {
                table_id: "T".into(),
                row_ids: vec![1, 2, 3],
                columns: [("N".to_owned(), vec![0.into(), 0.into(), 0.into()])]
                    .into_iter()
                    .collect(),
            }]),
        )
        .await?;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2, "exactly one notification per apply");

    match &seen[0].actions[1] {
        DocAction::BulkAddRecord {
            row_ids, columns, ..
        } => {
            assert!(row_ids.is_empty(), "large action must be stripped");
            assert_eq!(columns.col("N"), Some(&[][..]), "keys survive stripping");
        }
        other => panic!("unexpected action {other:?}"),
    }
    match &seen[1].actions[0] {
        DocAction::BulkUpdateRecord { row_ids, .. } => assert_eq!(row_ids, &[1, 2, 3]),
        other => panic!("unexpected action {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn action_broadcasts_reach_rpc_clients() -> anyhow::Result<()> {
    let harness = engine_harness("broadcast").await?;

    let (tx, mut rx) = futures_channel::mpsc::unbounded();
    harness.client.add_action_listener(move |set| {
        let _ = tx.unbounded_send(set.clone());
    });

    harness
        .client
        .apply_actions(&ActionSet::new(vec![add_table1(), add_table1_rows()]))
        .await?;

    let set = rx.next().await.expect("broadcast arrives");
    assert_eq!(set.actions.len(), 2);
    assert_eq!(set.actions[0], add_table1());
    Ok(())
}

#[tokio::test]
async fn listeners_die_with_their_connection() -> anyhow::Result<()> {
    let engine = DataEngine::connect(EngineOptions::new(unique_db("listener_scope"))).await?;

    let notified = Arc::new(Mutex::new(0usize));
    let count = Arc::clone(&notified);
    let (disconnect, signal) = AbortSignal::new_pair();
    engine
        .add_action_listener(&signal, move |_| {
            *count.lock().unwrap() += 1;
        })
        .detach();

    disconnect.fire(Interrupt::Disconnected("client went away".into()));
    engine.apply_actions(&ctx(), numbered_table(1)).await?;

    assert_eq!(*notified.lock().unwrap(), 0);
    Ok(())
}

#[tokio::test]
async fn unknown_methods_fail_with_a_documented_error() -> anyhow::Result<()> {
    let harness = engine_harness("unknown_method").await?;

    let err = harness
        .client_rpc
        .make_call(OutgoingData::value(json!(["definitelyNotAMethod"])), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownMethod(_)), "got {err}");
    Ok(())
}

#[tokio::test]
async fn filter_arity_violations_surface_as_builder_errors() -> anyhow::Result<()> {
    let harness = engine_harness("filter_arity").await?;
    harness
        .client
        .apply_actions(&ActionSet::new(vec![add_table1()]))
        .await?;

    // Eq with a single operand; the typed client cannot produce this, so
    // send the raw call payload.
    let payload = json!([
        "fetchQuery",
        { "tableId": "Table1", "filters": ["Eq", ["Name", "Age"]] }
    ]);
    let err = harness
        .client_rpc
        .make_call(OutgoingData::value(payload), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Builder(_)), "got {err}");

    // Unknown filter tags get the same classification.
    let payload = json!([
        "fetchQuery",
        { "tableId": "Table1", "filters": ["Nope", ["Const", 1]] }
    ]);
    let err = harness
        .client_rpc
        .make_call(OutgoingData::value(payload), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Builder(_)), "got {err}");
    Ok(())
}

#[tokio::test]
async fn builder_errors_surface_before_any_io() -> anyhow::Result<()> {
    let harness = engine_harness("builder_errors").await?;
    harness
        .client
        .apply_actions(&ActionSet::new(vec![add_table1()]))
        .await?;

    let mut query = Query::table("Table1");
    query.sort = Some(vec!["Age".into()]);
    query.cursor = Some(Cursor(CursorKind::Before, vec![10.into()]));

    let err = harness.client.fetch_query(&query).await.unwrap_err();
    assert!(matches!(err, Error::Builder(_)), "got {err}");
    Ok(())
}
