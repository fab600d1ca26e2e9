use std::sync::atomic::{AtomicU64, Ordering};

use grist_engine::{
    ActionSet, ChannelTransport, ColInfo, DataEngine, DocAction, EngineClient, EngineOptions,
    FrameReceiver, Rpc, TransportOptions, serve_engine,
};

/// Unique shared-cache memory database per test, so parallel tests never
/// step on each other.
pub fn unique_db(prefix: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("file:{prefix}_{id}?mode=memory&cache=shared")
}

/// Spawns the dispatch pump feeding a connection's inbound frames.
pub fn pump(rpc: Rpc<ChannelTransport>, incoming: FrameReceiver) {
    tokio::spawn(async move {
        while let Some(frame) = incoming.recv().await {
            rpc.dispatch_frame(&frame);
        }
    });
}

/// A connected pair of raw RPC endpoints with their pumps running.
pub fn rpc_pair() -> (Rpc<ChannelTransport>, Rpc<ChannelTransport>) {
    let ((left, left_in), (right, right_in)) = grist_engine::duplex(TransportOptions::default());
    let left = Rpc::new(left);
    let right = Rpc::new(right);
    pump(left.clone(), left_in);
    pump(right.clone(), right_in);
    (left, right)
}

pub struct Harness {
    pub client: EngineClient<ChannelTransport>,
    pub client_rpc: Rpc<ChannelTransport>,
    pub engine: DataEngine,
}

/// An engine served over an in-process connection, with a client attached.
pub async fn engine_harness(db_prefix: &str) -> anyhow::Result<Harness> {
    let engine = DataEngine::connect(EngineOptions::new(unique_db(db_prefix))).await?;

    let (client_rpc, server_rpc) = rpc_pair();
    serve_engine(&server_rpc, &engine);

    Ok(Harness {
        client: EngineClient::new(client_rpc.clone()),
        client_rpc,
        engine,
    })
}

/// `Table1(Name Text, Age Int)`.
pub fn add_table1() -> DocAction {
    DocAction::AddTable {
        table_id: "Table1".into(),
        columns: vec![
            ColInfo {
                id: "Name".into(),
                col_type: "Text".into(),
            },
            ColInfo {
                id: "Age".into(),
                col_type: "Int".into(),
            },
        ],
    }
}

/// Rows 1..=3 with names A, B, C and ages 10, 20, 30.
pub fn add_table1_rows() -> DocAction {
    DocAction::BulkAddRecord {
        table_id: "Table1".into(),
        row_ids: vec![1, 2, 3],
        columns: [
            (
                "Name".to_owned(),
                vec!["A".into(), "B".into(), "C".into()],
            ),
            ("Age".to_owned(), vec![10.into(), 20.into(), 30.into()]),
        ]
        .into_iter()
        .collect(),
    }
}

/// A table `T(N Int)` filled with rows `1..=rows`, `N = id`.
pub fn numbered_table(rows: i64) -> ActionSet {
    ActionSet::new(vec![
        DocAction::AddTable {
            table_id: "T".into(),
            columns: vec![ColInfo {
                id: "N".into(),
                col_type: "Int".into(),
            }],
        },
        DocAction::BulkAddRecord {
            table_id: "T".into(),
            row_ids: (1..=rows).collect(),
            columns: [(
                "N".to_owned(),
                (1..=rows).map(grist_engine::CellValue::Int).collect(),
            )]
            .into_iter()
            .collect(),
        },
    ])
}
