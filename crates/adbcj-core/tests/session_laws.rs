//! Pipeline behavior exercised through the public API with a recording
//! protocol backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use adbcj_core::{
    DbError, DbSession, MemoryTransport, ProtocolOps, Result, Transport, UpdateResult,
};

struct RecordingOps {
    sent: Mutex<Vec<String>>,
}

impl RecordingOps {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, op: impl Into<String>) -> Result<()> {
        self.sent.lock().unwrap().push(op.into());
        Ok(())
    }
}

impl ProtocolOps for RecordingOps {
    fn send_query(&self, sql: &str) -> Result<()> {
        self.record(format!("query:{}", sql))
    }

    fn send_begin(&self) -> Result<()> {
        self.record("begin")
    }

    fn send_commit(&self) -> Result<()> {
        self.record("commit")
    }

    fn send_rollback(&self) -> Result<()> {
        self.record("rollback")
    }

    fn send_terminate(&self) -> Result<()> {
        self.record("terminate")
    }
}

fn session() -> (Arc<DbSession>, Arc<RecordingOps>, Arc<MemoryTransport>) {
    let ops = RecordingOps::new();
    let transport = Arc::new(MemoryTransport::new());
    let ops_dyn: Arc<dyn ProtocolOps> = Arc::clone(&ops) as Arc<dyn ProtocolOps>;
    let transport_dyn: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
    let session = DbSession::new(ops_dyn, transport_dyn);
    (session, ops, transport)
}

#[test]
fn immediate_close_twice_yields_the_same_settled_future() {
    let (session, _ops, _transport) = session();
    let first = session.close(true);
    let second = session.close(true);
    assert!(session.is_closed());
    session.handle_transport_closed();
    assert!(first.is_done());
    assert!(second.is_done());
    first.get().unwrap();
    second.get().unwrap();
}

#[test]
fn cancelling_a_deferred_close_restores_the_session() {
    let (session, ops, _transport) = session();
    session.set_pipelining_enabled(false);
    let blocker = session.execute_update("u1").unwrap();

    let close = session.close(false);
    assert!(session.is_closed());
    assert!(close.cancel(false));
    assert!(!session.is_closed());

    // The queue accepts and executes new work.
    let follow_up = session.execute_update("u2").unwrap();
    session
        .active_request()
        .unwrap()
        .complete_update(UpdateResult::new(1));
    session
        .active_request()
        .unwrap()
        .complete_update(UpdateResult::new(1));
    assert_eq!(blocker.get().unwrap().affected_rows, 1);
    assert_eq!(follow_up.get().unwrap().affected_rows, 1);
    // The terminate frame never went out.
    assert_eq!(ops.sent(), vec!["query:u1", "query:u2"]);
}

#[test]
fn empty_transaction_rollback_is_wire_silent() {
    let (session, ops, _transport) = session();
    session.begin_transaction().unwrap();
    let rollback = session.rollback().unwrap();
    assert!(rollback.is_done());
    assert!(ops.sent().is_empty());
    assert!(!session.is_in_transaction());
}

#[test]
fn pipelined_updates_reach_the_wire_in_enqueue_order() {
    let (session, ops, _transport) = session();
    let futures: Vec<_> = (1..=5)
        .map(|i| {
            session
                .execute_update(&format!("INSERT INTO t VALUES ({})", i))
                .unwrap()
        })
        .collect();
    // Answer each in FIFO order, as the server would.
    for _ in 0..5 {
        session
            .active_request()
            .unwrap()
            .complete_update(UpdateResult::new(1));
    }
    let expected: Vec<String> = (1..=5)
        .map(|i| format!("query:INSERT INTO t VALUES ({})", i))
        .collect();
    assert_eq!(ops.sent(), expected);
    for future in futures {
        assert_eq!(future.get().unwrap().affected_rows, 1);
    }
}

#[test]
fn listeners_fire_exactly_once_before_and_after_settle() {
    let (session, _ops, _transport) = session();
    let future = session.execute_update("u1").unwrap();

    let early = Arc::new(AtomicUsize::new(0));
    {
        let early = Arc::clone(&early);
        future.add_listener(move |_| {
            early.fetch_add(1, Ordering::SeqCst);
        });
    }
    session
        .active_request()
        .unwrap()
        .complete_update(UpdateResult::new(1));

    let late = Arc::new(AtomicUsize::new(0));
    {
        let late = Arc::clone(&late);
        future.add_listener(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(early.load(Ordering::SeqCst), 1);
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_transaction_member_degrades_commit_to_rollback() {
    let (session, ops, _transport) = session();
    session.begin_transaction().unwrap();
    let failing = session.execute_update("bad").unwrap();

    // begin goes out first; complete it, then fail the member.
    session.active_request().unwrap().complete_unit();
    session
        .active_request()
        .unwrap()
        .error(DbError::protocol("server rejected the statement"));
    assert!(failing.is_done());

    let refused = session.execute_update("good").unwrap();
    assert!(matches!(refused.get(), Err(DbError::TransactionFailed(_))));

    let commit = session.commit().unwrap();
    assert_eq!(ops.sent().last().unwrap(), "rollback");
    session.active_request().unwrap().complete_unit();
    commit.get().unwrap();
}
