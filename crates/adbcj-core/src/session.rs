//! The per-session request pipeline.
//!
//! A session owns one transport connection and a FIFO of outstanding
//! requests. At most one request is *active* (awaiting its protocol
//! response) at a time; completing it promotes the next. When pipelining is
//! on, the frames of queued pipelinable requests are written ahead of their
//! predecessors' responses — responses still arrive in submission order on
//! the one connection, so completion matching stays FIFO.
//!
//! The session is protocol-neutral: backends supply a [`ProtocolOps`]
//! capability that knows how to put BEGIN/COMMIT/ROLLBACK, queries and the
//! terminate frame on the wire.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};

use crate::error::{DbError, Result};
use crate::future::{DbFuture, DbSessionFuture};
use crate::result::{ResultEventHandler, ResultSet, ResultSetHandler, UpdateResult};
use crate::transport::Transport;
use crate::{Field, Value};

/// The outbound capability a protocol backend provides to the session core.
///
/// Implementations must put all frames of one operation on the wire with a
/// single [`Transport::write`] call, so concurrently issued operations never
/// interleave their bytes.
pub trait ProtocolOps: Send + Sync {
    /// Write the frames that execute one SQL statement.
    fn send_query(&self, sql: &str) -> Result<()>;
    fn send_begin(&self) -> Result<()>;
    fn send_commit(&self) -> Result<()>;
    fn send_rollback(&self) -> Result<()>;
    /// Write the protocol's termination frame.
    fn send_terminate(&self) -> Result<()>;
}

// ==================== Requests ====================

/// The closed set of operations a session queues.
enum RequestKind {
    Query { sql: String },
    Update { sql: String },
    Begin { transaction: Arc<Transaction> },
    Commit { transaction: Arc<Transaction> },
    Rollback,
    /// Deferred close: sends terminate when it reaches the head of the queue.
    CloseDeferred,
    /// Immediate-close marker; never executes, settles when the transport
    /// reports closed.
    CloseSentinel,
}

impl RequestKind {
    fn pipelinable(&self) -> bool {
        // COMMIT and the close requests fence the pipeline.
        !matches!(
            self,
            RequestKind::Commit { .. } | RequestKind::CloseDeferred | RequestKind::CloseSentinel
        )
    }

    fn removable(&self) -> bool {
        !matches!(self, RequestKind::Commit { .. })
    }

    fn cancellable(&self) -> bool {
        // A rollback, once scheduled, always runs; an immediate close is final.
        !matches!(self, RequestKind::Rollback | RequestKind::CloseSentinel)
    }

    fn describe(&self) -> &'static str {
        match self {
            RequestKind::Query { .. } => "query",
            RequestKind::Update { .. } => "update",
            RequestKind::Begin { .. } => "begin",
            RequestKind::Commit { .. } => "commit",
            RequestKind::Rollback => "rollback",
            RequestKind::CloseDeferred => "deferred close",
            RequestKind::CloseSentinel => "immediate close",
        }
    }
}

/// Type-erased streaming sink for a query request: the event handler, its
/// accumulator and the typed future, behind one object-safe face.
trait RowEvents: Send + Sync {
    fn start_fields(&self);
    fn field(&self, field: Field);
    fn end_fields(&self);
    fn start_results(&self);
    fn start_row(&self);
    fn value(&self, value: Value);
    fn end_row(&self);
    /// Run `end_results` and settle the future with the accumulator.
    fn end_results(&self) -> Result<()>;
    /// Drive the exception callback and settle the future with the error.
    fn fail(&self, error: &DbError) -> Result<()>;
    fn settle_cancelled(&self) -> Result<()>;
    fn is_done(&self) -> bool;
}

struct TypedSink<T, H> {
    handler: H,
    accumulator: Mutex<Option<T>>,
    future: DbFuture<T>,
}

impl<T: Send + 'static, H: ResultEventHandler<T> + Sync> RowEvents for TypedSink<T, H> {
    fn start_fields(&self) {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.start_fields(acc);
        }
    }

    fn field(&self, field: Field) {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.field(field, acc);
        }
    }

    fn end_fields(&self) {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.end_fields(acc);
        }
    }

    fn start_results(&self) {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.start_results(acc);
        }
    }

    fn start_row(&self) {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.start_row(acc);
        }
    }

    fn value(&self, value: Value) {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.value(value, acc);
        }
    }

    fn end_row(&self) {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.end_row(acc);
        }
    }

    fn end_results(&self) -> Result<()> {
        let acc = self.accumulator.lock().unwrap().take();
        match acc {
            Some(mut acc) => {
                self.handler.end_results(&mut acc);
                self.future.set_result(acc)
            }
            None => Err(DbError::AlreadySettled(
                "results already delivered".to_string(),
            )),
        }
    }

    fn fail(&self, error: &DbError) -> Result<()> {
        if let Some(acc) = self.accumulator.lock().unwrap().as_mut() {
            self.handler.exception(error, acc);
        }
        self.future.set_error(error.clone())
    }

    fn settle_cancelled(&self) -> Result<()> {
        self.future.settle_cancelled()
    }

    fn is_done(&self) -> bool {
        self.future.is_done()
    }
}

/// Completion slot of a request, matching its operation shape.
enum Sink {
    Rows(Box<dyn RowEvents>),
    Update(DbFuture<UpdateResult>),
    Unit(DbFuture<()>),
}

#[derive(Default)]
struct RequestFlags {
    executed: bool,
    cancelled: bool,
}

enum ExecuteAction {
    Run,
    DegradeToRollback,
    Skip,
}

/// A queued operation paired with the future for its result.
pub struct Request {
    session: Weak<DbSession>,
    kind: RequestKind,
    sink: Sink,
    flags: Mutex<RequestFlags>,
    /// Protocol scratch slot; holds field descriptors between messages.
    payload: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    /// The transaction this request belongs to, if any.
    transaction: Mutex<Option<Arc<Transaction>>>,
}

impl Request {
    fn new(session: Weak<DbSession>, kind: RequestKind, sink: Sink) -> Arc<Self> {
        Arc::new(Self {
            session,
            kind,
            sink,
            flags: Mutex::new(RequestFlags::default()),
            payload: Mutex::new(None),
            transaction: Mutex::new(None),
        })
    }

    /// True once the request's future has settled.
    pub fn is_done(&self) -> bool {
        match &self.sink {
            Sink::Rows(sink) => sink.is_done(),
            Sink::Update(future) => future.is_done(),
            Sink::Unit(future) => future.is_done(),
        }
    }

    fn pipelinable(&self) -> bool {
        self.kind.pipelinable()
    }

    fn was_started(&self) -> bool {
        let flags = self.flags.lock().unwrap();
        flags.executed || flags.cancelled
    }

    // -------------------- streaming events --------------------

    pub fn start_fields(&self) {
        if let Sink::Rows(sink) = &self.sink {
            sink.start_fields();
        }
    }

    pub fn field(&self, field: Field) {
        if let Sink::Rows(sink) = &self.sink {
            sink.field(field);
        }
    }

    pub fn end_fields(&self) {
        if let Sink::Rows(sink) = &self.sink {
            sink.end_fields();
        }
    }

    pub fn start_results(&self) {
        if let Sink::Rows(sink) = &self.sink {
            sink.start_results();
        }
    }

    pub fn start_row(&self) {
        if let Sink::Rows(sink) = &self.sink {
            sink.start_row();
        }
    }

    pub fn value(&self, value: Value) {
        if let Sink::Rows(sink) = &self.sink {
            sink.value(value);
        }
    }

    pub fn end_row(&self) {
        if let Sink::Rows(sink) = &self.sink {
            sink.end_row();
        }
    }

    // -------------------- completion --------------------

    /// Complete a query request: `end_results` plus the accumulator as the
    /// future's value. Promotes the next request.
    pub fn complete_results(&self) {
        let outcome = match &self.sink {
            Sink::Rows(sink) => sink.end_results(),
            Sink::Update(future) => future.set_result(UpdateResult::default()),
            Sink::Unit(future) => future.set_result(()),
        };
        self.finish(outcome);
    }

    /// Complete a data-modifying request with its update count.
    pub fn complete_update(&self, result: UpdateResult) {
        let outcome = match &self.sink {
            Sink::Rows(sink) => sink.end_results(),
            Sink::Update(future) => future.set_result(result),
            Sink::Unit(future) => future.set_result(()),
        };
        self.finish(outcome);
    }

    /// Complete a control request (BEGIN/COMMIT/ROLLBACK/close).
    pub fn complete_unit(&self) {
        let outcome = match &self.sink {
            Sink::Rows(sink) => sink.end_results(),
            Sink::Update(future) => future.set_result(UpdateResult::default()),
            Sink::Unit(future) => future.set_result(()),
        };
        self.finish(outcome);
    }

    fn finish(&self, outcome: Result<()>) {
        if let Err(e) = outcome {
            // A cancelled-then-answered request lands here; nothing to do.
            trace!(
                "completion on settled {} request: {}",
                self.kind.describe(),
                e
            );
        }
        if let Some(session) = self.session.upgrade() {
            session.promote_if_active(self);
        }
    }

    /// Settle the request with an error, cancel its transaction siblings,
    /// and promote the next request.
    pub fn error(&self, error: DbError) {
        if let Err(e) = self.fail_sink(&error) {
            trace!("error on settled {} request: {}", self.kind.describe(), e);
        }
        let transaction = self.transaction.lock().unwrap().clone();
        if let Some(transaction) = transaction {
            transaction.cancel_pending();
        }
        if let Some(session) = self.session.upgrade() {
            session.promote_if_active(self);
        }
    }

    /// Settle with an error without touching transaction or queue state.
    fn fail_sink(&self, error: &DbError) -> Result<()> {
        match &self.sink {
            Sink::Rows(sink) => sink.fail(error),
            Sink::Update(future) => future.set_error(error.clone()),
            Sink::Unit(future) => future.set_error(error.clone()),
        }
    }

    fn settle_cancelled_sink(&self) -> Result<()> {
        match &self.sink {
            Sink::Rows(sink) => sink.settle_cancelled(),
            Sink::Update(future) => future.settle_cancelled(),
            Sink::Unit(future) => future.settle_cancelled(),
        }
    }

    fn unit_future(&self) -> Option<DbFuture<()>> {
        match &self.sink {
            Sink::Unit(future) => Some(future.clone()),
            _ => None,
        }
    }

    /// Cancel the request. Fails once the request's frames are on the wire
    /// (no attention signal is sent to the server).
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        match self.session.upgrade() {
            Some(session) => session.cancel_request(self, may_interrupt),
            None => false,
        }
    }

    /// True when the request belongs to a transaction.
    pub fn in_transaction(&self) -> bool {
        self.transaction.lock().unwrap().is_some()
    }

    // -------------------- payload --------------------

    pub fn set_payload(&self, payload: Arc<dyn Any + Send + Sync>) {
        *self.payload.lock().unwrap() = Some(payload);
    }

    pub fn payload(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.payload.lock().unwrap().clone()
    }

    // -------------------- execution --------------------

    fn set_transaction(&self, transaction: &Arc<Transaction>) {
        *self.transaction.lock().unwrap() = Some(Arc::clone(transaction));
    }

    /// Claim the execution slot: marks the request executed and reports
    /// what to do. A cancelled COMMIT on a started transaction degrades to
    /// ROLLBACK instead of skipping.
    fn begin_execution(&self) -> ExecuteAction {
        let mut flags = self.flags.lock().unwrap();
        if flags.executed {
            ExecuteAction::Skip
        } else if flags.cancelled {
            match &self.kind {
                RequestKind::Commit { transaction } if transaction.is_started() => {
                    flags.executed = true;
                    ExecuteAction::DegradeToRollback
                }
                _ => ExecuteAction::Skip,
            }
        } else {
            flags.executed = true;
            ExecuteAction::Run
        }
    }

    /// Fire the request's thunk unless it already ran or was cancelled.
    /// A cancelled, not-yet-executed request skips its thunk and triggers
    /// promotion.
    fn invoke_execute(&self, session: &DbSession) -> Result<()> {
        match self.begin_execution() {
            ExecuteAction::Skip => {
                if self.is_done() {
                    session.promote_if_active(self);
                }
                Ok(())
            }
            ExecuteAction::DegradeToRollback => session.ops.send_rollback(),
            ExecuteAction::Run => self.execute(session),
        }
    }

    /// `invoke_execute` for the enqueue fast path, which runs under the
    /// session lock: a request being enqueued is never the active request,
    /// so the skip path must not try to promote.
    fn invoke_execute_inline(&self, session: &DbSession) -> Result<()> {
        match self.begin_execution() {
            ExecuteAction::Skip => Ok(()),
            ExecuteAction::DegradeToRollback => session.ops.send_rollback(),
            ExecuteAction::Run => self.execute(session),
        }
    }

    fn execute(&self, session: &DbSession) -> Result<()> {
        trace!("executing {} request", self.kind.describe());
        match &self.kind {
            RequestKind::Query { sql } | RequestKind::Update { sql } => {
                session.ops.send_query(sql)
            }
            RequestKind::Begin { transaction } => {
                transaction.mark_started();
                session.ops.send_begin()
            }
            RequestKind::Commit { transaction } => {
                if transaction.is_cancelled() {
                    if transaction.is_started() {
                        session.ops.send_rollback()
                    } else {
                        // The BEGIN never reached the server; nothing to undo.
                        let _ = self.fail_sink(&DbError::TransactionFailed(
                            "transaction failed before commit".to_string(),
                        ));
                        session.promote_if_active(self);
                        Ok(())
                    }
                } else {
                    session.ops.send_commit()
                }
            }
            RequestKind::Rollback => session.ops.send_rollback(),
            RequestKind::CloseDeferred => session.ops.send_terminate(),
            RequestKind::CloseSentinel => Ok(()),
        }
    }
}

// ==================== Transactions ====================

/// A logical grouping of requests issued between BEGIN and COMMIT/ROLLBACK.
pub struct Transaction {
    started: AtomicBool,
    begin_scheduled: AtomicBool,
    cancelled: AtomicBool,
    members: Mutex<Vec<Weak<Request>>>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            begin_scheduled: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            members: Mutex::new(Vec::new()),
        }
    }

    /// True once BEGIN has actually been sent to the server.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// True once a BEGIN request has been enqueued.
    pub fn is_begin_scheduled(&self) -> bool {
        self.begin_scheduled.load(Ordering::SeqCst)
    }

    /// Mark BEGIN as scheduled; true when this call was the first.
    fn schedule_begin(&self) -> bool {
        !self.begin_scheduled.swap(true, Ordering::SeqCst)
    }

    /// True once a member failed or the transaction was rolled back.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, request: &Arc<Request>) {
        self.members.lock().unwrap().push(Arc::downgrade(request));
    }

    /// Cancel every still-pending member. Idempotent: the first caller wins,
    /// so a COMMIT cancelled through its own transaction cannot re-enter.
    pub fn cancel_pending(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let members: Vec<Weak<Request>> = self.members.lock().unwrap().clone();
        for member in members {
            if let Some(request) = member.upgrade() {
                request.cancel(false);
            }
        }
    }
}

// ==================== Session ====================

struct PipelineState {
    queue: VecDeque<Arc<Request>>,
    active: Option<Arc<Request>>,
    transaction: Option<Arc<Transaction>>,
    pipelining: bool,
    close_request: Option<Arc<Request>>,
}

enum EnqueueOutcome {
    /// Appended; true means no request was active, so promotion is due.
    Appended(bool),
    /// The pipelining fast path executed the thunk and it failed.
    FailedInline(DbError),
}

/// One logical database connection's local state machine.
pub struct DbSession {
    ops: Arc<dyn ProtocolOps>,
    transport: Arc<dyn Transport>,
    pipelining_enabled: AtomicBool,
    state: Mutex<PipelineState>,
    weak_self: Weak<DbSession>,
}

impl DbSession {
    pub fn new(ops: Arc<dyn ProtocolOps>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            ops,
            transport,
            pipelining_enabled: AtomicBool::new(true),
            state: Mutex::new(PipelineState {
                queue: VecDeque::new(),
                active: None,
                transaction: None,
                pipelining: false,
                close_request: None,
            }),
            weak_self: weak_self.clone(),
        })
    }

    fn arc(&self) -> Arc<DbSession> {
        self.weak_self
            .upgrade()
            .expect("session invoked while being dropped")
    }

    pub fn is_pipelining_enabled(&self) -> bool {
        self.pipelining_enabled.load(Ordering::SeqCst)
    }

    pub fn set_pipelining_enabled(&self, enabled: bool) {
        self.pipelining_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.state.lock().unwrap().pipelining = false;
        }
    }

    /// The transport this session writes to.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// The request currently awaiting its protocol response.
    pub fn active_request(&self) -> Option<Arc<Request>> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().close_request.is_some() || self.transport.is_closing()
    }

    fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            Err(DbError::SessionClosed(
                "this connection has been closed".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    // -------------------- queries --------------------

    /// Execute a query, accumulating rows into a [`ResultSet`].
    pub fn execute_query(&self, sql: &str) -> Result<DbSessionFuture<ResultSet>> {
        self.execute_query_with(sql, ResultSetHandler, ResultSet::new())
    }

    /// Execute a query with a custom streaming handler and accumulator.
    pub fn execute_query_with<T, H>(
        &self,
        sql: &str,
        handler: H,
        accumulator: T,
    ) -> Result<DbSessionFuture<T>>
    where
        T: Send + 'static,
        H: ResultEventHandler<T> + Sync + 'static,
    {
        self.check_closed()?;
        let future = DbFuture::new();
        let sink = TypedSink {
            handler,
            accumulator: Mutex::new(Some(accumulator)),
            future: future.clone(),
        };
        let request = Request::new(
            self.weak_self.clone(),
            RequestKind::Query {
                sql: sql.to_string(),
            },
            Sink::Rows(Box::new(sink)),
        );
        self.install_cancel_hook(&future, &request);
        self.enqueue_transactional(request);
        Ok(DbSessionFuture::new(future, self.arc()))
    }

    /// Execute a data-modifying statement.
    pub fn execute_update(&self, sql: &str) -> Result<DbSessionFuture<UpdateResult>> {
        self.check_closed()?;
        let future = DbFuture::new();
        let request = Request::new(
            self.weak_self.clone(),
            RequestKind::Update {
                sql: sql.to_string(),
            },
            Sink::Update(future.clone()),
        );
        self.install_cancel_hook(&future, &request);
        self.enqueue_transactional(request);
        Ok(DbSessionFuture::new(future, self.arc()))
    }

    fn install_cancel_hook<T>(&self, future: &DbFuture<T>, request: &Arc<Request>) {
        let weak = Arc::downgrade(request);
        future.set_cancel_hook(Box::new(move |may_interrupt| {
            weak.upgrade()
                .map(|request| request.cancel(may_interrupt))
                .unwrap_or(false)
        }));
    }

    // -------------------- transactions --------------------

    pub fn is_in_transaction(&self) -> bool {
        self.state.lock().unwrap().transaction.is_some()
    }

    /// Open a transaction. BEGIN is only put on the wire once the first
    /// member request is enqueued.
    pub fn begin_transaction(&self) -> Result<()> {
        self.check_closed()?;
        let mut state = self.state.lock().unwrap();
        if state.transaction.is_some() {
            return Err(DbError::TransactionFailed(
                "already in a transaction; commit or roll back first".to_string(),
            ));
        }
        state.transaction = Some(Arc::new(Transaction::new()));
        Ok(())
    }

    pub fn commit(&self) -> Result<DbSessionFuture<()>> {
        self.check_closed()?;
        let transaction = self
            .state
            .lock()
            .unwrap()
            .transaction
            .take()
            .ok_or_else(|| {
                DbError::TransactionFailed("not in a transaction, cannot commit".to_string())
            })?;
        if !transaction.is_begin_scheduled() {
            // Nothing ever reached the server.
            return Ok(DbSessionFuture::new(DbFuture::completed(()), self.arc()));
        }
        let future = DbFuture::new();
        let request = Request::new(
            self.weak_self.clone(),
            RequestKind::Commit {
                transaction: Arc::clone(&transaction),
            },
            Sink::Unit(future.clone()),
        );
        self.install_cancel_hook(&future, &request);
        transaction.register(&request);
        request.set_transaction(&transaction);
        self.enqueue(request);
        Ok(DbSessionFuture::new(future, self.arc()))
    }

    pub fn rollback(&self) -> Result<DbSessionFuture<()>> {
        self.check_closed()?;
        let transaction = self
            .state
            .lock()
            .unwrap()
            .transaction
            .take()
            .ok_or_else(|| {
                DbError::TransactionFailed("not in a transaction, cannot rollback".to_string())
            })?;
        if !transaction.is_begin_scheduled() {
            return Ok(DbSessionFuture::new(DbFuture::completed(()), self.arc()));
        }
        transaction.cancel_pending();
        let future = DbFuture::new();
        let request = Request::new(
            self.weak_self.clone(),
            RequestKind::Rollback,
            Sink::Unit(future.clone()),
        );
        // No cancel hook: a scheduled rollback always runs.
        transaction.register(&request);
        request.set_transaction(&transaction);
        self.enqueue(request);
        Ok(DbSessionFuture::new(future, self.arc()))
    }

    // -------------------- close --------------------

    /// Close the session. `immediate` cancels pending work and terminates at
    /// once; otherwise a deferred close runs after the queued requests and
    /// can itself be cancelled, which "uncloses" the session.
    pub fn close(&self, immediate: bool) -> DbSessionFuture<()> {
        if let Some(existing) = self.existing_close_future() {
            return DbSessionFuture::new(existing, self.arc());
        }
        if immediate {
            debug!("executing immediate close");
            let future = DbFuture::new();
            let request = Request::new(
                self.weak_self.clone(),
                RequestKind::CloseSentinel,
                Sink::Unit(future.clone()),
            );
            {
                let mut state = self.state.lock().unwrap();
                if let Some(request) = &state.close_request {
                    let future = request.unit_future().unwrap_or_default();
                    return DbSessionFuture::new(future, self.arc());
                }
                state.close_request = Some(request);
            }
            self.cancel_pending_requests(true);
            if let Err(e) = self.ops.send_terminate() {
                debug!("terminate on immediate close failed: {}", e);
                self.handle_transport_closed();
            }
            self.transport.close();
            DbSessionFuture::new(future, self.arc())
        } else {
            let future = DbFuture::new();
            let request = Request::new(
                self.weak_self.clone(),
                RequestKind::CloseDeferred,
                Sink::Unit(future.clone()),
            );
            self.install_cancel_hook(&future, &request);
            {
                let mut state = self.state.lock().unwrap();
                if let Some(request) = &state.close_request {
                    let future = request.unit_future().unwrap_or_default();
                    return DbSessionFuture::new(future, self.arc());
                }
                state.close_request = Some(Arc::clone(&request));
            }
            self.enqueue(request);
            DbSessionFuture::new(future, self.arc())
        }
    }

    fn existing_close_future(&self) -> Option<DbFuture<()>> {
        let mut state = self.state.lock().unwrap();
        if let Some(request) = &state.close_request {
            return request.unit_future();
        }
        if self.transport.is_closing() {
            // Transport died underneath us; surface a settled close.
            let future = DbFuture::completed(());
            let request = Request::new(
                Weak::new(),
                RequestKind::CloseSentinel,
                Sink::Unit(future.clone()),
            );
            state.close_request = Some(request);
            return Some(future);
        }
        None
    }

    fn unclose(&self) {
        debug!("unclosing session");
        self.state.lock().unwrap().close_request = None;
    }

    /// Cancel every queued (not yet active) request.
    pub fn cancel_pending_requests(&self, may_interrupt: bool) {
        let queued: Vec<Arc<Request>> =
            self.state.lock().unwrap().queue.iter().cloned().collect();
        for request in queued {
            request.cancel(may_interrupt);
        }
    }

    /// The transport reported itself closed: settle the close future and
    /// error out everything still outstanding.
    pub fn handle_transport_closed(&self) {
        let close_request = self.state.lock().unwrap().close_request.clone();
        if let Some(request) = close_request {
            request.complete_unit();
        }
        self.error_pending_requests(DbError::transport_msg("connection closed"));
    }

    /// Settle the active request and every queued request with `error`,
    /// best-effort: individual settle failures are swallowed.
    pub fn error_pending_requests(&self, error: DbError) {
        let (active, queued) = {
            let state = self.state.lock().unwrap();
            (
                state.active.clone(),
                state.queue.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if let Some(request) = active {
            if !request.is_done() {
                let _ = request.fail_sink(&error);
            }
        }
        for request in queued {
            if !request.is_done() {
                let _ = request.fail_sink(&error);
            }
        }
    }

    // -------------------- pipeline internals --------------------

    fn enqueue_transactional(&self, request: Arc<Request>) {
        let mut failed: Option<Arc<Request>> = None;
        let mut inline_failure: Vec<(Arc<Request>, DbError)> = Vec::new();
        let mut need_promote = false;
        {
            let mut state = self.state.lock().unwrap();
            let transaction = state.transaction.clone();
            match transaction {
                Some(transaction) if transaction.is_cancelled() => {
                    failed = Some(request);
                }
                Some(transaction) => {
                    if transaction.schedule_begin() {
                        let begin = Request::new(
                            self.weak_self.clone(),
                            RequestKind::Begin {
                                transaction: Arc::clone(&transaction),
                            },
                            Sink::Unit(DbFuture::new()),
                        );
                        transaction.register(&begin);
                        begin.set_transaction(&transaction);
                        match self.enqueue_locked(&mut state, Arc::clone(&begin)) {
                            EnqueueOutcome::Appended(promote) => need_promote |= promote,
                            EnqueueOutcome::FailedInline(e) => {
                                // Settle after the lock is released.
                                inline_failure.push((begin, e));
                            }
                        }
                    }
                    transaction.register(&request);
                    request.set_transaction(&transaction);
                    match self.enqueue_locked(&mut state, Arc::clone(&request)) {
                        EnqueueOutcome::Appended(promote) => need_promote |= promote,
                        EnqueueOutcome::FailedInline(e) => inline_failure.push((request, e)),
                    }
                }
                None => match self.enqueue_locked(&mut state, Arc::clone(&request)) {
                    EnqueueOutcome::Appended(promote) => need_promote |= promote,
                    EnqueueOutcome::FailedInline(e) => inline_failure.push((request, e)),
                },
            }
        }
        if let Some(request) = failed {
            let _ = request.fail_sink(&DbError::TransactionFailed(
                "could not execute request; transaction is in a failed state".to_string(),
            ));
            return;
        }
        for (request, error) in inline_failure {
            request.error(error);
        }
        if need_promote {
            self.promote_next();
        }
    }

    fn enqueue(&self, request: Arc<Request>) {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            self.enqueue_locked(&mut state, Arc::clone(&request))
        };
        match outcome {
            EnqueueOutcome::Appended(true) => self.promote_next(),
            EnqueueOutcome::Appended(false) => {}
            EnqueueOutcome::FailedInline(error) => request.error(error),
        }
    }

    /// Append under the session lock. In pipelining mode a pipelinable
    /// request's frames go out right here, atomically with the append, so
    /// wire order always matches queue order.
    fn enqueue_locked(&self, state: &mut PipelineState, request: Arc<Request>) -> EnqueueOutcome {
        if request.pipelinable() {
            if state.pipelining && self.is_pipelining_enabled() {
                trace!("pipelining {} request", request.kind.describe());
                if let Err(e) = request.invoke_execute_inline(self) {
                    return EnqueueOutcome::FailedInline(e);
                }
                if request.is_done() {
                    // Settled synchronously; nothing to match a response to.
                    return EnqueueOutcome::Appended(false);
                }
            }
        } else {
            state.pipelining = false;
        }
        state.queue.push_back(request);
        EnqueueOutcome::Appended(state.active.is_none())
    }

    /// Called by a settled request: promote the next if it was active.
    pub(crate) fn promote_if_active(&self, request: &Request) {
        let is_active = {
            let state = self.state.lock().unwrap();
            matches!(&state.active, Some(active) if std::ptr::eq(Arc::as_ptr(active), request))
        };
        if is_active && request.is_done() {
            self.promote_next();
        }
    }

    fn promote_next(&self) {
        let (request, walk) = {
            let mut state = self.state.lock().unwrap();
            if let Some(active) = &state.active {
                if !active.is_done() {
                    // Another promoter got here first.
                    return;
                }
            }
            let request = state.queue.pop_front();
            let mut walk = false;
            if self.is_pipelining_enabled() {
                if let Some(request) = &request {
                    if request.pipelinable() {
                        walk = !state.pipelining;
                    } else {
                        state.pipelining = false;
                    }
                }
            }
            state.active = request.clone();
            (request, walk)
        };
        let Some(request) = request else {
            return;
        };
        debug!("promoting {} request", request.kind.describe());
        self.run_execute(&request);
        if walk {
            self.execute_pipelined_prefix();
        }
    }

    /// Execute the pipelinable prefix of the queue in order. When the prefix
    /// reaches the end of the queue, the session enters pipelining mode and
    /// later arrivals execute as they are enqueued.
    fn execute_pipelined_prefix(&self) {
        let mut executed_any = false;
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                let mut candidate = None;
                let mut fenced = false;
                for request in state.queue.iter() {
                    if !request.pipelinable() {
                        fenced = true;
                        break;
                    }
                    if !request.was_started() {
                        candidate = Some(Arc::clone(request));
                        break;
                    }
                }
                match candidate {
                    Some(request) => request,
                    None => {
                        if executed_any && !fenced {
                            trace!("entering pipelining mode");
                            state.pipelining = true;
                        }
                        return;
                    }
                }
            };
            self.run_execute(&next);
            executed_any = true;
        }
    }

    fn run_execute(&self, request: &Arc<Request>) {
        if let Err(e) = request.invoke_execute(self) {
            request.error(e);
        }
    }

    /// The request-cancellation path: refuse once executed, run the
    /// variant's cancellation side effects, settle, remove, promote.
    fn cancel_request(&self, request: &Request, _may_interrupt: bool) -> bool {
        {
            let mut flags = request.flags.lock().unwrap();
            if flags.executed || flags.cancelled {
                return false;
            }
            if !request.kind.cancellable() {
                return false;
            }
            flags.cancelled = true;
        }
        match &request.kind {
            RequestKind::Commit { transaction } => transaction.cancel_pending(),
            RequestKind::CloseDeferred => self.unclose(),
            _ => {}
        }
        let _ = request.settle_cancelled_sink();
        if request.kind.removable() {
            {
                let mut state = self.state.lock().unwrap();
                state
                    .queue
                    .retain(|queued| !std::ptr::eq(Arc::as_ptr(queued), request));
            }
            self.promote_if_active(request);
        }
        true
    }
}
