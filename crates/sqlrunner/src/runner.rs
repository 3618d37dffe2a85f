//! The query runner: one logical session over one native handle.

use crate::broadcaster::{AfterQueryEvent, Broadcaster, Event, QueryEvent};
use crate::dirty::DirtyTracker;
use crate::logger::{QueryLogger, TracingQueryLogger};
use crate::result::{QueryOutput, QueryResult};
use crate::transaction::{NativeAction, Plan, TransactionCoordinator, transition_error};
use sqlrunner_core::{
    ColumnInfo, ColumnMeta, Cx, Driver, Error, FlushError, IsolationLevel, NativeConnection,
    NativeStatement, Outcome, QueryExecutionError, Result, Row, StatementKind, StatementRequest,
    Value,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rows and counters captured from one native execution.
struct NativeRun {
    columns: Vec<ColumnMeta>,
    rows: Vec<Vec<Value>>,
    affected: u64,
    generated_id: Option<i64>,
}

/// Prepare, bind and drain a statement.
///
/// The statement is dropped before this returns, on success and on every
/// error path, so the native resource never outlives the call.
fn run_statement<C: NativeConnection>(
    conn: &mut C,
    sql: &str,
    params: &[Value],
    kind: StatementKind,
) -> Result<NativeRun> {
    let (columns, rows) = {
        let mut stmt = conn.prepare(sql)?;
        stmt.bind(params)?;
        let columns = stmt.columns().to_vec();
        let mut rows = Vec::new();
        while let Some(row) = stmt.next_row()? {
            rows.push(row);
        }
        (columns, rows)
    };

    let affected = conn.modified_row_count();
    // The engine's last id outlives the insert that produced it.
    let generated_id = if kind.generates_id() && affected > 0 {
        conn.last_insert_id()
    } else {
        None
    };

    Ok(NativeRun {
        columns,
        rows,
        affected,
        generated_id,
    })
}

/// A session bound to exactly one native handle.
///
/// Every operation takes `&mut self`, so overlapping calls on one session
/// cannot be expressed. Once [`release`](Self::release) succeeds the handle
/// is back with the driver and every further call fails with
/// [`Error::SessionReleased`].
///
/// Dropping a runner without releasing it rolls back any open transaction
/// and returns the handle, but never flushes.
pub struct QueryRunner<D: Driver> {
    driver: Arc<D>,
    handle: Option<D::Handle>,
    broadcaster: Broadcaster,
    logger: Arc<dyn QueryLogger>,
    transactions: TransactionCoordinator,
    dirty: DirtyTracker,
}

impl<D: Driver> fmt::Debug for QueryRunner<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRunner")
            .field("driver", &self.driver.name())
            .field("released", &self.is_released())
            .field("depth", &self.transactions.depth())
            .field("dirty", &self.dirty.is_dirty())
            .finish_non_exhaustive()
    }
}

impl<D: Driver> QueryRunner<D> {
    /// Bind a session to an already-open handle.
    pub fn new(driver: Arc<D>, handle: D::Handle, broadcaster: Broadcaster) -> Self {
        let options = driver.options();
        let logger = Arc::new(TracingQueryLogger::new(options.logging));
        let transactions =
            TransactionCoordinator::new(driver.capabilities(), options.nested_transactions);
        Self {
            driver,
            handle: Some(handle),
            broadcaster,
            logger,
            transactions,
            dirty: DirtyTracker::new(),
        }
    }

    /// Replace the query logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn QueryLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn is_released(&self) -> bool {
        self.handle.is_none()
    }

    /// Whether mutations are waiting for a flush.
    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty()
    }

    pub fn transaction_depth(&self) -> u32 {
        self.transactions.depth()
    }

    pub fn is_transaction_active(&self) -> bool {
        self.transactions.is_active()
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Execute one statement.
    #[tracing::instrument(level = "debug", skip(self, cx, request), fields(sql = %request.sql()))]
    pub async fn execute(&mut self, cx: &Cx, request: StatementRequest) -> Outcome<QueryOutput, Error> {
        if self.handle.is_none() {
            return Outcome::Err(Error::SessionReleased);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let kind = request.kind();
        let sql: Arc<str> = Arc::from(request.sql());
        let params: Arc<[Value]> = Arc::from(request.bound_params());

        self.logger.log_query(&sql, &params);
        self.broadcaster
            .publish(&Event::BeforeQuery(QueryEvent {
                sql: Arc::clone(&sql),
                params: Arc::clone(&params),
            }))
            .await;

        let Some(handle) = self.handle.as_mut() else {
            return Outcome::Err(Error::SessionReleased);
        };
        let started = Instant::now();
        let run = run_statement(handle, &sql, &params, kind);
        let elapsed = started.elapsed();

        match run {
            Ok(run) => {
                self.check_slow(elapsed, &sql, &params);
                let result = self.shape(run);
                if !kind.is_read() {
                    self.dirty.mark();
                }
                tracing::trace!(
                    rows = result.rows.len(),
                    affected = result.affected,
                    "Statement completed"
                );

                self.broadcaster
                    .publish(&Event::AfterQuery(AfterQueryEvent {
                        sql,
                        params,
                        success: true,
                        execution_time: Some(elapsed),
                        rows: Some(Arc::from(result.rows.clone())),
                        error: None,
                    }))
                    .await;

                Outcome::Ok(QueryOutput::shape(result, request.wants_structured()))
            }
            Err(cause) => {
                self.logger.log_query_error(&cause, &sql, &params);
                let cause = Arc::new(cause);

                self.broadcaster
                    .publish(&Event::AfterQuery(AfterQueryEvent {
                        sql: Arc::clone(&sql),
                        params: Arc::clone(&params),
                        success: false,
                        execution_time: None,
                        rows: None,
                        error: Some(Arc::clone(&cause)),
                    }))
                    .await;

                Outcome::Err(Error::QueryExecution(QueryExecutionError {
                    sql: sql.to_string(),
                    params: params.to_vec(),
                    cause,
                }))
            }
        }
    }

    /// Execute and return raw rows.
    pub async fn query(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<Vec<Row>, Error> {
        let request = StatementRequest::with_params(sql, params.iter().cloned());
        match self.execute(cx, request).await {
            Outcome::Ok(output) => Outcome::Ok(output.into_rows()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Execute and return the structured result.
    pub async fn query_structured(
        &mut self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> Outcome<QueryResult, Error> {
        let request = StatementRequest::with_params(sql, params.iter().cloned()).structured();
        match self.execute(cx, request).await {
            Outcome::Ok(QueryOutput::Structured(result)) => Outcome::Ok(result),
            Outcome::Ok(QueryOutput::Raw(rows)) => Outcome::Ok(QueryResult {
                rows,
                ..QueryResult::default()
            }),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn check_slow(&self, elapsed: Duration, sql: &str, params: &[Value]) {
        if let Some(threshold) = self.driver.options().max_query_execution_time {
            if elapsed > threshold {
                self.logger.log_query_slow(elapsed, sql, params);
            }
        }
    }

    fn shape(&self, run: NativeRun) -> QueryResult {
        let columns = Arc::new(ColumnInfo::new(
            run.columns.iter().map(|c| c.name.clone()).collect(),
        ));
        let rows = run
            .rows
            .into_iter()
            .map(|values| {
                let values = values
                    .into_iter()
                    .zip(&run.columns)
                    .map(|(value, meta)| self.driver.coerce(meta, value))
                    .collect();
                Row::with_columns(Arc::clone(&columns), values)
            })
            .collect();

        QueryResult {
            affected: run.affected,
            rows,
            generated_id: run.generated_id,
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begin a transaction, or a savepoint when one is already open.
    pub async fn begin_transaction(
        &mut self,
        cx: &Cx,
        isolation: Option<IsolationLevel>,
    ) -> Outcome<(), Error> {
        if self.handle.is_none() {
            return Outcome::Err(Error::SessionReleased);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let plan = match self.transactions.plan_begin(isolation) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };

        let depth = self.transactions.depth();
        self.broadcaster
            .publish(&Event::BeforeTransactionStart { depth })
            .await;

        if let Err(e) = self.apply(&plan) {
            return Outcome::Err(e);
        }
        self.transactions.settle(&plan);
        self.dirty.enter();
        tracing::debug!(depth = plan.depth_after, action = ?plan.action, "Transaction started");

        self.broadcaster
            .publish(&Event::AfterTransactionStart {
                depth: plan.depth_after,
            })
            .await;
        Outcome::Ok(())
    }

    /// Commit the innermost open level. Reaching depth 0 flushes.
    pub async fn commit_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.handle.is_none() {
            return Outcome::Err(Error::SessionReleased);
        }
        let plan = match self.transactions.plan_commit() {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };

        let depth = self.transactions.depth();
        self.broadcaster
            .publish(&Event::BeforeTransactionCommit { depth })
            .await;

        if let Err(e) = self.apply(&plan) {
            return Outcome::Err(e);
        }
        self.transactions.settle(&plan);
        self.dirty.commit();
        tracing::debug!(depth = plan.depth_after, action = ?plan.action, "Transaction committed");

        self.broadcaster
            .publish(&Event::AfterTransactionCommit {
                depth: plan.depth_after,
            })
            .await;

        if plan.depth_after == 0 {
            return self.flush_pending(cx).await;
        }
        Outcome::Ok(())
    }

    /// Roll back the innermost open level. Never flushes.
    ///
    /// When the engine discards the level's changes, the dirty flag returns
    /// to its value at the matching begin. Mutations made before that begin
    /// stay pending, so a session that was dirty before the transaction is
    /// still dirty afterwards and still needs a flush.
    pub async fn rollback_transaction(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.handle.is_none() {
            return Outcome::Err(Error::SessionReleased);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let plan = match self.transactions.plan_rollback() {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };

        let depth = self.transactions.depth();
        self.broadcaster
            .publish(&Event::BeforeTransactionRollback { depth })
            .await;

        if let Err(e) = self.apply(&plan) {
            return Outcome::Err(e);
        }
        self.transactions.settle(&plan);
        self.dirty.rollback(plan.action.discards_changes());
        tracing::debug!(depth = plan.depth_after, action = ?plan.action, "Transaction rolled back");

        self.broadcaster
            .publish(&Event::AfterTransactionRollback {
                depth: plan.depth_after,
            })
            .await;
        Outcome::Ok(())
    }

    fn apply(&mut self, plan: &Plan) -> Result<()> {
        let handle = self.handle.as_mut().ok_or(Error::SessionReleased)?;
        plan.action
            .apply(handle)
            .map_err(|e| transition_error(plan.transition, e))
    }

    // ========================================================================
    // Persistence and lifecycle
    // ========================================================================

    /// Persist pending mutations.
    ///
    /// Inside a transaction this is deferred to the outermost commit.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.handle.is_none() {
            return Outcome::Err(Error::SessionReleased);
        }
        if self.transactions.is_active() {
            tracing::debug!(
                depth = self.transactions.depth(),
                "Flush deferred until the outermost commit"
            );
            return Outcome::Ok(());
        }
        self.flush_pending(cx).await
    }

    async fn flush_pending(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.dirty.is_dirty() {
            return Outcome::Ok(());
        }
        let Some(handle) = self.handle.as_mut() else {
            return Outcome::Err(Error::SessionReleased);
        };

        match self.driver.persist(cx, handle).await {
            Outcome::Ok(()) => {
                self.dirty.clear();
                tracing::debug!(driver = self.driver.name(), "Flushed pending mutations");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(Error::Flush(FlushError {
                message: format!("{} could not persist pending mutations", self.driver.name()),
                cause: Box::new(e),
            })),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Run the driver's pre-migration statements.
    pub async fn before_migration(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let statements = self.driver.before_migration_sql();
        self.run_all(cx, statements).await
    }

    /// Run the driver's post-migration statements.
    pub async fn after_migration(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let statements = self.driver.after_migration_sql();
        self.run_all(cx, statements).await
    }

    async fn run_all(&mut self, cx: &Cx, statements: &[&str]) -> Outcome<(), Error> {
        for sql in statements {
            match self.execute(cx, StatementRequest::new(*sql)).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    /// Flush, then hand the native handle back to the driver.
    ///
    /// An open transaction is rolled back first. If the flush fails the
    /// session stays usable so the release can be retried.
    pub async fn release(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.handle.is_none() {
            return Outcome::Err(Error::SessionReleased);
        }

        if self.transactions.is_active() {
            tracing::warn!(
                depth = self.transactions.depth(),
                "Releasing query runner with an open transaction; rolling back"
            );
            let discarded = self.abandon_transaction();
            self.dirty.reset_levels(discarded);
        }

        match self.flush_pending(cx).await {
            Outcome::Ok(()) => {}
            other => return other,
        }

        if let Some(handle) = self.handle.take() {
            self.driver.release_handle(handle);
        }
        tracing::debug!(driver = self.driver.name(), "Query runner released");
        Outcome::Ok(())
    }

    /// Roll back every open level natively. Returns whether the engine
    /// discarded the changes.
    fn abandon_transaction(&mut self) -> bool {
        let capabilities = self.driver.capabilities();
        self.transactions.reset();
        if !capabilities.supports_native_transactions {
            return false;
        }
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        match NativeAction::Rollback.apply(handle) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Rollback of abandoned transaction failed");
                false
            }
        }
    }
}

impl<D: Driver> Drop for QueryRunner<D> {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if self.transactions.is_active() {
            self.abandon_transaction();
        }
        if self.dirty.is_dirty() {
            tracing::warn!(
                driver = self.driver.name(),
                "Query runner dropped with unflushed mutations"
            );
        }
        if let Some(handle) = self.handle.take() {
            self.driver.release_handle(handle);
        }
    }
}
