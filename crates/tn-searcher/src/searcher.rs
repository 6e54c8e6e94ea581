use tn_types::{ExitedReason, Operation, RequestId, SearcherError, ValidateAfter};

pub type SearcherResult<T> = Result<T, SearcherError>;

/// A hyperparameter search driven by trial events.
///
/// Every event method returns the batch of operations the experiment must
/// apply next. A searcher is owned by exactly one experiment and is never
/// called concurrently.
pub trait Searcher: Send + Sync {
    fn initial_operations(&mut self) -> SearcherResult<Vec<Operation>>;

    fn trial_created(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>>;

    fn validation_completed(
        &mut self,
        request_id: RequestId,
        metric: f64,
        op: &ValidateAfter,
    ) -> SearcherResult<Vec<Operation>>;

    fn trial_exited_early(
        &mut self,
        request_id: RequestId,
        reason: ExitedReason,
    ) -> SearcherResult<Vec<Operation>>;

    fn trial_closed(&mut self, request_id: RequestId) -> SearcherResult<Vec<Operation>>;

    fn set_trial_progress(&mut self, request_id: RequestId, progress: f64);

    /// Aggregate progress of the whole search in `[0, 1]`.
    fn progress(&self) -> f64;

    fn snapshot(&self) -> SearcherResult<serde_json::Value>;

    fn restore(&mut self, state: serde_json::Value) -> SearcherResult<()>;
}
