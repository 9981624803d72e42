use carve_client::{ReqwestFetcher, ReqwestNotifier};
use carve_core::service::{SchemaService, TaskService};
use carve_core::stats::StatsAggregator;
use carve_core::task_queue::TaskQueue;
use carve_core::traits::{RecordStore, SchemaStore};

/// Shared application state, available to all route handlers via
/// `State<Arc<AppState<..>>>`.
pub struct AppState<Q: TaskQueue, S: SchemaStore, R: RecordStore> {
    pub queue: Q,
    pub schemas: SchemaService<S>,
    pub tasks: TaskService<Q, S, R, ReqwestNotifier>,
    pub stats: StatsAggregator<Q>,
    /// Fetches sample pages for schema dry runs.
    pub fetcher: ReqwestFetcher,
    /// Bearer token required on every `/v1` route.
    pub api_key: String,
}

impl<Q: TaskQueue, S: SchemaStore, R: RecordStore> AppState<Q, S, R> {
    pub fn new(
        queue: Q,
        schemas: S,
        records: R,
        notifier: ReqwestNotifier,
        fetcher: ReqwestFetcher,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            schemas: SchemaService::new(schemas.clone()),
            tasks: TaskService::new(queue.clone(), schemas, records, notifier),
            stats: StatsAggregator::new(queue.clone()),
            fetcher,
            queue,
            api_key: api_key.into(),
        }
    }
}
