pub mod cache;
pub mod callback;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod http_source;
pub mod memory;
pub mod models;
pub mod navigation;
pub mod pagination;
pub mod resolver;
pub mod schema;
pub mod selector;
pub mod service;
pub mod state;
pub mod stats;
pub mod task;
pub mod task_queue;
pub mod throttle;
pub mod traits;
pub mod transform;
pub mod util;
pub mod worker;

#[cfg(test)]
pub mod testutil;

pub use error::AppError;
pub use models::{ErrorKind, ExtractedRecord, Mode, NewRecord, TaskError, compute_hash};
pub use schema::{FieldDefinition, NewSchema, ParsingSchema, SchemaDefinition, SchemaFilter};
pub use task::{CreateTaskRequest, Task, TaskFilter, TaskPage, TaskStatus};
pub use task_queue::TaskQueue;
pub use traits::{FetchRequest, Fetcher, Notifier, PageHandle, PageSource, RecordStore, SchemaStore};
