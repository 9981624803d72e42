mod common;
mod record_tests;
mod schema_tests;
mod task_queue_tests;
