use std::collections::BTreeMap;
use std::future::Future;

use uuid::Uuid;

use crate::callback::CallbackPayload;
use crate::error::AppError;
use crate::models::{ExtractedRecord, Mode, NewRecord};
use crate::schema::{
    NavigationStep, NewSchema, PaginationRule, ParsingSchema, SchemaDefinition, SchemaFilter,
};

/// What to fetch, with the schema's header and cookie overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn for_schema(url: impl Into<String>, schema: &SchemaDefinition) -> Self {
        Self {
            url: url.into(),
            headers: schema.headers.clone(),
            cookies: schema.cookies.clone(),
        }
    }

    /// Same overrides, different URL.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..self.clone()
        }
    }

    /// `Cookie` header value, if any cookies are set.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Fetches raw HTML over plain HTTP.
pub trait Fetcher: Send + Sync + Clone + 'static {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// A page acquired by a [`PageSource`], valid for one task attempt.
pub trait PageHandle: Send {
    fn current_url(&self) -> &str;

    /// Current markup of the page.
    fn content(&mut self) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Perform one navigation action.
    fn perform(
        &mut self,
        step: &NavigationStep,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Move to page `next_page` (1-based). `Ok(false)` means there is none.
    fn advance(
        &mut self,
        rule: &PaginationRule,
        next_page: u32,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Release the page; never fails.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// One of the two page-acquisition strategies.
pub trait PageSource: Send + Sync + Clone + 'static {
    type Page: PageHandle;

    fn mode(&self) -> Mode;

    fn acquire(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<Self::Page, AppError>> + Send;
}

/// Versioned schema storage. Published versions are never modified.
pub trait SchemaStore: Send + Sync + Clone + 'static {
    /// Register a schema as version 1. It becomes the active schema of its
    /// source; any other active schema for that source is deactivated.
    fn create_schema(
        &self,
        schema: NewSchema,
    ) -> impl Future<Output = Result<ParsingSchema, AppError>> + Send;

    /// Publish the next version of an existing schema and reactivate it.
    fn publish_version(
        &self,
        schema_id: &str,
        definition: SchemaDefinition,
    ) -> impl Future<Output = Result<ParsingSchema, AppError>> + Send;

    /// A specific version, or the latest one when `version` is `None`.
    fn get_schema(
        &self,
        schema_id: &str,
        version: Option<u32>,
    ) -> impl Future<Output = Result<Option<ParsingSchema>, AppError>> + Send;

    /// Latest version of every schema matching the filter.
    fn list_schemas(
        &self,
        filter: &SchemaFilter,
    ) -> impl Future<Output = Result<Vec<ParsingSchema>, AppError>> + Send;

    /// Every version of a schema, oldest first. Empty when it is unknown.
    fn list_versions(
        &self,
        schema_id: &str,
    ) -> impl Future<Output = Result<Vec<ParsingSchema>, AppError>> + Send;

    /// Stop accepting new tasks for the schema. Versions are kept.
    fn deactivate_schema(
        &self,
        schema_id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Make the schema the active one of its source again, deactivating
    /// whichever schema currently holds that role.
    fn activate_schema(
        &self,
        schema_id: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persists extracted records.
pub trait RecordStore: Send + Sync + Clone + 'static {
    /// Store one page of records. Idempotent per `(task_id, record_hash)`;
    /// returns how many records were new.
    fn save_page(
        &self,
        task_id: Uuid,
        records: &[NewRecord],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn list_records(
        &self,
        task_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<ExtractedRecord>, AppError>> + Send;
}

/// A RecordStore that keeps nothing and counts every record as new.
#[derive(Debug, Clone)]
pub struct NullRecordStore;

impl RecordStore for NullRecordStore {
    async fn save_page(&self, _task_id: Uuid, records: &[NewRecord]) -> Result<u64, AppError> {
        Ok(records.len() as u64)
    }

    async fn list_records(
        &self,
        _task_id: Uuid,
        _limit: usize,
        _offset: usize,
    ) -> Result<Vec<ExtractedRecord>, AppError> {
        Ok(vec![])
    }
}

/// Delivers terminal-status callbacks.
pub trait Notifier: Send + Sync + Clone + 'static {
    fn notify(
        &self,
        url: &str,
        payload: &CallbackPayload,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}
