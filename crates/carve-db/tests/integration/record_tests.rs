use carve_core::models::{NewRecord, record_fingerprint};
use carve_core::task_queue::TaskQueue;
use carve_core::traits::{RecordStore, SchemaStore};
use carve_core::Mode;
use serde_json::json;

use crate::integration::common::{listing_schema, new_task, setup_test_db};

fn record(page: u32, title: &str) -> NewRecord {
    let data = json!({ "title": title });
    NewRecord {
        record_hash: record_fingerprint(&data, &[]),
        page,
        data,
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn saving_the_same_page_twice_is_idempotent() {
    let (db, _container) = setup_test_db().await;
    db.schema_repo().create_schema(listing_schema("listing", "shop")).await.unwrap();
    let task = db.task_repo().enqueue(new_task(3, Mode::Http)).await.unwrap();
    let records = db.record_repo();

    let page = vec![record(1, "a"), record(1, "b")];
    assert_eq!(records.save_page(task.id, &page).await.unwrap(), 2);
    assert_eq!(records.save_page(task.id, &page).await.unwrap(), 0);
    assert_eq!(
        records.save_page(task.id, &[record(2, "b"), record(2, "c")]).await.unwrap(),
        1
    );
    assert_eq!(records.count(task.id).await.unwrap(), 3);

    let listed = records.list_records(task.id, 2, 1).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[1].data["title"], "c");
    assert_eq!(listed[1].page, 2);
}
