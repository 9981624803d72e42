use carve_core::AppError;
use carve_core::schema::SchemaFilter;
use carve_core::traits::SchemaStore;

use crate::integration::common::{listing_schema, setup_test_db};

#[tokio::test]
#[ignore = "requires docker"]
async fn publish_appends_versions_and_keeps_old_ones() {
    let (db, _container) = setup_test_db().await;
    let repo = db.schema_repo();

    let v1 = repo.create_schema(listing_schema("listing", "shop")).await.unwrap();
    assert_eq!(v1.version, 1);
    assert!(v1.is_active);

    let mut definition = listing_schema("listing", "shop").definition;
    definition.rate_limit_delay_ms = 500;
    let v2 = repo.publish_version("listing", definition).await.unwrap();
    assert_eq!(v2.version, 2);

    let latest = repo.get_schema("listing", None).await.unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(latest.definition.rate_limit_delay_ms, 500);

    let pinned = repo.get_schema("listing", Some(1)).await.unwrap().unwrap();
    assert_eq!(pinned.definition, v1.definition);
    assert!(repo.get_schema("listing", Some(3)).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn duplicate_create_conflicts_and_unknown_publish_is_not_found() {
    let (db, _container) = setup_test_db().await;
    let repo = db.schema_repo();
    repo.create_schema(listing_schema("listing", "shop")).await.unwrap();

    let dup = repo.create_schema(listing_schema("listing", "shop")).await;
    assert!(matches!(dup, Err(AppError::Conflict(_))));

    let missing = repo
        .publish_version("nope", listing_schema("nope", "shop").definition)
        .await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn one_active_schema_per_source() {
    let (db, _container) = setup_test_db().await;
    let repo = db.schema_repo();
    repo.create_schema(listing_schema("listing", "shop")).await.unwrap();
    repo.create_schema(listing_schema("listing_v2", "shop")).await.unwrap();
    repo.create_schema(listing_schema("books", "library")).await.unwrap();

    let active = repo
        .list_schemas(&SchemaFilter {
            source_id: Some("shop".into()),
            active_only: true,
        })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].schema_id, "listing_v2");

    // Publishing the old schema makes it the active one again.
    repo.publish_version("listing", listing_schema("listing", "shop").definition)
        .await
        .unwrap();
    let old = repo.get_schema("listing_v2", None).await.unwrap().unwrap();
    assert!(!old.is_active);

    let all = repo.list_schemas(&SchemaFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn deactivate_unknown_schema_is_not_found() {
    let (db, _container) = setup_test_db().await;
    let repo = db.schema_repo();
    repo.create_schema(listing_schema("listing", "shop")).await.unwrap();

    repo.deactivate_schema("listing").await.unwrap();
    let schema = repo.get_schema("listing", None).await.unwrap().unwrap();
    assert!(!schema.is_active);
    assert!(matches!(
        repo.deactivate_schema("nope").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn versions_are_listed_and_reactivation_supersedes_sibling() {
    let (db, _container) = setup_test_db().await;
    let repo = db.schema_repo();
    repo.create_schema(listing_schema("listing", "shop")).await.unwrap();
    repo.publish_version("listing", listing_schema("listing", "shop").definition)
        .await
        .unwrap();
    repo.create_schema(listing_schema("listing_v2", "shop")).await.unwrap();

    let versions = repo.list_versions("listing").await.unwrap();
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), [1, 2]);
    assert!(versions.iter().all(|v| !v.is_active));

    repo.activate_schema("listing").await.unwrap();
    assert!(repo.get_schema("listing", None).await.unwrap().unwrap().is_active);
    assert!(!repo.get_schema("listing_v2", None).await.unwrap().unwrap().is_active);

    assert!(matches!(
        repo.activate_schema("nope").await,
        Err(AppError::NotFound(_))
    ));
}
