//! CRUD, hooks, validation and caching against a live MongoDB
//!
//! See `common/mod.rs` for the required environment.

mod common;

use bson::{doc, oid::ObjectId, Bson};
use common::*;
use std::sync::Arc;
use tessera_odm::{
    CacheOptions, FindOptions, MemoryCache, Resolve, TesseraError, WriteOptions,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::test]
async fn test_create_and_find_by_id() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_create");
    let users = odm.model("user", user_schema(), options_for(&db))?;

    let created = users.create(doc! { "name": "Ada" }).await?;
    assert_eq!(created.keys().next().map(String::as_str), Some("_id"));
    assert_eq!(created.get_i32("age")?, 0);
    let id = created.get_object_id("_id")?;

    let by_id = users.find_one(id).await?.expect("document by id");
    let by_hex = users.find_one(id.to_hex()).await?.expect("document by hex");
    let by_filter = users.find_one(doc! { "_id": id }).await?.expect("document by filter");
    assert_eq!(by_id, by_filter);
    assert_eq!(by_hex, by_filter);

    assert!(users.find_one(ObjectId::new()).await?.is_none());
    let err = users.find_one_or_fail(ObjectId::new()).await.unwrap_err();
    assert!(matches!(err, TesseraError::NotFound(_)));

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_documents_are_rejected_before_insert() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_invalid");
    let users = odm.model("user", user_schema(), options_for(&db))?;

    let err = users.create(doc! { "age": "old" }).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(users.count(doc! {}).await?, 0);

    let raw = users
        .create_with(doc! { "unchecked": true }, WriteOptions::default().validate(false))
        .await?;
    assert!(raw.get_bool("unchecked")?);

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_create_many_count_and_exists() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_many");
    let users = odm.model("user", user_schema(), options_for(&db))?;

    assert_eq!(users.count(doc! {}).await?, 0);
    assert!(!users.exists(doc! {}).await?);

    let created = users
        .create_many(
            vec![
                doc! { "name": "Ada", "age": 36 },
                doc! { "name": "Grace", "age": 45 },
                doc! { "name": "Linus", "age": 20 },
            ],
            WriteOptions::default(),
        )
        .await?;
    assert_eq!(created.len(), 3);
    assert!(created.iter().all(|d| d.get_object_id("_id").is_ok()));

    assert_eq!(users.count(doc! { "age": { "$gt": 30 } }).await?, 2);
    assert!(users.exists(doc! { "name": "Grace" }).await?);

    let names: Vec<String> = users
        .find(doc! {})
        .sort(doc! { "age": -1 })
        .project(doc! { "name": 1 })
        .skip(1)
        .await?
        .iter()
        .filter_map(|d| d.get_str("name").ok().map(String::from))
        .collect();
    assert_eq!(names, vec!["Ada", "Linus"]);

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_update_validates_touched_paths_only() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_update");
    let users = odm.model("user", user_schema(), options_for(&db))?;
    let id = users
        .create(doc! { "name": "Ada", "tags": ["math"] })
        .await?
        .get_object_id("_id")?;

    let outcome = users
        .update_one(id, doc! { "profile.city": "London" })
        .updates(doc! { "$push": { "tags": "poetry" }, "$inc": { "age": 1 } })
        .await?;
    assert_eq!(outcome.modified_count, 1);
    assert_eq!(
        outcome.modifications(),
        &doc! { "profile": { "city": "London" }, "tags": ["poetry"] }
    );

    let stored = users.find_one_or_fail(id).await?.expect("find_one_or_fail yields Some on success");
    assert_eq!(stored.get_document("profile")?.get_str("city")?, "London");
    assert_eq!(stored.get_array("tags")?, &vec![Bson::from("math"), Bson::from("poetry")]);
    assert_eq!(stored.get_i32("age")?, 1);

    let err = users
        .update_one(id, doc! { "$push": { "tags": { "not": "a string" } } })
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = users.update_one(id, doc! { "name": 42 }).await.unwrap_err();
    assert!(err.is_validation());

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_or_fail_variants() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_or_fail");
    let users = odm.model("user", user_schema(), options_for(&db))?;

    let err = users
        .update_one_or_fail(ObjectId::new(), doc! { "name": "x" })
        .await
        .unwrap_err();
    assert!(matches!(err, TesseraError::NotFound(_)));

    let err = users.delete_one_or_fail(ObjectId::new()).await.unwrap_err();
    assert!(matches!(err, TesseraError::NotFound(_)));

    users.create(doc! { "name": "Ada" }).await?;
    let deleted = users.delete_many_or_fail(doc! { "name": "Ada" }).await?;
    assert_eq!(deleted.deleted_count, 1);

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_find_and_mutate_composites() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_composite");
    let users = odm.model("user", user_schema(), options_for(&db))?;
    let id = users.create(doc! { "name": "Ada", "age": 1 }).await?.get_object_id("_id")?;

    let after = users
        .update_and_find_one(id, doc! { "age": 2 })
        .await?
        .expect("updated document");
    assert_eq!(after.get_i32("age")?, 2);

    let before = users
        .find_and_update_one(id, doc! { "age": 3 })
        .await?
        .expect("previous document");
    assert_eq!(before.get_i32("age")?, 2);

    let removed = users.find_and_delete_many(doc! { "name": "Ada" }).await?;
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].get_i32("age")?, 3);
    assert_eq!(users.count(doc! {}).await?, 0);

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_replace_one_validates_the_whole_document() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_replace");
    let users = odm.model("user", user_schema(), options_for(&db))?;
    let id = users.create(doc! { "name": "Ada", "age": 36 }).await?.get_object_id("_id")?;

    let err = users
        .replace_one(id, doc! { "age": 1 }, WriteOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let result = users
        .replace_one(id, doc! { "name": "Grace" }, WriteOptions::default())
        .await?;
    assert_eq!(result.modified_count, 1);

    let stored = users.find_one_or_fail(id).await?.expect("find_one_or_fail yields Some on success");
    assert_eq!(stored.get_str("name")?, "Grace");
    assert_eq!(stored.get_i32("age")?, 0);

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_hooks_fold_in_registration_order() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_hooks");
    let users = odm.model("user", user_schema(), options_for(&db))?;

    users.hooks().pre_create(|event| async move {
        let mut data = event.data;
        let name = format!("{}!", data.get_str("name").unwrap_or_default());
        data.insert("name", name);
        Ok(data)
    });
    users.hooks().pre_create(|event| async move {
        let mut data = event.data;
        let name = format!("{}?", data.get_str("name").unwrap_or_default());
        data.insert("name", name);
        Ok(data)
    });
    users.hooks().post_read(|event| async move {
        let mut data = event.data;
        data.remove("age");
        Ok(data)
    });

    let created = users.create(doc! { "name": "Ada" }).await?;
    assert_eq!(created.get_str("name")?, "Ada!?");

    let found = users.find_one_or_fail(doc! { "name": "Ada!?" }).await?.expect("find_one_or_fail yields Some on success");
    assert!(!found.contains_key("age"));

    users.hooks().pre_delete(|_| async move {
        Err::<bson::Document, _>(TesseraError::Query("deletes are disabled".to_string()))
    });
    assert!(users.delete_many(doc! {}).await.is_err());
    assert_eq!(users.count(doc! {}).await?, 1);

    users.hooks().post_update(|mut event| async move {
        event.updates.remove("$inc");
        Ok(event)
    });
    let outcome = users
        .update_one(doc! { "name": "Ada!?" }, doc! { "$inc": { "age": 1 }, "tags": ["x"] })
        .await?;
    assert_eq!(outcome.modified_count, 1);
    assert_eq!(outcome.updates, doc! { "$set": { "tags": ["x"] } });

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_cached_find_skips_the_database_on_hit() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("crud_cache");
    let users = odm.model("user", user_schema(), options_for(&db))?;
    odm.set_cache_provider(Arc::new(MemoryCache::new()));

    users.create(doc! { "name": "Ada" }).await?;
    let options = FindOptions::default().cache(CacheOptions::new("users:all"));

    let mut query = users.find_with(doc! {}, options.clone());
    assert_eq!(query.resolve().await?.len(), 1);

    users.create(doc! { "name": "Grace" }).await?;
    assert_eq!(query.resolve().await?.len(), 1);
    assert_eq!(users.find(doc! {}).await?.len(), 2);

    drop_database(&odm, 0, &db).await?;
    Ok(())
}
