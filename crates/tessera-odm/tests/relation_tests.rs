//! Embedded population and cross-connection fetches against a live MongoDB
//!
//! See `common/mod.rs` for the required environment.

mod common;

use bson::{doc, oid::ObjectId, Bson, Document};
use common::*;
use tessera_odm::{PopulateOptions, TesseraError, WriteOptions};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn names(documents: &[Bson]) -> Vec<String> {
    documents
        .iter()
        .filter_map(|d| d.as_document())
        .filter_map(|d| d.get_str("name").ok().map(String::from))
        .collect()
}

#[tokio::test]
async fn test_populate_one_on_the_same_connection() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("rel_populate");
    let users = odm.model("user", user_schema(), options_for(&db))?;
    let posts = odm.model("post", post_schema(), options_for(&db))?;

    let ada = users.create(doc! { "name": "Ada" }).await?.get_object_id("_id")?;
    posts.create(doc! { "title": "Engines", "author": ada }).await?;
    posts.create(doc! { "title": "Anonymous" }).await?;

    let found = posts
        .find(doc! {})
        .sort(doc! { "title": 1 })
        .populate_one("author", &users, PopulateOptions::new())?
        .await?;
    assert_eq!(found.len(), 2);
    assert!(matches!(found[0].get("author"), None | Some(Bson::Null)));
    assert_eq!(found[1].get_document("author")?.get_str("name")?, "Ada");

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_nested_populate_keeps_parent_shape() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("rel_nested");
    let users = odm.model("user", user_schema(), options_for(&db))?;
    let posts = odm.model("post", post_schema(), options_for(&db))?;

    let grace = users.create(doc! { "name": "Grace" }).await?.get_object_id("_id")?;
    posts.create(doc! { "title": "A", "comments": Bson::Null }).await?;
    posts.create(doc! { "title": "B", "comments": [] }).await?;
    posts
        .create(doc! { "title": "C", "comments": [{ "body": "hi", "user": grace }] })
        .await?;

    let found = posts
        .find(doc! {})
        .sort(doc! { "title": 1 })
        .populate_one("comments.user", &users, PopulateOptions::new())?
        .await?;
    assert_eq!(found.len(), 3);

    assert!(matches!(found[0].get("comments"), None | Some(Bson::Null)));
    assert_eq!(found[1].get_array("comments")?, &Vec::<Bson>::new());

    let comments = found[2].get_array("comments")?;
    assert_eq!(comments.len(), 1);
    let first = comments[0].as_document().expect("comment");
    assert_eq!(first.get_str("body")?, "hi");
    assert_eq!(first.get_document("user")?.get_str("name")?, "Grace");

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_plural_populate_leaves_null_reference_absent() -> TestResult {
    let Some(odm) = connect_one().await? else {
        return Ok(());
    };
    let db = unique_database("rel_plural_null");
    let users = odm.model("user", user_schema(), options_for(&db))?;
    let posts = odm.model("post", post_schema(), options_for(&db))?;

    let ada = users.create(doc! { "name": "Ada" }).await?.get_object_id("_id")?;
    posts.create(doc! { "title": "A", "author": Bson::Null }).await?;
    posts.create(doc! { "title": "B" }).await?;
    posts.create(doc! { "title": "C", "author": ada }).await?;

    let found = posts
        .find(doc! {})
        .sort(doc! { "title": 1 })
        .populate("author", &users, PopulateOptions::new())?
        .await?;
    assert_eq!(found.len(), 3);
    for anonymous in &found[..2] {
        assert!(
            matches!(anonymous.get("author"), None | Some(Bson::Null)),
            "{:?}",
            anonymous
        );
    }
    assert_eq!(names(found[2].get_array("author")?), vec!["Ada"]);

    drop_database(&odm, 0, &db).await?;
    Ok(())
}

#[tokio::test]
async fn test_populate_across_connections_fails_eagerly() -> TestResult {
    let Some(odm) = connect_two().await? else {
        return Ok(());
    };
    let db = unique_database("rel_cross");
    let users = odm.model_on(1, "user", user_schema(), options_for(&db))?;
    let posts = odm.model_on(0, "post", post_schema(), options_for(&db))?;

    let err = posts
        .find(doc! {})
        .populate("author", &users, PopulateOptions::new())
        .err()
        .expect("cross-connection populate must fail");
    assert!(matches!(err, TesseraError::CrossConnection(_)));

    let session = odm.start_session(1).await?;
    let err = posts.find(doc! {}).session(&session).err().expect("foreign session");
    assert!(matches!(err, TesseraError::CrossConnection(_)));

    Ok(())
}

#[tokio::test]
async fn test_fetch_resolves_references_on_another_connection() -> TestResult {
    let Some(odm) = connect_two().await? else {
        return Ok(());
    };
    let db = unique_database("rel_fetch");
    let users = odm.model_on(1, "user", user_schema(), options_for(&db))?;
    let posts = odm.model_on(0, "post", post_schema(), options_for(&db))?;

    let created = users
        .create_many(
            vec![doc! { "name": "Ada" }, doc! { "name": "Grace" }],
            WriteOptions::default(),
        )
        .await?;
    let ada = created[0].get_object_id("_id")?;
    let grace = created[1].get_object_id("_id")?;
    let missing = ObjectId::new();

    posts
        .create(doc! {
            "title": "Engines",
            "author": ada,
            "editors": [grace, ada],
            "comments": [
                { "body": "first", "user": grace },
                { "body": "lost", "user": missing },
            ],
        })
        .await?;
    posts.create(doc! { "title": "Anonymous" }).await?;

    let found = posts
        .find(doc! {})
        .sort(doc! { "title": -1 })
        .fetch_one("author", &users, PopulateOptions::new())
        .fetch("editors", &users, PopulateOptions::new().sort(doc! { "name": 1 }))
        .fetch_one("comments.user", &users, PopulateOptions::new())
        .await?;

    let engines: &Document = &found[0];
    assert_eq!(engines.get_document("author")?.get_str("name")?, "Ada");
    assert_eq!(names(engines.get_array("editors")?), vec!["Ada", "Grace"]);

    let comments = engines.get_array("comments")?;
    let first = comments[0].as_document().expect("comment");
    assert_eq!(first.get_document("user")?.get_str("name")?, "Grace");
    let lost = comments[1].as_document().expect("comment");
    assert_eq!(lost.get("user"), Some(&Bson::Null));

    let anonymous = &found[1];
    assert!(anonymous.get("author").is_none());

    drop_database(&odm, 0, &db).await?;
    drop_database(&odm, 1, &db).await?;
    Ok(())
}
