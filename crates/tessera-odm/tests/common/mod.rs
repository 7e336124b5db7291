//! Helpers shared by the database-backed tests
//!
//! These tests need a running MongoDB. Set `MONGODB_URL` (with a default
//! database, e.g. `mongodb://localhost:27017/tessera_test`) to run them;
//! without it every test returns early. `MONGODB_URL_2` is used for the
//! second connection when set, otherwise both indexes use `MONGODB_URL`.
//!
//! Run with: cargo test -p tessera-odm --tests

#![allow(dead_code)]

use bson::{oid::ObjectId, Bson};
use tessera_odm::{ModelOptions, Odm, OdmConfig, Result};
use tessera_validation::Schema;

pub fn mongodb_url() -> Option<String> {
    std::env::var("MONGODB_URL").ok().filter(|url| !url.is_empty())
}

pub fn second_mongodb_url() -> Option<String> {
    std::env::var("MONGODB_URL_2")
        .ok()
        .filter(|url| !url.is_empty())
        .or_else(mongodb_url)
}

/// A database name no other test run uses
pub fn unique_database(prefix: &str) -> String {
    format!("{}_{}", prefix, ObjectId::new().to_hex())
}

pub fn options_for(database: &str) -> ModelOptions {
    ModelOptions::default().database(database)
}

/// Route library logs to the test output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Connect index 0, or `None` when no database is configured
pub async fn connect_one() -> Result<Option<Odm>> {
    let Some(url) = mongodb_url() else {
        eprintln!("MONGODB_URL not set, skipping");
        return Ok(None);
    };
    init_tracing();
    let odm = Odm::new(OdmConfig::default());
    odm.connect([url]).await?;
    Ok(Some(odm))
}

/// Connect indexes 0 and 1
pub async fn connect_two() -> Result<Option<Odm>> {
    let (Some(first), Some(second)) = (mongodb_url(), second_mongodb_url()) else {
        eprintln!("MONGODB_URL not set, skipping");
        return Ok(None);
    };
    init_tracing();
    let odm = Odm::new(OdmConfig::default());
    odm.connect([first, second]).await?;
    Ok(Some(odm))
}

pub async fn drop_database(odm: &Odm, index: usize, database: &str) -> Result<()> {
    odm.connection(index)?.client().database(database).drop().await?;
    Ok(())
}

pub fn user_schema() -> Schema {
    Schema::object([
        ("name", Schema::string()),
        ("age", Schema::int().optional().default_value(0)),
        ("tags", Schema::array(Schema::string()).optional().default_value(Bson::Array(vec![]))),
        (
            "profile",
            Schema::object([("city", Schema::string().optional())]).optional(),
        ),
    ])
}

pub fn post_schema() -> Schema {
    Schema::object([
        ("title", Schema::string()),
        ("author", Schema::object_id().optional()),
        ("editors", Schema::array(Schema::object_id()).optional()),
        (
            "comments",
            Schema::array(Schema::object([
                ("body", Schema::string()),
                ("user", Schema::object_id()),
            ]))
            .optional(),
        ),
    ])
}
