//! MongoDB connection management with pool configuration and health checking

use bson::doc;
use mongodb::{
    options::{ClientOptions, ServerApi, ServerApiVersion},
    Client, Database,
};
use std::time::Duration;
use tessera_common::{Result, TesseraError};

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_pool_size: Option<u32>,
    pub max_pool_size: Option<u32>,
    /// Maximum time a connection can remain idle before being closed
    pub max_idle_time: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub server_selection_timeout: Option<Duration>,
    /// Application name reported in server logs
    pub app_name: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: Some(5),
            max_pool_size: Some(20),
            max_idle_time: None,
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(30)),
            app_name: Some("tessera".to_string()),
        }
    }
}

impl PoolConfig {
    fn apply(self, options: &mut ClientOptions) {
        if let Some(min) = self.min_pool_size {
            options.min_pool_size = Some(min);
        }
        if let Some(max) = self.max_pool_size {
            options.max_pool_size = Some(max);
        }
        if let Some(idle) = self.max_idle_time {
            options.max_idle_time = Some(idle);
        }
        if let Some(connect) = self.connect_timeout {
            options.connect_timeout = Some(connect);
        }
        if let Some(selection) = self.server_selection_timeout {
            options.server_selection_timeout = Some(selection);
        }
        if let Some(app) = self.app_name {
            options.app_name = Some(app);
        }
    }
}

/// One client handle of the connection registry.
///
/// Every successful connect produces a new `Connection`; models compare
/// identities to notice a reconnect.
pub struct Connection {
    index: usize,
    client: Client,
    database: Database,
}

impl Connection {
    /// Connect with custom pool configuration.
    ///
    /// The URL must name a default database.
    pub async fn with_config(index: usize, connection_string: &str, config: PoolConfig) -> Result<Self> {
        let mut client_options = ClientOptions::parse(connection_string).await?;
        config.apply(&mut client_options);

        let server_api = ServerApi::builder().version(ServerApiVersion::V1).build();
        client_options.server_api = Some(server_api);

        let client = Client::with_options(client_options)?;

        let database = client.default_database().ok_or_else(|| {
            TesseraError::Connection(format!(
                "No default database specified in connection string for connection {}",
                index
            ))
        })?;

        Ok(Self {
            index,
            client,
            database,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The database named by the connection string
    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    /// The default database, or `name` when given
    pub fn resolve_database(&self, name: Option<&str>) -> Database {
        match name {
            Some(name) => self.client.database(name),
            None => self.database.clone(),
        }
    }

    /// Check the server answers a ping
    pub async fn ping(&self) -> Result<bool> {
        match self.database.run_command(doc! { "ping": 1 }).await {
            Ok(_) => Ok(true),
            Err(e) => Err(TesseraError::Connection(format!("Ping failed: {}", e))),
        }
    }

    pub async fn list_collection_names(&self) -> Result<Vec<String>> {
        let names = self.database.list_collection_names().await?;
        Ok(names)
    }

    /// Drop the default database
    pub async fn drop_database(&self) -> Result<()> {
        self.database.drop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_pool_size, Some(5));
        assert_eq!(config.max_pool_size, Some(20));
        assert_eq!(config.app_name, Some("tessera".to_string()));
    }

    #[test]
    fn test_pool_config_applies_to_client_options() {
        let mut options = ClientOptions::default();
        PoolConfig {
            min_pool_size: None,
            max_pool_size: Some(50),
            max_idle_time: Some(Duration::from_secs(300)),
            connect_timeout: Some(Duration::from_secs(5)),
            server_selection_timeout: None,
            app_name: Some("billing".to_string()),
        }
        .apply(&mut options);

        assert_eq!(options.min_pool_size, None);
        assert_eq!(options.max_pool_size, Some(50));
        assert_eq!(options.max_idle_time, Some(Duration::from_secs(300)));
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(options.app_name.as_deref(), Some("billing"));
    }
}
