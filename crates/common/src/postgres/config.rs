use serde::{Deserialize, Serialize};

/// PostgreSQL connection settings for the charge point registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_pool_size: usize,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "charge_points".to_string(),
            username: "ocpp_gateway".to_string(),
            password: "ocpp_gateway".to_string(),
            max_pool_size: 10,
        }
    }
}
