// REST access to a Firebase Realtime Database.
// https://firebase.google.com/docs/reference/rest/database

use std::{env, fs, path::Path, time::Duration};

use log::info;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

const DEFAULT_CREDENTIALS_PATH: &str = "firebase-credentials.json";
const DEFAULT_DATABASE_URL: &str = "https://electricity-a1e47-default-rtdb.firebaseio.com";

/// Connection settings for the database.
#[derive(Debug, Clone)]
pub struct RtdbConfig {
    /// Path to the service account key file downloaded from the Firebase console.
    pub credentials_path: String,
    /// Base url of the database, without a trailing slash.
    pub database_url: String,
}

impl RtdbConfig {
    /// Read the settings from `FIREBASE_CREDENTIALS_PATH` and
    /// `FIREBASE_DATABASE_URL`, with literal defaults for both.
    /// Loads a `.env` file first if one exists.
    pub fn from_env() -> RtdbConfig {
        let _ = dotenvy::dotenv();
        RtdbConfig {
            credentials_path: env::var("FIREBASE_CREDENTIALS_PATH")
                .unwrap_or_else(|_| DEFAULT_CREDENTIALS_PATH.to_string()),
            database_url: env::var("FIREBASE_DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ServiceAccount {
    pub project_id: String,
    pub client_email: String,
}

/// Everything that can go wrong between this process and the database.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credentials file not found at: {0}")]
    CredentialsNotFound(String),
    #[error("credentials file {path} is not a valid service account key: {reason}")]
    BadCredentials { path: String, reason: String },
    #[error("failed to connect to the database at {url}: {source}")]
    Connect {
        url: String,
        source: reqwest::Error,
    },
    #[error("failed to write node {node}: {source}")]
    Write {
        node: String,
        source: reqwest::Error,
    },
    #[error("failed to fetch node {node}: {source}")]
    Fetch {
        node: String,
        source: reqwest::Error,
    },
}

pub struct RtdbClient {
    database_url: String,
    service_account: ServiceAccount,
    http: Client,
}

impl RtdbClient {
    /// Validate the service account key file and build the http client.
    /// Does not touch the network.
    pub fn connect(config: &RtdbConfig) -> Result<RtdbClient, StoreError> {
        let path = Path::new(&config.credentials_path);
        if !path.exists() {
            return Err(StoreError::CredentialsNotFound(
                config.credentials_path.clone(),
            ));
        }
        let contents =
            fs::read_to_string(path).map_err(|e| StoreError::BadCredentials {
                path: config.credentials_path.clone(),
                reason: e.to_string(),
            })?;
        let service_account: ServiceAccount =
            serde_json::from_str(&contents).map_err(|e| StoreError::BadCredentials {
                path: config.credentials_path.clone(),
                reason: e.to_string(),
            })?;
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| StoreError::Connect {
                url: config.database_url.clone(),
                source,
            })?;
        info!(
            "connected to the realtime database of project {}",
            service_account.project_id
        );
        Ok(RtdbClient {
            database_url: config.database_url.trim_end_matches('/').to_string(),
            service_account,
            http,
        })
    }

    pub fn project_id(&self) -> &str {
        &self.service_account.project_id
    }

    /// REST endpoint of a node, e.g. `<database_url>/electricity_demand.json`.
    fn endpoint(&self, node: &str) -> String {
        format!("{}/{}.json", self.database_url, node)
    }

    /// Overwrite the node with `value`.  Whatever was stored under it is gone.
    pub fn put(&self, node: &str, value: &Value) -> Result<(), StoreError> {
        self.http
            .put(self.endpoint(node))
            .json(value)
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|source| StoreError::Write {
                node: node.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Fetch the full contents of the node.  An absent node comes back as
    /// JSON `null`.
    pub fn get(&self, node: &str) -> Result<Value, StoreError> {
        let resp = self
            .http
            .get(self.endpoint(node))
            .send()
            .and_then(|resp| resp.error_for_status())
            .map_err(|source| StoreError::Fetch {
                node: node.to_string(),
                source,
            })?;
        resp.json::<Value>().map_err(|source| StoreError::Fetch {
            node: node.to_string(),
            source,
        })
    }
}
