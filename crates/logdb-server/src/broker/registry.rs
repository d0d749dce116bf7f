//! Process-wide registry of named broker connections
//!
//! Components that open many short-lived channels (one per device session in
//! the protocol listener) share a single TCP connection by naming it. The
//! registry is created on first use, replaces entries it finds closed, and is
//! never torn down explicitly; process exit reclaims it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::BrokerError;

/// Opens connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Send + Sync;

    async fn connect(&self) -> Result<Self::Connection, BrokerError>;

    fn is_open(connection: &Self::Connection) -> bool;
}

/// Named connections shared by every caller in this process.
///
/// Lookups are serialized by a single mutex; channel operations on the
/// returned connection are not.
pub struct ConnectionRegistry<C: Connector> {
    connector: C,
    connections: Mutex<HashMap<String, Arc<C::Connection>>>,
}

impl<C: Connector> ConnectionRegistry<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Return the open connection registered under `name`, connecting first
    /// if there is none or the registered one has closed.
    pub async fn get_or_connect(&self, name: &str) -> Result<Arc<C::Connection>, BrokerError> {
        let mut connections = self.connections.lock().await;

        if let Some(existing) = connections.get(name) {
            if C::is_open(existing) {
                debug!(name, "Reusing shared broker connection");
                return Ok(Arc::clone(existing));
            }
            warn!(name, "Shared broker connection is closed, replacing it");
        }

        let connection = Arc::new(self.connector.connect().await?);
        connections.insert(name.to_string(), Arc::clone(&connection));
        info!(name, "Registered shared broker connection");

        Ok(connection)
    }

    /// Number of registered names, open or not
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
