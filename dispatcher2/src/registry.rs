//! Process-wide registry of destination servers.
//!
//! Read-mostly: the consumer hot path takes the shared lock to resolve a
//! destination, while config reloads and the servers API take the exclusive
//! one. The store remains the source of truth; the registry is re-populated
//! from it on every upsert.
//!
//! Server definitions can also live as JSON files in a configurable
//! directory; they are upserted at startup and whenever a file changes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use notify::{Event, RecursiveMode, Watcher};
use sqlx::PgPool;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::db::handlers::Servers;
use crate::db::models::servers::{Server, ServerDefinition};
use crate::types::ServerId;

#[derive(Default)]
struct Inner {
    by_id: HashMap<ServerId, Server>,
    by_name: HashMap<String, Server>,
}

#[derive(Clone, Default)]
pub struct ServerRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the registry from the store. Called at startup and after
    /// bulk imports.
    pub async fn load_all(&self, pool: &PgPool) -> anyhow::Result<usize> {
        let mut conn = pool.acquire().await?;
        let servers = Servers::new(&mut conn).load_all().await?;
        let count = servers.len();

        let mut inner = self.inner.write().await;
        inner.by_id.clear();
        inner.by_name.clear();
        for server in servers {
            inner.by_name.insert(server.name.clone(), server.clone());
            inner.by_id.insert(server.id, server);
        }

        tracing::info!(servers = count, "Loaded servers into registry");
        Ok(count)
    }

    /// Create or update a server in the store and refresh the cached entry.
    pub async fn upsert(&self, pool: &PgPool, def: &ServerDefinition) -> anyhow::Result<Server> {
        if def.auth_method == "Token" && def.auth_token.is_empty() {
            anyhow::bail!("server '{}' uses Token auth but has no auth_token", def.name);
        }

        let mut conn = pool.acquire().await?;
        let server = Servers::new(&mut conn).upsert(def).await?;

        let mut inner = self.inner.write().await;
        inner.by_name.insert(server.name.clone(), server.clone());
        inner.by_id.insert(server.id, server.clone());
        Ok(server)
    }

    pub async fn get_by_id(&self, id: ServerId) -> Option<Server> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Server> {
        self.inner.read().await.by_name.get(name).cloned()
    }

    pub async fn id_by_name(&self, name: &str) -> Option<ServerId> {
        self.inner.read().await.by_name.get(name).map(|s| s.id)
    }

    /// Resolve a comma-separated list of server names, dropping unknown ones.
    pub async fn resolve_names(&self, names: &str) -> Vec<ServerId> {
        let inner = self.inner.read().await;
        names
            .split(',')
            .filter_map(|name| {
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                inner.by_name.get(name).map(|s| s.id)
            })
            .collect()
    }

    /// Upsert every JSON server definition found in `dir`.
    pub async fn load_definitions_dir(&self, pool: &PgPool, dir: &Path) -> anyhow::Result<usize> {
        let mut loaded = 0usize;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_definition_file(&path).await {
                Ok(def) => {
                    if let Err(e) = self.upsert(pool, &def).await {
                        tracing::error!(file = %path.display(), error = %e, "Failed to create/update server");
                    } else {
                        loaded += 1;
                    }
                }
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "Failed to read server definition");
                }
            }
        }
        tracing::info!(directory = %dir.display(), loaded, "Loaded server definition files");
        Ok(loaded)
    }
}

async fn load_definition_file(path: &Path) -> anyhow::Result<ServerDefinition> {
    let raw = tokio::fs::read_to_string(path).await?;
    let def: ServerDefinition = serde_json::from_str(&raw)?;
    if def.name.is_empty() {
        anyhow::bail!("server definition has no name");
    }
    Ok(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn definition_files_parse_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhis2.json");
        tokio::fs::write(
            &path,
            r#"{
                "name": "dhis2",
                "username": "admin",
                "password": "district",
                "url": "https://play.dhis2.org/api/dataValueSets",
                "http_method": "POST",
                "use_async": true,
                "start_submission_period": 18,
                "end_submission_period": 24
            }"#,
        )
        .await
        .unwrap();

        let def = load_definition_file(&path).await.unwrap();
        assert_eq!(def.name, "dhis2");
        assert!(def.use_async);
        assert_eq!(def.start_submission_period, Some(18));
        // unspecified fields take their defaults
        assert!(!def.suspended);
        assert!(def.auth_method.is_empty());
        assert!(def.uid.is_none());
    }

    #[tokio::test]
    async fn nameless_definition_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, r#"{"username": "admin"}"#).await.unwrap();
        assert!(load_definition_file(&path).await.is_err());
    }
}

/// Watch the server-definitions directory and re-load it on every change.
/// Runs until shutdown; watcher errors are logged, not fatal.
pub async fn watch_definitions_dir(
    registry: ServerRegistry,
    pool: PgPool,
    dir: std::path::PathBuf,
    shutdown: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel::<Event>(16);

    let mut watcher = match notify::recommended_watcher(move |result: notify::Result<Event>| {
        match result {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => tracing::error!(error = %e, "Server definition watcher error"),
        }
    }) {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create server definition watcher");
            return;
        }
    };

    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        tracing::error!(directory = %dir.display(), error = %e, "Failed to watch server definitions");
        return;
    }
    tracing::info!(directory = %dir.display(), "Watching server definition files");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { return };
                if event.kind.is_create() || event.kind.is_modify() || event.kind.is_remove() {
                    tracing::info!("Server definition files changed, reloading");
                    if let Err(e) = registry.load_definitions_dir(&pool, &dir).await {
                        tracing::error!(error = %e, "Failed to reload server definitions");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Server definition watcher stopping");
                return;
            }
        }
    }
}
