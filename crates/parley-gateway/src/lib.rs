pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod groups;
pub mod pipeline;

use std::sync::Arc;

use parley_db::Database;

/// Run a blocking store call off the async runtime. Store calls are the
/// only suspension points in the event handlers.
pub(crate) async fn with_store<T, F>(db: &Arc<Database>, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| anyhow::anyhow!("store task join error: {e}"))?
}
