// Request Server
//
// Accepts TCP connections and answers one command per connection. At most
// `worker_threads` requests run at once; each runs on a blocking worker so
// store I/O never stalls the reactor. Conflicts with concurrent writers are
// retried here, invisibly to the client.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use tidemark_kernel::retry::{retry_on_conflict, RetryPolicy};

use crate::app::Application;
use crate::config::ServerConfig;
use crate::protocol::{self, ProtocolError, Response};

pub struct Server {
    listener: TcpListener,
    app: Arc<Application>,
    config: ServerConfig,
    retry: RetryPolicy,
}

impl Server {
    pub async fn bind(app: Application) -> io::Result<Self> {
        let config = app.config().server.clone();
        let retry = app.config().retry.clone();
        let listener = TcpListener::bind(&config.bind).await?;
        Ok(Self {
            listener,
            app: Arc::new(app),
            config,
            retry,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests for
    /// up to the configured timeout and abort whatever is left.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.config.worker_threads()));
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        tracing::info!(
            addr = %self.local_addr()?,
            workers = self.config.worker_threads(),
            "server listening for new connections"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let app = Arc::clone(&self.app);
                    let permits = Arc::clone(&permits);
                    let retry = self.retry.clone();
                    let max_bytes = self.config.max_message_bytes;
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(stream, app, retry, max_bytes, permits).await {
                            tracing::warn!(%peer, error = %err, "connection failed");
                        }
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        tracing::warn!(error = %err, "connection task failed");
                    }
                }
            }
        }

        tracing::info!(in_flight = connections.len(), "shutting down server");
        drop(self.listener);

        let drain = async {
            while connections.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = connections.len(),
                "shutdown timeout elapsed, aborting in-flight requests"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        tracing::info!("server stopped listening");
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    app: Arc<Application>,
    retry: RetryPolicy,
    max_bytes: usize,
    permits: Arc<Semaphore>,
) -> Result<(), ProtocolError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    let Some(message) = protocol::read_request(&mut stream, max_bytes).await? else {
        return Ok(());
    };

    let response = tokio::task::spawn_blocking(move || dispatch(&app, &retry, &message))
        .await
        .unwrap_or_else(|err| Response::error(format!("request failed: {err}")));

    protocol::write_response(&mut stream, &response).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Run one raw command line, retrying conflicts with concurrent writers.
pub fn dispatch(app: &Application, retry: &RetryPolicy, message: &str) -> Response {
    let args = match protocol::tokenize(message) {
        Ok(args) => args,
        Err(err) => return Response::error(err.to_string()),
    };

    match retry_on_conflict(retry, || app.process(&args)) {
        Ok(output) => Response::ok(output.trim()),
        Err(err) => {
            tracing::debug!(error = %err, "request failed");
            Response::error(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TidemarkConfig;

    #[test]
    fn dispatch_reports_errors_with_flag() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(TidemarkConfig {
            warehouse: dir.path().to_path_buf(),
            ..TidemarkConfig::default_config()
        });
        let retry = RetryPolicy::default();

        let ok = dispatch(&app, &retry, "create db.t");
        assert!(!ok.is_error);
        assert_eq!(ok.payload, "Operation successful? true");

        let missing = dispatch(&app, &retry, "rollback db.t nope");
        assert!(missing.is_error);
        assert!(missing.payload.contains("nope"));

        let unterminated = dispatch(&app, &retry, "history 'db.t");
        assert!(unterminated.is_error);
    }
}
