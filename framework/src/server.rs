use crate::config::{Config, ServerConfig};
use crate::error::FrameworkError;
use crate::http::{HttpResponse, Request, ResponseBody};
use crate::routing::Router;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

pub struct Server {
    router: Arc<Router>,
    host: String,
    port: u16,
    body_limit: usize,
}

impl Server {
    pub fn new(router: impl Into<Router>) -> Self {
        Self {
            router: Arc::new(router.into()),
            host: "127.0.0.1".to_string(),
            port: 8000,
            body_limit: ServerConfig::DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn from_config(router: impl Into<Router>) -> Self {
        let config = Config::get::<ServerConfig>().unwrap_or_else(ServerConfig::from_env);
        Self {
            router: Arc::new(router.into()),
            host: config.host,
            port: config.port,
            body_limit: config.max_body_size,
        }
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Largest request body handlers will read
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), FrameworkError> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                FrameworkError::internal(format!("bind {}:{}: {}", self.host, self.port, e))
            })?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Stops accepting once `shutdown` resolves; open connections are left
    /// to finish on their own tasks.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), FrameworkError> {
        let addr = listener
            .local_addr()
            .map_err(|e| FrameworkError::internal(e.to_string()))?;
        tracing::info!(%addr, "http server listening");

        let router = self.router;
        let body_limit = self.body_limit;
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("http server stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let router = router.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let router = router.clone();
                    async move {
                        Ok::<_, Infallible>(handle_request(router, body_limit, peer, req).await)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(%peer, error = %err, "connection closed with error");
                }
            });
        }
    }
}

async fn handle_request(
    router: Arc<Router>,
    body_limit: usize,
    peer: SocketAddr,
    req: hyper::Request<hyper::body::Incoming>,
) -> hyper::Response<ResponseBody> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match router.match_route(&method, &path) {
        Some((handler, params)) => {
            let request = Request::new(req)
                .with_params(params)
                .with_body_limit(body_limit);
            handler(request).await.unwrap_or_else(|e| e)
        }
        None => HttpResponse::json(json!({
            "error": "not_found",
            "message": format!("No route for {} {}", method, path),
        }))
        .status(404),
    };

    tracing::info!(
        %method,
        %path,
        %peer,
        status = response.status_code(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );

    response.into_hyper()
}
