use std::time::Instant;

use crate::LOG;

/// Logs one structured line per request: method, path,
/// response status, and elapsed milliseconds.
pub struct LogMiddleware;

impl LogMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl<State: Clone + Send + Sync + 'static> tide::Middleware<State> for LogMiddleware {
    async fn handle(
        &self,
        req: tide::Request<State>,
        next: tide::Next<'_, State>,
    ) -> tide::Result {
        let method = req.method().to_string();
        let path = req.url().path().to_string();
        let start = Instant::now();
        let resp = next.run(req).await;
        let status: u16 = resp.status().into();
        slog::info!(
            LOG, "request";
            "method" => method,
            "path" => path,
            "status" => status,
            "ms" => start.elapsed().as_millis() as u64,
        );
        Ok(resp)
    }
}
