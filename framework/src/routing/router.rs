use crate::http::{Request, Response};
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Type alias for route handlers
pub type BoxedHandler =
    Box<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync>;

/// HTTP router backed by one matchit tree per method
pub struct Router {
    get_routes: MatchitRouter<Arc<BoxedHandler>>,
    post_routes: MatchitRouter<Arc<BoxedHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            get_routes: MatchitRouter::new(),
            post_routes: MatchitRouter::new(),
        }
    }

    /// Register a GET route
    pub fn get<H, Fut>(mut self, path: &str, handler: H) -> Self
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        insert(&mut self.get_routes, path, handler);
        self
    }

    /// Register a POST route
    pub fn post<H, Fut>(mut self, path: &str, handler: H) -> Self
    where
        H: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        insert(&mut self.post_routes, path, handler);
        self
    }

    /// Match a request and return the handler with extracted params
    pub fn match_route(
        &self,
        method: &hyper::Method,
        path: &str,
    ) -> Option<(Arc<BoxedHandler>, HashMap<String, String>)> {
        let router = match *method {
            hyper::Method::GET => &self.get_routes,
            hyper::Method::POST => &self.post_routes,
            _ => return None,
        };

        router.at(path).ok().map(|matched| {
            let params: HashMap<String, String> = matched
                .params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            (matched.value.clone(), params)
        })
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn insert<H, Fut>(routes: &mut MatchitRouter<Arc<BoxedHandler>>, path: &str, handler: H)
where
    H: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    let handler: BoxedHandler = Box::new(move |req| Box::pin(handler(req)));
    if let Err(err) = routes.insert(path, Arc::new(handler)) {
        tracing::error!(path, error = %err, "route not registered");
    }
}

/// Bind shared state to a handler taking `(state, request)`
///
/// ```rust,ignore
/// Router::new().post("/follow-ups", with_state(state.clone(), follow_ups::start))
/// ```
pub fn with_state<S, H, Fut>(state: S, handler: H) -> impl Fn(Request) -> Fut + Send + Sync + 'static
where
    S: Clone + Send + Sync + 'static,
    H: Fn(S, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    move |req| handler(state.clone(), req)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::text;
    use pretty_assertions::assert_eq;

    async fn ok(_req: Request) -> Response {
        text("ok")
    }

    #[test]
    fn matches_by_method_and_extracts_params() {
        let router = Router::new()
            .get("/streams/workspaces/{workspace_id}", ok)
            .post("/workspaces/{workspace_id}/follow-ups/{id}/pause", ok);

        let (_, params) = router
            .match_route(&hyper::Method::POST, "/workspaces/3/follow-ups/9/pause")
            .unwrap();
        assert_eq!(params["workspace_id"], "3");
        assert_eq!(params["id"], "9");

        assert!(router
            .match_route(&hyper::Method::GET, "/workspaces/3/follow-ups/9/pause")
            .is_none());
        assert!(router
            .match_route(&hyper::Method::DELETE, "/streams/workspaces/3")
            .is_none());
        assert!(router
            .match_route(&hyper::Method::GET, "/streams/workspaces/3")
            .is_some());
    }
}
