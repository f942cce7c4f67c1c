use axum::{
  Router,
  extract::Request,
  middleware,
  response::Response,
  routing::get,
};

use crate::state::{fanout_handler, limiter};

pub fn app() -> Router {
  Router::new()
    .route("/version", get(|| async { env!("CARGO_PKG_VERSION") }))
    .fallback(fanout_route)
    .layer(middleware::from_fn_with_state(
      limiter().clone(),
      admission::guard,
    ))
}

/// Every method, every path: one fanout.
async fn fanout_route(request: Request) -> Response {
  fanout_handler().handle(request).await
}
