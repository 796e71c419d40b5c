//! HTTP route definitions.

mod health;
mod sync;
mod ws;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes())
        .merge(ws::routes())
}

#[cfg(test)]
mod tests {
    //! Requests that are answered before the database is touched.

    use super::*;
    use crate::{config::Config, websocket::ConnectionManager};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(auth_secret: Option<&str>) -> Router {
        let database_url = "postgres://localhost/ensemble_test";
        let pool = PgPoolOptions::new().connect_lazy(database_url).unwrap();
        let state = AppState {
            pool,
            config: Arc::new(Config {
                host: "127.0.0.1".into(),
                port: 0,
                database_url: database_url.into(),
                max_connections: 1,
                auth_secret: auth_secret.map(String::from),
            }),
            conn_manager: ConnectionManager::new_shared(),
        };
        create_routes().with_state(state)
    }

    fn push(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn status(app: Router, request: Request<Body>) -> StatusCode {
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn health_is_public() {
        let request = Request::get("/health").body(Body::empty()).unwrap();
        assert_eq!(status(app(Some("s3cret")), request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn sync_requires_token_when_secret_set() {
        let request = Request::get("/sync/members").body(Body::empty()).unwrap();
        assert_eq!(
            status(app(Some("s3cret")), request).await,
            StatusCode::UNAUTHORIZED
        );

        let request = Request::get("/sync/members")
            .header("authorization", "Bearer orchestra-1:wrong")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            status(app(Some("s3cret")), request).await,
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn unknown_collection_is_rejected() {
        let request = Request::get("/sync/setlists")
            .header("authorization", "Bearer orchestra-1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status(app(None), request).await, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn push_validates_body() {
        let foreign = push(
            "/sync/members",
            "orchestra-1",
            json!({"data": [], "deviceId": "dev-a", "ownerId": "orchestra-2"}),
        );
        assert_eq!(status(app(None), foreign).await, StatusCode::FORBIDDEN);

        let not_array = push(
            "/sync/members",
            "orchestra-1",
            json!({"data": {"id": "m1"}, "deviceId": "dev-a", "ownerId": "orchestra-1"}),
        );
        assert_eq!(status(app(None), not_array).await, StatusCode::BAD_REQUEST);

        let missing_device = push(
            "/sync/members",
            "orchestra-1",
            json!({"data": [], "ownerId": "orchestra-1"}),
        );
        assert_eq!(
            status(app(None), missing_device).await,
            StatusCode::UNPROCESSABLE_ENTITY
        );
    }

    #[tokio::test]
    async fn websocket_requires_upgrade() {
        let request = Request::get("/ws")
            .header("authorization", "Bearer orchestra-1")
            .body(Body::empty())
            .unwrap();
        assert!(status(app(None), request).await.is_client_error());
    }
}
