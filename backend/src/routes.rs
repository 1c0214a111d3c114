use axum::{
    routing::{get, post},
    Router,
};

use crate::{auth, authorizations, billing, catalog, reports};

pub fn api_routes() -> Router {
    Router::new()
        .route("/token", post(auth::issue_token))
        .route("/me", get(auth::current_user))
        .merge(authorizations::routes())
        .merge(billing::routes())
        .merge(reports::routes())
        .merge(catalog::routes())
}
