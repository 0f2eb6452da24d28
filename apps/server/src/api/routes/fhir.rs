use crate::api::handlers::delete;
use crate::state::AppState;
use axum::{routing::delete as delete_route, Router};

pub fn fhir_routes() -> Router<AppState> {
    Router::new().route(
        "/:resource_type",
        delete_route(delete::conditional_delete),
    )
}
