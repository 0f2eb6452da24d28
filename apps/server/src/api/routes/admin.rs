use crate::api::handlers::{jobs, references};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // Job management
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/health", get(jobs::get_queue_health))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::delete_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/jobs/:id/outcome", get(jobs::get_job_outcome))
        // Resource references (who points at what, before deleting)
        .route(
            "/resources/:resource_type/:id/references",
            get(references::get_resource_references),
        )
}
