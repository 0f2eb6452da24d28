#![allow(unused)]
//! Admin API: job listing and management, reference lookups, health and metrics

mod support;

use axum::http::{Method, StatusCode};
use serde_json::Value;
use support::*;
use uuid::Uuid;

async fn finished_delete_job(app: &TestApp, patient_id: &str) -> anyhow::Result<Uuid> {
    app.create(PatientBuilder::new(patient_id).build()).await?;
    let (status, job_id, _) = app
        .delete_expunge(
            &format!("/fhir/Patient?_id={}&_expunge=true", patient_id),
            None,
        )
        .await?;
    assert_status(status, StatusCode::ACCEPTED, "submit");
    let job_id = job_id.unwrap();
    app.await_outcome(job_id).await?;
    Ok(job_id)
}

#[tokio::test]
async fn lists_jobs_by_type_and_status() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let first = finished_delete_job(&app, "p1").await?;
            let second = finished_delete_job(&app, "p2").await?;

            let (status, body) = app.get_json("/admin/jobs?jobType=DELETE_EXPUNGE").await?;
            assert_status(status, StatusCode::OK, "list jobs");
            assert_eq!(body["total"], 2);
            // Newest first
            assert_eq!(body["jobs"][0]["id"], second.to_string());
            assert_eq!(body["jobs"][1]["id"], first.to_string());
            assert_eq!(body["jobs"][0]["jobType"], "DELETE_EXPUNGE");
            assert_eq!(body["jobs"][0]["parameters"]["resourceType"], "Patient");

            let (_, body) = app.get_json("/admin/jobs?status=running").await?;
            assert_eq!(body["total"], 0);

            let (_, body) = app.get_json("/admin/jobs?status=completed&limit=1").await?;
            assert_eq!(body["total"], 2);
            assert_eq!(body["jobs"].as_array().unwrap().len(), 1);

            let (status, _) = app.get_json("/admin/jobs?status=paused").await?;
            assert_status(status, StatusCode::BAD_REQUEST, "unknown status");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn finished_jobs_can_be_deleted_but_not_cancelled() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let job_id = finished_delete_job(&app, "p1").await?;

            let (status, _, _) = app
                .request(Method::POST, &format!("/admin/jobs/{}/cancel", job_id), None)
                .await?;
            assert_status(status, StatusCode::BAD_REQUEST, "cancel finished job");

            let (status, _, body) = app
                .request(Method::DELETE, &format!("/admin/jobs/{}", job_id), None)
                .await?;
            assert_status(status, StatusCode::OK, "delete job");
            let body: Value = serde_json::from_slice(&body)?;
            assert_eq!(body["deleted"], true);

            let (status, _) = app.get_json(&format!("/admin/jobs/{}", job_id)).await?;
            assert_status(status, StatusCode::NOT_FOUND, "deleted job");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn unknown_job_is_not_found() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            let missing = Uuid::new_v4();
            let (status, body) = app.get_json(&format!("/admin/jobs/{}", missing)).await?;
            assert_status(status, StatusCode::NOT_FOUND, "get job");
            assert_eq!(body["issue"][0]["code"], "not-found");

            let (status, _) = app
                .get_json(&format!("/admin/jobs/{}/outcome", missing))
                .await?;
            assert_status(status, StatusCode::NOT_FOUND, "job outcome");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn resource_references_show_both_directions() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            app.create_in(organization("O1"), "PART-A").await?;
            app.create_in(
                PatientBuilder::new("P1")
                    .managing_organization("Organization/O1")
                    .build(),
                "PART-B",
            )
            .await?;

            let (status, body) = app
                .get_json("/admin/resources/Organization/O1/references")
                .await?;
            assert_status(status, StatusCode::OK, "references");
            assert_eq!(body["incoming"][0]["source"], "Patient/P1");
            assert_eq!(body["incoming"][0]["sourcePartition"], "PART-B");
            assert_eq!(body["incoming"][0]["path"], "Patient.managingOrganization");
            assert_eq!(body["outgoing"].as_array().unwrap().len(), 0);

            let (_, _, raw) = app
                .request_with_headers(
                    Method::GET,
                    "/admin/resources/Organization/O1/references",
                    &[("x-partition-id", "PART-A")],
                    None,
                )
                .await?;
            let scoped: Value = serde_json::from_slice(&raw)?;
            assert_eq!(scoped["incoming"].as_array().unwrap().len(), 0);

            let (_, body) = app
                .get_json("/admin/resources/Patient/P1/references")
                .await?;
            assert_eq!(body["outgoing"][0]["target"], "Organization/O1");

            let (status, _) = app
                .get_json("/admin/resources/Patient/missing/references")
                .await?;
            assert_status(status, StatusCode::NOT_FOUND, "missing resource");
            Ok(())
        })
    })
    .await
}

#[tokio::test]
async fn health_and_metrics_endpoints() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            finished_delete_job(&app, "p1").await?;

            let (status, body) = app.get_json("/health").await?;
            assert_status(status, StatusCode::OK, "health");
            assert_eq!(body["status"], "ok");
            assert_eq!(body["jobs"]["stats"]["completed"], 1);

            let (status, body) = app.get_json("/admin/jobs/health").await?;
            assert_status(status, StatusCode::OK, "queue health");
            assert_eq!(body["backend"], "memory");

            let (status, _, raw) = app.request(Method::GET, "/metrics", None).await?;
            assert_status(status, StatusCode::OK, "metrics");
            let text = String::from_utf8(raw)?;
            assert!(text.contains("cinder_expunged_resources_total 1"));
            assert!(text.contains("cinder_expunge_batches_total 1"));
            Ok(())
        })
    })
    .await
}
