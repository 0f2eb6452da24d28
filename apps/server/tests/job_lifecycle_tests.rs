#![allow(unused)]
//! Delete-expunge job lifecycle: retries, failures, cancellation, commit-time
//! re-checks, parallel batches and resume.

mod support;

use std::collections::HashSet;

use axum::http::{Method, StatusCode};
use cinder::{
    db::ResourceStore,
    models::{DeleteExpungeJobParams, ExpungeProgress, ResourceKey, DELETE_EXPUNGE_JOB_TYPE},
    queue::{JobPriority, JobQueue, RetryPolicy},
};
use support::*;

fn patient_key(id: &str) -> ResourceKey {
    ResourceKey::new("Patient", id)
}

async fn create_patients(app: &TestApp, count: usize) -> anyhow::Result<()> {
    for i in 0..count {
        app.create(PatientBuilder::new(&format!("p{}", i)).build())
            .await?;
    }
    Ok(())
}

// ============================================================================
// Batch failures and retries
// ============================================================================

#[tokio::test]
async fn transient_batch_failure_is_retried() -> anyhow::Result<()> {
    with_test_app_with_config(
        |config| {
            config.expunge.expunge_batch_size = 1;
            config.expunge.batch_max_retries = 2;
        },
        |app| {
            Box::pin(async move {
                create_patients(&app, 3).await?;
                app.store.inject_failure(patient_key("p1"), 2).await;

                let (_, job_id, _) = app
                    .delete_expunge("/fhir/Patient?_expunge=true", None)
                    .await?;
                let job_id = job_id.unwrap();
                let outcome = app.await_outcome(job_id).await?;

                assert_eq!(app.job(job_id).await?["status"], "completed");
                assert_eq!(expunged_resources(&outcome), 3);
                assert_eq!(app.state.metrics.batch_failures.get(), 2);
                assert_eq!(app.count("Patient").await?, 0);
                Ok(())
            })
        },
    )
    .await
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_and_keep_earlier_batches() -> anyhow::Result<()> {
    with_test_app_with_config(
        |config| {
            config.expunge.expunge_batch_size = 1;
            config.expunge.batch_max_retries = 2;
        },
        |app| {
            Box::pin(async move {
                create_patients(&app, 3).await?;
                app.store.inject_failure(patient_key("p1"), 10).await;

                let (status, job_id, _) = app
                    .delete_expunge("/fhir/Patient?_expunge=true", None)
                    .await?;
                assert_status(status, StatusCode::ACCEPTED, "submit");
                let job_id = job_id.unwrap();
                let outcome = app.await_outcome(job_id).await?;

                let job = app.job(job_id).await?;
                assert_eq!(job["status"], "failed");
                assert!(job["errorMessage"]
                    .as_str()
                    .unwrap()
                    .starts_with("Batch 1 failed"));

                assert_eq!(outcome["issue"][0]["severity"], "error");
                assert!(diagnostics(&outcome).contains("failed after 1 of 3 batch(es)"));
                assert_eq!(expunged_resources(&outcome), 1);

                // Batch 0 stays committed, the sequential run stops at batch 1.
                assert!(!app.exists("Patient", "p0").await?);
                assert!(app.exists("Patient", "p1").await?);
                assert!(app.exists("Patient", "p2").await?);

                assert_eq!(app.state.metrics.batch_failures.get(), 3);
                Ok(())
            })
        },
    )
    .await
}

#[tokio::test]
async fn parallel_batches_are_all_attempted_after_a_failure() -> anyhow::Result<()> {
    with_test_app_with_config(
        |config| {
            config.expunge.expunge_batch_size = 2;
            config.expunge.max_parallel_batches = 4;
            config.expunge.batch_max_retries = 0;
        },
        |app| {
            Box::pin(async move {
                create_patients(&app, 8).await?;
                app.store.inject_failure(patient_key("p2"), 100).await;

                let (_, job_id, _) = app
                    .delete_expunge("/fhir/Patient?_expunge=true", None)
                    .await?;
                let job_id = job_id.unwrap();
                let outcome = app.await_outcome(job_id).await?;

                assert_eq!(app.job(job_id).await?["status"], "failed");
                assert_eq!(expunged_resources(&outcome), 6);
                assert_eq!(app.count("Patient").await?, 2);
                assert!(app.exists("Patient", "p2").await?);
                assert!(app.exists("Patient", "p3").await?);
                Ok(())
            })
        },
    )
    .await
}

#[tokio::test]
async fn parallel_batches_complete() -> anyhow::Result<()> {
    with_test_app_with_config(
        |config| {
            config.expunge.expunge_batch_size = 2;
            config.expunge.max_parallel_batches = 3;
        },
        |app| {
            Box::pin(async move {
                create_patients(&app, 9).await?;

                let (_, job_id, body) = app
                    .delete_expunge("/fhir/Patient?_expunge=true", None)
                    .await?;
                assert!(diagnostics(&body).ends_with("9 resource(s) in 5 batch(es)"));
                let job_id = job_id.unwrap();
                let outcome = app.await_outcome(job_id).await?;

                assert_eq!(expunged_resources(&outcome), 9);
                assert_eq!(expunged_entities(&outcome), 27);
                assert_eq!(app.job(job_id).await?["processedItems"], 5);
                Ok(())
            })
        },
    )
    .await
}

// ============================================================================
// Commit-time re-check
// ============================================================================

#[tokio::test]
async fn referrer_added_after_submission_fails_the_batch() -> anyhow::Result<()> {
    with_test_app_with_config(
        |config| config.expunge.batch_max_retries = 3,
        |app| {
            Box::pin(async move {
                app.create(organization("O1")).await?;
                let hold = app
                    .store
                    .hold_batch(ResourceKey::new("Organization", "O1"))
                    .await;

                let (status, job_id, _) = app
                    .delete_expunge("/fhir/Organization?_id=O1&_expunge=true", None)
                    .await?;
                assert_status(status, StatusCode::ACCEPTED, "no referrer yet");

                // The batch has started but not yet checked its members.
                hold.reached().await;
                app.create(
                    PatientBuilder::new("P1")
                        .managing_organization("Organization/O1")
                        .build(),
                )
                .await?;
                hold.release();

                let job_id = job_id.unwrap();
                let outcome = app.await_outcome(job_id).await?;
                let job = app.job(job_id).await?;
                assert_eq!(job["status"], "failed");
                assert!(job["errorMessage"]
                    .as_str()
                    .unwrap()
                    .contains("Patient/P1 refers to it via the path Patient.managingOrganization"));
                assert_eq!(expunged_resources(&outcome), 0);

                // Conflicts are not retried.
                assert_eq!(app.state.metrics.batch_failures.get(), 1);
                assert!(app.exists("Organization", "O1").await?);
                assert!(app.exists("Patient", "P1").await?);
                Ok(())
            })
        },
    )
    .await
}

// ============================================================================
// Cancellation and awaiting
// ============================================================================

#[tokio::test]
async fn cancellation_lets_the_running_batch_finish() -> anyhow::Result<()> {
    with_test_app_with_config(
        |config| config.expunge.expunge_batch_size = 1,
        |app| {
            Box::pin(async move {
                create_patients(&app, 3).await?;
                let hold = app.store.hold_batch(patient_key("p1")).await;

                let (_, job_id, _) = app
                    .delete_expunge("/fhir/Patient?_expunge=true", None)
                    .await?;
                let job_id = job_id.unwrap();
                hold.reached().await;

                let (status, _, body) = app
                    .request(
                        Method::POST,
                        &format!("/admin/jobs/{}/cancel", job_id),
                        None,
                    )
                    .await?;
                assert_status(status, StatusCode::OK, "cancel");
                let body: serde_json::Value = serde_json::from_slice(&body)?;
                assert_eq!(body["cancelled"], true);
                hold.release();

                let outcome = app.await_outcome(job_id).await?;
                assert_eq!(app.job(job_id).await?["status"], "cancelled");
                assert_eq!(expunged_resources(&outcome), 2);
                assert!(diagnostics(&outcome).contains("cancelled after 2 of 3 batch(es)"));
                assert!(app.exists("Patient", "p2").await?);
                Ok(())
            })
        },
    )
    .await
}

#[tokio::test]
async fn cancel_during_the_last_batch_still_completes() -> anyhow::Result<()> {
    with_test_app_with_config(
        |config| config.expunge.expunge_batch_size = 1,
        |app| {
            Box::pin(async move {
                create_patients(&app, 2).await?;
                let hold = app.store.hold_batch(patient_key("p1")).await;

                let (_, job_id, _) = app
                    .delete_expunge("/fhir/Patient?_expunge=true", None)
                    .await?;
                let job_id = job_id.unwrap();
                hold.reached().await;

                let (status, _, _) = app
                    .request(
                        Method::POST,
                        &format!("/admin/jobs/{}/cancel", job_id),
                        None,
                    )
                    .await?;
                assert_status(status, StatusCode::OK, "cancel");
                hold.release();

                let outcome = app.await_outcome(job_id).await?;
                assert_eq!(app.job(job_id).await?["status"], "completed");
                assert_eq!(outcome["issue"][0]["severity"], "information");
                assert!(!diagnostics(&outcome).contains("cancelled"));
                assert_eq!(expunged_resources(&outcome), 2);
                assert_eq!(app.count("Patient").await?, 0);
                Ok(())
            })
        },
    )
    .await
}

#[tokio::test]
async fn outcome_is_withheld_until_the_job_finishes() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            create_patients(&app, 1).await?;
            let hold = app.store.hold_batch(patient_key("p0")).await;

            let (_, job_id, _) = app
                .delete_expunge("/fhir/Patient?_expunge=true", None)
                .await?;
            let job_id = job_id.unwrap();
            hold.reached().await;

            let (status, _) = app
                .get_json(&format!("/admin/jobs/{}/outcome", job_id))
                .await?;
            assert_status(status, StatusCode::CONFLICT, "job still running");

            let (status, body) = app
                .get_json(&format!("/admin/jobs/{}/outcome?waitMs=20", job_id))
                .await?;
            assert_status(status, StatusCode::GATEWAY_TIMEOUT, "await timed out");
            assert_eq!(body["issue"][0]["code"], "timeout");

            hold.release();
            let outcome = app.await_outcome(job_id).await?;
            assert_eq!(expunged_resources(&outcome), 1);
            Ok(())
        })
    })
    .await
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn interrupted_job_resumes_after_committed_batches() -> anyhow::Result<()> {
    with_test_app(|app| {
        Box::pin(async move {
            create_patients(&app, 4).await?;
            let keys: Vec<ResourceKey> = (0..4).map(|i| patient_key(&format!("p{}", i))).collect();
            let allowed: HashSet<ResourceKey> = keys.iter().cloned().collect();

            // A previous process committed batch 0 and died.
            let first = app.store.expunge_batch(&keys[..2], &allowed).await?;
            let mut progress = ExpungeProgress::new(2);
            progress.record(0, first);

            let params = DeleteExpungeJobParams {
                resource_type: "Patient".to_string(),
                candidates: keys.clone(),
                batch_size: 2,
                max_parallel_batches: 1,
            };
            let queue = app.state.job_queue.clone();
            let job_id = queue
                .enqueue(
                    DELETE_EXPUNGE_JOB_TYPE.to_string(),
                    params.to_value()?,
                    JobPriority::Normal,
                    Some(RetryPolicy::default()),
                )
                .await?;
            queue.mark_running(job_id, "crashed-worker").await?;
            queue
                .update_progress(job_id, 1, Some(2), Some(progress.to_value()?))
                .await?;

            assert_eq!(app.state.orchestrator.resume_interrupted().await?, 1);

            let outcome = app.await_outcome(job_id).await?;
            assert_eq!(expunged_resources(&outcome), 4);
            assert_eq!(expunged_entities(&outcome), 12);
            assert_eq!(app.count("Patient").await?, 0);
            // Only the second batch ran in this process.
            assert_eq!(app.state.metrics.batches_executed.get(), 1);
            Ok(())
        })
    })
    .await
}
