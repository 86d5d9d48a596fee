//! Row-store client tests against a live PostgreSQL.
//!
//! Requires the queue tables and stored functions installed.
//! Run with: `cargo test --test postgres_live --features postgres -- --ignored`

#![cfg(feature = "postgres")]

use qbench::persistence::PgRowStore;
use qbench::{BackendKind, Delivery, JobFactory, JobSink, PostgresConfig, Receipt, RowStore};
use sqlx::{PgPool, Row};
use uuid::Uuid;

fn config() -> PostgresConfig {
    PostgresConfig {
        connection_string: std::env::var("DATABASE_URL").expect("DATABASE_URL required"),
        ..PostgresConfig::default()
    }
}

async fn count_ids(pool: &PgPool, table: &str, ids: &[Uuid]) -> i64 {
    sqlx::query(&format!("SELECT count(*) AS n FROM {table} WHERE id = ANY($1)"))
        .bind(ids)
        .fetch_one(pool)
        .await
        .expect("count")
        .try_get::<i64, _>("n")
        .expect("n column")
}

async fn cleanup(pool: &PgPool, table: &str, ids: &[Uuid]) {
    sqlx::query(&format!("DELETE FROM {table} WHERE id = ANY($1)"))
        .bind(ids)
        .execute(pool)
        .await
        .ok();
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn batch_insert_stores_every_job() {
    let mut store = PgRowStore::connect(&config(), BackendKind::SkipLocked)
        .await
        .expect("connect");
    let jobs = JobFactory::new(64, None).batch(5);
    let ids: Vec<Uuid> = jobs.iter().map(|job| job.id.0).collect();

    store.submit(&jobs).await.expect("submit");

    let pool = store.pool().clone();
    assert_eq!(count_ids(&pool, "queue_jobs", &ids).await, 5);
    cleanup(&pool, "queue_jobs", &ids).await;
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn failed_batch_inserts_nothing() {
    let mut store = PgRowStore::connect(&config(), BackendKind::DeleteReturning)
        .await
        .expect("connect");
    let mut jobs = JobFactory::new(64, None).batch(3);
    // Duplicate primary key in the same batch.
    jobs[2].id = jobs[0].id;
    let ids: Vec<Uuid> = jobs.iter().map(|job| job.id.0).collect();

    assert!(store.submit(&jobs).await.is_err());

    let pool = store.pool().clone();
    assert_eq!(count_ids(&pool, "queue_jobs_dr", &ids).await, 0);
}

#[tokio::test]
#[ignore] // requires DATABASE_URL
async fn fetched_job_can_be_completed() {
    let mut store = PgRowStore::connect(&config(), BackendKind::SkipLocked)
        .await
        .expect("connect");
    let jobs = JobFactory::new(64, None).batch(1);
    store.submit(&jobs).await.expect("submit");

    let job = store
        .get_next("worker_test", None)
        .await
        .expect("get_next")
        .expect("a job is available");
    let id = job.id.0;
    store
        .complete(&Delivery::new(job, Receipt::Locked, "worker_test"))
        .await
        .expect("complete");

    let pool = store.pool().clone();
    cleanup(&pool, "queue_jobs", &[jobs[0].id.0, id]).await;
}
