#![cfg(feature = "postgres-tests")]

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use fleetlease_core::error::CoreError;
use fleetlease_core::leasing::{LeaseConfig, LeaseManager, PostgresAccountRepository};
use fleetlease_core::proxy_pool::{PostgresProxyRepository, ProxyPool};
use fleetlease_core::types::{
    AccountStatus, BatchStatus, CheckResult, NewAccount, NewBatch, ProxyCandidate,
    ResultReport, WorkerId,
};
use sqlx::PgPool;
use sqlx::Row;

fn manager(pool: &PgPool) -> LeaseManager {
    LeaseManager::new(
        Arc::new(PostgresAccountRepository::new(pool.clone())),
        LeaseConfig::default(),
    )
}

fn accounts(prefix: &str, count: usize) -> Vec<NewAccount> {
    (1..=count)
        .map(|i| NewAccount::new(format!("{prefix}{i}@example.com"), "pw"))
        .collect()
}

#[sqlx::test(migrator = "fleetlease_core::MIGRATOR")]
async fn lease_lifecycle_matches_queue_semantics(pool: PgPool) -> Result<()> {
    let manager = manager(&pool);
    let created = manager
        .create_batch(NewBatch::new("upload.txt", accounts("a", 5)))
        .await?;

    let w1 = WorkerId::from("w1");
    let w2 = WorkerId::from("w2");
    let first = manager.checkout_batch(&w1, 2).await?;
    let second = manager.checkout_batch(&w2, 3).await?;
    let emails: Vec<&str> = first.iter().chain(&second).map(|l| l.email.as_str()).collect();
    assert_eq!(
        emails,
        vec![
            "a1@example.com",
            "a2@example.com",
            "a3@example.com",
            "a4@example.com",
            "a5@example.com"
        ]
    );

    manager
        .submit_results(
            &w1,
            vec![
                ResultReport::for_account(first[0].id, "good"),
                ResultReport::for_account(first[1].id, "lock"),
            ],
        )
        .await?;
    let batch = manager.batch(&created.batch_id).await?.expect("batch row");
    assert_eq!(batch.status, BatchStatus::Processing);
    assert_eq!(
        (batch.counters.good, batch.counters.bad, batch.counters.saved),
        (1, 1, 2)
    );

    assert_eq!(manager.release_by_worker(&w2).await?, 3);
    let third = manager.checkout_batch(&WorkerId::from("w3"), 3).await?;
    let reassigned: Vec<_> = third.iter().map(|l| l.id).collect();
    let released: Vec<_> = second.iter().map(|l| l.id).collect();
    assert_eq!(reassigned, released);
    Ok(())
}

#[sqlx::test(migrator = "fleetlease_core::MIGRATOR")]
async fn concurrent_checkouts_skip_locked_rows(pool: PgPool) -> Result<()> {
    let manager = manager(&pool);
    manager
        .create_batch(NewBatch::new("bulk.txt", accounts("c", 30)))
        .await?;

    let mut handles = Vec::new();
    for i in 0..6 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager.checkout_batch(&WorkerId(format!("w{i}")), 8).await
        }));
    }
    let mut seen = HashSet::new();
    for handle in handles {
        for lease in handle.await?? {
            assert!(seen.insert(lease.id), "account {} leased twice", lease.id);
        }
    }
    assert_eq!(seen.len(), 30);

    let holders: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM accounts WHERE status = 'processing' AND lease_holder IS NOT NULL",
    )
    .fetch_one(&pool)
    .await?;
    assert_eq!(holders, 30);
    Ok(())
}

#[sqlx::test(migrator = "fleetlease_core::MIGRATOR")]
async fn inconclusive_results_requeue_and_batches_complete(pool: PgPool) -> Result<()> {
    let manager = manager(&pool);
    let created = manager
        .create_batch(NewBatch::new("two.txt", accounts("r", 2)))
        .await?;
    let worker = WorkerId::from("w");
    let leases = manager.checkout_batch(&worker, 2).await?;

    let summary = manager
        .submit_results(
            &worker,
            vec![
                ResultReport::for_account(leases[0].id, "server-error"),
                ResultReport::for_email(leases[1].email.clone(), "timeout"),
            ],
        )
        .await?;
    assert_eq!((summary.requeued, summary.completed), (1, 1));

    let account = manager.account(leases[0].id).await?.expect("account row");
    assert_eq!(account.status, AccountStatus::Pending);
    assert_eq!(account.result, CheckResult::Pending);

    let retry = manager.checkout_batch(&worker, 1).await?;
    let summary = manager
        .submit_results(&worker, vec![ResultReport::for_account(retry[0].id, "good")])
        .await?;
    assert_eq!(summary.completed_batches, vec![created.batch_id.clone()]);

    let row = sqlx::query(
        "SELECT status, stats_saved, account_count, completed_at IS NOT NULL AS stamped \
         FROM batches WHERE batch_id = $1",
    )
    .bind(created.batch_id.as_str())
    .fetch_one(&pool)
    .await?;
    assert_eq!(row.get::<String, _>("status"), "completed");
    assert_eq!(row.get::<i32, _>("stats_saved"), row.get::<i32, _>("account_count"));
    assert!(row.get::<bool, _>("stamped"));
    Ok(())
}

#[sqlx::test(migrator = "fleetlease_core::MIGRATOR")]
async fn proxy_pool_is_single_use_and_never_emptied_by_refresh(pool: PgPool) -> Result<()> {
    let proxies = Arc::new(ProxyPool::new(Arc::new(PostgresProxyRepository::new(
        pool.clone(),
    ))));
    proxies
        .replace_all(
            vec![
                ProxyCandidate::new("slow.example", 8080).with_response_time(500),
                ProxyCandidate::new("fast.example", 8080).with_response_time(50),
                ProxyCandidate::new("fast.example", 8080).with_response_time(900),
                ProxyCandidate::new("unknown.example", 8080),
            ],
            "seed",
        )
        .await?;

    let err = proxies.replace_all(Vec::new(), "empty").await.unwrap_err();
    assert!(matches!(err, CoreError::EmptyProxyReplacement));
    assert_eq!(proxies.stats().await?.available, 3);

    let mut handles = Vec::new();
    for i in 0..4 {
        let proxies = proxies.clone();
        handles.push(tokio::spawn(async move {
            proxies.take_one(&WorkerId(format!("w{i}"))).await
        }));
    }
    let mut hosts = Vec::new();
    let mut misses = 0;
    for handle in handles {
        match handle.await?? {
            Some(proxy) => hosts.push(proxy.host),
            None => misses += 1,
        }
    }
    hosts.sort();
    assert_eq!(hosts, vec!["fast.example", "slow.example", "unknown.example"]);
    assert_eq!(misses, 1);
    Ok(())
}

#[sqlx::test(migrator = "fleetlease_core::MIGRATOR")]
async fn proxies_are_taken_fastest_first(pool: PgPool) -> Result<()> {
    let proxies = ProxyPool::new(Arc::new(PostgresProxyRepository::new(pool)));
    proxies
        .replace_all(
            vec![
                ProxyCandidate::new("b", 1).with_response_time(300),
                ProxyCandidate::new("c", 1),
                ProxyCandidate::new("a", 1).with_response_time(20),
            ],
            "seed",
        )
        .await?;
    let worker = WorkerId::from("w");
    let mut order = Vec::new();
    while let Some(proxy) = proxies.take_one(&worker).await? {
        order.push(proxy.host);
    }
    assert_eq!(order, vec!["a", "b", "c"]);
    Ok(())
}

#[sqlx::test(migrator = "fleetlease_core::MIGRATOR")]
async fn reused_batch_id_is_rejected(pool: PgPool) -> Result<()> {
    let manager = manager(&pool);
    let original = NewBatch::new("first.txt", accounts("dup", 2));
    let batch_id = original.batch_id.clone();
    manager.create_batch(original).await?;

    let reused = NewBatch {
        batch_id: batch_id.clone(),
        ..NewBatch::new("again.txt", accounts("fresh", 1))
    };
    let rejected = manager.create_batch(reused).await;
    assert!(matches!(rejected, Err(CoreError::InvalidInput(_))));

    let batch = manager.batch(&batch_id).await?.expect("batch row");
    assert_eq!(batch.account_count, 2);
    assert_eq!(manager.account_stats().await?.total, 2);
    Ok(())
}
