mod common;

use std::time::Duration;

use anyhow::Result;
use common::{history_len, test_service, total_balance};
use tokio::task::JoinSet;
use tokio::time::timeout;
use wallet_ledger::LedgerError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_top_ups_on_fresh_account() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let mut tasks = JoinSet::new();
    for _ in 0..100 {
        let service = service.clone();
        tasks.spawn(async move { service.top_up("alice", 10).await });
    }
    while let Some(result) = tasks.join_next().await {
        result??;
    }

    assert_eq!(service.get_balance("alice").await?, 1000);
    let history = service.queries().history("alice")?.records().await?;
    assert_eq!(history.len(), 100);

    // Every record saw a distinct balance, so no credit was lost.
    let mut after: Vec<i64> = history.iter().map(|r| r.balance_after).collect();
    after.sort_unstable();
    let expected: Vec<i64> = (1..=100).map(|n| n * 10).collect();
    assert_eq!(after, expected);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_never_deadlock() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.top_up("alice", 1000).await?;
    service.top_up("bob", 1000).await?;

    let mut tasks = JoinSet::new();
    for i in 0..100 {
        let service = service.clone();
        tasks.spawn(async move {
            if i % 2 == 0 {
                service.transfer("alice", "bob", 7).await
            } else {
                service.transfer("bob", "alice", 5).await
            }
        });
    }

    let all_done = timeout(Duration::from_secs(30), async {
        let mut outcomes = Vec::new();
        while let Some(result) = tasks.join_next().await {
            outcomes.push(result);
        }
        outcomes
    })
    .await
    .expect("transfers deadlocked");

    for outcome in all_done {
        outcome??;
    }

    assert_eq!(service.get_balance("alice").await?, 1000 - 50 * 7 + 50 * 5);
    assert_eq!(service.get_balance("bob").await?, 1000 + 50 * 7 - 50 * 5);
    assert_eq!(history_len(&service, "alice").await?, 101);
    assert_eq!(history_len(&service, "bob").await?, 101);
    assert!(service.audit().await?.is_healthy());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_workload_conserves_money() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let names = ["alice", "bob", "carol", "dave", "erin"];
    for name in names {
        service.top_up(name, 500).await?;
    }

    // Deterministic pseudo-random workload.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    let mut tasks = JoinSet::new();
    let mut deposited: i64 = 5 * 500;
    for _ in 0..300 {
        let service = service.clone();
        let from = names[(next() % 5) as usize];
        let to = names[(next() % 5) as usize];
        let amount = (next() % 200) as i64 + 1;
        if next() % 4 == 0 {
            deposited += amount;
            tasks.spawn(async move { service.top_up(from, amount).await.map(|_| ()) });
        } else {
            tasks.spawn(async move { service.transfer(from, to, amount).await.map(|_| ()) });
        }
    }

    while let Some(result) = tasks.join_next().await {
        match result? {
            Ok(()) => {}
            Err(LedgerError::InsufficientFunds { .. }) | Err(LedgerError::SameAccount(_)) => {}
            Err(other) => panic!("unexpected failure: {other:?}"),
        }
    }

    assert_eq!(total_balance(&service).await?, deposited);
    for account in service.list_accounts().await? {
        assert!(account.balance >= 0);
    }
    let report = service.audit().await?;
    assert!(report.is_healthy(), "{report:?}");
    assert_eq!(report.total_deposits, i128::from(deposited));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_caller_does_not_tear_operation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.top_up("alice", 100).await?;
    service.top_up("bob", 100).await?;

    // The caller gives up almost immediately; the operation has already
    // been handed off and must still finish as a whole.
    let _ = timeout(Duration::from_nanos(1), service.top_up("alice", 10)).await;
    let _ = timeout(Duration::from_nanos(1), service.transfer("bob", "alice", 30)).await;

    let settled = timeout(Duration::from_secs(10), async {
        loop {
            if history_len(&service, "alice").await? == 3 {
                return anyhow::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    settled.expect("operations never completed")?;

    assert_eq!(service.get_balance("alice").await?, 140);
    assert_eq!(service.get_balance("bob").await?, 70);
    assert!(service.audit().await?.is_healthy());

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_run_alongside_writers() -> Result<()> {
    let (service, _temp) = test_service().await?;
    service.top_up("alice", 10_000).await?;
    service.top_up("bob", 1).await?;

    let writer = {
        let service = service.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                service.transfer("alice", "bob", 10).await?;
            }
            anyhow::Ok(())
        })
    };

    // Every observed total is a committed state: nothing half applied.
    for _ in 0..20 {
        assert_eq!(total_balance(&service).await?, 10_001);
        let history = service.queries().history("alice")?.records().await?;
        for pair in history.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    writer.await??;
    assert_eq!(service.get_balance("bob").await?, 501);

    Ok(())
}
