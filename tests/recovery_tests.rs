mod common;

use std::sync::Arc;
use std::time::Duration;

use txnspace::journal::{HEAD, TAIL, context_key, groups_key, joined_key, state_key};
use txnspace::prelude::*;

use common::{Call, FailingJournal, Recorder, init_logger, journal_space, new_trail, wait_for_condition};

type Journal = Arc<dyn Space<String, JournalValue>>;

fn seed_counters(journal: &Journal, tail: u64, head: u64) {
    journal.put(TAIL.to_string(), JournalValue::Counter(tail)).unwrap();
    journal.put(HEAD.to_string(), JournalValue::Counter(head)).unwrap();
}

fn seed_txn(journal: &Journal, id: u64, context: &str, state: Option<TxnState>) {
    let bytes = bincode::serialize(&context.to_string()).unwrap();
    journal.put(context_key(id), JournalValue::Context(bytes)).unwrap();
    if let Some(state) = state {
        journal.put(state_key(id), JournalValue::State(state)).unwrap();
    }
}

fn seed_joined(journal: &Journal, id: u64, members: &[Member]) {
    for member in members {
        journal.out(joined_key(id), JournalValue::Joined(member.clone())).unwrap();
    }
}

fn counter(journal: &Journal, key: &str) -> Option<JournalValue> {
    journal.try_read(&key.to_string()).unwrap()
}

fn recovering(journal: &Journal) -> TransactionManagerBuilder<String> {
    init_logger();
    TransactionManager::<String>::builder("txnmgr").journal_space(Arc::clone(journal))
}

#[test]
fn test_preparing_transactions_are_aborted_once() {
    let journal = journal_space();
    seed_counters(&journal, 5, 6);
    seed_txn(&journal, 5, "interrupted", Some(TxnState::Preparing));
    seed_joined(&journal, 5, &[Member::pipeline(0), Member::pipeline(1)]);

    let first = Arc::new(Recorder::new("first"));
    let second = Arc::new(Recorder::new("second"));
    let manager = recovering(&journal)
        .participant(first.clone())
        .participant(second.clone())
        .build()
        .unwrap();
    manager.start().unwrap();

    assert_eq!(first.calls(), vec![Call::Recover(5, false), Call::Abort(5, "interrupted".to_string())]);
    assert_eq!(second.aborts(), vec![(5, "interrupted".to_string())]);
    assert_eq!(manager.stats().recovered_aborts(), 1);
    assert_eq!(manager.stats().recovered_commits(), 0);
    assert_eq!(journal.try_read(&state_key(5)).unwrap(), None);
    assert_eq!(journal.try_read(&context_key(5)).unwrap(), None);
    manager.stop();

    // A second start finds nothing left to replay.
    manager.start().unwrap();
    assert_eq!(first.aborts().len(), 1);
    assert_eq!(manager.stats().recovered_aborts(), 1);
}

#[test]
fn test_committing_transactions_are_committed_once() {
    let journal = journal_space();
    seed_counters(&journal, 7, 8);
    seed_txn(&journal, 7, "half-committed", Some(TxnState::Committing));
    seed_joined(&journal, 7, &[Member::pipeline(0)]);

    let post = Arc::new(Recorder::new("post"));
    let manager = recovering(&journal).participant(post.clone()).build().unwrap();
    manager.start().unwrap();

    assert_eq!(post.commits(), vec![(7, "half-committed".to_string())]);
    assert!(post.aborts().is_empty());
    assert_eq!(manager.stats().recovered_commits(), 1);
}

#[test]
fn test_done_transactions_are_only_purged() {
    let journal = journal_space();
    seed_counters(&journal, 3, 4);
    seed_txn(&journal, 3, "finished", Some(TxnState::Done));

    let post = Arc::new(Recorder::new("post"));
    let manager = recovering(&journal).participant(post.clone()).build().unwrap();
    manager.start().unwrap();

    assert!(post.calls().is_empty());
    assert_eq!(journal.try_read(&context_key(3)).unwrap(), None);
    assert_eq!(journal.try_read(&state_key(3)).unwrap(), None);
}

#[test]
fn test_orphan_contexts_are_dropped() {
    let journal = journal_space();
    seed_counters(&journal, 20, 21);
    // Crashed between the snapshot and the PREPARING state.
    seed_txn(&journal, 20, "orphan", None);

    let post = Arc::new(Recorder::new("post"));
    let manager = recovering(&journal).participant(post.clone()).build().unwrap();
    manager.start().unwrap();

    assert!(post.calls().is_empty());
    assert_eq!(journal.try_read(&context_key(20)).unwrap(), None);
    assert_eq!(manager.tail(), 21);
}

#[test]
fn test_only_joined_participants_are_replayed() {
    let journal = journal_space();
    let trail = new_trail();
    seed_counters(&journal, 1, 2);
    seed_txn(&journal, 1, "routed", Some(TxnState::Committing));
    journal.out(groups_key(1), JournalValue::Group("credit".to_string())).unwrap();
    journal.out(groups_key(1), JournalValue::Group("notify".to_string())).unwrap();
    // The validator voted NO_JOIN and the router's selection skipped `bystander`.
    seed_joined(
        &journal,
        1,
        &[
            Member::pipeline(1),
            Member::group("credit", 0),
            Member::group("gone", 0),
            Member::group("notify", 0),
        ],
    );

    let validator = Arc::new(Recorder::new("validator").traced(&trail));
    let router = Arc::new(Recorder::new("router").traced(&trail));
    let bystander = Arc::new(Recorder::new("bystander").traced(&trail));
    let post = Arc::new(Recorder::new("post").traced(&trail));
    let notify = Arc::new(Recorder::new("notify").traced(&trail));
    let unused = Arc::new(Recorder::new("unused").traced(&trail));
    let manager = recovering(&journal)
        .participant(validator.clone())
        .participant(router.clone())
        .participant(bystander.clone())
        .group_participant("credit", post.clone())
        .group_participant("notify", notify.clone())
        .group_participant("audit", unused.clone())
        .build()
        .unwrap();
    manager.start().unwrap();

    assert_eq!(
        *trail.lock().unwrap(),
        vec![
            "router:recover:1",
            "post:recover:1",
            "notify:recover:1",
            "router:commit:1",
            "post:commit:1",
            "notify:commit:1",
        ]
    );
    assert_eq!(journal.count(&groups_key(1)), 0);
    assert_eq!(journal.count(&joined_key(1)), 0);
}

#[test]
fn test_recovery_matches_the_live_pipeline() {
    init_logger();
    let inner = journal_space();
    // DONE never lands, leaving the transaction COMMITTING as a crash would.
    let failing = FailingJournal::new(Arc::clone(&inner), |value| {
        matches!(value, JournalValue::State(TxnState::Done))
    });
    let trail = new_trail();
    let router = Arc::new(Recorder::new("router").select(&["credit"]).traced(&trail));
    let skipped = Arc::new(Recorder::new("skipped").traced(&trail));
    let post = Arc::new(Recorder::new("post").traced(&trail));
    let build = |journal: Journal| {
        TransactionManager::<String>::builder("txnmgr")
            .journal_retries(0)
            .retry_backoff(Duration::from_millis(10))
            .journal_space(journal)
            .participant(router.clone())
            .participant(skipped.clone())
            .group_participant("credit", post.clone())
            .build()
            .unwrap()
    };

    let live_journal: Journal = failing.clone();
    let live = build(live_journal);
    live.start().unwrap();
    live.submit("deposit".to_string()).unwrap();
    assert!(wait_for_condition(|| post.commits().len() == 1, 2000));
    live.stop();

    assert_eq!(
        inner.try_read(&state_key(1)).unwrap(),
        Some(JournalValue::State(TxnState::Committing))
    );
    assert_eq!(
        *trail.lock().unwrap(),
        vec!["router:prepare:1", "post:prepare:1", "router:commit:1", "post:commit:1"]
    );
    trail.lock().unwrap().clear();

    let restarted = build(Arc::clone(&inner));
    restarted.start().unwrap();

    assert_eq!(
        *trail.lock().unwrap(),
        vec!["router:recover:1", "post:recover:1", "router:commit:1", "post:commit:1"]
    );
    assert!(skipped.calls().is_empty());
    assert_eq!(restarted.tail(), 2);
    assert_eq!(restarted.stats().recovered_commits(), 1);
}

#[test]
fn test_recover_callbacks_rebuild_the_context() {
    let journal = journal_space();
    seed_counters(&journal, 9, 10);
    seed_txn(&journal, 9, "payload", Some(TxnState::Committing));
    seed_joined(&journal, 9, &[Member::pipeline(0), Member::pipeline(1)]);

    let rebuild = Arc::new(Recorder::new("rebuild").rebuilding());
    let post = Arc::new(Recorder::new("post"));
    let manager = recovering(&journal)
        .participant(rebuild.clone())
        .participant(post.clone())
        .build()
        .unwrap();
    manager.start().unwrap();

    assert_eq!(rebuild.commits(), vec![(9, "payload+recovered".to_string())]);
    assert_eq!(post.commits(), vec![(9, "payload+recovered".to_string())]);
}

#[test]
fn test_counters_collapse_to_head_after_recovery() {
    let journal = journal_space();
    seed_counters(&journal, 40, 44);
    seed_txn(&journal, 40, "a", Some(TxnState::Done));
    seed_txn(&journal, 41, "b", Some(TxnState::Committing));
    seed_txn(&journal, 42, "c", Some(TxnState::Preparing));
    seed_joined(&journal, 41, &[Member::pipeline(0)]);
    seed_joined(&journal, 42, &[Member::pipeline(0)]);
    // 43 never got past its HEAD bump.

    let post = Arc::new(Recorder::new("post"));
    let manager = recovering(&journal).participant(post.clone()).build().unwrap();
    manager.start().unwrap();

    assert_eq!(manager.head(), 44);
    assert_eq!(manager.tail(), 44);
    assert_eq!(counter(&journal, HEAD), Some(JournalValue::Counter(44)));
    assert_eq!(counter(&journal, TAIL), Some(JournalValue::Counter(44)));
    assert_eq!(manager.stats().recovered_commits(), 1);
    assert_eq!(manager.stats().recovered_aborts(), 1);
    for id in 40..44 {
        assert_eq!(journal.try_read(&state_key(id)).unwrap(), None);
        assert_eq!(journal.try_read(&context_key(id)).unwrap(), None);
    }

    // New work continues from the recovered head.
    manager.submit("fresh".to_string()).unwrap();
    assert!(wait_for_condition(|| manager.tail() == 45, 2000));
    assert!(post.commits().contains(&(44, "fresh".to_string())));
    manager.stop();
}

#[test]
fn test_head_behind_tail_is_raised() {
    let journal = journal_space();
    seed_counters(&journal, 30, 12);

    let manager = recovering(&journal).build().unwrap();
    manager.start().unwrap();

    assert_eq!(manager.head(), 30);
    assert_eq!(manager.tail(), 30);
    assert_eq!(counter(&journal, HEAD), Some(JournalValue::Counter(30)));
}

#[test]
fn test_lost_tail_token_is_reseeded() {
    let journal = journal_space();
    seed_counters(&journal, 1, 1);
    // A crash while the token was held leaves no token behind.
    let echo = Arc::new(Recorder::new("echo"));
    let manager = recovering(&journal).participant(echo.clone()).build().unwrap();
    manager.start().unwrap();

    manager.submit("one".to_string()).unwrap();
    manager.submit("two".to_string()).unwrap();
    assert!(wait_for_condition(|| manager.tail() == 3, 2000));
    assert_eq!(echo.commits().len(), 2);
}

#[cfg(feature = "persistent")]
mod persistent {
    use super::*;
    use tempfile::TempDir;

    fn journal_at(registry: &SpaceRegistry) -> Journal {
        registry.lookup::<String, JournalValue>("jdbm:journal").unwrap()
    }

    #[test]
    fn test_ids_continue_across_restarts() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let echo = Arc::new(Recorder::new("echo"));

        for (round, expected_tail) in [(0u64, 3u64), (1, 5)] {
            let registry = SpaceRegistry::new().with_base_dir(dir.path());
            let manager = recovering(&journal_at(&registry))
                .participant(echo.clone())
                .build()
                .unwrap();
            manager.start().unwrap();
            manager.submit(format!("round {} first", round)).unwrap();
            manager.submit(format!("round {} second", round)).unwrap();
            assert!(wait_for_condition(|| manager.tail() == expected_tail, 2000));
            manager.stop();
        }

        let ids: Vec<u64> = echo.commits().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_crash_is_aborted_after_reopen() {
        init_logger();
        let dir = TempDir::new().unwrap();
        {
            let registry = SpaceRegistry::new().with_base_dir(dir.path());
            let journal = journal_at(&registry);
            seed_counters(&journal, 100, 101);
            seed_txn(&journal, 100, "in flight", Some(TxnState::Preparing));
            seed_joined(&journal, 100, &[Member::pipeline(0)]);
        }

        let registry = SpaceRegistry::new().with_base_dir(dir.path());
        let journal = journal_at(&registry);
        let post = Arc::new(Recorder::new("post"));
        let manager = recovering(&journal).participant(post.clone()).build().unwrap();
        manager.start().unwrap();

        assert_eq!(post.aborts(), vec![(100, "in flight".to_string())]);
        assert_eq!(manager.tail(), 101);
        assert_eq!(journal.try_read(&state_key(100)).unwrap(), None);
        manager.stop();
    }
}
