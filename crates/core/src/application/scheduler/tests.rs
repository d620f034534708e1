use super::*;
use crate::application::event_channel::EventStream;
use crate::application::session::ClientSession;
use crate::domain::{PackageMode, PhaseCode};
use crate::port::id_provider::mocks::SequentialIdProvider;
use crate::port::package_agent::mocks::{AgentCall, MockPackageAgent};
use crate::port::store::mocks::InMemoryTransactionStore;
use crate::port::time_provider::mocks::FixedTimeProvider;
use crate::port::AgentError;

struct Harness {
    handle: SchedulerHandle,
    sink: AgentSink,
    agent: Arc<MockPackageAgent>,
    store: Arc<InMemoryTransactionStore>,
    trigger: ShutdownTrigger,
    task: tokio::task::JoinHandle<Result<()>>,
}

fn start() -> Harness {
    start_with(SchedulerConfig::default())
}

fn start_with(config: SchedulerConfig) -> Harness {
    let (handle, sink, inbox) = channel();
    let agent = Arc::new(MockPackageAgent::new());
    let store = Arc::new(InMemoryTransactionStore::new());
    let scheduler = Scheduler::new(
        inbox,
        config,
        agent.clone(),
        store.clone(),
        Arc::new(SequentialIdProvider::new()),
        Arc::new(FixedTimeProvider::new(1_000)),
    );
    let (trigger, listener) = shutdown_channel();
    let task = tokio::spawn(scheduler.run(listener));
    Harness {
        handle,
        sink,
        agent,
        store,
        trigger,
        task,
    }
}

impl Harness {
    async fn session(&self) -> ClientSession {
        ClientSession::open(self.handle.clone()).await.unwrap()
    }

    fn signal(&self, signal: AgentSignal) {
        assert!(self.sink.notify(AgentNotice::Signal(signal)));
    }

    fn agent_lost(&self) {
        assert!(self.sink.notify(AgentNotice::OwnerChanged {
            old_owner: "agent-1".to_string(),
            new_owner: String::new(),
        }));
    }

    /// Round-trips through the reactor, so earlier notices are applied
    async fn txn(&self, id: &str) -> Transaction {
        self.handle.transaction(id).await.unwrap().unwrap()
    }
}

fn install(name: &str) -> PackageSet {
    PackageSet::with_mode([name], PackageMode::Install).unwrap()
}

fn remove(name: &str) -> PackageSet {
    PackageSet::with_mode([name], PackageMode::Remove).unwrap()
}

fn drain(rx: &mut EventStream) -> Vec<EventPayload> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event.payload);
    }
    out
}

fn untrusted_question() -> Question {
    Question::InstallUntrusted {
        untrusted_items: vec!["pkgX".to_string(), "pkgY".to_string()],
    }
}

#[tokio::test]
async fn test_first_submission_runs_second_waits() {
    let h = start();
    let client = h.session().await;

    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let t2 = client.submit(TransactionKind::Remove, remove("pkgB")).await.unwrap();

    let active = h.handle.active_transaction().await.unwrap().unwrap();
    assert_eq!(active.id, t1);
    assert_eq!(active.phase, Some(Phase::Authorizing));
    assert_eq!(h.txn(&t2).await.state, TransactionState::Pending);
    assert_eq!(h.agent.calls(), vec![AgentCall::CommitChanges(install("pkgA"))]);

    let ids: Vec<String> = h
        .handle
        .transactions()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![t1, t2]);
}

#[tokio::test]
async fn test_listing_matches_snapshot() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let t2 = client.submit(TransactionKind::Remove, remove("pkgB")).await.unwrap();
    let t3 = client.propose(TransactionKind::Install, install("pkgC")).await.unwrap();

    let listing = h.handle.list().await.unwrap();
    assert_eq!(listing.snapshot.active, Some(t1.clone()));
    assert_eq!(listing.snapshot.queued, vec![t2.clone()]);
    assert_eq!(listing.snapshot.proposed, vec![t3.clone()]);
    let ids: Vec<String> = listing.transactions.into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![t1, t2, t3]);
}

#[tokio::test]
async fn test_error_fails_active_and_promotes_next() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let t2 = client.submit(TransactionKind::Remove, remove("pkgB")).await.unwrap();
    let mut events = client.subscribe(&t1).await.unwrap();

    let fetch = TransactionError::Fetch {
        failed_item: "pkgA.deb".to_string(),
        error_text: "404".to_string(),
    };
    h.signal(AgentSignal::WorkerStarted);
    h.signal(AgentSignal::ErrorOccurred(fetch.clone()));
    // Duplicate error from the same worker run collapses
    h.signal(AgentSignal::ErrorOccurred(TransactionError::Lock));

    let failed = h.txn(&t1).await;
    assert_eq!(failed.state, TransactionState::Failed);
    assert_eq!(failed.error, Some(fetch.clone()));

    let next = h.txn(&t2).await;
    assert_eq!(next.state, TransactionState::Active);
    assert_eq!(next.phase, Some(Phase::Waiting));
    assert_eq!(h.agent.dispatch_count(), 1);

    // The agent winds down, then the next transaction is handed over
    h.signal(AgentSignal::WorkerFinished { success: false });
    assert_eq!(h.txn(&t2).await.phase, Some(Phase::Authorizing));
    assert_eq!(h.agent.dispatch_count(), 2);
    assert_eq!(h.txn(&t1).await.error, Some(fetch.clone()));

    assert_eq!(
        drain(&mut events),
        vec![
            EventPayload::Started,
            EventPayload::Error(fetch),
            EventPayload::Finished(Outcome::Failed),
        ]
    );
    assert_eq!(h.store.get(&t1).unwrap().state, TransactionState::Failed);
}

#[tokio::test]
async fn test_remove_pending_notifies_and_spares_active() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let t2 = client.submit(TransactionKind::Remove, remove("pkgB")).await.unwrap();

    let (snapshot, mut changes) = h.handle.watch_queue().await.unwrap();
    assert_eq!(snapshot.queued, vec![t2.clone()]);

    assert!(client.remove(&t2).await.unwrap());
    assert!(!client.remove(&t2).await.unwrap());

    let after = changes.recv().await.unwrap();
    assert_eq!(after.active.as_deref(), Some(t1.as_str()));
    assert!(after.queued.is_empty());

    assert_eq!(h.txn(&t1).await.state, TransactionState::Active);
    assert_eq!(h.txn(&t2).await.state, TransactionState::Cancelled);
    assert_eq!(h.handle.transactions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_agent_loss_flushes_queue() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let t2 = client.submit(TransactionKind::Remove, remove("pkgB")).await.unwrap();
    let t3 = client.submit(TransactionKind::Upgrade, install("pkgC")).await.unwrap();
    let draft = client.propose(TransactionKind::Install, install("pkgD")).await.unwrap();
    let mut t2_events = client.subscribe(&t2).await.unwrap();

    h.agent_lost();

    for id in [&t1, &t2, &t3] {
        let txn = h.txn(id).await;
        assert_eq!(txn.state, TransactionState::Failed, "{}", id);
        assert_eq!(txn.error, Some(TransactionError::AgentLost));
        assert_eq!(h.store.get(id).unwrap().state, TransactionState::Failed);
    }
    assert_eq!(h.txn(&draft).await.state, TransactionState::Proposed);
    assert!(h.handle.active_transaction().await.unwrap().is_none());
    assert_eq!(
        drain(&mut t2_events),
        vec![
            EventPayload::Error(TransactionError::AgentLost),
            EventPayload::Finished(Outcome::Failed),
        ]
    );

    // A fresh agent picks up new work right away
    assert_eq!(client.enqueue(&draft).await.unwrap(), EnqueueOutcome::Activated);
    assert_eq!(h.txn(&draft).await.phase, Some(Phase::Authorizing));
}

#[tokio::test]
async fn test_agent_loss_while_idle_is_harmless() {
    let h = start();
    let client = h.session().await;
    let draft = client.propose(TransactionKind::Update, PackageSet::empty()).await.unwrap();

    h.agent_lost();

    assert_eq!(h.txn(&draft).await.state, TransactionState::Proposed);
}

#[tokio::test]
async fn test_declined_question_cancels_without_commit_events() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let mut events = client.subscribe(&t1).await.unwrap();

    h.signal(AgentSignal::WorkerStarted);
    h.signal(AgentSignal::WorkerEvent(PhaseCode::CommitChangesStarted));
    h.signal(AgentSignal::QuestionOccurred(untrusted_question()));

    assert_eq!(h.txn(&t1).await.pending_question, Some(untrusted_question()));

    let decline = Answer::InstallUntrusted {
        install_untrusted: false,
    };
    assert_eq!(client.answer(&t1, decline).await.unwrap(), AnswerOutcome::Declined);

    // The agent may still report commit work; nobody hears it
    h.signal(AgentSignal::CommitProgress {
        message: "Unpacking pkgA".to_string(),
        percent: 40,
    });

    let txn = h.txn(&t1).await;
    assert_eq!(txn.state, TransactionState::Cancelled);
    assert!(txn.pending_question.is_none());
    assert!(h.agent.calls().contains(&AgentCall::AnswerQuestion(decline)));

    let payloads = drain(&mut events);
    let question_at = payloads
        .iter()
        .position(|p| matches!(p, EventPayload::Question(_)))
        .unwrap();
    assert_eq!(
        &payloads[question_at + 1..],
        &[EventPayload::Finished(Outcome::Cancelled)]
    );
}

#[tokio::test]
async fn test_accepted_answer_resumes() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    h.signal(AgentSignal::QuestionOccurred(untrusted_question()));

    // Wrong kind is treated as no answer yet
    let wrong = Answer::MediaChange {
        media_changed: true,
    };
    assert_eq!(client.answer(&t1, wrong).await.unwrap(), AnswerOutcome::Ignored);
    assert!(h.txn(&t1).await.pending_question.is_some());

    let accept = Answer::InstallUntrusted {
        install_untrusted: true,
    };
    assert_eq!(client.answer(&t1, accept).await.unwrap(), AnswerOutcome::Accepted);
    assert_eq!(client.answer(&t1, accept).await.unwrap(), AnswerOutcome::Ignored);

    let txn = h.txn(&t1).await;
    assert_eq!(txn.state, TransactionState::Active);
    assert!(txn.pending_question.is_none());
}

#[tokio::test]
async fn test_cancel_is_phase_gated() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();

    assert_eq!(client.cancel(&t1).await.unwrap(), CancelOutcome::NotCancellable);

    h.signal(AgentSignal::WorkerEvent(PhaseCode::CommitChangesStarted));
    assert_eq!(client.cancel(&t1).await.unwrap(), CancelOutcome::TooLate);
    assert_eq!(h.txn(&t1).await.state, TransactionState::Active);

    h.signal(AgentSignal::WorkerFinished { success: true });
    let t2 = client.submit(TransactionKind::Install, install("pkgB")).await.unwrap();
    h.signal(AgentSignal::DownloadProgress {
        percent: 30,
        speed_bytes_per_sec: Some(1024),
        eta_seconds: Some(12),
    });
    assert_eq!(h.txn(&t2).await.phase, Some(Phase::Downloading));

    assert_eq!(client.cancel(&t2).await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(h.txn(&t2).await.state, TransactionState::Cancelled);
    assert!(h.agent.calls().contains(&AgentCall::CancelDownload));

    // Second cancel is a no-op
    assert_eq!(client.cancel(&t2).await.unwrap(), CancelOutcome::AlreadyFinished);
    assert_eq!(client.cancel("missing").await.unwrap(), CancelOutcome::Unknown);
}

#[tokio::test]
async fn test_cancel_during_download_declines_open_question() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();

    h.signal(AgentSignal::WorkerEvent(PhaseCode::PackageDownloadStarted));
    let media = Question::MediaChange {
        media: "Disc 2".to_string(),
        drive: "/dev/sr0".to_string(),
    };
    h.signal(AgentSignal::QuestionOccurred(media.clone()));
    assert_eq!(h.txn(&t1).await.pending_question, Some(media));

    assert_eq!(client.cancel(&t1).await.unwrap(), CancelOutcome::Cancelled);
    assert_eq!(
        h.agent.calls(),
        vec![
            AgentCall::CommitChanges(install("pkgA")),
            AgentCall::AnswerQuestion(Answer::MediaChange {
                media_changed: false
            }),
            AgentCall::CancelDownload,
        ]
    );

    // Unblocked by the answer, the agent winds down and frees the slot
    let t2 = client.submit(TransactionKind::Install, install("pkgB")).await.unwrap();
    assert_eq!(h.txn(&t2).await.phase, Some(Phase::Waiting));
    h.signal(AgentSignal::WorkerFinished { success: false });

    assert_eq!(h.txn(&t2).await.phase, Some(Phase::Authorizing));
    assert_eq!(h.agent.dispatch_count(), 2);
}

#[tokio::test]
async fn test_cancel_requires_owner() {
    let h = start();
    let owner = h.session().await;
    let other = h.session().await;
    let t1 = owner.submit(TransactionKind::Install, install("pkgA")).await.unwrap();

    assert_eq!(other.cancel(&t1).await.unwrap(), CancelOutcome::NotOwner);
    assert_eq!(other.enqueue(&t1).await.unwrap(), EnqueueOutcome::Ignored);
    assert!(!other.remove(&t1).await.unwrap());
    assert_eq!(h.txn(&t1).await.state, TransactionState::Active);
}

#[tokio::test]
async fn test_cancel_waiting_and_pending() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let t2 = client.submit(TransactionKind::Install, install("pkgB")).await.unwrap();
    let t3 = client.submit(TransactionKind::Install, install("pkgC")).await.unwrap();

    assert_eq!(client.cancel(&t3).await.unwrap(), CancelOutcome::Cancelled);

    h.signal(AgentSignal::ErrorOccurred(TransactionError::Lock));
    assert_eq!(h.txn(&t2).await.phase, Some(Phase::Waiting));
    assert_eq!(client.cancel(&t2).await.unwrap(), CancelOutcome::Cancelled);

    h.signal(AgentSignal::WorkerFinished { success: false });
    assert!(h.handle.active_transaction().await.unwrap().is_none());
    assert_eq!(h.txn(&t1).await.error, Some(TransactionError::Lock));
    assert_eq!(h.agent.dispatch_count(), 1);
}

#[tokio::test]
async fn test_successful_run_emits_ordered_events() {
    let h = start();
    let client = h.session().await;
    // Subscribe before the transaction exists: session is txn-1, this is txn-2
    let mut events = client.subscribe("txn-2").await.unwrap();
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    assert_eq!(t1, "txn-2");

    h.signal(AgentSignal::WorkerStarted);
    h.signal(AgentSignal::WorkerEvent(PhaseCode::PackageDownloadStarted));
    h.signal(AgentSignal::DownloadProgress {
        percent: 50,
        speed_bytes_per_sec: None,
        eta_seconds: None,
    });
    h.signal(AgentSignal::DownloadProgress {
        percent: 20,
        speed_bytes_per_sec: None,
        eta_seconds: None,
    });
    h.signal(AgentSignal::CommitProgress {
        message: "Setting up pkgA".to_string(),
        percent: 70,
    });
    h.signal(AgentSignal::WorkerFinished { success: true });

    let txn = h.txn(&t1).await;
    assert_eq!(txn.state, TransactionState::Finished);
    assert_eq!(txn.progress_percent, 100);
    assert_eq!(h.store.get(&t1).unwrap().state, TransactionState::Finished);

    let mut sequences = Vec::new();
    let mut payloads = Vec::new();
    while let Ok(event) = events.try_recv() {
        sequences.push(event.sequence);
        payloads.push(event.payload);
    }
    assert_eq!(sequences, (0..payloads.len() as u64).collect::<Vec<_>>());
    assert_eq!(payloads.first(), Some(&EventPayload::Started));
    assert_eq!(payloads.last(), Some(&EventPayload::Finished(Outcome::Succeeded)));

    let percents: Vec<(Phase, u8)> = payloads
        .iter()
        .filter_map(|p| match p {
            EventPayload::Progress(u) => Some((u.phase, u.percent)),
            _ => None,
        })
        .collect();
    // The regressing download report is dropped
    assert_eq!(
        percents,
        vec![
            (Phase::Downloading, 0),
            (Phase::Downloading, 50),
            (Phase::Committing, 70)
        ]
    );
}

#[tokio::test]
async fn test_unexplained_failure_is_unknown_error() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Update, PackageSet::empty()).await.unwrap();
    assert_eq!(h.agent.calls(), vec![AgentCall::UpdateCache]);

    h.signal(AgentSignal::WorkerFinished { success: false });

    let txn = h.txn(&t1).await;
    assert_eq!(txn.state, TransactionState::Failed);
    assert_eq!(
        txn.error,
        Some(TransactionError::Unknown {
            code: UNREPORTED_FAILURE_CODE
        })
    );
}

#[tokio::test]
async fn test_refused_dispatch_fails_with_init_error() {
    let h = start();
    h.agent
        .refuse_dispatch(AgentError::Unavailable("no worker binary".to_string()));
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let mut events = client.subscribe(&t1).await.unwrap();

    let txn = h.txn(&t1).await;
    assert_eq!(txn.state, TransactionState::Failed);
    assert_eq!(txn.error, Some(TransactionError::Init));
    assert_eq!(
        drain(&mut events),
        vec![
            EventPayload::Error(TransactionError::Init),
            EventPayload::Finished(Outcome::Failed),
        ]
    );
    assert!(h.handle.active_transaction().await.unwrap().is_none());
}

#[tokio::test]
async fn test_session_teardown() {
    let h = start();
    let client = h.session().await;
    let bystander = h.session().await;

    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    let queued = client.submit(TransactionKind::Remove, remove("pkgB")).await.unwrap();
    let draft = client.propose(TransactionKind::Install, install("pkgC")).await.unwrap();
    h.signal(AgentSignal::QuestionOccurred(untrusted_question()));

    client.close();

    assert_eq!(h.txn(&t1).await.state, TransactionState::Cancelled);
    assert_eq!(h.txn(&draft).await.state, TransactionState::Cancelled);
    assert!(h
        .agent
        .calls()
        .contains(&AgentCall::AnswerQuestion(untrusted_question().decline())));

    // Queued work keeps its place and is promoted
    let next = h.txn(&queued).await;
    assert_eq!(next.state, TransactionState::Active);

    // Closed session can no longer create
    let err = h
        .handle
        .create("session-txn-1", TransactionKind::Update, PackageSet::empty())
        .await;
    assert!(matches!(err, Err(AppError::NotFound(_))));
    drop(bystander);
}

#[tokio::test]
async fn test_question_for_departed_owner_is_declined() {
    let h = start();
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    drop(client);

    h.signal(AgentSignal::WorkerEvent(PhaseCode::CommitChangesStarted));
    h.signal(AgentSignal::QuestionOccurred(Question::MediaChange {
        media: "Disc 1".to_string(),
        drive: "/media/cdrom".to_string(),
    }));

    assert_eq!(h.txn(&t1).await.state, TransactionState::Cancelled);
    assert!(h.agent.calls().contains(&AgentCall::AnswerQuestion(Answer::MediaChange {
        media_changed: false
    })));
}

#[tokio::test]
async fn test_subscribe_after_history_expired_is_rejected() {
    let h = start_with(SchedulerConfig {
        retained_streams: 1,
        retired_capacity: 1,
        ..SchedulerConfig::default()
    });
    let client = h.session().await;

    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    h.signal(AgentSignal::WorkerFinished { success: true });
    let t2 = client.submit(TransactionKind::Install, install("pkgB")).await.unwrap();
    h.signal(AgentSignal::WorkerFinished { success: true });

    let err = client.subscribe(&t1).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    // Still retained: full replay, then the stream ends
    let mut events = client.subscribe(&t2).await.unwrap();
    assert_eq!(
        drain(&mut events).last(),
        Some(&EventPayload::Finished(Outcome::Succeeded))
    );
    assert!(events.recv().await.is_none());

    // Ids nobody has seen yet may still be subscribed ahead of time
    assert!(client.subscribe("txn-later").await.is_ok());
}

#[tokio::test]
async fn test_store_failure_does_not_fail_transaction() {
    let h = start();
    h.store.fail_writes(true);
    let client = h.session().await;
    let t1 = client.submit(TransactionKind::Install, install("pkgA")).await.unwrap();
    h.signal(AgentSignal::WorkerFinished { success: true });

    assert_eq!(h.txn(&t1).await.state, TransactionState::Finished);
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let h = start();
    let client = h.session().await;
    let result = client
        .propose(TransactionKind::Install, PackageSet::empty())
        .await;
    assert!(matches!(result, Err(AppError::Domain(_))));
}

#[tokio::test]
async fn test_shutdown_stops_reactor() {
    let h = start();
    h.trigger.trigger();
    h.task.await.unwrap().unwrap();

    assert!(matches!(
        h.handle.open_session().await,
        Err(AppError::SchedulerStopped)
    ));
    assert!(!h.sink.notify(AgentNotice::Signal(AgentSignal::WorkerStarted)));
}
