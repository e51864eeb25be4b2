//! Funding wallet reconciliation and batch runs against an in-memory wallet.

mod common;

use bitcoin::Amount;
use btc_settle::artifacts::{ArtifactStore, JsonArtifactStore, MemoryArtifactStore};
use btc_settle::broadcast::{BroadcastChannel, BroadcastCoordinator, ChannelError, VerifyPolicy, WalletChannel};
use btc_settle::core::{PaymentTarget, RetryPolicy};
use btc_settle::funding::{ErrorKind, FundingReconciler, FundingRun, ReconcileError, RunSettings};
use btc_settle::runtime::Shutdown;
use btc_settle::tx::{FeeEstimator, TransactionBuilder};
use btc_settle::wallet::{Network, WalletGateway, WalletHandle};
use common::{address, funding_wallet, utxo, MockGateway, Script, ScriptedChannel};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn targets(count: u32, sat: u64) -> Vec<PaymentTarget> {
    (1..=count)
        .map(|i| PaymentTarget::new(address(i), Amount::from_sat(sat)).with_reference(format!("address-{}", i)))
        .collect()
}

fn run_with(
    gateway: Arc<MockGateway>,
    channels: Vec<Arc<dyn BroadcastChannel>>,
    store: Arc<dyn ArtifactStore>,
    batch_size: usize,
) -> FundingRun {
    let coordinator = BroadcastCoordinator::new(channels)
        .with_verify(VerifyPolicy { attempts: 2, interval: Duration::from_millis(100) })
        .with_retry(RetryPolicy::none());
    let settings = RunSettings { batch_size, batch_delay: Duration::from_millis(500), max_fee: Amount::from_sat(10_000) };
    FundingRun::new(
        gateway,
        coordinator,
        TransactionBuilder::new(Network::Regtest, Amount::from_sat(546)),
        FeeEstimator::new(2),
        store,
        settings,
    )
    .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
}

fn wallet_channel(gateway: &Arc<MockGateway>) -> Vec<Arc<dyn BroadcastChannel>> {
    let gateway: Arc<dyn WalletGateway> = gateway.clone();
    vec![Arc::new(WalletChannel::new(gateway, funding_wallet()))]
}

/// The wallet reports a different funding address; the key is re-imported and
/// the balance now reflects the funding address.
#[tokio::test]
async fn mismatched_wallet_is_recreated_from_key_material() {
    common::init_tracing();
    let gateway = MockGateway::new(Some(&address(9)));
    gateway.fund(&address(9), vec![utxo(1, 0, 5_000)]);
    gateway.fund(&address(0), vec![utxo(2, 0, 250_000), utxo(3, 1, 50_000)]);

    let reconciler = FundingReconciler::new(gateway.clone()).with_retry(RetryPolicy::none());
    let wallet = funding_wallet();
    assert_eq!(gateway.balance(&wallet).await.unwrap(), Amount::from_sat(5_000));

    let state = reconciler.reconcile(&wallet, &address(0)).await.expect("reconcile");
    assert!(state.is_consistent());
    assert_eq!(state.actual_address.as_deref(), Some(address(0).as_str()));
    assert_eq!(state.balance, Amount::from_sat(300_000));
    assert_eq!(gateway.imports(), 1);
    assert_eq!(gateway.balance(&wallet).await.unwrap(), Amount::from_sat(300_000));
}

#[tokio::test]
async fn reconcile_twice_imports_once() {
    let gateway = MockGateway::new(None);
    gateway.fund(&address(0), vec![utxo(1, 0, 10_000)]);
    let reconciler = FundingReconciler::new(gateway.clone());
    let wallet = funding_wallet();

    let first = reconciler.reconcile(&wallet, &address(0)).await.expect("first");
    let second = reconciler.reconcile(&wallet, &address(0)).await.expect("second");
    assert_eq!(first, second);
    assert_eq!(gateway.imports(), 1);
    assert_eq!(gateway.loads(), 2);
}

#[tokio::test]
async fn address_comparison_ignores_case() {
    let gateway = MockGateway::new(Some(&address(0).to_uppercase()));
    let reconciler = FundingReconciler::new(gateway.clone());
    reconciler.reconcile(&funding_wallet(), &address(0)).await.expect("reconcile");
    assert_eq!(gateway.imports(), 0);
}

#[tokio::test]
async fn mismatch_without_key_material_is_an_error() {
    let gateway = MockGateway::new(Some(&address(9)));
    let reconciler = FundingReconciler::new(gateway.clone());
    let wallet = WalletHandle::new("bare", Network::Regtest);

    let err = reconciler.reconcile(&wallet, &address(0)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::NoKeyMaterial { ref wallet } if wallet == "bare"));
    assert_eq!(gateway.imports(), 0);
}

#[tokio::test]
async fn key_for_another_address_is_not_imported() {
    let gateway = MockGateway::new(Some(&address(9)));
    let reconciler = FundingReconciler::new(gateway.clone());

    let err = reconciler.reconcile(&funding_wallet(), &address(5)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::KeyMismatch { .. }));
    assert_eq!(gateway.imports(), 0);
}

#[tokio::test]
async fn expected_address_prefers_configuration_then_key() {
    let gateway = MockGateway::new(Some(&address(4)));
    let reconciler = FundingReconciler::new(gateway.clone());

    let configured = reconciler.expected_address(&funding_wallet(), Some("bcrt1qconfigured")).await.unwrap();
    assert_eq!(configured, "bcrt1qconfigured");
    assert_eq!(reconciler.expected_address(&funding_wallet(), None).await.unwrap(), address(0));

    let bare = WalletHandle::new("bare", Network::Regtest);
    assert_eq!(reconciler.expected_address(&bare, None).await.unwrap(), address(4));
}

#[tokio::test(start_paused = true)]
async fn run_pays_every_target_in_batches() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), (1..=4).map(|n| utxo(n, 0, 100_000)).collect());
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(JsonArtifactStore::new(dir.path()));
    let run = run_with(gateway.clone(), wallet_channel(&gateway), store.clone(), 2);

    let summary = run.run(&funding_wallet(), &address(0), &targets(5, 20_000)).await;

    assert!(summary.fatal.is_none(), "{:?}", summary.failures);
    assert!(summary.failures.is_empty());
    assert_eq!(summary.funded_targets, 5);
    assert_eq!(summary.transactions.len(), 3);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(gateway.submitted(), summary.transactions);
    for i in 1..=5 {
        assert_eq!(gateway.balance_of(&address(i)), Amount::from_sat(20_000));
    }

    let payments = std::fs::read_to_string(store.path_for("payments")).expect("payments");
    assert_eq!(payments.lines().count(), 3);
    let summaries = std::fs::read_to_string(store.path_for("summaries")).expect("summaries");
    let recorded: serde_json::Value = serde_json::from_str(summaries.lines().next().unwrap()).unwrap();
    assert_eq!(recorded["record"]["funded_targets"], 5);
}

#[tokio::test(start_paused = true)]
async fn spent_outpoints_are_not_reused_across_batches() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 60_000), utxo(2, 0, 60_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    // accepted but never propagated: the wallet keeps listing the spent outputs
    let channel = Arc::new(ScriptedChannel::new("sticky", Script::Blackhole));
    let run = run_with(gateway.clone(), vec![channel.clone() as Arc<dyn BroadcastChannel>], store.clone(), 1);

    let summary = run.run(&funding_wallet(), &address(0), &targets(3, 40_000)).await;

    assert_eq!(channel.calls(), 2);
    let exhausted = summary.failures_of(ErrorKind::BroadcastExhausted);
    let insufficient = summary.failures_of(ErrorKind::InsufficientFunds);
    assert_eq!(exhausted, 2);
    assert_eq!(insufficient, 1);
    assert_eq!(summary.failures[2].batch, 2);
    assert_eq!(summary.failures[2].addresses, vec![address(3)]);
    assert_eq!(summary.exit_code(), 0);
}

/// A channel accepts bytes the wallet never sees while the wallet drifts to
/// another address. The confirmed batch triggers a reconcile, so the next
/// batch spends from the re-imported funding address.
#[tokio::test(start_paused = true)]
async fn unverified_attempt_reconciles_before_next_batch() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 100_000), utxo(2, 0, 100_000)]);
    gateway.fund(&address(9), vec![utxo(50, 0, 500_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    let lagging = Arc::new(
        ScriptedChannel::new("lagging", Script::Blackhole)
            .propagating_to(gateway.clone())
            .then(Script::Drift(address(9))),
    );
    let relay = Arc::new(ScriptedChannel::new("relay", Script::Accept).propagating_to(gateway.clone()));
    let channels: Vec<Arc<dyn BroadcastChannel>> = vec![lagging.clone(), relay.clone()];
    let run = run_with(gateway.clone(), channels, store.clone(), 1);

    let summary = run.run(&funding_wallet(), &address(0), &targets(2, 40_000)).await;

    assert_eq!(summary.funded_targets, 2);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(relay.calls(), 2);
    assert_eq!(gateway.imports(), 1);
    // initial reconcile plus one after each batch with an unverified attempt
    assert_eq!(gateway.loads(), 3);
    assert_eq!(gateway.balance_of(&address(9)), Amount::from_sat(500_000));
    assert_eq!(gateway.balance_of(&address(2)), Amount::from_sat(40_000));
}

#[tokio::test(start_paused = true)]
async fn exhausted_unverified_broadcast_triggers_reconcile() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 100_000), utxo(2, 0, 100_000)]);
    gateway.fund(&address(9), vec![utxo(50, 0, 500_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    let channel = Arc::new(
        ScriptedChannel::new("lagging", Script::Blackhole)
            .propagating_to(gateway.clone())
            .then(Script::Drift(address(9))),
    );
    let run = run_with(gateway.clone(), vec![channel.clone() as Arc<dyn BroadcastChannel>], store.clone(), 1);

    let summary = run.run(&funding_wallet(), &address(0), &targets(2, 40_000)).await;

    assert_eq!(channel.calls(), 2);
    assert_eq!(summary.failures_of(ErrorKind::BroadcastExhausted), 2);
    assert!(summary.failures[0].had_unverified());
    assert_eq!(gateway.imports(), 1);
    assert_eq!(gateway.loads(), 3);
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_reconcile_after_exhausted_broadcast_is_fatal() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 100_000), utxo(2, 0, 100_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    let channel = Arc::new(
        ScriptedChannel::new("lagging", Script::Blackhole)
            .propagating_to(gateway.clone())
            .then(Script::Drift(address(9))),
    );
    let run = run_with(gateway.clone(), vec![channel.clone() as Arc<dyn BroadcastChannel>], store.clone(), 1);
    let bare = WalletHandle::new("wallet_0", Network::Regtest);

    let summary = run.run(&bare, &address(0), &targets(2, 40_000)).await;

    assert_eq!(channel.calls(), 1);
    assert_eq!(summary.failures.len(), 2);
    assert_eq!(summary.failures[0].kind, ErrorKind::BroadcastExhausted);
    assert_eq!(summary.failures[1].kind, ErrorKind::Reconcile);
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(gateway.imports(), 0);
}

#[tokio::test(start_paused = true)]
async fn overflowing_target_amounts_fail_the_batch() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 100_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    let run = run_with(gateway.clone(), wallet_channel(&gateway), store.clone(), 2);
    let half = Amount::from_sat(u64::MAX / 2 + 1);
    let huge = vec![PaymentTarget::new(address(1), half), PaymentTarget::new(address(2), half)];

    let summary = run.run(&funding_wallet(), &address(0), &huge).await;

    assert_eq!(summary.funded_targets, 0);
    assert_eq!(summary.failures_of(ErrorKind::Build), 1);
    assert!(summary.failures[0].reason.contains("overflows"));
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn insufficient_funds_fails_items_but_run_continues() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 30_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    let run = run_with(gateway.clone(), wallet_channel(&gateway), store.clone(), 1);

    let summary = run.run(&funding_wallet(), &address(0), &targets(2, 50_000)).await;

    assert_eq!(summary.funded_targets, 0);
    assert_eq!(summary.failures_of(ErrorKind::InsufficientFunds), 2);
    assert!(summary.failures[0].reason.contains("Insufficient"));
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(store.records_of("summaries").len(), 1);
    assert!(store.records_of("payments").is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_broadcast_moves_on_to_next_batch() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 100_000), utxo(2, 0, 100_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    let flaky = Arc::new(
        ScriptedChannel::new("esplora", Script::Accept)
            .propagating_to(gateway.clone())
            .then(Script::Fail(ChannelError::Rejected("400: bad-txns-inputs-missingorspent".into()))),
    );
    let run = run_with(gateway.clone(), vec![flaky as Arc<dyn BroadcastChannel>], store.clone(), 1);

    let summary = run.run(&funding_wallet(), &address(0), &targets(2, 30_000)).await;

    assert_eq!(summary.failures_of(ErrorKind::BroadcastExhausted), 1);
    assert_eq!(summary.funded_targets, 1);
    assert_eq!(summary.transactions.len(), 1);
    assert_eq!(gateway.balance_of(&address(2)), Amount::from_sat(30_000));
    assert_eq!(store.records_of("payments").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_snapshot_failures_are_retried() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), vec![utxo(1, 0, 100_000)]);
    gateway.fail_list_unspent(2);
    let run = run_with(gateway.clone(), wallet_channel(&gateway), Arc::new(MemoryArtifactStore::new()), 10);

    let summary = run.run(&funding_wallet(), &address(0), &targets(1, 10_000)).await;
    assert!(summary.failures.is_empty(), "{:?}", summary.failures);
    assert_eq!(summary.funded_targets, 1);
}

#[tokio::test(start_paused = true)]
async fn unrecoverable_wallet_halts_the_run() {
    let gateway = MockGateway::new(Some(&address(9)));
    gateway.fund(&address(9), vec![utxo(1, 0, 100_000)]);
    let store = Arc::new(MemoryArtifactStore::new());
    let run = run_with(gateway.clone(), wallet_channel(&gateway), store.clone(), 1);

    let bare = WalletHandle::new("wallet_0", Network::Regtest);
    let summary = run.run(&bare, &address(0), &targets(3, 10_000)).await;

    assert!(summary.fatal.is_some());
    assert_eq!(summary.exit_code(), 2);
    assert_eq!(summary.failures_of(ErrorKind::Reconcile), 1);
    assert!(gateway.submitted().is_empty());
    assert_eq!(store.records_of("summaries").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_before_next_batch() {
    let gateway = MockGateway::new(Some(&address(0)));
    gateway.fund(&address(0), (1..=3).map(|n| utxo(n, 0, 100_000)).collect());
    let shutdown = Shutdown::new();
    let run = run_with(gateway.clone(), wallet_channel(&gateway), Arc::new(MemoryArtifactStore::new()), 1)
        .with_shutdown(shutdown.clone());

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
    });
    let summary = run.run(&funding_wallet(), &address(0), &targets(3, 10_000)).await;

    assert!(summary.interrupted);
    assert_eq!(summary.funded_targets, 1);
    assert_eq!(summary.exit_code(), 0);
}
