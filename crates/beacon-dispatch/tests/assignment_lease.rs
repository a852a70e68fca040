//! End-to-end assignment leasing over the in-memory store

use async_trait::async_trait;
use beacon_channel::{
    InMemoryRecordStore, RecordChannel, RecordHandler, SubscriptionHandle,
};
use beacon_core::{DispatchResult, PartyId, RecordPath, ReportId, ResponderAvailability};
use beacon_dispatch::testkit::{create_assignment, set_availability, LeaseEvent, RecordingLeaseEvents};
use beacon_dispatch::{AssignmentLeaseController, LeaseConfig, OfferResolution};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    // Opt-in test visibility: RUST_LOG=debug cargo test -- --nocapture
    let _ = tracing_subscriber::fmt::try_init();
}

struct Fixture {
    responder: PartyId,
    store: Arc<InMemoryRecordStore>,
    events: Arc<RecordingLeaseEvents>,
    controller: Arc<AssignmentLeaseController>,
}

async fn fixture() -> Fixture {
    init_tracing();
    let responder = PartyId::new();
    let store = Arc::new(InMemoryRecordStore::new());
    let events = Arc::new(RecordingLeaseEvents::default());
    let controller = AssignmentLeaseController::new(
        responder,
        store.clone(),
        events.clone(),
        LeaseConfig::default(),
    );
    controller.listen().await.expect("listen");
    settle().await;
    Fixture {
        responder,
        store,
        events,
        controller,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn assignment_present(fx: &Fixture) -> bool {
    fx.store
        .read(&RecordPath::ResponderAssignment(fx.responder))
        .await
        .unwrap()
        .is_some()
}

async fn availability_in_store(fx: &Fixture) -> Option<ResponderAvailability> {
    fx.store
        .read(&RecordPath::ResponderAvailability(fx.responder))
        .await
        .unwrap()
        .map(|raw| serde_json::from_value::<beacon_core::AvailabilityRecord>(raw).unwrap())
        .map(|record| record.availability)
}

#[tokio::test(start_paused = true)]
async fn offer_is_presented_with_the_full_lease_window() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-9"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(fx.events.presentations(), 1);
    let offer = fx.controller.pending_offer().expect("pending offer");
    assert_eq!(offer.report_id, ReportId::from("RPT-9"));
    let remaining = fx.controller.lease_remaining();
    assert!(remaining > Duration::from_secs(29));
    assert!(remaining <= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn decline_at_five_seconds_removes_assignment_and_keeps_availability() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-9"))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    fx.controller.decline(ReportId::from("RPT-9")).await.unwrap();
    settle().await;

    assert!(!assignment_present(&fx).await);
    // Availability was never flipped; absence reads as Available.
    assert_eq!(availability_in_store(&fx).await, None);
    assert_eq!(
        fx.events.resolutions(),
        vec![OfferResolution::Declined]
    );

    // The lease never fires at t=30.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(fx.events.resolutions(), vec![OfferResolution::Declined]);
    assert_eq!(fx.events.presentations(), 1);
}

#[tokio::test(start_paused = true)]
async fn unattended_offer_expires_once_after_the_window() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-1"))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;

    assert!(!assignment_present(&fx).await);
    assert_eq!(availability_in_store(&fx).await, None);
    assert_eq!(fx.events.resolutions(), vec![OfferResolution::Expired]);
    assert!(fx.controller.pending_offer().is_none());

    // Nothing further fires however long we wait.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fx.events.resolutions(), vec![OfferResolution::Expired]);
}

#[tokio::test(start_paused = true)]
async fn accept_flips_availability_and_keeps_the_assignment_as_context() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-2"))
        .await
        .unwrap();
    settle().await;

    fx.controller.accept(ReportId::from("RPT-2")).await.unwrap();
    settle().await;

    assert!(assignment_present(&fx).await);
    assert_eq!(
        availability_in_store(&fx).await,
        Some(ResponderAvailability::Dispatched)
    );
    assert_eq!(fx.events.resolutions(), vec![OfferResolution::Accepted]);

    // Echoes of our own writes and the surviving assignment record must
    // not re-open the decision UI.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fx.events.presentations(), 1);
    assert!(fx.controller.pending_offer().is_none());
    assert_eq!(fx.controller.lease_remaining(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn redundant_deliveries_do_not_re_present() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-3"))
        .await
        .unwrap();
    settle().await;

    // Re-write the same assignment and availability; each write fans out a
    // fresh delivery of an unchanged view.
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-3"))
        .await
        .unwrap();
    set_availability(
        fx.store.as_ref(),
        fx.responder,
        ResponderAvailability::Available,
    )
    .await
    .unwrap();
    settle().await;

    assert_eq!(fx.events.presentations(), 1);
}

#[tokio::test(start_paused = true)]
async fn accept_and_expiry_racing_yield_exactly_one_outcome() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-4"))
        .await
        .unwrap();
    settle().await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    let (accepted, ()) = tokio::join!(
        fx.controller.accept(ReportId::from("RPT-4")),
        fx.controller.on_lease_expiry(ReportId::from("RPT-4")),
    );
    settle().await;

    let dispatched =
        availability_in_store(&fx).await == Some(ResponderAvailability::Dispatched);
    let reclaimed = !assignment_present(&fx).await;
    // Exactly one of {Dispatched, Cleared}; never a Dispatched write plus
    // an assignment removal.
    assert!(dispatched ^ reclaimed, "dispatched={dispatched} reclaimed={reclaimed}");
    assert_eq!(fx.events.resolutions().len(), 1);
    if dispatched {
        assert!(accepted.is_ok());
        assert_eq!(fx.events.resolutions(), vec![OfferResolution::Accepted]);
    } else {
        assert_eq!(fx.events.resolutions(), vec![OfferResolution::Expired]);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_accept_rolls_back_and_lets_the_user_retry() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-5"))
        .await
        .unwrap();
    settle().await;

    fx.store.fail_next_writes(1);
    let result = fx.controller.accept(ReportId::from("RPT-5")).await;
    assert!(result.is_err());
    assert!(result.unwrap_err().is_retryable());

    // Decision UI is re-armed: the offer is still pending, the lease still
    // counting, and the failure was surfaced.
    assert!(fx.controller.pending_offer().is_some());
    assert!(fx.controller.lease_remaining() > Duration::ZERO);
    assert!(matches!(
        fx.events.events().last(),
        Some(LeaseEvent::DecisionFailed(..))
    ));

    // The retry goes through.
    fx.controller.accept(ReportId::from("RPT-5")).await.unwrap();
    settle().await;
    assert_eq!(
        availability_in_store(&fx).await,
        Some(ResponderAvailability::Dispatched)
    );
}

#[tokio::test(start_paused = true)]
async fn failed_decline_rolls_back_and_lets_the_lease_reclaim() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-6"))
        .await
        .unwrap();
    settle().await;

    fx.store.fail_next_writes(1);
    assert!(fx.controller.decline(ReportId::from("RPT-6")).await.is_err());
    assert!(fx.controller.pending_offer().is_some());

    // No decision ever lands; the lease still reclaims at the deadline.
    tokio::time::sleep(Duration::from_secs(31)).await;
    settle().await;
    assert!(!assignment_present(&fx).await);
    assert_eq!(fx.events.resolutions(), vec![OfferResolution::Expired]);
}

#[tokio::test(start_paused = true)]
async fn remote_withdrawal_dismisses_and_disarms() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-7"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(fx.events.presentations(), 1);

    fx.store
        .remove(&RecordPath::ResponderAssignment(fx.responder))
        .await
        .unwrap();
    settle().await;

    assert_eq!(fx.events.resolutions(), vec![OfferResolution::Withdrawn]);
    assert!(fx.controller.pending_offer().is_none());
    assert_eq!(fx.controller.lease_remaining(), Duration::ZERO);

    // No phantom expiry later.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(fx.events.resolutions(), vec![OfferResolution::Withdrawn]);
}

#[tokio::test(start_paused = true)]
async fn same_report_can_be_offered_again_after_the_release_grace() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-8"))
        .await
        .unwrap();
    settle().await;
    fx.controller.decline(ReportId::from("RPT-8")).await.unwrap();
    settle().await;

    // Past the grace window the id has left the dedup set; a fresh offer
    // of the same report is actionable again.
    tokio::time::sleep(Duration::from_secs(6)).await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-8"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(fx.events.presentations(), 2);
}

/// Channel wrapper that stalls availability writes, widening the window in
/// which a delivery can land while a decision write is in flight.
struct SlowAvailabilityStore {
    inner: Arc<InMemoryRecordStore>,
    write_delay: Duration,
}

#[async_trait]
impl RecordChannel for SlowAvailabilityStore {
    async fn read(&self, path: &RecordPath) -> DispatchResult<Option<Value>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &RecordPath, value: Value) -> DispatchResult<()> {
        if matches!(path, RecordPath::ResponderAvailability(_)) {
            tokio::time::sleep(self.write_delay).await;
        }
        self.inner.write(path, value).await
    }

    async fn remove(&self, path: &RecordPath) -> DispatchResult<()> {
        self.inner.remove(path).await
    }

    async fn subscribe(
        &self,
        path: &RecordPath,
        handler: RecordHandler,
    ) -> DispatchResult<SubscriptionHandle> {
        self.inner.subscribe(path, handler).await
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner.unsubscribe(handle)
    }
}

#[tokio::test(start_paused = true)]
async fn offer_displaced_during_an_accept_write_is_not_clobbered() {
    init_tracing();
    let responder = PartyId::new();
    let inner = Arc::new(InMemoryRecordStore::new());
    let store = Arc::new(SlowAvailabilityStore {
        inner: Arc::clone(&inner),
        write_delay: Duration::from_millis(100),
    });
    let events = Arc::new(RecordingLeaseEvents::default());
    let controller = AssignmentLeaseController::new(
        responder,
        store,
        events.clone(),
        LeaseConfig::default(),
    );
    controller.listen().await.unwrap();
    settle().await;

    create_assignment(inner.as_ref(), responder, ReportId::from("RPT-A"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(events.presentations(), 1);

    // Start the accept; while its availability write is stalled, the
    // dispatcher swaps the assignment underneath it.
    let accepting = {
        let ctrl = Arc::clone(&controller);
        tokio::spawn(async move { ctrl.accept(ReportId::from("RPT-A")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    create_assignment(inner.as_ref(), responder, ReportId::from("RPT-B"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(events.presentations(), 2);

    accepting.await.unwrap().unwrap();
    settle().await;

    // Each offer resolved exactly once: the displaced one as Withdrawn at
    // swap time, its replacement as Withdrawn when the Dispatched flip
    // landed. No double dismissal, no clobbered countdown.
    let dismissals: Vec<_> = events
        .events()
        .into_iter()
        .filter(|e| matches!(e, LeaseEvent::Dismissed(..)))
        .collect();
    assert_eq!(
        dismissals,
        vec![
            LeaseEvent::Dismissed(ReportId::from("RPT-A"), OfferResolution::Withdrawn),
            LeaseEvent::Dismissed(ReportId::from("RPT-B"), OfferResolution::Withdrawn),
        ]
    );
    assert!(controller.pending_offer().is_none());
    assert_eq!(controller.lease_remaining(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn dispatched_context_at_startup_is_not_presented() {
    init_tracing();
    let responder = PartyId::new();
    let store = Arc::new(InMemoryRecordStore::new());
    create_assignment(store.as_ref(), responder, ReportId::from("RPT-10"))
        .await
        .unwrap();
    set_availability(store.as_ref(), responder, ResponderAvailability::Dispatched)
        .await
        .unwrap();

    let events = Arc::new(RecordingLeaseEvents::default());
    let controller = AssignmentLeaseController::new(
        responder,
        store.clone(),
        events.clone(),
        LeaseConfig::default(),
    );
    controller.listen().await.unwrap();
    settle().await;

    assert_eq!(events.presentations(), 0);
    assert!(controller.pending_offer().is_none());
    assert_eq!(controller.lease_remaining(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_the_lease_and_ignores_late_deliveries() {
    let fx = fixture().await;
    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-11"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(fx.events.presentations(), 1);

    fx.controller.shutdown();

    // The disarmed lease never reclaims, and a late offer for the torn
    // down session never surfaces.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(assignment_present(&fx).await);
    assert_eq!(fx.events.resolutions(), Vec::new());

    create_assignment(fx.store.as_ref(), fx.responder, ReportId::from("RPT-12"))
        .await
        .unwrap();
    settle().await;
    assert_eq!(fx.events.presentations(), 1);
}
