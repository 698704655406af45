//! End-to-end lifecycle through the assembled service: publish, book,
//! contend, reschedule, cancel, then restart on the same data directory.

use std::path::PathBuf;

use slotbook::engine::{EngineError, TentativeAction};
use slotbook::model::{Ms, now_ms};
use slotbook::service::{BookingService, ServiceConfig};

const H: Ms = 3_600_000;
const DAY: Ms = 24 * H;

fn tmp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_service").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_booking_lifecycle_survives_restart() {
    let dir = tmp_dir("lifecycle");
    let now = now_ms();
    {
        let service = BookingService::open(&dir, ServiceConfig::default()).unwrap();
        let engine = service.engine();

        let alice = engine.register_client("alice").await.unwrap();
        let bob = engine.register_client("bob").await.unwrap();
        let haircut = engine
            .add_service("Haircut", "30", Some("30 minutes"))
            .await
            .unwrap();

        let outcome = engine
            .publish_slots(&[now + 3 * DAY, now + 4 * DAY], now)
            .await
            .unwrap();
        assert_eq!(outcome.created, 2);
        let slots = engine.list_future_slots(now, Ms::MAX);

        let mut alice_rx = service.notifier().subscribe("alice");

        let booking = engine.reserve(slots[0].id, alice, haircut, now).await.unwrap();
        assert!(alice_rx.recv().await.unwrap().contains("Haircut"));

        let err = engine
            .reserve(slots[0].id, bob, haircut, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SlotTaken(_)));

        let moved = engine
            .reschedule(booking.id, alice, slots[1].id, now)
            .await
            .unwrap();
        assert!(alice_rx.recv().await.unwrap().contains("Moved"));

        // The old slot is free again: bob requests it and then confirms.
        let pending = engine
            .reserve_tentative(slots[0].id, bob, haircut, now)
            .await
            .unwrap();
        let confirmed = engine
            .resolve_tentative(pending.id, bob, TentativeAction::Confirm, now)
            .await
            .unwrap();
        assert!(confirmed.confirmed);

        engine.cancel(moved.id, alice, now).await.unwrap();

        // Alice can book again at will, but her monthly cancel is spent.
        let again = engine.reserve(slots[1].id, alice, haircut, now).await.unwrap();
        let err = engine.cancel(again.id, alice, now).await.unwrap_err();
        assert!(matches!(err, EngineError::QuotaExceeded(_)));
    }

    // Restart on the same directory: catalog, bookings and quota survive.
    let service = BookingService::open(&dir, ServiceConfig::default()).unwrap();
    let engine = service.engine();

    assert_eq!(engine.slot_count(), 2);
    assert_eq!(engine.service_count(), 1);

    let alice = engine.client_by_ref("alice").unwrap();
    let bob = engine.client_by_ref("bob").unwrap();
    assert_eq!(
        engine.list_client_bookings(alice, now).await.unwrap().len(),
        1
    );
    assert_eq!(
        engine.list_client_bookings(bob, now).await.unwrap().len(),
        1
    );

    let ci = engine.client_info(alice).await.unwrap();
    assert_eq!((ci.cancels_this_month, ci.reschedules_this_month), (1, 1));

    let _ = std::fs::remove_dir_all(&dir);
}
