//! End-to-end tests through the engine handle.
//!
//! Operation → LedgerTx → ChangeSet → InventoryStore, then read back through
//! the engine, the movement log and the audit event log.
//!
//! Verifies:
//! - Stock buckets stay consistent and replayable after every workflow
//! - Failed operations leave no trace (fail-closed)
//! - Lost optimistic-concurrency races surface as retry-safe conflicts

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

    use stockledger_analytics::{AbcClass, CountFrequency, JobControl, ReorderPriority};
    use stockledger_core::{
        ActorId, AggregateRoot, CycleCountId, DomainError, FixedClock, ItemId, LocationId, ShortageScope,
        TransferOrderId,
    };
    use stockledger_events::EventEnvelope;
    use stockledger_inventory::{
        Batch, BatchReceipt, CostLayers, CountLineStatus, CountWarning, CycleCount,
        CycleCountStatus, Item, KitComponent, KitCostBreakdown, LocationStock, MovementKind,
        NewItem, Reference, ReferenceKind, SerialNumber, SerialStatus, StockKey, StockMovement,
        TransferLineRequest, TransferOrder, TransferStatus,
    };

    use crate::config::EngineConfig;
    use crate::engine::{
        AlertKind, CountSelection, InventoryEngine, IssueStock, ReceiveStock, ReturnStock,
        TRANSFER_STREAM_TYPE,
    };
    use crate::ledger::AdjustRequest;
    use crate::store::{
        ChangeSet, InMemoryStore, InventoryStore, MovementQuery, StoreError, StoredEvent, Versioned,
    };

    fn test_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    fn clerk() -> ActorId {
        ActorId::from("clerk")
    }

    fn supervisor() -> ActorId {
        ActorId::from("supervisor")
    }

    fn wh_a() -> LocationId {
        LocationId::from("wh-a")
    }

    fn wh_b() -> LocationId {
        LocationId::from("wh-b")
    }

    fn setup() -> (InventoryEngine<InMemoryStore>, Arc<FixedClock>) {
        stockledger_observability::init();
        let clock = Arc::new(FixedClock::new(test_now()));
        let engine = InventoryEngine::new(
            Arc::new(InMemoryStore::new()),
            clock.clone(),
            EngineConfig::default(),
        );
        (engine, clock)
    }

    fn new_item(id: &str, cost: i64) -> NewItem {
        NewItem::new(id.to_uppercase(), format!("Item {id}"))
            .with_id(ItemId::from(id))
            .with_prices(cost, cost * 2)
    }

    fn po(id: &str) -> Reference {
        Reference::new(ReferenceKind::PurchaseOrder, id)
    }

    fn so(id: &str) -> Reference {
        Reference::new(ReferenceKind::SalesOrder, id)
    }

    fn receive<S: InventoryStore>(engine: &InventoryEngine<S>, item: &str, loc: LocationId, qty: i64) {
        engine
            .receive_stock(ReceiveStock::new(ItemId::from(item), loc, qty, po("po-1")), &clerk())
            .unwrap();
    }

    fn level<S: InventoryStore>(engine: &InventoryEngine<S>, item: &str, loc: LocationId) -> LocationStock {
        engine.stock_level(&ItemId::from(item), &loc).unwrap()
    }

    fn assert_replays<S: InventoryStore>(engine: &InventoryEngine<S>) {
        for row in engine.list_stock(None).unwrap() {
            assert!(row.is_consistent(), "buckets out of balance: {row:?}");
            let check = engine
                .verify_stock_projection(&row.item_id, &row.location_id)
                .unwrap();
            assert!(check.is_consistent(), "replay drifted: {check:?}");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transfers
    // ─────────────────────────────────────────────────────────────────────

    fn transfer_ten() -> (InventoryEngine<InMemoryStore>, TransferOrderId) {
        let (engine, _) = setup();
        engine.create_item(new_item("bolt", 20)).unwrap();
        receive(&engine, "bolt", wh_a(), 25);

        let order = engine
            .create_transfer_order(
                &wh_a(),
                &wh_b(),
                vec![TransferLineRequest {
                    item_id: ItemId::from("bolt"),
                    quantity: 10,
                }],
                &clerk(),
            )
            .unwrap();
        let order_id = order.id().clone();
        engine.submit_transfer_order(&order_id, &clerk()).unwrap();
        engine.approve_transfer_order(&order_id, &supervisor()).unwrap();
        (engine, order_id)
    }

    #[test]
    fn transfer_moves_stock_and_leaves_no_reservation() {
        let (engine, order_id) = transfer_ten();
        let reserved = level(&engine, "bolt", wh_a());
        assert_eq!((reserved.on_hand, reserved.available, reserved.reserved), (25, 15, 10));

        engine.ship_transfer_order(&order_id, &clerk()).unwrap();
        let shipped = level(&engine, "bolt", wh_a());
        assert_eq!((shipped.on_hand, shipped.available, shipped.reserved), (15, 15, 0));

        let order = engine
            .receive_transfer_order(&order_id, Vec::new(), &clerk())
            .unwrap();
        assert_eq!(order.status(), TransferStatus::Received);

        let a = level(&engine, "bolt", wh_a());
        let b = level(&engine, "bolt", wh_b());
        assert_eq!(a.on_hand, 15);
        assert_eq!(a.reserved, 0);
        assert_eq!(b.on_hand, 10);
        assert_eq!(b.available, 10);
        assert_replays(&engine);
    }

    #[test]
    fn partial_receipt_keeps_order_in_transit() {
        let (engine, order_id) = transfer_ten();
        engine.ship_transfer_order(&order_id, &clerk()).unwrap();

        let partial = engine
            .receive_transfer_order(
                &order_id,
                vec![TransferLineRequest {
                    item_id: ItemId::from("bolt"),
                    quantity: 4,
                }],
                &clerk(),
            )
            .unwrap();
        assert_eq!(partial.status(), TransferStatus::InTransit);
        assert_eq!(level(&engine, "bolt", wh_b()).on_hand, 4);

        let done = engine
            .receive_transfer_order(&order_id, Vec::new(), &clerk())
            .unwrap();
        assert_eq!(done.status(), TransferStatus::Received);
        assert_eq!(level(&engine, "bolt", wh_b()).on_hand, 10);
    }

    #[test]
    fn received_stock_carries_the_shipped_unit_cost() {
        let (engine, order_id) = transfer_ten();
        engine.ship_transfer_order(&order_id, &clerk()).unwrap();
        engine
            .receive_transfer_order(&order_id, Vec::new(), &clerk())
            .unwrap();

        let valuation = engine
            .get_inventory_valuation(Some(&wh_b()), &JobControl::new())
            .unwrap();
        assert_eq!(valuation.total_quantity, 10);
        assert_eq!(valuation.total_value, 200);
    }

    #[test]
    fn cancelling_an_approved_transfer_releases_the_reservation() {
        let (engine, order_id) = transfer_ten();
        let order = engine
            .cancel_transfer_order(&order_id, Some("customer changed plans".into()), &clerk())
            .unwrap();
        assert_eq!(order.status(), TransferStatus::Cancelled);

        let a = level(&engine, "bolt", wh_a());
        assert_eq!((a.on_hand, a.available, a.reserved), (25, 25, 0));
        assert_replays(&engine);
    }

    #[test]
    fn shipped_transfer_cannot_be_cancelled() {
        let (engine, order_id) = transfer_ten();
        engine.ship_transfer_order(&order_id, &clerk()).unwrap();
        let err = engine
            .cancel_transfer_order(&order_id, None, &clerk())
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));
        assert_eq!(
            engine.get_transfer_order(&order_id).unwrap().status(),
            TransferStatus::InTransit
        );
    }

    #[test]
    fn submit_checks_source_availability() {
        let (engine, _) = setup();
        engine.create_item(new_item("bolt", 20)).unwrap();
        receive(&engine, "bolt", wh_a(), 3);
        let order = engine
            .create_transfer_order(
                &wh_a(),
                &wh_b(),
                vec![TransferLineRequest {
                    item_id: ItemId::from("bolt"),
                    quantity: 10,
                }],
                &clerk(),
            )
            .unwrap();

        let err = engine.submit_transfer_order(order.id(), &clerk()).unwrap_err();
        match err {
            DomainError::InsufficientStock(shortage) => {
                assert_eq!(shortage.scope, ShortageScope::Ledger);
                assert_eq!((shortage.requested, shortage.available), (10, 3));
            }
            other => panic!("expected a shortage, got {other:?}"),
        }
        assert_eq!(
            engine.get_transfer_order(order.id()).unwrap().status(),
            TransferStatus::Draft
        );
    }

    #[test]
    fn receipt_lines_for_the_same_item_are_merged() {
        let (engine, _) = setup();
        engine.create_item(new_item("phone", 300).serialized()).unwrap();
        engine
            .receive_stock(
                ReceiveStock::new(ItemId::from("phone"), wh_a(), 3, po("po-2"))
                    .with_serials(vec!["SN-1".into(), "SN-2".into(), "SN-3".into()]),
                &clerk(),
            )
            .unwrap();
        let order = engine
            .create_transfer_order(
                &wh_a(),
                &wh_b(),
                vec![TransferLineRequest {
                    item_id: ItemId::from("phone"),
                    quantity: 3,
                }],
                &clerk(),
            )
            .unwrap();
        let order_id = order.id().clone();
        engine.submit_transfer_order(&order_id, &clerk()).unwrap();
        engine.approve_transfer_order(&order_id, &supervisor()).unwrap();
        engine.ship_transfer_order(&order_id, &clerk()).unwrap();

        let line = |quantity| TransferLineRequest {
            item_id: ItemId::from("phone"),
            quantity,
        };
        let order = engine
            .receive_transfer_order(&order_id, vec![line(1), line(2)], &clerk())
            .unwrap();
        assert_eq!(order.status(), TransferStatus::Received);

        let b = level(&engine, "phone", wh_b());
        assert_eq!((b.on_hand, b.available), (3, 3));
        for serial in ["SN-1", "SN-2", "SN-3"] {
            let unit = engine
                .store()
                .get_serial(&ItemId::from("phone"), serial)
                .unwrap()
                .unwrap()
                .value;
            assert_eq!(unit.location_id, wh_b());
            assert_eq!(unit.status, SerialStatus::Available);
        }
        assert_replays(&engine);
    }

    #[test]
    fn transfer_lifecycle_lands_in_the_audit_log() {
        let (engine, order_id) = transfer_ten();
        engine.ship_transfer_order(&order_id, &clerk()).unwrap();
        engine
            .receive_transfer_order(&order_id, Vec::new(), &clerk())
            .unwrap();

        let stream = engine.store().load_stream(order_id.as_str()).unwrap();
        let sequences: Vec<u64> = stream.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, (1..=stream.len() as u64).collect::<Vec<_>>());
        assert!(stream.iter().all(|e| e.stream_type == TRANSFER_STREAM_TYPE));
        // created, submitted, approved, shipped, lines received, received
        assert_eq!(stream.len(), 6);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cycle counts
    // ─────────────────────────────────────────────────────────────────────

    fn counted_at_85() -> (InventoryEngine<InMemoryStore>, CycleCountId) {
        let (engine, _) = setup();
        engine.create_item(new_item("nut", 2)).unwrap();
        receive(&engine, "nut", wh_a(), 100);

        let count = engine
            .create_cycle_count(
                &wh_a(),
                CountSelection::Partial(vec![ItemId::from("nut")]),
                Some(10.0),
                vec![clerk()],
                &supervisor(),
            )
            .unwrap();
        let count_id = count.id().clone();
        engine.start_cycle_count(&count_id, &clerk()).unwrap();
        let line = engine
            .record_count(&count_id, &ItemId::from("nut"), 85, &clerk())
            .unwrap();
        assert_eq!(line.expected_quantity, 100);
        assert_eq!(line.variance, -15);
        assert!((line.variance_pct + 15.0).abs() < 1e-9);
        assert_eq!(line.status, CountLineStatus::Verified);
        (engine, count_id)
    }

    #[test]
    fn high_variance_is_reported_not_adjusted() {
        let (engine, count_id) = counted_at_85();
        let completed = engine.complete_cycle_count(&count_id, &supervisor()).unwrap();

        assert!(completed.adjustments.is_empty());
        assert_eq!(completed.warnings.len(), 1);
        assert!(matches!(
            &completed.warnings[0],
            CountWarning::UnresolvedVariance { variance: -15, .. }
        ));
        assert_eq!(level(&engine, "nut", wh_a()).on_hand, 100);
        assert_eq!(
            engine.get_cycle_count(&count_id).unwrap().status(),
            CycleCountStatus::Completed
        );
    }

    #[test]
    fn approved_variance_is_booked_as_a_count_movement() {
        let (engine, count_id) = counted_at_85();
        engine
            .approve_count_variance(&count_id, &ItemId::from("nut"), &supervisor())
            .unwrap();
        let completed = engine.complete_cycle_count(&count_id, &supervisor()).unwrap();

        assert_eq!(completed.adjustments.len(), 1);
        assert!(completed.warnings.is_empty());
        let nut = level(&engine, "nut", wh_a());
        assert_eq!((nut.on_hand, nut.available), (85, 85));

        let movements = engine
            .list_movements(&MovementQuery::all().item(ItemId::from("nut")))
            .unwrap();
        let count_leg = movements
            .iter()
            .find(|m| m.kind == MovementKind::Count)
            .expect("count movement");
        assert_eq!(count_leg.quantity, -15);
        assert_eq!(count_leg.reference.kind, ReferenceKind::CycleCount);
        assert!(count_leg.reason.as_deref().is_some_and(|r| r.starts_with("cycle count CC-")));
        assert_replays(&engine);
    }

    #[test]
    fn counter_cannot_approve_their_own_variance() {
        let (engine, count_id) = counted_at_85();
        let err = engine
            .approve_count_variance(&count_id, &ItemId::from("nut"), &clerk())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    fn count_one_item(engine: &InventoryEngine<InMemoryStore>, item: &str, counted: i64) -> CycleCountId {
        let count = engine
            .create_cycle_count(
                &wh_a(),
                CountSelection::Partial(vec![ItemId::from(item)]),
                None,
                vec![clerk()],
                &supervisor(),
            )
            .unwrap();
        let count_id = count.id().clone();
        engine.start_cycle_count(&count_id, &clerk()).unwrap();
        engine
            .record_count(&count_id, &ItemId::from(item), counted, &clerk())
            .unwrap();
        engine
            .approve_count_variance(&count_id, &ItemId::from(item), &supervisor())
            .unwrap();
        count_id
    }

    #[test]
    fn count_shortfall_writes_off_damaged_units_first() {
        let (engine, _) = setup();
        engine.create_item(new_item("nut", 2)).unwrap();
        receive(&engine, "nut", wh_a(), 10);
        engine
            .damage_stock(&ItemId::from("nut"), &wh_a(), 4, "crushed", Vec::new(), &clerk())
            .unwrap();

        let count_id = count_one_item(&engine, "nut", 2);
        let completed = engine.complete_cycle_count(&count_id, &supervisor()).unwrap();
        assert!(completed.warnings.is_empty());
        assert_eq!(
            engine.get_cycle_count(&count_id).unwrap().status(),
            CycleCountStatus::Completed
        );

        let nut = level(&engine, "nut", wh_a());
        assert_eq!((nut.on_hand, nut.available, nut.damaged), (2, 2, 0));
        let legs: Vec<(MovementKind, i64)> = engine
            .list_movements(&MovementQuery::all().item(ItemId::from("nut")))
            .unwrap()
            .iter()
            .filter(|m| m.reference.kind == ReferenceKind::CycleCount)
            .map(|m| (m.kind, m.quantity))
            .collect();
        assert_eq!(legs, vec![(MovementKind::Damage, -4), (MovementKind::Count, -4)]);
        assert_replays(&engine);
    }

    #[test]
    fn missing_reserved_units_complete_with_a_warning() {
        let (engine, _) = setup();
        engine.create_item(new_item("nut", 2)).unwrap();
        receive(&engine, "nut", wh_a(), 10);
        let order = engine
            .create_transfer_order(
                &wh_a(),
                &wh_b(),
                vec![TransferLineRequest {
                    item_id: ItemId::from("nut"),
                    quantity: 6,
                }],
                &clerk(),
            )
            .unwrap();
        engine.submit_transfer_order(order.id(), &clerk()).unwrap();
        engine.approve_transfer_order(order.id(), &supervisor()).unwrap();

        let count_id = count_one_item(&engine, "nut", 1);
        let completed = engine.complete_cycle_count(&count_id, &supervisor()).unwrap();
        assert_eq!(completed.warnings.len(), 1);
        assert!(matches!(
            &completed.warnings[0],
            CountWarning::NotPosted { quantity: -5, .. }
        ));
        assert_eq!(
            engine.get_cycle_count(&count_id).unwrap().status(),
            CycleCountStatus::Completed
        );

        let nut = level(&engine, "nut", wh_a());
        assert_eq!((nut.on_hand, nut.available, nut.reserved), (6, 0, 6));
        assert_replays(&engine);
    }

    #[test]
    fn abc_selection_counts_only_the_requested_classes() {
        let (engine, _) = setup();
        for (id, issued) in [("fast", 80), ("medium", 15), ("slow", 5)] {
            engine.create_item(new_item(id, 10)).unwrap();
            receive(&engine, id, wh_a(), 100);
            engine
                .issue_stock(IssueStock::new(ItemId::from(id), wh_a(), issued, so("so-1")), &clerk())
                .unwrap();
        }
        let count = engine
            .create_cycle_count(
                &wh_a(),
                CountSelection::Abc(vec![AbcClass::A]),
                None,
                Vec::new(),
                &supervisor(),
            )
            .unwrap();
        let items: Vec<&ItemId> = count.lines().iter().map(|l| &l.item_id).collect();
        assert_eq!(items, vec![&ItemId::from("fast")]);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Kits
    // ─────────────────────────────────────────────────────────────────────

    fn kit_engine() -> InventoryEngine<InMemoryStore> {
        let (engine, _) = setup();
        engine.create_item(new_item("x", 10)).unwrap();
        engine.create_item(new_item("y", 5)).unwrap();
        engine
            .create_kit(
                new_item("kit", 0),
                vec![
                    KitComponent::new(ItemId::from("x"), 3),
                    KitComponent::new(ItemId::from("y"), 1),
                ],
            )
            .unwrap();
        engine
    }

    #[test]
    fn short_component_fails_assembly_without_side_effects() {
        let engine = kit_engine();
        receive(&engine, "x", wh_a(), 5);
        receive(&engine, "y", wh_a(), 10);
        let before = engine.list_movements(&MovementQuery::all()).unwrap().len();

        let err = engine
            .assemble_kit(&ItemId::from("kit"), &wh_a(), 2, &clerk())
            .unwrap_err();
        match err {
            DomainError::InsufficientStock(shortage) => {
                assert_eq!(shortage.item_id, ItemId::from("x"));
                assert_eq!((shortage.requested, shortage.available), (6, 5));
            }
            other => panic!("expected a shortage, got {other:?}"),
        }

        assert_eq!(level(&engine, "x", wh_a()).available, 5);
        assert_eq!(level(&engine, "y", wh_a()).available, 10);
        assert_eq!(level(&engine, "kit", wh_a()).on_hand, 0);
        assert_eq!(engine.list_movements(&MovementQuery::all()).unwrap().len(), before);
    }

    #[test]
    fn assembly_prices_kits_from_component_costs() {
        let engine = kit_engine();
        receive(&engine, "x", wh_a(), 10);
        receive(&engine, "y", wh_a(), 10);

        let assembled = engine
            .assemble_kit(&ItemId::from("kit"), &wh_a(), 2, &clerk())
            .unwrap();
        assert_eq!(assembled.cost.unit_cost, 35);
        assert_eq!(assembled.movements.len(), 3);
        assert_eq!(level(&engine, "x", wh_a()).on_hand, 4);
        assert_eq!(level(&engine, "y", wh_a()).on_hand, 8);
        assert_eq!(level(&engine, "kit", wh_a()).on_hand, 2);

        let preview = engine
            .price_issue(&ItemId::from("kit"), &wh_a(), 1)
            .unwrap();
        assert_eq!(preview.total_cost, 35);
        assert_replays(&engine);
    }

    #[test]
    fn disassembly_returns_components_at_their_cost_share() {
        let engine = kit_engine();
        receive(&engine, "x", wh_a(), 10);
        receive(&engine, "y", wh_a(), 10);
        engine
            .assemble_kit(&ItemId::from("kit"), &wh_a(), 2, &clerk())
            .unwrap();

        let taken_apart = engine
            .disassemble_kit(&ItemId::from("kit"), &wh_a(), 1, &clerk())
            .unwrap();
        assert_eq!(taken_apart.kit_value, 35);
        let shares: Vec<(ItemId, i64, i64)> = taken_apart
            .components
            .iter()
            .map(|c| (c.item_id.clone(), c.quantity, c.value))
            .collect();
        assert_eq!(shares, vec![(ItemId::from("x"), 3, 30), (ItemId::from("y"), 1, 5)]);
        assert_eq!(level(&engine, "x", wh_a()).on_hand, 7);
        assert_eq!(level(&engine, "y", wh_a()).on_hand, 9);
        assert_eq!(level(&engine, "kit", wh_a()).on_hand, 1);
        assert_replays(&engine);
    }

    #[test]
    fn kits_reject_tracked_components() {
        let (engine, _) = setup();
        engine.create_item(new_item("phone", 300).serialized()).unwrap();
        let err = engine
            .create_kit(
                new_item("bundle", 0),
                vec![KitComponent::new(ItemId::from("phone"), 1)],
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(engine.get_item(&ItemId::from("bundle")).is_err());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Serials, batches and alerts
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn returned_serial_must_be_restocked_before_it_sells_again() {
        let (engine, _) = setup();
        engine.create_item(new_item("phone", 300).serialized()).unwrap();
        engine
            .receive_stock(
                ReceiveStock::new(ItemId::from("phone"), wh_a(), 2, po("po-7"))
                    .with_serials(vec!["SN-1".into(), "SN-2".into()]),
                &clerk(),
            )
            .unwrap();
        engine
            .issue_stock(
                IssueStock::new(ItemId::from("phone"), wh_a(), 1, so("so-7"))
                    .with_serials(vec!["SN-1".into()]),
                &clerk(),
            )
            .unwrap();
        let status = |serial: &str| {
            engine
                .store()
                .get_serial(&ItemId::from("phone"), serial)
                .unwrap()
                .unwrap()
                .value
                .status
        };
        assert_eq!(status("SN-1"), SerialStatus::Sold);

        engine
            .return_stock(
                ReturnStock::new(
                    ItemId::from("phone"),
                    wh_a(),
                    1,
                    Reference::new(ReferenceKind::CustomerReturn, "rma-1"),
                )
                .with_serials(vec!["SN-1".into()]),
                &clerk(),
            )
            .unwrap();
        assert_eq!(status("SN-1"), SerialStatus::Returned);

        let err = engine
            .issue_stock(
                IssueStock::new(ItemId::from("phone"), wh_a(), 1, so("so-8"))
                    .with_serials(vec!["SN-1".into()]),
                &clerk(),
            )
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

        engine
            .restock_serial(&ItemId::from("phone"), "SN-1", &clerk())
            .unwrap();
        engine
            .issue_stock(
                IssueStock::new(ItemId::from("phone"), wh_a(), 1, so("so-8"))
                    .with_serials(vec!["SN-1".into()]),
                &clerk(),
            )
            .unwrap();
        assert_eq!(status("SN-1"), SerialStatus::Sold);
        assert_replays(&engine);
    }

    #[test]
    fn damaged_stock_can_be_written_off() {
        let (engine, _) = setup();
        engine.create_item(new_item("glass", 12)).unwrap();
        receive(&engine, "glass", wh_a(), 5);
        engine
            .damage_stock(&ItemId::from("glass"), &wh_a(), 5, "dropped pallet", Vec::new(), &clerk())
            .unwrap();
        let damaged = level(&engine, "glass", wh_a());
        assert_eq!((damaged.on_hand, damaged.available, damaged.damaged), (5, 0, 5));

        let err = engine
            .write_off_damaged(&ItemId::from("glass"), &wh_a(), 6, "scrapped", Vec::new(), &clerk())
            .unwrap_err();
        match err {
            DomainError::InsufficientStock(shortage) => {
                assert_eq!(shortage.scope, ShortageScope::Damaged);
                assert_eq!((shortage.requested, shortage.available), (6, 5));
            }
            other => panic!("expected a shortage, got {other:?}"),
        }

        let posting = engine
            .write_off_damaged(&ItemId::from("glass"), &wh_a(), 5, "scrapped", Vec::new(), &clerk())
            .unwrap();
        assert_eq!(posting.movement.drawn_cost, Some(60));
        let glass = level(&engine, "glass", wh_a());
        assert_eq!((glass.on_hand, glass.available, glass.damaged), (0, 0, 0));

        let valuation = engine
            .get_inventory_valuation(Some(&wh_a()), &JobControl::new())
            .unwrap();
        assert_eq!(valuation.total_value, 0);
        assert_replays(&engine);
    }

    #[test]
    fn serialized_write_offs_keep_units_and_buckets_in_step() {
        let (engine, _) = setup();
        engine.create_item(new_item("phone", 300).serialized()).unwrap();
        engine
            .receive_stock(
                ReceiveStock::new(ItemId::from("phone"), wh_a(), 3, po("po-4"))
                    .with_serials(vec!["SN-1".into(), "SN-2".into(), "SN-3".into()]),
                &clerk(),
            )
            .unwrap();
        let status = |serial: &str| {
            engine
                .store()
                .get_serial(&ItemId::from("phone"), serial)
                .unwrap()
                .unwrap()
                .value
                .status
        };

        engine
            .damage_stock(&ItemId::from("phone"), &wh_a(), 1, "cracked", vec!["SN-2".into()], &clerk())
            .unwrap();
        assert_eq!(status("SN-2"), SerialStatus::Damaged);
        engine
            .write_off_damaged(&ItemId::from("phone"), &wh_a(), 1, "beyond repair", Vec::new(), &clerk())
            .unwrap();
        assert_eq!(status("SN-2"), SerialStatus::WrittenOff);

        // A plain negative adjustment removes an on-hand unit without
        // touching the damaged bucket.
        engine
            .adjust_stock(
                AdjustRequest::new(
                    ItemId::from("phone"),
                    wh_a(),
                    MovementKind::Adjustment,
                    -1,
                    Reference::manual("audit"),
                )
                .with_serials(vec!["SN-3".into()])
                .with_reason("lost in store"),
                &clerk(),
            )
            .unwrap();
        assert_eq!(status("SN-3"), SerialStatus::WrittenOff);
        assert_eq!(status("SN-1"), SerialStatus::Available);

        let phone = level(&engine, "phone", wh_a());
        assert_eq!((phone.on_hand, phone.available, phone.damaged), (1, 1, 0));
        assert_replays(&engine);
    }

    #[test]
    fn expiring_lots_and_low_stock_raise_alerts() {
        let (engine, _) = setup();
        engine
            .create_item(new_item("milk", 3).batched().with_thresholds(0, 0, 20, 50))
            .unwrap();
        let soon = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        engine
            .receive_stock(
                ReceiveStock::new(ItemId::from("milk"), wh_a(), 12, po("po-3"))
                    .with_lots(vec![BatchReceipt::new("L-1", 12).with_dates(None, Some(soon))]),
                &clerk(),
            )
            .unwrap();

        let alerts = engine.check_stock_alerts(Some(&wh_a())).unwrap();
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::LowStock, AlertKind::BatchExpiring]);
        assert_eq!(alerts[0].threshold, Some(20));
        assert_eq!(alerts[1].lot_number.as_deref(), Some("L-1"));
        assert!(engine.check_stock_alerts(Some(&wh_b())).unwrap().is_empty());
    }

    #[test]
    fn expired_lots_are_swept_and_refuse_issue() {
        let (engine, clock) = setup();
        engine.create_item(new_item("milk", 3).batched()).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2025, 3, 5).unwrap();
        engine
            .receive_stock(
                ReceiveStock::new(ItemId::from("milk"), wh_a(), 12, po("po-3"))
                    .with_lots(vec![BatchReceipt::new("L-1", 12).with_dates(None, Some(expiry))]),
                &clerk(),
            )
            .unwrap();

        clock.advance(Duration::days(10));
        let swept = engine.sweep_expired_batches(&clerk()).unwrap();
        assert_eq!(swept.len(), 1);

        let err = engine
            .issue_stock(IssueStock::new(ItemId::from("milk"), wh_a(), 1, so("so-1")), &clerk())
            .unwrap_err();
        match err {
            DomainError::InsufficientStock(shortage) => assert_eq!(shortage.scope, ShortageScope::Batch),
            other => panic!("expected a batch shortage, got {other:?}"),
        }
        let alerts = engine.check_stock_alerts(None).unwrap();
        assert!(alerts.iter().any(|a| a.kind == AlertKind::BatchExpired));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Analytics
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn abc_classes_follow_cumulative_value_share() {
        let (engine, _) = setup();
        for (id, issued) in [("a", 100), ("b", 30), ("c", 20), ("d", 10), ("e", 5)] {
            engine.create_item(new_item(id, 10)).unwrap();
            receive(&engine, id, wh_a(), 100);
            engine
                .issue_stock(IssueStock::new(ItemId::from(id), wh_a(), issued, so("so-1")), &clerk())
                .unwrap();
        }

        let analysis = engine.perform_abc_analysis(&JobControl::new()).unwrap();
        assert_eq!(analysis.total_value, 1650);
        let classes: Vec<AbcClass> = analysis.entries.iter().map(|e| e.class).collect();
        assert_eq!(
            classes,
            vec![AbcClass::A, AbcClass::A, AbcClass::B, AbcClass::B, AbcClass::C]
        );
        assert!((analysis.entries[0].cumulative_pct - 60.606).abs() < 0.01);
        assert_eq!(analysis.entries[0].count_frequency, CountFrequency::Monthly);
    }

    #[test]
    fn abc_values_consumption_at_the_drawn_cost() {
        let (engine, _) = setup();
        engine.create_item(new_item("cheap", 10)).unwrap();
        engine.create_item(new_item("dear", 10)).unwrap();
        receive(&engine, "cheap", wh_a(), 10);
        engine
            .receive_stock(
                ReceiveStock::new(ItemId::from("dear"), wh_a(), 10, po("po-5")).with_unit_cost(50),
                &clerk(),
            )
            .unwrap();
        for (id, issued) in [("cheap", 4), ("dear", 2)] {
            engine
                .issue_stock(IssueStock::new(ItemId::from(id), wh_a(), issued, so("so-5")), &clerk())
                .unwrap();
        }

        let analysis = engine.perform_abc_analysis(&JobControl::new()).unwrap();
        assert_eq!(analysis.total_value, 140);
        assert_eq!(analysis.entries[0].item_id, ItemId::from("dear"));
        assert_eq!(analysis.entries[0].consumption_value, 100);
        assert_eq!(analysis.entries[1].consumption_value, 40);
    }

    #[test]
    fn forecast_and_reorder_use_daily_consumption() {
        let (engine, clock) = setup();
        engine
            .create_item(new_item("tape", 4).with_thresholds(0, 0, 30, 40).with_lead_time(7))
            .unwrap();
        receive(&engine, "tape", wh_a(), 50);
        for _ in 0..10 {
            engine
                .issue_stock(IssueStock::new(ItemId::from("tape"), wh_a(), 2, so("so-1")), &clerk())
                .unwrap();
            clock.advance(Duration::days(1));
        }

        let forecast = engine
            .generate_demand_forecast(&ItemId::from("tape"), &wh_a(), 14, None, &JobControl::new())
            .unwrap();
        assert_eq!(forecast.model, "moving_average");
        assert!(forecast.forecasted_demand > 0.0);

        let suggestions = engine
            .generate_reorder_suggestions(Some(&wh_a()), &JobControl::new())
            .unwrap();
        assert_eq!(suggestions.len(), 1);
        let tape = &suggestions[0];
        assert_eq!(tape.on_hand, 30);
        assert!(tape.suggested_quantity >= 40);
        assert!(tape.forecast_error.is_none());
        assert_ne!(tape.priority, ReorderPriority::Low);
    }

    #[test]
    fn forecast_without_movements_is_insufficient_history() {
        let (engine, _) = setup();
        engine.create_item(new_item("idle", 4)).unwrap();
        let err = engine
            .generate_demand_forecast(&ItemId::from("idle"), &wh_a(), 7, None, &JobControl::new())
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientHistory(_)));
    }

    #[test]
    fn cancelled_analysis_returns_interrupted() {
        let (engine, _) = setup();
        engine.create_item(new_item("a", 10)).unwrap();
        let control = JobControl::new();
        control.cancel();
        let err = engine.perform_abc_analysis(&control).unwrap_err();
        assert!(matches!(err, DomainError::Interrupted(_)));
    }

    // ─────────────────────────────────────────────────────────────────────
    // Ledger guarantees
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn rejected_issue_leaves_state_unchanged() {
        let (engine, _) = setup();
        engine.create_item(new_item("bolt", 20)).unwrap();
        receive(&engine, "bolt", wh_a(), 5);
        let before = level(&engine, "bolt", wh_a());

        let err = engine
            .issue_stock(IssueStock::new(ItemId::from("bolt"), wh_a(), 6, so("so-1")), &clerk())
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
        assert!(!err.is_retry_safe());
        assert_eq!(level(&engine, "bolt", wh_a()), before);
    }

    #[test]
    fn mixed_workflow_replays_to_stored_stock() {
        let (engine, _) = setup();
        engine.create_item(new_item("bolt", 20)).unwrap();
        receive(&engine, "bolt", wh_a(), 40);
        engine
            .issue_stock(IssueStock::new(ItemId::from("bolt"), wh_a(), 7, so("so-1")), &clerk())
            .unwrap();
        engine
            .damage_stock(&ItemId::from("bolt"), &wh_a(), 3, "forklift", Vec::new(), &clerk())
            .unwrap();
        engine
            .adjust_stock(
                AdjustRequest::new(
                    ItemId::from("bolt"),
                    wh_a(),
                    MovementKind::Adjustment,
                    -3,
                    Reference::manual("write-off"),
                )
                .with_reason("shrinkage"),
                &clerk(),
            )
            .unwrap();
        engine
            .record_on_order(&ItemId::from("bolt"), &wh_a(), 25, po("po-9"), &clerk())
            .unwrap();
        receive(&engine, "bolt", wh_a(), 10);

        let bolt = level(&engine, "bolt", wh_a());
        assert_eq!(bolt.on_order, 15);
        assert_eq!(bolt.on_hand, bolt.available + bolt.reserved + bolt.damaged);
        assert_replays(&engine);

        let rebuilt = engine.rebuild_stock(&ItemId::from("bolt"), &wh_a()).unwrap();
        assert_eq!(rebuilt.on_hand, bolt.on_hand);
    }

    #[test]
    fn stale_ledger_write_is_a_retry_safe_conflict() {
        stockledger_observability::init();
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(test_now()));
        let first = InventoryEngine::new(Arc::clone(&store), clock.clone(), EngineConfig::default());
        let second = InventoryEngine::new(Arc::clone(&store), clock, EngineConfig::default());

        first.create_item(new_item("bolt", 20)).unwrap();
        receive(&first, "bolt", wh_a(), 10);

        let key = StockKey::new(ItemId::from("bolt"), wh_a());
        let mut tx = first.ledger().begin([key], &clerk()).unwrap();
        tx.adjust(AdjustRequest::new(
            ItemId::from("bolt"),
            wh_a(),
            MovementKind::Issue,
            -8,
            so("so-1"),
        ))
        .unwrap();

        second
            .issue_stock(IssueStock::new(ItemId::from("bolt"), wh_a(), 5, so("so-2")), &clerk())
            .unwrap();

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, DomainError::ConcurrencyConflict(_)));
        assert!(err.is_retry_safe());

        let bolt = level(&second, "bolt", wh_a());
        assert_eq!((bolt.on_hand, bolt.available), (5, 5));
        assert_replays(&second);
    }

    /// Delegates to an in-memory store but can be told to fail the next commit.
    struct FlakyStore {
        inner: InMemoryStore,
        fail_next_commit: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryStore::new(),
                fail_next_commit: AtomicBool::new(false),
            }
        }
    }

    impl InventoryStore for FlakyStore {
        fn get_item(&self, item_id: &ItemId) -> Result<Option<Versioned<Item>>, StoreError> {
            self.inner.get_item(item_id)
        }

        fn list_items(&self) -> Result<Vec<Item>, StoreError> {
            self.inner.list_items()
        }

        fn get_stock(&self, key: &StockKey) -> Result<Option<Versioned<LocationStock>>, StoreError> {
            self.inner.get_stock(key)
        }

        fn list_stock(&self, location_id: Option<&LocationId>) -> Result<Vec<LocationStock>, StoreError> {
            self.inner.list_stock(location_id)
        }

        fn get_serial(
            &self,
            item_id: &ItemId,
            serial: &str,
        ) -> Result<Option<Versioned<SerialNumber>>, StoreError> {
            self.inner.get_serial(item_id, serial)
        }

        fn list_serials(&self, key: &StockKey) -> Result<Vec<Versioned<SerialNumber>>, StoreError> {
            self.inner.list_serials(key)
        }

        fn list_batches(&self, key: &StockKey) -> Result<Vec<Versioned<Batch>>, StoreError> {
            self.inner.list_batches(key)
        }

        fn all_batches(&self) -> Result<Vec<Batch>, StoreError> {
            self.inner.all_batches()
        }

        fn get_cost_layers(&self, key: &StockKey) -> Result<Option<Versioned<CostLayers>>, StoreError> {
            self.inner.get_cost_layers(key)
        }

        fn list_cost_layers(&self) -> Result<Vec<CostLayers>, StoreError> {
            self.inner.list_cost_layers()
        }

        fn get_transfer(
            &self,
            order_id: &TransferOrderId,
        ) -> Result<Option<Versioned<TransferOrder>>, StoreError> {
            self.inner.get_transfer(order_id)
        }

        fn get_count(&self, count_id: &CycleCountId) -> Result<Option<Versioned<CycleCount>>, StoreError> {
            self.inner.get_count(count_id)
        }

        fn get_kit_cost(&self, kit_id: &ItemId) -> Result<Option<Versioned<KitCostBreakdown>>, StoreError> {
            self.inner.get_kit_cost(kit_id)
        }

        fn movements(&self, query: &MovementQuery) -> Result<Vec<StockMovement>, StoreError> {
            self.inner.movements(query)
        }

        fn movement_stream(&self, key: &StockKey) -> Result<Vec<EventEnvelope<StockMovement>>, StoreError> {
            self.inner.movement_stream(key)
        }

        fn has_movements(&self, item_id: &ItemId) -> Result<bool, StoreError> {
            self.inner.has_movements(item_id)
        }

        fn load_stream(&self, stream_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
            self.inner.load_stream(stream_id)
        }

        fn commit(&self, changes: ChangeSet) -> Result<Vec<StoredEvent>, StoreError> {
            if self.fail_next_commit.swap(false, Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.commit(changes)
        }
    }

    #[test]
    fn failed_commit_writes_nothing() {
        stockledger_observability::init();
        let store = Arc::new(FlakyStore::new());
        let engine = InventoryEngine::new(
            Arc::clone(&store),
            Arc::new(FixedClock::new(test_now())),
            EngineConfig::default(),
        );
        engine.create_item(new_item("x", 10)).unwrap();
        engine.create_item(new_item("y", 5)).unwrap();
        engine
            .create_kit(
                new_item("kit", 0),
                vec![
                    KitComponent::new(ItemId::from("x"), 3),
                    KitComponent::new(ItemId::from("y"), 1),
                ],
            )
            .unwrap();
        receive(&engine, "x", wh_a(), 10);
        receive(&engine, "y", wh_a(), 10);
        let before = engine.list_movements(&MovementQuery::all()).unwrap().len();

        store.fail_next_commit.store(true, Ordering::SeqCst);
        let err = engine
            .assemble_kit(&ItemId::from("kit"), &wh_a(), 2, &clerk())
            .unwrap_err();
        assert!(matches!(err, DomainError::Infrastructure(_)));
        assert!(!err.is_retry_safe());

        assert_eq!(engine.list_movements(&MovementQuery::all()).unwrap().len(), before);
        assert_eq!(level(&engine, "x", wh_a()).on_hand, 10);
        assert_eq!(level(&engine, "y", wh_a()).on_hand, 10);
        assert_eq!(level(&engine, "kit", wh_a()).on_hand, 0);
        assert!(store.get_kit_cost(&ItemId::from("kit")).unwrap().is_none());

        engine
            .assemble_kit(&ItemId::from("kit"), &wh_a(), 2, &clerk())
            .unwrap();
        assert_eq!(level(&engine, "kit", wh_a()).on_hand, 2);
        assert_replays(&engine);
    }
}
