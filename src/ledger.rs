//! Payment ledger: monetary computation and record lifecycle.
//!
//! The total calculator is a pure function and is the single place the
//! final price is ever computed; it runs at the moment of the
//! authoritative write and the result is persisted as `price`. The state
//! machine guards every status change; ticket numbers are derived from
//! the full record set on every read and never stored.

use chrono::DateTime;
use tracing::info;

use crate::error::SyncError;
use crate::model::{
    is_local_id, Discount, DiscountKind, LineItem, PaymentMethod, PaymentRecord, PaymentStatus,
    SalesChannel,
};

// ---------------------------------------------------------------------------
// Total calculation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Totals {
    pub subtotal: f64,
    /// Subtotal plus delivery fee when the sale is a delivery.
    pub deliverable: f64,
    pub discount_amount: f64,
    /// `max(0, deliverable - discount_amount)`.
    pub final_total: f64,
}

/// Compute sale totals.
///
/// The discount applies only when the payment method allows it (cash) and
/// the amount is positive; a percentage discount is taken off the
/// deliverable amount, fee included.
pub fn compute_totals(
    line_items: &[LineItem],
    channel: SalesChannel,
    delivery_fee: Option<f64>,
    discount: Option<Discount>,
    method: Option<PaymentMethod>,
) -> Totals {
    let subtotal: f64 = line_items
        .iter()
        .map(|it| it.unit_price * f64::from(it.quantity))
        .sum();

    let fee = if channel == SalesChannel::Delivery {
        delivery_fee.unwrap_or(0.0)
    } else {
        0.0
    };
    let deliverable = subtotal + fee;

    let discount_allowed = method.map(PaymentMethod::allows_discount).unwrap_or(false);
    let discount_amount = match discount {
        Some(d) if discount_allowed && d.amount > 0.0 => match d.kind {
            DiscountKind::Fixed => d.amount,
            DiscountKind::Percentage => deliverable * d.amount / 100.0,
        },
        _ => 0.0,
    };

    Totals {
        subtotal,
        deliverable,
        discount_amount,
        final_total: (deliverable - discount_amount).max(0.0),
    }
}

/// Change owed on a cash sale. Negative differences display as zero.
pub fn display_change(amount_tendered: f64, final_total: f64) -> f64 {
    (amount_tendered - final_total).max(0.0)
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Legal transitions: unpaid→paid, unpaid→voided, paid→voided.
/// Voided is terminal.
pub fn check_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), SyncError> {
    use PaymentStatus::*;
    match (from, to) {
        (Unpaid, Paid) | (Unpaid, Voided) | (Paid, Voided) => Ok(()),
        (f, t) => Err(SyncError::InvalidTransition {
            from: f.as_str(),
            to: t.as_str(),
        }),
    }
}

/// Settle a record: transition to paid, recomputing the authoritative
/// total for the chosen method (discount eligibility depends on it).
///
/// Cash requires `amount_tendered >= final_total`; non-cash methods
/// settle exactly and bypass tender tracking.
pub fn mark_paid(
    record: &PaymentRecord,
    method: PaymentMethod,
    amount_tendered: Option<f64>,
) -> Result<PaymentRecord, SyncError> {
    check_transition(record.payment_status, PaymentStatus::Paid)?;

    let totals = compute_totals(
        &record.line_items,
        record.sales_channel,
        record.delivery_fee,
        record.discount,
        Some(method),
    );

    let mut paid = record.clone();
    paid.payment_status = PaymentStatus::Paid;
    paid.payment_method = Some(method);
    paid.price = totals.final_total;
    // Drop a discount the chosen method does not honor, so the persisted
    // record and its persisted price cannot disagree.
    if !method.allows_discount() {
        paid.discount = None;
    }

    if method.bypasses_tender_tracking() {
        paid.amount_tendered = None;
        paid.change_given = None;
    } else {
        let tendered = amount_tendered.ok_or(SyncError::InsufficientTender {
            tendered: 0.0,
            total: totals.final_total,
        })?;
        if tendered < totals.final_total {
            return Err(SyncError::InsufficientTender {
                tendered,
                total: totals.final_total,
            });
        }
        paid.amount_tendered = Some(tendered);
        paid.change_given = Some(tendered - totals.final_total);
    }

    info!(
        price = paid.price,
        method = ?method,
        "payment settled"
    );
    Ok(paid)
}

/// Void a record. An admin-side correction against the authoritative
/// copy: requires a remote id and a named actor.
pub fn mark_voided(
    record: &PaymentRecord,
    voided_by: &str,
    voided_at_ms: i64,
) -> Result<PaymentRecord, SyncError> {
    check_transition(record.payment_status, PaymentStatus::Voided)?;

    match record.id.as_deref() {
        None => return Err(SyncError::VoidRejected("record has no id yet")),
        Some(id) if is_local_id(id) => {
            return Err(SyncError::VoidRejected("record has not synced yet"))
        }
        Some(_) => {}
    }
    if voided_by.trim().is_empty() {
        return Err(SyncError::VoidRejected("voiding actor not identified"));
    }

    let mut voided = record.clone();
    voided.payment_status = PaymentStatus::Voided;
    voided.voided_by = Some(voided_by.to_string());
    voided.voided_at = Some(voided_at_ms);

    info!(id = ?voided.id, voided_by, "payment voided");
    Ok(voided)
}

// ---------------------------------------------------------------------------
// Ticket numbering
// ---------------------------------------------------------------------------

/// Dense 1-based rank of a record among all known records, sorted by
/// `created_at` ascending. Derived on every read, never stored, so it
/// tolerates concurrent inserts by construction. Records are
/// deduplicated by id; the target is counted even when not yet in the
/// set. Fallback matching for id-less records mirrors the receipt
/// renderer this replaces: `created_at`+`price`, then earlier-record
/// count.
pub fn ticket_number(records: &[PaymentRecord], target: &PaymentRecord) -> usize {
    let mut seen = std::collections::HashSet::new();
    let mut all: Vec<&PaymentRecord> = Vec::with_capacity(records.len() + 1);
    for rec in records {
        match rec.id.as_deref() {
            Some(id) => {
                if seen.insert(id.to_string()) {
                    all.push(rec);
                }
            }
            None => all.push(rec),
        }
    }
    let target_present = match target.id.as_deref() {
        Some(id) => seen.contains(id),
        None => false,
    };
    if !target_present {
        all.push(target);
    }

    // Stable sort: equal timestamps keep insertion order.
    all.sort_by_key(|r| r.created_at);

    if let Some(id) = target.id.as_deref() {
        if let Some(idx) = all.iter().position(|r| r.id.as_deref() == Some(id)) {
            return idx + 1;
        }
    }
    if let Some(idx) = all
        .iter()
        .position(|r| r.created_at == target.created_at && r.price == target.price)
    {
        return idx + 1;
    }
    all.iter()
        .filter(|r| r.created_at <= target.created_at)
        .count()
        .max(1)
}

/// Receipt transact label for a ticket number.
pub fn ticket_label(n: usize) -> String {
    format!("BBFH{n:03}")
}

// ---------------------------------------------------------------------------
// Daily aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize)]
pub struct DailyStats {
    pub total_records: usize,
    pub paid: usize,
    pub unpaid: usize,
    pub total_sales: f64,
}

/// Counters for one calendar date (`YYYY-MM-DD`, evaluated in UTC).
/// Voided records count toward neither bucket nor the sales total.
pub fn daily_stats(records: &[PaymentRecord], date: &str) -> DailyStats {
    let mut stats = DailyStats::default();
    for rec in records {
        let rec_date = match DateTime::from_timestamp_millis(rec.created_at) {
            Some(dt) => dt.format("%Y-%m-%d").to_string(),
            None => continue,
        };
        if rec_date != date {
            continue;
        }
        stats.total_records += 1;
        match rec.payment_status {
            PaymentStatus::Paid => {
                stats.paid += 1;
                stats.total_sales += rec.price;
            }
            PaymentStatus::Unpaid => stats.unpaid += 1,
            PaymentStatus::Voided => {}
        }
    }
    stats
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryInfo;

    fn item(id: &str, unit_price: f64, quantity: u32) -> LineItem {
        LineItem {
            item_id: id.into(),
            name: format!("Item {id}"),
            unit_price,
            quantity,
        }
    }

    fn record_at(id: Option<&str>, created_at: i64, price: f64) -> PaymentRecord {
        let mut rec = PaymentRecord::new("Ana", vec![]);
        rec.id = id.map(String::from);
        rec.created_at = created_at;
        rec.price = price;
        rec
    }

    #[test]
    fn test_totals_scenario_b() {
        // Cash sale, subtotal 200, delivery fee 50, 10% discount
        let totals = compute_totals(
            &[item("p1", 100.0, 2)],
            SalesChannel::Delivery,
            Some(50.0),
            Some(Discount {
                amount: 10.0,
                kind: DiscountKind::Percentage,
            }),
            Some(PaymentMethod::Cash),
        );
        assert_eq!(totals.subtotal, 200.0);
        assert_eq!(totals.deliverable, 250.0);
        assert_eq!(totals.discount_amount, 25.0);
        assert_eq!(totals.final_total, 225.0);
    }

    #[test]
    fn test_totals_independent_of_item_order() {
        let mut items = vec![item("a", 50.0, 2), item("b", 30.0, 1), item("c", 12.25, 3)];
        let forward = compute_totals(&items, SalesChannel::InStore, None, None, None);
        items.reverse();
        let reverse = compute_totals(&items, SalesChannel::InStore, None, None, None);
        assert_eq!(forward, reverse);
        assert_eq!(forward.final_total, 166.75);
    }

    #[test]
    fn test_discount_requires_cash() {
        let discount = Some(Discount {
            amount: 50.0,
            kind: DiscountKind::Fixed,
        });
        let items = [item("p1", 100.0, 1)];

        let gcash = compute_totals(&items, SalesChannel::InStore, None, discount, Some(PaymentMethod::GCash));
        assert_eq!(gcash.discount_amount, 0.0);
        assert_eq!(gcash.final_total, 100.0);

        let cash = compute_totals(&items, SalesChannel::InStore, None, discount, Some(PaymentMethod::Cash));
        assert_eq!(cash.discount_amount, 50.0);
        assert_eq!(cash.final_total, 50.0);

        // No method known (unpaid sale entry): no discount applied
        let unpaid = compute_totals(&items, SalesChannel::InStore, None, discount, None);
        assert_eq!(unpaid.final_total, 100.0);
    }

    #[test]
    fn test_total_floors_at_zero() {
        let totals = compute_totals(
            &[item("p1", 20.0, 1)],
            SalesChannel::InStore,
            None,
            Some(Discount {
                amount: 100.0,
                kind: DiscountKind::Fixed,
            }),
            Some(PaymentMethod::Cash),
        );
        assert_eq!(totals.final_total, 0.0);
    }

    #[test]
    fn test_delivery_fee_only_for_delivery_channel() {
        let items = [item("p1", 100.0, 1)];
        let in_store = compute_totals(&items, SalesChannel::InStore, Some(50.0), None, None);
        assert_eq!(in_store.final_total, 100.0);

        let delivery = compute_totals(&items, SalesChannel::Delivery, Some(50.0), None, None);
        assert_eq!(delivery.final_total, 150.0);
    }

    #[test]
    fn test_display_change_clamps_at_zero() {
        assert_eq!(display_change(200.0, 130.0), 70.0);
        assert_eq!(display_change(100.0, 130.0), 0.0);
    }

    #[test]
    fn test_mark_paid_cash_requires_sufficient_tender() {
        let mut rec = PaymentRecord::new("Ana", vec![item("p1", 50.0, 2)]);
        rec.price = 100.0;

        let err = mark_paid(&rec, PaymentMethod::Cash, Some(80.0)).unwrap_err();
        assert!(matches!(err, SyncError::InsufficientTender { .. }));

        let err = mark_paid(&rec, PaymentMethod::Cash, None).unwrap_err();
        assert!(matches!(err, SyncError::InsufficientTender { .. }));

        let paid = mark_paid(&rec, PaymentMethod::Cash, Some(150.0)).unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.price, 100.0);
        assert_eq!(paid.amount_tendered, Some(150.0));
        assert_eq!(paid.change_given, Some(50.0));
    }

    #[test]
    fn test_mark_paid_noncash_bypasses_tender() {
        let rec = PaymentRecord::new("Ana", vec![item("p1", 50.0, 2)]);
        let paid = mark_paid(&rec, PaymentMethod::GCash, None).unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::Paid);
        assert_eq!(paid.amount_tendered, None);
        assert_eq!(paid.change_given, None);
    }

    #[test]
    fn test_mark_paid_drops_discount_for_noncash() {
        let mut rec = PaymentRecord::new("Ana", vec![item("p1", 100.0, 1)]);
        rec.discount = Some(Discount {
            amount: 20.0,
            kind: DiscountKind::Fixed,
        });

        let paid = mark_paid(&rec, PaymentMethod::Card, None).unwrap();
        assert_eq!(paid.price, 100.0);
        assert!(paid.discount.is_none());
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use PaymentStatus::*;
        assert!(check_transition(Paid, Unpaid).is_err());
        assert!(check_transition(Voided, Paid).is_err());
        assert!(check_transition(Voided, Unpaid).is_err());
        assert!(check_transition(Unpaid, Unpaid).is_err());

        // Double payment
        let mut rec = PaymentRecord::new("Ana", vec![item("p1", 10.0, 1)]);
        rec.payment_status = Paid;
        let err = mark_paid(&rec, PaymentMethod::Cash, Some(10.0)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
    }

    #[test]
    fn test_void_requires_remote_id_and_actor() {
        let mut rec = record_at(Some("offline-1700000000000-abcd1234"), 1000, 50.0);
        rec.payment_status = PaymentStatus::Paid;
        let err = mark_voided(&rec, "admin", 2000).unwrap_err();
        assert!(matches!(err, SyncError::VoidRejected(_)));

        rec.id = None;
        let err = mark_voided(&rec, "admin", 2000).unwrap_err();
        assert!(matches!(err, SyncError::VoidRejected(_)));

        rec.id = Some("rem-000001".into());
        let err = mark_voided(&rec, "  ", 2000).unwrap_err();
        assert!(matches!(err, SyncError::VoidRejected(_)));

        let voided = mark_voided(&rec, "admin", 2000).unwrap();
        assert_eq!(voided.payment_status, PaymentStatus::Voided);
        assert_eq!(voided.voided_by.as_deref(), Some("admin"));
        assert_eq!(voided.voided_at, Some(2000));

        // Terminal
        let err = mark_voided(&voided, "admin", 3000).unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { .. }));
    }

    #[test]
    fn test_ticket_number_rank_by_created_at() {
        let records = vec![
            record_at(Some("a"), 100, 10.0),
            record_at(Some("b"), 200, 20.0),
            record_at(Some("c"), 300, 30.0),
        ];
        assert_eq!(ticket_number(&records, &records[0]), 1);
        assert_eq!(ticket_number(&records, &records[2]), 3);
        assert_eq!(ticket_label(3), "BBFH003");
    }

    #[test]
    fn test_ticket_number_stable_under_earlier_insert() {
        let mut records = vec![
            record_at(Some("a"), 200, 10.0),
            record_at(Some("b"), 300, 20.0),
        ];
        let before: Vec<usize> = records
            .iter()
            .map(|r| ticket_number(&records, r))
            .collect();
        assert_eq!(before, [1, 2]);

        // Insert a backdated sale: everything after it shifts by one,
        // relative order unchanged.
        records.push(record_at(Some("early"), 100, 5.0));
        assert_eq!(ticket_number(&records, &records[2]), 1);
        assert_eq!(ticket_number(&records, &records[0]), 2);
        assert_eq!(ticket_number(&records, &records[1]), 3);
    }

    #[test]
    fn test_ticket_number_counts_unlisted_target() {
        let records = vec![record_at(Some("a"), 100, 10.0)];
        let new_sale = record_at(Some("b"), 200, 20.0);
        assert_eq!(ticket_number(&records, &new_sale), 2);

        // Deduplicated by id: the same record appearing in local and
        // remote copies counts once.
        let dup = vec![
            record_at(Some("a"), 100, 10.0),
            record_at(Some("a"), 100, 10.0),
            record_at(Some("b"), 200, 20.0),
        ];
        assert_eq!(ticket_number(&dup, &dup[2]), 2);
    }

    #[test]
    fn test_ticket_number_fallbacks_for_idless_records() {
        let records = vec![
            record_at(Some("a"), 100, 10.0),
            record_at(None, 200, 20.0),
        ];
        // createdAt+price match
        let probe = record_at(None, 200, 20.0);
        assert_eq!(ticket_number(&records, &probe), 2);

        // No exact match: earlier-record count
        let probe = record_at(None, 250, 99.0);
        assert_eq!(ticket_number(&records, &probe), 3);
    }

    #[test]
    fn test_daily_stats_exclude_voided() {
        let day_ms = 1_720_000_000_000_i64; // 2024-07-03 UTC
        let mut paid = record_at(Some("a"), day_ms, 100.0);
        paid.payment_status = PaymentStatus::Paid;
        let unpaid = record_at(Some("b"), day_ms + 60_000, 50.0);
        let mut voided = record_at(Some("c"), day_ms + 120_000, 75.0);
        voided.payment_status = PaymentStatus::Voided;
        let other_day = record_at(Some("d"), day_ms + 86_400_000, 10.0);

        let stats = daily_stats(&[paid, unpaid, voided, other_day], "2024-07-03");
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.paid, 1);
        assert_eq!(stats.unpaid, 1);
        assert_eq!(stats.total_sales, 100.0);
    }

    #[test]
    fn test_mark_paid_recomputes_price_with_delivery() {
        let mut rec = PaymentRecord::new("Ana", vec![item("p1", 100.0, 2)]);
        rec.sales_channel = SalesChannel::Delivery;
        rec.delivery = Some(DeliveryInfo::default());
        rec.delivery_fee = Some(50.0);
        rec.discount = Some(Discount {
            amount: 10.0,
            kind: DiscountKind::Percentage,
        });

        let paid = mark_paid(&rec, PaymentMethod::Cash, Some(225.0)).unwrap();
        assert_eq!(paid.price, 225.0);
        assert_eq!(paid.change_given, Some(0.0));
    }
}
