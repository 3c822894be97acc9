//! Subscription lifecycle classification
//!
//! `classify` derives a single discrete transition from a noisy
//! current/previous snapshot pair. Evaluation order is fixed and first match
//! wins; the order is the tie-break for updates where several conditions
//! hold at once and must not be changed.

use crate::snapshot::{PreviousAttributes, SubscriptionSnapshot, SubscriptionStatus};

/// The five business transitions an update event can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleTransition {
    QuantityChanged,
    Cancelling,
    Uncancelling,
    Renewed,
    OtherUpdate,
}

impl LifecycleTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleTransition::QuantityChanged => "quantity_changed",
            LifecycleTransition::Cancelling => "cancelling",
            LifecycleTransition::Uncancelling => "uncancelling",
            LifecycleTransition::Renewed => "renewed",
            LifecycleTransition::OtherUpdate => "other_update",
        }
    }
}

impl std::fmt::Display for LifecycleTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classify a subscription update. Total and deterministic: every input
/// maps to exactly one transition.
pub fn classify(
    current: &SubscriptionSnapshot,
    previous: &PreviousAttributes,
) -> LifecycleTransition {
    // 1. Quantity change. Only the first line item is compared here; the
    //    quantity handler diffs every item once this transition is chosen.
    if first_item_quantity_changed(current, previous) {
        return LifecycleTransition::QuantityChanged;
    }

    // 2. Scheduled cancellation on an active subscription
    if current.cancel_at_period_end && current.status == SubscriptionStatus::Active {
        return LifecycleTransition::Cancelling;
    }

    // 3. A previously scheduled cancellation was reverted
    if cancellation_reverted(current, previous) {
        return LifecycleTransition::Uncancelling;
    }

    // 4. Billing period boundaries advanced
    if period_advanced(current, previous) {
        return LifecycleTransition::Renewed;
    }

    LifecycleTransition::OtherUpdate
}

fn first_item_quantity_changed(
    current: &SubscriptionSnapshot,
    previous: &PreviousAttributes,
) -> bool {
    let current_qty = current.items.first().and_then(|i| i.quantity);
    let previous_qty = previous
        .items
        .as_ref()
        .and_then(|items| items.first())
        .and_then(|i| i.quantity);

    matches!((current_qty, previous_qty), (Some(c), Some(p)) if c != p)
}

fn cancellation_reverted(
    current: &SubscriptionSnapshot,
    previous: &PreviousAttributes,
) -> bool {
    let cancel_at_cleared = previous.cancel_at.is_some() && current.cancel_at.is_none();
    let flag_cleared =
        previous.cancel_at_period_end == Some(true) && !current.cancel_at_period_end;
    cancel_at_cleared || flag_cleared
}

fn period_advanced(current: &SubscriptionSnapshot, previous: &PreviousAttributes) -> bool {
    match (
        current.earliest_period_start(),
        previous.earliest_period_start(),
    ) {
        (Some(current_start), Some(previous_start)) => current_start > previous_start,
        _ => false,
    }
}

/// Auto-upgrade recommendation for a subscription that outgrew its plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoUpgrade {
    pub subscription_id: String,
    pub seats: u64,
    pub threshold: u64,
}

/// Seat-threshold auto-upgrade policy.
///
/// This is an explicitly invoked policy step, consulted by the router only
/// for `OtherUpdate` transitions. It flags subscriptions whose first-item
/// seat count reached the configured threshold; it never mutates anything.
pub struct AutoUpgradePolicy {
    seat_threshold: Option<u64>,
}

impl AutoUpgradePolicy {
    pub fn new(seat_threshold: Option<u64>) -> Self {
        Self { seat_threshold }
    }

    pub fn evaluate(&self, current: &SubscriptionSnapshot) -> Option<AutoUpgrade> {
        let threshold = self.seat_threshold?;
        if current.status != SubscriptionStatus::Active {
            return None;
        }
        let seats = current.items.first().and_then(|i| i.quantity)?;
        if seats < threshold {
            return None;
        }
        Some(AutoUpgrade {
            subscription_id: current.id.clone(),
            seats,
            threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SubscriptionItem, UsageType};
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn item(id: &str, quantity: Option<u64>, start: OffsetDateTime) -> SubscriptionItem {
        SubscriptionItem {
            id: id.to_string(),
            quantity,
            current_period_start: start,
            current_period_end: start + time::Duration::days(30),
            usage_type: UsageType::Licensed,
        }
    }

    fn snapshot(items: Vec<SubscriptionItem>) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: "sub_1".to_string(),
            customer_id: None,
            status: SubscriptionStatus::Active,
            cancel_at_period_end: false,
            cancel_at: None,
            trial_start: None,
            trial_end: None,
            items,
        }
    }

    fn march() -> OffsetDateTime {
        datetime!(2026-03-01 00:00:00 UTC)
    }

    #[test]
    fn quantity_change_detected_on_first_item() {
        let current = snapshot(vec![item("si_1", Some(5), march())]);
        let previous = PreviousAttributes {
            items: Some(vec![item("si_1", Some(2), march())]),
            ..Default::default()
        };

        assert_eq!(
            classify(&current, &previous),
            LifecycleTransition::QuantityChanged
        );
    }

    #[test]
    fn quantity_change_requires_both_quantities() {
        let current = snapshot(vec![item("si_1", Some(5), march())]);
        let previous = PreviousAttributes {
            items: Some(vec![item("si_1", None, march())]),
            ..Default::default()
        };

        assert_ne!(
            classify(&current, &previous),
            LifecycleTransition::QuantityChanged
        );
    }

    #[test]
    fn quantity_change_wins_over_cancelling() {
        // Both conditions hold; the fixed order picks quantity change
        let mut current = snapshot(vec![item("si_1", Some(5), march())]);
        current.cancel_at_period_end = true;
        let previous = PreviousAttributes {
            items: Some(vec![item("si_1", Some(2), march())]),
            ..Default::default()
        };

        assert_eq!(
            classify(&current, &previous),
            LifecycleTransition::QuantityChanged
        );
    }

    #[test]
    fn cancelling_requires_active_status() {
        let mut current = snapshot(vec![item("si_1", Some(2), march())]);
        current.cancel_at_period_end = true;
        assert_eq!(
            classify(&current, &PreviousAttributes::default()),
            LifecycleTransition::Cancelling
        );

        current.status = SubscriptionStatus::PastDue;
        assert_eq!(
            classify(&current, &PreviousAttributes::default()),
            LifecycleTransition::OtherUpdate
        );
    }

    #[test]
    fn uncancelling_when_cancel_at_cleared() {
        let current = snapshot(vec![item("si_1", Some(2), march())]);
        let previous = PreviousAttributes {
            cancel_at: Some(march()),
            ..Default::default()
        };

        assert_eq!(
            classify(&current, &previous),
            LifecycleTransition::Uncancelling
        );
    }

    #[test]
    fn uncancelling_when_flag_went_false() {
        let current = snapshot(vec![item("si_1", Some(2), march())]);
        let previous = PreviousAttributes {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };

        assert_eq!(
            classify(&current, &previous),
            LifecycleTransition::Uncancelling
        );
    }

    #[test]
    fn cancelling_wins_over_uncancelling() {
        // cancel_at_period_end is set again while previous shows a cleared
        // cancel_at; the fixed order picks cancelling
        let mut current = snapshot(vec![item("si_1", Some(2), march())]);
        current.cancel_at_period_end = true;
        let previous = PreviousAttributes {
            cancel_at: Some(march()),
            ..Default::default()
        };

        assert_eq!(
            classify(&current, &previous),
            LifecycleTransition::Cancelling
        );
    }

    #[test]
    fn renewal_when_period_advances() {
        let next_month = datetime!(2026-04-01 00:00:00 UTC);
        let current = snapshot(vec![item("si_1", Some(2), next_month)]);
        let previous = PreviousAttributes {
            items: Some(vec![item("si_1", Some(2), march())]),
            ..Default::default()
        };

        assert_eq!(classify(&current, &previous), LifecycleTransition::Renewed);
    }

    #[test]
    fn same_period_is_other_update() {
        let current = snapshot(vec![item("si_1", Some(2), march())]);
        let previous = PreviousAttributes {
            items: Some(vec![item("si_1", Some(2), march())]),
            ..Default::default()
        };

        assert_eq!(
            classify(&current, &previous),
            LifecycleTransition::OtherUpdate
        );
    }

    #[test]
    fn empty_previous_attributes_is_other_update() {
        let current = snapshot(vec![item("si_1", Some(2), march())]);
        assert_eq!(
            classify(&current, &PreviousAttributes::default()),
            LifecycleTransition::OtherUpdate
        );
    }

    #[test]
    fn classifier_is_total_on_empty_items() {
        let current = snapshot(vec![]);
        assert_eq!(
            classify(&current, &PreviousAttributes::default()),
            LifecycleTransition::OtherUpdate
        );
    }

    #[test]
    fn auto_upgrade_flags_at_threshold() {
        let policy = AutoUpgradePolicy::new(Some(10));
        let current = snapshot(vec![item("si_1", Some(12), march())]);

        let decision = policy.evaluate(&current).unwrap();
        assert_eq!(decision.seats, 12);
        assert_eq!(decision.threshold, 10);
    }

    #[test]
    fn auto_upgrade_disabled_without_threshold() {
        let policy = AutoUpgradePolicy::new(None);
        let current = snapshot(vec![item("si_1", Some(100), march())]);
        assert!(policy.evaluate(&current).is_none());
    }

    #[test]
    fn auto_upgrade_ignores_inactive_subscriptions() {
        let policy = AutoUpgradePolicy::new(Some(10));
        let mut current = snapshot(vec![item("si_1", Some(12), march())]);
        current.status = SubscriptionStatus::Canceled;
        assert!(policy.evaluate(&current).is_none());
    }
}
