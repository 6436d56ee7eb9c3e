//! Offer eligibility and ranking.
//!
//! Pure functions over snapshots of offers and bids. The engine decides
//! what to match here, then commits it with version checks.

use std::cmp::Reverse;

use chrono::{DateTime, Utc};
use hive_proto::{Bid, Offer, OfferStatus, Price};

/// Terms an offer can give a bid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// Effective hourly price of the bid's quantities at the offer's rates.
    pub price_per_hour: Price,
    /// Earliest start satisfying both the window and the bid's flexibility.
    pub start: DateTime<Utc>,
}

/// Earliest start inside `[desired - flex, desired + flex]` at which the
/// offer's window still has the bid's whole duration left.
#[must_use]
pub fn feasible_start(offer: &Offer, bid: &Bid) -> Option<DateTime<Utc>> {
    let duration = chrono::Duration::from_std(bid.duration()).ok()?;
    let flex = chrono::Duration::try_seconds(i64::try_from(bid.flexibility_secs).ok()?)?;

    let earliest = bid
        .desired_start
        .checked_sub_signed(flex)
        .map_or(offer.window.start, |t| t.max(offer.window.start));
    let latest_by_window = offer.window.end.checked_sub_signed(duration)?;
    let latest = bid
        .desired_start
        .checked_add_signed(flex)
        .map_or(latest_by_window, |t| t.min(latest_by_window));

    (earliest <= latest).then_some(earliest)
}

/// Terms `offer` gives `bid`, or `None` if it is not eligible.
///
/// Eligible means: the offer is Active, its resources dominate the bid's,
/// locations agree when the bid names one, every required feature is
/// offered, a feasible start exists and the price is within the bid's cap.
#[must_use]
pub fn quote(offer: &Offer, bid: &Bid) -> Option<Quote> {
    if offer.status != OfferStatus::Active || !offer.resources.dominates(&bid.resources) {
        return None;
    }
    if bid
        .location
        .as_deref()
        .is_some_and(|want| offer.location.as_deref() != Some(want))
    {
        return None;
    }
    if !bid.required_features.is_subset(&offer.features) {
        return None;
    }
    let price_per_hour = offer.rates.hourly_cost(&bid.resources);
    if price_per_hour > bid.max_price_per_hour {
        return None;
    }
    let start = feasible_start(offer, bid)?;
    Some(Quote {
        price_per_hour,
        start,
    })
}

/// Eligible offers for `bid`, best first: lowest price, then highest
/// provider reputation, then earliest created.
#[must_use]
pub fn rank_offers<'a>(bid: &Bid, offers: &'a [Offer]) -> Vec<(&'a Offer, Quote)> {
    let mut ranked: Vec<_> = offers
        .iter()
        .filter_map(|offer| quote(offer, bid).map(|q| (offer, q)))
        .collect();
    ranked.sort_by_key(|(offer, q)| {
        (
            q.price_per_hour,
            Reverse(offer.provider_reputation),
            offer.creation_seq,
        )
    });
    ranked
}

/// Sort bids into matching order: highest price cap first, then oldest.
pub fn bid_order(bids: &mut [Bid]) {
    bids.sort_by_key(|b| (Reverse(b.max_price_per_hour), b.creation_seq));
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_proto::{
        AgentId, AvailabilityWindow, BidSpec, JobPayload, OfferSpec, RateSheet, ResourceVector,
    };
    use proptest::prelude::*;
    use std::time::Duration;
    use test_case::test_case;

    const HOUR: i64 = 3600;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn offer(cpu: u32, cents_per_core: u64, window: (i64, i64), seq: u64) -> Offer {
        let spec = OfferSpec::new(
            "provider",
            AgentId::new(),
            ResourceVector::new(cpu, 65_536),
            RateSheet::per_cpu_core(Price::from_cents(cents_per_core)),
            AvailabilityWindow::new(at(window.0), at(window.1)),
        )
        .with_location("us-east-1");
        Offer::from_spec(spec, at(100 * HOUR), seq, at(0))
    }

    fn bid(cpu: u32, max_dollars: u64, hours: u64, desired: i64, flex: u64) -> Bid {
        let spec = BidSpec::new(
            "consumer",
            ResourceVector::new(cpu, 1024),
            Price::from_dollars(max_dollars),
            Duration::from_secs(hours * 3600),
            JobPayload::docker("alpine"),
        )
        .with_start(at(desired), Duration::from_secs(flex));
        Bid::from_spec(spec, at(100 * HOUR), 1, at(0))
    }

    // ==================== Feasible Start Tests ====================

    #[test_case((0, 10 * HOUR), 0, 0 => Some(0); "starts at desired time")]
    #[test_case((2 * HOUR, 10 * HOUR), 0, 3 * HOUR as u64 => Some(2 * HOUR); "flex reaches window start")]
    #[test_case((2 * HOUR, 10 * HOUR), 0, 0 => None; "window opens too late")]
    #[test_case((0, 3 * HOUR), 2 * HOUR, 0 => None; "window closes too early")]
    #[test_case((0, 3 * HOUR), 2 * HOUR, HOUR as u64 => Some(HOUR); "flex pulls start earlier")]
    fn test_feasible_start(window: (i64, i64), desired: i64, flex: u64) -> Option<i64> {
        let offer = offer(16, 10, window, 1);
        let bid = bid(8, 5, 2, desired, flex);
        feasible_start(&offer, &bid).map(|t| t.timestamp() - at(0).timestamp())
    }

    // ==================== Eligibility Tests ====================

    #[test]
    fn test_quote_prices_requested_quantities() {
        let offer = offer(16, 10, (0, 10 * HOUR), 1);
        let q = quote(&offer, &bid(8, 5, 2, 0, 0)).unwrap();
        assert_eq!(q.price_per_hour, Price::from_cents(80));
        assert_eq!(q.start, at(0));
    }

    #[test]
    fn test_quote_rejects_ineligible() {
        let base = offer(16, 10, (0, 10 * HOUR), 1);

        assert!(quote(&base, &bid(32, 5, 2, 0, 0)).is_none(), "too small");
        assert!(quote(&base, &bid(8, 0, 2, 0, 0)).is_none(), "too expensive");

        let mut elsewhere = bid(8, 5, 2, 0, 0);
        elsewhere.location = Some("eu-west-1".into());
        assert!(quote(&base, &elsewhere).is_none(), "wrong location");

        let mut needs_gpu_feature = bid(8, 5, 2, 0, 0);
        needs_gpu_feature.required_features.insert("cuda-12".into());
        assert!(quote(&base, &needs_gpu_feature).is_none(), "missing feature");

        let mut reserved = base.clone();
        reserved.status = OfferStatus::Reserved;
        assert!(quote(&reserved, &bid(8, 5, 2, 0, 0)).is_none(), "not active");
    }

    #[test]
    fn test_bid_without_location_matches_any() {
        let offer = offer(16, 10, (0, 10 * HOUR), 1);
        let mut anywhere = bid(8, 5, 2, 0, 0);
        anywhere.location = None;
        assert!(quote(&offer, &anywhere).is_some());
    }

    // ==================== Ranking Tests ====================

    #[test]
    fn test_rank_by_price_then_reputation_then_age() {
        let cheap = offer(16, 5, (0, 10 * HOUR), 3);
        let mut trusted = offer(16, 10, (0, 10 * HOUR), 2);
        trusted.provider_reputation = 900;
        let older = offer(16, 10, (0, 10 * HOUR), 1);
        let mut newer = offer(16, 10, (0, 10 * HOUR), 4);
        newer.provider_reputation = 0;

        let offers = vec![newer.clone(), older.clone(), trusted.clone(), cheap.clone()];
        let ranked: Vec<_> = rank_offers(&bid(8, 5, 2, 0, 0), &offers)
            .iter()
            .map(|(o, _)| o.id)
            .collect();
        assert_eq!(ranked, vec![cheap.id, trusted.id, older.id, newer.id]);
    }

    #[test]
    fn test_bid_order() {
        let mut low = bid(1, 1, 1, 0, 0);
        low.creation_seq = 1;
        let mut high_old = bid(1, 9, 1, 0, 0);
        high_old.creation_seq = 2;
        let mut high_new = bid(1, 9, 1, 0, 0);
        high_new.creation_seq = 3;

        let mut bids = vec![high_new.clone(), low.clone(), high_old.clone()];
        bid_order(&mut bids);
        let ids: Vec<_> = bids.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![high_old.id, high_new.id, low.id]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_feasible_start_fits_window_and_flex(
            window_start in 0i64..48,
            window_len in 1i64..48,
            desired in 0i64..96,
            flex in 0u64..24,
            hours in 1u64..12,
        ) {
            let offer = offer(16, 10, (window_start * HOUR, (window_start + window_len) * HOUR), 1);
            let bid = bid(8, 5, hours, desired * HOUR, flex * 3600);
            if let Some(start) = feasible_start(&offer, &bid) {
                let end = start + chrono::Duration::seconds(i64::try_from(hours).unwrap() * HOUR);
                prop_assert!(start >= offer.window.start);
                prop_assert!(end <= offer.window.end);
                let flex = chrono::Duration::seconds(i64::try_from(flex).unwrap() * HOUR);
                prop_assert!(start >= bid.desired_start - flex);
                prop_assert!(start <= bid.desired_start + flex);
            }
        }
    }
}
