//! Marketplace records: offers, bids and the matches between them.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AccountId, AgentId, BidId, JobId, MatchId, OfferId};
use crate::job::JobPayload;
use crate::resources::{Price, RateSheet, ResourceVector};

/// Half-open interval `[start, end)` in which an offer's capacity can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    /// First usable instant.
    pub start: DateTime<Utc>,
    /// End of availability.
    pub end: DateTime<Utc>,
}

impl AvailabilityWindow {
    /// Window from `start` to `end`.
    #[must_use]
    pub const fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window starting at `start` and lasting `length`.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>, length: Duration) -> Self {
        let length = chrono::Duration::from_std(length).unwrap_or(chrono::Duration::MAX);
        Self {
            start,
            end: start.checked_add_signed(length).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether `start < end`.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.start < self.end
    }
}

/// Offer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    /// Open for matching.
    Active,
    /// Held by a Pending or Confirmed match.
    Reserved,
    /// Past its expiry or availability window.
    Expired,
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Reserved => "reserved",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Bid status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    /// Waiting for an offer.
    Pending,
    /// Held by a Pending or Confirmed match.
    Matched,
    /// Past its expiry.
    Expired,
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Matched => "matched",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Match status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Awaiting confirmation.
    Pending,
    /// Both sides agreed; a job was synthesized.
    Confirmed,
    /// Rejected explicitly or by timeout.
    Rejected,
}

impl MatchStatus {
    /// Whether the match still holds its offer and bid.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Side of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The bidder.
    Consumer,
    /// The offerer.
    Provider,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumer => f.write_str("consumer"),
            Self::Provider => f.write_str("provider"),
        }
    }
}

/// Request to publish an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferSpec {
    /// Selling account.
    pub provider_id: AccountId,
    /// Agent that will run matched work.
    pub agent_id: AgentId,
    /// Capacity on sale.
    pub resources: ResourceVector,
    /// Hourly rates.
    pub rates: RateSheet,
    /// When the capacity can be used.
    pub window: AvailabilityWindow,
    /// Region or zone.
    #[serde(default)]
    pub location: Option<String>,
    /// Feature tags, e.g. `cuda-12`, `nvlink`.
    #[serde(default)]
    pub features: BTreeSet<String>,
    /// Reputation supplied by the reputation service.
    #[serde(default)]
    pub provider_reputation: u32,
    /// A consumer's confirmation alone finalizes matches.
    #[serde(default)]
    pub auto_accept: bool,
    /// Defaults to 24 hours after creation.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OfferSpec {
    /// Offer with no location, features or reputation.
    #[must_use]
    pub fn new(
        provider_id: impl Into<AccountId>,
        agent_id: AgentId,
        resources: ResourceVector,
        rates: RateSheet,
        window: AvailabilityWindow,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            agent_id,
            resources,
            rates,
            window,
            location: None,
            features: BTreeSet::new(),
            provider_reputation: 0,
            auto_accept: false,
            expires_at: None,
        }
    }

    /// Set location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Add a feature tag.
    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    /// Set reputation.
    #[must_use]
    pub const fn with_reputation(mut self, reputation: u32) -> Self {
        self.provider_reputation = reputation;
        self
    }

    /// Accept matches on the consumer's confirmation alone.
    #[must_use]
    pub const fn with_auto_accept(mut self) -> Self {
        self.auto_accept = true;
        self
    }

    /// Set expiry.
    #[must_use]
    pub const fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// A provider's resource ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Identifier.
    pub id: OfferId,
    /// Selling account.
    pub provider_id: AccountId,
    /// Agent that runs matched work.
    pub agent_id: AgentId,
    /// Capacity on sale.
    pub resources: ResourceVector,
    /// Hourly rates.
    pub rates: RateSheet,
    /// When the capacity can be used.
    pub window: AvailabilityWindow,
    /// Region or zone.
    pub location: Option<String>,
    /// Feature tags.
    pub features: BTreeSet<String>,
    /// Reputation input.
    pub provider_reputation: u32,
    /// Consumer confirmation alone finalizes matches.
    pub auto_accept: bool,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Current status.
    pub status: OfferStatus,
    /// Match holding the offer while Reserved.
    pub reserved_by: Option<MatchId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Monotonic creation order, for tie-breaks.
    pub creation_seq: u64,
}

impl Offer {
    /// Active offer from a validated spec.
    #[must_use]
    pub fn from_spec(
        spec: OfferSpec,
        expires_at: DateTime<Utc>,
        creation_seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OfferId::new(),
            provider_id: spec.provider_id,
            agent_id: spec.agent_id,
            resources: spec.resources,
            rates: spec.rates,
            window: spec.window,
            location: spec.location,
            features: spec.features,
            provider_reputation: spec.provider_reputation,
            auto_accept: spec.auto_accept,
            expires_at,
            status: OfferStatus::Active,
            reserved_by: None,
            created_at: now,
            creation_seq,
        }
    }
}

/// Request to place a bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidSpec {
    /// Buying account.
    pub consumer_id: AccountId,
    /// Minimum resources.
    pub resources: ResourceVector,
    /// Feature tags the offer must carry.
    #[serde(default)]
    pub required_features: BTreeSet<String>,
    /// Highest acceptable hourly price.
    pub max_price_per_hour: Price,
    /// How long the capacity is needed, in seconds.
    pub duration_secs: u64,
    /// Preferred start. Defaults to creation time.
    #[serde(default)]
    pub desired_start: Option<DateTime<Utc>>,
    /// Allowed deviation from `desired_start`, in seconds, either way.
    #[serde(default)]
    pub flexibility_secs: u64,
    /// Required region or zone.
    #[serde(default)]
    pub location: Option<String>,
    /// What to run once matched.
    pub payload: JobPayload,
    /// Priority of the synthesized job.
    #[serde(default = "default_bid_priority")]
    pub priority: u8,
    /// Defaults to one hour after creation.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

const fn default_bid_priority() -> u8 {
    5
}

impl BidSpec {
    /// Bid starting now with no flexibility, location or features.
    #[must_use]
    pub fn new(
        consumer_id: impl Into<AccountId>,
        resources: ResourceVector,
        max_price_per_hour: Price,
        duration: Duration,
        payload: JobPayload,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            resources,
            required_features: BTreeSet::new(),
            max_price_per_hour,
            duration_secs: duration.as_secs(),
            desired_start: None,
            flexibility_secs: 0,
            location: None,
            payload,
            priority: default_bid_priority(),
            expires_at: None,
        }
    }

    /// Set location.
    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Require a feature tag.
    #[must_use]
    pub fn with_required_feature(mut self, feature: impl Into<String>) -> Self {
        self.required_features.insert(feature.into());
        self
    }

    /// Set desired start and flexibility.
    #[must_use]
    pub const fn with_start(mut self, desired_start: DateTime<Utc>, flexibility: Duration) -> Self {
        self.desired_start = Some(desired_start);
        self.flexibility_secs = flexibility.as_secs();
        self
    }

    /// Set expiry.
    #[must_use]
    pub const fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

/// A consumer's resource want.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    /// Identifier.
    pub id: BidId,
    /// Buying account.
    pub consumer_id: AccountId,
    /// Minimum resources.
    pub resources: ResourceVector,
    /// Feature tags the offer must carry.
    pub required_features: BTreeSet<String>,
    /// Highest acceptable hourly price.
    pub max_price_per_hour: Price,
    /// Capacity needed, in seconds.
    pub duration_secs: u64,
    /// Preferred start.
    pub desired_start: DateTime<Utc>,
    /// Allowed deviation either way, in seconds.
    pub flexibility_secs: u64,
    /// Required region or zone.
    pub location: Option<String>,
    /// What to run.
    pub payload: JobPayload,
    /// Priority of the synthesized job.
    pub priority: u8,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Current status.
    pub status: BidStatus,
    /// Match holding the bid while Matched.
    pub matched_by: Option<MatchId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Monotonic creation order, for tie-breaks.
    pub creation_seq: u64,
}

impl Bid {
    /// Pending bid from a validated spec.
    #[must_use]
    pub fn from_spec(
        spec: BidSpec,
        expires_at: DateTime<Utc>,
        creation_seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BidId::new(),
            consumer_id: spec.consumer_id,
            resources: spec.resources,
            required_features: spec.required_features,
            max_price_per_hour: spec.max_price_per_hour,
            duration_secs: spec.duration_secs,
            desired_start: spec.desired_start.unwrap_or(now),
            flexibility_secs: spec.flexibility_secs,
            location: spec.location,
            payload: spec.payload,
            priority: spec.priority,
            expires_at,
            status: BidStatus::Pending,
            matched_by: None,
            created_at: now,
            creation_seq,
        }
    }

    /// Required duration.
    #[must_use]
    pub const fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// A tentative pairing of one bid with one offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    /// Identifier.
    pub id: MatchId,
    /// Matched bid.
    pub bid_id: BidId,
    /// Matched offer.
    pub offer_id: OfferId,
    /// Buying account.
    pub consumer_id: AccountId,
    /// Selling account.
    pub provider_id: AccountId,
    /// Agent that runs the work.
    pub agent_id: AgentId,
    /// Agreed hourly price.
    pub price_per_hour: Price,
    /// Agreed price over the whole duration.
    pub total_price: Price,
    /// Agreed start.
    pub start_time: DateTime<Utc>,
    /// Agreed end.
    pub end_time: DateTime<Utc>,
    /// Current status.
    pub status: MatchStatus,
    /// Consumer accepted.
    pub consumer_confirmed: bool,
    /// Provider accepted.
    pub provider_confirmed: bool,
    /// Provider pre-accepted through an auto-accept offer.
    pub auto_accept: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Confirmation time.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Job synthesized on confirmation.
    pub job_id: Option<JobId>,
    /// Job id reserved by the acceptance that is opening escrow. At most one
    /// confirmer holds the claim, so a match locks funds once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escrow_claim: Option<JobId>,
    /// Why the match was rejected.
    pub reject_reason: Option<String>,
}

impl Match {
    /// Whether the confirmations recorded so far finalize the match.
    #[must_use]
    pub const fn is_fully_confirmed(&self) -> bool {
        self.consumer_confirmed && (self.provider_confirmed || self.auto_accept)
    }

    /// Whether `party` already accepted.
    #[must_use]
    pub const fn has_confirmed(&self, party: Party) -> bool {
        match party {
            Party::Consumer => self.consumer_confirmed,
            Party::Provider => self.provider_confirmed,
        }
    }
}

/// Criteria for listing offers. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferFilter {
    /// Only this provider's offers.
    #[serde(default)]
    pub provider_id: Option<AccountId>,
    /// Only offers in this status.
    #[serde(default)]
    pub status: Option<OfferStatus>,
    /// Only offers in this location.
    #[serde(default)]
    pub location: Option<String>,
}

impl OfferFilter {
    /// Whether `offer` passes the filter.
    #[must_use]
    pub fn matches(&self, offer: &Offer) -> bool {
        self.provider_id
            .as_ref()
            .is_none_or(|p| *p == offer.provider_id)
            && self.status.is_none_or(|s| s == offer.status)
            && self
                .location
                .as_deref()
                .is_none_or(|l| offer.location.as_deref() == Some(l))
    }
}

/// Criteria for listing bids. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidFilter {
    /// Only this consumer's bids.
    #[serde(default)]
    pub consumer_id: Option<AccountId>,
    /// Only bids in this status.
    #[serde(default)]
    pub status: Option<BidStatus>,
}

impl BidFilter {
    /// Whether `bid` passes the filter.
    #[must_use]
    pub fn matches(&self, bid: &Bid) -> bool {
        self.consumer_id
            .as_ref()
            .is_none_or(|c| *c == bid.consumer_id)
            && self.status.is_none_or(|s| s == bid.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_match(auto_accept: bool) -> Match {
        let now = Utc::now();
        Match {
            id: MatchId::new(),
            bid_id: BidId::new(),
            offer_id: OfferId::new(),
            consumer_id: AccountId::new("consumer"),
            provider_id: AccountId::new("provider"),
            agent_id: AgentId::new(),
            price_per_hour: Price::from_cents(80),
            total_price: Price::from_cents(160),
            start_time: now,
            end_time: now + chrono::Duration::hours(2),
            status: MatchStatus::Pending,
            consumer_confirmed: false,
            provider_confirmed: false,
            auto_accept,
            created_at: now,
            confirmed_at: None,
            job_id: None,
            escrow_claim: None,
            reject_reason: None,
        }
    }

    #[test]
    fn test_two_phase_confirmation() {
        let mut m = sample_match(false);
        m.consumer_confirmed = true;
        assert!(!m.is_fully_confirmed());
        m.provider_confirmed = true;
        assert!(m.is_fully_confirmed());
    }

    #[test]
    fn test_auto_accept_needs_only_consumer() {
        let mut m = sample_match(true);
        assert!(!m.is_fully_confirmed());
        m.consumer_confirmed = true;
        assert!(m.is_fully_confirmed());
    }

    #[test]
    fn test_provider_alone_never_finalizes() {
        let mut m = sample_match(true);
        m.provider_confirmed = true;
        assert!(!m.is_fully_confirmed());
    }

    #[test]
    fn test_window_well_formed() {
        let now = Utc::now();
        assert!(AvailabilityWindow::starting_at(now, Duration::from_secs(60)).is_well_formed());
        assert!(!AvailabilityWindow::new(now, now).is_well_formed());
    }

    #[test]
    fn test_bid_defaults_start_to_creation() {
        let now = Utc::now();
        let spec = BidSpec::new(
            "consumer",
            ResourceVector::new(8, 1024),
            Price::from_dollars(5),
            Duration::from_secs(7200),
            JobPayload::docker("alpine"),
        );
        let bid = Bid::from_spec(spec, now, 1, now);
        assert_eq!(bid.desired_start, now);
        assert_eq!(bid.duration(), Duration::from_secs(7200));
        assert_eq!(bid.status, BidStatus::Pending);
    }

    #[test]
    fn test_live_match_statuses() {
        assert!(MatchStatus::Pending.is_live());
        assert!(MatchStatus::Confirmed.is_live());
        assert!(!MatchStatus::Rejected.is_live());
    }
}
