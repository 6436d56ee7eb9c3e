//! Matching engine.
//!
//! Owns the offer, bid and match books. A matching pass pairs each Pending
//! bid with its best eligible offer; the pairing is committed as two
//! version-checked test-and-sets (offer Active to Reserved, then bid Pending
//! to Matched) so an offer is never held by two live matches. Confirmation
//! opens escrow and hands a bound job to the scheduler's lifecycle.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hive_proto::validation::{validate_bid, validate_offer};
use hive_proto::{
    Bid, BidFilter, BidId, BidSpec, BidStatus, Clock, EscrowKey, HiveEvent, Job, JobId, Match,
    MatchId, MatchStatus, Offer, OfferFilter, OfferId, OfferSpec, OfferStatus, Party,
    PaymentGateway, Settlement, ValidationError,
};
use hive_scheduler::JobLifecycle;
use hive_store::{
    Committed, DEFAULT_UPDATE_ATTEMPTS, Decision, EventSink, MemoryStore, RecordStore,
    UpdateError, Versioned, insert_record, update_with_retry,
};
use tracing::{debug, info, warn};

use crate::error::{MarketError, Result};
use crate::orderbook::{Quote, bid_order, rank_offers};

/// Reason recorded on explicitly rejected matches.
pub const REJECTED_REASON: &str = "rejected";

/// Reason recorded on matches nobody confirmed in time.
pub const CONFIRMATION_TIMEOUT_REASON: &str = "confirmation timeout";

/// Marketplace timing settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketConfig {
    /// Offer lifetime when none is requested.
    pub offer_ttl: Duration,
    /// Bid lifetime when none is requested.
    pub bid_ttl: Duration,
    /// How long a match may stay Pending before it is rejected.
    pub confirmation_timeout: Duration,
    /// Optimistic-update attempts per operation.
    pub update_attempts: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(24 * 3600),
            bid_ttl: Duration::from_secs(3600),
            confirmation_timeout: Duration::from_secs(300),
            update_attempts: DEFAULT_UPDATE_ATTEMPTS,
        }
    }
}

/// Outcome of one matching pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchingReport {
    /// Pending matches rejected for missing the confirmation deadline.
    pub expired_matches: usize,
    /// Offers moved to Expired.
    pub expired_offers: usize,
    /// Bids moved to Expired.
    pub expired_bids: usize,
    /// Matches created, in bid order.
    pub matched: Vec<MatchId>,
    /// Pending bids left without an offer.
    pub unmatched: usize,
}

/// Listings moved to Expired by [`Market::expire_listings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredListings {
    /// Expired offers.
    pub offers: Vec<OfferId>,
    /// Expired bids.
    pub bids: Vec<BidId>,
}

fn after(start: DateTime<Utc>, length: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(length)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn map_update<E>(err: UpdateError<MarketError>, not_found: E) -> MarketError
where
    E: FnOnce() -> MarketError,
{
    match err {
        UpdateError::NotFound(_) => not_found(),
        UpdateError::Conflict { key, .. } => MarketError::Conflict(key),
        UpdateError::Rejected(e) => e,
    }
}

fn accept(m: &mut Match, party: Party) {
    match party {
        Party::Consumer => m.consumer_confirmed = true,
        Party::Provider => m.provider_confirmed = true,
    }
}

/// The offer, bid and match books and the operations over them.
pub struct Market {
    offers: Arc<dyn RecordStore<OfferId, Offer>>,
    bids: Arc<dyn RecordStore<BidId, Bid>>,
    matches: Arc<dyn RecordStore<MatchId, Match>>,
    lifecycle: Arc<JobLifecycle>,
    payments: Arc<dyn PaymentGateway>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: MarketConfig,
    next_seq: AtomicU64,
}

impl fmt::Debug for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Market")
            .field("offers", &self.offers.len())
            .field("bids", &self.bids.len())
            .field("matches", &self.matches.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Market {
    /// Market with in-memory books, sharing the lifecycle's clock.
    #[must_use]
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        payments: Arc<dyn PaymentGateway>,
        sink: Arc<dyn EventSink>,
        config: MarketConfig,
    ) -> Self {
        let clock = Arc::clone(lifecycle.clock());
        Self {
            offers: Arc::new(MemoryStore::new()),
            bids: Arc::new(MemoryStore::new()),
            matches: Arc::new(MemoryStore::new()),
            lifecycle,
            payments,
            sink,
            clock,
            config,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Settings in use.
    #[must_use]
    pub const fn config(&self) -> &MarketConfig {
        &self.config
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn confirmation_expired(&self, m: &Match, now: DateTime<Utc>) -> bool {
        now >= after(m.created_at, self.config.confirmation_timeout)
    }

    fn update_offer<F>(&self, offer_id: OfferId, decide: F) -> Result<Committed<Offer>>
    where
        F: FnMut(&Versioned<Offer>) -> Result<Decision<Offer>>,
    {
        update_with_retry(
            &*self.offers,
            &offer_id,
            self.config.update_attempts,
            &*self.sink,
            decide,
        )
        .map_err(|e| map_update(e, || MarketError::UnknownOffer(offer_id)))
    }

    fn update_bid<F>(&self, bid_id: BidId, decide: F) -> Result<Committed<Bid>>
    where
        F: FnMut(&Versioned<Bid>) -> Result<Decision<Bid>>,
    {
        update_with_retry(
            &*self.bids,
            &bid_id,
            self.config.update_attempts,
            &*self.sink,
            decide,
        )
        .map_err(|e| map_update(e, || MarketError::UnknownBid(bid_id)))
    }

    fn update_match<F>(&self, match_id: MatchId, decide: F) -> Result<Committed<Match>>
    where
        F: FnMut(&Versioned<Match>) -> Result<Decision<Match>>,
    {
        update_with_retry(
            &*self.matches,
            &match_id,
            self.config.update_attempts,
            &*self.sink,
            decide,
        )
        .map_err(|e| map_update(e, || MarketError::UnknownMatch(match_id)))
    }

    // ==================== Listings ====================

    /// Publish an offer.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the offer is malformed or names an agent that
    /// is not registered.
    pub fn create_offer(&self, spec: OfferSpec) -> Result<Offer> {
        let now = self.clock.now();
        validate_offer(&spec, now).into_result()?;
        if self.lifecycle.registry().get(spec.agent_id).is_none() {
            return Err(ValidationError::new("agent_id", "agent is not registered").into());
        }

        let expires_at = spec
            .expires_at
            .unwrap_or_else(|| after(now, self.config.offer_ttl));
        let offer = Offer::from_spec(spec, expires_at, self.next_seq(), now);
        let offer_id = offer.id;
        let stored = insert_record(
            &*self.offers,
            offer_id,
            offer,
            &*self.sink,
            vec![HiveEvent::OfferCreated { offer_id }],
        )
        .map_err(|e| MarketError::Conflict(e.to_string()))?;

        info!(
            offer_id = %offer_id,
            provider = %stored.record.provider_id,
            agent_id = %stored.record.agent_id,
            "offer created"
        );
        Ok(stored.record)
    }

    /// Place a bid.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the bid is malformed.
    pub fn create_bid(&self, spec: BidSpec) -> Result<Bid> {
        let now = self.clock.now();
        validate_bid(&spec, now).into_result()?;

        let expires_at = spec
            .expires_at
            .unwrap_or_else(|| after(now, self.config.bid_ttl));
        let bid = Bid::from_spec(spec, expires_at, self.next_seq(), now);
        let bid_id = bid.id;
        let stored = insert_record(
            &*self.bids,
            bid_id,
            bid,
            &*self.sink,
            vec![HiveEvent::BidCreated { bid_id }],
        )
        .map_err(|e| MarketError::Conflict(e.to_string()))?;

        info!(
            bid_id = %bid_id,
            consumer = %stored.record.consumer_id,
            max_price = %stored.record.max_price_per_hour,
            "bid created"
        );
        Ok(stored.record)
    }

    /// Move Active offers past their expiry or window end, and Pending bids
    /// past their expiry, to Expired.
    pub fn expire_listings(&self, now: DateTime<Utc>) -> ExpiredListings {
        let mut expired = ExpiredListings::default();

        let stale_offer = |o: &Offer| {
            o.status == OfferStatus::Active && (now >= o.expires_at || now >= o.window.end)
        };
        for offer in self.offers.list() {
            if !stale_offer(&offer.record) {
                continue;
            }
            let offer_id = offer.record.id;
            let result = self.update_offer(offer_id, |current| {
                if !stale_offer(&current.record) {
                    return Ok(Decision::Keep);
                }
                let mut next = current.record.clone();
                next.status = OfferStatus::Expired;
                Ok(Decision::write(
                    next,
                    vec![HiveEvent::OfferStatusChanged {
                        offer_id,
                        from: OfferStatus::Active,
                        to: OfferStatus::Expired,
                    }],
                ))
            });
            match result {
                Ok(committed) if committed.changed() => {
                    debug!(offer_id = %offer_id, "offer expired");
                    expired.offers.push(offer_id);
                }
                Ok(_) => {}
                Err(e) => warn!(offer_id = %offer_id, error = %e, "failed to expire offer"),
            }
        }

        let stale_bid = |b: &Bid| b.status == BidStatus::Pending && now >= b.expires_at;
        for bid in self.bids.list() {
            if !stale_bid(&bid.record) {
                continue;
            }
            let bid_id = bid.record.id;
            let result = self.update_bid(bid_id, |current| {
                if !stale_bid(&current.record) {
                    return Ok(Decision::Keep);
                }
                let mut next = current.record.clone();
                next.status = BidStatus::Expired;
                Ok(Decision::write(
                    next,
                    vec![HiveEvent::BidStatusChanged {
                        bid_id,
                        from: BidStatus::Pending,
                        to: BidStatus::Expired,
                    }],
                ))
            });
            match result {
                Ok(committed) if committed.changed() => {
                    debug!(bid_id = %bid_id, "bid expired");
                    expired.bids.push(bid_id);
                }
                Ok(_) => {}
                Err(e) => warn!(bid_id = %bid_id, error = %e, "failed to expire bid"),
            }
        }

        expired
    }

    // ==================== Matching ====================

    /// Run one matching pass.
    ///
    /// Unconfirmed matches past their deadline and stale listings are
    /// cleared first, so the capacity they held is matchable in this pass.
    pub fn run_matching(&self, now: DateTime<Utc>) -> MatchingReport {
        let expired_matches = self.expire_unconfirmed(now).len();
        let expired = self.expire_listings(now);
        let mut report = MatchingReport {
            expired_matches,
            expired_offers: expired.offers.len(),
            expired_bids: expired.bids.len(),
            ..MatchingReport::default()
        };

        let mut bids: Vec<Bid> = self
            .bids
            .list()
            .into_iter()
            .map(|v| v.record)
            .filter(|b| b.status == BidStatus::Pending)
            .collect();
        bid_order(&mut bids);

        for bid in &bids {
            let offers: Vec<Offer> = self
                .offers
                .list()
                .into_iter()
                .map(|v| v.record)
                .filter(|o| o.status == OfferStatus::Active)
                .collect();

            let mut placed = false;
            for (offer, quote) in rank_offers(bid, &offers) {
                match self.try_match(bid, offer, quote, now) {
                    Ok(m) => {
                        report.matched.push(m.id);
                        placed = true;
                        break;
                    }
                    Err(MarketError::OfferUnavailable { offer_id, status }) => {
                        debug!(bid_id = %bid.id, offer_id = %offer_id, status = %status, "offer taken, trying next");
                    }
                    Err(MarketError::BidUnavailable { status, .. }) => {
                        debug!(bid_id = %bid.id, status = %status, "bid no longer pending");
                        placed = true;
                        break;
                    }
                    Err(e) => {
                        warn!(bid_id = %bid.id, offer_id = %offer.id, error = %e, "match attempt failed");
                        break;
                    }
                }
            }
            if !placed {
                report.unmatched += 1;
            }
        }

        if !report.matched.is_empty() {
            info!(
                matched = report.matched.len(),
                unmatched = report.unmatched,
                "matching pass complete"
            );
        }
        report
    }

    /// Reserve `offer`, then claim `bid`, then record the match. The offer is
    /// handed back if the bid was claimed first.
    fn try_match(&self, bid: &Bid, offer: &Offer, quote: Quote, now: DateTime<Utc>) -> Result<Match> {
        let match_id = MatchId::new();
        let offer_id = offer.id;
        let bid_id = bid.id;

        self.update_offer(offer_id, |current| {
            let o = &current.record;
            if o.status != OfferStatus::Active {
                return Err(MarketError::OfferUnavailable {
                    offer_id,
                    status: o.status,
                });
            }
            let mut next = o.clone();
            next.status = OfferStatus::Reserved;
            next.reserved_by = Some(match_id);
            Ok(Decision::write(
                next,
                vec![HiveEvent::OfferStatusChanged {
                    offer_id,
                    from: OfferStatus::Active,
                    to: OfferStatus::Reserved,
                }],
            ))
        })?;

        let claimed = self.update_bid(bid_id, |current| {
            let b = &current.record;
            if b.status != BidStatus::Pending {
                return Err(MarketError::BidUnavailable {
                    bid_id,
                    status: b.status,
                });
            }
            let mut next = b.clone();
            next.status = BidStatus::Matched;
            next.matched_by = Some(match_id);
            Ok(Decision::write(
                next,
                vec![HiveEvent::BidStatusChanged {
                    bid_id,
                    from: BidStatus::Pending,
                    to: BidStatus::Matched,
                }],
            ))
        });
        if let Err(e) = claimed {
            self.release_offer(offer_id, match_id);
            return Err(e);
        }

        let duration = bid.duration();
        let record = Match {
            id: match_id,
            bid_id,
            offer_id,
            consumer_id: bid.consumer_id.clone(),
            provider_id: offer.provider_id.clone(),
            agent_id: offer.agent_id,
            price_per_hour: quote.price_per_hour,
            total_price: quote.price_per_hour.for_duration(duration),
            start_time: quote.start,
            end_time: after(quote.start, duration),
            status: MatchStatus::Pending,
            consumer_confirmed: false,
            provider_confirmed: false,
            auto_accept: offer.auto_accept,
            created_at: now,
            confirmed_at: None,
            job_id: None,
            escrow_claim: None,
            reject_reason: None,
        };
        let stored = insert_record(
            &*self.matches,
            match_id,
            record,
            &*self.sink,
            vec![HiveEvent::MatchCreated {
                match_id,
                bid_id,
                offer_id,
            }],
        );
        match stored {
            Ok(stored) => {
                info!(
                    match_id = %match_id,
                    bid_id = %bid_id,
                    offer_id = %offer_id,
                    price_per_hour = %stored.record.price_per_hour,
                    start = %stored.record.start_time,
                    "match created"
                );
                Ok(stored.record)
            }
            Err(e) => {
                self.release_offer(offer_id, match_id);
                self.release_bid(bid_id, match_id);
                Err(MarketError::Conflict(e.to_string()))
            }
        }
    }

    fn release_offer(&self, offer_id: OfferId, match_id: MatchId) {
        let result = self.update_offer(offer_id, |current| {
            let o = &current.record;
            if o.status != OfferStatus::Reserved || o.reserved_by != Some(match_id) {
                return Ok(Decision::Keep);
            }
            let mut next = o.clone();
            next.status = OfferStatus::Active;
            next.reserved_by = None;
            Ok(Decision::write(
                next,
                vec![HiveEvent::OfferStatusChanged {
                    offer_id,
                    from: OfferStatus::Reserved,
                    to: OfferStatus::Active,
                }],
            ))
        });
        if let Err(e) = result {
            warn!(offer_id = %offer_id, match_id = %match_id, error = %e, "failed to release offer");
        }
    }

    fn release_bid(&self, bid_id: BidId, match_id: MatchId) {
        let result = self.update_bid(bid_id, |current| {
            let b = &current.record;
            if b.status != BidStatus::Matched || b.matched_by != Some(match_id) {
                return Ok(Decision::Keep);
            }
            let mut next = b.clone();
            next.status = BidStatus::Pending;
            next.matched_by = None;
            Ok(Decision::write(
                next,
                vec![HiveEvent::BidStatusChanged {
                    bid_id,
                    from: BidStatus::Matched,
                    to: BidStatus::Pending,
                }],
            ))
        });
        if let Err(e) = result {
            warn!(bid_id = %bid_id, match_id = %match_id, error = %e, "failed to release bid");
        }
    }

    // ==================== Confirmation ====================

    /// Record `party`'s acceptance of a Pending match.
    ///
    /// The acceptance that completes the match first claims it, then opens
    /// escrow for the total price, then commits the match as Confirmed and
    /// admits a job bound to the offer's agent. Only the claim holder talks
    /// to the payment gateway. Accepting twice, accepting while another
    /// acceptance holds the claim, or accepting a Confirmed match returns the
    /// match unchanged.
    ///
    /// # Errors
    ///
    /// Returns `MatchClosed` if the match was rejected or missed its
    /// deadline, and `Escrow` if the consumer's funds cannot be locked; the
    /// acceptance is then not recorded.
    pub fn confirm_match(&self, match_id: MatchId, party: Party) -> Result<Match> {
        let now = self.clock.now();
        let current = self
            .get_match(match_id)
            .ok_or(MarketError::UnknownMatch(match_id))?;
        if current.status == MatchStatus::Pending && self.confirmation_expired(&current, now) {
            self.close(match_id, CONFIRMATION_TIMEOUT_REASON, Some(now))?;
            return Err(MarketError::MatchClosed {
                match_id,
                status: MatchStatus::Rejected,
            });
        }

        let job_id = JobId::new();
        let accepted = self.update_match(match_id, |current| {
            let m = &current.record;
            match m.status {
                MatchStatus::Confirmed => return Ok(Decision::Keep),
                MatchStatus::Rejected => {
                    return Err(MarketError::MatchClosed {
                        match_id,
                        status: m.status,
                    });
                }
                MatchStatus::Pending => {}
            }
            if m.has_confirmed(party) {
                return Ok(Decision::Keep);
            }

            let mut next = m.clone();
            accept(&mut next, party);
            if !next.is_fully_confirmed() {
                return Ok(Decision::write(
                    next,
                    vec![HiveEvent::MatchAccepted { match_id, party }],
                ));
            }
            if m.escrow_claim.is_some() {
                return Ok(Decision::Keep);
            }
            let mut claimed = m.clone();
            claimed.escrow_claim = Some(job_id);
            Ok(Decision::write(claimed, Vec::new()))
        })?;

        let changed = accepted.changed();
        let claimed = accepted.after.record;
        if claimed.escrow_claim != Some(job_id) {
            if changed {
                debug!(match_id = %match_id, party = %party, "match accepted");
            }
            return Ok(claimed);
        }

        if let Err(e) = self.payments.create_escrow(
            EscrowKey::Match(match_id),
            &claimed.consumer_id,
            claimed.total_price,
        ) {
            self.drop_escrow_claim(match_id, job_id);
            return Err(MarketError::Escrow(e));
        }

        let finalized = self.update_match(match_id, |current| {
            let m = &current.record;
            if m.escrow_claim != Some(job_id) {
                return Err(MarketError::Conflict(match_id.to_string()));
            }
            if m.status != MatchStatus::Pending {
                return Err(MarketError::MatchClosed {
                    match_id,
                    status: m.status,
                });
            }
            let mut next = m.clone();
            accept(&mut next, party);
            next.escrow_claim = None;
            next.status = MatchStatus::Confirmed;
            next.confirmed_at = Some(now);
            next.job_id = Some(job_id);
            Ok(Decision::write(
                next,
                vec![
                    HiveEvent::MatchAccepted { match_id, party },
                    HiveEvent::MatchStatusChanged {
                        match_id,
                        from: MatchStatus::Pending,
                        to: MatchStatus::Confirmed,
                    },
                ],
            ))
        });
        let confirmed = match finalized {
            Ok(committed) => committed.after.record,
            Err(e) => {
                self.drop_escrow_claim(match_id, job_id);
                info!(
                    match_id = %match_id,
                    error = %e,
                    "match closed while escrow was opening, refunding"
                );
                if let Err(e) = self.payments.refund_payment(job_id, &claimed.consumer_id) {
                    warn!(match_id = %match_id, error = %e, "escrow refund failed");
                }
                return Err(e);
            }
        };

        info!(
            match_id = %match_id,
            job_id = %job_id,
            total_price = %confirmed.total_price,
            "match confirmed"
        );
        self.synthesize_job(&confirmed, job_id, now)?;
        Ok(confirmed)
    }

    /// Give up the escrow claim `job_id` holds on a match.
    fn drop_escrow_claim(&self, match_id: MatchId, job_id: JobId) {
        let result = self.update_match(match_id, |current| {
            if current.record.escrow_claim != Some(job_id) {
                return Ok(Decision::Keep);
            }
            let mut next = current.record.clone();
            next.escrow_claim = None;
            Ok(Decision::write(next, Vec::new()))
        });
        if let Err(e) = result {
            warn!(match_id = %match_id, error = %e, "failed to drop escrow claim");
        }
    }

    /// Admit the job a confirmed match pays for. A start in the future gates
    /// the job until then; otherwise it is placed on the agent immediately
    /// when the agent is free.
    fn synthesize_job(&self, m: &Match, job_id: JobId, now: DateTime<Utc>) -> Result<Job> {
        let bid = self.get_bid(m.bid_id).ok_or(MarketError::UnknownBid(m.bid_id))?;
        let settlement = Settlement {
            escrow: EscrowKey::Match(m.id),
            amount: m.total_price,
            payer: m.consumer_id.clone(),
            payee: Some(m.provider_id.clone()),
        };
        let mut job = Job::new(m.consumer_id.clone(), bid.resources, bid.payload, now)
            .with_id(job_id)
            .with_priority(bid.priority)
            .with_timeout_secs(bid.duration_secs)
            .with_settlement(settlement)
            .with_match(m.id, m.agent_id);

        let job = if m.start_time > now {
            job.not_before = Some(m.start_time);
            job.pending_since = m.start_time;
            self.lifecycle.admit(job)?
        } else {
            self.lifecycle.admit_bound(job, m.agent_id)?
        };
        debug!(match_id = %m.id, job_id = %job.id, status = %job.status, "match job admitted");
        Ok(job)
    }

    /// Reject a Pending match and put its offer and bid back on the books.
    /// Rejecting an already rejected match is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `MatchClosed` if the match is already Confirmed.
    pub fn reject_match(&self, match_id: MatchId) -> Result<Match> {
        self.close(match_id, REJECTED_REASON, None)
            .map(|committed| committed.after.record)
    }

    /// Reject every Pending match older than the confirmation timeout.
    pub fn expire_unconfirmed(&self, now: DateTime<Utc>) -> Vec<MatchId> {
        let mut expired = Vec::new();
        for m in self.matches.list() {
            let m = m.record;
            if m.status != MatchStatus::Pending || !self.confirmation_expired(&m, now) {
                continue;
            }
            match self.close(m.id, CONFIRMATION_TIMEOUT_REASON, Some(now)) {
                Ok(committed) if committed.changed() => expired.push(m.id),
                Ok(_) | Err(MarketError::MatchClosed { .. }) => {}
                Err(e) => warn!(match_id = %m.id, error = %e, "failed to expire match"),
            }
        }
        expired
    }

    /// Move a Pending match to Rejected and release what it held. With
    /// `deadline_at`, only a match past its confirmation deadline is closed.
    fn close(
        &self,
        match_id: MatchId,
        reason: &str,
        deadline_at: Option<DateTime<Utc>>,
    ) -> Result<Committed<Match>> {
        let committed = self.update_match(match_id, |current| {
            let m = &current.record;
            match m.status {
                MatchStatus::Rejected => return Ok(Decision::Keep),
                MatchStatus::Confirmed => {
                    return Err(MarketError::MatchClosed {
                        match_id,
                        status: m.status,
                    });
                }
                MatchStatus::Pending => {}
            }
            if deadline_at.is_some_and(|now| !self.confirmation_expired(m, now)) {
                return Ok(Decision::Keep);
            }
            let mut next = m.clone();
            next.status = MatchStatus::Rejected;
            next.reject_reason = Some(reason.to_string());
            Ok(Decision::write(
                next,
                vec![HiveEvent::MatchStatusChanged {
                    match_id,
                    from: MatchStatus::Pending,
                    to: MatchStatus::Rejected,
                }],
            ))
        })?;

        if committed.changed() {
            let m = &committed.after.record;
            self.release_offer(m.offer_id, match_id);
            self.release_bid(m.bid_id, match_id);
            info!(match_id = %match_id, reason, "match rejected");
        }
        Ok(committed)
    }

    // ==================== Queries ====================

    /// Look up an offer.
    #[must_use]
    pub fn get_offer(&self, offer_id: OfferId) -> Option<Offer> {
        self.offers.get(&offer_id).map(|v| v.record)
    }

    /// Look up a bid.
    #[must_use]
    pub fn get_bid(&self, bid_id: BidId) -> Option<Bid> {
        self.bids.get(&bid_id).map(|v| v.record)
    }

    /// Look up a match.
    #[must_use]
    pub fn get_match(&self, match_id: MatchId) -> Option<Match> {
        self.matches.get(&match_id).map(|v| v.record)
    }

    /// Offers passing `filter`, oldest first.
    #[must_use]
    pub fn list_offers(&self, filter: &OfferFilter) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self
            .offers
            .list()
            .into_iter()
            .map(|v| v.record)
            .filter(|o| filter.matches(o))
            .collect();
        offers.sort_by_key(|o| o.creation_seq);
        offers
    }

    /// Bids passing `filter`, oldest first.
    #[must_use]
    pub fn list_bids(&self, filter: &BidFilter) -> Vec<Bid> {
        let mut bids: Vec<Bid> = self
            .bids
            .list()
            .into_iter()
            .map(|v| v.record)
            .filter(|b| filter.matches(b))
            .collect();
        bids.sort_by_key(|b| b.creation_seq);
        bids
    }

    /// Matches, optionally only those in `status`, oldest first.
    #[must_use]
    pub fn list_matches(&self, status: Option<MatchStatus>) -> Vec<Match> {
        let mut matches: Vec<Match> = self
            .matches
            .list()
            .into_iter()
            .map(|v| v.record)
            .filter(|m| status.is_none_or(|s| s == m.status))
            .collect();
        matches.sort_by_key(|m| m.created_at);
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_proto::{
        AccountId, AgentId, AgentRegistration, AvailabilityWindow, JobPayload, JobState, ManualClock,
        PaymentCall, Price, RateSheet, RecordingAgentClient, RecordingPaymentGateway,
        ResourceVector,
    };
    use hive_registry::{Registry, RegistryConfig};
    use hive_store::EventBus;
    use std::collections::HashSet;

    struct Fixture {
        market: Market,
        lifecycle: Arc<JobLifecycle>,
        registry: Arc<Registry>,
        agents: Arc<RecordingAgentClient>,
        payments: Arc<RecordingPaymentGateway>,
        clock: Arc<ManualClock>,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let bus = Arc::new(EventBus::new(256, 4096, clock.clone()));
        let registry = Arc::new(Registry::in_memory(
            bus.clone(),
            clock.clone(),
            RegistryConfig::default(),
        ));
        let agents = Arc::new(RecordingAgentClient::new());
        let payments = Arc::new(RecordingPaymentGateway::new());
        let lifecycle = Arc::new(JobLifecycle::new(
            Arc::new(MemoryStore::new()),
            registry.clone(),
            agents.clone(),
            payments.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let market = Market::new(
            lifecycle.clone(),
            payments.clone(),
            bus.clone(),
            MarketConfig::default(),
        );
        Fixture {
            market,
            lifecycle,
            registry,
            agents,
            payments,
            clock,
            bus,
        }
    }

    impl Fixture {
        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        fn agent(&self) -> AgentId {
            let id = AgentId::new();
            self.registry
                .register(
                    id,
                    AgentRegistration::new("provider", ResourceVector::new(16, 65_536)),
                )
                .unwrap();
            id
        }

        fn offer_spec(&self, agent_id: AgentId, cents_per_core: u64) -> OfferSpec {
            OfferSpec::new(
                "provider",
                agent_id,
                ResourceVector::new(16, 65_536),
                RateSheet::per_cpu_core(Price::from_cents(cents_per_core)),
                AvailabilityWindow::starting_at(self.now(), Duration::from_secs(12 * 3600)),
            )
            .with_location("us-east-1")
        }

        fn bid_spec(&self, max_dollars: u64) -> BidSpec {
            BidSpec::new(
                "consumer",
                ResourceVector::new(8, 4096),
                Price::from_dollars(max_dollars),
                Duration::from_secs(2 * 3600),
                JobPayload::docker("pytorch/pytorch:2.1"),
            )
            .with_location("us-east-1")
        }

        fn offer(&self) -> Offer {
            let agent = self.agent();
            self.market.create_offer(self.offer_spec(agent, 10)).unwrap()
        }

        fn matched(&self) -> Match {
            let offer = self.offer();
            self.market.create_bid(self.bid_spec(5)).unwrap();
            let report = self.market.run_matching(self.now());
            let m = self.market.get_match(report.matched[0]).unwrap();
            assert_eq!(m.offer_id, offer.id);
            m
        }

        fn events(&self) -> Vec<HiveEvent> {
            self.bus.recent(4096).into_iter().map(|e| e.event).collect()
        }
    }

    // ==================== Listing Tests ====================

    #[test]
    fn test_create_offer_defaults_expiry() {
        let f = fixture();
        let offer = f.offer();
        assert_eq!(offer.status, OfferStatus::Active);
        assert_eq!(offer.expires_at, f.now() + chrono::Duration::hours(24));
        assert!(f.events().contains(&HiveEvent::OfferCreated { offer_id: offer.id }));
    }

    #[test]
    fn test_create_bid_defaults_expiry() {
        let f = fixture();
        let bid = f.market.create_bid(f.bid_spec(5)).unwrap();
        assert_eq!(bid.status, BidStatus::Pending);
        assert_eq!(bid.expires_at, f.now() + chrono::Duration::hours(1));
        assert_eq!(bid.desired_start, f.now());
    }

    #[test]
    fn test_offer_for_unknown_agent_rejected() {
        let f = fixture();
        let err = f
            .market
            .create_offer(f.offer_spec(AgentId::new(), 10))
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(ref v) if v.field == "agent_id"));
        assert!(f.market.list_offers(&OfferFilter::default()).is_empty());
    }

    #[test]
    fn test_invalid_bid_rejected() {
        let f = fixture();
        let mut spec = f.bid_spec(5);
        spec.max_price_per_hour = Price::ZERO;
        let err = f.market.create_bid(spec).unwrap_err();
        assert!(matches!(err, MarketError::Validation(ref v) if v.field == "max_price_per_hour"));
    }

    #[test]
    fn test_expire_listings() {
        let f = fixture();
        let offer = f.offer();
        let bid = f.market.create_bid(f.bid_spec(5)).unwrap();

        f.clock.advance(chrono::Duration::hours(2));
        let expired = f.market.expire_listings(f.now());
        assert_eq!(expired.bids, vec![bid.id]);
        assert!(expired.offers.is_empty());

        f.clock.advance(chrono::Duration::hours(10));
        let expired = f.market.expire_listings(f.now());
        assert_eq!(expired.offers, vec![offer.id], "window has ended");
        assert_eq!(
            f.market.get_offer(offer.id).unwrap().status,
            OfferStatus::Expired
        );
    }

    #[test]
    fn test_list_filters() {
        let f = fixture();
        let first = f.offer();
        let second = f.offer();
        f.market.create_bid(f.bid_spec(5)).unwrap();

        let ids: Vec<_> = f
            .market
            .list_offers(&OfferFilter::default())
            .iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec![first.id, second.id]);

        let filter = BidFilter {
            status: Some(BidStatus::Matched),
            ..BidFilter::default()
        };
        assert!(f.market.list_bids(&filter).is_empty());
    }

    // ==================== Matching Tests ====================

    #[test]
    fn test_match_prices_requested_quantities() {
        let f = fixture();
        let m = f.matched();

        assert_eq!(m.status, MatchStatus::Pending);
        assert_eq!(m.price_per_hour, Price::from_cents(80));
        assert_eq!(m.total_price, Price::from_cents(160));
        assert_eq!(m.start_time, f.now());
        assert_eq!(m.end_time, f.now() + chrono::Duration::hours(2));

        let offer = f.market.get_offer(m.offer_id).unwrap();
        assert_eq!(offer.status, OfferStatus::Reserved);
        assert_eq!(offer.reserved_by, Some(m.id));
        let bid = f.market.get_bid(m.bid_id).unwrap();
        assert_eq!(bid.status, BidStatus::Matched);
        assert_eq!(bid.matched_by, Some(m.id));
    }

    #[test]
    fn test_no_eligible_offer_leaves_bid_pending() {
        let f = fixture();
        f.offer();
        let bid = f.market.create_bid(f.bid_spec(5).with_location("eu-west-1")).unwrap();

        let report = f.market.run_matching(f.now());
        assert!(report.matched.is_empty());
        assert_eq!(report.unmatched, 1);
        assert_eq!(f.market.get_bid(bid.id).unwrap().status, BidStatus::Pending);
    }

    #[test]
    fn test_highest_bid_wins_single_offer() {
        let f = fixture();
        f.offer();
        let low = f.market.create_bid(f.bid_spec(2)).unwrap();
        let high = f.market.create_bid(f.bid_spec(9)).unwrap();

        let report = f.market.run_matching(f.now());
        assert_eq!(report.matched.len(), 1);
        assert_eq!(report.unmatched, 1);
        let m = f.market.get_match(report.matched[0]).unwrap();
        assert_eq!(m.bid_id, high.id);
        assert_eq!(f.market.get_bid(low.id).unwrap().status, BidStatus::Pending);
    }

    #[test]
    fn test_cheapest_offer_chosen() {
        let f = fixture();
        let pricey = f.market.create_offer(f.offer_spec(f.agent(), 30)).unwrap();
        let cheap = f.market.create_offer(f.offer_spec(f.agent(), 10)).unwrap();
        f.market.create_bid(f.bid_spec(5)).unwrap();

        let report = f.market.run_matching(f.now());
        let m = f.market.get_match(report.matched[0]).unwrap();
        assert_eq!(m.offer_id, cheap.id);
        assert_eq!(
            f.market.get_offer(pricey.id).unwrap().status,
            OfferStatus::Active
        );
    }

    #[test]
    fn test_matching_is_stable_across_passes() {
        let f = fixture();
        f.matched();
        let report = f.market.run_matching(f.now());
        assert!(report.matched.is_empty());
        assert_eq!(f.market.list_matches(None).len(), 1);
    }

    // ==================== Confirmation Tests ====================

    #[test]
    fn test_two_phase_confirmation_admits_bound_job() {
        let f = fixture();
        let m = f.matched();

        let after_consumer = f.market.confirm_match(m.id, Party::Consumer).unwrap();
        assert_eq!(after_consumer.status, MatchStatus::Pending);
        assert!(f.payments.calls().is_empty());

        let confirmed = f.market.confirm_match(m.id, Party::Provider).unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
        assert_eq!(confirmed.confirmed_at, Some(f.now()));
        assert_eq!(
            f.payments.calls(),
            vec![PaymentCall::Escrow {
                key: EscrowKey::Match(m.id),
                payer: AccountId::new("consumer"),
                amount: Price::from_cents(160),
            }]
        );

        let job = f.lifecycle.get_job(confirmed.job_id.unwrap()).unwrap();
        assert_eq!(job.match_id, Some(m.id));
        assert_eq!(job.status, JobState::Scheduled);
        assert_eq!(job.assigned_agent_id, Some(m.agent_id));
        assert_eq!(job.timeout_secs, 7200);
        assert_eq!(job.settlement.unwrap().payee, Some(AccountId::new("provider")));
        assert_eq!(f.agents.assignments_for(m.agent_id), vec![job.id]);
    }

    #[test]
    fn test_auto_accept_needs_only_consumer() {
        let f = fixture();
        let agent = f.agent();
        f.market
            .create_offer(f.offer_spec(agent, 10).with_auto_accept())
            .unwrap();
        f.market.create_bid(f.bid_spec(5)).unwrap();
        let report = f.market.run_matching(f.now());

        let confirmed = f
            .market
            .confirm_match(report.matched[0], Party::Consumer)
            .unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
        assert!(confirmed.job_id.is_some());
    }

    #[test]
    fn test_repeated_confirmation_is_noop() {
        let f = fixture();
        let m = f.matched();
        f.market.confirm_match(m.id, Party::Consumer).unwrap();
        let before = f.events().len();
        f.market.confirm_match(m.id, Party::Consumer).unwrap();
        assert_eq!(f.events().len(), before);

        let confirmed = f.market.confirm_match(m.id, Party::Provider).unwrap();
        let again = f.market.confirm_match(m.id, Party::Provider).unwrap();
        assert_eq!(confirmed, again);
        assert_eq!(f.lifecycle.list_jobs(&hive_proto::JobFilter::default()).len(), 1);
    }

    #[test]
    fn test_declined_escrow_leaves_match_pending() {
        let f = fixture();
        let m = f.matched();
        f.market.confirm_match(m.id, Party::Provider).unwrap();
        f.payments.set_decline_escrow(true);

        let err = f.market.confirm_match(m.id, Party::Consumer).unwrap_err();
        assert!(matches!(err, MarketError::Escrow(_)));
        let pending = f.market.get_match(m.id).unwrap();
        assert_eq!(pending.status, MatchStatus::Pending);
        assert!(!pending.consumer_confirmed);
        assert!(pending.escrow_claim.is_none());
        assert!(f.lifecycle.list_jobs(&hive_proto::JobFilter::default()).is_empty());

        f.payments.set_decline_escrow(false);
        let confirmed = f.market.confirm_match(m.id, Party::Consumer).unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
        assert_eq!(f.payments.calls().len(), 1);
    }

    #[test]
    fn test_acceptance_during_escrow_claim_is_noop() {
        let f = fixture();
        let m = f.matched();
        f.market.confirm_match(m.id, Party::Provider).unwrap();
        let claim = JobId::new();
        f.market
            .update_match(m.id, |current| {
                let mut next = current.record.clone();
                next.escrow_claim = Some(claim);
                Ok(Decision::write(next, Vec::new()))
            })
            .unwrap();
        let before = f.events().len();

        let seen = f.market.confirm_match(m.id, Party::Consumer).unwrap();
        assert_eq!(seen.status, MatchStatus::Pending);
        assert!(!seen.consumer_confirmed);
        assert_eq!(seen.escrow_claim, Some(claim));
        assert!(f.payments.calls().is_empty());
        assert_eq!(f.events().len(), before);
    }

    #[test]
    fn test_completing_acceptance_publishes_once() {
        let f = fixture();
        let m = f.matched();
        f.market.confirm_match(m.id, Party::Provider).unwrap();
        let confirmed = f.market.confirm_match(m.id, Party::Consumer).unwrap();
        assert!(confirmed.consumer_confirmed);
        assert!(confirmed.escrow_claim.is_none());

        let accepted = f
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    HiveEvent::MatchAccepted { match_id, party: Party::Consumer }
                        if *match_id == m.id
                )
            })
            .count();
        assert_eq!(accepted, 1);
        assert_eq!(
            f.payments.calls(),
            vec![PaymentCall::Escrow {
                key: EscrowKey::Match(m.id),
                payer: AccountId::new("consumer"),
                amount: confirmed.total_price,
            }]
        );
    }

    #[test]
    fn test_future_start_gates_job() {
        let f = fixture();
        let agent = f.agent();
        f.market.create_offer(f.offer_spec(agent, 10)).unwrap();
        let start = f.now() + chrono::Duration::hours(3);
        f.market
            .create_bid(f.bid_spec(5).with_start(start, Duration::ZERO))
            .unwrap();
        let report = f.market.run_matching(f.now());
        f.market.confirm_match(report.matched[0], Party::Consumer).unwrap();
        let confirmed = f
            .market
            .confirm_match(report.matched[0], Party::Provider)
            .unwrap();

        let job = f.lifecycle.get_job(confirmed.job_id.unwrap()).unwrap();
        assert_eq!(job.status, JobState::Pending);
        assert_eq!(job.not_before, Some(start));
        assert_eq!(job.bound_agent_id, Some(agent));
        assert!(f.agents.assignments_for(agent).is_empty());
    }

    // ==================== Rejection Tests ====================

    #[test]
    fn test_reject_releases_for_rematching() {
        let f = fixture();
        let m = f.matched();

        let rejected = f.market.reject_match(m.id).unwrap();
        assert_eq!(rejected.status, MatchStatus::Rejected);
        assert_eq!(rejected.reject_reason.as_deref(), Some(REJECTED_REASON));
        assert_eq!(
            f.market.get_offer(m.offer_id).unwrap().status,
            OfferStatus::Active
        );
        assert_eq!(f.market.get_bid(m.bid_id).unwrap().status, BidStatus::Pending);

        let report = f.market.run_matching(f.now());
        assert_eq!(report.matched.len(), 1);
        assert_ne!(report.matched[0], m.id);
    }

    #[test]
    fn test_reject_is_idempotent_and_final() {
        let f = fixture();
        let m = f.matched();
        f.market.reject_match(m.id).unwrap();
        assert_eq!(
            f.market.reject_match(m.id).unwrap().status,
            MatchStatus::Rejected
        );

        let err = f.market.confirm_match(m.id, Party::Consumer).unwrap_err();
        assert_eq!(
            err,
            MarketError::MatchClosed {
                match_id: m.id,
                status: MatchStatus::Rejected
            }
        );
    }

    #[test]
    fn test_confirmed_match_cannot_be_rejected() {
        let f = fixture();
        let m = f.matched();
        f.market.confirm_match(m.id, Party::Consumer).unwrap();
        f.market.confirm_match(m.id, Party::Provider).unwrap();
        assert!(matches!(
            f.market.reject_match(m.id),
            Err(MarketError::MatchClosed {
                status: MatchStatus::Confirmed,
                ..
            })
        ));
    }

    #[test]
    fn test_unconfirmed_match_times_out() {
        let f = fixture();
        let m = f.matched();
        f.clock.advance(chrono::Duration::minutes(4));
        assert!(f.market.expire_unconfirmed(f.now()).is_empty());

        f.clock.advance(chrono::Duration::minutes(2));
        assert_eq!(f.market.expire_unconfirmed(f.now()), vec![m.id]);
        let m = f.market.get_match(m.id).unwrap();
        assert_eq!(m.reject_reason.as_deref(), Some(CONFIRMATION_TIMEOUT_REASON));
        assert_eq!(
            f.market.get_offer(m.offer_id).unwrap().status,
            OfferStatus::Active
        );
    }

    #[test]
    fn test_late_confirmation_rejected() {
        let f = fixture();
        let m = f.matched();
        f.clock.advance(chrono::Duration::minutes(10));

        let err = f.market.confirm_match(m.id, Party::Consumer).unwrap_err();
        assert!(matches!(err, MarketError::MatchClosed { .. }));
        assert_eq!(f.market.get_match(m.id).unwrap().status, MatchStatus::Rejected);
        assert_eq!(f.market.get_bid(m.bid_id).unwrap().status, BidStatus::Pending);
    }

    #[test]
    fn test_unknown_match() {
        let f = fixture();
        let id = MatchId::new();
        assert_eq!(
            f.market.confirm_match(id, Party::Consumer).unwrap_err(),
            MarketError::UnknownMatch(id)
        );
        assert_eq!(
            f.market.reject_match(id).unwrap_err(),
            MarketError::UnknownMatch(id)
        );
    }

    // ==================== Concurrency Tests ====================

    #[test]
    fn test_concurrent_passes_never_double_book_offers() {
        let f = fixture();
        for _ in 0..8 {
            f.offer();
        }
        for max in 1..=20 {
            f.market.create_bid(f.bid_spec(max)).unwrap();
        }

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| f.market.run_matching(f.now()));
            }
        });

        // A pass that lost every race may leave an offer for the next pass.
        f.market.run_matching(f.now());

        let live: Vec<Match> = f
            .market
            .list_matches(None)
            .into_iter()
            .filter(|m| m.status.is_live())
            .collect();
        let offers: HashSet<_> = live.iter().map(|m| m.offer_id).collect();
        let bids: HashSet<_> = live.iter().map(|m| m.bid_id).collect();
        assert_eq!(offers.len(), live.len());
        assert_eq!(bids.len(), live.len());
        assert_eq!(live.len(), 8);
        for m in &live {
            let offer = f.market.get_offer(m.offer_id).unwrap();
            assert_eq!(offer.reserved_by, Some(m.id));
        }
    }
}
