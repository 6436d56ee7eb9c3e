//! Error types for hive-market.

use hive_proto::{
    BidId, BidStatus, CollaboratorError, ErrorKind, MatchId, MatchStatus, OfferId, OfferStatus,
    ValidationError,
};
use hive_scheduler::SchedulerError;
use thiserror::Error;

/// Result type for marketplace operations.
pub type Result<T> = std::result::Result<T, MarketError>;

/// Errors that can occur in marketplace operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketError {
    /// Offer or bid failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Offer not found.
    #[error("offer not found: {0}")]
    UnknownOffer(OfferId),

    /// Bid not found.
    #[error("bid not found: {0}")]
    UnknownBid(BidId),

    /// Match not found.
    #[error("match not found: {0}")]
    UnknownMatch(MatchId),

    /// Offer is no longer Active.
    #[error("offer {offer_id} is {status}")]
    OfferUnavailable {
        /// Offer.
        offer_id: OfferId,
        /// Status at commit time.
        status: OfferStatus,
    },

    /// Bid is no longer Pending.
    #[error("bid {bid_id} is {status}")]
    BidUnavailable {
        /// Bid.
        bid_id: BidId,
        /// Status at commit time.
        status: BidStatus,
    },

    /// Match can no longer be confirmed or rejected.
    #[error("match {match_id} is already {status}")]
    MatchClosed {
        /// Match.
        match_id: MatchId,
        /// Final status.
        status: MatchStatus,
    },

    /// Concurrent writers kept winning.
    #[error("concurrent update conflict on {0}")]
    Conflict(String),

    /// Escrow for a confirmed match could not be opened.
    #[error("escrow rejected: {0}")]
    Escrow(CollaboratorError),

    /// The synthesized job could not be admitted.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl MarketError {
    /// Map onto the shared taxonomy.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::UnknownOffer(_) | Self::UnknownBid(_) | Self::UnknownMatch(_) => {
                ErrorKind::UnknownEntity
            }
            Self::OfferUnavailable { .. }
            | Self::BidUnavailable { .. }
            | Self::MatchClosed { .. }
            | Self::Conflict(_) => ErrorKind::Conflict,
            Self::Escrow(e) => e.kind(),
            Self::Scheduler(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_closed_display() {
        let match_id = MatchId::new();
        let err = MarketError::MatchClosed {
            match_id,
            status: MatchStatus::Rejected,
        };
        assert_eq!(err.to_string(), format!("match {match_id} is already rejected"));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(MarketError::UnknownBid(BidId::new()).kind(), ErrorKind::UnknownEntity);
        assert_eq!(
            MarketError::Escrow(CollaboratorError::Rejected("insufficient funds".into())).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            MarketError::Validation(ValidationError::new("window", "start must be before end"))
                .kind(),
            ErrorKind::Validation
        );
    }
}
