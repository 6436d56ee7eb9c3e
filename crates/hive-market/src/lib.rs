//! # hive-market
//!
//! Marketplace side of ComputeHive.
//!
//! This crate provides:
//!
//! - Offer and bid books with expiry
//! - A matching pass pairing each bid with the cheapest eligible offer
//! - Two-phase match confirmation that opens escrow and hands the
//!   resulting job to the scheduler's lifecycle

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod error;
pub mod orderbook;

pub use engine::{
    CONFIRMATION_TIMEOUT_REASON, ExpiredListings, Market, MarketConfig, MatchingReport,
    REJECTED_REASON,
};
pub use error::{MarketError, Result};
pub use orderbook::{Quote, bid_order, feasible_start, quote, rank_offers};
