#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod charge;
pub mod group;
pub mod resolver;

pub use charge::{RateCard, compute_charge, estimate_reservation};
pub use group::GroupRatios;
pub use resolver::{ModelPrice, PriceTier, PricingResolver, PricingSource, ResolvedPrice};
