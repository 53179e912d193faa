//! Domain-based egress policy.
//!
//! Raw allow/block specs go through the normalizer, then the compiler turns
//! them into one [`Policy`]. Every enforcement layer is rendered from that
//! single decision function, so the layers cannot drift apart.
//!
//! # Example
//!
//! ```
//! use egress_warden::policy::{Decision, PolicyBuilder};
//!
//! let policy = PolicyBuilder::new()
//!     .allow(["github.com"])
//!     .block(["gist.github.com"])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(policy.decide("api.github.com"), Decision::Allow);
//! assert_eq!(policy.decide("gist.github.com"), Decision::Deny);
//! assert_eq!(policy.decide("example.com"), Decision::Deny);
//! ```

pub mod compiler;
pub mod error;
pub mod normalize;
pub mod url;

pub use compiler::{Decision, Policy, PolicyBuilder, Reason, Verdict};
pub use error::PolicyError;
pub use normalize::{
    DomainRule, Disposition, RuleKind, normalize, parse_domain_file, split_specs,
};
pub use url::UrlPattern;
