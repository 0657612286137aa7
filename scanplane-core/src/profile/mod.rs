//! Vulnerability profiles: suppression rules applied to scan results before
//! they are counted or shown.

mod filter;
mod store;
mod traits;

pub use filter::VulnerabilityProfileFilter;
pub use store::ProfileStore;
pub use traits::{
    VulTrait, count_vul_traits, extract_vul_traits, gather_vul_traits, parse_published,
};
