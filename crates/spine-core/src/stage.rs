//! Stage names and ranks
//!
//! A stage is a named point in a pipeline's progression. The core knows the
//! standard four; domains may define additional stages, which rank above
//! the built-ins only if they say so via an explicit rank.

/// Standard stage names
pub const RAW: &str = "RAW";
pub const NORMALIZED: &str = "NORMALIZED";
pub const AGGREGATED: &str = "AGGREGATED";
pub const COMPUTED: &str = "COMPUTED";

/// Ordering rank for a stage name; unknown (domain-defined) stages rank 0
pub fn stage_rank(stage: &str) -> i64 {
    match stage {
        RAW => 10,
        NORMALIZED => 20,
        AGGREGATED => 30,
        COMPUTED => 40,
        _ => 0,
    }
}
