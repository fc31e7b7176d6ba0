//! Matchmaking integration.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `liaison` | Single-chain connect/disconnect sequencing per group session |

pub mod liaison;

pub use liaison::MatchmakingLiaison;
