//! soma-treekeeper: the per-repository actors that own tree mutation.
//!
//! Each repository gets one [`TreeKeeper`]: it loads the repository's
//! inventory and checks at startup (nested groups ordered by
//! [`order_groups`]), then executes admitted jobs one at a time. After every
//! job the repository's check instances are recomputed and their payloads
//! handed to the lifecycle computation step.
//!
//! The [`Supervisor`] owns the registry of running keepers.

pub mod actions;
pub mod error;
pub mod inheritance;
pub mod keeper;
pub mod ordering;
pub mod supervisor;
pub mod tree;

pub use actions::{ACTIONS, JobAction};
pub use error::{KeeperError, KeeperResult};
pub use inheritance::RecomputeReport;
pub use keeper::{
    JobReply, JobReport, KeeperMessage, KeeperStatus, LoadSummary, TreeKeeper, TreeKeeperHandle,
    load_repository,
};
pub use ordering::{GroupAnomaly, GroupOrder, order_groups};
pub use supervisor::Supervisor;
