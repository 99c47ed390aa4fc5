//! soma-guidepost: admission gate in front of the tree keepers.
//!
//! Every tree-mutating request passes through [`GuidePost::admit`], which
//! checks the target repository's keeper, writes exactly one job row and
//! forwards the job. Rejected requests leave no trace in the job ledger.

pub mod error;
pub mod guidepost;

pub use error::{GuidePostError, GuidePostResult};
pub use guidepost::{Admission, AdmissionRequest, GuidePost};
