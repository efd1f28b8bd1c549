//! Parent/children job trees.
//!
//! A flow parent is inserted in the `waiting-children` state and becomes
//! claimable once every direct child has settled. Its handler reads the
//! children's results through [`ChildrenValues`].

pub mod children;
pub mod producer;

pub use crate::queue::{ChildFailurePolicy, ChildOutcome};
pub use children::ChildrenValues;
pub use producer::{FlowHandle, FlowNode, FlowProducer, MAX_FLOW_DEPTH};
