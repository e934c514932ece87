//! nodegrid-allocation: deciding which nodes a cluster gets.
//!
//! Everything here is a pure function of a [`NodeList`](nodegrid_state::NodeList)
//! snapshot and an [`AllocationParams`]: the [`NodePrioritizer`] collects and
//! orders candidates, the [`NodeAllocation`] accepts or retires them, and the
//! [`GroupAssigner`] distributes the result over groups. Persisting the
//! outcome is up to the caller.

pub mod allocation;
pub mod calculator;
pub mod candidate;
pub mod capacity;
pub mod error;
pub mod groups;
pub mod indices;
pub mod limits;
pub mod node_spec;
pub mod params;
pub mod policies;
pub mod prioritizer;

pub use allocation::{HostDeficit, NodeAllocation, Retirement};
pub use calculator::ResourcesCalculator;
pub use candidate::{CandidateKind, NodeCandidate};
pub use capacity::HostCapacity;
pub use error::{AllocationError, AllocationResult};
pub use groups::GroupAssigner;
pub use indices::{NodeIndices, next_host_indices};
pub use limits::NodeResourceLimits;
pub use node_spec::{CountSpec, NodeSpec, TypeSpec};
pub use params::AllocationParams;
pub use policies::CapacityPolicies;
pub use prioritizer::NodePrioritizer;
