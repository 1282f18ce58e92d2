//! membership-core: cluster membership and failure detection for agent hosts.
//!
//! This crate is sans-IO. It provides:
//! - Replicated membership and agent-hosting maps (Loro CRDTs)
//! - SWIM failure detection with awareness-scaled timeouts
//! - Gossip retransmission and member selection
//! - Join, anti-entropy and eviction control loops
//! - The cluster wire protocol
//!
//! The tokio runtime that drives all of this lives in the `agent-host` crate.

pub mod awareness;
pub mod config;
pub mod control;
pub mod detector;
pub mod endpoint;
pub mod gossip;
pub mod member_list;
pub mod protocol;
pub mod replica_id;
pub mod selector;
pub mod store;

pub use awareness::Awareness;
pub use config::{AgentHostOptions, ConfigError};
pub use control::{AutoDropper, AutoHealer, AutoSeeder, DropperAction, JoinStart, SeederEvent};
pub use detector::{DetectorConfig, DetectorEvent, FailureDetector, MemberStatus};
pub use endpoint::{EndpointError, HostEndpoint};
pub use gossip::GossipQueue;
pub use member_list::{
    AGENT_HOSTS_URI, HostMemberList, Landscape, MEMBERSHIP_URI, MemberListError, Members,
    MergeOutcome,
};
pub use protocol::{ClusterMessage, Envelope, Gossip, GossipPayload, ProtocolError};
pub use replica_id::ReplicaId;
pub use selector::{EndpointResolver, HostAddressResolver, MemberSelector, ResolveError};
pub use store::{MapOp, ReplicaStore, StoreError};
