//! # Entity Security
//!
//! A distributed authorization engine for tree-structured content.
//! Entities form a tree; access control entries attached to entities are
//! inherited down the tree unless inheritance is broken. Every change is an
//! activity that is stored, executed in dependency order on the local node
//! and broadcast so that every node converges on the same state.
//!
//! ## Core Components
//!
//! * `model` - Ids, permission bits, entries and entity rows
//! * `cache` - In-memory entity tree, ACLs and group memberships
//! * `evaluator` - Permission evaluation and relation queries
//! * `activities` - The change activities and their effects
//! * `queue` - Dependency ordered execution with completion tracking
//! * `data` - Persistence behind `SecurityDataProvider` (memory and sled)
//! * `messaging` - Activity distribution between nodes
//! * `acl_editor` - Batched permission editing
//! * `system` - The node handle tying everything together

pub mod acl_editor;
pub mod activities;
pub mod cache;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod queue;
pub mod system;

pub use acl_editor::AclEditor;
pub use activities::{ActivityKind, SecurityActivity};
pub use cache::{CacheState, MissingEntityHandler, SecurityCache};
pub use config::SecurityConfig;
pub use data::{MemoryDataProvider, SecurityDataProvider, SledDataProvider};
pub use error::{SecurityError, SecurityResult};
pub use evaluator::{PermissionEvaluator, SpecialGroups};
pub use messaging::{
    InProcessMessageBus, InProcessMessageProvider, Message, MessageProvider, NullMessageProvider,
};
pub use model::{
    AccessControlEntry, AccessControlList, AceInfo, ActivityId, EntityId, EntryType,
    EntryTypeSet, IdentityId, Membership, PermissionBits, PermissionLevel, PermissionType,
    PermissionValue, SecurityEntity,
};
pub use queue::{CompletionState, HealthReport, QueueSettings, QueueSnapshot};
pub use system::SecuritySystem;
