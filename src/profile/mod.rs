//! Classification profiles: on-disk skeletons, inheritance resolution, and
//! the dependency-ordered registry.

pub mod model;
pub mod registry;

pub use model::{
    EffectiveParams, EffectiveValidation, FewShotExample, ProfileSkeleton, ResolvedCondition,
    ResolvedConditional, ResolvedPolicy, ResolvedProfile,
};
pub use registry::{Quarantined, Registry, RegistryHandle};
