//! Custom Resource Definitions used by the performance profile operator
//!
//! The PerformanceProfile CRD is owned by this operator and served in three
//! versions. The machine config and node tuning types belong to other
//! operators; only the fields this operator reads or writes are modelled.

mod machineconfig;
pub mod profile;
mod tuned;
mod types;

pub use machineconfig::{
    KubeletConfig, KubeletConfigSpec, MachineConfig, MachineConfigPool, MachineConfigPoolSpec,
    MachineConfigPoolStatus, MachineConfigSpec, PoolCondition, PoolConfiguration,
    MACHINE_CONFIG_GROUP,
};
pub use profile::{
    HugePage, HugePages, Numa, PerformanceProfileStatus, RealTimeKernel, TopologyPolicy,
};
pub use tuned::{Tuned, TunedProfile, TunedRecommend, TunedSpec};
pub use types::{set_condition, Condition, ConditionStatus};
