//! 领域模型模块
//!
//! 纯数据结构和纯函数，不涉及 I/O

pub mod deploy;
pub mod descriptor;
pub mod validation;

pub use deploy::{
    DeployStage, DeploymentState, DeploymentStatus, StageStatus, Tenant, TenantDeploymentConfig,
    TenantId, TenantLayout,
};
pub use descriptor::DescriptorGenerator;
pub use validation::{ConfigInput, ConfigValidator, ValidConfig, ValidationError};
