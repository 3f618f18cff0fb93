//! 运行时状态模块
//!
//! 管理应用状态和部署记录存储

pub mod app_state;
pub mod record_store;

pub use app_state::AppState;
pub use record_store::{DeploymentRecordStore, JsonRecordStore, StoreError};
