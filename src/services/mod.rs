//! 服务层模块
//!
//! 校验、staging、发布闸门、备份恢复、生产切换、健康检查、回滚和备份校验

pub mod backup;
pub mod deploy;
pub mod executor;
pub mod gate;
pub mod health;
pub mod rollback;
pub mod staging;
pub mod validator;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testing;
