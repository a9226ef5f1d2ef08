pub mod cid;
pub mod config;
pub mod cursor;
pub mod deferred;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod opt_out;
pub mod processor;
pub mod queue;
pub mod sanitize;
pub mod storage;
pub mod validate;

pub use config::CoreConfig;
pub use error::{CoreError, CoreResult};
