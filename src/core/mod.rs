pub mod audit;
pub mod context;
pub mod directive;
pub mod error;
pub mod request_info;
pub mod routing;

pub use context::{RequestContext, UserInfo};
pub use error::{GatewayError, GatewayResult};
pub use request_info::{RequestInfo, RequestInfoResolver};
