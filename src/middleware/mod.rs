mod error_handler;
pub mod rate_limit;
pub mod throttle;

pub use error_handler::log_errors;
pub use rate_limit::{apply_rate_limit_headers, client_ip, rate_limit, route_of};
pub use throttle::{
    Denial, DenialBody, RateLimitHeaders, Rejection, Throttle, ThrottleMiddleware, Throttled,
    ThrottledOperation, validate_identifier,
};
