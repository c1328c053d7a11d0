mod handler;
mod model;

pub use handler::{
    flush_cache, health, metrics_reports, metrics_snapshot, peek_rate_limit, reset_rate_limit,
};
