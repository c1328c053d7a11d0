mod handler;
mod model;

pub use handler::{delete_entry, get_entry, put_entry};
