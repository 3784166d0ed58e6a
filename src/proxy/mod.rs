pub mod context;
pub mod endpoints;
pub mod handler;
pub mod headers;

pub use context::BoxBody;
pub use handler::handle_request;
