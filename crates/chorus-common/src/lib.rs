pub mod errors;
pub mod id;

pub use errors::{ChorusError, TurnDenied};
pub use id::{new_id, new_request_id};

pub type Result<T> = std::result::Result<T, ChorusError>;
