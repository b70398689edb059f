//! REST surface: request-target parsing and response serialization.

pub mod parser;
pub mod response;

pub use parser::{parse_get_request, GetRequest, Protocol};
pub use response::{error_text, serialize_metadata, GetResponse, ResponseBody, GENERIC_ERROR};
