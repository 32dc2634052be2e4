//! Wire schema shared by the coordinator and its workers.

pub mod dispatch {
    tonic::include_proto!("dispatch");
}

mod convert;

pub use convert::{request_from_wire, response_from_wire};
