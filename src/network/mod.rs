pub mod memory;
pub mod message;
pub mod node;
pub mod runtime;

pub use message::{Body, ErrorCode, Message};
pub use node::Node;
pub use runtime::Runtime;

/*
    Links are unreliable: a message may be dropped, duplicated or delivered
    out of order, and nothing here retries. Whatever has to survive that is
    the protocol's job, either by being idempotent (broadcast values are a
    set) or by repeating itself (counter anti-entropy).
*/
