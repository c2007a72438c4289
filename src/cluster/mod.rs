mod discovery;
mod heartbeat;
mod members;
mod ring;

pub use discovery::{local_ip, multicast_interface, multicast_listener, multicast_sender};
pub use heartbeat::Heartbeat;
pub use members::MemberSet;
pub use ring::Ring;
