//! # skiff-messages
//!
//! The wire protocol shared by the master, the node agent, and
//! executors, together with the in-process message bus that carries it.
//!
//! Every participant owns a named [`Endpoint`] with a mailbox; messages
//! from one sender to one receiver are delivered in send order. An
//! endpoint may [`link`](MessageBus::link) against a peer to be told
//! (via [`Message::Exited`]) when that peer goes away, which is how the
//! agent notices executor and master loss.
//!
//! The message set itself is a single tagged enum ([`Message`]); each
//! receiver maps the kinds it understands to handlers and counts the
//! rest as invalid traffic.

mod bus;
mod messages;
mod types;

pub use bus::{Endpoint, Envelope, Mailbox, MessageBus};
pub use messages::Message;
pub use types::{
    Attributes, CommandInfo, ExecutorInfo, FrameworkInfo, Offer, ResourceStatistics, SlaveInfo,
    StatusUpdate, Task, TaskInfo, TaskState, TaskStatus,
};
