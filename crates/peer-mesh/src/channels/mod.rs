//! Application messaging over data channels

mod messages;
mod router;

pub use messages::{AppMessage, DrawEvent, DrawKind, TextMessage, MAX_MESSAGE_SIZE};
pub use router::{DataChannelRouter, DeliveryPath, OutboundRoute};
