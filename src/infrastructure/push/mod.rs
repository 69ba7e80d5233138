//! Platform push senders

mod apns;
mod fcm;

pub use apns::ApnsSender;
pub use fcm::FcmSender;
